// Live invocation routing: resolve the owner, authorize, dispatch to the
// function's container, normalize the result and record metrics. Every
// failure mode is folded into a `FunctionExecutionResult` so callers never
// see a raw error from this layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use deployr_common::execution::normalize_body;
use deployr_common::{
    image_tag, ContainerRef, ContainerRuntime, DeployrError, Function, FunctionExecutionResult,
    FunctionMetrics, FunctionRepository, MetricsRepository, Result, UserRepository,
};

pub mod security;

pub use security::SecurityService;

/// Header carrying the API key for private functions.
pub const FUNCTION_KEY_HEADER: &str = "x-function-key";

pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct InvokeCommand {
    pub owner_username: String,
    pub app_name: String,
    pub function_name: String,
    pub http_method: String,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: Option<Value>,
    pub api_key: Option<String>,
}

pub struct InvocationService {
    functions: Arc<dyn FunctionRepository>,
    users: Arc<dyn UserRepository>,
    metrics: Arc<dyn MetricsRepository>,
    runtime: Arc<dyn ContainerRuntime>,
    dispatch_timeout: Duration,
}

impl InvocationService {
    pub fn new(
        functions: Arc<dyn FunctionRepository>,
        users: Arc<dyn UserRepository>,
        metrics: Arc<dyn MetricsRepository>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            functions,
            users,
            metrics,
            runtime,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    pub fn with_dispatch_timeout(mut self, dispatch_timeout: Duration) -> Self {
        self.dispatch_timeout = dispatch_timeout;
        self
    }

    /// Route one request to its function. Rejections and failures come
    /// back as results with the appropriate status, never as errors.
    #[instrument(skip(self, command), fields(app = %command.app_name, function = %command.function_name))]
    pub async fn invoke(&self, command: InvokeCommand) -> FunctionExecutionResult {
        match self.try_invoke(&command).await {
            Ok(result) => result,
            Err(e) => {
                let status = e.status_code();
                if status >= 500 {
                    error!(error = %e, "Invocation failed");
                    FunctionExecutionResult {
                        status_code: 500,
                        headers: HashMap::new(),
                        body: json!({ "error": e.to_string(), "details": e.code() }),
                        success: false,
                        error_message: Some(e.to_string()),
                    }
                } else {
                    FunctionExecutionResult::error_with_status(status, e.to_string())
                }
            }
        }
    }

    async fn try_invoke(&self, command: &InvokeCommand) -> Result<FunctionExecutionResult> {
        let owner = self
            .users
            .find_by_username(&command.owner_username)
            .await?
            .ok_or_else(|| DeployrError::not_found("User", &command.owner_username))?;

        let function = self
            .functions
            .find_by_app_name_and_name_and_user_id(
                &command.app_name,
                &command.function_name,
                &owner.id,
            )
            .await?
            .ok_or_else(|| {
                DeployrError::not_found(
                    "Function",
                    format!(
                        "{}/{} for user {}",
                        command.app_name, command.function_name, command.owner_username
                    ),
                )
            })?;

        let method = command.http_method.to_uppercase();
        if !function.methods.is_empty() && !function.methods.iter().any(|m| m == &method) {
            return Err(DeployrError::validation(
                "method",
                format!(
                    "Function {} does not support HTTP method: {}. Supported methods: {}",
                    function.name,
                    method,
                    function.methods.join(", ")
                ),
            ));
        }

        self.authorize(&function, command)?;

        let event = self.build_event(&function, command, &owner.id, &method);
        let container = ContainerRef::new(
            image_tag(&owner.id, &function.app_name, &function.name, function.primary_method()),
            function.name.clone(),
        );
        container.validate()?;

        // Wall-clock time is measured around the dispatch only.
        let started = Instant::now();
        let dispatch = timeout(self.dispatch_timeout, self.runtime.execute(&container, &event)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut result = match dispatch {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(error = %e, image = %container.image_tag, "Container execution failed");
                FunctionExecutionResult {
                    status_code: 500,
                    headers: HashMap::new(),
                    body: json!({
                        "error": format!(
                            "Error executing function {}/{}",
                            function.app_name, function.name
                        ),
                        "details": e.to_string(),
                    }),
                    success: false,
                    error_message: Some(e.to_string()),
                }
            }
            Err(_) => {
                error!(
                    timeout_ms = self.dispatch_timeout.as_millis() as u64,
                    image = %container.image_tag,
                    "Container dispatch timed out"
                );
                FunctionExecutionResult::error(format!(
                    "Function {}/{} timed out after {}ms",
                    function.app_name,
                    function.name,
                    self.dispatch_timeout.as_millis()
                ))
            }
        };
        result.body = normalize_body(result.body);

        self.record_metrics(&function, elapsed_ms, result.success).await;

        info!(
            status = result.status_code,
            success = result.success,
            elapsed_ms,
            "Invocation complete"
        );
        Ok(result)
    }

    fn authorize(&self, function: &Function, command: &InvokeCommand) -> Result<()> {
        if !function.is_private {
            return Ok(());
        }
        let Some(provided) = command.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            return Err(DeployrError::Unauthorized(
                "Access denied: This function is private and requires an API key".into(),
            ));
        };
        if function.api_key.as_deref() != Some(provided) {
            return Err(DeployrError::Unauthorized(
                "Access denied: Invalid API key".into(),
            ));
        }
        Ok(())
    }

    /// Language and framework come from the stored record, never from the
    /// source application, so invocation behavior stays stable after the
    /// source changes.
    fn build_event(
        &self,
        function: &Function,
        command: &InvokeCommand,
        owner_id: &str,
        method: &str,
    ) -> Value {
        json!({
            "method": method,
            "path": function.path,
            "headers": command.headers,
            "queryParams": command.query_params,
            "body": command.body,
            "userId": owner_id,
            "language": function.language,
            "framework": function.framework,
        })
    }

    /// Metrics are recorded for every dispatch, success or failure. A
    /// metrics store failure must never fail the invocation.
    async fn record_metrics(&self, function: &Function, elapsed_ms: u64, successful: bool) {
        let existing = match self.metrics.find_by_function_id(&function.id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, function = %function.name, "Metrics lookup failed");
                None
            }
        };
        let mut metrics = existing.unwrap_or_else(|| FunctionMetrics::empty(function));
        metrics.record_execution(elapsed_ms, successful);
        if let Err(e) = self.metrics.save(metrics).await {
            warn!(error = %e, function = %function.name, "Metrics save failed");
        }
    }
}
