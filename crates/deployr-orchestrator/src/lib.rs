// Deployment orchestration: one request in, N independently deployed
// functions out. Each function's pipeline runs to completion or failure on
// its own; a sibling failure never aborts the batch.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use deployr_analyzer::AnalyzerRegistry;
use deployr_common::{
    image_tag, AppMetadataRepository, ContainerRuntime, DeployedFunctionInfo, DeploymentOutcome,
    DeployrError, Function, FunctionBuildContext, FunctionMetrics, FunctionRepository, Language,
    MetricsRepository, Result, UserRepository,
};
use deployr_router::SecurityService;
use deployr_synthesizer::synthesizer_for;

pub mod counter;

pub use counter::{AtomicNameCounter, NameCounter};

/// How a deployment request arrived. Direct deployments are incremental
/// and additive; bundle deployments are authoritative replacements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployKind {
    Direct,
    Bundle,
}

#[derive(Debug, Clone)]
pub struct DeployCommand {
    pub app_path: PathBuf,
    pub app_name: Option<String>,
    pub user_id: String,
    pub environment_variables: HashMap<String, String>,
    pub private: bool,
    pub kind: DeployKind,
}

enum FunctionOutcome {
    Deployed(DeployedFunctionInfo),
    Skipped(&'static str),
}

type LeaseKey = (String, String, String);

pub struct DeploymentService {
    functions: Arc<dyn FunctionRepository>,
    metrics: Arc<dyn MetricsRepository>,
    users: Arc<dyn UserRepository>,
    metadata: Arc<dyn AppMetadataRepository>,
    runtime: Arc<dyn ContainerRuntime>,
    analyzers: Arc<AnalyzerRegistry>,
    security: Arc<SecurityService>,
    counter: Arc<dyn NameCounter>,
    build_root: PathBuf,
    // Serializes conflict-check, persist, build and containerize for one
    // logical function. Never held across unrelated functions.
    leases: DashMap<LeaseKey, Arc<Mutex<()>>>,
}

impl DeploymentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        functions: Arc<dyn FunctionRepository>,
        metrics: Arc<dyn MetricsRepository>,
        users: Arc<dyn UserRepository>,
        metadata: Arc<dyn AppMetadataRepository>,
        runtime: Arc<dyn ContainerRuntime>,
        analyzers: Arc<AnalyzerRegistry>,
        security: Arc<SecurityService>,
        counter: Arc<dyn NameCounter>,
        build_root: PathBuf,
    ) -> Self {
        Self {
            functions,
            metrics,
            users,
            metadata,
            runtime,
            analyzers,
            security,
            counter,
            build_root,
            leases: DashMap::new(),
        }
    }

    #[instrument(skip(self, command), fields(user = %command.user_id, kind = ?command.kind))]
    pub async fn deploy(&self, command: DeployCommand) -> Result<DeploymentOutcome> {
        if command.app_path.as_os_str().is_empty() {
            return Err(DeployrError::validation(
                "app_path",
                "Application path cannot be empty",
            ));
        }
        if !command.app_path.is_dir() {
            return Err(DeployrError::not_found(
                "Application directory",
                command.app_path.display().to_string(),
            ));
        }
        if command.user_id.trim().is_empty() {
            return Err(DeployrError::validation("user_id", "User id cannot be empty"));
        }

        let analyzer = self.analyzers.analyzer_for(&command.app_path)?;
        let app_name = self.resolve_app_name(&command, analyzer.language());
        info!(%app_name, path = %command.app_path.display(), "Deploying application");

        let app_build_dir = self.build_root.join(&command.user_id).join(&app_name);
        let is_existing_app = app_build_dir.exists();
        fs::create_dir_all(&app_build_dir).map_err(|e| {
            DeployrError::Deployment(format!(
                "Failed to create app build directory {}: {e}",
                app_build_dir.display()
            ))
        })?;

        if is_existing_app {
            info!(%app_name, "Adding function(s) to existing application");
        } else if let Err(e) = self
            .metadata
            .create_metadata(
                &app_name,
                &command.app_path.display().to_string(),
                &app_build_dir.display().to_string(),
            )
            .await
        {
            // Metadata bookkeeping never fails a deployment.
            warn!(error = %e, %app_name, "Could not create application metadata");
        }

        let analysis = analyzer.analyze(&command.app_path)?;
        info!(routes = analysis.routes.len(), "Analysis complete");

        let functions = analyzer.extract_functions(&analysis)?;
        if functions.is_empty() {
            return Err(DeployrError::BusinessRule(
                "No deployable functions found in application".into(),
            ));
        }
        info!(count = functions.len(), "Extracted functions");

        let mut deployed = Vec::new();
        let mut failed = Vec::new();
        let mut details = Vec::new();

        for function in functions {
            let name = function.name.clone();
            match self
                .deploy_function(function, &command, &app_name, &app_build_dir, is_existing_app)
                .await
            {
                Ok(FunctionOutcome::Deployed(info)) => {
                    info!(function = %name, "Successfully deployed function");
                    deployed.push(name);
                    details.push(info);
                }
                Ok(FunctionOutcome::Skipped(reason)) => {
                    warn!(function = %name, reason, "Skipped function");
                    failed.push(format!("{name} ({reason})"));
                }
                Err(e) => {
                    error!(function = %name, error = %e, "Error deploying function");
                    failed.push(name);
                }
            }
        }

        DeploymentOutcome::aggregate(app_name, deployed, failed, details)
    }

    async fn deploy_function(
        &self,
        mut function: Function,
        command: &DeployCommand,
        app_name: &str,
        app_build_dir: &std::path::Path,
        is_existing_app: bool,
    ) -> Result<FunctionOutcome> {
        if function.methods.is_empty() {
            function.methods = vec!["GET".to_string()];
        }
        function.app_name = app_name.to_string();
        function.user_id = command.user_id.clone();
        function
            .env_vars
            .extend(command.environment_variables.keys().cloned());
        if function.id.is_empty() {
            function.id = Uuid::new_v4().to_string();
        }

        let lease = self
            .leases
            .entry((
                command.user_id.clone(),
                app_name.to_string(),
                function.name.clone(),
            ))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lease.lock().await;

        if is_existing_app {
            let existing = self
                .functions
                .find_by_app_name_and_name_and_user_id(app_name, &function.name, &command.user_id)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, function = %function.name, "Conflict check failed");
                    None
                });
            if let Some(existing) = existing {
                match command.kind {
                    DeployKind::Direct => {
                        // Direct deploys are additive; an existing function
                        // is a conflict, not an override.
                        return Ok(FunctionOutcome::Skipped("already exists"));
                    }
                    DeployKind::Bundle => {
                        info!(function = %existing.name, "Overriding existing function");
                        if let Err(e) = self
                            .undeploy(&existing.name, app_name, &command.user_id)
                            .await
                        {
                            warn!(error = %e, function = %existing.name, "Undeploy before redeploy failed, continuing");
                        }
                    }
                }
            }
        }

        function.validate()?;
        let mut saved = self.functions.save(function).await?;

        let empty_metrics = FunctionMetrics::empty(&saved);
        if let Err(e) = self.metrics.save(empty_metrics).await {
            warn!(error = %e, function = %saved.name, "Could not initialize metrics");
        }

        if command.private {
            match self
                .security
                .toggle(&saved.id, &command.user_id, true)
                .await
            {
                Ok(secured) => saved = secured,
                Err(e) => {
                    // Deployment continues; the function stays public.
                    error!(error = %e, function = %saved.name, "Failed to make function private");
                }
            }
        }

        let function_build_dir = app_build_dir.join(format!(
            "{}-{}",
            saved.name,
            saved.primary_method().to_lowercase()
        ));
        let context = FunctionBuildContext {
            function: saved.clone(),
            source_app_path: command.app_path.clone(),
            build_output_path: function_build_dir.clone(),
            language: saved.language,
            framework: saved.framework,
        };

        let synthesizer = synthesizer_for(saved.language, saved.framework)?;
        let build_context = context.clone();
        tokio::task::spawn_blocking(move || synthesizer.create_build_unit(&build_context))
            .await
            .map_err(|e| DeployrError::Deployment(format!("Synthesis task panicked: {e}")))??;

        let tag = image_tag(
            &command.user_id,
            app_name,
            &saved.name,
            saved.primary_method(),
        );
        self.runtime
            .build_image(&tag, &function_build_dir, &command.environment_variables)
            .await?;

        if let Err(e) = self.metadata.add_deployed_function(app_name, &saved.name).await {
            warn!(error = %e, function = %saved.name, "Could not update application metadata");
        }

        let username = self.username_for(&command.user_id).await;
        Ok(FunctionOutcome::Deployed(DeployedFunctionInfo {
            function_name: saved.name.clone(),
            app_name: app_name.to_string(),
            function_url: format!("/api/v1/{username}/functions/{app_name}/{}", saved.name),
            is_private: saved.is_private,
            api_key: saved.api_key.clone(),
            supported_methods: saved.methods.clone(),
        }))
    }

    /// Remove one deployed function: container image, build directory,
    /// metadata entry and repository row.
    #[instrument(skip(self))]
    pub async fn undeploy(
        &self,
        function_name: &str,
        app_name: &str,
        user_id: &str,
    ) -> Result<bool> {
        let function = self
            .functions
            .find_by_app_name_and_name_and_user_id(app_name, function_name, user_id)
            .await?
            .ok_or_else(|| {
                DeployrError::not_found(
                    "Function",
                    format!("{app_name}/{function_name} for user {user_id}"),
                )
            })?;

        let tag = image_tag(user_id, app_name, &function.name, function.primary_method());
        match self.runtime.cleanup_image(&tag).await {
            Ok(true) => info!(%tag, "Removed container image"),
            Ok(false) => warn!(%tag, "Container image cleanup reported nothing removed"),
            Err(e) => {
                return Err(DeployrError::Deployment(format!(
                    "Error cleaning up container image {tag}: {e}"
                )))
            }
        }

        let function_build_dir = self.build_root.join(user_id).join(app_name).join(format!(
            "{}-{}",
            function.name,
            function.primary_method().to_lowercase()
        ));
        if function_build_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&function_build_dir) {
                warn!(error = %e, dir = %function_build_dir.display(), "Could not delete build directory");
            }
        }

        if let Err(e) = self
            .metadata
            .remove_deployed_function(app_name, &function.name)
            .await
        {
            warn!(error = %e, "Could not update application metadata");
        }

        self.functions.delete(&function.id).await
    }

    fn resolve_app_name(&self, command: &DeployCommand, language: Language) -> String {
        if let Some(name) = command.app_name.as_deref() {
            if !name.trim().is_empty() {
                return sanitize_app_name(name);
            }
        }
        let derived = app_name_from_path(&command.app_path);
        if derived.is_empty() {
            format!("{language}_app_{}", self.counter.next(language))
        } else {
            derived
        }
    }

    async fn username_for(&self, user_id: &str) -> String {
        match self.users.find_by_id(user_id).await {
            Ok(Some(user)) => user.username,
            Ok(None) => "unknown-user".to_string(),
            Err(e) => {
                warn!(error = %e, %user_id, "Username lookup failed");
                "unknown-user".to_string()
            }
        }
    }
}

/// Keep `[A-Za-z0-9_-]`, force an alphanumeric first character and cap the
/// length at 50 (image and container name limits).
pub fn sanitize_app_name(name: &str) -> String {
    let mut sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if let Some(first) = sanitized.chars().next() {
        if !first.is_ascii_alphanumeric() {
            sanitized = format!("app_{sanitized}");
        }
    }
    sanitized.truncate(50);
    sanitized
}

/// Derive an application name from the last path segment.
pub fn app_name_from_path(path: &std::path::Path) -> String {
    let Some(segment) = path.file_name().and_then(|s| s.to_str()) else {
        return String::new();
    };
    let derived: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if derived.chars().all(|c| c == '_') {
        String::new()
    } else {
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deployr_common::memory::{
        InMemoryAppMetadataRepository, InMemoryFunctionRepository, InMemoryMetricsRepository,
        InMemoryUserRepository,
    };
    use deployr_common::{ContainerRef, FunctionExecutionResult, User};
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct MockRuntime {
        built: StdMutex<Vec<String>>,
        cleaned: StdMutex<Vec<String>>,
        fail_tags_containing: HashSet<String>,
    }

    impl MockRuntime {
        fn new() -> Arc<Self> {
            Self::failing_for([])
        }

        fn failing_for<const N: usize>(names: [&str; N]) -> Arc<Self> {
            Arc::new(Self {
                built: StdMutex::new(Vec::new()),
                cleaned: StdMutex::new(Vec::new()),
                fail_tags_containing: names.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn build_image(
            &self,
            tag: &str,
            _build_path: &std::path::Path,
            _env: &HashMap<String, String>,
        ) -> deployr_common::Result<ContainerRef> {
            if self.fail_tags_containing.iter().any(|n| tag.contains(n)) {
                return Err(DeployrError::Container(format!("build failed for {tag}")));
            }
            self.built.lock().unwrap().push(tag.to_string());
            Ok(ContainerRef::new(tag, "mock"))
        }

        async fn execute(
            &self,
            _container: &ContainerRef,
            _event: &Value,
        ) -> deployr_common::Result<FunctionExecutionResult> {
            Ok(FunctionExecutionResult::error("not used in these tests"))
        }

        async fn cleanup_image(&self, tag: &str) -> deployr_common::Result<bool> {
            self.cleaned.lock().unwrap().push(tag.to_string());
            Ok(true)
        }
    }

    struct Fixture {
        functions: Arc<InMemoryFunctionRepository>,
        metrics: Arc<InMemoryMetricsRepository>,
        runtime: Arc<MockRuntime>,
        service: DeploymentService,
        _build_root: tempfile::TempDir,
    }

    async fn fixture(runtime: Arc<MockRuntime>) -> Fixture {
        let functions = Arc::new(InMemoryFunctionRepository::new());
        let metrics = Arc::new(InMemoryMetricsRepository::new());
        let users = Arc::new(InMemoryUserRepository::new());
        users
            .save(User {
                id: "alice-id".into(),
                username: "alice".into(),
            })
            .await
            .unwrap();

        let build_root = tempfile::tempdir().unwrap();
        let service = DeploymentService::new(
            functions.clone(),
            metrics.clone(),
            users,
            Arc::new(InMemoryAppMetadataRepository::new()),
            runtime.clone(),
            Arc::new(AnalyzerRegistry::with_defaults()),
            Arc::new(SecurityService::new(functions.clone())),
            Arc::new(AtomicNameCounter::new()),
            build_root.path().to_path_buf(),
        );
        Fixture {
            functions,
            metrics,
            runtime,
            service,
            _build_root: build_root,
        }
    }

    const THREE_ROUTE_APP: &str = r#"from flask import Flask, jsonify

app = Flask(__name__)

def load_books():
    return ['dune']

@app.route('/books')
def list_books():
    return jsonify(load_books())

@app.route('/books', methods=['POST'])
def create_book():
    return jsonify({'created': True})

@app.route('/health')
def health():
    return jsonify({'ok': True})
"#;

    fn write_app(source: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.py"), source).unwrap();
        dir
    }

    fn command(app_dir: &tempfile::TempDir, kind: DeployKind) -> DeployCommand {
        DeployCommand {
            app_path: app_dir.path().to_path_buf(),
            app_name: Some("bookshop".into()),
            user_id: "alice-id".into(),
            environment_variables: HashMap::new(),
            private: false,
            kind,
        }
    }

    #[tokio::test]
    async fn full_deployment_builds_every_function() {
        let fx = fixture(MockRuntime::new()).await;
        let app = write_app(THREE_ROUTE_APP);

        let outcome = fx.service.deploy(command(&app, DeployKind::Bundle)).await.unwrap();
        assert_eq!(outcome.status, deployr_common::DeploymentStatus::Success);
        assert_eq!(outcome.deployed_functions.len(), 3);
        assert!(outcome.failed_functions.is_empty());

        let built = fx.runtime.built.lock().unwrap().clone();
        assert_eq!(built.len(), 3);
        assert!(built.iter().all(|t| t.starts_with("deployr-alice-id-bookshop-")));

        // Metrics rows are created empty at deploy time.
        let stored = fx.functions.find_by_user_id("alice-id").await.unwrap();
        for function in &stored {
            let metrics = fx
                .metrics
                .find_by_function_id(&function.id)
                .await
                .unwrap()
                .expect("metrics row");
            assert_eq!(metrics.invocation_count, 0);
        }

        let info = outcome
            .details
            .iter()
            .find(|d| d.function_name == "list_books")
            .unwrap();
        assert_eq!(info.function_url, "/api/v1/alice/functions/bookshop/list_books");
    }

    #[tokio::test]
    async fn one_failing_function_yields_a_partial_outcome() {
        let fx = fixture(MockRuntime::failing_for(["create_book"])).await;
        let app = write_app(THREE_ROUTE_APP);

        let outcome = fx.service.deploy(command(&app, DeployKind::Bundle)).await.unwrap();
        assert_eq!(outcome.status, deployr_common::DeploymentStatus::Partial);
        assert_eq!(outcome.deployed_functions.len(), 2);
        assert_eq!(outcome.failed_functions, vec!["create_book"]);
    }

    #[tokio::test]
    async fn all_functions_failing_is_a_terminal_error() {
        let fx = fixture(MockRuntime::failing_for(["list_books", "create_book", "health"])).await;
        let app = write_app(THREE_ROUTE_APP);

        let result = fx.service.deploy(command(&app, DeployKind::Bundle)).await;
        assert!(matches!(result, Err(DeployrError::Deployment(_))));
    }

    #[tokio::test]
    async fn direct_redeploy_skips_existing_functions() {
        let fx = fixture(MockRuntime::new()).await;
        let app = write_app(
            "from flask import Flask, jsonify\n\napp = Flask(__name__)\n\n@app.route('/books')\ndef list_books():\n    return jsonify([])\n",
        );
        fx.service
            .deploy(command(&app, DeployKind::Direct))
            .await
            .unwrap();

        // The app grows a second route before the next direct deploy.
        fs::write(
            app.path().join("app.py"),
            "from flask import Flask, jsonify\n\napp = Flask(__name__)\n\n@app.route('/books')\ndef list_books():\n    return jsonify([])\n\n@app.route('/authors')\ndef list_authors():\n    return jsonify([])\n",
        )
        .unwrap();

        let outcome = fx
            .service
            .deploy(command(&app, DeployKind::Direct))
            .await
            .unwrap();
        assert_eq!(outcome.status, deployr_common::DeploymentStatus::Partial);
        assert_eq!(outcome.deployed_functions, vec!["list_authors"]);
        assert_eq!(outcome.failed_functions, vec!["list_books (already exists)"]);
    }

    #[tokio::test]
    async fn bundle_redeploy_undeploys_then_overwrites() {
        let fx = fixture(MockRuntime::new()).await;
        let app = write_app(THREE_ROUTE_APP);

        fx.service.deploy(command(&app, DeployKind::Bundle)).await.unwrap();
        let outcome = fx.service.deploy(command(&app, DeployKind::Bundle)).await.unwrap();

        assert_eq!(outcome.status, deployr_common::DeploymentStatus::Success);
        assert_eq!(outcome.deployed_functions.len(), 3);

        let cleaned = fx.runtime.cleaned.lock().unwrap().clone();
        assert_eq!(cleaned.len(), 3, "old images removed before redeploy");

        // Still exactly one row per function.
        let stored = fx.functions.find_by_user_id("alice-id").await.unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn private_deployments_come_up_with_api_keys() {
        let fx = fixture(MockRuntime::new()).await;
        let app = write_app(THREE_ROUTE_APP);
        let mut cmd = command(&app, DeployKind::Bundle);
        cmd.private = true;

        let outcome = fx.service.deploy(cmd).await.unwrap();
        assert!(outcome.details.iter().all(|d| d.is_private));
        assert!(outcome.details.iter().all(|d| d.api_key.is_some()));

        let stored = fx.functions.find_by_user_id("alice-id").await.unwrap();
        assert!(stored.iter().all(|f| f.is_private && f.api_key.is_some()));
    }

    #[tokio::test]
    async fn unresolvable_service_call_deploys_with_a_stub() {
        let fx = fixture(MockRuntime::new()).await;
        let app = write_app(
            "from flask import Flask, jsonify\nfrom billing import PaymentService\n\napp = Flask(__name__)\npayments = PaymentService()\n\n@app.route('/charge')\ndef charge_card():\n    return jsonify(payments.charge(10))\n\n@app.route('/health')\ndef health():\n    return jsonify({'ok': True})\n",
        );

        let outcome = fx.service.deploy(command(&app, DeployKind::Bundle)).await.unwrap();
        assert_eq!(outcome.status, deployr_common::DeploymentStatus::Success);

        let main = fs::read_to_string(
            fx._build_root
                .path()
                .join("alice-id/bookshop/charge_card-get/main.py"),
        )
        .unwrap();
        assert!(main.contains("def charge(*args, **kwargs):"));
        assert!(main.contains("Stub for unresolved dependency charge"));
    }

    #[tokio::test]
    async fn missing_app_directory_is_not_found() {
        let fx = fixture(MockRuntime::new()).await;
        let cmd = DeployCommand {
            app_path: PathBuf::from("/definitely/not/here"),
            app_name: None,
            user_id: "alice-id".into(),
            environment_variables: HashMap::new(),
            private: false,
            kind: DeployKind::Bundle,
        };
        assert!(matches!(
            fx.service.deploy(cmd).await,
            Err(DeployrError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn app_without_routes_is_a_business_rule_error() {
        let fx = fixture(MockRuntime::new()).await;
        let app = write_app("from flask import Flask\napp = Flask(__name__)\n");
        let result = fx.service.deploy(command(&app, DeployKind::Bundle)).await;
        assert!(matches!(result, Err(DeployrError::BusinessRule(_))));
    }

    #[tokio::test]
    async fn undeploy_removes_image_row_and_build_dir() {
        let fx = fixture(MockRuntime::new()).await;
        let app = write_app(THREE_ROUTE_APP);
        fx.service.deploy(command(&app, DeployKind::Bundle)).await.unwrap();

        let build_dir = fx
            ._build_root
            .path()
            .join("alice-id/bookshop/list_books-get");
        assert!(build_dir.exists());

        let removed = fx
            .service
            .undeploy("list_books", "bookshop", "alice-id")
            .await
            .unwrap();
        assert!(removed);
        assert!(!build_dir.exists());
        assert!(fx
            .functions
            .find_by_app_name_and_name_and_user_id("bookshop", "list_books", "alice-id")
            .await
            .unwrap()
            .is_none());
        assert!(!fx.runtime.cleaned.lock().unwrap().is_empty());
    }

    #[test]
    fn app_names_are_sanitized_and_bounded() {
        assert_eq!(sanitize_app_name("My Cool App!"), "My_Cool_App_");
        assert_eq!(sanitize_app_name("-starts-odd"), "app_-starts-odd");
        assert_eq!(sanitize_app_name(&"x".repeat(80)).len(), 50);
        assert_eq!(
            app_name_from_path(std::path::Path::new("/tmp/uploads/book-manager")),
            "book_manager"
        );
    }
}
