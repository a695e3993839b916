use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use deployr_analyzer::AnalyzerRegistry;
use deployr_common::memory::{
    InMemoryAppMetadataRepository, InMemoryFunctionRepository, InMemoryMetricsRepository,
    InMemoryUserRepository,
};
use deployr_common::{
    DeployrError, FunctionExecutionResult, FunctionRepository, MetricsRepository, User,
    UserRepository,
};
use deployr_executor::DockerRuntime;
use deployr_orchestrator::{AtomicNameCounter, DeployCommand, DeployKind, DeploymentService};
use deployr_router::{InvocationService, InvokeCommand, SecurityService, FUNCTION_KEY_HEADER};

mod types;
use types::{
    DeployRequest, DeployResponse, MetricsResponse, SecurityToggleRequest, SecurityToggleResponse,
};

/// Header identifying the acting user. Authentication proper (JWT) sits in
/// front of this service.
const USER_HEADER: &str = "x-user";

#[derive(Clone)]
struct AppState {
    deployment: Arc<DeploymentService>,
    invocation: Arc<InvocationService>,
    security: Arc<SecurityService>,
    functions: Arc<dyn FunctionRepository>,
    metrics: Arc<dyn MetricsRepository>,
    users: Arc<dyn UserRepository>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,deployr_gateway=debug".into()),
        )
        .init();

    let bind: SocketAddr = std::env::var("DEPLOYR_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8080".into())
        .parse()?;
    let build_root = PathBuf::from(
        std::env::var("DEPLOYR_BUILD_ROOT").unwrap_or_else(|_| "build".into()),
    );
    let dispatch_timeout = Duration::from_millis(
        std::env::var("DEPLOYR_DISPATCH_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60_000),
    );

    let runtime = Arc::new(DockerRuntime::connect()?);

    let functions: Arc<InMemoryFunctionRepository> = Arc::new(InMemoryFunctionRepository::new());
    let metrics = Arc::new(InMemoryMetricsRepository::new());
    let users = Arc::new(InMemoryUserRepository::new());
    let metadata = Arc::new(InMemoryAppMetadataRepository::new());

    let security = Arc::new(SecurityService::new(functions.clone()));
    let deployment = Arc::new(DeploymentService::new(
        functions.clone(),
        metrics.clone(),
        users.clone(),
        metadata,
        runtime.clone(),
        Arc::new(AnalyzerRegistry::with_defaults()),
        security.clone(),
        Arc::new(AtomicNameCounter::new()),
        build_root,
    ));
    let invocation = Arc::new(
        InvocationService::new(
            functions.clone(),
            users.clone(),
            metrics.clone(),
            runtime,
        )
        .with_dispatch_timeout(dispatch_timeout),
    );

    let state = AppState {
        deployment,
        invocation,
        security,
        functions,
        metrics,
        users,
    };

    let app = create_app(state);
    info!(%bind, "deployr gateway listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/deploy", post(deploy_bundle_handler))
        .route("/api/v1/deploy/direct", post(deploy_direct_handler))
        .route(
            "/api/v1/apps/:app_name/functions/:function_name",
            delete(undeploy_handler),
        )
        .route(
            "/api/v1/:username/functions/:app_name/:function_name",
            any(invoke_handler),
        )
        .route("/api/v1/functions/:id/security", put(security_handler))
        .route("/api/v1/functions/:id/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map a domain error onto the HTTP surface: taxonomy status, stable code,
/// message. Stack traces stay in the logs.
fn error_response(e: &DeployrError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": e.to_string(), "code": e.code() }))).into_response()
}

/// Resolve the acting user from the identity header, creating the record
/// on first sight.
async fn acting_user(state: &AppState, headers: &HeaderMap) -> Result<User, DeployrError> {
    let username = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            DeployrError::validation(USER_HEADER, "Missing user identity header")
        })?;

    if let Some(user) = state.users.find_by_username(username).await? {
        return Ok(user);
    }
    info!(%username, "Registering first-seen user");
    state
        .users
        .save(User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
        })
        .await
}

async fn deploy_bundle_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeployRequest>,
) -> Response {
    deploy(state, headers, request, DeployKind::Bundle).await
}

async fn deploy_direct_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeployRequest>,
) -> Response {
    deploy(state, headers, request, DeployKind::Direct).await
}

async fn deploy(
    state: AppState,
    headers: HeaderMap,
    request: DeployRequest,
    kind: DeployKind,
) -> Response {
    let user = match acting_user(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(&e),
    };

    let command = DeployCommand {
        app_path: PathBuf::from(request.app_path),
        app_name: request.app_name,
        user_id: user.id,
        environment_variables: request.environment_variables,
        private: request.private,
        kind,
    };

    match state.deployment.deploy(command).await {
        Ok(outcome) => Json(DeployResponse::from(outcome)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn undeploy_handler(
    State(state): State<AppState>,
    Path((app_name, function_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let user = match acting_user(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(&e),
    };
    match state
        .deployment
        .undeploy(&function_name, &app_name, &user.id)
        .await
    {
        Ok(removed) => Json(json!({ "undeployed": removed, "functionName": function_name }))
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn invoke_handler(
    State(state): State<AppState>,
    Path((username, app_name, function_name)): Path<(String, String, String)>,
    method: Method,
    Query(query_params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let api_key = headers
        .get(FUNCTION_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(String::from_utf8_lossy(&body).into_owned())),
        }
    };

    let command = InvokeCommand {
        owner_username: username,
        app_name,
        function_name,
        http_method: method.as_str().to_string(),
        headers: header_map,
        query_params,
        body,
        api_key,
    };

    let result = state.invocation.invoke(command).await;
    execution_response(result)
}

/// The function's own status code and (possibly re-nested) body travel
/// back to the caller untouched.
fn execution_response(result: FunctionExecutionResult) -> Response {
    let status =
        StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match result.body {
        Value::String(text) => (status, text).into_response(),
        body => (status, Json(body)).into_response(),
    }
}

async fn security_handler(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SecurityToggleRequest>,
) -> Response {
    let user = match acting_user(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(&e),
    };
    match state
        .security
        .toggle(&function_id, &user.id, request.is_private)
        .await
    {
        Ok(function) => Json(SecurityToggleResponse {
            function_id: function.id,
            is_private: function.is_private,
            api_key: function.api_key,
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn metrics_handler(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
) -> Response {
    match state.metrics.find_by_function_id(&function_id).await {
        Ok(Some(metrics)) => Json(MetricsResponse::from(metrics)).into_response(),
        Ok(None) => error_response(&DeployrError::not_found("Function metrics", &function_id)),
        Err(e) => error_response(&e),
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let functions = state
        .functions
        .find_by_user_id("")
        .await
        .map(|_| "healthy")
        .unwrap_or("degraded");
    if functions != "healthy" {
        warn!("Function store health probe failed");
    }
    Json(json!({
        "status": "healthy",
        "components": {
            "store": functions,
            "docker": "configured",
        }
    }))
    .into_response()
}
