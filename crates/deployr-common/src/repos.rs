use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Function, FunctionMetrics, Result, User};

/// Per-application bookkeeping maintained on deploy and undeploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    pub app_name: String,
    pub source_path: String,
    pub build_path: String,
    pub deployed_functions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl AppMetadata {
    pub fn new(app_name: String, source_path: String, build_path: String) -> Self {
        Self {
            app_name,
            source_path,
            build_path,
            deployed_functions: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait FunctionRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Function>>;

    /// Isolation boundary: a function is only reachable through the owner
    /// triple, never by name alone.
    async fn find_by_app_name_and_name_and_user_id(
        &self,
        app_name: &str,
        name: &str,
        user_id: &str,
    ) -> Result<Option<Function>>;

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<Function>>;

    async fn save(&self, function: Function) -> Result<Function>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn find_by_function_id(&self, function_id: &str) -> Result<Option<FunctionMetrics>>;

    async fn save(&self, metrics: FunctionMetrics) -> Result<FunctionMetrics>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>>;

    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;

    async fn save(&self, user: User) -> Result<User>;
}

#[async_trait]
pub trait AppMetadataRepository: Send + Sync {
    async fn create_metadata(
        &self,
        app_name: &str,
        source_path: &str,
        build_path: &str,
    ) -> Result<AppMetadata>;

    async fn add_deployed_function(&self, app_name: &str, function_name: &str) -> Result<()>;

    async fn remove_deployed_function(&self, app_name: &str, function_name: &str) -> Result<()>;

    async fn find_by_name(&self, app_name: &str) -> Result<Option<AppMetadata>>;
}
