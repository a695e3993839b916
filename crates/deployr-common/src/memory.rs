//! In-memory repository implementations over DashMap. Used by the gateway
//! binary and throughout the test suites; swap for a database-backed set
//! without touching the services.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::repos::{
    AppMetadata, AppMetadataRepository, FunctionRepository, MetricsRepository, UserRepository,
};
use crate::{DeployrError, Function, FunctionMetrics, Result, User};

#[derive(Debug, Default)]
pub struct InMemoryFunctionRepository {
    functions: DashMap<String, Function>,
}

impl InMemoryFunctionRepository {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl FunctionRepository for InMemoryFunctionRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Function>> {
        Ok(self.functions.get(id).map(|entry| entry.value().clone()))
    }

    async fn find_by_app_name_and_name_and_user_id(
        &self,
        app_name: &str,
        name: &str,
        user_id: &str,
    ) -> Result<Option<Function>> {
        Ok(self
            .functions
            .iter()
            .find(|entry| {
                let f = entry.value();
                f.app_name == app_name && f.name == name && f.user_id == user_id
            })
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<Function>> {
        Ok(self
            .functions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn save(&self, function: Function) -> Result<Function> {
        if function.id.trim().is_empty() {
            return Err(DeployrError::validation("id", "Function id cannot be empty"));
        }
        debug!(id = %function.id, name = %function.name, "Saving function");
        self.functions.insert(function.id.clone(), function.clone());
        Ok(function)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.functions.remove(id).is_some())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetricsRepository {
    metrics: DashMap<String, FunctionMetrics>,
}

impl InMemoryMetricsRepository {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl MetricsRepository for InMemoryMetricsRepository {
    async fn find_by_function_id(&self, function_id: &str) -> Result<Option<FunctionMetrics>> {
        Ok(self
            .metrics
            .get(function_id)
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, metrics: FunctionMetrics) -> Result<FunctionMetrics> {
        self.metrics
            .insert(metrics.function_id.clone(), metrics.clone());
        Ok(metrics)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    users: DashMap<String, User>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.get(id).map(|entry| entry.value().clone()))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .iter()
            .find(|entry| entry.value().username == username)
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, user: User) -> Result<User> {
        self.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAppMetadataRepository {
    apps: DashMap<String, AppMetadata>,
}

impl InMemoryAppMetadataRepository {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl AppMetadataRepository for InMemoryAppMetadataRepository {
    async fn create_metadata(
        &self,
        app_name: &str,
        source_path: &str,
        build_path: &str,
    ) -> Result<AppMetadata> {
        let metadata = AppMetadata::new(
            app_name.to_string(),
            source_path.to_string(),
            build_path.to_string(),
        );
        self.apps.insert(app_name.to_string(), metadata.clone());
        Ok(metadata)
    }

    async fn add_deployed_function(&self, app_name: &str, function_name: &str) -> Result<()> {
        if let Some(mut entry) = self.apps.get_mut(app_name) {
            let functions = &mut entry.value_mut().deployed_functions;
            if !functions.iter().any(|f| f == function_name) {
                functions.push(function_name.to_string());
            }
        }
        Ok(())
    }

    async fn remove_deployed_function(&self, app_name: &str, function_name: &str) -> Result<()> {
        if let Some(mut entry) = self.apps.get_mut(app_name) {
            entry
                .value_mut()
                .deployed_functions
                .retain(|f| f != function_name);
        }
        Ok(())
    }

    async fn find_by_name(&self, app_name: &str) -> Result<Option<AppMetadata>> {
        Ok(self.apps.get(app_name).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(id: &str, name: &str, app: &str, user: &str) -> Function {
        Function {
            id: id.into(),
            name: name.into(),
            app_name: app.into(),
            user_id: user.into(),
            path: format!("/{name}"),
            methods: vec!["GET".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn function_lookup_is_scoped_to_the_owner() {
        let repo = InMemoryFunctionRepository::new();
        repo.save(function("f1", "list", "shop", "alice")).await.unwrap();
        repo.save(function("f2", "list", "shop", "bob")).await.unwrap();

        let found = repo
            .find_by_app_name_and_name_and_user_id("shop", "list", "alice")
            .await
            .unwrap()
            .expect("alice's function");
        assert_eq!(found.id, "f1");

        let missing = repo
            .find_by_app_name_and_name_and_user_id("shop", "list", "carol")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let repo = InMemoryFunctionRepository::new();
        repo.save(function("f1", "list", "shop", "alice")).await.unwrap();
        assert!(repo.delete("f1").await.unwrap());
        assert!(!repo.delete("f1").await.unwrap());
    }

    #[tokio::test]
    async fn metadata_tracks_deployed_functions_without_duplicates() {
        let repo = InMemoryAppMetadataRepository::new();
        repo.create_metadata("shop", "/src/shop", "/build/u1/shop")
            .await
            .unwrap();
        repo.add_deployed_function("shop", "list").await.unwrap();
        repo.add_deployed_function("shop", "list").await.unwrap();
        repo.add_deployed_function("shop", "create").await.unwrap();

        let metadata = repo.find_by_name("shop").await.unwrap().unwrap();
        assert_eq!(metadata.deployed_functions, vec!["list", "create"]);

        repo.remove_deployed_function("shop", "list").await.unwrap();
        let metadata = repo.find_by_name("shop").await.unwrap().unwrap();
        assert_eq!(metadata.deployed_functions, vec!["create"]);
    }
}
