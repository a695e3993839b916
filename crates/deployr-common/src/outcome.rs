use serde::{Deserialize, Serialize};

use crate::{DeployrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Success,
    Partial,
}

/// Per-function detail returned alongside a deployment outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployedFunctionInfo {
    pub function_name: String,
    pub app_name: String,
    pub function_url: String,
    pub is_private: bool,
    pub api_key: Option<String>,
    pub supported_methods: Vec<String>,
}

/// Transient aggregate over one deployment request. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub status: DeploymentStatus,
    pub app_name: String,
    pub deployed_functions: Vec<String>,
    pub failed_functions: Vec<String>,
    pub details: Vec<DeployedFunctionInfo>,
    pub error: Option<String>,
}

impl DeploymentOutcome {
    /// Pure, order-independent fold over per-function results. All-failed
    /// deployments are a terminal error rather than a partial outcome.
    pub fn aggregate(
        app_name: String,
        deployed_functions: Vec<String>,
        failed_functions: Vec<String>,
        details: Vec<DeployedFunctionInfo>,
    ) -> Result<Self> {
        if deployed_functions.is_empty() && !failed_functions.is_empty() {
            return Err(DeployrError::Deployment(
                "All functions failed to deploy".into(),
            ));
        }
        if failed_functions.is_empty() {
            Ok(Self {
                status: DeploymentStatus::Success,
                app_name,
                deployed_functions,
                failed_functions,
                details,
                error: None,
            })
        } else {
            Ok(Self {
                status: DeploymentStatus::Partial,
                app_name,
                deployed_functions,
                failed_functions,
                details,
                error: Some("Some functions failed to deploy".into()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_succeeded_is_success() {
        let outcome = DeploymentOutcome::aggregate(
            "shop".into(),
            vec!["a".into(), "b".into()],
            vec![],
            vec![],
        )
        .unwrap();
        assert_eq!(outcome.status, DeploymentStatus::Success);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn mixed_results_are_partial() {
        let outcome = DeploymentOutcome::aggregate(
            "shop".into(),
            vec!["a".into(), "b".into()],
            vec!["c".into()],
            vec![],
        )
        .unwrap();
        assert_eq!(outcome.status, DeploymentStatus::Partial);
        assert_eq!(outcome.deployed_functions.len(), 2);
        assert_eq!(outcome.failed_functions.len(), 1);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn all_failed_is_a_terminal_error() {
        let result = DeploymentOutcome::aggregate(
            "shop".into(),
            vec![],
            vec!["a".into(), "b".into()],
            vec![],
        );
        assert!(matches!(result, Err(DeployrError::Deployment(_))));
    }
}
