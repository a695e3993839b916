use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use deployr_common::{DeployedFunctionInfo, DeploymentOutcome, DeploymentStatus, FunctionMetrics};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub app_path: String,
    pub app_name: Option<String>,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedFunctionDetail {
    pub function_name: String,
    pub app_name: String,
    pub function_url: String,
    pub is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub supported_methods: Vec<String>,
}

impl From<DeployedFunctionInfo> for DeployedFunctionDetail {
    fn from(info: DeployedFunctionInfo) -> Self {
        Self {
            function_name: info.function_name,
            app_name: info.app_name,
            function_url: info.function_url,
            is_private: info.is_private,
            api_key: info.api_key,
            supported_methods: info.supported_methods,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub status: &'static str,
    pub app_name: String,
    pub deployed_functions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_functions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub deployed_function_details: Vec<DeployedFunctionDetail>,
}

impl From<DeploymentOutcome> for DeployResponse {
    fn from(outcome: DeploymentOutcome) -> Self {
        Self {
            status: match outcome.status {
                DeploymentStatus::Success => "success",
                DeploymentStatus::Partial => "partial",
            },
            app_name: outcome.app_name,
            deployed_functions: outcome.deployed_functions,
            failed_functions: outcome.failed_functions,
            error: outcome.error,
            deployed_function_details: outcome.details.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityToggleRequest {
    pub is_private: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityToggleResponse {
    pub function_id: String,
    pub is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub function_id: String,
    pub function_name: String,
    pub app_name: String,
    pub invocation_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_execution_time_ms: u64,
    pub min_execution_time_ms: u64,
    pub max_execution_time_ms: u64,
    pub average_execution_time_ms: u64,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_invoked: Option<String>,
}

impl From<FunctionMetrics> for MetricsResponse {
    fn from(metrics: FunctionMetrics) -> Self {
        Self {
            function_id: metrics.function_id.clone(),
            function_name: metrics.function_name.clone(),
            app_name: metrics.app_name.clone(),
            invocation_count: metrics.invocation_count,
            success_count: metrics.success_count,
            failure_count: metrics.failure_count,
            total_execution_time_ms: metrics.total_execution_time_ms,
            min_execution_time_ms: metrics.min_execution_time_ms.unwrap_or(0),
            max_execution_time_ms: metrics.max_execution_time_ms,
            average_execution_time_ms: metrics.average_execution_time_ms(),
            success_rate: metrics.success_rate(),
            last_invoked: metrics.last_invoked.map(|t| t.to_rfc3339()),
        }
    }
}
