// Shared domain types, error taxonomy and trait seams for the deployr
// workspace. Every other crate depends only on the shapes defined here,
// never on another crate's internals.

use thiserror::Error;

pub mod execution;
pub mod memory;
pub mod metrics;
pub mod outcome;
pub mod repos;
pub mod runtime;
pub mod types;

pub use execution::FunctionExecutionResult;
pub use metrics::FunctionMetrics;
pub use outcome::{DeployedFunctionInfo, DeploymentOutcome, DeploymentStatus};
pub use repos::{
    AppMetadata, AppMetadataRepository, FunctionRepository, MetricsRepository, UserRepository,
};
pub use runtime::{image_tag, sanitize_tag, ContainerRuntime, IMAGE_PREFIX};
pub use types::{
    AnalysisResult, ContainerRef, Framework, Function, FunctionBuildContext, ImportBinding,
    Language, Route, User, HTTP_METHODS,
};

/// Error taxonomy for the whole platform. Domain errors (validation,
/// not-found, business-rule) propagate verbatim to the boundary;
/// infrastructure failures are wrapped into the stage-appropriate member
/// with the original cause retained.
#[derive(Error, Debug)]
pub enum DeployrError {
    #[error("Validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("{resource} not found: {identifier}")]
    NotFound {
        resource: String,
        identifier: String,
    },

    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Deployment failed: {0}")]
    Deployment(String),

    #[error("Code analysis failed ({language}): {message}")]
    CodeAnalysis { language: String, message: String },

    #[error("File operation '{op}' on '{path}' failed: {source}")]
    FileOperation {
        op: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Container runtime error: {0}")]
    Container(String),

    #[error("Invocation of '{function}' failed: {message}")]
    Invocation { function: String, message: String },
}

impl DeployrError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            identifier: identifier.into(),
        }
    }

    pub fn file_op(op: impl Into<String>, path: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileOperation {
            op: op.into(),
            path: path.into(),
            source,
        }
    }

    /// Machine-readable code surfaced alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::BusinessRule(_) => "BUSINESS_RULE_VIOLATION",
            Self::Unauthorized(_) => "ACCESS_DENIED",
            Self::Deployment(_) => "DEPLOYMENT_ERROR",
            Self::CodeAnalysis { .. } => "CODE_ANALYSIS_ERROR",
            Self::FileOperation { .. } => "FILE_OPERATION_ERROR",
            Self::Container(_) => "CONTAINER_ERROR",
            Self::Invocation { .. } => "INVOCATION_ERROR",
        }
    }

    /// HTTP-like severity used by the gateway when mapping to responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::BusinessRule(_) => 409,
            Self::Unauthorized(_) => 403,
            Self::Deployment(_)
            | Self::CodeAnalysis { .. }
            | Self::FileOperation { .. }
            | Self::Container(_)
            | Self::Invocation { .. } => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployrError>;
