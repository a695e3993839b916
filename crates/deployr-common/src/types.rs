use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeployrError, Result};

/// HTTP verbs a function may declare.
pub const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "HEAD"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    Java,
    Php,
    CSharp,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Php => "php",
            Language::CSharp => "csharp",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    #[default]
    Flask,
    Spring,
    Laravel,
    AspNet,
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Framework::Flask => "flask",
            Framework::Spring => "spring",
            Framework::Laravel => "laravel",
            Framework::AspNet => "aspnet",
        };
        f.write_str(s)
    }
}

/// An import statement captured by a scanner, e.g. `import numpy as np`
/// becomes `{ module: "numpy", alias: "np" }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportBinding {
    pub module: String,
    pub alias: String,
}

impl ImportBinding {
    pub fn new(module: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            alias: alias.into(),
        }
    }

    pub fn top_level_module(&self) -> &str {
        self.module.split('.').next().unwrap_or(&self.module)
    }
}

/// A route handler located by a source scanner. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub path: String,
    pub methods: Vec<String>,
    pub source: String,
    pub app_name: String,
    pub class_name: Option<String>,
    pub namespace: Option<String>,
    pub file_path: Option<String>,
}

/// The normalized output of a per-ecosystem source scanner. The Resolver
/// and Synthesizer depend only on this shape, never on scanner internals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub language: Language,
    pub framework: Framework,
    pub app_name: String,
    pub routes: Vec<Route>,
    /// Symbol name to full source text of every free function found.
    pub functions: HashMap<String, String>,
    /// Class name to full class source text.
    pub classes: HashMap<String, String>,
    /// Import alias to binding.
    pub imports: HashMap<String, ImportBinding>,
    /// Global variable name to its assignment source.
    pub global_vars: HashMap<String, String>,
    /// Database bootstrap blocks keyed by symbol.
    pub db_code: HashMap<String, String>,
    /// Configuration blocks keyed by symbol.
    pub config_code: HashMap<String, String>,
    pub env_var_refs: HashSet<String>,
    /// Caller symbol to the set of symbols it references.
    pub call_graph: HashMap<String, HashSet<String>>,
    /// Service field name to the class name it is declared as.
    pub owned_services: HashMap<String, String>,
}

/// The deployable unit. Owned by exactly one user and keyed uniquely by
/// `(app_name, name, user_id)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub name: String,
    pub app_name: String,
    pub user_id: String,
    pub path: String,
    pub methods: Vec<String>,
    pub source: String,
    #[serde(default)]
    pub dependencies: HashSet<String>,
    #[serde(default)]
    pub dependency_sources: HashMap<String, String>,
    #[serde(default)]
    pub imports: Vec<ImportBinding>,
    #[serde(default)]
    pub global_vars: HashMap<String, String>,
    #[serde(default)]
    pub db_code: HashMap<String, String>,
    #[serde(default)]
    pub config_code: HashMap<String, String>,
    #[serde(default)]
    pub env_vars: HashSet<String>,
    #[serde(default)]
    pub requires_db: bool,
    pub language: Language,
    pub framework: Framework,
    #[serde(default)]
    pub is_private: bool,
    pub api_key: Option<String>,
    pub api_key_generated_at: Option<DateTime<Utc>>,
}

impl Function {
    /// Primary method used for build directory and image tag derivation.
    pub fn primary_method(&self) -> &str {
        self.methods.first().map(String::as_str).unwrap_or("GET")
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DeployrError::validation("name", "Function name cannot be empty"));
        }
        if self.path.trim().is_empty() {
            return Err(DeployrError::validation("path", "Function path cannot be empty"));
        }
        if self.methods.is_empty() {
            return Err(DeployrError::validation(
                "methods",
                "Function must declare at least one HTTP method",
            ));
        }
        for method in &self.methods {
            if !HTTP_METHODS.contains(&method.as_str()) {
                return Err(DeployrError::validation(
                    "methods",
                    format!("Unsupported HTTP method: {method}"),
                ));
            }
        }
        if self.is_private && self.api_key.is_none() {
            return Err(DeployrError::validation(
                "api_key",
                "Private function must carry an API key",
            ));
        }
        Ok(())
    }
}

/// Ephemeral context handed to a synthesizer. Never persisted.
#[derive(Debug, Clone)]
pub struct FunctionBuildContext {
    pub function: Function,
    pub source_app_path: PathBuf,
    pub build_output_path: PathBuf,
    pub language: Language,
    pub framework: Framework,
}

impl FunctionBuildContext {
    pub fn validate(&self) -> Result<()> {
        self.function.validate()?;
        if !self.source_app_path.is_dir() {
            return Err(DeployrError::validation(
                "source_app_path",
                format!("Not a directory: {}", self.source_app_path.display()),
            ));
        }
        Ok(())
    }
}

/// Binding between a function and its runnable isolated process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRef {
    pub image_tag: String,
    pub function_name: String,
}

impl ContainerRef {
    pub fn new(image_tag: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            image_tag: image_tag.into(),
            function_name: function_name.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_tag.trim().is_empty() {
            return Err(DeployrError::validation("image_tag", "Image tag cannot be empty"));
        }
        if self.function_name.trim().is_empty() {
            return Err(DeployrError::validation(
                "function_name",
                "Function name cannot be empty",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_function() -> Function {
        Function {
            id: "f1".into(),
            name: "get_books".into(),
            app_name: "bookmanager".into(),
            user_id: "u1".into(),
            path: "/books".into(),
            methods: vec!["GET".into()],
            source: "def get_books():\n    return jsonify([])".into(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_accepts_well_formed_function() {
        assert!(valid_function().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_method() {
        let mut f = valid_function();
        f.methods = vec!["FETCH".into()];
        assert!(matches!(
            f.validate(),
            Err(DeployrError::Validation { .. })
        ));
    }

    #[test]
    fn validate_rejects_private_function_without_key() {
        let mut f = valid_function();
        f.is_private = true;
        assert!(f.validate().is_err());
        f.api_key = Some("func_abc".into());
        assert!(f.validate().is_ok());
    }

    #[test]
    fn primary_method_defaults_to_get() {
        let mut f = valid_function();
        f.methods.clear();
        assert_eq!(f.primary_method(), "GET");
        f.methods = vec!["POST".into(), "PUT".into()];
        assert_eq!(f.primary_method(), "POST");
    }

    #[test]
    fn import_binding_top_level_module() {
        let imp = ImportBinding::new("werkzeug.security", "generate_password_hash");
        assert_eq!(imp.top_level_module(), "werkzeug");
    }
}
