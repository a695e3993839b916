// Source scanning and dependency resolution. Scanners are pluggable per
// ecosystem behind `ApplicationAnalyzer`; the resolver works purely on the
// normalized `AnalysisResult` shape and is ecosystem-agnostic.

use std::path::Path;

use deployr_common::{AnalysisResult, DeployrError, Framework, Function, Language, Result};

pub mod flask;
pub mod resolver;

pub use flask::FlaskAnalyzer;
pub use resolver::{DependencyResolver, ResolvedClosure};

/// One scanner per source ecosystem. Walks an application directory and
/// produces the normalized analysis record plus extracted functions.
pub trait ApplicationAnalyzer: Send + Sync {
    fn language(&self) -> Language;

    fn framework(&self) -> Framework;

    /// Cheap structural probe used to pick an analyzer for an app.
    fn detect(&self, app_path: &Path) -> bool;

    fn analyze(&self, app_path: &Path) -> Result<AnalysisResult>;

    fn extract_functions(&self, analysis: &AnalysisResult) -> Result<Vec<Function>>;
}

/// Registry over the available analyzers. Picks the first one whose probe
/// matches the application layout.
pub struct AnalyzerRegistry {
    analyzers: Vec<Box<dyn ApplicationAnalyzer>>,
}

impl AnalyzerRegistry {
    pub fn new(analyzers: Vec<Box<dyn ApplicationAnalyzer>>) -> Self {
        Self { analyzers }
    }

    pub fn with_defaults() -> Self {
        Self::new(vec![Box::new(FlaskAnalyzer::new())])
    }

    pub fn analyzer_for(&self, app_path: &Path) -> Result<&dyn ApplicationAnalyzer> {
        self.analyzers
            .iter()
            .find(|a| a.detect(app_path))
            .map(|a| a.as_ref())
            .ok_or_else(|| {
                DeployrError::BusinessRule(format!(
                    "No analyzer recognizes the application at {}",
                    app_path.display()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn registry_picks_flask_for_a_flask_app() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("app.py"),
            "from flask import Flask\napp = Flask(__name__)\n",
        )
        .unwrap();

        let registry = AnalyzerRegistry::with_defaults();
        let analyzer = registry.analyzer_for(dir.path()).unwrap();
        assert_eq!(analyzer.language(), Language::Python);
        assert_eq!(analyzer.framework(), Framework::Flask);
    }

    #[test]
    fn registry_rejects_unrecognized_layouts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "console.log('hi')\n").unwrap();

        let registry = AnalyzerRegistry::with_defaults();
        assert!(matches!(
            registry.analyzer_for(dir.path()),
            Err(DeployrError::BusinessRule(_))
        ));
    }
}
