// Build-unit synthesis. One synthesizer per source ecosystem turns a
// `FunctionBuildContext` into a self-contained deployable directory: main
// program, dependency manifest, container descriptor and runtime shims.

use std::sync::Arc;

use deployr_common::{DeployrError, Framework, FunctionBuildContext, Language, Result};

pub mod fixer;
pub mod flask;
pub mod templates;

pub use flask::FlaskSynthesizer;

pub trait FunctionSynthesizer: Send + Sync {
    fn language(&self) -> Language;

    fn framework(&self) -> Framework;

    /// Deterministically write the complete build unit for one function.
    /// Any I/O failure here is fatal to this function's build only.
    fn create_build_unit(&self, context: &FunctionBuildContext) -> Result<()>;
}

pub fn synthesizer_for(
    language: Language,
    framework: Framework,
) -> Result<Arc<dyn FunctionSynthesizer>> {
    match (language, framework) {
        (Language::Python, Framework::Flask) => Ok(Arc::new(FlaskSynthesizer::new())),
        (language, framework) => Err(DeployrError::BusinessRule(format!(
            "No synthesizer available for {language}/{framework}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_covers_the_flask_ecosystem() {
        let synthesizer = synthesizer_for(Language::Python, Framework::Flask).unwrap();
        assert_eq!(synthesizer.language(), Language::Python);
    }

    #[test]
    fn factory_rejects_unsupported_pairs() {
        assert!(synthesizer_for(Language::Java, Framework::Spring).is_err());
    }
}
