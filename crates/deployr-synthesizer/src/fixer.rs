//! Post-emission normalization of route decorators. Textual synthesis can
//! leave method lists unquoted (`methods=[GET, POST]`); this pass re-parses
//! the emitted file and rewrites them. Failures degrade to "continue
//! without fixing".

use std::fs;
use std::path::Path;

use regex::{Captures, Regex};
use tracing::{debug, warn};

use deployr_common::{DeployrError, Result};

/// Quote bare uppercase HTTP method names inside `methods=[...]` lists.
/// Returns whether the file changed.
pub fn fix_http_methods(file_path: &Path) -> Result<bool> {
    let content = fs::read_to_string(file_path)
        .map_err(|e| DeployrError::file_op("read", file_path.display().to_string(), e))?;

    let fixed = fix_http_methods_in_source(&content);
    if fixed == content {
        debug!(file = %file_path.display(), "No method fixes needed");
        return Ok(false);
    }

    fs::write(file_path, &fixed)
        .map_err(|e| DeployrError::file_op("write", file_path.display().to_string(), e))?;
    debug!(file = %file_path.display(), "Rewrote malformed method lists");
    Ok(true)
}

pub fn fix_http_methods_in_source(content: &str) -> String {
    // Only rewrite lists consisting solely of bare uppercase tokens, so
    // already-correct lists pass through untouched.
    let re = Regex::new(r"methods\s*=\s*\[([A-Z][A-Z, ]*)\]").expect("static regex");
    re.replace_all(content, |caps: &Captures<'_>| {
        let quoted: Vec<String> = caps[1]
            .split(',')
            .map(|m| format!("'{}'", m.trim()))
            .filter(|m| m.len() > 2)
            .collect();
        format!("methods=[{}]", quoted.join(", "))
    })
    .into_owned()
}

/// Best-effort wrapper used by the synthesis pipeline: a fixer failure is
/// logged, never fatal.
pub fn try_fix_http_methods(file_path: &Path) {
    if let Err(e) = fix_http_methods(file_path) {
        warn!(file = %file_path.display(), error = %e, "HTTP method fixer skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_bare_method_lists() {
        let fixed = fix_http_methods_in_source("@app.route('/x', methods=[GET, POST])\n");
        assert_eq!(fixed, "@app.route('/x', methods=['GET', 'POST'])\n");
    }

    #[test]
    fn leaves_quoted_lists_untouched() {
        let source = "@app.route('/x', methods=['GET', 'POST'])\n";
        assert_eq!(fix_http_methods_in_source(source), source);
    }

    #[test]
    fn single_method_is_fixed() {
        let fixed = fix_http_methods_in_source("methods=[DELETE]");
        assert_eq!(fixed, "methods=['DELETE']");
    }

    #[test]
    fn file_roundtrip_reports_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.py");
        std::fs::write(&path, "@app.route('/x', methods=[PUT])\n").unwrap();

        assert!(fix_http_methods(&path).unwrap());
        assert!(!fix_http_methods(&path).unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("methods=['PUT']"));
    }
}
