use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::{ContainerRef, FunctionExecutionResult, Result};

/// Prefix shared by every image the platform builds.
pub const IMAGE_PREFIX: &str = "deployr";

/// Seam to the container engine. Implementations own warm/cold container
/// policy; callers must not assume any particular container lifetime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build (or rebuild) the image for a function from its build unit.
    /// Rebuilding an existing tag overwrites it.
    async fn build_image(
        &self,
        tag: &str,
        build_path: &Path,
        env: &HashMap<String, String>,
    ) -> Result<ContainerRef>;

    /// Run one invocation inside an isolated container.
    async fn execute(
        &self,
        container: &ContainerRef,
        event: &Value,
    ) -> Result<FunctionExecutionResult>;

    /// Remove the image behind a tag. Returns whether anything was removed.
    async fn cleanup_image(&self, tag: &str) -> Result<bool>;
}

/// Sanitize an arbitrary string into a valid image tag segment: lowercase,
/// `[a-z0-9._-]` only, no leading or trailing separator.
pub fn sanitize_tag(input: &str) -> String {
    if input.trim().is_empty() {
        return "unknown".to_string();
    }

    let mut sanitized = String::with_capacity(input.len());
    let mut last_was_underscore = false;
    for ch in input.to_lowercase().chars() {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '.' || ch == '-' {
            Some(ch)
        } else if ch.is_whitespace() || ch == '_' {
            Some('_')
        } else {
            None
        };
        if let Some(c) = mapped {
            if c == '_' {
                if !last_was_underscore {
                    sanitized.push('_');
                }
                last_was_underscore = true;
            } else {
                sanitized.push(c);
                last_was_underscore = false;
            }
        }
    }

    let sanitized = sanitized.trim_matches(|c| c == '.' || c == '_' || c == '-');
    if sanitized.is_empty() {
        return "function".to_string();
    }
    sanitized.to_string()
}

/// Deterministic image tag for `(user, app, function, method)`. Re-deploys
/// of the same logical function always land on the same tag, and two users
/// can never collide.
pub fn image_tag(user_id: &str, app_name: &str, function_name: &str, method: &str) -> String {
    let function_segment = format!("{}_{}", function_name, method.to_lowercase());
    format!(
        "{}-{}-{}-{}",
        IMAGE_PREFIX,
        sanitize_tag(user_id),
        sanitize_tag(app_name),
        sanitize_tag(&function_segment)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_is_deterministic_and_well_formed() {
        let pattern = regex_lite_check;
        for input in [
            "My App",
            "shop@2024!",
            "__private__",
            "UPPER-case.ok",
            "a",
            "weird///name",
        ] {
            let once = sanitize_tag(input);
            let twice = sanitize_tag(input);
            assert_eq!(once, twice, "non-deterministic for {input:?}");
            assert!(pattern(&once), "bad tag {once:?} from {input:?}");
        }
    }

    // Equivalent of ^[a-z0-9][a-z0-9._-]*[a-z0-9]$ with single-char outputs allowed.
    fn regex_lite_check(tag: &str) -> bool {
        let bytes = tag.as_bytes();
        if bytes.is_empty() {
            return false;
        }
        let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        let inner_ok =
            |b: u8| edge_ok(b) || b == b'.' || b == b'_' || b == b'-';
        edge_ok(bytes[0])
            && edge_ok(bytes[bytes.len() - 1])
            && bytes.iter().all(|&b| inner_ok(b))
    }

    #[test]
    fn sanitize_collapses_runs_and_strips_separators() {
        assert_eq!(sanitize_tag("My  Cool App"), "my_cool_app");
        assert_eq!(sanitize_tag("__init__"), "init");
        assert_eq!(sanitize_tag("!!!"), "function");
        assert_eq!(sanitize_tag(""), "unknown");
    }

    #[test]
    fn image_tags_are_stable_and_user_scoped() {
        let a = image_tag("user-1", "Shop", "listItems", "GET");
        let b = image_tag("user-1", "Shop", "listItems", "GET");
        let other_user = image_tag("user-2", "Shop", "listItems", "GET");
        assert_eq!(a, b);
        assert_ne!(a, other_user);
        assert_eq!(a, "deployr-user-1-shop-listitems_get");
    }
}
