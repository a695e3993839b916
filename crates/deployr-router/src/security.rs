//! Public/private toggling with API-key issuance. Every mutating operation
//! here verifies ownership first.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, instrument};

use deployr_common::{DeployrError, Function, FunctionRepository, Result};

/// Recognizable prefix on every issued key.
const API_KEY_PREFIX: &str = "func_";

const API_KEY_BYTES: usize = 32;

pub struct SecurityService {
    functions: Arc<dyn FunctionRepository>,
}

impl SecurityService {
    pub fn new(functions: Arc<dyn FunctionRepository>) -> Self {
        Self { functions }
    }

    /// Flip a function between public and private. Making it private
    /// issues a fresh key; making it public clears key and timestamp.
    /// The update is a single repository save, so readers never observe a
    /// half-toggled record.
    #[instrument(skip(self))]
    pub async fn toggle(
        &self,
        function_id: &str,
        requesting_user_id: &str,
        make_private: bool,
    ) -> Result<Function> {
        let mut function = self
            .functions
            .find_by_id(function_id)
            .await?
            .ok_or_else(|| DeployrError::not_found("Function", function_id))?;

        if function.user_id != requesting_user_id {
            return Err(DeployrError::BusinessRule(
                "User does not have permission to modify this function".into(),
            ));
        }

        if make_private {
            function.is_private = true;
            function.api_key = Some(generate_api_key());
            function.api_key_generated_at = Some(Utc::now());
            info!(%function_id, "Issued new API key");
        } else {
            function.is_private = false;
            function.api_key = None;
            function.api_key_generated_at = None;
            info!(%function_id, "Cleared API key");
        }

        self.functions.save(function).await
    }
}

/// 256 bits from the OS generator, URL-safe encoded. Comparison at the
/// invocation boundary is exact equality; constant-time comparison would
/// be a hardening improvement.
fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}
