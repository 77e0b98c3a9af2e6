//! API key issuance and request authentication

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{CrosspostError, Result};
use crate::types::{is_path_safe_id, new_id, ApiKeyRef, GeneratedApiKey};

pub const TOKEN_LENGTH: usize = 40;

/// 40 random characters from `[A-Za-z0-9]`
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Compare without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Create a new key for `user_id`. The token is only ever returned here.
pub async fn generate_api_key(db: &Database, user_id: &str) -> Result<GeneratedApiKey> {
    if !is_path_safe_id(user_id) {
        return Err(CrosspostError::InvalidInput(format!(
            "invalid user id '{}'",
            user_id
        )));
    }

    let key = GeneratedApiKey {
        user_id: user_id.to_string(),
        key_id: new_id(),
        token: generate_token(),
    };

    db.insert_api_key(
        &key.user_id,
        &key.key_id,
        &key.token,
        chrono::Utc::now().timestamp(),
    )
    .await?;

    info!(user_id = %key.user_id, key_id = %key.key_id, "generated api key");
    Ok(key)
}

/// Check a caller credential against the key table.
///
/// The `(user, key)` pair must exist. A supplied token must also match.
pub async fn authenticate(db: &Database, credential: &ApiKeyRef) -> Result<()> {
    if credential.user_id.is_empty() || credential.key_id.is_empty() {
        return Err(CrosspostError::Unauthorized(
            "missing user or key id".to_string(),
        ));
    }

    let stored = db
        .get_api_key_token(&credential.user_id, &credential.key_id)
        .await?
        .ok_or_else(|| CrosspostError::Unauthorized("unknown api key".to_string()))?;

    if let Some(token) = &credential.token {
        if !constant_time_eq(token.as_bytes(), stored.as_bytes()) {
            debug!(
                user_id = %credential.user_id,
                key_id = %credential.key_id,
                "api key token mismatch"
            );
            return Err(CrosspostError::Unauthorized("invalid api key".to_string()));
        }
    }

    Ok(())
}
