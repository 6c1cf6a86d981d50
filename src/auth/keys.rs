use axum::http::{HeaderMap, header};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// SHA-256 digest of an API key, returned as a hex string. Only digests
/// are ever stored.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract the Bearer token from the Authorization header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthenticated("Missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| {
            AppError::Unauthenticated("Invalid Authorization header encoding".to_string())
        })?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            AppError::Unauthenticated("Authorization header must use Bearer scheme".to_string())
        })?
        .trim();

    if token.is_empty() {
        return Err(AppError::Unauthenticated("Empty Bearer token".to_string()));
    }

    Ok(token.to_string())
}
