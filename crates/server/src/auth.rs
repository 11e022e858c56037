use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::AccountId;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("malformed token subject")]
    BadSubject,
}

pub fn mint_token(
    cfg: &AuthConfig,
    account_id: AccountId,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        sub: format!("acct:{}", account_id.0),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
}

/// Verifies signature and expiry, then resolves the subject to an account
/// id. The bound identity is decided here, once, before any chat state can
/// be touched; it never changes for the connection's lifetime.
pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<AccountId, AuthError> {
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &Validation::default(),
    )?;

    decoded
        .claims
        .sub
        .strip_prefix("acct:")
        .and_then(|id| id.parse::<i64>().ok())
        .map(AccountId)
        .ok_or(AuthError::BadSubject)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
