//! Password hashing and bearer tokens for the admin surface.
//!
//! Passwords are stored as argon2 PHC strings. Tokens are HS256 JWTs signed
//! with the configured secret and carry the user id, name and role.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No token provided. Authorization must be in format: Bearer <token>")]
    MissingToken,
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Admin access required")]
    Forbidden,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken
            | AuthError::Expired
            | AuthError::InvalidToken
            | AuthError::InvalidCredentials => "unauthorized",
            AuthError::Forbidden => "forbidden",
            AuthError::Hash(_) | AuthError::Signing(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

pub fn hash_password(plain: &str) -> Result<String, AuthError> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|e| AuthError::Hash(e.to_string()))?;
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

pub fn verify_password(plain: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

pub fn issue_token(
    config: &Config,
    user_id: &str,
    username: &str,
    role: &str,
) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        role: role.to_string(),
        iat: now,
        exp: now + config.jwt_ttl_hours * 3600,
    };
    sign(config, &claims)
}

fn sign(config: &Config, claims: &Claims) -> Result<String, AuthError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| AuthError::Signing(e.to_string()))
}

pub fn verify_token(config: &Config, token: &str) -> Result<Claims, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::InvalidToken,
    })
}

/// Extracts the token from an `Authorization` value. A bare token is
/// accepted as well as the `Bearer <token>` form.
pub fn bearer_token(authorization: Option<&str>) -> Result<&str, AuthError> {
    let raw = authorization.map(str::trim).unwrap_or("");
    let token = if raw == "Bearer" {
        ""
    } else {
        raw.strip_prefix("Bearer ").unwrap_or(raw).trim()
    };
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}
