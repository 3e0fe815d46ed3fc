//! Connection authentication.
//!
//! The upgrade request is authenticated before anything reaches the hub.
//! With a configured secret the user id comes from a verified HS256 token;
//! without one the `userId` query parameter is trusted.

use crate::config::AuthConfig;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tenvis_callway_core::UserId;
use thiserror::Error;

/// Authentication errors. All of them refuse the upgrade with 401.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token in the query string or cookie.
    #[error("Missing session token")]
    MissingToken,

    /// Token failed verification.
    #[error("Invalid session token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    /// No usable user id.
    #[error("Missing user id")]
    MissingUserId,
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConnectQuery {
    /// Session token.
    pub token: Option<String>,
    /// Trusted user id, honored only without a secret.
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    /// Client protocol version, `major` or `major.minor`.
    pub protocol: Option<String>,
}

/// Session token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub exp: u64,
}

enum Mode {
    Token {
        key: DecodingKey,
        validation: Validation,
        cookie: String,
    },
    Trusted,
}

/// Resolves the user behind an upgrade request.
pub struct Authenticator {
    mode: Mode,
}

impl Authenticator {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mode = match &config.jwt_secret {
            Some(secret) => Mode::Token {
                key: DecodingKey::from_secret(secret.as_bytes()),
                validation: Validation::default(),
                cookie: config.cookie_name.clone(),
            },
            None => {
                tracing::warn!("No JWT secret configured, trusting userId query parameter");
                Mode::Trusted
            }
        };
        Self { mode }
    }

    /// Resolve the user id for an upgrade request.
    ///
    /// # Errors
    ///
    /// Returns an error when no valid identity is present.
    pub fn authenticate(&self, query: &ConnectQuery, headers: &HeaderMap) -> Result<UserId, AuthError> {
        match &self.mode {
            Mode::Token {
                key,
                validation,
                cookie,
            } => {
                let token = query
                    .token
                    .clone()
                    .or_else(|| cookie_value(headers, cookie))
                    .ok_or(AuthError::MissingToken)?;
                let data = jsonwebtoken::decode::<Claims>(&token, key, validation)?;
                valid_user_id(&data.claims.user_id)
            }
            Mode::Trusted => valid_user_id(query.user_id.as_deref().unwrap_or_default()),
        }
    }
}

fn valid_user_id(id: &str) -> Result<UserId, AuthError> {
    let id = id.trim();
    if id.is_empty() || id == "undefined" {
        return Err(AuthError::MissingUserId);
    }
    Ok(id.to_string())
}

/// Find a cookie by name in the `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}
