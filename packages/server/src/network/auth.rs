//! Route authorization: API keys in the `Authorization` header, or a signed
//! session token in the `token` cookie.

use std::str::FromStr;

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, StatusCode};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use crate::config::OAuthConfig;

/// Session tokens expire this many hours after issue.
pub const SESSION_TTL_HOURS: i64 = 24;

const SESSION_COOKIE: &str = "token";

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRejection {
    pub status: StatusCode,
    pub message: String,
}

/// Issues a session token carrying `claims` plus `iat` and `exp`.
///
/// # Errors
///
/// Fails for an unknown algorithm name or when signing fails.
pub fn create_jwt(
    mut claims: Map<String, Value>,
    oauth: &OAuthConfig,
) -> Result<String, jsonwebtoken::errors::Error> {
    let algorithm = Algorithm::from_str(&oauth.jwt_algorithm)?;
    let now = Utc::now();
    claims.insert("iat".to_string(), Value::from(now.timestamp()));
    claims.insert(
        "exp".to_string(),
        Value::from((now + Duration::hours(SESSION_TTL_HOURS)).timestamp()),
    );
    encode(
        &Header::new(algorithm),
        &claims,
        &EncodingKey::from_secret(oauth.jwt_secret.as_bytes()),
    )
}

/// Whether `token` is a valid, unexpired session token.
#[must_use]
pub fn verify_session(token: &str, oauth: &OAuthConfig) -> bool {
    let Ok(algorithm) = Algorithm::from_str(&oauth.jwt_algorithm) else {
        return false;
    };
    match decode::<Map<String, Value>>(
        token,
        &DecodingKey::from_secret(oauth.jwt_secret.as_bytes()),
        &Validation::new(algorithm),
    ) {
        Ok(_) => true,
        Err(err) => {
            warn!(error = %err, "session token rejected");
            false
        }
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then_some(value)
        })
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let key = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    (!key.is_empty()).then_some(key)
}

fn key_accepted(candidate: &str, keys: &[String]) -> bool {
    keys.iter()
        .fold(false, |found, key| {
            found | bool::from(key.as_bytes().ct_eq(candidate.as_bytes()))
        })
}

/// Checks the credentials of a request to `path` against `keys`.
///
/// A valid session cookie suffices when a session scheme is configured.
/// Otherwise the `Authorization` header must carry one of `keys`, raw or as
/// a bearer credential.
///
/// # Errors
///
/// 403 when no credential is presented, 401 when the key is not accepted.
pub fn authorize(
    headers: &HeaderMap,
    keys: &[String],
    oauth: Option<&OAuthConfig>,
    path: &str,
) -> Result<(), AuthRejection> {
    if let (Some(oauth), Some(token)) = (oauth, session_cookie(headers)) {
        if verify_session(token, oauth) {
            return Ok(());
        }
    }

    let Some(key) = api_key(headers) else {
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "Not authenticated".to_string(),
        });
    };
    if key_accepted(key, keys) {
        return Ok(());
    }
    error!(path, "unauthorized access attempt");
    Err(AuthRejection {
        status: StatusCode::UNAUTHORIZED,
        message: format!("Invalid API Key({key}) for API({path})"),
    })
}
