//! Shared-secret header scheme used between the host and this ExApp.
//!
//! Every request in either direction carries the app id, app version and
//! `AUTHORIZATION-APP-API = base64("<user>:<secret>")`. Inbound requests are
//! accepted only when id, version and secret all match the paired values.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const HEADER_AA_VERSION: &str = "aa-version";
pub const HEADER_EX_APP_ID: &str = "ex-app-id";
pub const HEADER_EX_APP_VERSION: &str = "ex-app-version";
pub const HEADER_AUTHORIZATION_APP_API: &str = "authorization-app-api";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("invalid EX-APP-ID: {received} != {expected}")]
    AppIdMismatch { received: String, expected: String },

    #[error("invalid EX-APP-VERSION: {received} != {expected}")]
    AppVersionMismatch { received: String, expected: String },

    #[error("malformed AUTHORIZATION-APP-API header: {0}")]
    MalformedAuthorization(&'static str),

    #[error("invalid APP_SECRET")]
    SecretMismatch,
}

/// Immutable pairing data for this process.
#[derive(Clone, PartialEq, Eq)]
pub struct ExAppIdentity {
    pub app_id: String,
    pub app_version: String,
    pub app_secret: String,
    pub aa_version: String,
}

impl std::fmt::Debug for ExAppIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExAppIdentity")
            .field("app_id", &self.app_id)
            .field("app_version", &self.app_version)
            .field("app_secret", &"***")
            .field("aa_version", &self.aa_version)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RequestSigner {
    identity: ExAppIdentity,
}

impl RequestSigner {
    pub fn new(identity: ExAppIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &ExAppIdentity {
        &self.identity
    }

    /// Headers for an outbound call acting as `user` (empty for "no user").
    pub fn sign(&self, user: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert_lossy(&mut headers, HEADER_AA_VERSION, &self.identity.aa_version);
        insert_lossy(&mut headers, HEADER_EX_APP_ID, &self.identity.app_id);
        insert_lossy(&mut headers, HEADER_EX_APP_VERSION, &self.identity.app_version);
        insert_lossy(
            &mut headers,
            HEADER_AUTHORIZATION_APP_API,
            &encode_authorization(user, &self.identity.app_secret),
        );
        headers
    }

    /// Check an inbound request and return the user it acts for.
    pub fn verify(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let app_id = header_str(headers, HEADER_EX_APP_ID, "EX-APP-ID")?;
        if app_id != self.identity.app_id {
            return Err(AuthError::AppIdMismatch {
                received: app_id.to_string(),
                expected: self.identity.app_id.clone(),
            });
        }

        let app_version = header_str(headers, HEADER_EX_APP_VERSION, "EX-APP-VERSION")?;
        if app_version != self.identity.app_version {
            return Err(AuthError::AppVersionMismatch {
                received: app_version.to_string(),
                expected: self.identity.app_version.clone(),
            });
        }

        let encoded = header_str(
            headers,
            HEADER_AUTHORIZATION_APP_API,
            "AUTHORIZATION-APP-API",
        )?;
        let (user, secret) = decode_authorization(encoded)?;

        if !constant_time_eq(secret.as_bytes(), self.identity.app_secret.as_bytes()) {
            return Err(AuthError::SecretMismatch);
        }

        Ok(user)
    }
}

pub fn encode_authorization(user: &str, secret: &str) -> String {
    BASE64.encode(format!("{user}:{secret}"))
}

/// Decode `base64("<user>:<secret>")`, splitting at the first colon so the
/// secret itself may contain colons.
pub fn decode_authorization(encoded: &str) -> Result<(String, String), AuthError> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|_| AuthError::MalformedAuthorization("not valid base64"))?;
    let decoded =
        String::from_utf8(raw).map_err(|_| AuthError::MalformedAuthorization("not valid UTF-8"))?;
    let (user, secret) = decoded
        .split_once(':')
        .ok_or(AuthError::MalformedAuthorization("missing ':' separator"))?;
    Ok((user.to_string(), secret.to_string()))
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &str,
    display: &'static str,
) -> Result<&'a str, AuthError> {
    headers
        .get(name)
        .ok_or(AuthError::MissingHeader(display))?
        .to_str()
        .map_err(|_| AuthError::MissingHeader(display))
}

fn insert_lossy(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let value = HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""));
    headers.insert(HeaderName::from_static(name), value);
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
