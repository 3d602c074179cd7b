use crate::clock::{Clock, SystemClock};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;

const MAX_ID_LEN: usize = 128;

/// The verified part of a session token that the limiter cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Stable user identifier. Never contains `:`.
    pub id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token is not a well formed JWT")]
    Malformed,
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Token signature does not match")]
    BadSignature,
    #[error("Token has expired")]
    Expired,
    #[error("Token carries no usable user id")]
    MissingId,
}

/// Checks a session token and extracts the user it was issued to.
///
/// Issuing tokens is the job of the authentication service; the limiter only reads them.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, TokenError>;
}

/// Verifies HS256 JWTs signed with a shared secret.
///
/// The payload must carry an `id` (number or string). `exp`, when present, is checked against
/// the clock.
pub struct Hs256Verifier {
    secret: Vec<u8>,
    clock: Arc<dyn Clock>,
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    exp: Option<u64>,
}

impl Hs256Verifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn mac(&self) -> Result<Hmac<Sha256>, TokenError> {
        Hmac::<Sha256>::new_from_slice(&self.secret).map_err(|_| TokenError::BadSignature)
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
}

fn user_id(value: serde_json::Value) -> Option<String> {
    let id = match value {
        serde_json::Value::Number(n) if n.is_u64() || n.is_i64() => n.to_string(),
        serde_json::Value::String(s) => s,
        _ => return None,
    };
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    valid.then_some(id)
}

impl TokenVerifier for Hs256Verifier {
    fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Malformed);
        };

        let parsed: Header = decode_segment(header)?;
        if parsed.alg != "HS256" {
            return Err(TokenError::UnsupportedAlgorithm(parsed.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let payload: Payload = decode_segment(payload)?;
        if let Some(exp) = payload.exp {
            if exp.saturating_mul(1000) <= self.clock.now_ms() {
                return Err(TokenError::Expired);
            }
        }
        let id = payload
            .id
            .and_then(user_id)
            .ok_or(TokenError::MissingId)?;
        Ok(Claims { id })
    }
}

/// Produce an HS256 token the way the authentication service would.
#[cfg(test)]
pub(crate) fn sign_for_tests(secret: &str, payload: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{header}.{payload}").as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{header}.{payload}.{signature}")
}
