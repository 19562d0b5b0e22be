//! Connection Authentication
//!
//! The relay does not issue credentials. It only turns the token presented
//! on the upgrade request into a user id before a session starts. Tokens are
//! HS256 JWTs carrying a numeric `user_id` claim and an optional `exp`.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::clock::Clock;
use crate::error::AuthError;
use crate::message::UserId;

/// Resolves a presented token to a user id.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

#[derive(Deserialize)]
struct Claims {
    user_id: Option<serde_json::Number>,
    exp: Option<serde_json::Number>,
}

/// Verifies HS256 tokens signed with a shared secret.
pub struct Hs256Authenticator {
    key: hmac::Key,
    clock: Arc<dyn Clock>,
}

impl Hs256Authenticator {
    pub fn new(secret: &[u8], clock: Arc<dyn Clock>) -> Self {
        Hs256Authenticator {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            clock,
        }
    }
}

fn decode_part<T: for<'de> Deserialize<'de>>(part: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed)
}

impl Authenticator for Hs256Authenticator {
    fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };

        let header: Header = decode_part(header_b64)?;
        if header.alg != "HS256" {
            return Err(AuthError::Malformed);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];
        hmac::verify(&self.key, signing_input.as_bytes(), &signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = decode_part(payload_b64)?;
        if let Some(exp) = claims.exp.and_then(|n| n.as_f64()) {
            if (self.clock.now_secs() as f64) >= exp {
                return Err(AuthError::Expired);
            }
        }

        // Issuers may encode the id as a float; accept whole numbers only.
        let user_id = claims.user_id.ok_or(AuthError::MissingClaim)?;
        match user_id.as_i64() {
            Some(id) => Ok(id),
            None => match user_id.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                _ => Err(AuthError::MissingClaim),
            },
        }
    }
}

/// Extracts the token from the `Authorization` header (raw or `Bearer`), or
/// from a `token` query parameter for clients that cannot set headers.
pub fn token_from_request(request: &Request) -> Option<String> {
    if let Some(value) = request
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
    {
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
            .filter(|value| !value.is_empty())
    })
}
