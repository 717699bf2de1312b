//! Challenge/response login against the HTTP endpoint.
//!
//! The agent posts its username and public key, receives a challenge
//! encrypted to that key, and proves possession of the private key by
//! returning the hash of the plaintext together with a signature over it.
//! A successful exchange yields the session cookie used by the transport.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, SET_COOKIE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use telemetra_core::PROTOCOL_VERSION;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("access denied")]
    AccessDenied,
    #[error("unexpected login response: {0}")]
    UnexpectedResponse(String),
    #[error("key operation failed: {0}")]
    Key(String),
    #[error("login request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Private key operations the login handshake needs.
pub trait KeyManager: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, AuthError>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, AuthError>;
    /// Public key in OpenSSH `ssh-rsa AAAA...` form.
    fn serialize_public_key(&self) -> Result<String, AuthError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub cookie: String,
}

pub trait Authenticator: Send + Sync {
    fn login(&self) -> BoxFuture<'_, Result<Credentials, AuthError>>;
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    challenge: String,
}

/// Proof for a base64 `challenge`: the base64 SHA-256 of the decrypted
/// plaintext and the base64 signature of that string.
pub fn answer_challenge(keys: &dyn KeyManager, challenge: &str) -> Result<(String, String), AuthError> {
    let encrypted = BASE64
        .decode(challenge.trim())
        .map_err(|err| AuthError::UnexpectedResponse(format!("challenge is not base64: {err}")))?;
    let plaintext = keys.decrypt(&encrypted)?;
    let proof = BASE64.encode(Sha256::digest(&plaintext));
    let signature = BASE64.encode(keys.sign(proof.as_bytes())?);
    Ok((proof, signature))
}

/// `name=value` pairs of every `Set-Cookie` header, joined for a `Cookie`
/// request header.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect();
    (!pairs.is_empty()).then(|| pairs.join("; "))
}

const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpAuthenticator {
    client: reqwest::Client,
    url: Url,
    username: String,
    keys: Arc<dyn KeyManager>,
    timeout: Duration,
}

impl HttpAuthenticator {
    pub fn new(url: Url, username: impl Into<String>, keys: Arc<dyn KeyManager>) -> Self {
        HttpAuthenticator {
            client: reqwest::Client::new(),
            url,
            username: username.into(),
            keys,
            timeout: LOGIN_TIMEOUT,
        }
    }

    /// Bounds each login request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn handshake(&self) -> Result<Credentials, AuthError> {
        let public_key = BASE64.encode(self.keys.serialize_public_key()?);
        let hello = json!({
            "u": self.username,
            "k": public_key,
            "pv": PROTOCOL_VERSION,
        });
        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&hello)
            .send()
            .await?;
        check_status(response.status())?;
        let challenge: ChallengeResponse = response
            .json()
            .await
            .map_err(|err| AuthError::UnexpectedResponse(err.to_string()))?;
        debug!(username = %self.username, "auth.challenge_received");

        let (proof, signature) = answer_challenge(self.keys.as_ref(), &challenge.challenge)?;
        let answer = json!({
            "u": self.username,
            "k": public_key,
            "pv": PROTOCOL_VERSION,
            "c": proof,
            "s": signature,
        });
        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&answer)
            .send()
            .await?;
        check_status(response.status())?;
        let cookie = session_cookie(response.headers())
            .ok_or_else(|| AuthError::UnexpectedResponse("no session cookie".into()))?;
        info!(username = %self.username, "auth.logged_in");
        Ok(Credentials { cookie })
    }
}

fn check_status(status: StatusCode) -> Result<(), AuthError> {
    match status {
        StatusCode::FORBIDDEN => Err(AuthError::AccessDenied),
        status if status.is_success() => Ok(()),
        status => Err(AuthError::UnexpectedResponse(format!("status {status}"))),
    }
}

impl Authenticator for HttpAuthenticator {
    fn login(&self) -> BoxFuture<'_, Result<Credentials, AuthError>> {
        self.handshake().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    /// Reverses bytes for "decryption" and prefixes signatures.
    struct MirrorKeys;

    impl KeyManager for MirrorKeys {
        fn sign(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
            let mut signed = b"sig:".to_vec();
            signed.extend_from_slice(data);
            Ok(signed)
        }

        fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
            Ok(data.iter().rev().copied().collect())
        }

        fn serialize_public_key(&self) -> Result<String, AuthError> {
            Ok("ssh-rsa AAAA".into())
        }
    }

    #[test]
    fn challenge_answer_hashes_plaintext_and_signs_proof() {
        let challenge = BASE64.encode(b"terces");
        let (proof, signature) = answer_challenge(&MirrorKeys, &challenge).expect("answer");
        assert_eq!(proof, BASE64.encode(Sha256::digest(b"secret")));
        let signature = BASE64.decode(signature).expect("base64");
        assert_eq!(signature, [b"sig:".as_slice(), proof.as_bytes()].concat());
    }

    #[test]
    fn malformed_challenge_is_rejected() {
        assert!(matches!(
            answer_challenge(&MirrorKeys, "***"),
            Err(AuthError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn cookie_pairs_are_collected() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc; Path=/; HttpOnly"));
        headers.append(SET_COOKIE, HeaderValue::from_static("lb=2"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("sid=abc; lb=2"));
        assert_eq!(session_cookie(&HeaderMap::new()), None);
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(check_status(StatusCode::FORBIDDEN), Err(AuthError::AccessDenied)));
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(matches!(
            check_status(StatusCode::BAD_GATEWAY),
            Err(AuthError::UnexpectedResponse(_))
        ));
    }
}
