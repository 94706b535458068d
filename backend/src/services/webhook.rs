// Webhook Delivery - Signed outbound HTTP callbacks

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::workflows::actions::SignatureAlgorithm;

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Compass-Signature";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid signing key")]
    InvalidKey,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct WebhookRequest<'a> {
    pub url: &'a str,
    pub payload: &'a serde_json::Value,
    pub headers: &'a HashMap<String, String>,
    pub secret: Option<&'a str>,
    pub algorithm: SignatureAlgorithm,
    pub signature_header: Option<&'a str>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    default_timeout: Duration,
    signature_header: String,
}

impl WebhookClient {
    pub fn new(default_timeout: Duration, signature_header: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout,
            signature_header: signature_header.into(),
        }
    }

    /// Hex HMAC of `body` with `secret`.
    pub fn sign(secret: &str, body: &[u8], algorithm: SignatureAlgorithm) -> Result<String, WebhookError> {
        match algorithm {
            SignatureAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                    .map_err(|_| WebhookError::InvalidKey)?;
                mac.update(body);
                Ok(hex::encode(mac.finalize().into_bytes()))
            }
            SignatureAlgorithm::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
                    .map_err(|_| WebhookError::InvalidKey)?;
                mac.update(body);
                Ok(hex::encode(mac.finalize().into_bytes()))
            }
        }
    }

    pub async fn deliver(&self, request: WebhookRequest<'_>) -> Result<WebhookResponse, WebhookError> {
        let body = serde_json::to_vec(request.payload)?;

        let mut builder = self
            .client
            .post(request.url)
            .timeout(request.timeout.unwrap_or(self.default_timeout))
            .header("Content-Type", "application/json");

        for (key, value) in request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        if let Some(secret) = request.secret.filter(|s| !s.is_empty()) {
            let signature = Self::sign(secret, &body, request.algorithm)?;
            let header = request.signature_header.unwrap_or(self.signature_header.as_str());
            builder = builder.header(header, signature);
        }

        let response = builder.body(body).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        let response = WebhookResponse { status, body };
        if response.is_success() {
            info!("Webhook delivered to {} ({})", request.url, status);
        } else {
            warn!("Webhook to {} returned {}", request.url, status);
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_signature_is_stable() {
        let a = WebhookClient::sign("secret", b"{\"id\":1}", SignatureAlgorithm::Sha256).unwrap();
        let b = WebhookClient::sign("secret", b"{\"id\":1}", SignatureAlgorithm::Sha256).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_sha1_signature_length() {
        let sig = WebhookClient::sign("secret", b"payload", SignatureAlgorithm::Sha1).unwrap();
        assert_eq!(sig.len(), 40);
    }

    #[test]
    fn test_key_changes_signature() {
        let a = WebhookClient::sign("one", b"payload", SignatureAlgorithm::Sha256).unwrap();
        let b = WebhookClient::sign("two", b"payload", SignatureAlgorithm::Sha256).unwrap();
        assert_ne!(a, b);
    }
}
