//! Connection URL providers
//!
//! The evaluation endpoint authenticates the WebSocket handshake through query
//! parameters signed with HMAC-SHA256. Signing needs the API secret, so it is
//! one [`UrlProvider`] among others: a session can just as well use a URL
//! minted by a trusted backend, keeping the secret off the client entirely.
//!
//! # Signing Scheme
//!
//! ```text
//! date          = RFC-1123 timestamp
//! signature     = base64(hmac_sha256(secret, "host: {host}\ndate: {date}\nGET {path} HTTP/1.1"))
//! authorization = base64('api_key="..", algorithm="hmac-sha256", headers="host date request-line", signature=".."')
//! url           = wss://{host}{path}?authorization=..&date=..&host=..
//! ```

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::config::IseConfig;
use crate::error::IseError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "hmac-sha256";
const SIGNED_HEADERS: &str = "host date request-line";

/// Timeout for fetching a URL from a backend
const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Format a timestamp the way the signing string expects (`Tue, 30 Aug 2022 08:00:00 GMT`)
pub fn rfc1123_date(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Build an authenticated connection URL.
///
/// Deterministic: the same inputs always produce the same URL.
pub fn sign(
    host: &str,
    path: &str,
    api_key: &str,
    api_secret: &str,
    timestamp: DateTime<Utc>,
) -> Result<String, IseError> {
    if api_key.is_empty() || api_secret.is_empty() {
        return Err(IseError::Config(
            "apiKey and apiSecret must not be empty".to_string(),
        ));
    }

    let date = rfc1123_date(timestamp);
    let signature_origin = format!("host: {}\ndate: {}\nGET {} HTTP/1.1", host, date, path);

    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .map_err(|e| IseError::Config(format!("invalid apiSecret: {}", e)))?;
    mac.update(signature_origin.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let authorization_origin = format!(
        "api_key=\"{}\", algorithm=\"{}\", headers=\"{}\", signature=\"{}\"",
        api_key, ALGORITHM, SIGNED_HEADERS, signature
    );
    let authorization = STANDARD.encode(authorization_origin);

    Ok(format!(
        "wss://{}{}?authorization={}&date={}&host={}",
        host,
        path,
        urlencoding::encode(&authorization),
        urlencoding::encode(&date),
        urlencoding::encode(host)
    ))
}

/// Strategy for obtaining the WebSocket URL a session connects to.
///
/// Resolved once per session, right before the transport is opened.
#[async_trait]
pub trait UrlProvider: Send + Sync {
    async fn connection_url(&self) -> Result<String, IseError>;
}

/// Signs URLs locally with the API key/secret pair and the system clock
#[derive(Clone)]
pub struct LocalSigner {
    host: String,
    path: String,
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("host", &self.host)
            .field("path", &self.path)
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl LocalSigner {
    /// Fails with `IseError::Config` when either credential is empty.
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Result<Self, IseError> {
        let signer = Self {
            host: host.into(),
            path: path.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        };
        if signer.api_key.is_empty() || signer.api_secret.is_empty() {
            return Err(IseError::Config(
                "apiKey and apiSecret must not be empty".to_string(),
            ));
        }
        Ok(signer)
    }

    pub fn from_config(config: &IseConfig) -> Result<Self, IseError> {
        Self::new(
            config.host.clone(),
            config.path.clone(),
            config.api_key.clone(),
            config.api_secret.clone(),
        )
    }

    /// Sign for an explicit timestamp
    pub fn sign_at(&self, timestamp: DateTime<Utc>) -> Result<String, IseError> {
        sign(
            &self.host,
            &self.path,
            &self.api_key,
            &self.api_secret,
            timestamp,
        )
    }
}

#[async_trait]
impl UrlProvider for LocalSigner {
    async fn connection_url(&self) -> Result<String, IseError> {
        self.sign_at(Utc::now())
    }
}

/// A URL obtained elsewhere, used as-is
#[derive(Debug, Clone)]
pub struct FixedUrl(pub String);

#[async_trait]
impl UrlProvider for FixedUrl {
    async fn connection_url(&self) -> Result<String, IseError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct BackendUrlResponse {
    url: String,
}

/// Fetches a ready-made connection URL from a trusted backend.
///
/// The backend answers `GET {endpoint}` with either `{"url": "wss://..."}` or
/// the bare URL as text.
#[derive(Debug, Clone)]
pub struct BackendUrlProvider {
    endpoint: String,
    client: reqwest::Client,
}

impl BackendUrlProvider {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, IseError> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(IseError::Config(
                "backend endpoint must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(BACKEND_TIMEOUT)
            .build()
            .map_err(|e| IseError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl UrlProvider for BackendUrlProvider {
    async fn connection_url(&self) -> Result<String, IseError> {
        log::debug!("Fetching connection URL from {}", self.endpoint);

        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| IseError::Transport(format!("backend request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IseError::Transport(format!(
                "backend returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| IseError::Transport(format!("backend body unreadable: {}", e)))?;

        parse_backend_body(&body)
    }
}

fn parse_backend_body(body: &str) -> Result<String, IseError> {
    let body = body.trim();
    let url = if body.starts_with('{') {
        serde_json::from_str::<BackendUrlResponse>(body)
            .map_err(|e| IseError::Transport(format!("backend response malformed: {}", e)))?
            .url
    } else {
        body.to_string()
    };

    if url.starts_with("wss://") || url.starts_with("ws://") {
        Ok(url)
    } else {
        Err(IseError::Transport(
            "backend did not return a WebSocket URL".to_string(),
        ))
    }
}
