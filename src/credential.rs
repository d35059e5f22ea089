use crate::error::{Result, SessionError};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;

/// Short-lived bearer token, good for exactly one handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    value: String,
    /// Unix seconds, when the backend reports it.
    pub expires_at: Option<i64>,
}

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    pub fn secret(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of credentials. Called once per connection attempt; tokens are
/// never reused across attempts.
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch_credential(&self) -> Result<Credential>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
}

/// `GET <token_url>` returning `{ "value": "..." }`.
pub struct HttpCredentialFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CredentialFetcher for HttpCredentialFetcher {
    async fn fetch_credential(&self) -> Result<Credential> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SessionError::Credential(format!("{}: {}", self.url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SessionError::Credential(format!(
                "{} returned {}",
                self.url, status
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| SessionError::Credential(format!("reading token body: {}", e)))?;
        let credential = parse_token_body(&body)?;
        log::debug!("[credential] fetched token (expires_at={:?})", credential.expires_at);
        Ok(credential)
    }
}

fn parse_token_body(body: &str) -> Result<Credential> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| SessionError::Credential(format!("malformed token body: {}", e)))?;
    match parsed.value {
        Some(value) if !value.trim().is_empty() => Ok(Credential {
            value,
            expires_at: parsed.expires_at,
        }),
        _ => Err(SessionError::Credential("token body has no value".into())),
    }
}
