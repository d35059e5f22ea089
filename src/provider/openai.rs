use crate::credential::Credential;
use crate::error::{Result, SessionError};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

/// The realtime endpoint's SDP offer/answer route.
#[derive(Debug, Clone)]
pub struct HandshakeEndpoint {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HandshakeEndpoint {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            model: model.into(),
        }
    }

    fn request(&self, offer_sdp: &str, credential: &Credential) -> reqwest::Result<reqwest::Request> {
        self.client
            .post(&self.url)
            .query(&[("model", self.model.as_str())])
            .header(AUTHORIZATION, format!("Bearer {}", credential.secret()))
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .build()
    }

    /// Posts the local offer and returns the remote answer SDP.
    pub async fn exchange(&self, offer_sdp: &str, credential: &Credential) -> Result<String> {
        let request = self
            .request(offer_sdp, credential)
            .map_err(|e| SessionError::Negotiation(format!("building handshake request: {}", e)))?;
        log::info!("[openai] posting offer to {} (model={})", self.url, self.model);
        let resp = self
            .client
            .execute(request)
            .await
            .map_err(|e| SessionError::Negotiation(format!("handshake request failed: {}", e)))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| SessionError::Negotiation(format!("reading answer: {}", e)))?;
        if !status.is_success() {
            return Err(SessionError::Negotiation(format!(
                "handshake returned {}: {}",
                status,
                body.trim()
            )));
        }
        validate_answer(body)
    }
}

fn validate_answer(body: String) -> Result<String> {
    if body.trim_start().starts_with("v=0") {
        Ok(body)
    } else {
        Err(SessionError::Negotiation(format!(
            "malformed answer: {:.80}",
            body.trim()
        )))
    }
}
