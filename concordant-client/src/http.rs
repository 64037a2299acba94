//! HTTP client abstraction.
//!
//! The adapter only ever POSTs a JSON body and reads the text reply, so the
//! transport is a one-method trait. [`ReqwestClient`] is the production
//! implementation; [`crate::loopback::LoopbackService`] answers in-process.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{ClientError, ClientResult};

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST a JSON body to `url`, returning the response body.
    async fn post_json(&self, url: &str, body: String) -> ClientResult<String>;
}

/// `reqwest`-backed client.
pub struct ReqwestClient {
    client: reqwest::Client,
    credential: Option<String>,
}

impl ReqwestClient {
    pub fn new(credential: &str, timeout: Duration) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::network_fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            credential: (!credential.is_empty()).then(|| credential.to_string()),
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post_json(&self, url: &str, body: String) -> ClientResult<String> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(credential) = &self.credential {
            request = request.bearer_auth(credential);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                ClientError::network_fatal(format!("invalid request to {url}: {e}"))
            } else {
                ClientError::network(format!("failed to reach {url}: {e}"))
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClientError::network(format!("failed to read body from {url}: {e}")))?;

        if !status.is_success() {
            return Err(ClientError::network(format!(
                "HTTP {} from {url}: {text}",
                status.as_u16()
            )));
        }
        Ok(text)
    }
}
