use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// Sends one poll request to the agent and returns whatever came back. Status
/// handling is left to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, path: &str, body: Vec<u8>) -> Result<TransportResponse, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
            base_url,
            timeout,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, path: &str, body: Vec<u8>) -> Result<TransportResponse, TransportError> {
        let url = self.base_url.join(path)?;

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?.to_vec();

        Ok(TransportResponse { status, body })
    }
}
