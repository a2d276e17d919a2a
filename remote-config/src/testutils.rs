use crate::protocol::{CONFIG_ENDPOINT, ClientGetConfigsResponse};
use crate::transport::{Transport, TransportError, TransportResponse};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{Value as JsonValue, json};
use std::collections::VecDeque;
use std::sync::Arc;

pub enum MockReply {
    Response(u16, String),
    Failure,
}

/// Transport that records request bodies and replays queued replies. Replies with
/// `200 {}` once the queue is empty.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<JsonValue>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<JsonValue> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, path: &str, body: Vec<u8>) -> Result<TransportResponse, TransportError> {
        assert_eq!(path, CONFIG_ENDPOINT);
        self.requests
            .lock()
            .push(serde_json::from_slice(&body).unwrap());

        match self.replies.lock().pop_front() {
            Some(MockReply::Response(status, body)) => Ok(TransportResponse {
                status: StatusCode::from_u16(status).unwrap(),
                body: body.into_bytes(),
            }),
            Some(MockReply::Failure) => Err(TransportError::InvalidUrl(url::ParseError::EmptyHost)),
            None => Ok(TransportResponse {
                status: StatusCode::OK,
                body: b"{}".to_vec(),
            }),
        }
    }
}

/// Builds poll responses. Each `config` call lists the path in `client_configs`,
/// adds signed metadata for it, and adds its target file.
pub struct ResponseBuilder {
    client_configs: Vec<String>,
    targets: serde_json::Map<String, JsonValue>,
    files: Vec<(String, String)>,
    version: u64,
    backend_state: String,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        ResponseBuilder {
            client_configs: Vec::new(),
            targets: serde_json::Map::new(),
            files: Vec::new(),
            version: 1,
            backend_state: "".into(),
        }
    }

    pub fn config(mut self, path: &str, version: u64, hash: &str, content: Option<JsonValue>) -> Self {
        let raw = content
            .map(|content| STANDARD.encode(content.to_string()))
            .unwrap_or_default();

        self.client_configs.push(path.to_string());
        self.targets.insert(
            path.to_string(),
            json!({
                "custom": {"v": version},
                "hashes": {"sha256": hash},
                "length": raw.len()
            }),
        );
        self.files.push((path.to_string(), raw));
        self
    }

    pub fn without_file(mut self, path: &str) -> Self {
        self.files.retain(|(file_path, _)| file_path != path);
        self
    }

    pub fn without_target(mut self, path: &str) -> Self {
        self.targets.remove(path);
        self
    }

    pub fn targets_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn backend_state(mut self, state: &str) -> Self {
        self.backend_state = state.to_string();
        self
    }

    pub fn to_json(&self) -> JsonValue {
        let signed = json!({
            "signed": {
                "targets": self.targets,
                "version": self.version,
                "custom": {"opaque_backend_state": self.backend_state}
            }
        });

        json!({
            "client_configs": self.client_configs,
            "targets": STANDARD.encode(signed.to_string()),
            "target_files": self
                .files
                .iter()
                .map(|(path, raw)| json!({"path": path, "raw": raw}))
                .collect::<Vec<_>>()
        })
    }

    pub fn build(&self) -> ClientGetConfigsResponse {
        serde_json::from_value(self.to_json()).unwrap()
    }
}
