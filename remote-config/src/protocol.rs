//! Wire types for the remote configuration endpoint (`/v0.7/config`).
//!
//! The client POSTs a `ClientGetConfigsRequest` describing what it currently has
//! applied. The response is either `{}` (nothing changed) or a bundle of:
//! - `client_configs`: the paths the client should have applied now,
//! - `targets`: base64 encoded JSON signed metadata for each path,
//! - `target_files`: base64 encoded JSON content of new or changed paths.

use crate::capabilities::Capabilities;
use crate::errors::RemoteConfigError;
use crate::types::{AppliedConfig, ApplyState};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;

pub const CONFIG_ENDPOINT: &str = "/v0.7/config";

#[derive(Debug, Clone, Serialize)]
pub struct ClientGetConfigsRequest {
    pub client: Client,
    pub cached_target_files: Vec<CachedTargetFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Client {
    pub state: ClientState,
    pub id: String,
    pub products: Vec<String>,
    pub is_tracer: bool,
    pub client_tracer: ClientTracer,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientState {
    pub root_version: u64,
    pub targets_version: u64,
    pub config_states: Vec<ConfigState>,
    pub has_error: bool,
    pub error: String,
    pub backend_client_state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientTracer {
    pub runtime_id: String,
    pub language: String,
    pub tracer_version: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    pub extra_services: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigState {
    pub id: String,
    pub version: u64,
    pub product: String,
    pub apply_state: ApplyState,
    pub apply_error: String,
}

impl From<&AppliedConfig> for ConfigState {
    fn from(config: &AppliedConfig) -> Self {
        let status = config.status();
        ConfigState {
            id: config.id.clone(),
            version: config.version,
            product: config.product.clone(),
            apply_state: status.state,
            apply_error: status.error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedTargetFile {
    pub path: String,
    pub length: u64,
    pub hashes: Vec<TargetFileHash>,
}

impl From<&AppliedConfig> for CachedTargetFile {
    fn from(config: &AppliedConfig) -> Self {
        CachedTargetFile {
            path: config.path.clone(),
            length: config.length,
            hashes: config
                .hashes
                .iter()
                .map(|(algorithm, hash)| TargetFileHash {
                    algorithm: algorithm.clone(),
                    hash: hash.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFileHash {
    pub algorithm: String,
    pub hash: String,
}

/// Response body. `client_configs` is kept optional: a body without it is a no-op,
/// which is different from an empty list (unapply everything).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientGetConfigsResponse {
    #[serde(default)]
    pub client_configs: Option<Vec<String>>,
    #[serde(default)]
    pub targets: Option<String>,
    #[serde(default)]
    pub target_files: Vec<TargetFile>,
}

impl ClientGetConfigsResponse {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn find_file(&self, path: &str) -> Option<&TargetFile> {
        self.target_files.iter().find(|file| file.path == path)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetFile {
    pub path: String,
    #[serde(default)]
    pub raw: String,
}

#[derive(Debug, Deserialize)]
struct TargetsEnvelope {
    signed: SignedTargets,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignedTargets {
    #[serde(default)]
    pub targets: HashMap<String, TargetMeta>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub custom: TargetsCustom,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetsCustom {
    #[serde(default)]
    pub opaque_backend_state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetMeta {
    pub custom: TargetMetaCustom,
    pub hashes: IndexMap<String, String>,
    pub length: u64,
}

impl TargetMeta {
    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetMetaCustom {
    pub v: u64,
}

fn decode_base64_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    field: &str,
) -> Result<Option<T>, RemoteConfigError> {
    if raw.is_empty() {
        return Ok(None);
    }

    let decoded = STANDARD
        .decode(raw.as_bytes())
        .map_err(|source| RemoteConfigError::Base64 {
            field: field.to_string(),
            source,
        })?;

    serde_json::from_slice(&decoded)
        .map(Some)
        .map_err(|source| RemoteConfigError::Json {
            field: field.to_string(),
            source,
        })
}

/// Decodes the `targets` field. An empty string yields `None`.
pub fn decode_targets(raw: &str) -> Result<Option<SignedTargets>, RemoteConfigError> {
    let envelope: Option<TargetsEnvelope> = decode_base64_json(raw, "targets")?;
    Ok(envelope.map(|envelope| envelope.signed))
}

/// Decodes the raw content of a target file. Empty content yields `None`.
pub fn decode_target_file(file: &TargetFile) -> Result<Option<JsonValue>, RemoteConfigError> {
    decode_base64_json(&file.raw, &file.path)
}

/// A configuration path: `datadog/<org_id>/<product>/<config_id>/<name>` or
/// `employee/<product>/<config_id>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPath {
    pub product: String,
    pub id: String,
}

impl FromStr for ConfigPath {
    type Err = RemoteConfigError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let invalid = || RemoteConfigError::InvalidPath(path.to_string());

        let parts: Vec<&str> = path.split('/').collect();
        let rest = match parts.as_slice() {
            ["datadog", org_id, rest @ ..]
                if !org_id.is_empty() && org_id.bytes().all(|b| b.is_ascii_digit()) =>
            {
                rest
            }
            ["employee", rest @ ..] => rest,
            _ => return Err(invalid()),
        };

        match rest {
            [product, id, name] if !product.is_empty() && !id.is_empty() && !name.is_empty() => {
                Ok(ConfigPath {
                    product: product.to_string(),
                    id: id.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }
}
