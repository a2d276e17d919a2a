use indexmap::IndexMap;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("poll interval must be positive and finite")]
    InvalidPollInterval,

    #[error("request timeout cannot be 0")]
    InvalidRequestTimeout,

    #[error("service name cannot be empty")]
    EmptyService,
}

/// Remote configuration client settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Agent base URL. Requests go to `<url>/v0.7/config`.
    #[serde(default = "default_url")]
    pub url: Url,
    /// Delay between the end of one poll and the start of the next, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    pub service: String,
    pub env: Option<String>,
    pub app_version: Option<String>,
    /// Generated when not set.
    pub runtime_id: Option<String>,
    #[serde(default)]
    pub tags: IndexMap<String, String>,
    pub repository_url: Option<String>,
    pub commit_sha: Option<String>,
}

const DEFAULT_AGENT_URL: &str = "http://127.0.0.1:8126";

fn default_url() -> Url {
    Url::parse(DEFAULT_AGENT_URL).expect("default agent URL is valid")
}

fn default_poll_interval_secs() -> f64 {
    5.0
}

fn default_request_timeout_secs() -> u64 {
    2
}

impl Config {
    pub fn new(service: &str) -> Self {
        Config {
            url: default_url(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            service: service.to_string(),
            env: None,
            app_version: None,
            runtime_id: None,
            tags: IndexMap::new(),
            repository_url: None,
            commit_sha: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.poll_interval_secs.is_finite() || self.poll_interval_secs <= 0.0 {
            return Err(ValidationError::InvalidPollInterval);
        }
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::InvalidRequestTimeout);
        }
        if self.service.is_empty() {
            return Err(ValidationError::EmptyService);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
