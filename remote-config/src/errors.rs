use thiserror::Error;

/// Errors that abort a single `parse_config` pass. The rendered message is reported
/// to the control plane on the next poll.
#[derive(Error, Debug)]
pub enum RemoteConfigError {
    #[error("Unable to parse path {0}")]
    InvalidPath(String),

    #[error("Unable to find target for path {0}")]
    MissingTarget(String),

    #[error("Unable to find file for path {0}")]
    MissingFile(String),

    #[error("Invalid base64 in {field}: {source}")]
    Base64 {
        field: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Invalid JSON in {field}: {source}")]
    Json {
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid response body: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}
