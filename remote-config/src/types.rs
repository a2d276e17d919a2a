use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;

/// What a product handler is asked to do with a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Apply,
    Unapply,
    Modify,
}

impl Action {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Action::Apply => "apply",
            Action::Unapply => "unapply",
            Action::Modify => "modify",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acknowledgement state of an applied configuration, reported to the control plane
/// as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplyState {
    Unacknowledged = 1,
    Acknowledged = 2,
    Error = 3,
}

impl Serialize for ApplyState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyStatus {
    pub state: ApplyState,
    pub error: String,
}

impl ApplyStatus {
    pub fn unacknowledged() -> Self {
        ApplyStatus {
            state: ApplyState::Unacknowledged,
            error: String::new(),
        }
    }
}

/// Shared between the applied map and any pending acknowledgement, so a late result
/// lands on the record it was issued for. Replacing a record detaches its old cell.
pub(crate) type StatusCell = Arc<Mutex<ApplyStatus>>;

/// A configuration the manager has instructed a handler to apply.
#[derive(Debug, Clone)]
pub struct AppliedConfig {
    pub path: String,
    pub product: String,
    pub id: String,
    pub version: u64,
    pub length: u64,
    pub hashes: IndexMap<String, String>,
    /// Decoded content. `None` for zero-length targets.
    pub file: Option<JsonValue>,
    pub(crate) status: StatusCell,
}

impl AppliedConfig {
    pub fn new(
        path: String,
        product: String,
        id: String,
        version: u64,
        length: u64,
        hashes: IndexMap<String, String>,
        file: Option<JsonValue>,
    ) -> Self {
        AppliedConfig {
            path,
            product,
            id,
            version,
            length,
            hashes,
            file,
            status: Arc::new(Mutex::new(ApplyStatus::unacknowledged())),
        }
    }

    pub fn status(&self) -> ApplyStatus {
        self.status.lock().clone()
    }

    pub fn apply_state(&self) -> ApplyState {
        self.status.lock().state
    }

    pub fn apply_error(&self) -> String {
        self.status.lock().error.clone()
    }

    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(String::as_str)
    }

    pub(crate) fn set_status(&self, status: ApplyStatus) {
        *self.status.lock() = status;
    }

    pub fn descriptor(&self) -> ConfigDescriptor {
        ConfigDescriptor {
            path: self.path.clone(),
            product: self.product.clone(),
            id: self.id.clone(),
            version: self.version,
            file: self.file.clone(),
        }
    }
}

/// Read-only view of a pending change, handed to batch handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDescriptor {
    pub path: String,
    pub product: String,
    pub id: String,
    pub version: u64,
    pub file: Option<JsonValue>,
}
