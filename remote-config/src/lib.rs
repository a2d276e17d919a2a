pub mod capabilities;
pub mod config;
pub mod errors;
pub mod extra_services;
pub mod handler;
pub mod manager;
pub mod metrics_defs;
pub mod priority_merger;
pub mod protocol;
pub mod scheduler;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testutils;

pub use handler::{Ack, BatchHandlerId, BatchUpdate, HandlerError, HandlerResult, ProductHandler};
pub use manager::RemoteConfigManager;
pub use types::{Action, AppliedConfig, ApplyState, ApplyStatus};
