// Registry of additional service names seen at runtime (for example, services named
// by integrations). The manager re-reads it every time it builds a poll request.
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::sync::Arc;

const MAX_EXTRA_SERVICES: usize = 64;

#[derive(Clone, Default)]
pub struct ExtraServices {
    services: Arc<Mutex<IndexSet<String>>>,
}

impl ExtraServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a service name. Names past the limit are dropped.
    pub fn register(&self, service: &str) {
        let mut services = self.services.lock();
        if services.len() >= MAX_EXTRA_SERVICES && !services.contains(service) {
            tracing::debug!(service, "extra services limit reached, ignoring service");
            return;
        }
        services.insert(service.to_string());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.services.lock().iter().cloned().collect()
    }
}
