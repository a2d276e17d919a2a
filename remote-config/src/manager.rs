//! The remote configuration client.
//!
//! `RemoteConfigManager` owns everything a poll needs. While at least one product is
//! subscribed it polls the agent, diffs the response against its applied map, and
//! hands the changes to product handlers. Handler results are reported back to the
//! agent on the following poll through `config_states`.

use crate::capabilities::Capabilities;
use crate::config::Config;
use crate::errors::RemoteConfigError;
use crate::extra_services::ExtraServices;
use crate::handler::{
    BatchHandler, BatchHandlerId, BatchOutcomes, BatchUpdate, ProductHandler, panic_message, track,
};
use crate::metrics_defs::{DISPATCH_COUNT, PARSE_ERRORS, POLL_COUNT, POLL_DURATION, POLL_ERRORS};
use crate::protocol::{
    CONFIG_ENDPOINT, CachedTargetFile, Client, ClientGetConfigsRequest, ClientGetConfigsResponse,
    ClientState, ClientTracer, ConfigPath, ConfigState, TargetMeta, decode_target_file,
    decode_targets,
};
use crate::scheduler::Scheduler;
use crate::transport::{HttpTransport, Transport};
use crate::types::{Action, AppliedConfig, ApplyState};
use indexmap::{IndexMap, IndexSet};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;
use uuid::Uuid;

const ROOT_VERSION: u64 = 1;
const LANGUAGE: &str = "rust";
const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");
const CLIENT_ID_TAG: &str = "_dd.rc.client_id";

/// Fixed for the lifetime of a manager.
#[derive(Debug)]
struct Identity {
    id: String,
    runtime_id: String,
    service: String,
    env: Option<String>,
    app_version: Option<String>,
    tags: Vec<String>,
}

impl Identity {
    fn from_config(config: &Config) -> Self {
        let id = Uuid::new_v4().to_string();
        let runtime_id = config
            .runtime_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut tags: Vec<String> = config
            .tags
            .iter()
            .map(|(key, value)| format!("{key}:{value}"))
            .collect();
        tags.push(format!("{CLIENT_ID_TAG}:{id}"));
        if let Some(repository_url) = &config.repository_url {
            tags.push(format!("git.repository_url:{repository_url}"));
            if let Some(commit_sha) = &config.commit_sha {
                tags.push(format!("git.commit.sha:{commit_sha}"));
            }
        }

        Identity {
            id,
            runtime_id,
            service: config.service.clone(),
            env: config.env.clone(),
            app_version: config.app_version.clone(),
            tags,
        }
    }
}

struct RegisteredBatchHandler {
    id: BatchHandlerId,
    products: HashSet<String>,
    handler: BatchHandler,
}

struct ManagerState {
    capabilities: Capabilities,
    products: IndexSet<String>,
    handlers: HashMap<String, ProductHandler>,
    batch_handlers: Vec<RegisteredBatchHandler>,
    next_batch_handler_id: u64,
    targets_version: u64,
    backend_client_state: String,
    has_error: bool,
    error: String,
    // Ordered as the last `client_configs` listed them.
    applied: IndexMap<String, AppliedConfig>,
    cached_target_files: Vec<CachedTargetFile>,
}

/// One parse's worth of changes.
#[derive(Default)]
struct Changes {
    to_unapply: Vec<AppliedConfig>,
    to_apply: Vec<AppliedConfig>,
    to_modify: Vec<AppliedConfig>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.to_unapply.is_empty() && self.to_apply.is_empty() && self.to_modify.is_empty()
    }

    fn records(&self) -> impl Iterator<Item = &AppliedConfig> {
        self.to_unapply
            .iter()
            .chain(&self.to_apply)
            .chain(&self.to_modify)
    }
}

impl ManagerState {
    fn new() -> Self {
        ManagerState {
            capabilities: Capabilities::new(),
            products: IndexSet::new(),
            handlers: HashMap::new(),
            batch_handlers: Vec::new(),
            next_batch_handler_id: 0,
            targets_version: 0,
            backend_client_state: String::new(),
            has_error: false,
            error: String::new(),
            applied: IndexMap::new(),
            cached_target_files: Vec::new(),
        }
    }

    /// Validates every listed path and computes the changes against the applied map.
    /// Nothing is modified, so a failure leaves the manager exactly as it was.
    fn diff(
        &self,
        client_configs: &[String],
        targets: &HashMap<String, TargetMeta>,
        response: &ClientGetConfigsResponse,
    ) -> Result<Changes, RemoteConfigError> {
        let mut changes = Changes::default();
        let mut listed: HashSet<&str> = HashSet::new();

        for path in client_configs {
            if !listed.insert(path.as_str()) {
                continue;
            }

            let ConfigPath { product, id } = path.parse()?;
            let meta = targets
                .get(path)
                .ok_or_else(|| RemoteConfigError::MissingTarget(path.clone()))?;

            let current = self.applied.get(path);
            if let Some(current) = current
                && current.sha256() == meta.sha256()
            {
                continue;
            }

            let file = if meta.length == 0 {
                None
            } else {
                let target_file = response
                    .find_file(path)
                    .ok_or_else(|| RemoteConfigError::MissingFile(path.clone()))?;
                decode_target_file(target_file)?
            };

            let record = AppliedConfig::new(
                path.clone(),
                product,
                id,
                meta.custom.v,
                meta.length,
                meta.hashes.clone(),
                file,
            );
            if current.is_some() {
                changes.to_modify.push(record);
            } else {
                changes.to_apply.push(record);
            }
        }

        changes.to_unapply = self
            .applied
            .values()
            .filter(|config| !listed.contains(config.path.as_str()))
            .cloned()
            .collect();

        Ok(changes)
    }

    fn client_state(&self) -> ClientState {
        ClientState {
            root_version: ROOT_VERSION,
            targets_version: self.targets_version,
            config_states: self.applied.values().map(ConfigState::from).collect(),
            has_error: self.has_error,
            error: self.error.clone(),
            backend_client_state: self.backend_client_state.clone(),
        }
    }

    fn reorder_applied(&mut self, client_configs: &[String]) {
        let mut ordered = IndexMap::with_capacity(self.applied.len());
        for path in client_configs {
            if let Some((path, config)) = self.applied.shift_remove_entry(path) {
                ordered.insert(path, config);
            }
        }
        ordered.extend(self.applied.drain(..));
        self.applied = ordered;

        self.cached_target_files = self.applied.values().map(CachedTargetFile::from).collect();
    }
}

struct ManagerInner {
    identity: Identity,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    extra_services: ExtraServices,
    state: Mutex<ManagerState>,
}

/// Cheap to clone. All clones share state and the poll loop.
#[derive(Clone)]
pub struct RemoteConfigManager {
    inner: Arc<ManagerInner>,
}

impl RemoteConfigManager {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let interval = config.poll_interval();
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let weak = weak.clone();
            let scheduler = Scheduler::new(
                move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            RemoteConfigManager { inner }.poll().await;
                        }
                    }
                },
                interval,
            );

            ManagerInner {
                identity: Identity::from_config(config),
                transport,
                scheduler,
                extra_services: ExtraServices::new(),
                state: Mutex::new(ManagerState::new()),
            }
        });

        RemoteConfigManager { inner }
    }

    /// Builds a manager that talks to the agent at `config.url` over HTTP.
    pub fn with_http_transport(config: &Config) -> Self {
        let transport = HttpTransport::new(config.url.clone(), config.request_timeout());
        Self::new(config, Arc::new(transport))
    }

    pub fn client_id(&self) -> &str {
        &self.inner.identity.id
    }

    pub fn runtime_id(&self) -> &str {
        &self.inner.identity.runtime_id
    }

    pub fn extra_services(&self) -> &ExtraServices {
        &self.inner.extra_services
    }

    pub fn update_capabilities(&self, bit: u32, enabled: bool) {
        self.inner.state.lock().capabilities.set(bit, enabled);
    }

    /// Current capability mask, base64 encoded.
    pub fn capabilities(&self) -> String {
        self.inner.state.lock().capabilities.encode()
    }

    /// Registers `handler` for `product` and subscribes to it, replacing any handler
    /// already registered for that product.
    pub fn set_product_handler(&self, product: &str, handler: ProductHandler) {
        self.inner
            .state
            .lock()
            .handlers
            .insert(product.to_string(), handler);
        self.subscribe_products([product]);
    }

    pub fn remove_product_handler(&self, product: &str) {
        self.inner.state.lock().handlers.remove(product);
        self.unsubscribe_products([product]);
    }

    /// Adds products to the poll request without a handler. The first subscribed
    /// product starts polling.
    pub fn subscribe_products<I, S>(&self, products: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let has_products = {
            let mut state = self.inner.state.lock();
            state.products.extend(products.into_iter().map(Into::into));
            !state.products.is_empty()
        };

        if has_products {
            self.inner.scheduler.start();
        }
    }

    /// Removes products from the poll request. Polling stops when none are left.
    pub fn unsubscribe_products<I, S>(&self, products: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let has_products = {
            let mut state = self.inner.state.lock();
            for product in products {
                state.products.shift_remove(product.as_ref());
            }
            !state.products.is_empty()
        };

        if !has_products {
            self.inner.scheduler.stop();
        }
    }

    pub fn products(&self) -> Vec<String> {
        self.inner.state.lock().products.iter().cloned().collect()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    /// Registers a handler that sees each parse's changes for `products` before the
    /// per-product handlers do.
    pub fn set_batch_handler<I, S, F>(&self, products: I, handler: F) -> BatchHandlerId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&mut BatchUpdate<'_>) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        let id = BatchHandlerId(state.next_batch_handler_id);
        state.next_batch_handler_id += 1;
        state.batch_handlers.push(RegisteredBatchHandler {
            id,
            products: products.into_iter().map(Into::into).collect(),
            handler: Arc::new(handler),
        });
        id
    }

    pub fn remove_batch_handler(&self, id: BatchHandlerId) {
        self.inner
            .state
            .lock()
            .batch_handlers
            .retain(|registered| registered.id != id);
    }

    pub fn applied_config(&self, path: &str) -> Option<AppliedConfig> {
        self.inner.state.lock().applied.get(path).cloned()
    }

    pub fn applied_configs(&self) -> Vec<AppliedConfig> {
        self.inner.state.lock().applied.values().cloned().collect()
    }

    pub fn client_state(&self) -> ClientState {
        self.inner.state.lock().client_state()
    }

    pub fn config_states(&self) -> Vec<ConfigState> {
        self.inner
            .state
            .lock()
            .applied
            .values()
            .map(ConfigState::from)
            .collect()
    }

    pub fn cached_target_files(&self) -> Vec<CachedTargetFile> {
        self.inner.state.lock().cached_target_files.clone()
    }

    /// The error reported on the next poll, if the last response failed to parse.
    pub fn last_error(&self) -> Option<String> {
        let state = self.inner.state.lock();
        state.has_error.then(|| state.error.clone())
    }

    pub fn targets_version(&self) -> u64 {
        self.inner.state.lock().targets_version
    }

    pub fn backend_client_state(&self) -> String {
        self.inner.state.lock().backend_client_state.clone()
    }

    /// Builds the request body for the next poll from the current state.
    pub fn request(&self) -> ClientGetConfigsRequest {
        let extra_services = self.inner.extra_services.snapshot();
        let identity = &self.inner.identity;
        let state = self.inner.state.lock();

        ClientGetConfigsRequest {
            client: Client {
                state: state.client_state(),
                id: identity.id.clone(),
                products: state.products.iter().cloned().collect(),
                is_tracer: true,
                client_tracer: ClientTracer {
                    runtime_id: identity.runtime_id.clone(),
                    language: LANGUAGE.to_string(),
                    tracer_version: TRACER_VERSION.to_string(),
                    service: identity.service.clone(),
                    env: identity.env.clone(),
                    app_version: identity.app_version.clone(),
                    extra_services,
                    tags: identity.tags.clone(),
                },
                capabilities: state.capabilities.clone(),
            },
            cached_target_files: state.cached_target_files.clone(),
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.request())
    }

    /// Runs one poll cycle. Transport failures and bad statuses are logged and
    /// counted; parse failures are also reported on the next poll.
    pub async fn poll(&self) {
        counter!(POLL_COUNT.name).increment(1);

        let body = match self.payload() {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize remote config request");
                return;
            }
        };

        let started = Instant::now();
        let result = self.inner.transport.send(CONFIG_ENDPOINT, body).await;
        histogram!(POLL_DURATION.name).record(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                counter!(POLL_ERRORS.name).increment(1);
                tracing::warn!(error = %err, "remote config request failed");
                return;
            }
        };

        if response.status == StatusCode::NOT_FOUND {
            tracing::debug!("agent does not support remote configuration");
            return;
        }

        if !response.status.is_success() {
            counter!(POLL_ERRORS.name).increment(1);
            tracing::warn!(status = %response.status, "unexpected status from remote config endpoint");
            return;
        }

        self.handle_response(&response.body);
    }

    fn handle_response(&self, body: &[u8]) {
        if is_empty_response(body) {
            tracing::trace!("no remote config changes");
            return;
        }

        {
            let mut state = self.inner.state.lock();
            state.has_error = false;
            state.error.clear();
        }

        let result = ClientGetConfigsResponse::from_bytes(body)
            .map_err(RemoteConfigError::from)
            .and_then(|response| self.parse_config(&response));

        if let Err(err) = result {
            counter!(PARSE_ERRORS.name).increment(1);
            tracing::error!(error = %err, "could not parse remote config response");

            let mut state = self.inner.state.lock();
            state.has_error = true;
            state.error = err.to_string();
        }
    }

    /// Applies a poll response. Every path is validated before anything changes: on
    /// error the applied map, versions, and backend state are left untouched.
    pub fn parse_config(&self, response: &ClientGetConfigsResponse) -> Result<(), RemoteConfigError> {
        let Some(client_configs) = response.client_configs.as_deref() else {
            return Ok(());
        };

        let signed = match response.targets.as_deref() {
            Some(raw) => decode_targets(raw)?,
            None => None,
        };
        let no_targets = HashMap::new();
        let targets = signed.as_ref().map_or(&no_targets, |signed| &signed.targets);

        let (changes, batch_handlers) = {
            let mut state = self.inner.state.lock();
            let changes = state.diff(client_configs, targets, response)?;

            if let Some(signed) = &signed {
                state.targets_version = signed.version;
                state.backend_client_state = signed.custom.opaque_backend_state.clone();
            }

            let batch_handlers: Vec<(HashSet<String>, BatchHandler)> = state
                .batch_handlers
                .iter()
                .map(|registered| (registered.products.clone(), registered.handler.clone()))
                .collect();
            (changes, batch_handlers)
        };

        let outcomes = run_batch_handlers(&batch_handlers, &changes);
        for record in changes.records() {
            if let Some(status) = outcomes.statuses.get(&record.path) {
                record.set_status(status.clone());
            }
        }

        self.dispatch(changes.to_unapply, Action::Unapply, &outcomes.handled);
        self.dispatch(changes.to_apply, Action::Apply, &outcomes.handled);
        self.dispatch(changes.to_modify, Action::Modify, &outcomes.handled);

        self.inner.state.lock().reorder_applied(client_configs);
        Ok(())
    }

    /// Commits `records` to the applied map, then invokes the product handler for
    /// each one that still needs it.
    ///
    /// A record is skipped when a batch handler claimed it, when no handler is
    /// registered for its product, or, for apply and modify, when it is no longer
    /// unacknowledged.
    pub(crate) fn dispatch(&self, records: Vec<AppliedConfig>, action: Action, handled: &HashSet<String>) {
        let mut invocations = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for record in records {
                match action {
                    Action::Unapply => {
                        state.applied.shift_remove(&record.path);
                    }
                    Action::Apply | Action::Modify => {
                        state.applied.insert(record.path.clone(), record.clone());
                    }
                }

                if handled.contains(&record.path) {
                    continue;
                }
                if action != Action::Unapply && record.apply_state() != ApplyState::Unacknowledged {
                    continue;
                }

                match state.handlers.get(&record.product) {
                    Some(handler) => invocations.push((handler.clone(), record)),
                    None => tracing::debug!(
                        product = %record.product,
                        path = %record.path,
                        "no handler registered for product"
                    ),
                }
            }
        }

        // Handlers run without the state lock so they can call back into the manager.
        for (handler, record) in invocations {
            counter!(DISPATCH_COUNT.name, "action" => action.as_str()).increment(1);
            tracing::debug!(%action, path = %record.path, "dispatching configuration");

            let outcome = handler.invoke(action, record.file.clone(), record.id.clone());
            track(record.status.clone(), outcome);
        }
    }
}

fn is_empty_response(body: &[u8]) -> bool {
    if body.iter().all(u8::is_ascii_whitespace) {
        return true;
    }
    matches!(
        serde_json::from_slice::<JsonValue>(body),
        Ok(JsonValue::Object(map)) if map.is_empty()
    )
}

fn run_batch_handlers(
    batch_handlers: &[(HashSet<String>, BatchHandler)],
    changes: &Changes,
) -> BatchOutcomes {
    let mut outcomes = BatchOutcomes::default();
    if changes.is_empty() {
        return outcomes;
    }

    for (products, handler) in batch_handlers {
        let select = |records: &[AppliedConfig]| {
            records
                .iter()
                .filter(|record| products.contains(&record.product))
                .map(AppliedConfig::descriptor)
                .collect::<Vec<_>>()
        };

        let mut update = BatchUpdate::new(
            select(&changes.to_unapply),
            select(&changes.to_apply),
            select(&changes.to_modify),
            &mut outcomes,
        );
        if !update.is_empty() {
            // Outcomes recorded before a panic are kept.
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut update))) {
                tracing::error!(error = %panic_message(payload.as_ref()), "batch handler panicked");
            }
        }
    }

    outcomes
}
