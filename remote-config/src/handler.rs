//! Product handlers and the acknowledgement protocol.
//!
//! A handler is registered as one of three kinds, fixed at registration:
//! - `Sync`: returns a `Result`; the record is settled as soon as it returns.
//! - `Deferred`: returns a future; the record stays unacknowledged until it resolves.
//! - `Callback`: receives an `Ack` it must complete, now or later. Dropping the
//!   `Ack` without completing it leaves the record unacknowledged for good.
//!
//! Every kind is invoked through `ProductHandler::invoke`, which produces an
//! `Outcome` that the dispatcher tracks the same way regardless of kind.

use crate::types::{Action, ApplyState, ApplyStatus, ConfigDescriptor, StatusCell};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

type SyncFn = dyn Fn(Action, Option<&JsonValue>, &str) -> HandlerResult + Send + Sync;
type DeferredFn = dyn Fn(Action, Option<JsonValue>, String) -> HandlerFuture + Send + Sync;
type CallbackFn = dyn Fn(Action, Option<JsonValue>, String, Ack) + Send + Sync;

#[derive(Clone)]
pub enum ProductHandler {
    Sync(Arc<SyncFn>),
    Deferred(Arc<DeferredFn>),
    Callback(Arc<CallbackFn>),
}

impl ProductHandler {
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(Action, Option<&JsonValue>, &str) -> HandlerResult + Send + Sync + 'static,
    {
        ProductHandler::Sync(Arc::new(handler))
    }

    pub fn deferred<F, Fut>(handler: F) -> Self
    where
        F: Fn(Action, Option<JsonValue>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        ProductHandler::Deferred(Arc::new(
            move |action: Action, content: Option<JsonValue>, id: String| -> HandlerFuture {
                Box::pin(handler(action, content, id))
            },
        ))
    }

    pub fn callback<F>(handler: F) -> Self
    where
        F: Fn(Action, Option<JsonValue>, String, Ack) + Send + Sync + 'static,
    {
        ProductHandler::Callback(Arc::new(handler))
    }

    /// Calls the handler. A panic while it runs becomes an error outcome.
    pub(crate) fn invoke(&self, action: Action, content: Option<JsonValue>, id: String) -> Outcome {
        let called = panic::catch_unwind(AssertUnwindSafe(|| match self {
            ProductHandler::Sync(handler) => Outcome::Settled(handler(action, content.as_ref(), &id)),
            ProductHandler::Deferred(handler) => Outcome::Deferred(handler(action, content, id.clone())),
            ProductHandler::Callback(handler) => {
                let (tx, rx) = oneshot::channel();
                handler(action, content, id.clone(), Ack { tx });
                Outcome::Awaiting(rx)
            }
        }));

        called.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(%action, %id, error = %message, "product handler panicked");
            Outcome::Settled(Err(format!("handler panicked: {message}").into()))
        })
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for ProductHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ProductHandler::Sync(_) => "Sync",
            ProductHandler::Deferred(_) => "Deferred",
            ProductHandler::Callback(_) => "Callback",
        };
        f.debug_tuple("ProductHandler").field(&kind).finish()
    }
}

/// Completion signal handed to callback handlers.
#[derive(Debug)]
pub struct Ack {
    tx: oneshot::Sender<HandlerResult>,
}

impl Ack {
    pub fn ack(self) {
        self.complete(Ok(()));
    }

    pub fn error<E: Into<HandlerError>>(self, error: E) {
        self.complete(Err(error.into()));
    }

    pub fn complete(self, result: HandlerResult) {
        // The receiver is gone only if the runtime shut down.
        let _ = self.tx.send(result);
    }
}

pub(crate) enum Outcome {
    Settled(HandlerResult),
    Deferred(HandlerFuture),
    Awaiting(oneshot::Receiver<HandlerResult>),
}

fn settle(status: &StatusCell, result: HandlerResult) {
    let mut status = status.lock();
    match result {
        Ok(()) => {
            if status.state != ApplyState::Error {
                status.state = ApplyState::Acknowledged;
            }
        }
        Err(err) => {
            status.state = ApplyState::Error;
            status.error = err.to_string();
        }
    }
}

/// Applies an outcome to a status cell, immediately if it is already known and
/// from a spawned task otherwise.
pub(crate) fn track(status: StatusCell, outcome: Outcome) {
    match outcome {
        Outcome::Settled(result) => settle(&status, result),
        Outcome::Deferred(future) => {
            tokio::spawn(async move {
                // Polled in its own task so a panic settles the record instead of
                // being lost with it.
                let result = match tokio::spawn(future).await {
                    Ok(result) => result,
                    Err(err) => Err(format!("handler panicked: {err}").into()),
                };
                settle(&status, result);
            });
        }
        Outcome::Awaiting(mut rx) => match rx.try_recv() {
            Ok(result) => settle(&status, result),
            Err(TryRecvError::Empty) => {
                tokio::spawn(async move {
                    // An error here means the Ack was dropped without completing.
                    if let Ok(result) = rx.await {
                        settle(&status, result);
                    }
                });
            }
            Err(TryRecvError::Closed) => {}
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchHandlerId(pub(crate) u64);

pub type BatchHandler = Arc<dyn Fn(&mut BatchUpdate<'_>) + Send + Sync>;

#[derive(Debug, Default)]
pub(crate) struct BatchOutcomes {
    pub(crate) handled: HashSet<String>,
    pub(crate) statuses: HashMap<String, ApplyStatus>,
}

/// One parse's changes, filtered to the products a batch handler asked for.
///
/// Paths passed to `mark_handled`, `ack` or `error` are not dispatched to their
/// per-product handler afterwards.
pub struct BatchUpdate<'a> {
    pub to_unapply: Vec<ConfigDescriptor>,
    pub to_apply: Vec<ConfigDescriptor>,
    pub to_modify: Vec<ConfigDescriptor>,
    outcomes: &'a mut BatchOutcomes,
}

impl<'a> BatchUpdate<'a> {
    pub(crate) fn new(
        to_unapply: Vec<ConfigDescriptor>,
        to_apply: Vec<ConfigDescriptor>,
        to_modify: Vec<ConfigDescriptor>,
        outcomes: &'a mut BatchOutcomes,
    ) -> Self {
        BatchUpdate {
            to_unapply,
            to_apply,
            to_modify,
            outcomes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_unapply.is_empty() && self.to_apply.is_empty() && self.to_modify.is_empty()
    }

    pub fn mark_handled(&mut self, path: &str) {
        self.outcomes.handled.insert(path.to_string());
    }

    pub fn ack(&mut self, path: &str) {
        self.outcomes.statuses.insert(
            path.to_string(),
            ApplyStatus {
                state: ApplyState::Acknowledged,
                error: String::new(),
            },
        );
        self.mark_handled(path);
    }

    pub fn error<E: Display>(&mut self, path: &str, error: E) {
        self.outcomes.statuses.insert(
            path.to_string(),
            ApplyStatus {
                state: ApplyState::Error,
                error: error.to_string(),
            },
        );
        self.mark_handled(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::{Duration, sleep};

    fn new_cell() -> StatusCell {
        Arc::new(Mutex::new(ApplyStatus::unacknowledged()))
    }

    fn state_of(cell: &StatusCell) -> ApplyState {
        cell.lock().state
    }

    #[test]
    fn test_sync_outcomes() {
        let ok = ProductHandler::sync(|_, _, _| Ok(()));
        let cell = new_cell();
        track(cell.clone(), ok.invoke(Action::Apply, None, "id".into()));
        assert_eq!(state_of(&cell), ApplyState::Acknowledged);

        let bad = ProductHandler::sync(|_, _, _| Err("sync fn".into()));
        let cell = new_cell();
        track(cell.clone(), bad.invoke(Action::Apply, None, "id".into()));
        assert_eq!(*cell.lock(), ApplyStatus {
            state: ApplyState::Error,
            error: "sync fn".into()
        });
    }

    #[test]
    fn test_sync_handler_receives_arguments() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let handler = ProductHandler::sync(move |action, content, id| {
            *seen_clone.lock() = Some((action, content.cloned(), id.to_string()));
            Ok(())
        });

        let content = serde_json::json!({"index": 0});
        track(
            new_cell(),
            handler.invoke(Action::Modify, Some(content.clone()), "id_0".into()),
        );
        assert_eq!(
            *seen.lock(),
            Some((Action::Modify, Some(content), "id_0".to_string()))
        );
    }

    #[test]
    fn test_callback_completed_during_call() {
        let handler = ProductHandler::callback(|_, _, _, ack| ack.ack());
        let cell = new_cell();
        track(cell.clone(), handler.invoke(Action::Apply, None, "id".into()));
        assert_eq!(state_of(&cell), ApplyState::Acknowledged);

        let handler = ProductHandler::callback(|_, _, _, ack| ack.error("sync ack fn"));
        let cell = new_cell();
        track(cell.clone(), handler.invoke(Action::Apply, None, "id".into()));
        assert_eq!(state_of(&cell), ApplyState::Error);
        assert_eq!(cell.lock().error, "sync ack fn");
    }

    #[test]
    fn test_callback_dropped_stays_unacknowledged() {
        let handler = ProductHandler::callback(|_, _, _, _ack| {});
        let cell = new_cell();
        track(cell.clone(), handler.invoke(Action::Apply, None, "id".into()));
        assert_eq!(state_of(&cell), ApplyState::Unacknowledged);
    }

    #[tokio::test]
    async fn test_deferred_outcomes_settle_later() {
        let ok = ProductHandler::deferred(|_, _, _| async { Ok::<(), HandlerError>(()) });
        let bad = ProductHandler::deferred(|_, _, _| async { Err::<(), HandlerError>("async fn".into()) });

        let ok_cell = new_cell();
        let bad_cell = new_cell();
        track(ok_cell.clone(), ok.invoke(Action::Apply, None, "id".into()));
        track(bad_cell.clone(), bad.invoke(Action::Apply, None, "id".into()));

        // Nothing settles before the futures get polled
        assert_eq!(state_of(&ok_cell), ApplyState::Unacknowledged);
        assert_eq!(state_of(&bad_cell), ApplyState::Unacknowledged);

        sleep(Duration::from_millis(10)).await;

        assert_eq!(state_of(&ok_cell), ApplyState::Acknowledged);
        assert_eq!(state_of(&bad_cell), ApplyState::Error);
        assert_eq!(bad_cell.lock().error, "async fn");
    }

    #[tokio::test]
    async fn test_callback_completed_later() {
        let handler = ProductHandler::callback(|_, _, _, ack| {
            tokio::spawn(async move { ack.error("async ack fn") });
        });
        let cell = new_cell();
        track(cell.clone(), handler.invoke(Action::Apply, None, "id".into()));
        assert_eq!(state_of(&cell), ApplyState::Unacknowledged);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(state_of(&cell), ApplyState::Error);
        assert_eq!(cell.lock().error, "async ack fn");
    }

    #[test]
    fn test_batch_update_records_outcomes() {
        let mut outcomes = BatchOutcomes::default();
        let mut update = BatchUpdate::new(vec![], vec![], vec![], &mut outcomes);
        assert!(update.is_empty());

        update.mark_handled("a");
        update.ack("b");
        update.error("c", "waf failed");

        assert_eq!(outcomes.handled.len(), 3);
        assert!(!outcomes.statuses.contains_key("a"));
        assert_eq!(outcomes.statuses["b"].state, ApplyState::Acknowledged);
        assert_eq!(outcomes.statuses["c"].error, "waf failed");
    }

    #[test]
    fn test_panicking_handlers_settle_as_error() {
        let sync = ProductHandler::sync(|_, _, _| panic!("sync boom"));
        let cell = new_cell();
        track(cell.clone(), sync.invoke(Action::Apply, None, "id".into()));
        assert_eq!(state_of(&cell), ApplyState::Error);
        assert_eq!(cell.lock().error, "handler panicked: sync boom");

        let callback = ProductHandler::callback(|_, _, id, _ack| panic!("callback boom {id}"));
        let cell = new_cell();
        track(cell.clone(), callback.invoke(Action::Modify, None, "id_1".into()));
        assert_eq!(state_of(&cell), ApplyState::Error);
        assert_eq!(cell.lock().error, "handler panicked: callback boom id_1");
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn test_panicking_deferred_handler_settles_as_error() {
        let handler = ProductHandler::deferred(|_, _, _| async {
            panic!("async boom");
            Ok::<(), HandlerError>(())
        });
        let cell = new_cell();
        track(cell.clone(), handler.invoke(Action::Apply, None, "id".into()));

        sleep(Duration::from_millis(10)).await;
        assert_eq!(state_of(&cell), ApplyState::Error);
        assert!(cell.lock().error.starts_with("handler panicked"));
    }
}
