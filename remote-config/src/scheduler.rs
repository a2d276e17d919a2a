use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant, sleep_until};

type Operation = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Default)]
struct LoopState {
    // Set by `start`, cleared by `stop`.
    running: bool,
    // A loop task exists. Only that task clears it.
    active: bool,
    // `start` was called after a `stop` while the loop task was still alive.
    restarted: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<LoopState>,
    wake: Notify,
}

impl Shared {
    /// Called by the loop after each run and on every wake-up. Returns whether the
    /// loop should keep going, and marks the loop inactive when it should not.
    fn keep_running(&self) -> bool {
        let mut state = self.state.lock();
        if !state.running {
            state.active = false;
        }
        state.running
    }

    fn take_restart(&self) -> bool {
        std::mem::take(&mut self.state.lock().restarted)
    }
}

/// Runs an async operation repeatedly with a fixed delay between runs.
///
/// The delay is measured from the completion of one run to the start of the next.
/// All runs happen on a single loop task, so at most one is ever in flight, even
/// across `stop` and `start`. The operation handles its own errors. A run that
/// panics is logged and the loop carries on.
pub struct Scheduler {
    operation: Operation,
    interval: Duration,
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new<F, Fut>(operation: F, interval: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Scheduler {
            operation: Arc::new(move || Box::pin(operation())),
            interval,
            shared: Arc::default(),
        }
    }

    /// Starts the loop and runs the operation immediately. Does nothing if already
    /// running. If a run from before the last `stop` is still in flight, the next
    /// run starts as soon as it completes. Must be called from within a Tokio
    /// runtime.
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if state.running {
            return;
        }
        state.running = true;

        if state.active {
            state.restarted = true;
            drop(state);
            self.shared.wake.notify_one();
            return;
        }
        state.active = true;
        drop(state);

        let operation = self.operation.clone();
        let interval = self.interval;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_loop(operation, interval, &shared).await;
            tracing::debug!("scheduler stopped");
        });
    }

    /// Cancels the pending timer. A run that is already in flight completes, but
    /// does not schedule another one.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.running = false;
        state.restarted = false;
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Whether further runs are scheduled. This turns false as soon as `stop` is
    /// called, even while a run started before it is still in flight.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }
}

async fn run_loop(operation: Operation, interval: Duration, shared: &Shared) {
    loop {
        if let Err(err) = tokio::spawn(operation()).await {
            tracing::error!(error = %err, "scheduled run panicked");
        }

        if !shared.keep_running() {
            return;
        }
        if shared.take_restart() {
            continue;
        }

        let deadline = Instant::now() + interval;
        loop {
            tokio::select! {
                biased;
                _ = shared.wake.notified() => {
                    if !shared.keep_running() {
                        return;
                    }
                    if shared.take_restart() {
                        break;
                    }
                    // Stale wake-up from an earlier stop and start; keep waiting.
                }
                _ = sleep_until(deadline) => break,
            }
        }
    }
}
