//! The process-wide stop signal and the uniform suspension-point wrapper.
//!
//! Every potentially-long operation in this crate — a source query, a sink
//! push, a queue enqueue, a checkpoint save, the ETA ticker's sleep — is
//! composed with [`StopSignal`] through [`run_until_stopped`] rather than
//! awaited bare. This is the one place cancellation is implemented; nothing
//! else polls the stop flag directly.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Outcome of an operation composed with the stop signal.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The operation completed before stop fired.
    Completed(T),
    /// Stop fired first; the operation was dropped mid-flight.
    Stopped,
}

impl<T> Outcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(v) => Some(v),
            Outcome::Stopped => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Outcome::Stopped)
    }
}

/// Idempotent, monotonic, cloneable stop signal shared across every task.
#[derive(Clone)]
pub struct StopSignal {
    fired: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
    notify: Arc<Notify>,
    forced_notify: Arc<Notify>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            forced: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            forced_notify: Arc::new(Notify::new()),
        }
    }

    /// Set the stop flag. Safe to call more than once; only the first call
    /// has any effect on waiters (subsequent `notify_waiters` calls are
    /// harmless no-ops since the flag is already observed as set).
    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// A second stop signal arrived; mark the shutdown as forced (exit
    /// code 3) and wake anyone waiting specifically on [`wait_forced`], on
    /// top of the already-fired stop.
    ///
    /// [`wait_forced`]: StopSignal::wait_forced
    pub fn force(&self) {
        self.forced.store(true, Ordering::SeqCst);
        self.forced_notify.notify_waiters();
        self.fire();
    }

    pub fn forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has fired. Resolves immediately if it has
    /// already fired by the time this is called.
    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }
        // Register the waiter before re-checking, so a `fire()` that races
        // with the first check cannot be missed.
        let notified = self.notify.notified();
        if self.is_set() {
            return;
        }
        notified.await;
    }

    /// Resolve once the shutdown has been forced (a second stop signal).
    /// Unlike [`wait`](StopSignal::wait), this does not resolve on the
    /// first stop — it is the dedicated escape hatch a caller races against
    /// to bypass drain/cleanup entirely once the user asks twice.
    pub async fn wait_forced(&self) {
        if self.forced() {
            return;
        }
        let notified = self.forced_notify.notified();
        if self.forced() {
            return;
        }
        notified.await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `fut` to completion, or stop early if `stop` fires first.
///
/// This is the single cancellation-composition point described in the
/// design notes: callers never `select!` against the stop signal
/// themselves.
pub async fn run_until_stopped<T>(stop: &StopSignal, fut: impl Future<Output = T>) -> Outcome<T> {
    tokio::select! {
        biased;
        _ = stop.wait() => Outcome::Stopped,
        value = fut => Outcome::Completed(value),
    }
}

/// Sleep for `delay`, or return early if `stop` fires first.
pub async fn sleep_unless_stopped(stop: &StopSignal, delay: Duration) -> Outcome<()> {
    run_until_stopped(stop, tokio::time::sleep(delay)).await
}
