//! Graceful shutdown coordination: tracks in-flight connection handlers and
//! drains them within a bounded deadline, force-cancelling stragglers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;

/// Handed to every connection handler at spawn time. Dropping the guard
/// (on any exit path, including panics unwound through the task) calls
/// `untrack` automatically so handlers can't forget to deregister.
///
/// `token` is *not* meant to be raced against the handler's own work with
/// `select!` — that would abort an in-flight request the moment shutdown
/// begins, which is exactly what the drain contract forbids. It's meant to
/// be polled at safe boundaries (e.g. before starting a new keep-alive
/// iteration) to stop extending an already-completed exchange.
pub struct TrackedConnection {
    id: u64,
    coordinator: std::sync::Weak<ShutdownCoordinatorInner>,
    token: CancellationToken,
}

impl TrackedConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// A clone of this connection's cancellation token, for threading into
    /// the handler so it can check `is_cancelled()` between requests.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        if let Some(inner) = self.coordinator.upgrade() {
            inner.untrack(self.id);
        }
    }
}

struct ShutdownCoordinatorInner {
    /// Abort handles for the tasks running each tracked connection, keyed
    /// by the same id as the connection itself. Only ever invoked after a
    /// drain timeout expires — this is the force-close half of the
    /// drain-then-force contract, not a cancellation fast path.
    registry: Mutex<HashMap<u64, tokio::task::AbortHandle>>,
    next_id: AtomicU64,
    inflight: AtomicU64,
    shutting_down: AtomicBool,
    parent_token: CancellationToken,
    drained: Notify,
}

impl ShutdownCoordinatorInner {
    fn untrack(&self, id: u64) {
        self.registry.lock().unwrap().remove(&id);
        let remaining = self.inflight.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.drained.notify_waiters();
        }
    }
}

/// Shared handle to the shutdown coordinator. Cheaply cloneable; every
/// connection handler holds one.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: std::sync::Arc<ShutdownCoordinatorInner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(ShutdownCoordinatorInner {
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                inflight: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                parent_token: CancellationToken::new(),
                drained: Notify::new(),
            }),
        }
    }

    /// Registers a new in-flight connection, returning a guard whose
    /// cancellation token fires when shutdown begins and whose `Drop`
    /// automatically untracks.
    pub fn track(&self) -> TrackedConnection {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let token = self.inner.parent_token.child_token();
        self.inner.inflight.fetch_add(1, Ordering::SeqCst);
        TrackedConnection {
            id,
            coordinator: std::sync::Arc::downgrade(&self.inner),
            token,
        }
    }

    /// Registers the abort handle for the task spawned to run a tracked
    /// connection. Call once, right after `tokio::spawn`. If `shutdown`
    /// times out waiting for a drain, this handle is what lets it actually
    /// force-close the straggler instead of merely asking nicely.
    pub fn set_abort_handle(&self, id: u64, handle: tokio::task::AbortHandle) {
        self.inner.registry.lock().unwrap().insert(id, handle);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// The parent cancellation token; new listener accept loops select on
    /// this to stop taking new connections once shutdown begins.
    pub fn context(&self) -> CancellationToken {
        self.inner.parent_token.clone()
    }

    pub fn inflight_count(&self) -> u64 {
        self.inner.inflight.load(Ordering::SeqCst)
    }

    /// Initiates shutdown: flips the flag and cancels the shared token so
    /// the accept loop stops taking new connections and no handler starts
    /// another keep-alive iteration, then waits for every already in-flight
    /// handler to finish on its own within `timeout`. In-flight work is
    /// never aborted by the signal itself — only once `timeout` actually
    /// elapses are the tasks still registered force-aborted, and only then
    /// does this return an error naming how many had to be force-closed.
    pub async fn shutdown(&self, timeout: Duration) -> anyhow::Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.parent_token.cancel();

        // Register as a waiter before checking the counter: `notify_waiters`
        // only wakes futures already polled, so checking first risks a
        // drain that completes between the check and the `notified()` call
        // being missed entirely (the wait would then run the full timeout).
        let drained = self.inner.drained.notified();
        tokio::pin!(drained);
        drained.as_mut().enable();

        if self.inner.inflight.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }

        let wait_result = tokio::time::timeout(timeout, &mut drained).await;
        if wait_result.is_ok() {
            return Ok(());
        }

        // Timed out: in-flight handlers didn't finish on their own within
        // the grace period. Force-close whatever's still registered rather
        // than waiting indefinitely.
        let stragglers: Vec<tokio::task::AbortHandle> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.values().cloned().collect()
        };
        for handle in &stragglers {
            handle.abort();
        }

        // Give the aborted tasks a moment to unwind and untrack themselves
        // so the reported remaining count reflects reality.
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut drained).await;

        let remaining = self.inner.inflight.load(Ordering::SeqCst) as usize;
        if remaining > 0 {
            return Err(ProxyError::ShutdownDrain { remaining }.into());
        }
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_returns_immediately_with_no_handlers() {
        let coordinator = ShutdownCoordinator::new();
        coordinator
            .shutdown(Duration::from_secs(1))
            .await
            .expect("shutdown with nothing tracked should succeed");
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_in_flight_handler_to_drain() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.track();
        assert_eq!(coordinator.inflight_count(), 1);

        let handler_coordinator = coordinator.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(_guard);
            let _ = handler_coordinator;
        });

        coordinator
            .shutdown(Duration::from_secs(2))
            .await
            .expect("shutdown should succeed once the handler drains");
        handle.await.unwrap();
        assert_eq!(coordinator.inflight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_cancels_token_for_outstanding_handlers() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.track();
        let token = guard.token();
        let wait_token = token.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            wait_token.cancelled().await;
        });

        coordinator
            .shutdown(Duration::from_millis(200))
            .await
            .expect("shutdown should succeed once cancellation unblocks the handler");
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_force_aborts_a_handler_stuck_past_the_drain_timeout() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.track();
        let id = guard.id();

        let join_handle = tokio::spawn(async move {
            let _guard = guard;
            // Never checks the cancellation token and never finishes on
            // its own within the drain window.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        coordinator.set_abort_handle(id, join_handle.abort_handle());

        coordinator
            .shutdown(Duration::from_millis(100))
            .await
            .expect("shutdown should succeed once the straggler is force-aborted");
        assert!(join_handle.await.unwrap_err().is_cancelled());
        assert_eq!(coordinator.inflight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_errors_when_a_handler_never_drains() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.track();
        // Deliberately leak the guard so it never untracks.
        std::mem::forget(guard);

        let result = coordinator.shutdown(Duration::from_millis(50)).await;
        assert!(result.is_err());
    }
}
