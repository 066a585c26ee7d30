//! Server status and graceful-stop coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Where a server binding is in its life.
///
/// Idle -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Constructed, not yet bound.
    Idle,
    /// Bound and accepting requests.
    Running,
    /// Stop requested; finishing in-flight requests.
    Draining,
    /// Listener closed and drained.
    Stopped,
}

/// Shared status plus the stop signal and in-flight counter.
#[derive(Debug)]
pub struct ServerLifecycle {
    stop_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    status: ArcSwap<ServerStatus>,
}

impl ServerLifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (stop_signal, _rx) = watch::channel(false);
        Self {
            stop_signal,
            in_flight: Arc::new(AtomicU64::new(0)),
            status: ArcSwap::from_pointee(ServerStatus::Idle),
        }
    }

    #[must_use]
    pub fn status(&self) -> ServerStatus {
        **self.status.load()
    }

    pub fn set_running(&self) {
        self.status.store(Arc::new(ServerStatus::Running));
        self.stop_signal.send_replace(false);
    }

    /// Moves to `Draining` and wakes every [`stopped`](Self::stopped) future.
    pub fn request_stop(&self) {
        self.status.store(Arc::new(ServerStatus::Draining));
        self.stop_signal.send_replace(true);
    }

    /// Resolves once [`request_stop`](Self::request_stop) has been called.
    pub fn stopped(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.stop_signal.subscribe();
        async move {
            // Sender lives as long as the lifecycle; an error means it is gone.
            let _ = rx.wait_for(|stop| *stop).await;
        }
    }

    /// Counts one request until the guard drops.
    #[must_use]
    pub fn track_request(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight requests to finish, up to `timeout`.
    /// Moves to `Stopped` and returns `true` when drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.status.store(Arc::new(ServerStatus::Stopped));
        true
    }
}

impl Default for ServerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        let lifecycle = ServerLifecycle::new();
        assert_eq!(lifecycle.status(), ServerStatus::Idle);
        lifecycle.set_running();
        assert_eq!(lifecycle.status(), ServerStatus::Running);
        lifecycle.request_stop();
        assert_eq!(lifecycle.status(), ServerStatus::Draining);
    }

    #[test]
    fn guards_track_in_flight() {
        let lifecycle = ServerLifecycle::new();
        let a = lifecycle.track_request();
        let b = lifecycle.track_request();
        assert_eq!(lifecycle.in_flight(), 2);
        drop(a);
        assert_eq!(lifecycle.in_flight(), 1);
        drop(b);
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn stopped_resolves_after_request_stop() {
        let lifecycle = Arc::new(ServerLifecycle::new());
        lifecycle.set_running();
        let waiter = tokio::spawn(lifecycle.stopped());
        lifecycle.request_stop();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn drain_finishes_when_idle() {
        let lifecycle = ServerLifecycle::new();
        lifecycle.request_stop();
        assert!(lifecycle.drain(Duration::from_millis(50)).await);
        assert_eq!(lifecycle.status(), ServerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_with_work_outstanding() {
        let lifecycle = ServerLifecycle::new();
        let _guard = lifecycle.track_request();
        lifecycle.request_stop();
        assert!(!lifecycle.drain(Duration::from_millis(50)).await);
        assert_eq!(lifecycle.status(), ServerStatus::Draining);
    }
}
