//! Process signal handling.
//!
//! On registration the handler takes over the `appStop` listeners that are
//! already on the application's event bus. Ctrl-C or SIGTERM runs them and
//! then stops the application. Listeners run exactly once, whichever of the
//! signal or [`Koatty::stop`] gets there first.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::{AppEvent, EventListener, Koatty};

type SharedListeners = Arc<Mutex<Vec<EventListener>>>;

/// Owned signal watcher with an explicit `register`/`unregister` lifecycle.
pub struct SignalHandler {
    task: Option<JoinHandle<()>>,
    listeners: SharedListeners,
}

impl SignalHandler {
    /// Starts watching for termination signals on behalf of `app`.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn register(app: &Arc<Koatty>) -> Self {
        let listeners: SharedListeners = Arc::new(Mutex::new(app.events().take(AppEvent::AppStop)));
        let app: Weak<Koatty> = Arc::downgrade(app);
        let shared = Arc::clone(&listeners);

        let task = tokio::spawn(async move {
            shutdown_signal().await;
            info!("termination signal received, stopping application");
            run_listeners(&shared).await;
            if let Some(app) = app.upgrade() {
                if let Err(err) = app.finish_stop().await {
                    error!(error = %err, "application failed to stop cleanly");
                }
            }
        });

        Self {
            task: Some(task),
            listeners,
        }
    }

    /// Stops watching. Rebound listeners stay pending.
    pub fn unregister(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Number of rebound `appStop` listeners not yet run.
    #[must_use]
    pub fn pending_listeners(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Runs the rebound `appStop` listeners, if the signal has not already.
    pub async fn run_stop_listeners(&self) {
        run_listeners(&self.listeners).await;
    }
}

impl fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHandler")
            .field("registered", &self.is_registered())
            .field("pending_listeners", &self.pending_listeners())
            .finish()
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.unregister();
    }
}

async fn run_listeners(listeners: &SharedListeners) {
    let pending = std::mem::take(&mut *listeners.lock());
    for listener in pending {
        listener().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
