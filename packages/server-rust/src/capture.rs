//! Error capture: one owned handler per failure channel.
//!
//! Every channel logs through `tracing` by default. Suppressed control-flow
//! signals are never logged. An uncaught failure caused by an address that
//! is already bound terminates the process with exit code 1.

use std::collections::HashMap;
use std::fmt;
use std::panic::PanicHookInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use koatty_core::is_prevent;
use parking_lot::RwLock;
use tracing::{error, warn};

/// Channels a failure can be reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureChannel {
    /// Application `error` events.
    Error,
    /// Non-fatal warnings.
    Warning,
    /// A background task failed and nobody awaited its result.
    UnhandledRejection,
    /// A failure escaped every other handler.
    UncaughtException,
}

impl FailureChannel {
    pub const ALL: [FailureChannel; 4] = [
        FailureChannel::Error,
        FailureChannel::Warning,
        FailureChannel::UnhandledRejection,
        FailureChannel::UncaughtException,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::UnhandledRejection => "unhandledRejection",
            Self::UncaughtException => "uncaughtException",
        }
    }
}

pub type FailureHandler = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Message fragment the OS reports for an already bound address.
const ADDR_IN_USE: &str = "Address already in use";

/// Owned handler table for the failure channels.
pub struct ErrorCaptor {
    handlers: RwLock<HashMap<FailureChannel, FailureHandler>>,
    exit_hook: RwLock<ExitHook>,
    registered: AtomicBool,
}

impl ErrorCaptor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            exit_hook: RwLock::new(Arc::new(|code| std::process::exit(code))),
            registered: AtomicBool::new(false),
        }
    }

    /// Installs exactly one default handler per channel, replacing whatever
    /// was there, and optionally the process panic hook.
    pub fn register(&self, install_panic_hook: bool) {
        let mut handlers = self.handlers.write();
        handlers.clear();
        for channel in FailureChannel::ALL {
            handlers.insert(channel, default_handler(channel));
        }
        drop(handlers);
        self.registered.store(true, Ordering::SeqCst);

        if install_panic_hook {
            install_panic_hook_once();
        }
    }

    /// Removes every handler; failures are dropped until the next `register`.
    pub fn unregister(&self) {
        self.handlers.write().clear();
        self.registered.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Replaces the handler of one channel.
    pub fn set_handler(&self, channel: FailureChannel, handler: FailureHandler) {
        self.handlers.write().insert(channel, handler);
    }

    /// Replaces the process exit used for fatal failures.
    pub fn set_exit_hook(&self, hook: ExitHook) {
        *self.exit_hook.write() = hook;
    }

    /// Hands `err` to the handler of `channel`. Suppressed signals are dropped.
    pub fn dispatch(&self, channel: FailureChannel, err: &anyhow::Error) {
        if is_prevent(err) {
            return;
        }
        let handler = self.handlers.read().get(&channel).cloned();
        if let Some(handler) = handler {
            handler(err);
        }
    }

    pub fn error(&self, err: &anyhow::Error) {
        self.dispatch(FailureChannel::Error, err);
    }

    pub fn warning(&self, err: &anyhow::Error) {
        self.dispatch(FailureChannel::Warning, err);
    }

    pub fn unhandled_rejection(&self, err: &anyhow::Error) {
        self.dispatch(FailureChannel::UnhandledRejection, err);
    }

    /// Logs the failure; exits with code 1 when it is an address-in-use bind error.
    pub fn uncaught_exception(&self, err: &anyhow::Error) {
        self.dispatch(FailureChannel::UncaughtException, err);
        if self.is_registered() && is_addr_in_use(err) {
            let hook = self.exit_hook.read().clone();
            hook(1);
        }
    }
}

impl Default for ErrorCaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorCaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels: Vec<&'static str> = self.handlers.read().keys().map(|c| c.as_str()).collect();
        f.debug_struct("ErrorCaptor")
            .field("channels", &channels)
            .field("registered", &self.is_registered())
            .finish_non_exhaustive()
    }
}

fn default_handler(channel: FailureChannel) -> FailureHandler {
    Arc::new(move |err: &anyhow::Error| match channel {
        FailureChannel::Warning => warn!(channel = channel.as_str(), error = %format!("{err:#}"), "warning"),
        _ => error!(channel = channel.as_str(), error = %format!("{err:#}"), "captured failure"),
    })
}

/// Whether any cause in `err`'s chain is an address-in-use bind failure.
#[must_use]
pub fn is_addr_in_use(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::AddrInUse)
            || cause.to_string().contains(ADDR_IN_USE)
            || cause.to_string().contains("EADDRINUSE")
    })
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
    let payload = info.payload();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_default()
}

fn install_panic_hook_once() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = panic_message(info);
            if is_prevent(message.as_str()) {
                return;
            }
            let location = info.location().map(ToString::to_string).unwrap_or_default();
            error!(
                channel = FailureChannel::UncaughtException.as_str(),
                %location,
                "panic: {message}"
            );
            if message.contains(ADDR_IN_USE) {
                std::process::exit(1);
            }
            previous(info);
        }));
    });
}
