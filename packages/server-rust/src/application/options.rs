//! Construction options and environment resolution.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable consulted first for the runtime environment.
pub const KOATTY_ENV: &str = "KOATTY_ENV";
/// Fallback environment variable.
pub const APP_ENV: &str = "APP_ENV";
/// Environment used when neither variable is set.
pub const DEFAULT_ENV: &str = "production";

/// Options accepted by [`Koatty::new`](super::Koatty::new).
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub name: String,
    pub version: String,
    pub app_debug: bool,
    pub app_path: PathBuf,
    pub root_path: PathBuf,
    pub koatty_path: PathBuf,
    /// Prepend the trace middleware to every chain.
    pub trace: bool,
    /// Run each request inside a task-local [`RequestScope`](crate::scope::RequestScope).
    pub async_local_store: bool,
    /// Per-protocol context pool size; `None` disables pooling.
    pub context_pool_capacity: Option<usize>,
    /// Chain deadline enforced by the trace middleware.
    pub request_timeout: Option<Duration>,
    /// Install the process panic hook on construction.
    pub capture_panics: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            app_debug: true,
            app_path: PathBuf::new(),
            root_path: PathBuf::new(),
            koatty_path: PathBuf::new(),
            trace: false,
            async_local_store: false,
            context_pool_capacity: None,
            request_timeout: Some(Duration::from_secs(10)),
            capture_panics: true,
        }
    }
}

/// `KOATTY_ENV`, else `APP_ENV`, else `production`.
#[must_use]
pub fn resolve_env() -> String {
    resolve_env_from(|key| std::env::var(key).ok())
}

pub(crate) fn resolve_env_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    [KOATTY_ENV, APP_ENV]
        .into_iter()
        .find_map(|key| lookup(key).filter(|v| !v.is_empty()))
        .unwrap_or_else(|| DEFAULT_ENV.to_string())
}
