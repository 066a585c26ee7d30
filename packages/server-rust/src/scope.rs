//! Request-scoped storage.
//!
//! When the application runs with `async_local_store`, each request executes
//! inside a task-local [`RequestScope`] so code deep in a call stack can
//! recover the request identity and a snapshot of the context metadata
//! without threading the context through.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use koatty_core::{KoattyProtocol, Metadata};

tokio::task_local! {
    static CURRENT_REQUEST: Arc<RequestScope>;
}

/// Identity of the request being served on the current task.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub request_id: String,
    pub protocol: KoattyProtocol,
    pub path: String,
    pub started_at: Instant,
    /// Context metadata as it stood when the chain started.
    pub metadata: Metadata,
}

impl RequestScope {
    #[must_use]
    pub fn new(request_id: impl Into<String>, protocol: KoattyProtocol, path: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            protocol,
            path: path.into(),
            started_at: Instant::now(),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Runs `fut` with this scope installed.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        CURRENT_REQUEST.scope(Arc::new(self), fut).await
    }
}

/// The scope of the request running on this task, if any.
#[must_use]
pub fn current_request() -> Option<Arc<RequestScope>> {
    CURRENT_REQUEST.try_with(Arc::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_is_visible_inside_and_gone_outside() {
        assert!(current_request().is_none());

        let seen = RequestScope::new("r-1", KoattyProtocol::Http, "/a")
            .run(async {
                tokio::task::yield_now().await;
                current_request().map(|s| s.request_id.clone())
            })
            .await;

        assert_eq!(seen.as_deref(), Some("r-1"));
        assert!(current_request().is_none());
    }

    #[tokio::test]
    async fn nested_calls_read_metadata_snapshot() {
        async fn caller_tenant() -> Option<String> {
            let scope = current_request()?;
            scope.metadata.get_first("tenant")?.as_str().map(str::to_string)
        }

        let mut metadata = Metadata::new();
        metadata.set("tenant", "acme");
        let tenant = RequestScope::new("r-2", KoattyProtocol::Grpc, "/pkg.Svc/Method")
            .with_metadata(metadata)
            .run(caller_tenant())
            .await;

        assert_eq!(tenant.as_deref(), Some("acme"));
    }
}
