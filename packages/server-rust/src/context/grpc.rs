//! gRPC call seam.
//!
//! The gRPC transport itself lives outside this crate. It adapts its native
//! call object to [`ServerCall`] and hands it to the application's request
//! handler together with a completion callback.

use std::fmt;
use std::sync::Arc;

use koatty_core::{Exception, Metadata};

/// Outcome delivered to the gRPC transport when a call completes.
pub type RpcReply = Result<serde_json::Value, Exception>;

/// Completion callback, invoked at most once per call.
pub type RpcCallback = Box<dyn FnOnce(RpcReply) + Send + Sync>;

/// Handler descriptor attached to a call by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHandler {
    /// Fully qualified method path, e.g. `/package.Service/Method`.
    pub path: String,
}

impl RpcHandler {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// A server-side gRPC call as seen by the framework.
pub trait ServerCall: Send + Sync {
    /// Incoming request metadata.
    fn metadata(&self) -> Metadata;

    /// Handler descriptor on the call itself.
    fn handler(&self) -> Option<&RpcHandler>;

    /// Some transports wrap the real call; its handler is consulted when the
    /// outer call has none.
    fn inner_call(&self) -> Option<&dyn ServerCall> {
        None
    }

    /// Decoded request payload.
    fn request(&self) -> Option<serde_json::Value>;

    /// Transmits response metadata to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the call can no longer accept metadata.
    fn send_metadata(&self, metadata: Metadata) -> anyhow::Result<()>;
}

/// Call handle plus its pending completion callback.
pub struct RpcHandle {
    pub call: Arc<dyn ServerCall>,
    pub callback: Option<RpcCallback>,
}

impl fmt::Debug for RpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHandle")
            .field("handler", &self.call.handler())
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Method path of the call: its own handler first, then the inner call's,
/// else empty.
#[must_use]
pub fn handler_path(call: &dyn ServerCall) -> String {
    call.handler()
        .or_else(|| call.inner_call().and_then(ServerCall::handler))
        .map(|handler| handler.path.clone())
        .unwrap_or_default()
}
