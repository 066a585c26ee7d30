//! Per-request context shared by HTTP, WebSocket, gRPC, and GraphQL.
//!
//! A [`KoattyContext`] is a flattened view of the inbound request (the
//! [`BaseContext`]) plus the response state, a context-scoped [`Metadata`]
//! store, and optional protocol handles. Middleware sees the same shape
//! regardless of transport; only framework-adjacent code needs to look at
//! [`KoattyContext::protocol`].

pub mod factory;
pub mod graphql;
pub mod grpc;
pub mod pool;

pub use factory::{create_koatty_context, Inbound};
pub use graphql::GraphQLInfo;
pub use grpc::{RpcCallback, RpcHandle, RpcHandler, RpcReply, ServerCall};
pub use pool::ContextPool;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use bytes::Bytes;
use koatty_core::{is_prevent, Exception, KoattyError, KoattyProtocol, Metadata, MetadataValue};
use serde_json::json;
use tracing::debug;

use crate::application::Koatty;
use crate::server::ConnectionHandle;

use self::pool::RecycledParts;

// ---------------------------------------------------------------------------
// BaseContext
// ---------------------------------------------------------------------------

/// The inbound request as seen by the transport.
#[derive(Debug, Clone)]
pub struct BaseContext {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Fully buffered request body.
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl Default for BaseContext {
    fn default() -> Self {
        Self::new(Method::GET, Uri::from_static("/"))
    }
}

impl BaseContext {
    #[must_use]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    /// Replaces the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Adds a request header, ignoring names or values that are not valid HTTP.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Builds a base context from request parts and an already-read body.
    #[must_use]
    pub fn from_parts(parts: &axum::http::request::Parts, body: Bytes) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            body,
            remote_addr: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
        }
    }

    /// Buffers the request body (up to `limit` bytes) and builds the context.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds `limit` or the stream fails.
    pub async fn from_request(req: Request<Body>, limit: usize) -> Result<Self, axum::Error> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, limit).await?;
        Ok(Self::from_parts(&parts, body))
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Decoded query-string parameters. Malformed query strings yield an empty map.
    #[must_use]
    pub fn query(&self) -> HashMap<String, String> {
        Query::<HashMap<String, String>>::try_from_uri(&self.uri)
            .map(|q| q.0)
            .unwrap_or_default()
    }

    /// Request header as text, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

// ---------------------------------------------------------------------------
// ResponseBody
// ---------------------------------------------------------------------------

/// Response payload set by middleware.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResponseBody {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl ResponseBody {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Wire bytes of the payload.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Text(s) => Bytes::from(s.clone()),
            Self::Bytes(b) => b.clone(),
            Self::Json(v) => Bytes::from(v.to_string()),
        }
    }

    /// Payload as JSON, the shape handed to gRPC callbacks.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Empty => serde_json::Value::Null,
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Self::Json(v) => v.clone(),
        }
    }

    fn content_type(&self) -> Option<&'static str> {
        match self {
            Self::Empty => None,
            Self::Text(_) => Some("text/plain; charset=utf-8"),
            Self::Bytes(_) => Some("application/octet-stream"),
            Self::Json(_) => Some("application/json"),
        }
    }
}

impl From<&str> for ResponseBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for ResponseBody {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<serde_json::Value> for ResponseBody {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

// ---------------------------------------------------------------------------
// KoattyContext
// ---------------------------------------------------------------------------

/// One per in-flight request, message, or call.
pub struct KoattyContext {
    protocol: KoattyProtocol,
    app: Arc<Koatty>,
    request: BaseContext,
    status: StatusCode,
    explicit_status: bool,
    body: ResponseBody,
    response_headers: HeaderMap,
    /// Context-scoped metadata, distinct from the application store.
    pub metadata: Metadata,
    /// Free-form per-request state for middleware to share.
    pub state: HashMap<String, serde_json::Value>,
    /// gRPC call handle and completion callback.
    pub rpc: Option<RpcHandle>,
    /// Raw websocket connection the message arrived on.
    pub websocket: Option<Arc<ConnectionHandle>>,
    /// Parsed GraphQL request.
    pub graphql: Option<GraphQLInfo>,
    /// Correlation id, taken from `x-request-id` or generated.
    pub request_id: String,
}

impl KoattyContext {
    pub(crate) fn new(
        app: Arc<Koatty>,
        protocol: KoattyProtocol,
        request: BaseContext,
        recycled: Option<RecycledParts>,
    ) -> Self {
        let RecycledParts {
            metadata,
            headers,
            state,
        } = recycled.unwrap_or_default();

        let request_id = request
            .header("x-request-id")
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

        Self {
            protocol,
            app,
            request,
            status: StatusCode::NOT_FOUND,
            explicit_status: false,
            body: ResponseBody::Empty,
            response_headers: headers,
            metadata,
            state,
            rpc: None,
            websocket: None,
            graphql: None,
            request_id,
        }
    }

    /// Transport family. Fixed at construction.
    #[must_use]
    pub fn protocol(&self) -> KoattyProtocol {
        self.protocol
    }

    #[must_use]
    pub fn app(&self) -> &Arc<Koatty> {
        &self.app
    }

    #[must_use]
    pub fn request(&self) -> &BaseContext {
        &self.request
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.request.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.request.path()
    }

    #[must_use]
    pub fn query(&self) -> HashMap<String, String> {
        self.request.query()
    }

    /// Request header as text.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the response status explicitly.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
        self.explicit_status = true;
    }

    #[must_use]
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Sets the response body. A non-empty body without an explicit status
    /// answers 200.
    pub fn set_body(&mut self, body: impl Into<ResponseBody>) {
        self.body = body.into();
        if !self.explicit_status && !self.body.is_empty() {
            self.status = StatusCode::OK;
        }
    }

    #[must_use]
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    /// Response header as text.
    #[must_use]
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Sets a response header, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` or `value` is not valid HTTP.
    pub fn set_header(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.response_headers.insert(name, value);
        Ok(())
    }

    // -- metadata -----------------------------------------------------------

    /// Every value stored under `key` in the context metadata.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> &[MetadataValue] {
        self.metadata.get(key)
    }

    /// Replaces the context metadata entry for `key`.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.metadata.set(key, value);
    }

    /// Sends `data` (or the context's own metadata) to the peer.
    ///
    /// HTTP-family protocols write the first value of each key as a response
    /// header; GraphQL skips `_`- and `graphql`-prefixed keys. gRPC clones the
    /// call's native metadata, overlays the first value of each key, and
    /// transmits the result through the call.
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC call rejects the metadata.
    pub fn send_metadata(&mut self, data: Option<&Metadata>) -> anyhow::Result<()> {
        let projection = data.unwrap_or(&self.metadata).get_map();
        match self.protocol {
            KoattyProtocol::Grpc => {
                let Some(rpc) = &self.rpc else {
                    debug!("send_metadata on a grpc context without a call handle");
                    return Ok(());
                };
                let mut outgoing = rpc.call.metadata();
                for (key, value) in projection {
                    outgoing.set(key, value);
                }
                rpc.call.send_metadata(outgoing)
            }
            KoattyProtocol::Graphql => {
                self.write_headers(
                    projection
                        .into_iter()
                        .filter(|(k, _)| !k.starts_with('_') && !k.starts_with("graphql")),
                );
                Ok(())
            }
            _ => {
                self.write_headers(projection);
                Ok(())
            }
        }
    }

    fn write_headers(&mut self, entries: impl IntoIterator<Item = (String, MetadataValue)>) {
        for (key, value) in entries {
            let name = HeaderName::from_bytes(key.as_bytes());
            let value = match &value {
                MetadataValue::Binary(b) => HeaderValue::from_bytes(b),
                other => HeaderValue::from_str(&other.to_string()),
            };
            match (name, value) {
                (Ok(name), Ok(value)) => {
                    self.response_headers.insert(name, value);
                }
                _ => debug!(key, "metadata entry is not a valid header, skipped"),
            }
        }
    }

    // -- failures -----------------------------------------------------------

    /// Fails with a numeric status; a known status without a message uses
    /// its canonical text.
    ///
    /// # Errors
    ///
    /// Always returns `Err`.
    pub fn throw_status<T>(&self, status: u16, message: Option<&str>) -> Result<T, Exception> {
        Err(Exception::from_status(status, message))
    }

    /// Fails with a message, business code, and optional status.
    ///
    /// # Errors
    ///
    /// Always returns `Err`.
    pub fn throw_message<T>(
        &self,
        message: impl Into<String>,
        code: i32,
        status: Option<u16>,
    ) -> Result<T, Exception> {
        Err(Exception::from_message(message, code, status))
    }

    /// Turns a chain failure into a protocol-appropriate response.
    ///
    /// The suppressed flow-control signal leaves the response untouched.
    pub fn on_error(&mut self, err: &anyhow::Error) {
        if is_prevent(err) {
            return;
        }
        self.app.emit_error(err);

        let exception = exception_of(err, self.app.app_debug);
        self.set_status(exception.status_or_default());

        match self.protocol {
            KoattyProtocol::Grpc => {
                if let Some(callback) = self.rpc.as_mut().and_then(|rpc| rpc.callback.take()) {
                    callback(Err(exception));
                }
            }
            KoattyProtocol::Ws | KoattyProtocol::Wss => {
                self.body = ResponseBody::Text(exception.message);
            }
            _ => {
                self.body = ResponseBody::Json(json!({
                    "code": exception.code,
                    "message": exception.message,
                }));
            }
        }
    }

    // -- completion ---------------------------------------------------------

    /// Hands the body to the gRPC completion callback, once.
    pub fn finish_rpc(&mut self) {
        if let Some(callback) = self.rpc.as_mut().and_then(|rpc| rpc.callback.take()) {
            callback(Ok(self.body.to_json()));
        }
    }

    /// Builds the HTTP response, leaving the context's body and headers empty.
    pub fn take_response(&mut self) -> Response<Body> {
        let body = std::mem::take(&mut self.body);
        let mut headers = std::mem::take(&mut self.response_headers);

        let bytes = if body.is_empty() && !matches!(self.status.as_u16(), 204 | 304) {
            self.status
                .canonical_reason()
                .map_or_else(Bytes::new, |reason| Bytes::from_static(reason.as_bytes()))
        } else {
            body.to_bytes()
        };

        if !headers.contains_key(CONTENT_TYPE) {
            let content_type = body
                .content_type()
                .or((!bytes.is_empty()).then_some("text/plain; charset=utf-8"));
            if let Some(content_type) = content_type {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
        }

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }

    /// Clears every per-request field and keeps the reusable allocations.
    pub(crate) fn into_recycled(self) -> RecycledParts {
        let Self {
            mut metadata,
            response_headers: mut headers,
            mut state,
            ..
        } = self;
        metadata.clear();
        headers.clear();
        state.clear();
        RecycledParts {
            metadata,
            headers,
            state,
        }
    }
}

impl fmt::Debug for KoattyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KoattyContext")
            .field("protocol", &self.protocol)
            .field("method", &self.request.method)
            .field("uri", &self.request.uri)
            .field("status", &self.status)
            .field("body", &self.body)
            .field("metadata", &self.metadata)
            .field("rpc", &self.rpc)
            .field("websocket", &self.websocket.as_ref().map(|ws| ws.id))
            .field("graphql", &self.graphql)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// Extracts the client-facing exception from a chain error.
///
/// Errors that are not framework exceptions answer 500; their message is
/// only exposed in debug mode.
fn exception_of(err: &anyhow::Error, debug: bool) -> Exception {
    if let Some(exception) = err.downcast_ref::<Exception>() {
        return exception.clone();
    }
    if let Some(KoattyError::Exception(exception)) = err.downcast_ref::<KoattyError>() {
        return exception.clone();
    }
    let message = if debug {
        err.to_string()
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
            .canonical_reason()
            .unwrap_or_default()
            .to_string()
    };
    Exception::new(message, koatty_core::DEFAULT_ERROR_CODE, Some(StatusCode::INTERNAL_SERVER_ERROR))
}
