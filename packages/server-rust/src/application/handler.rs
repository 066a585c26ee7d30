//! Per-protocol request handler produced by [`Koatty::callback`].

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use koatty_core::{Exception, KoattyProtocol};
use tower::Service;
use tracing::warn;

use super::Koatty;
use crate::context::factory::build_context;
use crate::context::{BaseContext, Inbound, KoattyContext, ResponseBody, RpcCallback, ServerCall};
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::scope::RequestScope;
use crate::server::{ConnectionHandle, OutboundMessage};

/// Default ceiling on buffered request bodies.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Runs the composed middleware chain for one protocol.
///
/// Cheap to clone; every clone shares the same chain snapshot. Implements
/// `tower::Service<Request<Body>>` for the HTTP family.
#[derive(Clone)]
pub struct RequestHandler {
    app: Arc<Koatty>,
    protocol: KoattyProtocol,
    chain: Arc<[Arc<dyn Middleware>]>,
    body_limit: usize,
}

impl RequestHandler {
    pub(crate) fn new(
        app: Arc<Koatty>,
        protocol: KoattyProtocol,
        chain: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        Self {
            app,
            protocol,
            chain: chain.into(),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    #[must_use]
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    #[must_use]
    pub fn protocol(&self) -> KoattyProtocol {
        self.protocol
    }

    #[must_use]
    pub fn app(&self) -> &Arc<Koatty> {
        &self.app
    }

    /// Number of middleware in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Runs the chain over `ctx`; a failure is rendered by the context.
    pub async fn dispatch(&self, ctx: &mut KoattyContext) {
        let scope = self
            .app
            .options
            .async_local_store
            .then(|| {
                RequestScope::new(ctx.request_id.clone(), ctx.protocol(), ctx.path())
                    .with_metadata(ctx.metadata.clone())
            });

        let run = async {
            if let Err(err) = Next::new(&self.chain).run(ctx).await {
                ctx.on_error(&err);
            }
        };

        match scope {
            Some(scope) => scope.run(run).await,
            None => run.await,
        }
    }

    /// Serves one HTTP-family request.
    pub async fn handle_request(&self, req: Request<Body>) -> Response<Body> {
        let base = match BaseContext::from_request(req, self.body_limit).await {
            Ok(base) => base,
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                return plain_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
        };

        let mut ctx = build_context(&self.app, base, self.protocol, Inbound::Http);
        self.dispatch(&mut ctx).await;
        let response = ctx.take_response();
        self.app.release_context(ctx);
        response
    }

    /// Serves one websocket message and returns the reply frame, if any.
    pub async fn handle_message(
        &self,
        base: BaseContext,
        socket: Arc<ConnectionHandle>,
        message: Bytes,
    ) -> Option<OutboundMessage> {
        let inbound = Inbound::WebSocket {
            socket: Some(socket),
            message,
        };
        let mut ctx = build_context(&self.app, base, self.protocol, inbound);
        self.dispatch(&mut ctx).await;

        let reply = match ctx.body() {
            ResponseBody::Empty => None,
            ResponseBody::Text(text) => Some(OutboundMessage::Text(text.clone())),
            ResponseBody::Bytes(bytes) => Some(OutboundMessage::Binary(bytes.clone())),
            ResponseBody::Json(value) => Some(OutboundMessage::Text(value.to_string())),
        };
        self.app.release_context(ctx);
        reply
    }

    /// Serves one gRPC call. The callback receives the body on success or
    /// the exception on failure, exactly once.
    pub async fn handle_call(
        &self,
        base: BaseContext,
        call: Arc<dyn ServerCall>,
        callback: RpcCallback,
    ) {
        let inbound = Inbound::Grpc {
            call: Some(call),
            callback: Some(callback),
        };
        let mut ctx = build_context(&self.app, base, self.protocol, inbound);
        self.dispatch(&mut ctx).await;
        ctx.finish_rpc();
        self.app.release_context(ctx);
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.handle_request(req).await) })
    }
}

fn plain_response(status: StatusCode) -> Response<Body> {
    let message = Exception::from_status(status.as_u16(), None).message;
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}
