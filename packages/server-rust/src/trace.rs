//! Request tracing and response finalization.
//!
//! [`TraceMiddleware`] is prepended to the chain once when the application
//! runs with `trace` enabled. It wraps the rest of the chain in a span,
//! enforces the request timeout, echoes the request id, and converts chain
//! failures into responses.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use koatty_core::{is_prevent, Exception};
use tracing::{info_span, Instrument};

use crate::context::KoattyContext;
use crate::middleware::{Middleware, MiddlewareResult, Next};

/// Header used to echo the request id back to HTTP clients.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Tracing, timeout, and error-to-response handling for every request.
#[derive(Debug, Clone)]
pub struct TraceMiddleware {
    timeout: Option<Duration>,
}

impl TraceMiddleware {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Middleware for TraceMiddleware {
    async fn handle(&self, ctx: &mut KoattyContext, next: Next<'_>) -> MiddlewareResult {
        let span = info_span!(
            "request",
            protocol = %ctx.protocol(),
            path = %ctx.path(),
            request_id = %ctx.request_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let timeout = self.timeout;

        async move {
            let start = Instant::now();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, next.run(ctx)).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(Exception::from_status(408, None).into()),
                },
                None => next.run(ctx).await,
            };

            if !ctx.protocol().is_websocket() {
                let request_id = ctx.request_id.clone();
                if let Err(err) = ctx.set_header(REQUEST_ID_HEADER, &request_id) {
                    tracing::debug!(error = %err, "request id is not a valid header value");
                }
            }

            let outcome = match &result {
                Ok(()) => "ok",
                Err(err) if is_prevent(err) => "prevented",
                Err(_) => "error",
            };
            if let Err(err) = &result {
                ctx.on_error(err);
            }

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);
            tracing::info!(
                status = ctx.status().as_u16(),
                duration_ms,
                outcome,
                "request complete"
            );

            Ok(())
        }
        .instrument(span)
        .await
    }

    fn name(&self) -> &str {
        "trace"
    }
}
