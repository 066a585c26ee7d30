//! Onion-model middleware chain.
//!
//! Each [`Middleware`] receives the context and a [`Next`] handle for the
//! remainder of the chain. Awaiting `next.run(ctx)` runs everything
//! downstream; code after the await runs on the way back out. Returning
//! without calling `next` short-circuits the chain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::context::KoattyContext;

/// Boxed, sendable future borrowed for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of one middleware step.
pub type MiddlewareResult = anyhow::Result<()>;

// ---------------------------------------------------------------------------
// Middleware trait
// ---------------------------------------------------------------------------

/// A step in the request chain.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut KoattyContext, next: Next<'_>) -> MiddlewareResult;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// The rest of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    #[must_use]
    pub fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { rest: chain }
    }

    /// Runs the remaining middleware. An exhausted chain completes at once.
    ///
    /// # Errors
    ///
    /// Propagates the first error raised downstream.
    pub async fn run(self, ctx: &mut KoattyContext) -> MiddlewareResult {
        match self.rest.split_first() {
            Some((head, tail)) => head.handle(ctx, Next { rest: tail }).await,
            None => Ok(()),
        }
    }

    /// Number of middleware still to run.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

// ---------------------------------------------------------------------------
// Closure middleware
// ---------------------------------------------------------------------------

/// Middleware backed by a closure returning a boxed future.
pub struct FnMiddleware<F>(F);

/// Wraps a closure as middleware.
///
/// ```ignore
/// app.use_middleware(middleware_fn(|ctx, next| Box::pin(async move {
///     ctx.set_body("Hello, World!");
///     next.run(ctx).await
/// })));
/// ```
pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut KoattyContext, Next<'a>) -> BoxFuture<'a, MiddlewareResult>
        + Send
        + Sync
        + 'static,
{
    FnMiddleware(f)
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut KoattyContext, Next<'a>) -> BoxFuture<'a, MiddlewareResult>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, ctx: &mut KoattyContext, next: Next<'_>) -> MiddlewareResult {
        (self.0)(ctx, next).await
    }
}

// ---------------------------------------------------------------------------
// Express-style adapter
// ---------------------------------------------------------------------------

/// Continuation handed to a callback-style express middleware.
pub struct ExpNext(oneshot::Sender<MiddlewareResult>);

impl ExpNext {
    /// Continues the chain, or fails it when `err` is set.
    pub fn call(self, err: Option<anyhow::Error>) {
        // Receiver gone means the request was already abandoned.
        let _ = self.0.send(err.map_or(Ok(()), Err));
    }
}

type SyncHandler = Box<dyn Fn(&mut KoattyContext) + Send + Sync>;
type CallbackHandler = Box<dyn Fn(&mut KoattyContext, ExpNext) + Send + Sync>;

/// A middleware written against the `(req, res[, next])` convention.
pub enum ExpressMiddleware {
    /// Two-argument form: runs to completion, then the chain continues.
    Sync(SyncHandler),
    /// Three-argument form: the chain continues when [`ExpNext::call`] is invoked.
    Callback(CallbackHandler),
}

impl ExpressMiddleware {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&mut KoattyContext) + Send + Sync + 'static,
    {
        Self::Sync(Box::new(f))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&mut KoattyContext, ExpNext) + Send + Sync + 'static,
    {
        Self::Callback(Box::new(f))
    }
}

struct ExpressAdapter(ExpressMiddleware);

#[async_trait]
impl Middleware for ExpressAdapter {
    async fn handle(&self, ctx: &mut KoattyContext, next: Next<'_>) -> MiddlewareResult {
        match &self.0 {
            ExpressMiddleware::Sync(f) => {
                f(&mut *ctx);
                next.run(ctx).await
            }
            ExpressMiddleware::Callback(f) => {
                let (tx, rx) = oneshot::channel();
                f(&mut *ctx, ExpNext(tx));
                match rx.await {
                    Ok(Ok(())) => next.run(ctx).await,
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(anyhow::anyhow!(
                        "express middleware dropped its next callback"
                    )),
                }
            }
        }
    }

    fn name(&self) -> &str {
        "express"
    }
}

/// Adapts an express-style middleware to the async chain.
#[must_use]
pub fn parse_exp(middleware: ExpressMiddleware) -> Arc<dyn Middleware> {
    Arc::new(ExpressAdapter(middleware))
}
