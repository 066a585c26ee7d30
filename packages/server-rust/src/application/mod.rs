//! The application: composition root for middleware, configuration,
//! servers, and lifecycle events.

pub mod events;
pub mod handler;
pub mod options;

pub use events::{AppEvent, EventBus, EventListener};
pub use handler::{RequestHandler, DEFAULT_BODY_LIMIT};
pub use options::{resolve_env, InitOptions};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use koatty_core::{KoattyError, KoattyProtocol, Metadata, MetadataValue};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::capture::ErrorCaptor;
use crate::context::{create_koatty_context, BaseContext, ContextPool, Inbound, KoattyContext};
use crate::middleware::{middleware_fn, parse_exp, BoxFuture, ExpressMiddleware, Middleware, MiddlewareResult, Next};
use crate::router::KoattyRouter;
use crate::server::KoattyServer;
use crate::signal::SignalHandler;
use crate::trace::TraceMiddleware;

/// Private application key holding configuration buckets.
pub const CONFIGS_KEY: &str = "_configs";

/// Default configuration bucket for [`Koatty::config`].
pub const DEFAULT_CONFIG_TYPE: &str = "config";

/// A Koatty application.
///
/// Constructed behind an `Arc`: contexts and request handlers hold a
/// reference back to the application that produced them.
pub struct Koatty {
    pub env: String,
    pub name: String,
    pub version: String,
    pub options: InitOptions,
    pub app_debug: bool,
    pub app_path: PathBuf,
    pub root_path: PathBuf,
    pub koatty_path: PathBuf,
    pub logs_path: PathBuf,

    metadata: RwLock<Metadata>,
    properties: RwLock<HashMap<String, MetadataValue>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    trace_injected: AtomicBool,
    servers: tokio::sync::Mutex<Vec<Box<dyn KoattyServer>>>,
    router: RwLock<Option<Arc<dyn KoattyRouter>>>,
    events: EventBus,
    captor: ErrorCaptor,
    signals: Mutex<Option<SignalHandler>>,
    pool: Option<ContextPool>,
    stopped: watch::Sender<bool>,
}

impl Koatty {
    /// Builds the application and installs its error captors.
    #[must_use]
    pub fn new(options: InitOptions) -> Arc<Self> {
        let captor = ErrorCaptor::new();
        captor.register(options.capture_panics);

        let app = Self {
            env: resolve_env(),
            name: options.name.clone(),
            version: options.version.clone(),
            app_debug: options.app_debug,
            app_path: options.app_path.clone(),
            root_path: options.root_path.clone(),
            koatty_path: options.koatty_path.clone(),
            logs_path: options.root_path.join("logs"),
            metadata: RwLock::new(Metadata::new()),
            properties: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            trace_injected: AtomicBool::new(false),
            servers: tokio::sync::Mutex::new(Vec::new()),
            router: RwLock::new(None),
            events: EventBus::new(),
            captor,
            signals: Mutex::new(None),
            pool: options.context_pool_capacity.map(ContextPool::new),
            stopped: watch::Sender::new(false),
            options,
        };
        debug!(name = %app.name, env = %app.env, "application created");
        Arc::new(app)
    }

    // -- metadata -----------------------------------------------------------

    /// Stores `value` under `key`. Keys starting with `_` become private
    /// properties and bypass the metadata store.
    pub fn set_metadata(&self, key: &str, value: impl Into<MetadataValue>) {
        let value = value.into();
        if key.starts_with('_') {
            self.properties.write().insert(key.to_string(), value);
        } else {
            self.metadata.write().set(key, value);
        }
    }

    /// Values stored under `key`. A private property yields one value, or
    /// none when it is empty.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Vec<MetadataValue> {
        if key.starts_with('_') {
            return self
                .properties
                .read()
                .get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .into_iter()
                .collect();
        }
        self.metadata.read().get(key).to_vec()
    }

    // -- configuration ------------------------------------------------------

    /// Looks up `name` in configuration bucket `kind`.
    ///
    /// `a.b` addresses key `b` inside object `a`. Any miss is `None`.
    #[must_use]
    pub fn config(&self, name: &str, kind: &str) -> Option<Value> {
        let properties = self.properties.read();
        let bucket = properties.get(CONFIGS_KEY)?.as_json()?.get(kind)?;
        match name.split_once('.') {
            None => bucket.get(name).cloned(),
            Some((head, rest)) => {
                let key = rest.split('.').next().unwrap_or(rest);
                bucket.get(head)?.get(key).cloned()
            }
        }
    }

    /// The whole configuration bucket `kind`.
    #[must_use]
    pub fn config_bucket(&self, kind: &str) -> Option<Value> {
        let configs = self.properties.read();
        configs.get(CONFIGS_KEY)?.as_json()?.get(kind).cloned()
    }

    /// Installs (replaces) configuration bucket `kind`.
    pub fn set_config(&self, kind: &str, value: Value) {
        let mut properties = self.properties.write();
        let mut configs = match properties.remove(CONFIGS_KEY) {
            Some(MetadataValue::Json(Value::Object(map))) => map,
            _ => Map::new(),
        };
        configs.insert(kind.to_string(), value);
        properties.insert(CONFIGS_KEY.to_string(), MetadataValue::Json(Value::Object(configs)));
    }

    // -- middleware ---------------------------------------------------------

    /// Appends a middleware to the chain.
    pub fn use_middleware(&self, middleware: impl Middleware) {
        self.use_arc(Arc::new(middleware));
    }

    /// Appends an already shared middleware.
    pub fn use_arc(&self, middleware: Arc<dyn Middleware>) {
        debug!(middleware = middleware.name(), "middleware registered");
        self.middleware.write().push(middleware);
    }

    /// Appends a closure middleware.
    pub fn use_fn<F>(&self, f: F)
    where
        F: for<'a> Fn(&'a mut KoattyContext, Next<'a>) -> BoxFuture<'a, MiddlewareResult>
            + Send
            + Sync
            + 'static,
    {
        self.use_middleware(middleware_fn(f));
    }

    /// Appends an express-style middleware.
    pub fn use_exp(&self, middleware: ExpressMiddleware) {
        self.use_arc(parse_exp(middleware));
    }

    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.middleware.read().len()
    }

    // -- contexts -----------------------------------------------------------

    /// Builds a context for one inbound unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`KoattyError::ContextCreation`] for an unknown protocol.
    pub fn create_context(
        self: &Arc<Self>,
        base: BaseContext,
        protocol: &str,
        inbound: Inbound,
    ) -> Result<KoattyContext, KoattyError> {
        create_koatty_context(self, base, protocol, inbound)
    }

    /// Returns a finished context to the pool, or drops it when pooling is off.
    pub fn release_context(&self, ctx: KoattyContext) {
        if let Some(pool) = &self.pool {
            pool.release(ctx);
        }
    }

    #[must_use]
    pub fn context_pool(&self) -> Option<&ContextPool> {
        self.pool.as_ref()
    }

    /// Composes the current middleware chain into a handler for `protocol`.
    ///
    /// With `trace` enabled the trace middleware is put at the front of the
    /// application chain on the first call. `req_handler`, when given, runs
    /// last and only in this handler.
    ///
    /// # Errors
    ///
    /// Returns [`KoattyError::ContextCreation`] for an unknown protocol.
    pub fn callback(
        self: &Arc<Self>,
        protocol: &str,
        req_handler: Option<Arc<dyn Middleware>>,
    ) -> Result<RequestHandler, KoattyError> {
        let protocol = protocol
            .parse::<KoattyProtocol>()
            .map_err(KoattyError::ContextCreation)?;

        if self.options.trace && !self.trace_injected.swap(true, Ordering::SeqCst) {
            self.middleware
                .write()
                .insert(0, Arc::new(TraceMiddleware::new(self.options.request_timeout)));
        }

        let mut chain = self.middleware.read().clone();
        chain.extend(req_handler);
        Ok(RequestHandler::new(Arc::clone(self), protocol, chain))
    }

    // -- router -------------------------------------------------------------

    pub fn set_router(&self, router: Arc<dyn KoattyRouter>) {
        *self.router.write() = Some(router);
    }

    #[must_use]
    pub fn router(&self) -> Option<Arc<dyn KoattyRouter>> {
        self.router.read().clone()
    }

    // -- events -------------------------------------------------------------

    /// Registers a one-shot listener for `event`.
    pub fn once<F, Fut>(&self, event: AppEvent, listener: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.events.on(event, listener);
    }

    /// Runs and removes every listener of `event`, sequentially.
    pub async fn async_event(&self, event: AppEvent) {
        self.events.emit(event).await;
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Reports a failure on the application's error channel.
    pub fn emit_error(&self, err: &anyhow::Error) {
        self.captor.error(err);
    }

    /// Reports a warning on the application's warning channel.
    pub fn emit_warning(&self, err: &anyhow::Error) {
        self.captor.warning(err);
    }

    #[must_use]
    pub fn captor(&self) -> &ErrorCaptor {
        &self.captor
    }

    // -- servers ------------------------------------------------------------

    /// Adds a server binding; bindings start in the order they were added.
    pub async fn bind_server(&self, server: impl KoattyServer) {
        self.servers.lock().await.push(Box::new(server));
    }

    /// Starts every binding in order.
    ///
    /// After the last one is up, `appStart` is drained once, the signal
    /// handler is registered, and `callback` runs. A binding failing with
    /// address-in-use is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if no binding was added or one fails to start.
    pub async fn listen<F>(self: &Arc<Self>, callback: F) -> anyhow::Result<Vec<SocketAddr>>
    where
        F: FnOnce(&Arc<Koatty>),
    {
        let mut servers = self.servers.lock().await;
        if servers.is_empty() {
            anyhow::bail!("no server bound to application `{}`", self.name);
        }

        let mut addrs = Vec::with_capacity(servers.len());
        for server in servers.iter_mut() {
            match server.start(Arc::clone(self)).await {
                Ok(addr) => {
                    info!(protocol = %server.protocol(), %addr, "server listening");
                    addrs.push(addr);
                }
                Err(err) => {
                    self.captor.uncaught_exception(&err);
                    return Err(err);
                }
            }
        }
        drop(servers);

        info!(name = %self.name, env = %self.env, "application started");
        self.async_event(AppEvent::AppStart).await;
        self.register_signals();
        callback(self);
        Ok(addrs)
    }

    pub(crate) fn register_signals(self: &Arc<Self>) {
        let mut slot = self.signals.lock();
        if slot.is_none() {
            *slot = Some(SignalHandler::register(self));
        }
    }

    /// Runs `appStop` listeners, stops every binding, and wakes
    /// [`wait_for_stop`](Self::wait_for_stop).
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a binding's `stop`.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let handler = self.signals.lock().take();
        if let Some(mut handler) = handler {
            handler.unregister();
            handler.run_stop_listeners().await;
        }
        self.finish_stop().await
    }

    pub(crate) async fn finish_stop(&self) -> anyhow::Result<()> {
        self.async_event(AppEvent::AppStop).await;

        let mut first_error = None;
        for server in self.servers.lock().await.iter_mut() {
            if let Err(err) = server.stop().await {
                error!(protocol = %server.protocol(), error = %err, "server failed to stop");
                first_error.get_or_insert(err);
            }
        }
        self.stopped.send_replace(true);
        info!(name = %self.name, "application stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Resolves once the application has stopped.
    pub async fn wait_for_stop(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl fmt::Debug for Koatty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Koatty")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("env", &self.env)
            .field("app_debug", &self.app_debug)
            .field("middleware", &self.middleware_count())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    fn app() -> Arc<Koatty> {
        Koatty::new(InitOptions::default())
    }

    #[test]
    fn public_metadata_round_trip() {
        let app = app();
        app.set_metadata("feature", "on");
        assert_eq!(app.get_metadata("feature"), vec![MetadataValue::from("on")]);
        assert!(app.get_metadata("missing").is_empty());
    }

    #[test]
    fn private_keys_bypass_metadata_store() {
        let app = app();
        app.set_metadata("_secret", "s3");
        assert_eq!(app.get_metadata("_secret"), vec![MetadataValue::from("s3")]);
        assert!(app.metadata.read().is_empty());

        app.set_metadata("_blank", "");
        assert!(app.get_metadata("_blank").is_empty());
        assert!(app.get_metadata("_never").is_empty());
    }

    #[test]
    fn config_lookup() {
        let app = app();
        app.set_config(
            "config",
            json!({ "port": 3000, "db": { "host": "localhost", "pool": { "max": 5 } } }),
        );
        app.set_config("middleware", json!({ "list": ["trace"] }));

        assert_eq!(app.config("port", DEFAULT_CONFIG_TYPE), Some(json!(3000)));
        assert_eq!(app.config("db.host", "config"), Some(json!("localhost")));
        // Only one level of nesting is addressed.
        assert_eq!(app.config("db.pool.max", "config"), Some(json!({ "max": 5 })));
        assert_eq!(app.config("list", "middleware"), Some(json!(["trace"])));
        assert_eq!(
            app.config_bucket("middleware"),
            Some(json!({ "list": ["trace"] }))
        );
    }

    #[test]
    fn config_misses_are_none() {
        let app = app();
        assert!(app.config("port", "config").is_none());

        app.set_config("config", json!({ "port": 3000 }));
        assert!(app.config("host", "config").is_none());
        assert!(app.config("port.inner", "config").is_none());
        assert!(app.config("port", "system").is_none());
        assert!(app.config("missing.key", "config").is_none());
    }

    proptest::proptest! {
        #[test]
        fn config_returns_what_was_installed(
            key in "[a-z][a-z0-9_]{0,12}",
            inner in "[a-z][a-z0-9_]{0,12}",
            value in proptest::num::i64::ANY,
        ) {
            let app = app();
            app.set_config("config", json!({ key.clone(): { inner.clone(): value } }));
            proptest::prop_assert_eq!(
                app.config(&format!("{key}.{inner}"), "config"),
                Some(json!(value))
            );
            proptest::prop_assert_eq!(
                app.config(&key, "config"),
                Some(json!({ inner.clone(): value }))
            );
        }
    }

    #[test]
    fn logs_path_sits_under_root() {
        let app = Koatty::new(InitOptions {
            root_path: PathBuf::from("/srv/app"),
            ..InitOptions::default()
        });
        assert_eq!(app.logs_path, PathBuf::from("/srv/app/logs"));
    }

    #[test]
    fn callback_rejects_unknown_protocol() {
        assert!(matches!(
            app().callback("smtp", None),
            Err(KoattyError::ContextCreation(_))
        ));
    }

    #[test]
    fn trace_middleware_is_injected_once() {
        let app = Koatty::new(InitOptions {
            trace: true,
            ..InitOptions::default()
        });
        app.use_fn(|ctx, next| Box::pin(next.run(ctx)));

        let first = app.callback("http", None).unwrap();
        let second = app.callback("ws", None).unwrap();
        assert_eq!(app.middleware_count(), 2);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(app.middleware.read()[0].name(), "trace");
    }

    #[tokio::test]
    async fn request_handler_runs_after_app_chain() {
        let app = app();
        app.use_fn(|ctx, next| {
            Box::pin(async move {
                ctx.set_body("from app");
                next.run(ctx).await
            })
        });
        let tail: Arc<dyn Middleware> = Arc::new(middleware_fn(|ctx, _next| {
            Box::pin(async move {
                let previous = ctx.body().to_json();
                ctx.set_body(format!("{} + tail", previous.as_str().unwrap_or_default()));
                Ok(())
            })
        }));

        let response = app
            .callback("http", Some(tail))
            .unwrap()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"from app + tail");
        // The extra handler is not added to the application chain.
        assert_eq!(app.middleware_count(), 1);
    }

    #[tokio::test]
    async fn use_exp_joins_the_chain() {
        let app = app();
        app.use_exp(ExpressMiddleware::sync(|ctx| ctx.set_body("express")));
        let response = app
            .callback("http", None)
            .unwrap()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    struct FakeServer {
        protocol: KoattyProtocol,
        fail: Option<std::io::ErrorKind>,
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl KoattyServer for FakeServer {
        fn protocol(&self) -> KoattyProtocol {
            self.protocol
        }

        async fn start(&mut self, _app: Arc<Koatty>) -> anyhow::Result<SocketAddr> {
            if let Some(kind) = self.fail {
                return Err(std::io::Error::new(kind, "bind failed").into());
            }
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            Ok(SocketAddr::from(([127, 0, 0, 1], 4000 + u16::try_from(n).unwrap())))
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fake(started: &Arc<AtomicUsize>, stopped: &Arc<AtomicUsize>) -> FakeServer {
        FakeServer {
            protocol: KoattyProtocol::Http,
            fail: None,
            started: started.clone(),
            stopped: stopped.clone(),
        }
    }

    #[tokio::test]
    async fn listen_starts_all_then_fires_app_start_once() {
        let app = app();
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        app.bind_server(fake(&started, &stopped)).await;
        app.bind_server(fake(&started, &stopped)).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let seen_at_start = Arc::new(AtomicUsize::new(usize::MAX));
        {
            let fired = fired.clone();
            let seen = seen_at_start.clone();
            let started = started.clone();
            app.once(AppEvent::AppStart, move || async move {
                seen.store(started.load(Ordering::SeqCst), Ordering::SeqCst);
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut called = false;
        let addrs = app.listen(|_| called = true).await.unwrap();
        assert!(called);
        assert_eq!(addrs.len(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(seen_at_start.load(Ordering::SeqCst), 2);

        app.stop().await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
        app.wait_for_stop().await;
    }

    #[tokio::test]
    async fn listen_without_servers_fails() {
        assert!(app().listen(|_| {}).await.is_err());
    }

    #[tokio::test]
    async fn failed_start_skips_app_start() {
        let app = app();
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut server = fake(&started, &stopped);
        server.fail = Some(std::io::ErrorKind::PermissionDenied);
        app.bind_server(server).await;
        app.once(AppEvent::AppStart, || async {});

        assert!(app.listen(|_| {}).await.is_err());
        assert_eq!(app.events().listener_count(AppEvent::AppStart), 1);
    }

    #[tokio::test]
    async fn address_in_use_is_fatal() {
        let app = app();
        let exit_code = Arc::new(std::sync::Mutex::new(None));
        {
            let exit_code = exit_code.clone();
            app.captor()
                .set_exit_hook(Arc::new(move |code| *exit_code.lock().unwrap() = Some(code)));
        }
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut server = fake(&started, &stopped);
        server.fail = Some(std::io::ErrorKind::AddrInUse);
        app.bind_server(server).await;

        assert!(app.listen(|_| {}).await.is_err());
        assert_eq!(*exit_code.lock().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn stop_runs_app_stop_listeners() {
        let app = app();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            app.once(AppEvent::AppStop, move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        app.stop().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
