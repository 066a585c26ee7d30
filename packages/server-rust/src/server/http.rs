//! axum-based binding for `http`, `https`, `ws`, `wss`, and `graphql`.
//!
//! `start` binds the listener and spawns the accept loop; `stop` signals the
//! loop, closes open websockets, and waits for in-flight work to drain.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use koatty_core::KoattyProtocol;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::{ServerConfig, TlsConfig};
use super::connection::{ConnectionRegistry, OutboundMessage};
use super::layers::apply_transport_layers;
use super::lifecycle::{ServerLifecycle, ServerStatus};
use super::websocket::{upgrade_handler, WsState};
use super::KoattyServer;
use crate::application::{Koatty, RequestHandler};

/// One listening socket serving the application over an HTTP-family protocol.
pub struct HttpServer {
    config: ServerConfig,
    lifecycle: Arc<ServerLifecycle>,
    registry: Arc<ConnectionRegistry>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl HttpServer {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            lifecycle: Arc::new(ServerLifecycle::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            local_addr: None,
            task: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the listener is bound to, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Open websocket connections.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn lifecycle(&self) -> Arc<ServerLifecycle> {
        Arc::clone(&self.lifecycle)
    }

    fn build_router(&self, handler: RequestHandler) -> Router {
        let router = if self.config.protocol.is_websocket() {
            let state = WsState {
                handler,
                registry: Arc::clone(&self.registry),
                lifecycle: Arc::clone(&self.lifecycle),
                connection: self.config.connection.clone(),
            };
            Router::new().fallback(upgrade_handler).with_state(state)
        } else {
            Router::new().fallback_service(handler).layer(
                axum::middleware::from_fn_with_state(Arc::clone(&self.lifecycle), track_in_flight),
            )
        };
        apply_transport_layers(router, &self.config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        match self.config.protocol {
            KoattyProtocol::Grpc => {
                anyhow::bail!("grpc is served by an external transport, not HttpServer")
            }
            protocol if protocol.is_secure() && self.config.tls.is_none() => {
                anyhow::bail!("{protocol} binding requires tls certificate and key")
            }
            _ => Ok(()),
        }
    }
}

async fn track_in_flight(
    State(lifecycle): State<Arc<ServerLifecycle>>,
    req: Request,
    next: axum::middleware::Next,
) -> Response {
    let _guard = lifecycle.track_request();
    next.run(req).await
}

#[async_trait]
impl KoattyServer for HttpServer {
    fn protocol(&self) -> KoattyProtocol {
        self.config.protocol
    }

    async fn start(&mut self, app: Arc<Koatty>) -> anyhow::Result<SocketAddr> {
        self.validate()?;
        let handler = app
            .callback(self.config.protocol.as_str(), None)?
            .with_body_limit(self.config.body_limit);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;

        let router = self.build_router(handler);
        let stopped = self.lifecycle.stopped();
        self.lifecycle.set_running();

        let serve = match self.config.tls.clone() {
            Some(tls) => {
                let drain = self.config.drain_timeout;
                tokio::spawn(async move { serve_tls(listener, router, &tls, stopped, drain).await })
            }
            None => tokio::spawn(serve_plain(listener, router, stopped)),
        };

        let protocol = self.config.protocol;
        self.task = Some(tokio::spawn(async move {
            let outcome = match serve.await {
                Ok(result) => result,
                Err(join) => Err(anyhow::Error::new(join)),
            };
            if let Err(err) = outcome {
                app.captor()
                    .unhandled_rejection(&err.context(format!("{protocol} server stopped")));
            }
        }));

        info!(protocol = %self.config.protocol, addr = %local_addr, "server started");
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.lifecycle.request_stop();

        let handles = self.registry.drain_all();
        if !handles.is_empty() {
            info!(count = handles.len(), "closing websocket connections");
            for handle in &handles {
                let _ = handle.try_send(OutboundMessage::Close(Some("server shutting down".to_string())));
            }
        }
        drop(handles);

        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.drain_timeout, task).await.is_err() {
                warn!(protocol = %self.config.protocol, "accept loop did not exit in time");
                abort.abort();
            }
        }

        if self.lifecycle.drain(self.config.drain_timeout).await {
            info!(protocol = %self.config.protocol, "server stopped");
        } else {
            warn!(
                protocol = %self.config.protocol,
                in_flight = self.lifecycle.in_flight(),
                "drain timeout expired with requests in flight"
            );
        }
        Ok(())
    }

    fn status(&self) -> ServerStatus {
        self.lifecycle.status()
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    stopped: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped)
    .await?;
    Ok(())
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    stopped: impl std::future::Future<Output = ()> + Send + 'static,
    drain: std::time::Duration,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .with_context(|| format!("failed to load tls certificate {}", tls.cert_path.display()))?;

    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        stopped.await;
        shutdown_handle.graceful_shutdown(Some(drain));
    });

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::application::InitOptions;
    use crate::capture::is_addr_in_use;

    fn hello_app() -> Arc<Koatty> {
        let app = Koatty::new(InitOptions::default());
        app.use_fn(|ctx, next| {
            Box::pin(async move {
                ctx.set_body("Hello, World!");
                next.run(ctx).await
            })
        });
        app
    }

    async fn raw_get(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_http_until_stopped() {
        let app = hello_app();
        let mut server = HttpServer::new(ServerConfig::new(KoattyProtocol::Http, "127.0.0.1", 0));
        assert_eq!(server.status(), ServerStatus::Idle);

        let addr = server.start(app).await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.status(), ServerStatus::Running);

        let response = raw_get(addr).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("x-request-id"));
        assert!(response.ends_with("Hello, World!"));

        server.stop().await.unwrap();
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn grpc_is_rejected() {
        let mut server = HttpServer::new(ServerConfig::new(KoattyProtocol::Grpc, "127.0.0.1", 0));
        assert!(server.start(hello_app()).await.is_err());
    }

    #[tokio::test]
    async fn secure_protocols_need_tls() {
        let mut server = HttpServer::new(ServerConfig::new(KoattyProtocol::Https, "127.0.0.1", 0));
        let err = server.start(hello_app()).await.unwrap_err();
        assert!(err.to_string().contains("tls"));

        let mut config = ServerConfig::new(KoattyProtocol::Wss, "127.0.0.1", 0);
        config.tls = Some(TlsConfig {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        });
        assert!(HttpServer::new(config).validate().is_ok());
    }

    #[tokio::test]
    async fn second_bind_reports_addr_in_use() {
        let app = hello_app();
        let mut first = HttpServer::new(ServerConfig::new(KoattyProtocol::Http, "127.0.0.1", 0));
        let addr = first.start(app.clone()).await.unwrap();

        let mut second =
            HttpServer::new(ServerConfig::new(KoattyProtocol::Http, "127.0.0.1", addr.port()));
        let err = second.start(app).await.unwrap_err();
        assert!(is_addr_in_use(&err));

        first.stop().await.unwrap();
    }
}
