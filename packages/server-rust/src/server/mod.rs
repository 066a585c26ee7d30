//! Server bindings.
//!
//! A binding owns one listening socket for one protocol. The application
//! starts every binding in order from [`Koatty::listen`](crate::Koatty::listen)
//! and stops them from [`Koatty::stop`](crate::Koatty::stop).

pub mod config;
pub mod connection;
pub mod http;
pub mod layers;
pub mod lifecycle;
pub mod websocket;

pub use config::{ConnectionConfig, ServerConfig, TlsConfig};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionRegistry, OutboundMessage, SendError};
pub use self::http::HttpServer;
pub use layers::apply_transport_layers;
pub use lifecycle::{InFlightGuard, ServerLifecycle, ServerStatus};

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use koatty_core::KoattyProtocol;

use crate::application::Koatty;

/// A transport binding driven by the application lifecycle.
#[async_trait]
pub trait KoattyServer: Send + Sync + 'static {
    /// Protocol served by this binding.
    fn protocol(&self) -> KoattyProtocol;

    /// Binds and starts serving `app`. Returns the bound address.
    async fn start(&mut self, app: Arc<Koatty>) -> anyhow::Result<SocketAddr>;

    /// Stops accepting work and drains what is in flight.
    async fn stop(&mut self) -> anyhow::Result<()>;

    fn status(&self) -> ServerStatus {
        ServerStatus::Idle
    }
}
