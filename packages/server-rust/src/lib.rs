//! Koatty runtime: the application object, the multi-protocol request
//! context, component registration, and axum-based server bindings.

pub mod application;
pub mod capture;
pub mod component;
pub mod context;
pub mod logging;
pub mod middleware;
pub mod router;
pub mod scope;
pub mod server;
pub mod signal;
pub mod trace;

pub use application::{AppEvent, InitOptions, Koatty, RequestHandler};
pub use capture::{ErrorCaptor, FailureChannel};
pub use context::{BaseContext, Inbound, KoattyContext, ResponseBody};
pub use middleware::{middleware_fn, parse_exp, ExpressMiddleware, Middleware, MiddlewareResult, Next};
pub use router::{KoattyRouter, RouterOptions};
pub use server::{HttpServer, KoattyServer, ServerConfig};

pub use koatty_core::{Exception, KoattyError, KoattyProtocol, Metadata, MetadataValue};
