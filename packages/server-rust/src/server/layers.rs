//! Transport-level tower layers shared by HTTP-family bindings.
//!
//! These run outside the application middleware chain and only deal with
//! wire concerns. Layers are applied inner-first, so the last `.layer` call
//! is the outermost.

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::ServerConfig;

/// Wraps `router` with request id, tracing, compression, CORS, and timeout.
///
/// Websocket bindings skip compression and the timeout: upgraded
/// connections outlive any single request deadline.
#[must_use]
pub fn apply_transport_layers(router: Router, config: &ServerConfig) -> Router {
    let request_id = HeaderName::from_static("x-request-id");

    let router = if config.protocol.is_websocket() {
        router
    } else {
        router
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                config.request_timeout,
            ))
            .layer(CompressionLayer::new())
    };

    router
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
}

/// `"*"` allows any origin; otherwise only the parseable entries are allowed.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}
