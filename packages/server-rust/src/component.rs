//! Component registration.
//!
//! Each registration call tags a type with a kind bucket and an identifier
//! and hands it to an [`IocRegistry`]. The trait bound on each call is the
//! compile-time contract; the [`Capabilities`] it attaches are what the
//! loader checks at runtime through the `implements_*` predicates.

use std::sync::Arc;

use async_trait::async_trait;
use koatty_core::{Capabilities, ComponentClass, ComponentKind, IocRegistry, KoattyError, KoattyProtocol};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::Koatty;
use crate::context::KoattyContext;
use crate::middleware::Middleware;

/// Property topic controller routing data is stored under.
pub const CONTROLLER_ROUTER: &str = "CONTROLLER_ROUTER";

const PLUGIN_SUFFIX: &str = "Plugin";
const ASPECT_SUFFIX: &str = "Aspect";

// ---------------------------------------------------------------------------
// Component contracts
// ---------------------------------------------------------------------------

/// A request-scoped controller.
pub trait ControllerComponent: Send + Sync + 'static {
    fn app(&self) -> &Arc<Koatty>;
    fn ctx(&self) -> &KoattyContext;
}

/// Middleware factory: `run` builds the middleware from its options.
pub trait MiddlewareComponent: Send + Sync + 'static {
    fn run(&self, options: &Value, app: &Arc<Koatty>) -> Arc<dyn Middleware>;
}

pub trait ServiceComponent: Send + Sync + 'static {
    fn app(&self) -> &Arc<Koatty>;
}

/// Plugins run once during bootstrap.
#[async_trait]
pub trait PluginComponent: Send + Sync + 'static {
    async fn run(&self, options: &Value, app: &Arc<Koatty>) -> anyhow::Result<()>;
}

/// Aspects wrap a method call; `run` receives the call arguments.
#[async_trait]
pub trait AspectComponent: Send + Sync + 'static {
    fn app(&self) -> &Arc<Koatty>;
    async fn run(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

// ---------------------------------------------------------------------------
// Controller routing data
// ---------------------------------------------------------------------------

/// Options accepted by the controller registrations.
#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Identifiers of middleware applied to every route of the controller.
    pub middleware: Vec<String>,
}

/// Routing data recorded against a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterMetadata {
    pub path: String,
    pub protocol: KoattyProtocol,
    pub middleware: Vec<String>,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

fn identifier_or_default(identifier: Option<&str>, class: &ComponentClass) -> String {
    identifier
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| class.default_identifier())
        .to_string()
}

/// Registers `T` as a plain component.
pub fn component<T: 'static>(registry: &dyn IocRegistry, identifier: Option<&str>) -> ComponentClass {
    let class = ComponentClass::of::<T>();
    let identifier = identifier_or_default(identifier, &class);
    registry.save_class(ComponentKind::Component, class, &identifier);
    class
}

/// Registers an http controller mounted at `path`.
pub fn controller<T: ControllerComponent>(
    registry: &dyn IocRegistry,
    path: &str,
    options: ControllerOptions,
) -> ComponentClass {
    register_controller::<T>(registry, path, options, KoattyProtocol::Http)
}

pub fn grpc_controller<T: ControllerComponent>(
    registry: &dyn IocRegistry,
    path: &str,
    options: ControllerOptions,
) -> ComponentClass {
    register_controller::<T>(registry, path, options, KoattyProtocol::Grpc)
}

pub fn websocket_controller<T: ControllerComponent>(
    registry: &dyn IocRegistry,
    path: &str,
    options: ControllerOptions,
) -> ComponentClass {
    register_controller::<T>(registry, path, options, KoattyProtocol::Ws)
}

pub fn graphql_controller<T: ControllerComponent>(
    registry: &dyn IocRegistry,
    path: &str,
    options: ControllerOptions,
) -> ComponentClass {
    register_controller::<T>(registry, path, options, KoattyProtocol::Graphql)
}

fn register_controller<T: ControllerComponent>(
    registry: &dyn IocRegistry,
    path: &str,
    options: ControllerOptions,
    protocol: KoattyProtocol,
) -> ComponentClass {
    let class = ComponentClass::of::<T>().with_capabilities(Capabilities::APP | Capabilities::CTX);
    let identifier = class.default_identifier();
    registry.save_class(ComponentKind::Controller, class, identifier);

    let metadata = RouterMetadata {
        path: path.to_string(),
        protocol,
        middleware: options.middleware,
    };
    // RouterMetadata holds only strings and a unit enum.
    let data = serde_json::to_value(&metadata).unwrap_or(Value::Null);
    registry.save_property_data(CONTROLLER_ROUTER, data, &class, identifier);
    class
}

pub fn middleware<T: MiddlewareComponent>(
    registry: &dyn IocRegistry,
    identifier: Option<&str>,
) -> ComponentClass {
    let class = ComponentClass::of::<T>().with_capabilities(Capabilities::RUN);
    let identifier = identifier_or_default(identifier, &class);
    registry.save_class(ComponentKind::Middleware, class, &identifier);
    class
}

pub fn service<T: ServiceComponent>(registry: &dyn IocRegistry, identifier: Option<&str>) -> ComponentClass {
    let class = ComponentClass::of::<T>().with_capabilities(Capabilities::APP);
    let identifier = identifier_or_default(identifier, &class);
    registry.save_class(ComponentKind::Service, class, &identifier);
    class
}

/// Registers a plugin. Plugins are filed as components.
///
/// # Errors
///
/// Returns [`KoattyError::InvalidSuffix`] unless the identifier ends with `Plugin`.
pub fn plugin<T: PluginComponent>(
    registry: &dyn IocRegistry,
    identifier: Option<&str>,
) -> Result<ComponentClass, KoattyError> {
    let class = ComponentClass::of::<T>().with_capabilities(Capabilities::RUN);
    register_suffixed(registry, class, identifier, PLUGIN_SUFFIX)
}

/// Registers an aspect. Aspects are filed as components.
///
/// # Errors
///
/// Returns [`KoattyError::InvalidSuffix`] unless the identifier ends with `Aspect`.
pub fn aspect<T: AspectComponent>(
    registry: &dyn IocRegistry,
    identifier: Option<&str>,
) -> Result<ComponentClass, KoattyError> {
    let class = ComponentClass::of::<T>().with_capabilities(Capabilities::APP | Capabilities::RUN);
    register_suffixed(registry, class, identifier, ASPECT_SUFFIX)
}

fn register_suffixed(
    registry: &dyn IocRegistry,
    class: ComponentClass,
    identifier: Option<&str>,
    suffix: &'static str,
) -> Result<ComponentClass, KoattyError> {
    let identifier = identifier_or_default(identifier, &class);
    if !identifier.ends_with(suffix) {
        return Err(KoattyError::InvalidSuffix {
            kind: suffix,
            identifier,
        });
    }
    registry.save_class(ComponentKind::Component, class, &identifier);
    Ok(class)
}

// ---------------------------------------------------------------------------
// Capability predicates
// ---------------------------------------------------------------------------

#[must_use]
pub fn implements_controller_interface(class: &ComponentClass) -> bool {
    class.has(Capabilities::APP | Capabilities::CTX)
}

#[must_use]
pub fn implements_middleware_interface(class: &ComponentClass) -> bool {
    class.has(Capabilities::RUN)
}

#[must_use]
pub fn implements_service_interface(class: &ComponentClass) -> bool {
    class.has(Capabilities::APP)
}

#[must_use]
pub fn implements_plugin_interface(class: &ComponentClass) -> bool {
    class.has(Capabilities::RUN)
}

#[must_use]
pub fn implements_aspect_interface(class: &ComponentClass) -> bool {
    class.has(Capabilities::APP | Capabilities::RUN)
}
