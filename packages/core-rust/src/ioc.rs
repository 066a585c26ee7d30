//! IOC registry seam.
//!
//! Component registration calls tag a type with a kind bucket and an
//! identifier and hand the record to an [`IocRegistry`]. The real container
//! (instantiation, injection, aspect weaving) lives outside this crate;
//! [`MemoryContainer`] is a plain in-memory implementation for bootstrap
//! code and tests.

use std::any::{type_name, TypeId};

use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

bitflags! {
    /// Role markers attached to a component at registration time.
    ///
    /// The loader reads these to decide how to wire a registered type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// Holds a reference to the application.
        const APP = 0b0001;
        /// Holds the request context.
        const CTX = 0b0010;
        /// Exposes a callable `run` entry point.
        const RUN = 0b0100;
    }
}

// ---------------------------------------------------------------------------
// ComponentKind
// ---------------------------------------------------------------------------

/// Bucket a registered type is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Component,
    Controller,
    Middleware,
    Service,
}

impl ComponentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Component => "COMPONENT",
            Self::Controller => "CONTROLLER",
            Self::Middleware => "MIDDLEWARE",
            Self::Service => "SERVICE",
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentClass
// ---------------------------------------------------------------------------

/// Identity of a registered type plus its role markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentClass {
    type_id: TypeId,
    type_name: &'static str,
    capabilities: Capabilities,
}

impl ComponentClass {
    /// Describes `T` with no role markers.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            capabilities: Capabilities::empty(),
        }
    }

    /// Adds role markers.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities |= capabilities;
        self
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified type name as reported by the compiler.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether every marker in `required` is present.
    #[must_use]
    pub fn has(&self, required: Capabilities) -> bool {
        self.capabilities.contains(required)
    }

    /// Default identifier: the last path segment of the type name, without
    /// generic arguments (`app::controller::UserController<X>` -> `UserController`).
    #[must_use]
    pub fn default_identifier(&self) -> &'static str {
        let base = self
            .type_name
            .split_once('<')
            .map_or(self.type_name, |(head, _)| head);
        base.rsplit("::").next().unwrap_or(base)
    }
}

// ---------------------------------------------------------------------------
// IocRegistry trait
// ---------------------------------------------------------------------------

/// Storage the registration calls write into.
pub trait IocRegistry: Send + Sync {
    /// Files `target` under `kind` with the given identifier.
    fn save_class(&self, kind: ComponentKind, target: ComponentClass, identifier: &str);

    /// Attaches arbitrary per-class data under `topic`.
    fn save_property_data(
        &self,
        topic: &str,
        data: serde_json::Value,
        target: &ComponentClass,
        identifier: &str,
    );
}

// ---------------------------------------------------------------------------
// MemoryContainer
// ---------------------------------------------------------------------------

/// In-memory [`IocRegistry`].
///
/// Lookups by `(kind, identifier)` and by `TypeId`; listing keeps
/// registration order. Re-registering the same key replaces the entry in
/// place.
pub struct MemoryContainer {
    classes: DashMap<(ComponentKind, String), ComponentClass>,
    by_type: DashMap<TypeId, (ComponentKind, String)>,
    properties: DashMap<(String, String), serde_json::Value>,
    order: RwLock<Vec<(ComponentKind, String)>>,
}

impl MemoryContainer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: DashMap::new(),
            by_type: DashMap::new(),
            properties: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Looks up a registered type by kind and identifier.
    pub fn get_class(&self, kind: ComponentKind, identifier: &str) -> Option<ComponentClass> {
        self.classes
            .get(&(kind, identifier.to_string()))
            .map(|entry| *entry.value())
    }

    /// Returns the `(kind, identifier)` under which `T` was registered.
    pub fn get_identifier<T: 'static>(&self) -> Option<(ComponentKind, String)> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|entry| entry.value().clone())
    }

    /// Lists every registration of `kind` in registration order.
    pub fn list_class(&self, kind: ComponentKind) -> Vec<(String, ComponentClass)> {
        self.order
            .read()
            .iter()
            .filter(|(k, _)| *k == kind)
            .filter_map(|(k, id)| self.get_class(*k, id).map(|class| (id.clone(), class)))
            .collect()
    }

    /// Returns property data saved under `topic` for `identifier`.
    pub fn get_property_data(&self, topic: &str, identifier: &str) -> Option<serde_json::Value> {
        self.properties
            .get(&(topic.to_string(), identifier.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Total number of registrations across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Drops every registration and property record.
    pub fn clear(&self) {
        self.classes.clear();
        self.by_type.clear();
        self.properties.clear();
        self.order.write().clear();
    }
}

impl Default for MemoryContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl IocRegistry for MemoryContainer {
    fn save_class(&self, kind: ComponentKind, target: ComponentClass, identifier: &str) {
        let key = (kind, identifier.to_string());
        if self.classes.insert(key.clone(), target).is_none() {
            self.order.write().push(key.clone());
        }
        self.by_type.insert(target.type_id(), key);
        tracing::debug!(
            kind = kind.as_str(),
            identifier,
            type_name = target.type_name(),
            "component registered"
        );
    }

    fn save_property_data(
        &self,
        topic: &str,
        data: serde_json::Value,
        _target: &ComponentClass,
        identifier: &str,
    ) {
        self.properties
            .insert((topic.to_string(), identifier.to_string()), data);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct UserController;
    struct AuthMiddleware;
    #[allow(dead_code)]
    struct Wrapper<T>(T);

    #[test]
    fn default_identifier_is_short_type_name() {
        assert_eq!(
            ComponentClass::of::<UserController>().default_identifier(),
            "UserController"
        );
        assert_eq!(
            ComponentClass::of::<Wrapper<UserController>>().default_identifier(),
            "Wrapper"
        );
    }

    #[test]
    fn capabilities_accumulate() {
        let class = ComponentClass::of::<UserController>()
            .with_capabilities(Capabilities::APP)
            .with_capabilities(Capabilities::CTX);
        assert!(class.has(Capabilities::APP | Capabilities::CTX));
        assert!(!class.has(Capabilities::RUN));
        assert!(ComponentClass::of::<UserController>().capabilities().is_empty());
    }

    #[test]
    fn save_and_get_class() {
        let container = MemoryContainer::new();
        let class = ComponentClass::of::<UserController>();
        container.save_class(ComponentKind::Controller, class, "UserController");

        assert_eq!(
            container.get_class(ComponentKind::Controller, "UserController"),
            Some(class)
        );
        assert!(container
            .get_class(ComponentKind::Service, "UserController")
            .is_none());
        assert_eq!(
            container.get_identifier::<UserController>(),
            Some((ComponentKind::Controller, "UserController".to_string()))
        );
    }

    #[test]
    fn list_class_keeps_registration_order_and_filters_kind() {
        let container = MemoryContainer::new();
        container.save_class(
            ComponentKind::Middleware,
            ComponentClass::of::<AuthMiddleware>(),
            "B",
        );
        container.save_class(
            ComponentKind::Controller,
            ComponentClass::of::<UserController>(),
            "C",
        );
        container.save_class(
            ComponentKind::Middleware,
            ComponentClass::of::<AuthMiddleware>(),
            "A",
        );
        // Replacing an entry does not duplicate it.
        container.save_class(
            ComponentKind::Middleware,
            ComponentClass::of::<AuthMiddleware>(),
            "B",
        );

        let ids: Vec<_> = container
            .list_class(ComponentKind::Middleware)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["B", "A"]);
        assert_eq!(container.len(), 3);
    }

    #[test]
    fn property_data_round_trip() {
        let container = MemoryContainer::new();
        let class = ComponentClass::of::<UserController>();
        container.save_property_data("ROUTER", json!({ "path": "/u" }), &class, "UserController");

        assert_eq!(
            container.get_property_data("ROUTER", "UserController"),
            Some(json!({ "path": "/u" }))
        );
        assert!(container.get_property_data("ROUTER", "Other").is_none());
    }

    #[test]
    fn clear_drops_everything() {
        let container = MemoryContainer::new();
        let class = ComponentClass::of::<UserController>();
        container.save_class(ComponentKind::Controller, class, "UserController");
        container.save_property_data("ROUTER", json!({}), &class, "UserController");
        container.clear();

        assert!(container.is_empty());
        assert!(container.list_class(ComponentKind::Controller).is_empty());
        assert!(container.get_identifier::<UserController>().is_none());
    }
}
