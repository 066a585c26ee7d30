//! Application lifecycle events.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use parking_lot::Mutex;

use crate::middleware::BoxFuture;

/// Lifecycle events, in the order a bootstrap emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppEvent {
    AppBoot,
    LoadConfigure,
    LoadComponent,
    LoadPlugin,
    LoadMiddleware,
    LoadService,
    LoadController,
    LoadRouter,
    AppReady,
    AppStart,
    AppStop,
}

impl AppEvent {
    pub const ALL: [AppEvent; 11] = [
        AppEvent::AppBoot,
        AppEvent::LoadConfigure,
        AppEvent::LoadComponent,
        AppEvent::LoadPlugin,
        AppEvent::LoadMiddleware,
        AppEvent::LoadService,
        AppEvent::LoadController,
        AppEvent::LoadRouter,
        AppEvent::AppReady,
        AppEvent::AppStart,
        AppEvent::AppStop,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AppBoot => "appBoot",
            Self::LoadConfigure => "loadConfigure",
            Self::LoadComponent => "loadComponent",
            Self::LoadPlugin => "loadPlugin",
            Self::LoadMiddleware => "loadMiddleware",
            Self::LoadService => "loadService",
            Self::LoadController => "loadController",
            Self::LoadRouter => "loadRouter",
            Self::AppReady => "appReady",
            Self::AppStart => "appStart",
            Self::AppStop => "appStop",
        }
    }
}

impl fmt::Display for AppEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A one-shot asynchronous listener.
pub type EventListener = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Listener lists keyed by event.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<AppEvent, Vec<EventListener>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener to the end of `event`'s list.
    pub fn on<F, Fut>(&self, event: AppEvent, listener: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: EventListener =
            Box::new(move || -> BoxFuture<'static, ()> { Box::pin(listener()) });
        self.listeners.lock().entry(event).or_default().push(boxed);
    }

    #[must_use]
    pub fn listener_count(&self, event: AppEvent) -> usize {
        self.listeners.lock().get(&event).map_or(0, Vec::len)
    }

    /// Removes and returns every listener of `event`.
    pub fn take(&self, event: AppEvent) -> Vec<EventListener> {
        self.listeners.lock().remove(&event).unwrap_or_default()
    }

    /// Runs every listener of `event` sequentially in registration order and
    /// deregisters them. Listeners added while draining wait for the next call.
    pub async fn emit(&self, event: AppEvent) {
        let listeners = self.take(event);
        tracing::debug!(event = event.as_str(), count = listeners.len(), "emitting event");
        for listener in listeners {
            listener().await;
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&'static str, usize> = self
            .listeners
            .lock()
            .iter()
            .map(|(event, list)| (event.as_str(), list.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}
