//! Bounded per-protocol recycling of context allocations.
//!
//! A released context is stripped of everything request-specific (status,
//! body, protocol handles, the application reference) and only its
//! metadata store, header map, and state map are kept for the next request
//! of the same protocol.

use std::collections::HashMap;

use axum::http::HeaderMap;
use koatty_core::{KoattyProtocol, Metadata};
use parking_lot::Mutex;

use super::KoattyContext;

/// Cleared allocations taken from a released context.
#[derive(Default)]
pub(crate) struct RecycledParts {
    pub(crate) metadata: Metadata,
    pub(crate) headers: HeaderMap,
    pub(crate) state: HashMap<String, serde_json::Value>,
}

/// LIFO pool holding at most `capacity` entries per protocol.
pub struct ContextPool {
    capacity: usize,
    slots: Mutex<HashMap<KoattyProtocol, Vec<RecycledParts>>>,
}

impl ContextPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn acquire(&self, protocol: KoattyProtocol) -> Option<RecycledParts> {
        self.slots.lock().get_mut(&protocol).and_then(Vec::pop)
    }

    /// Resets `ctx` and keeps its allocations. Returns `false` when the
    /// protocol's slot is full and the context was dropped instead.
    pub fn release(&self, ctx: KoattyContext) -> bool {
        let protocol = ctx.protocol();
        let parts = ctx.into_recycled();

        let mut slots = self.slots.lock();
        let slot = slots.entry(protocol).or_default();
        if slot.len() >= self.capacity {
            return false;
        }
        slot.push(parts);
        true
    }

    /// Number of pooled entries for `protocol`.
    #[must_use]
    pub fn available(&self, protocol: KoattyProtocol) -> usize {
        self.slots.lock().get(&protocol).map_or(0, Vec::len)
    }
}
