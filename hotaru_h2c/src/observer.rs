//! Connection-level event observers.
//!
//! Observers see every event of the category they registered for, whether or
//! not the event was also routed to a stream.

use std::sync::Arc;

use fnv::FnvHashMap;

use crate::connection::error::{ConnectionError, Result};
use crate::engine::{Event, EventKind};

pub type EventObserver = Arc<dyn Fn(&Event) + Send + Sync>;

/// Event category to observer set. Identity is `Arc` pointer equality.
#[derive(Default)]
pub struct EventObservers {
    handlers: FnvHashMap<EventKind, Vec<EventObserver>>,
}

impl EventObservers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Returns `false` if it was already there.
    pub fn add(&mut self, kind: EventKind, handler: EventObserver) -> bool {
        let set = self.handlers.entry(kind).or_default();
        if set.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        set.push(handler);
        true
    }

    /// Unregister `handler` from `kind`.
    pub fn remove(&mut self, kind: EventKind, handler: &EventObserver) -> Result<()> {
        let set = self
            .handlers
            .get_mut(&kind)
            .ok_or(ConnectionError::HandlerNotFound(kind))?;
        let index = set
            .iter()
            .position(|h| Arc::ptr_eq(h, handler))
            .ok_or(ConnectionError::HandlerNotFound(kind))?;
        set.remove(index);
        if set.is_empty() {
            self.handlers.remove(&kind);
        }
        Ok(())
    }

    /// Snapshot of the observers for `kind`, in registration order.
    pub fn get(&self, kind: EventKind) -> Vec<EventObserver> {
        self.handlers.get(&kind).cloned().unwrap_or_default()
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}
