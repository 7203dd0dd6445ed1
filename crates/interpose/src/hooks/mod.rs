//! One-shot lifecycle notifications.
//!
//! The engine announces itself on [`LOADED_EVENT`] once its registry exists.
//! Code that loaded earlier (the fallback shim in particular) queues a
//! listener with [`LifecycleHooks::once`] and upgrades itself when the
//! announcement arrives.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use crate::registry::Registry;

/// Event emitted once the engine has finished initialising.
pub const LOADED_EVENT: &str = "interpose.loaded";

type Listener = Box<dyn FnOnce(&Registry)>;

/// Named-event bus for one-shot listeners.
#[derive(Default)]
pub struct LifecycleHooks {
    listeners: RefCell<HashMap<String, Vec<Listener>>>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.borrow();
        let mut pending: Vec<(&str, usize)> = listeners
            .iter()
            .map(|(event, queued)| (event.as_str(), queued.len()))
            .collect();
        pending.sort_unstable();
        f.debug_struct("LifecycleHooks")
            .field("pending", &pending)
            .finish()
    }
}

impl LifecycleHooks {
    /// Creates a bus with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `listener` to run the next time `event` fires.
    pub fn once(&self, event: &str, listener: impl FnOnce(&Registry) + 'static) {
        self.listeners
            .borrow_mut()
            .entry(event.to_owned())
            .or_default()
            .push(Box::new(listener));
    }

    /// Runs and discards every listener queued for `event`, in the order
    /// they were queued. Returns how many ran.
    ///
    /// Listeners may queue further listeners; those wait for the next firing.
    pub fn call_all(&self, event: &str, registry: &Registry) -> usize {
        let queued = self
            .listeners
            .borrow_mut()
            .remove(event)
            .unwrap_or_default();
        let count = queued.len();
        for listener in queued {
            listener(registry);
        }
        count
    }

    /// Number of listeners waiting on `event`.
    #[must_use]
    pub fn pending(&self, event: &str) -> usize {
        self.listeners.borrow().get(event).map_or(0, Vec::len)
    }
}
