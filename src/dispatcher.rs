//! Observer fan-out for inbound cloud events.
//!
//! Observers are invoked synchronously, in registration order, on the
//! thread that calls [`EventDispatcher::notify`] (normally the transport's
//! inbound callback). Registering the same observer twice delivers twice.

use std::sync::{Arc, PoisonError, RwLock};

use log::trace;

use crate::events::{Category, CloudEvent};

/// Consumer of inbound cloud events.
pub trait CloudObserver: Send + Sync {
    fn on_event(&self, event: &CloudEvent);

    /// Capability filter. Defaults to every category.
    fn accepts(&self, _category: Category) -> bool {
        true
    }
}

impl<F> CloudObserver for F
where
    F: Fn(&CloudEvent) + Send + Sync,
{
    fn on_event(&self, event: &CloudEvent) {
        self(event)
    }
}

#[derive(Default)]
pub struct EventDispatcher {
    observers: RwLock<Vec<Arc<dyn CloudObserver>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn CloudObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer accepting its category.
    pub fn notify(&self, event: &CloudEvent) {
        // Snapshot so observers may subscribe from inside a callback.
        let observers: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let category = event.category();
        trace!("dispatch: {:?} to {} observers", category, observers.len());
        for observer in observers.iter().filter(|o| o.accepts(category)) {
            observer.on_event(event);
        }
    }
}
