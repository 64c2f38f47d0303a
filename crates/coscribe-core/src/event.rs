//! Typed observer registration
//!
//! Components expose an `Observers<T>` per event type; subscribers get
//! back a `Subscription` handle that unregisters the callback when
//! dropped or cancelled. Teardown therefore cannot leave a listener
//! behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    handlers: RwLock<HashMap<u64, Callback<T>>>,
    next_id: AtomicU64,
}

/// A set of typed observers for one event type.
pub struct Observers<T> {
    inner: Arc<Inner<T>>,
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback. The callback stays registered until the
    /// returned `Subscription` is dropped or cancelled.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().insert(id, Arc::new(callback));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handlers.write().remove(&id);
            }
        })
    }

    /// Invoke every registered callback with `value`.
    ///
    /// Callbacks are cloned out before invocation so a callback may
    /// subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self.inner.handlers.read().values().cloned().collect();
        for callback in callbacks {
            callback(value);
        }
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.inner.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered observer callback.
///
/// Dropping the handle unregisters the callback. `detach` keeps the
/// callback registered for the lifetime of the `Observers` instead.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new<F: FnOnce() + Send + 'static>(cancel: F) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unregister the callback now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered forever.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_emit() {
        let observers: Observers<u32> = Observers::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = Arc::clone(&seen);
        let _sub = observers.subscribe(move |value| {
            seen_clone.fetch_add(*value as usize, Ordering::SeqCst);
        });

        observers.emit(&2);
        observers.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let observers: Observers<u32> = Observers::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = Arc::clone(&seen);
        let sub = observers.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        observers.emit(&1);
        drop(sub);
        observers.emit(&1);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_unsubscribe_from_callback_does_not_deadlock() {
        let observers: Observers<()> = Observers::new();
        let sub_slot: Arc<parking_lot::Mutex<Option<Subscription>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let slot_clone = Arc::clone(&sub_slot);
        let sub = observers.subscribe(move |_| {
            // Cancelling our own subscription mid-emit must not hang.
            if let Some(sub) = slot_clone.lock().take() {
                sub.cancel();
            }
        });
        *sub_slot.lock() = Some(sub);

        observers.emit(&());
        assert!(observers.is_empty());
    }
}
