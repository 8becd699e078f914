//! Typed observer channel
//!
//! Replaces string-keyed `on/off/emit` callbacks: each subscriber owns a
//! queue, every emitted event is delivered to each live subscriber at most
//! once, and a subscription is unregistered when it is dropped or
//! explicitly unsubscribed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct BusInner<E> {
    next_id: u64,
    listeners: HashMap<u64, mpsc::UnboundedSender<E>>,
}

/// Multi-subscriber event channel
pub struct EventBus<E> {
    inner: Arc<Mutex<BusInner<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    /// Register a new listener
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(id, tx);

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            rx,
        }
    }

    /// Deliver an event to every live listener
    ///
    /// Returns the number of listeners the event was queued for.
    pub fn emit(&self, event: E) -> usize {
        let mut inner = self.inner.lock();
        inner
            .listeners
            .retain(|_, tx| tx.send(event.clone()).is_ok());
        inner.listeners.len()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

/// Handle for one registered listener
pub struct Subscription<E> {
    id: u64,
    bus: Weak<Mutex<BusInner<E>>>,
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Wait for the next event
    ///
    /// Returns `None` once the bus has been dropped and the queue drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued so far
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Explicitly unregister this listener
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().listeners.remove(&self.id);
        }
    }
}
