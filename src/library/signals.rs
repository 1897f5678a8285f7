//! Observer lists for library change notifications.
//!
//! Every library exposes three signals: `added`, `removed` and `changed`.
//! Subscribers are plain closures, called synchronously in connection order.
//! Emission snapshots the subscriber list first, so handlers may connect,
//! disconnect or read the emitting library while being called.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::item::ItemSet;

/// The three notifications a library emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Added,
    Removed,
    Changed,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Added, Signal::Removed, Signal::Changed];
}

/// Handle returned by [`Signals::connect`], used to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<V> = Rc<dyn Fn(&ItemSet<V>)>;

struct Slot<V> {
    id: SubscriptionId,
    signal: Signal,
    handler: Handler<V>,
}

struct Inner<V> {
    next_id: Cell<u64>,
    slots: RefCell<Vec<Slot<V>>>,
}

/// Subscriber lists for one library.
///
/// Cloning yields another handle to the same lists, which is how derived
/// indexes keep a way to disconnect from their source.
pub struct Signals<V>(Rc<Inner<V>>);

impl<V> Signals<V> {
    pub fn new() -> Self {
        Self(Rc::new(Inner {
            next_id: Cell::new(1),
            slots: RefCell::new(Vec::new()),
        }))
    }

    /// Subscribe `handler` to `signal`.
    pub fn connect<F>(&self, signal: Signal, handler: F) -> SubscriptionId
    where
        F: Fn(&ItemSet<V>) + 'static,
    {
        let id = SubscriptionId(self.0.next_id.get());
        self.0.next_id.set(id.0 + 1);
        self.0.slots.borrow_mut().push(Slot {
            id,
            signal,
            handler: Rc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut slots = self.0.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }

    /// Call every subscriber of `signal`. Empty payloads are never delivered.
    pub fn emit(&self, signal: Signal, items: &ItemSet<V>) {
        if items.is_empty() {
            return;
        }
        let handlers: Vec<Handler<V>> = self
            .0
            .slots
            .borrow()
            .iter()
            .filter(|slot| slot.signal == signal)
            .map(|slot| Rc::clone(&slot.handler))
            .collect();
        for handler in handlers {
            handler(items);
        }
    }

    /// Number of subscribers for `signal`.
    pub fn handler_count(&self, signal: Signal) -> usize {
        self.0
            .slots
            .borrow()
            .iter()
            .filter(|slot| slot.signal == signal)
            .count()
    }
}

impl<V> Default for Signals<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for Signals<V> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<V> fmt::Debug for Signals<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signals")
            .field("subscribers", &self.0.slots.borrow().len())
            .finish()
    }
}
