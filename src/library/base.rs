//! The generic key-addressed item container.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

use super::albums::AlbumItem;
use super::item::{Item, ItemRef, ItemSet, ReloadOutcome};
use super::librarian::Librarian;
use super::signals::{Signal, Signals, SubscriptionId};

/// Container access for every library layer.
///
/// File and watched libraries wrap a [`Library`]; this trait lets code that
/// only needs the container (the librarian, derived indexes, persistence)
/// accept any of them.
pub trait AsLibrary<V: Item> {
    fn as_library(&self) -> &Library<V>;

    /// Re-key a held item to `new_key`, changing the item itself.
    ///
    /// Only layers that know how to relocate their items do anything here;
    /// the plain container cannot, and returns false. Emits nothing for the
    /// item itself.
    fn move_held(&self, _item: &ItemRef<V>, _new_key: &V::Key) -> bool {
        false
    }

    /// Force a re-read of a held item from its backing store. Emits nothing.
    ///
    /// `None` means this layer has no backing store to re-read from.
    fn refresh(&self, _item: &ItemRef<V>) -> Option<ReloadOutcome> {
        None
    }
}

/// A key → item map that announces every mutation.
///
/// All methods take `&self`; the library is meant to be shared through `Rc`
/// and mutated from signal handlers of other indexes.
pub struct Library<V: Item> {
    name: Option<String>,
    contents: RefCell<HashMap<V::Key, ItemRef<V>>>,
    dirty: Cell<bool>,
    signals: Signals<V>,
    librarian: RefCell<Option<Weak<Librarian<V>>>>,
}

impl<V: Item> Library<V> {
    pub fn new() -> Self {
        Self {
            name: None,
            contents: RefCell::new(HashMap::new()),
            dirty: Cell::new(false),
            signals: Signals::new(),
            librarian: RefCell::new(None),
        }
    }

    /// A library with a name, used in log lines.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn signals(&self) -> &Signals<V> {
        &self.signals
    }

    /// Shorthand for `signals().connect(..)`.
    pub fn connect<F>(&self, signal: Signal, handler: F) -> SubscriptionId
    where
        F: Fn(&ItemSet<V>) + 'static,
    {
        self.signals.connect(signal, handler)
    }

    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        self.signals.disconnect(id)
    }

    /// Whether anything changed since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn len(&self) -> usize {
        self.contents.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.borrow().is_empty()
    }

    pub fn get(&self, key: &V::Key) -> Option<ItemRef<V>> {
        self.contents.borrow().get(key).cloned()
    }

    pub fn contains_key(&self, key: &V::Key) -> bool {
        self.contents.borrow().contains_key(key)
    }

    /// Whether this exact item is stored under its current key.
    pub fn contains(&self, item: &ItemRef<V>) -> bool {
        let key = item.key();
        self.contents
            .borrow()
            .get(&key)
            .is_some_and(|stored| stored.ptr_eq(item))
    }

    pub fn keys(&self) -> Vec<V::Key> {
        self.contents.borrow().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<ItemRef<V>> {
        self.contents.borrow().values().cloned().collect()
    }

    pub fn items(&self) -> Vec<(V::Key, ItemRef<V>)> {
        self.contents
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Add items whose key is not taken yet and emit `added` for them.
    ///
    /// Returns the items that were actually inserted.
    pub fn add<I>(&self, items: I) -> ItemSet<V>
    where
        I: IntoIterator<Item = ItemRef<V>>,
    {
        let mut added = ItemSet::new();
        {
            let mut contents = self.contents.borrow_mut();
            for item in items {
                let key = item.key();
                if contents.contains_key(&key) {
                    continue;
                }
                contents.insert(key, item.clone());
                added.insert(item);
            }
        }
        if !added.is_empty() {
            tracing::trace!(
                target: "library",
                library = self.name.as_deref().unwrap_or(""),
                count = added.len(),
                "Added items"
            );
            self.emit(Signal::Added, &added);
        }
        added
    }

    /// Remove the given items if present and emit `removed` for them.
    pub fn remove<I>(&self, items: I) -> ItemSet<V>
    where
        I: IntoIterator<Item = ItemRef<V>>,
    {
        let mut removed = ItemSet::new();
        {
            let mut contents = self.contents.borrow_mut();
            for item in items {
                let key = item.key();
                if contents.get(&key).is_some_and(|stored| stored.ptr_eq(&item)) {
                    contents.remove(&key);
                    removed.insert(item);
                }
            }
        }
        if !removed.is_empty() {
            tracing::trace!(
                target: "library",
                library = self.name.as_deref().unwrap_or(""),
                count = removed.len(),
                "Removed items"
            );
            self.emit(Signal::Removed, &removed);
        }
        removed
    }

    /// Announce that the given items were modified.
    ///
    /// Items not in this library are ignored. When the library is registered
    /// with a [`Librarian`], the librarian fans the notification out to every
    /// member holding the items.
    pub fn changed<I>(&self, items: I)
    where
        I: IntoIterator<Item = ItemRef<V>>,
    {
        let present: ItemSet<V> = items.into_iter().filter(|i| self.contains(i)).collect();
        if present.is_empty() {
            return;
        }
        let librarian = self.librarian.borrow().as_ref().and_then(Weak::upgrade);
        match librarian {
            Some(librarian) => librarian.changed(&present),
            None => self.emit(Signal::Changed, &present),
        }
    }

    /// Emit `signal` and mark the library dirty.
    pub(crate) fn emit(&self, signal: Signal, items: &ItemSet<V>) {
        if items.is_empty() {
            return;
        }
        self.dirty.set(true);
        self.signals.emit(signal, items);
    }

    /// Insert without emitting. Returns the item previously under that key.
    pub(crate) fn insert_silent(&self, item: ItemRef<V>) -> Option<ItemRef<V>> {
        let key = item.key();
        self.contents.borrow_mut().insert(key, item)
    }

    /// Remove by key without emitting.
    pub(crate) fn take(&self, key: &V::Key) -> Option<ItemRef<V>> {
        self.contents.borrow_mut().remove(key)
    }

    /// Move an item stored under `old_key` to its current key. Emits nothing
    /// for the item; an unrelated item already under the new key is dropped
    /// with `removed`. Returns false when `old_key` does not hold this item.
    pub(crate) fn rekey(&self, item: &ItemRef<V>, old_key: &V::Key) -> bool {
        let new_key = item.key();
        if new_key == *old_key {
            return false;
        }
        let displaced = {
            let mut contents = self.contents.borrow_mut();
            if !contents.get(old_key).is_some_and(|stored| stored.ptr_eq(item)) {
                return false;
            }
            contents.remove(old_key);
            contents
                .insert(new_key, item.clone())
                .filter(|other| !other.ptr_eq(item))
        };
        self.dirty.set(true);
        if let Some(other) = displaced {
            self.emit(Signal::Removed, &ItemSet::from([other]));
        }
        true
    }

    /// Drop an item stored under `old_key` and emit `removed` for it.
    pub(crate) fn drop_held(&self, item: &ItemRef<V>, old_key: &V::Key) -> bool {
        let held = self
            .contents
            .borrow()
            .get(old_key)
            .is_some_and(|stored| stored.ptr_eq(item));
        if held {
            self.contents.borrow_mut().remove(old_key);
            self.emit(Signal::Removed, &ItemSet::from([item.clone()]));
        }
        held
    }

    pub(crate) fn set_librarian(&self, librarian: Option<Weak<Librarian<V>>>) {
        *self.librarian.borrow_mut() = librarian;
    }

    pub(crate) fn librarian(&self) -> Option<Rc<Librarian<V>>> {
        self.librarian.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.set(false);
    }
}

impl<V: AlbumItem> Library<V> {
    /// Every distinct value of `tag` across the library. Multi-value tags
    /// are stored newline-separated and count as separate values.
    pub fn tag_values(&self, tag: &str) -> BTreeSet<String> {
        self.contents
            .borrow()
            .values()
            .filter_map(|item| item.borrow().tag(tag))
            .flat_map(|value| {
                value
                    .split('\n')
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl<V: Item> Default for Library<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Item> AsLibrary<V> for Library<V> {
    fn as_library(&self) -> &Library<V> {
        self
    }
}

impl<V: Item> fmt::Debug for Library<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("dirty", &self.dirty.get())
            .finish()
    }
}
