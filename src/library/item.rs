//! Item contracts and shared item handles.
//!
//! Libraries never own bare items. Every item lives behind an [`ItemRef`], a
//! reference-counted handle whose equality and hash are based on identity,
//! so the same track can sit in a song library, an album's song set and a
//! signal payload at once, and a rename or reload is visible everywhere.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::mounts::MountProbe;
use crate::error::Result;

/// Anything that can be stored in a [`Library`](super::Library).
pub trait Item: 'static {
    /// Unique identifier within a library.
    type Key: Clone + Eq + Hash + Ord + fmt::Debug + 'static;

    /// The item's current key. May change after a reload or a move.
    fn key(&self) -> Self::Key;
}

/// An item backed by a file on a (possibly removable) volume.
///
/// The key of a file item is its normalized absolute path.
pub trait FileItem: Item<Key = PathBuf> {
    /// Path of the backing file.
    fn path(&self) -> &Path;

    /// Root of the volume the file lives on.
    fn mountpoint(&self) -> &Path;

    /// Whether the backing file is still there.
    fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Whether the cached data still matches the file (e.g. same mtime).
    fn valid(&self) -> bool;

    /// Whether the item's volume is currently mounted.
    fn mounted(&self, mounts: &dyn MountProbe) -> bool {
        mounts.is_mounted(self.mountpoint())
    }

    /// Re-read the item from its file. On error the item keeps its old data.
    fn reload(&mut self) -> Result<()>;

    /// Point the item at a new location without touching the file.
    fn relocate(&mut self, path: PathBuf, mountpoint: PathBuf);
}

/// Builds items from files.
pub trait ItemLoader<V> {
    /// Whether the file extension is one this loader understands.
    fn filter(&self, path: &Path) -> bool;

    /// Construct an item for `path`, which lives under `mountpoint`.
    ///
    /// Returns [`Error::Unsupported`](crate::error::Error::Unsupported) for
    /// files the loader does not handle.
    fn load(&self, path: &Path, mountpoint: &Path) -> Result<V>;
}

/// Result of re-checking one item against its backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Still valid, nothing touched.
    Unchanged,
    /// Re-read and visible under its (possibly new) key.
    Changed,
    /// Was visible and is not anymore (masked or gone).
    Removed,
    /// Was not visible and still is not.
    Absent,
}

/// Shared, identity-compared handle to an item.
pub struct ItemRef<V>(Rc<RefCell<V>>);

/// A deduplicated set of items, as carried by every signal.
pub type ItemSet<V> = HashSet<ItemRef<V>>;

impl<V> ItemRef<V> {
    pub fn new(item: V) -> Self {
        Self(Rc::new(RefCell::new(item)))
    }

    /// Immutably borrow the item.
    ///
    /// Panics if the item is currently borrowed mutably.
    pub fn borrow(&self) -> Ref<'_, V> {
        self.0.borrow()
    }

    /// Mutably borrow the item.
    pub fn borrow_mut(&self) -> RefMut<'_, V> {
        self.0.borrow_mut()
    }

    /// Whether both handles point at the same item.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<V: Item> ItemRef<V> {
    pub fn key(&self) -> V::Key {
        self.0.borrow().key()
    }
}

impl<V> Clone for ItemRef<V> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<V> PartialEq for ItemRef<V> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<V> Eq for ItemRef<V> {}

impl<V> Hash for ItemRef<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.0), state);
    }
}

impl<V: fmt::Debug> fmt::Debug for ItemRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(item) => f.debug_tuple("ItemRef").field(&*item).finish(),
            Err(_) => f.write_str("ItemRef(<borrowed>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Tag(&'static str);

    impl Item for Tag {
        type Key = &'static str;

        fn key(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn test_identity_not_value_equality() {
        let a = ItemRef::new(Tag("same"));
        let b = ItemRef::new(Tag("same"));
        assert_ne!(a, b);
        assert_eq!(a, a.clone());

        let set: ItemSet<Tag> = [a.clone(), a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_mutation_visible_through_clones() {
        let a = ItemRef::new(Tag("before"));
        let other = a.clone();
        a.borrow_mut().0 = "after";
        assert_eq!(other.key(), "after");
    }
}
