//! Coordinator over several libraries that may share items.
//!
//! A song can be in the main song library and in a playlist library at the
//! same time. When one of them reports a change, every library holding the
//! song has to report it, or views bound to the other libraries go stale.
//! The librarian keeps a weak list of registered libraries, re-emits all of
//! their signals on its own [`Signals`], and routes `changed` notifications.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};

use super::albums::AlbumItem;
use super::base::AsLibrary;
use super::item::{Item, ItemRef, ItemSet, ReloadOutcome};
use super::signals::{Signal, Signals, SubscriptionId};
use crate::error::{Error, Result};

struct Member<V: Item> {
    library: Weak<dyn AsLibrary<V>>,
    subscriptions: Vec<SubscriptionId>,
}

impl<V: Item> Member<V> {
    fn upgrade(&self) -> Option<Rc<dyn AsLibrary<V>>> {
        self.library.upgrade()
    }
}

/// Stops forwarding until dropped.
struct Mute(Rc<Cell<bool>>);

impl Mute {
    fn new(flag: &Rc<Cell<bool>>) -> Self {
        flag.set(true);
        Self(Rc::clone(flag))
    }
}

impl Drop for Mute {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Registry of named libraries. Share it as `Rc<Librarian<V>>`.
pub struct Librarian<V: Item> {
    members: RefCell<BTreeMap<String, Member<V>>>,
    signals: Signals<V>,
    muted: Rc<Cell<bool>>,
}

impl<V: Item> Librarian<V> {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            members: RefCell::new(BTreeMap::new()),
            signals: Signals::new(),
            muted: Rc::new(Cell::new(false)),
        })
    }

    /// Signals re-emitted from every member library.
    pub fn signals(&self) -> &Signals<V> {
        &self.signals
    }

    /// Register `library` under `name`.
    ///
    /// The librarian only keeps a weak reference; dropping the library is
    /// enough to take it out of routing.
    pub fn register<L>(self: &Rc<Self>, name: &str, library: &Rc<L>) -> Result<()>
    where
        L: AsLibrary<V> + 'static,
    {
        if self.members.borrow().contains_key(name) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }

        let lib = library.as_library();
        let subscriptions = Signal::ALL
            .iter()
            .map(|&signal| {
                let forward = self.signals.clone();
                let muted = Rc::clone(&self.muted);
                lib.connect(signal, move |items| {
                    if !muted.get() {
                        forward.emit(signal, items);
                    }
                })
            })
            .collect();
        lib.set_librarian(Some(Rc::downgrade(self)));

        let shared: Rc<dyn AsLibrary<V>> = library.clone();
        self.members.borrow_mut().insert(
            name.to_string(),
            Member {
                library: Rc::downgrade(&shared),
                subscriptions,
            },
        );
        tracing::debug!(target: "library::librarian", name, "Registered library");
        Ok(())
    }

    /// Remove a library from the registry. Returns false if `name` is unknown.
    pub fn unregister(&self, name: &str) -> bool {
        let Some(member) = self.members.borrow_mut().remove(name) else {
            return false;
        };
        if let Some(library) = member.upgrade() {
            let lib = library.as_library();
            for id in member.subscriptions {
                lib.disconnect(id);
            }
            lib.set_librarian(None);
        }
        tracing::debug!(target: "library::librarian", name, "Unregistered library");
        true
    }

    /// Names of live members, sorted.
    pub fn names(&self) -> Vec<String> {
        self.members
            .borrow()
            .iter()
            .filter(|(_, m)| m.library.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn library(&self, name: &str) -> Option<Rc<dyn AsLibrary<V>>> {
        self.members.borrow().get(name).and_then(Member::upgrade)
    }

    fn live_members(&self) -> Vec<Rc<dyn AsLibrary<V>>> {
        self.members
            .borrow()
            .values()
            .filter_map(Member::upgrade)
            .collect()
    }

    /// Members currently holding this exact item.
    fn holders(&self, item: &ItemRef<V>) -> Vec<Rc<dyn AsLibrary<V>>> {
        self.live_members()
            .into_iter()
            .filter(|library| library.as_library().contains(item))
            .collect()
    }

    /// Emit `changed` from every member for the items it holds.
    pub fn changed(&self, items: &ItemSet<V>) {
        for library in self.live_members() {
            let lib = library.as_library();
            let held: ItemSet<V> = items.iter().filter(|i| lib.contains(i)).cloned().collect();
            lib.emit(Signal::Changed, &held);
        }
    }

    /// The first item stored under `key` in any member.
    pub fn get(&self, key: &V::Key) -> Option<ItemRef<V>> {
        self.live_members()
            .into_iter()
            .find_map(|library| library.as_library().get(key))
    }

    /// Whether any member holds this exact item.
    pub fn contains(&self, item: &ItemRef<V>) -> bool {
        self.live_members()
            .iter()
            .any(|library| library.as_library().contains(item))
    }

    /// Remove the items from every member that holds them.
    pub fn remove(&self, items: &ItemSet<V>) {
        for library in self.live_members() {
            library.as_library().remove(items.iter().cloned());
        }
    }

    /// Move items from one member to another.
    ///
    /// The two members emit `removed` and `added` as usual, but nothing is
    /// forwarded through the librarian: to its listeners the items never
    /// left. Returns the items added to `to`.
    pub fn move_items(&self, items: &ItemSet<V>, from: &str, to: &str) -> Result<ItemSet<V>> {
        let source = self
            .library(from)
            .ok_or_else(|| Error::UnknownLibrary(from.to_string()))?;
        let target = self
            .library(to)
            .ok_or_else(|| Error::UnknownLibrary(to.to_string()))?;

        let _mute = Mute::new(&self.muted);
        source.as_library().remove(items.iter().cloned());
        let added = target.as_library().add(items.iter().cloned());
        tracing::debug!(
            target: "library::librarian",
            from,
            to,
            count = added.len(),
            "Moved items between libraries"
        );
        Ok(added)
    }

    /// Re-key `item` to `new_key` in every member holding it and announce
    /// it as `changed` once.
    ///
    /// The first holder able to relocate the item does so; the others just
    /// follow the new key. Returns false if no holder could relocate it.
    pub fn rename(&self, item: &ItemRef<V>, new_key: &V::Key) -> bool {
        let old_key = item.key();
        let holders = self.holders(item);
        if holders.is_empty() {
            return false;
        }
        tracing::debug!(target: "library::librarian", from = ?old_key, to = ?new_key, "Renaming");
        if !holders.iter().any(|library| library.move_held(item, new_key)) {
            tracing::warn!(target: "library::librarian", key = ?old_key, "No library can rename this item");
            return false;
        }
        for library in &holders {
            library.as_library().rekey(item, &old_key);
        }
        self.changed(&ItemSet::from([item.clone()]));
        true
    }

    /// Force-reload `item` once and update every member holding it.
    ///
    /// The first holder with a backing store does the reload. If the item
    /// is gone, every holder drops it and emits `removed`; if it was
    /// re-read, every holder keeps it and `changed` goes out.
    pub fn reload(&self, item: &ItemRef<V>) -> ReloadOutcome {
        let old_key = item.key();
        let holders = self.holders(item);
        if holders.is_empty() {
            return ReloadOutcome::Absent;
        }
        tracing::debug!(target: "library::librarian", key = ?old_key, "Reloading");
        let Some(outcome) = holders.iter().find_map(|library| library.refresh(item)) else {
            return ReloadOutcome::Unchanged;
        };

        match outcome {
            ReloadOutcome::Changed => {
                for library in &holders {
                    library.as_library().rekey(item, &old_key);
                }
                self.changed(&ItemSet::from([item.clone()]));
            }
            ReloadOutcome::Removed => {
                let gone = ItemSet::from([item.clone()]);
                for library in &holders {
                    let lib = library.as_library();
                    // The reloading holder has already let go of it.
                    if !lib.drop_held(item, &old_key) {
                        lib.emit(Signal::Removed, &gone);
                    }
                }
            }
            ReloadOutcome::Unchanged | ReloadOutcome::Absent => {}
        }
        outcome
    }
}

impl<V: AlbumItem> Librarian<V> {
    /// Every distinct value of `tag` across all members.
    pub fn tag_values(&self, tag: &str) -> BTreeSet<String> {
        self.live_members()
            .iter()
            .flat_map(|library| library.as_library().tag_values(tag))
            .collect()
    }
}

impl<V: Item> Drop for Librarian<V> {
    fn drop(&mut self) {
        for member in std::mem::take(self.members.get_mut()).into_values() {
            if let Some(library) = member.upgrade() {
                let lib = library.as_library();
                for id in member.subscriptions {
                    lib.disconnect(id);
                }
                lib.set_librarian(None);
            }
        }
    }
}

impl<V: Item> fmt::Debug for Librarian<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Librarian")
            .field("members", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::Library;
    use crate::library::paths::normalize_path;
    use crate::test_utils::{FakeMounts, SignalLog, TestTrack, test_library, write_track};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct Song(&'static str);

    impl Item for Song {
        type Key = &'static str;

        fn key(&self) -> &'static str {
            self.0
        }
    }

    fn song(key: &'static str) -> ItemRef<Song> {
        ItemRef::new(Song(key))
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let librarian = Librarian::<Song>::new();
        let a = Rc::new(Library::new());
        let b = Rc::new(Library::new());

        librarian.register("songs", &a).unwrap();
        let err = librarian.register("songs", &b).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(name) if name == "songs"));
    }

    #[test]
    fn test_changed_reaches_every_holder() {
        let librarian = Librarian::<Song>::new();
        let songs = Rc::new(Library::new());
        let playlist = Rc::new(Library::new());
        let other = Rc::new(Library::new());
        librarian.register("songs", &songs).unwrap();
        librarian.register("playlist", &playlist).unwrap();
        librarian.register("other", &other).unwrap();

        let shared = song("a");
        songs.add([shared.clone()]);
        playlist.add([shared.clone()]);
        other.add([song("b")]);

        let songs_log = SignalLog::attach(&*songs);
        let playlist_log = SignalLog::attach(&*playlist);
        let other_log = SignalLog::attach(&*other);

        songs.changed([shared]);
        assert_eq!(songs_log.last(Signal::Changed), Some(vec!["a"]));
        assert_eq!(playlist_log.last(Signal::Changed), Some(vec!["a"]));
        assert_eq!(other_log.count(Signal::Changed), 0);
    }

    #[test]
    fn test_forwards_member_signals() {
        let librarian = Librarian::<Song>::new();
        let songs = Rc::new(Library::new());
        librarian.register("songs", &songs).unwrap();

        let log = SignalLog::from_signals(librarian.signals());
        songs.add([song("a")]);
        assert_eq!(log.last(Signal::Added), Some(vec!["a"]));
    }

    #[test]
    fn test_get_contains_remove() {
        let librarian = Librarian::<Song>::new();
        let songs = Rc::new(Library::new());
        let playlist = Rc::new(Library::new());
        librarian.register("songs", &songs).unwrap();
        librarian.register("playlist", &playlist).unwrap();

        let a = song("a");
        songs.add([a.clone()]);
        playlist.add([a.clone()]);

        assert!(librarian.get(&"a").is_some_and(|found| found.ptr_eq(&a)));
        assert!(librarian.contains(&a));

        librarian.remove(&[a.clone()].into_iter().collect());
        assert!(!librarian.contains(&a));
        assert!(songs.is_empty() && playlist.is_empty());
    }

    #[test]
    fn test_unregister_restores_local_changed() {
        let librarian = Librarian::<Song>::new();
        let songs = Rc::new(Library::new());
        librarian.register("songs", &songs).unwrap();
        assert!(librarian.unregister("songs"));
        assert!(!librarian.unregister("songs"));

        let log = SignalLog::attach(&*songs);
        let a = song("a");
        songs.add([a.clone()]);
        songs.changed([a]);
        assert_eq!(log.count(Signal::Changed), 1);
        assert!(librarian.names().is_empty());
    }

    #[test]
    fn test_move_items_is_silent_on_librarian() {
        let librarian = Librarian::<Song>::new();
        let queue = Rc::new(Library::new());
        let history = Rc::new(Library::new());
        librarian.register("queue", &queue).unwrap();
        librarian.register("history", &history).unwrap();

        let a = song("a");
        let b = song("b");
        queue.add([a.clone(), b.clone()]);
        let queue_log = SignalLog::attach(&*queue);
        let history_log = SignalLog::attach(&*history);
        let log = SignalLog::from_signals(librarian.signals());

        let moved = librarian
            .move_items(&[a.clone()].into_iter().collect(), "queue", "history")
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert!(history.contains(&a) && !queue.contains(&a));
        assert!(queue.contains(&b));
        assert_eq!(queue_log.last(Signal::Removed), Some(vec!["a"]));
        assert_eq!(history_log.last(Signal::Added), Some(vec!["a"]));
        assert_eq!(log.total(), 0);

        // Forwarding resumes afterwards.
        queue.remove([b]);
        assert_eq!(log.last(Signal::Removed), Some(vec!["b"]));
    }

    #[test]
    fn test_move_items_unknown_library() {
        let librarian = Librarian::<Song>::new();
        let queue = Rc::new(Library::new());
        librarian.register("queue", &queue).unwrap();
        let a = song("a");
        queue.add([a.clone()]);

        let err = librarian
            .move_items(&[a.clone()].into_iter().collect(), "queue", "nowhere")
            .unwrap_err();
        assert!(matches!(err, Error::UnknownLibrary(name) if name == "nowhere"));
        assert!(queue.contains(&a));
    }

    type Members = (
        Rc<Librarian<TestTrack>>,
        Rc<crate::library::FileLibrary<TestTrack>>,
        Rc<Library<TestTrack>>,
    );

    fn file_and_playlist() -> Members {
        let librarian = Librarian::new();
        let songs = Rc::new(test_library(FakeMounts::root_only()));
        let playlist = Rc::new(Library::new());
        librarian.register("songs", &songs).unwrap();
        librarian.register("playlist", &playlist).unwrap();
        (librarian, songs, playlist)
    }

    #[test]
    fn test_rename_updates_every_holder() {
        let dir = TempDir::new().unwrap();
        let old = write_track(dir.path(), "old.mp3", "X");
        let (librarian, songs, playlist) = file_and_playlist();
        let item = songs.add_filename(&old, true).unwrap();
        playlist.add([item.clone()]);
        let songs_log = SignalLog::attach(&*songs);
        let playlist_log = SignalLog::attach(&*playlist);

        let new = normalize_path(dir.path()).join("new.mp3");
        fs::rename(&old, &new).unwrap();
        assert!(librarian.rename(&item, &new));

        for library in [songs.as_library(), &*playlist] {
            assert!(!library.contains_key(&old));
            assert!(library.get(&new).is_some_and(|found| found.ptr_eq(&item)));
        }
        assert_eq!(songs_log.last(Signal::Changed), Some(vec![new.clone()]));
        assert_eq!(playlist_log.last(Signal::Changed), Some(vec![new]));
        assert_eq!(playlist_log.count(Signal::Removed), 0);
    }

    #[test]
    fn test_rename_needs_a_relocating_holder() {
        let (librarian, _songs, playlist) = file_and_playlist();
        let item = ItemRef::new(TestTrack::detached("/m/a.mp3", "/"));
        playlist.add([item.clone()]);

        assert!(!librarian.rename(&item, &PathBuf::from("/m/b.mp3")));
        assert!(playlist.contains_key(&PathBuf::from("/m/a.mp3")));
    }

    #[test]
    fn test_reload_changed_reaches_every_holder() {
        let dir = TempDir::new().unwrap();
        let path = write_track(dir.path(), "a.mp3", "Old");
        let (librarian, songs, playlist) = file_and_playlist();
        let item = songs.add_filename(&path, true).unwrap();
        playlist.add([item.clone()]);
        let playlist_log = SignalLog::attach(&*playlist);

        write_track(dir.path(), "a.mp3", "New");
        assert_eq!(librarian.reload(&item), ReloadOutcome::Changed);

        assert_eq!(item.borrow().tag("album").as_deref(), Some("New"));
        assert!(songs.contains(&item) && playlist.contains(&item));
        assert_eq!(playlist_log.last(Signal::Changed), Some(vec![path]));
    }

    #[test]
    fn test_reload_removed_drops_from_every_holder() {
        let dir = TempDir::new().unwrap();
        let path = write_track(dir.path(), "a.mp3", "X");
        let (librarian, songs, playlist) = file_and_playlist();
        let item = songs.add_filename(&path, true).unwrap();
        playlist.add([item.clone()]);
        let songs_log = SignalLog::attach(&*songs);
        let playlist_log = SignalLog::attach(&*playlist);

        fs::remove_file(&path).unwrap();
        assert_eq!(librarian.reload(&item), ReloadOutcome::Removed);

        assert!(songs.is_empty() && playlist.is_empty());
        assert_eq!(songs_log.last(Signal::Removed), Some(vec![path.clone()]));
        assert_eq!(playlist_log.last(Signal::Removed), Some(vec![path]));
        assert_eq!(librarian.reload(&item), ReloadOutcome::Absent);
    }

    #[test]
    fn test_tag_values_across_members() {
        let (librarian, songs, playlist) = file_and_playlist();
        let mut a = TestTrack::detached("/m/a.mp3", "/");
        a.tags.insert("artist".into(), "Nina".into());
        let mut b = TestTrack::detached("/m/b.mp3", "/");
        b.tags.insert("artist".into(), "Miles\nNina".into());
        songs.add([ItemRef::new(a)]);
        playlist.add([ItemRef::new(b)]);

        let artists: Vec<String> = librarian.tag_values("artist").into_iter().collect();
        assert_eq!(artists, vec!["Miles".to_string(), "Nina".to_string()]);
    }

    #[test]
    fn test_dropped_member_leaves_routing() {
        let librarian = Librarian::<Song>::new();
        {
            let songs = Rc::new(Library::new());
            librarian.register("songs", &songs).unwrap();
            assert_eq!(librarian.names(), vec!["songs".to_string()]);
        }
        assert!(librarian.names().is_empty());
        assert!(librarian.library("songs").is_none());
    }
}
