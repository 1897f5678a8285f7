//! Test utilities and fixtures for tunedex tests.
//!
//! This module provides in-memory stand-ins for the parts of the engine that
//! normally touch the system (mount probing, directory watching, tag
//! reading), plus a signal recorder, so library tests stay small.
//!
//! # Example
//!
//! ```ignore
//! use tunedex::test_utils::{FakeMounts, SignalLog, test_library, write_track};
//!
//! let dir = tempfile::TempDir::new().unwrap();
//! let library = test_library(FakeMounts::root_only());
//! let log = SignalLog::attach(&library);
//! write_track(dir.path(), "a.mp3", "Album");
//! library.scan(&[dir.path().to_path_buf()], &[]).for_each(drop);
//! assert_eq!(log.count(Signal::Added), 1);
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::library::albums::AlbumItem;
use crate::library::base::AsLibrary;
use crate::library::file::FileLibrary;
use crate::library::item::{FileItem, Item, ItemLoader};
use crate::library::mounts::MountProbe;
use crate::library::normalize_path;
use crate::library::signals::{Signal, Signals};
use crate::library::watcher::{DirectoryWatcher, FsEvent, WatchError, WatchId};

// ============================================================================
// Items
// ============================================================================

/// A track whose "tags" are `key=value` lines in a plain text file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestTrack {
    pub path: PathBuf,
    pub mountpoint: PathBuf,
    pub mtime: Option<SystemTime>,
    pub tags: BTreeMap<String, String>,
}

impl TestTrack {
    /// A track that has never been read from disk.
    pub fn detached(path: impl Into<PathBuf>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mountpoint: mountpoint.into(),
            mtime: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn tag(&self, name: &str) -> Option<String> {
        self.tags.get(name).cloned()
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl Item for TestTrack {
    type Key = PathBuf;

    fn key(&self) -> PathBuf {
        self.path.clone()
    }
}

impl FileItem for TestTrack {
    fn path(&self) -> &Path {
        &self.path
    }

    fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    fn valid(&self) -> bool {
        self.mtime.is_some() && self.mtime == file_mtime(&self.path)
    }

    fn reload(&mut self) -> Result<()> {
        let text = fs::read_to_string(&self.path)
            .map_err(|e| Error::load(&self.path, e.to_string()))?;
        self.tags = text
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
            .collect();
        self.mtime = file_mtime(&self.path);
        Ok(())
    }

    fn relocate(&mut self, path: PathBuf, mountpoint: PathBuf) {
        self.path = path;
        self.mountpoint = mountpoint;
    }
}

impl AlbumItem for TestTrack {
    fn tag(&self, name: &str) -> Option<String> {
        TestTrack::tag(self, name)
    }
}

/// Loads [`TestTrack`]s from `.mp3`, `.flac` and `.ogg` text files.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextTagLoader;

impl ItemLoader<TestTrack> for TextTagLoader {
    fn filter(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .is_some_and(|e| matches!(e.as_str(), "mp3" | "flac" | "ogg"))
    }

    fn load(&self, path: &Path, mountpoint: &Path) -> Result<TestTrack> {
        if !self.filter(path) {
            return Err(Error::Unsupported(path.to_path_buf()));
        }
        let mut track = TestTrack::detached(path, mountpoint);
        track.reload()?;
        Ok(track)
    }
}

/// A file library of [`TestTrack`]s using the given mount table.
pub fn test_library(mounts: FakeMounts) -> FileLibrary<TestTrack> {
    FileLibrary::new("songs", Rc::new(TextTagLoader)).with_mounts(Rc::new(mounts))
}

/// Write a track file tagged with `album` and return its normalized path.
pub fn write_track(dir: &Path, name: &str, album: &str) -> PathBuf {
    fs::create_dir_all(dir).expect("Failed to create track directory");
    let path = dir.join(name);
    fs::write(&path, format!("album={album}\ntitle={name}\n")).expect("Failed to write track");
    normalize_path(&path)
}

/// Move a file's mtime forward so cached items see it as modified.
pub fn bump_mtime(path: &Path) {
    let current = file_mtime(path).unwrap_or_else(SystemTime::now);
    fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(current + Duration::from_secs(5)))
        .expect("Failed to bump mtime");
}

// ============================================================================
// Mounts
// ============================================================================

#[derive(Debug, Default)]
struct MountTable {
    points: BTreeSet<PathBuf>,
    unmounted: BTreeSet<PathBuf>,
}

/// In-memory mount table. Clones share state, so a test can unplug a
/// "drive" after handing the probe to a library.
///
/// The filesystem root always counts as mounted.
#[derive(Debug, Clone, Default)]
pub struct FakeMounts(Rc<RefCell<MountTable>>);

impl FakeMounts {
    pub fn new<P: AsRef<Path>>(points: impl IntoIterator<Item = P>) -> Self {
        let mounts = Self::default();
        mounts.0.borrow_mut().points = points
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .collect();
        mounts
    }

    /// Only the filesystem root is mounted.
    pub fn root_only() -> Self {
        Self::default()
    }

    pub fn mount(&self, point: impl AsRef<Path>) {
        let point = point.as_ref().to_path_buf();
        let mut table = self.0.borrow_mut();
        table.unmounted.remove(&point);
        table.points.insert(point);
    }

    pub fn unmount(&self, point: impl AsRef<Path>) {
        self.0
            .borrow_mut()
            .unmounted
            .insert(point.as_ref().to_path_buf());
    }
}

impl MountProbe for FakeMounts {
    fn is_mounted(&self, path: &Path) -> bool {
        if path.parent().is_none() {
            return true;
        }
        let table = self.0.borrow();
        table.points.contains(path) && !table.unmounted.contains(path)
    }
}

// ============================================================================
// Watcher
// ============================================================================

#[derive(Debug, Default)]
struct WatchTable {
    next_id: u64,
    watches: BTreeMap<u64, PathBuf>,
    queue: Vec<FsEvent>,
    failing: HashSet<PathBuf>,
}

/// A [`DirectoryWatcher`] driven by the test: events are queued with
/// [`push`](Self::push) and delivered on the next poll. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ManualWatcher(Rc<RefCell<WatchTable>>);

impl ManualWatcher {
    pub fn push(&self, event: FsEvent) {
        self.0.borrow_mut().queue.push(event);
    }

    /// Currently watched directories, sorted.
    pub fn watched(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.0.borrow().watches.values().cloned().collect();
        paths.sort();
        paths
    }

    /// Make every future `watch` of `path` fail.
    pub fn fail_on(&self, path: &Path) {
        self.0.borrow_mut().failing.insert(path.to_path_buf());
    }
}

impl DirectoryWatcher for ManualWatcher {
    fn watch(&mut self, path: &Path) -> std::result::Result<WatchId, WatchError> {
        let mut table = self.0.borrow_mut();
        if table.failing.contains(path) {
            return Err(WatchError::Watch(format!("{}: refused", path.display())));
        }
        table.next_id += 1;
        let id = table.next_id;
        table.watches.insert(id, path.to_path_buf());
        Ok(WatchId(id))
    }

    fn unwatch(&mut self, id: WatchId) {
        self.0.borrow_mut().watches.remove(&id.0);
    }

    fn poll(&mut self) -> Vec<FsEvent> {
        std::mem::take(&mut self.0.borrow_mut().queue)
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Records every emission of a library's signals as sorted key lists.
pub struct SignalLog<V: Item> {
    events: Rc<RefCell<Vec<(Signal, Vec<V::Key>)>>>,
}

impl<V: Item> SignalLog<V> {
    pub fn attach<L: AsLibrary<V>>(library: &L) -> Self {
        Self::from_signals(library.as_library().signals())
    }

    pub fn from_signals(signals: &Signals<V>) -> Self {
        let events = Rc::new(RefCell::new(Vec::new()));
        for signal in Signal::ALL {
            let sink = Rc::clone(&events);
            signals.connect(signal, move |items| {
                let mut keys: Vec<V::Key> = items.iter().map(|item| item.key()).collect();
                keys.sort();
                sink.borrow_mut().push((signal, keys));
            });
        }
        Self { events }
    }

    /// How many times `signal` fired.
    pub fn count(&self, signal: Signal) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|(s, _)| *s == signal)
            .count()
    }

    /// Keys carried by the most recent `signal`.
    pub fn last(&self, signal: Signal) -> Option<Vec<V::Key>> {
        self.events
            .borrow()
            .iter()
            .rev()
            .find(|(s, _)| *s == signal)
            .map(|(_, keys)| keys.clone())
    }

    /// Key lists of every `signal` emission, oldest first.
    pub fn batches(&self, signal: Signal) -> Vec<Vec<V::Key>> {
        self.events
            .borrow()
            .iter()
            .filter(|(s, _)| *s == signal)
            .map(|(_, keys)| keys.clone())
            .collect()
    }

    /// Emissions of any signal.
    pub fn total(&self) -> usize {
        self.events.borrow().len()
    }
}
