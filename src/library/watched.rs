//! A file library that follows filesystem changes as they happen.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::base::{AsLibrary, Library};
use super::copool::{Phase, Progress, Task};
use super::file::FileLibrary;
use super::item::{FileItem, ItemRef, ItemSet, ReloadOutcome};
use super::paths::{is_excluded, is_hidden, is_under, normalize_path};
use super::persist::Persistent;
use super::watcher::{DirectoryWatcher, FsEvent, FsEventKind, WatchId};

/// Work an event handler cannot finish in one go.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Deferred {
    Scan(PathBuf),
    MoveRoot { from: PathBuf, to: PathBuf },
}

/// A [`FileLibrary`] with one directory watch per known directory.
///
/// Events are pulled from the watcher with
/// [`process_events`](Self::process_events) on the thread that owns the
/// library. Handling an event is cheap; directory scans and root moves it
/// triggers are queued and run through [`run_deferred`](Self::run_deferred).
pub struct WatchedFileLibrary<V: FileItem> {
    files: FileLibrary<V>,
    watcher: RefCell<Box<dyn DirectoryWatcher>>,
    monitors: RefCell<HashMap<PathBuf, WatchId>>,
    deferred: RefCell<VecDeque<Deferred>>,
    exclude: RefCell<Vec<PathBuf>>,
}

impl<V: FileItem> WatchedFileLibrary<V> {
    pub fn new(files: FileLibrary<V>, watcher: Box<dyn DirectoryWatcher>) -> Self {
        Self {
            files,
            watcher: RefCell::new(watcher),
            monitors: RefCell::new(HashMap::new()),
            deferred: RefCell::new(VecDeque::new()),
            exclude: RefCell::new(Vec::new()),
        }
    }

    pub fn files(&self) -> &FileLibrary<V> {
        &self.files
    }

    /// Watch a single directory. Returns false if it was already watched or
    /// the watch could not be installed.
    pub fn monitor_dir(&self, path: &Path) -> bool {
        if self.monitors.borrow().contains_key(path) {
            return false;
        }
        let watched = self.watcher.borrow_mut().watch(path);
        match watched {
            Ok(id) => {
                self.monitors.borrow_mut().insert(path.to_path_buf(), id);
                tracing::debug!(target: "library::watch", path = %path.display(), "Monitoring");
                true
            }
            Err(e) => {
                tracing::warn!(
                    target: "library::watch",
                    path = %path.display(),
                    error = %e,
                    "Couldn't watch directory"
                );
                false
            }
        }
    }

    /// Drop the watch on a directory, if there is one.
    pub fn unmonitor_dir(&self, path: &Path) -> bool {
        let Some(id) = self.monitors.borrow_mut().remove(path) else {
            tracing::debug!(
                target: "library::watch",
                path = %path.display(),
                "Not an active monitor"
            );
            return false;
        };
        self.watcher.borrow_mut().unwatch(id);
        true
    }

    pub fn is_monitored_dir(&self, path: &Path) -> bool {
        self.monitors.borrow().contains_key(path)
    }

    /// Watched directories, sorted.
    pub fn monitored_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.monitors.borrow().keys().cloned().collect();
        dirs.sort();
        dirs
    }

    /// Watch every directory under `paths`. Roots under an `exclude` prefix
    /// are skipped, and the prefixes are kept for scans triggered later by
    /// events.
    pub fn start_watching(&self, paths: &[PathBuf], exclude: &[PathBuf]) -> StartWatching<'_, V> {
        let exclude: Vec<PathBuf> = exclude.iter().map(|p| normalize_path(p)).collect();
        *self.exclude.borrow_mut() = exclude.clone();
        tracing::info!(target: "library::watch", roots = paths.len(), "Setting up file watches");
        StartWatching {
            library: self,
            roots: paths.iter().map(|p| normalize_path(p)).collect(),
            exclude,
            walker: None,
            installed: 0,
        }
    }

    /// Remove every watch.
    pub fn stop_watching(&self) {
        let monitors: Vec<WatchId> = self.monitors.borrow_mut().drain().map(|(_, id)| id).collect();
        if monitors.is_empty() {
            return;
        }
        tracing::info!(target: "library::watch", count = monitors.len(), "Removing watches");
        let mut watcher = self.watcher.borrow_mut();
        for id in monitors {
            watcher.unwatch(id);
        }
    }

    /// Handle every event queued by the watcher. Returns how many there were.
    pub fn process_events(&self) -> usize {
        let events = self.watcher.borrow_mut().poll();
        let count = events.len();
        for event in events {
            self.handle_event(&event);
        }
        count
    }

    /// Apply one filesystem event to the library.
    pub fn handle_event(&self, event: &FsEvent) {
        if event.kind == FsEventKind::ChangesDoneHint {
            return;
        }
        let path = normalize_path(&event.path);
        let other = event.other.as_deref().map(normalize_path);
        let item = self.files.get(&path);
        tracing::trace!(
            target: "library::watch",
            kind = ?event.kind,
            path = %path.display(),
            "File event"
        );

        match event.kind {
            FsEventKind::Created => self.on_created(&path, item),
            FsEventKind::Changed => self.on_changed(&path, item),
            FsEventKind::Renamed => self.on_renamed(&path, other, item),
            FsEventKind::Deleted | FsEventKind::MovedOut => self.on_gone(&path, item),
            FsEventKind::ChangesDoneHint => {}
        }
    }

    /// Whether a path reported by an event belongs in the library at all,
    /// by the same exclude and hidden-file rules scans use.
    fn accepts(&self, path: &Path) -> bool {
        if is_excluded(path, &self.exclude.borrow()) {
            tracing::trace!(target: "library::watch", path = %path.display(), "Excluded, ignoring");
            return false;
        }
        !(self.files.skip_hidden() && is_hidden(path))
    }

    fn on_created(&self, path: &Path, item: Option<ItemRef<V>>) {
        if !self.accepts(path) {
            return;
        }
        if path.is_dir() {
            self.monitor_dir(path);
            self.defer(Deferred::Scan(path.to_path_buf()));
        } else if item.is_none() {
            tracing::debug!(target: "library::watch", path = %path.display(), "Auto-adding created file");
            self.files.add_filename(path, true);
        }
    }

    fn on_changed(&self, path: &Path, item: Option<ItemRef<V>>) {
        match item {
            Some(item) => {
                if !item.borrow().valid() {
                    self.files.reload(&item);
                }
            }
            None if path.is_file() && self.files.recognizes(path) && self.accepts(path) => {
                tracing::debug!(target: "library::watch", path = %path.display(), "Auto-adding new file");
                self.files.add_filename(path, true);
            }
            None => {}
        }
    }

    fn on_renamed(&self, path: &Path, other: Option<PathBuf>, item: Option<ItemRef<V>>) {
        let Some(to) = other else {
            tracing::warn!(
                target: "library::watch",
                path = %path.display(),
                "No destination found for rename"
            );
            if let Some(item) = item {
                self.files.reload(&item);
            }
            return;
        };

        if let Some(item) = item {
            tracing::debug!(
                target: "library::watch",
                from = %path.display(),
                to = %to.display(),
                "Moving renamed file"
            );
            self.files.rename(&item, &to);
        } else if self.is_monitored_dir(path) {
            tracing::debug!(
                target: "library::watch",
                from = %path.display(),
                to = %to.display(),
                "Moving tracks of renamed directory"
            );
            self.rehome_monitors(path, &to);
            self.defer(Deferred::MoveRoot {
                from: path.to_path_buf(),
                to,
            });
        } else if self.accepts(&to) {
            // Some platforms report a change first, which can drop the item
            // before the rename arrives.
            self.files.add_filename(&to, true);
        }
    }

    fn on_gone(&self, path: &Path, item: Option<ItemRef<V>>) {
        if let Some(item) = item {
            tracing::debug!(target: "library::watch", path = %path.display(), "File is gone");
            self.files.reload(&item);
            return;
        }

        for dir in self.monitored_under(path) {
            self.unmonitor_dir(&dir);
        }
        let gone: ItemSet<V> = self
            .files
            .items()
            .into_iter()
            .filter(|(key, _)| key != path && is_under(key, path))
            .map(|(_, item)| item)
            .collect();
        if gone.is_empty() {
            return;
        }
        tracing::debug!(
            target: "library::watch",
            path = %path.display(),
            count = gone.len(),
            "Removing contained tracks"
        );
        let expected = gone.len();
        let removed = self.files.remove(gone);
        if removed.len() != expected {
            tracing::warn!(
                target: "library::watch",
                count = expected - removed.len(),
                "Couldn't remove all contained tracks"
            );
        }
    }

    fn monitored_under(&self, root: &Path) -> Vec<PathBuf> {
        self.monitors
            .borrow()
            .keys()
            .filter(|dir| is_under(dir, root))
            .cloned()
            .collect()
    }

    fn rehome_monitors(&self, from: &Path, to: &Path) {
        for dir in self.monitored_under(from) {
            self.unmonitor_dir(&dir);
            if let Ok(relative) = dir.strip_prefix(from) {
                let moved = if relative.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(relative)
                };
                self.monitor_dir(&moved);
            }
        }
    }

    fn defer(&self, work: Deferred) {
        let mut deferred = self.deferred.borrow_mut();
        if !deferred.contains(&work) {
            deferred.push_back(work);
        }
    }

    /// Whether event handling queued work for [`run_deferred`](Self::run_deferred).
    pub fn has_deferred(&self) -> bool {
        !self.deferred.borrow().is_empty()
    }

    /// Run queued scans and root moves as one resumable task.
    pub fn run_deferred(&self) -> DeferredWork<'_, V> {
        DeferredWork {
            library: self,
            current: None,
        }
    }
}

impl<V: FileItem> Deref for WatchedFileLibrary<V> {
    type Target = FileLibrary<V>;

    fn deref(&self) -> &FileLibrary<V> {
        &self.files
    }
}

impl<V: FileItem> AsLibrary<V> for WatchedFileLibrary<V> {
    fn as_library(&self) -> &Library<V> {
        self.files.as_library()
    }

    fn move_held(&self, item: &ItemRef<V>, new_key: &V::Key) -> bool {
        self.files.move_held(item, new_key)
    }

    fn refresh(&self, item: &ItemRef<V>) -> Option<ReloadOutcome> {
        self.files.refresh(item)
    }
}

impl<V: FileItem> Persistent<V> for WatchedFileLibrary<V> {
    fn load_init(&self, items: Vec<V>) {
        self.files.load_init(items);
    }

    fn content(&self) -> Vec<ItemRef<V>> {
        self.files.content()
    }
}

impl<V: FileItem> Drop for WatchedFileLibrary<V> {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

impl<V: FileItem> fmt::Debug for WatchedFileLibrary<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchedFileLibrary")
            .field("files", &self.files)
            .field("monitors", &self.monitors.borrow().len())
            .field("deferred", &self.deferred.borrow().len())
            .finish()
    }
}

/// Resumable watch setup. See [`WatchedFileLibrary::start_watching`].
pub struct StartWatching<'a, V: FileItem> {
    library: &'a WatchedFileLibrary<V>,
    roots: VecDeque<PathBuf>,
    exclude: Vec<PathBuf>,
    walker: Option<walkdir::IntoIter>,
    installed: usize,
}

impl<V: FileItem> Iterator for StartWatching<'_, V> {
    type Item = Progress;

    fn next(&mut self) -> Option<Progress> {
        let mut batch = 0;
        loop {
            let Some(walker) = self.walker.as_mut() else {
                let root = self.roots.pop_front()?;
                if is_excluded(&root, &self.exclude) {
                    tracing::debug!(target: "library::watch", path = %root.display(), "Root is excluded");
                    continue;
                }
                self.walker = Some(WalkDir::new(root).follow_links(false).into_iter());
                continue;
            };

            let Some(entry) = walker.next() else {
                self.walker = None;
                return Some(Progress::new(Phase::Watch, self.installed, None));
            };
            let Ok(entry) = entry else {
                continue;
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            if is_excluded(entry.path(), &self.exclude) {
                walker.skip_current_dir();
                continue;
            }
            if self.library.monitor_dir(entry.path()) {
                self.installed += 1;
            }
            batch += 1;
            if batch >= 50 {
                return Some(Progress::new(Phase::Watch, self.installed, None));
            }
        }
    }
}

/// Queued event work run as one task. See
/// [`WatchedFileLibrary::run_deferred`].
pub struct DeferredWork<'a, V: FileItem> {
    library: &'a WatchedFileLibrary<V>,
    current: Option<Task<'a>>,
}

impl<'a, V: FileItem> Iterator for DeferredWork<'a, V> {
    type Item = Progress;

    fn next(&mut self) -> Option<Progress> {
        loop {
            if let Some(task) = self.current.as_mut() {
                if let Some(progress) = task.next() {
                    return Some(progress);
                }
                self.current = None;
            }

            let work = self.library.deferred.borrow_mut().pop_front()?;
            let files: &'a FileLibrary<V> = &self.library.files;
            self.current = match work {
                Deferred::Scan(path) => {
                    let exclude = self.library.exclude.borrow().clone();
                    Some(Box::new(files.scan(&[path], &exclude)) as Task<'a>)
                }
                Deferred::MoveRoot { from, to } => match files.move_root(&from, &to) {
                    Ok(task) => Some(Box::new(task) as Task<'a>),
                    Err(e) => {
                        tracing::warn!(target: "library::watch", error = %e, "Could not move root");
                        None
                    }
                },
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::signals::Signal;
    use crate::test_utils::{
        FakeMounts, ManualWatcher, SignalLog, TestTrack, bump_mtime, test_library, write_track,
    };
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        watcher: ManualWatcher,
        library: WatchedFileLibrary<TestTrack>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = normalize_path(dir.path());
        let watcher = ManualWatcher::default();
        let library = WatchedFileLibrary::new(
            test_library(FakeMounts::root_only()),
            Box::new(watcher.clone()),
        );
        Fixture {
            _dir: dir,
            root,
            watcher,
            library,
        }
    }

    fn drain(library: &WatchedFileLibrary<TestTrack>) {
        library.process_events();
        library.run_deferred().for_each(drop);
    }

    #[test]
    fn test_one_monitor_per_dir() {
        let fx = fixture();
        assert!(fx.library.monitor_dir(&fx.root));
        assert!(!fx.library.monitor_dir(&fx.root));
        assert_eq!(fx.watcher.watched(), vec![fx.root.clone()]);

        assert!(fx.library.unmonitor_dir(&fx.root));
        assert!(!fx.library.unmonitor_dir(&fx.root));
        assert!(fx.watcher.watched().is_empty());
    }

    #[test]
    fn test_monitor_failure_is_skipped() {
        let fx = fixture();
        fx.watcher.fail_on(&fx.root);
        assert!(!fx.library.monitor_dir(&fx.root));
        assert!(!fx.library.is_monitored_dir(&fx.root));
    }

    #[test]
    fn test_start_and_stop_watching() {
        let fx = fixture();
        fs::create_dir_all(fx.root.join("a/b")).unwrap();
        fs::create_dir_all(fx.root.join("skip/c")).unwrap();

        fx.library
            .start_watching(&[fx.root.clone()], &[fx.root.join("skip")])
            .for_each(drop);
        assert_eq!(
            fx.library.monitored_dirs(),
            vec![fx.root.clone(), fx.root.join("a"), fx.root.join("a/b")]
        );

        fx.library.stop_watching();
        assert!(fx.library.monitored_dirs().is_empty());
        assert!(fx.watcher.watched().is_empty());
    }

    #[test]
    fn test_created_file_is_added() {
        let fx = fixture();
        let path = write_track(&fx.root, "a.mp3", "X");
        fx.watcher.push(FsEvent::new(FsEventKind::Created, &path));
        drain(&fx.library);
        assert!(fx.library.contains_filename(&path));
    }

    #[test]
    fn test_created_excluded_or_hidden_is_ignored() {
        let fx = fixture();
        let skip = fx.root.join("skip");
        fs::create_dir_all(&skip).unwrap();
        fx.library
            .start_watching(&[fx.root.clone()], &[skip.clone()])
            .for_each(drop);

        let excluded_file = write_track(&skip, "a.mp3", "X");
        let hidden_file = write_track(&fx.root, ".b.mp3", "X");
        let excluded_dir = skip.join("album");
        write_track(&excluded_dir, "c.mp3", "X");
        let hidden_dir = fx.root.join(".cache");
        write_track(&hidden_dir, "d.mp3", "X");
        for path in [&excluded_file, &hidden_file, &excluded_dir, &hidden_dir] {
            fx.watcher.push(FsEvent::new(FsEventKind::Created, path));
        }
        drain(&fx.library);

        assert!(fx.library.is_empty());
        assert!(!fx.library.is_monitored_dir(&excluded_dir));
        assert!(!fx.library.is_monitored_dir(&hidden_dir));

        // Same events are honoured once hidden files are allowed.
        let dir = TempDir::new().unwrap();
        let root = normalize_path(dir.path());
        let watcher = ManualWatcher::default();
        let library = WatchedFileLibrary::new(
            test_library(FakeMounts::root_only()).with_skip_hidden(false),
            Box::new(watcher.clone()),
        );
        let hidden_file = write_track(&root, ".b.mp3", "X");
        watcher.push(FsEvent::new(FsEventKind::Created, &hidden_file));
        drain(&library);
        assert!(library.contains_filename(&hidden_file));
    }

    #[test]
    fn test_created_dir_is_watched_and_scanned() {
        let fx = fixture();
        let album = fx.root.join("album");
        write_track(&album, "a.mp3", "X");
        write_track(&album, "b.mp3", "X");

        fx.watcher.push(FsEvent::new(FsEventKind::Created, &album));
        fx.library.process_events();
        assert!(fx.library.is_monitored_dir(&album));
        assert!(fx.library.has_deferred());

        fx.library.run_deferred().for_each(drop);
        assert_eq!(fx.library.len(), 2);
        assert!(!fx.library.has_deferred());
    }

    #[test]
    fn test_changed_reloads_stale_item() {
        let fx = fixture();
        let path = write_track(&fx.root, "a.mp3", "Old");
        let item = fx.library.add_filename(&path, true).unwrap();
        let log = SignalLog::attach(&fx.library);

        // Unmodified file: valid, nothing to do.
        fx.watcher.push(FsEvent::new(FsEventKind::Changed, &path));
        drain(&fx.library);
        assert_eq!(log.count(Signal::Changed), 0);

        write_track(&fx.root, "a.mp3", "New");
        bump_mtime(&path);
        fx.watcher.push(FsEvent::new(FsEventKind::Changed, &path));
        drain(&fx.library);
        assert_eq!(log.count(Signal::Changed), 1);
        assert_eq!(item.borrow().tag("album").as_deref(), Some("New"));
    }

    #[test]
    fn test_changed_unknown_file_is_added() {
        let fx = fixture();
        let song = write_track(&fx.root, "a.mp3", "X");
        let other = write_track(&fx.root, "notes.txt", "X");
        fx.watcher.push(FsEvent::new(FsEventKind::Changed, &song));
        fx.watcher.push(FsEvent::new(FsEventKind::Changed, &other));
        drain(&fx.library);
        assert_eq!(fx.library.keys(), vec![song]);
    }

    #[test]
    fn test_renamed_file_keeps_identity() {
        let fx = fixture();
        let old = write_track(&fx.root, "old.mp3", "X");
        let item = fx.library.add_filename(&old, true).unwrap();
        let log = SignalLog::attach(&fx.library);

        let new = fx.root.join("new.mp3");
        fs::rename(&old, &new).unwrap();
        fx.watcher.push(FsEvent::renamed(&old, &new));
        drain(&fx.library);

        assert!(!fx.library.contains_key(&old));
        assert!(fx.library.get(&new).is_some_and(|found| found.ptr_eq(&item)));
        assert_eq!(log.count(Signal::Changed), 1);
        assert_eq!(log.count(Signal::Removed), 0);
        assert_eq!(log.count(Signal::Added), 0);
    }

    #[test]
    fn test_renamed_unknown_source_adds_destination() {
        let fx = fixture();
        let new = write_track(&fx.root, "new.mp3", "X");
        fx.watcher
            .push(FsEvent::renamed(fx.root.join("partial.tmp"), &new));
        drain(&fx.library);
        assert!(fx.library.contains_filename(&new));
    }

    #[test]
    fn test_renamed_dir_moves_tracks_and_monitors() {
        let fx = fixture();
        let old_dir = fx.root.join("old");
        let a = write_track(&old_dir, "a.mp3", "X");
        let b = write_track(&old_dir.join("cd2"), "b.mp3", "X");
        fx.library.start_watching(&[fx.root.clone()], &[]).for_each(drop);
        fx.library.scan(&[fx.root.clone()], &[]).for_each(drop);
        assert_eq!(fx.library.len(), 2);

        let new_dir = fx.root.join("new");
        fs::rename(&old_dir, &new_dir).unwrap();
        fx.watcher.push(FsEvent::renamed(&old_dir, &new_dir));
        drain(&fx.library);

        assert!(!fx.library.contains_key(&a) && !fx.library.contains_key(&b));
        assert!(fx.library.contains_key(&new_dir.join("a.mp3")));
        assert!(fx.library.contains_key(&new_dir.join("cd2/b.mp3")));
        assert!(!fx.library.is_monitored_dir(&old_dir));
        assert!(fx.library.is_monitored_dir(&new_dir));
        assert!(fx.library.is_monitored_dir(&new_dir.join("cd2")));
    }

    #[test]
    fn test_deleted_file_is_removed() {
        let fx = fixture();
        let path = write_track(&fx.root, "a.mp3", "X");
        fx.library.add_filename(&path, true).unwrap();
        let log = SignalLog::attach(&fx.library);

        fs::remove_file(&path).unwrap();
        fx.watcher.push(FsEvent::new(FsEventKind::Deleted, &path));
        drain(&fx.library);
        assert!(fx.library.is_empty());
        assert_eq!(log.count(Signal::Removed), 1);
    }

    #[test]
    fn test_deleted_dir_removes_contents_in_one_batch() {
        let fx = fixture();
        let album = fx.root.join("album");
        write_track(&album, "a.mp3", "X");
        write_track(&album.join("cd2"), "b.mp3", "X");
        let keep = write_track(&fx.root, "keep.mp3", "X");
        fx.library.start_watching(&[fx.root.clone()], &[]).for_each(drop);
        fx.library.scan(&[fx.root.clone()], &[]).for_each(drop);
        let log = SignalLog::attach(&fx.library);

        fs::remove_dir_all(&album).unwrap();
        fx.watcher.push(FsEvent::new(FsEventKind::MovedOut, &album));
        drain(&fx.library);

        assert_eq!(fx.library.keys(), vec![keep]);
        assert_eq!(log.count(Signal::Removed), 1);
        assert_eq!(log.last(Signal::Removed).map(|k| k.len()), Some(2));
        assert!(!fx.library.is_monitored_dir(&album));
        assert!(!fx.library.is_monitored_dir(&album.join("cd2")));
        assert!(fx.library.is_monitored_dir(&fx.root));
    }

    #[test]
    fn test_changes_done_hint_is_ignored() {
        let fx = fixture();
        let path = write_track(&fx.root, "a.mp3", "X");
        fx.watcher
            .push(FsEvent::new(FsEventKind::ChangesDoneHint, &path));
        assert_eq!(fx.library.process_events(), 1);
        assert!(fx.library.is_empty());
    }

    #[test]
    fn test_drop_removes_watches() {
        let fx = fixture();
        fx.library.monitor_dir(&fx.root);
        let watcher = fx.watcher.clone();
        drop(fx.library);
        assert!(watcher.watched().is_empty());
    }
}
