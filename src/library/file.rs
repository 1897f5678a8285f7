//! Libraries of file-backed items on possibly removable storage.
//!
//! A [`FileLibrary`] keeps two kinds of items: visible ones in the regular
//! [`Library`] map, and masked ones whose volume is not mounted right now,
//! bucketed by mount point. A key is always in exactly one of the two.
//!
//! Full rescans are resumable iterators ([`Rebuild`], [`Scan`]) that do a
//! bounded slice of work per `next()` and batch their signals, so a host can
//! keep handling events while a large collection is checked.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::base::{AsLibrary, Library};
use super::copool::{Phase, Progress};
use super::item::{FileItem, ItemLoader, ItemRef, ItemSet, ReloadOutcome};
use super::mounts::{MountProbe, SystemMounts, find_mountpoint};
use super::paths::{clean_path, is_under, iter_paths, normalize_path};
use super::persist::{Persistent, compare_keys};
use super::signals::Signal;
use crate::error::{Error, Result};

/// Batch sizes and time slices for rebuilds and scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPacing {
    /// Flush `changed`/`removed` once a batch reaches this size.
    pub signal_batch: usize,
    /// Yield at least every this many checked items.
    pub check_batch: usize,
    /// Add loaded files once this many are pending.
    pub add_batch: usize,
    /// Longest stretch of walking or loading between yields.
    pub yield_interval: Duration,
    /// Longest time loaded files wait before being added.
    pub add_interval: Duration,
}

impl Default for ScanPacing {
    fn default() -> Self {
        Self {
            signal_batch: 200,
            check_batch: 200,
            add_batch: 100,
            yield_interval: Duration::from_millis(15),
            add_interval: Duration::from_secs(1),
        }
    }
}


type Bucket<V> = HashMap<PathBuf, ItemRef<V>>;

/// A library of items backed by files.
pub struct FileLibrary<V: FileItem> {
    base: Library<V>,
    masked: RefCell<BTreeMap<PathBuf, Bucket<V>>>,
    mounts: Rc<dyn MountProbe>,
    loader: Rc<dyn ItemLoader<V>>,
    pacing: ScanPacing,
    skip_hidden: bool,
}

impl<V: FileItem> FileLibrary<V> {
    pub fn new(name: impl Into<String>, loader: Rc<dyn ItemLoader<V>>) -> Self {
        Self {
            base: Library::named(name),
            masked: RefCell::new(BTreeMap::new()),
            mounts: Rc::new(SystemMounts::new()),
            loader,
            pacing: ScanPacing::default(),
            skip_hidden: true,
        }
    }

    /// Use a different mount probe.
    pub fn with_mounts(mut self, mounts: Rc<dyn MountProbe>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn with_pacing(mut self, pacing: ScanPacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Whether scans skip dot-files and dot-directories. On by default.
    pub fn with_skip_hidden(mut self, skip_hidden: bool) -> Self {
        self.skip_hidden = skip_hidden;
        self
    }

    pub fn pacing(&self) -> &ScanPacing {
        &self.pacing
    }

    pub fn skip_hidden(&self) -> bool {
        self.skip_hidden
    }

    pub fn mounts(&self) -> &dyn MountProbe {
        &*self.mounts
    }

    fn log_name(&self) -> &str {
        self.base.name().unwrap_or("")
    }

    /// Mount point of the volume holding `path`.
    pub fn mountpoint_for(&self, path: &Path) -> PathBuf {
        let dir = path.parent().unwrap_or(path);
        find_mountpoint(dir, &*self.mounts)
    }

    /// Build an item with the loader. Failures are logged, never raised.
    pub(crate) fn construct(&self, path: &Path, mountpoint: &Path) -> Option<V> {
        match self.loader.load(path, mountpoint) {
            Ok(item) => Some(item),
            Err(Error::Unsupported(_)) => {
                tracing::debug!(target: "library::file", path = %path.display(), "Unsupported file");
                None
            }
            Err(e) => {
                tracing::warn!(
                    target: "library::file",
                    path = %path.display(),
                    error = %e,
                    "Could not load file"
                );
                None
            }
        }
    }

    /// Whether the loader recognises the file's extension.
    pub fn recognizes(&self, path: &Path) -> bool {
        self.loader.filter(path)
    }

    /// Load the file at `path` as an item.
    ///
    /// Returns the item if it is in the library after the call. With
    /// `add == false` the new item is returned without being added, so many
    /// files can be loaded and then added in one batch.
    pub fn add_filename(&self, path: &Path, add: bool) -> Option<ItemRef<V>> {
        let key = normalize_path(path);
        if let Some(existing) = self.base.get(&key) {
            tracing::trace!(target: "library::file", path = %key.display(), "Already known");
            return Some(existing);
        }
        if !self.loader.filter(&key) {
            return None;
        }
        let mountpoint = self.mountpoint_for(&key);
        let item = ItemRef::new(self.construct(&key, &mountpoint)?);
        if add {
            self.base.add([item.clone()]);
        }
        Some(item)
    }

    /// Whether a visible item exists for this file.
    pub fn contains_filename(&self, path: &Path) -> bool {
        self.base.contains_key(&normalize_path(path))
    }

    /// Whether this exact item is in a masked bucket.
    pub fn is_masked(&self, item: &ItemRef<V>) -> bool {
        let (point, key) = {
            let inner = item.borrow();
            (inner.mountpoint().to_path_buf(), inner.key())
        };
        self.masked
            .borrow()
            .get(&point)
            .and_then(|bucket| bucket.get(&key))
            .is_some_and(|stored| stored.ptr_eq(item))
    }

    /// Mount points that currently hold masked items.
    pub fn masked_mount_points(&self) -> Vec<PathBuf> {
        self.masked.borrow().keys().cloned().collect()
    }

    /// Masked items for one mount point.
    pub fn get_masked(&self, point: &Path) -> Vec<ItemRef<V>> {
        self.masked
            .borrow()
            .get(point)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget every masked item of a mount point. Emits nothing, since the
    /// items were not visible. Returns how many were dropped.
    pub fn remove_masked(&self, point: &Path) -> usize {
        let dropped = self
            .masked
            .borrow_mut()
            .remove(point)
            .map_or(0, |bucket| bucket.len());
        if dropped > 0 {
            self.base.mark_dirty();
        }
        dropped
    }

    /// Hide every visible item on `point`, emitting `removed` for them.
    pub fn mask(&self, point: &Path) {
        let hidden: Vec<ItemRef<V>> = self
            .base
            .values()
            .into_iter()
            .filter(|item| item.borrow().mountpoint() == point)
            .collect();
        if hidden.is_empty() {
            return;
        }
        tracing::debug!(
            target: "library::file",
            library = self.log_name(),
            point = %point.display(),
            count = hidden.len(),
            "Masking mount point"
        );
        let mut removed = ItemSet::new();
        {
            let mut masked = self.masked.borrow_mut();
            let bucket = masked.entry(point.to_path_buf()).or_default();
            for item in hidden {
                let key = item.key();
                self.base.take(&key);
                bucket.insert(key, item.clone());
                removed.insert(item);
            }
        }
        self.base.emit(Signal::Removed, &removed);
    }

    /// Bring back every masked item of `point`, emitting `added` for them.
    pub fn unmask(&self, point: &Path) {
        let bucket = self.masked.borrow_mut().remove(point);
        if let Some(bucket) = bucket.filter(|b| !b.is_empty()) {
            tracing::debug!(
                target: "library::file",
                library = self.log_name(),
                point = %point.display(),
                count = bucket.len(),
                "Unmasking mount point"
            );
            self.base.add(bucket.into_values());
        }
    }

    /// Re-check one item against its file. Emits nothing.
    ///
    /// Unless forced, a valid item is left alone. Otherwise the item is
    /// taken out and, depending on the file, reloaded and put back, masked
    /// because its volume is gone, or dropped.
    ///
    /// Masked items stay in their bucket until their mount point is
    /// unmasked, so they report `Absent`.
    pub fn load_item(&self, item: &ItemRef<V>, force: bool) -> ReloadOutcome {
        if !force && item.borrow().valid() {
            return ReloadOutcome::Unchanged;
        }
        if self.is_masked(item) {
            tracing::trace!(target: "library::file", path = %item.key().display(), "Masked, not reloading");
            return ReloadOutcome::Absent;
        }

        let key = item.key();
        let present = self.base.get(&key).is_some_and(|stored| stored.ptr_eq(item));
        if present {
            self.base.take(&key);
        }
        let gone = if present {
            ReloadOutcome::Removed
        } else {
            ReloadOutcome::Absent
        };

        if item.borrow().exists() {
            let reloaded = item.borrow_mut().reload();
            return match reloaded {
                Ok(()) => {
                    tracing::trace!(target: "library::file", path = %key.display(), "Reloaded");
                    if let Some(displaced) = self.base.insert_silent(item.clone())
                        && !displaced.ptr_eq(item)
                    {
                        self.base.emit(Signal::Removed, &ItemSet::from([displaced]));
                    }
                    ReloadOutcome::Changed
                }
                Err(e) => {
                    tracing::warn!(
                        target: "library::file",
                        path = %key.display(),
                        error = %e,
                        "Error reloading"
                    );
                    gone
                }
            };
        }

        if !item.borrow().mounted(&*self.mounts) {
            let point = item.borrow().mountpoint().to_path_buf();
            tracing::debug!(target: "library::file", path = %key.display(), "Masking");
            self.masked
                .borrow_mut()
                .entry(point)
                .or_default()
                .insert(key, item.clone());
        } else {
            tracing::debug!(target: "library::file", path = %key.display(), "File is gone");
        }
        gone
    }

    /// Force-reload one item and emit `changed` or `removed` for it.
    pub fn reload(&self, item: &ItemRef<V>) {
        match self.load_item(item, true) {
            ReloadOutcome::Changed => self.base.changed([item.clone()]),
            ReloadOutcome::Removed => self.base.emit(Signal::Removed, &ItemSet::from([item.clone()])),
            ReloadOutcome::Unchanged | ReloadOutcome::Absent => {}
        }
    }

    /// Force-reload one item, collecting the outcome instead of emitting.
    pub fn reload_into(&self, item: &ItemRef<V>, changed: &mut ItemSet<V>, removed: &mut ItemSet<V>) {
        match self.load_item(item, true) {
            ReloadOutcome::Changed => {
                changed.insert(item.clone());
            }
            ReloadOutcome::Removed => {
                removed.insert(item.clone());
            }
            ReloadOutcome::Unchanged | ReloadOutcome::Absent => {}
        }
    }

    /// Point `item` at `new_path` without touching the file. Emits nothing
    /// for `item` itself.
    ///
    /// An unrelated item already stored under the new key is dropped with a
    /// `removed` signal. Returns whether `item` was visible before the move.
    pub fn move_item(&self, item: &ItemRef<V>, new_path: &Path) -> bool {
        let old_key = item.key();
        let existed = self.base.get(&old_key).is_some_and(|stored| stored.ptr_eq(item));
        if existed {
            self.base.take(&old_key);
        }

        let new_key = clean_path(new_path);
        if let Some(other) = self.base.get(&new_key)
            && !other.ptr_eq(item)
        {
            tracing::warn!(
                target: "library::file",
                path = %new_key.display(),
                "Move target already in library, replacing it"
            );
            self.base.take(&new_key);
            self.base.emit(Signal::Removed, &ItemSet::from([other]));
        }

        tracing::debug!(
            target: "library::file",
            from = %old_key.display(),
            to = %new_key.display(),
            "Moving item"
        );
        let mountpoint = self.mountpoint_for(&new_key);
        item.borrow_mut().relocate(new_key, mountpoint);
        self.base.insert_silent(item.clone());
        self.base.mark_dirty();
        existed
    }

    /// Move `item` to `new_path` and announce it as `changed`.
    pub fn rename(&self, item: &ItemRef<V>, new_path: &Path) -> bool {
        let existed = self.move_item(item, new_path);
        self.base.changed([item.clone()]);
        existed
    }

    /// Re-root every item below `old_root` to the same relative path under
    /// `new_root`. The destination is used as given, without resolving
    /// symlinks.
    pub fn move_root(&self, old_root: &Path, new_root: &Path) -> Result<MoveRoot<'_, V>> {
        let old_root = normalize_path(old_root);
        let new_root = clean_path(new_root);
        if !old_root.is_dir() {
            tracing::warn!(
                target: "library::file",
                path = %old_root.display(),
                "Source directory doesn't exist, assuming that's OK"
            );
        }
        if !new_root.is_dir() {
            return Err(Error::invalid_path(new_root, "destination is not a directory"));
        }
        Ok(MoveRoot {
            library: self,
            items: self.base.values(),
            index: 0,
            old_root,
            new_root,
            changed: ItemSet::new(),
            missing: 0,
        })
    }

    /// Remove every item below any of `roots`, as one `removed` batch at the
    /// end. Dropping the task early removes nothing.
    pub fn remove_roots(&self, roots: &[PathBuf]) -> RemoveRoots<'_, V> {
        tracing::debug!(target: "library::file", roots = ?roots, "Removing library roots");
        RemoveRoots {
            library: self,
            roots: roots.iter().map(|r| normalize_path(r)).collect(),
            items: self.base.values(),
            index: 0,
            removed: ItemSet::new(),
        }
    }

    /// Re-check masked mount points and known items, then scan `paths` for
    /// new files.
    pub fn rebuild(&self, paths: &[PathBuf], force: bool, exclude: &[PathBuf]) -> Rebuild<'_, V> {
        tracing::info!(
            target: "library::file",
            library = self.log_name(),
            force,
            "Rebuilding"
        );
        Rebuild {
            library: self,
            force,
            paths: paths.to_vec(),
            exclude: exclude.to_vec(),
            stage: RebuildStage::Mounts {
                points: self.masked_mount_points(),
                index: 0,
            },
            changed: ItemSet::new(),
            removed: ItemSet::new(),
        }
    }

    /// Walk `paths` and add every recognised file that is not known yet.
    pub fn scan(&self, paths: &[PathBuf], exclude: &[PathBuf]) -> Scan<'_, V> {
        Scan {
            library: self,
            roots: paths.iter().cloned().collect(),
            exclude: exclude.to_vec(),
            walker: None,
            stage: ScanStage::Walk,
            to_load: Vec::new(),
            seen: HashSet::new(),
            mountpoints: HashMap::new(),
            pending: Vec::new(),
            last_yield: Instant::now(),
            last_added: Instant::now(),
            loaded: 0,
        }
    }

    fn flush(&self, changed: &mut ItemSet<V>, removed: &mut ItemSet<V>) {
        self.flush_removed(removed);
        self.flush_changed(changed);
    }

    /// Emit `removed` for the collected items that are really gone. An item
    /// reloaded back in after being collected stays out of the batch.
    fn flush_removed(&self, removed: &mut ItemSet<V>) {
        let removed: ItemSet<V> = std::mem::take(removed)
            .into_iter()
            .filter(|item| !self.base.contains(item))
            .collect();
        if removed.is_empty() {
            return;
        }
        tracing::debug!(
            target: "library::file",
            library = self.log_name(),
            count = removed.len(),
            "Flushing removed batch"
        );
        self.base.emit(Signal::Removed, &removed);
    }

    fn flush_changed(&self, changed: &mut ItemSet<V>) {
        let changed = std::mem::take(changed);
        if changed.is_empty() {
            return;
        }
        tracing::debug!(
            target: "library::file",
            library = self.log_name(),
            count = changed.len(),
            "Flushing changed batch"
        );
        self.base.changed(changed);
    }
}

impl<V: FileItem> Deref for FileLibrary<V> {
    type Target = Library<V>;

    fn deref(&self) -> &Library<V> {
        &self.base
    }
}

impl<V: FileItem> AsLibrary<V> for FileLibrary<V> {
    fn as_library(&self) -> &Library<V> {
        &self.base
    }

    fn move_held(&self, item: &ItemRef<V>, new_key: &V::Key) -> bool {
        self.move_item(item, new_key)
    }

    fn refresh(&self, item: &ItemRef<V>) -> Option<ReloadOutcome> {
        Some(self.load_item(item, true))
    }
}

impl<V: FileItem> Persistent<V> for FileLibrary<V> {
    /// Items on volumes that are not mounted go straight to their masked
    /// bucket. Each mount point is probed once.
    fn load_init(&self, items: Vec<V>) {
        let mut mounted: HashMap<PathBuf, bool> = HashMap::new();
        let mut masked = self.masked.borrow_mut();

        for item in items {
            let point = item.mountpoint().to_path_buf();
            let is_mounted = *mounted.entry(point.clone()).or_insert_with(|| {
                if self.mounts.is_mounted(&point) {
                    return true;
                }
                // Touching a path below an automount point mounts it.
                let _ = item.exists();
                self.mounts.is_mounted(&point)
            });

            let item = ItemRef::new(item);
            if is_mounted {
                self.base.insert_silent(item);
            } else {
                let key = item.key();
                masked.entry(point).or_default().insert(key, item);
            }
        }

        let hidden: usize = masked.values().map(HashMap::len).sum();
        if hidden > 0 {
            tracing::info!(
                target: "library::file",
                library = self.log_name(),
                count = hidden,
                "Items on unmounted volumes are masked"
            );
        }
    }

    /// Visible and masked items, ordered by key.
    fn content(&self) -> Vec<ItemRef<V>> {
        let mut items = self.base.values();
        for bucket in self.masked.borrow().values() {
            items.extend(bucket.values().cloned());
        }
        items.sort_by(compare_keys);
        items
    }
}

impl<V: FileItem> fmt::Debug for FileLibrary<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLibrary")
            .field("name", &self.base.name())
            .field("visible", &self.base.len())
            .field("masked_points", &self.masked.borrow().len())
            .finish()
    }
}

enum RebuildStage<'a, V: FileItem> {
    Mounts { points: Vec<PathBuf>, index: usize },
    Check { items: Vec<ItemRef<V>>, index: usize },
    Scan(Scan<'a, V>),
    Done,
}

/// Resumable full rebuild. See [`FileLibrary::rebuild`].
///
/// Pending `changed`/`removed` batches are flushed when the task is dropped,
/// so abandoning it halfway leaves listeners consistent with the contents.
pub struct Rebuild<'a, V: FileItem> {
    library: &'a FileLibrary<V>,
    force: bool,
    paths: Vec<PathBuf>,
    exclude: Vec<PathBuf>,
    stage: RebuildStage<'a, V>,
    changed: ItemSet<V>,
    removed: ItemSet<V>,
}

impl<V: FileItem> Rebuild<'_, V> {
    fn start_check(&mut self) {
        let mut items = self.library.base.values();
        items.sort_by(compare_keys);
        self.stage = RebuildStage::Check { items, index: 0 };
    }
}

impl<V: FileItem> Iterator for Rebuild<'_, V> {
    type Item = Progress;

    fn next(&mut self) -> Option<Progress> {
        let library = self.library;
        let pacing = &library.pacing;
        loop {
            match &mut self.stage {
                RebuildStage::Mounts { points, index } => {
                    let Some(point) = points.get(*index).cloned() else {
                        self.start_check();
                        continue;
                    };
                    *index += 1;
                    let progress = Progress::new(Phase::Mounts, *index, Some(points.len()));
                    if library.mounts.is_mounted(&point) {
                        library.unmask(&point);
                        return Some(progress);
                    }
                }
                RebuildStage::Check { items, index } => {
                    let Some(item) = items.get(*index).cloned() else {
                        library.flush(&mut self.changed, &mut self.removed);
                        let scan = library.scan(&self.paths, &self.exclude);
                        self.stage = RebuildStage::Scan(scan);
                        continue;
                    };
                    let i = *index;
                    *index += 1;
                    let total = items.len();

                    if (self.force && library.base.contains(&item)) || !item.borrow().valid() {
                        library.reload_into(&item, &mut self.changed, &mut self.removed);
                    }
                    if self.changed.len() >= pacing.signal_batch {
                        library.flush_changed(&mut self.changed);
                    }
                    if self.removed.len() >= pacing.signal_batch {
                        library.flush_removed(&mut self.removed);
                    }
                    if self.changed.len() > 20 || i % pacing.check_batch.max(1) == 0 {
                        return Some(Progress::new(Phase::Check, i + 1, Some(total)));
                    }
                }
                RebuildStage::Scan(scan) => match scan.next() {
                    Some(progress) => return Some(progress),
                    None => self.stage = RebuildStage::Done,
                },
                RebuildStage::Done => return None,
            }
        }
    }
}

impl<V: FileItem> Drop for Rebuild<'_, V> {
    fn drop(&mut self) {
        self.library.flush(&mut self.changed, &mut self.removed);
    }
}

enum ScanStage {
    Walk,
    Load { index: usize },
    Done,
}

/// Resumable scan for new files. See [`FileLibrary::scan`].
///
/// Files loaded but not yet added are added when the task is dropped.
pub struct Scan<'a, V: FileItem> {
    library: &'a FileLibrary<V>,
    roots: VecDeque<PathBuf>,
    exclude: Vec<PathBuf>,
    walker: Option<Box<dyn Iterator<Item = PathBuf>>>,
    stage: ScanStage,
    to_load: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
    mountpoints: HashMap<PathBuf, PathBuf>,
    pending: Vec<ItemRef<V>>,
    last_yield: Instant,
    last_added: Instant,
    loaded: usize,
}

impl<V: FileItem> Scan<'_, V> {
    fn need_yield(&mut self) -> bool {
        if self.last_yield.elapsed() > self.library.pacing.yield_interval {
            self.last_yield = Instant::now();
            return true;
        }
        false
    }

    fn need_add(&mut self) -> bool {
        if self.pending.len() >= self.library.pacing.add_batch
            || self.last_added.elapsed() > self.library.pacing.add_interval
        {
            self.last_added = Instant::now();
            return true;
        }
        false
    }

    fn add_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let added = self.library.base.add(self.pending.drain(..));
        self.loaded += added.len();
    }

    fn mountpoint(&mut self, path: &Path) -> PathBuf {
        let dir = path.parent().unwrap_or(path).to_path_buf();
        if let Some(point) = self.mountpoints.get(&dir) {
            return point.clone();
        }
        let point = find_mountpoint(&dir, &*self.library.mounts);
        self.mountpoints.insert(dir, point.clone());
        point
    }

    /// Walk until the time slice is used up or every root is done.
    fn walk(&mut self) -> Option<Progress> {
        loop {
            if self.walker.is_none() {
                let Some(root) = self.roots.pop_front() else {
                    tracing::debug!(
                        target: "library::file",
                        found = self.to_load.len(),
                        "Walk finished"
                    );
                    self.stage = ScanStage::Load { index: 0 };
                    return Some(Progress::new(Phase::Walk, self.to_load.len(), None));
                };
                tracing::info!(target: "library::file", path = %root.display(), "Scanning");
                self.walker = Some(iter_paths(
                    &root,
                    &self.exclude,
                    self.library.skip_hidden,
                ));
            }

            let next = self.walker.as_mut().and_then(Iterator::next);
            let Some(path) = next else {
                self.walker = None;
                continue;
            };
            if self.library.loader.filter(&path)
                && !self.library.contains_filename(&path)
                && self.seen.insert(path.clone())
            {
                self.to_load.push(path);
            }
            if self.need_yield() {
                return Some(Progress::new(Phase::Walk, self.to_load.len(), None));
            }
        }
    }

    fn load(&mut self, mut index: usize) -> Option<Progress> {
        let total = self.to_load.len();
        while index < total {
            let path = self.to_load[index].clone();
            index += 1;
            self.stage = ScanStage::Load { index };

            if self.library.contains_filename(&path) {
                continue;
            }
            let mountpoint = self.mountpoint(&path);
            let Some(item) = self.library.construct(&path, &mountpoint) else {
                continue;
            };
            self.pending.push(ItemRef::new(item));

            if self.need_add() {
                self.add_pending();
                return Some(Progress::new(Phase::Load, index, Some(total)));
            }
            if !self.pending.is_empty() && self.need_yield() {
                return Some(Progress::new(Phase::Load, index, Some(total)));
            }
        }

        self.stage = ScanStage::Done;
        if self.pending.is_empty() {
            tracing::info!(target: "library::file", added = self.loaded, "Scan finished");
            return None;
        }
        self.add_pending();
        tracing::info!(target: "library::file", added = self.loaded, "Scan finished");
        Some(Progress::new(Phase::Load, total, Some(total)))
    }
}

impl<V: FileItem> Iterator for Scan<'_, V> {
    type Item = Progress;

    fn next(&mut self) -> Option<Progress> {
        match self.stage {
            ScanStage::Walk => self.walk(),
            ScanStage::Load { index } => self.load(index),
            ScanStage::Done => None,
        }
    }
}

impl<V: FileItem> Drop for Scan<'_, V> {
    fn drop(&mut self) {
        self.add_pending();
    }
}

/// Resumable re-rooting. See [`FileLibrary::move_root`].
///
/// Moved items are announced in one `changed` batch at the end, or when the
/// task is dropped early.
pub struct MoveRoot<'a, V: FileItem> {
    library: &'a FileLibrary<V>,
    items: Vec<ItemRef<V>>,
    index: usize,
    old_root: PathBuf,
    new_root: PathBuf,
    changed: ItemSet<V>,
    missing: usize,
}

impl<V: FileItem> MoveRoot<'_, V> {
    fn finish(&mut self) {
        if self.changed.is_empty() && self.missing == 0 {
            return;
        }
        if self.missing > 0 {
            tracing::warn!(
                target: "library::file",
                count = self.missing,
                "Some moved items were no longer in the library"
            );
        }
        tracing::info!(
            target: "library::file",
            from = %self.old_root.display(),
            to = %self.new_root.display(),
            count = self.changed.len(),
            "Moved library root"
        );
        self.missing = 0;
        self.library.base.changed(std::mem::take(&mut self.changed));
    }
}

impl<V: FileItem> Iterator for MoveRoot<'_, V> {
    type Item = Progress;

    fn next(&mut self) -> Option<Progress> {
        let total = self.items.len();
        if self.index >= total {
            self.finish();
            return None;
        }
        let end = (self.index + 100).min(total);
        for item in &self.items[self.index..end] {
            let key = item.key();
            if key == self.old_root || !is_under(&key, &self.old_root) {
                continue;
            }
            let Ok(relative) = key.strip_prefix(&self.old_root) else {
                continue;
            };
            let new_key = self.new_root.join(relative);
            if self.library.move_item(item, &new_key) {
                self.changed.insert(item.clone());
            } else {
                self.missing += 1;
            }
        }
        self.index = end;
        Some(Progress::new(Phase::Move, end, Some(total)))
    }
}

impl<V: FileItem> Drop for MoveRoot<'_, V> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Resumable removal of whole roots. See [`FileLibrary::remove_roots`].
pub struct RemoveRoots<'a, V: FileItem> {
    library: &'a FileLibrary<V>,
    roots: Vec<PathBuf>,
    items: Vec<ItemRef<V>>,
    index: usize,
    removed: ItemSet<V>,
}

impl<V: FileItem> Iterator for RemoveRoots<'_, V> {
    type Item = Progress;

    fn next(&mut self) -> Option<Progress> {
        let total = self.items.len();
        if self.index >= total {
            if self.removed.is_empty() {
                if total > 0 || !self.roots.is_empty() {
                    tracing::debug!(target: "library::file", "No items under removed roots");
                }
            } else {
                let removed = std::mem::take(&mut self.removed);
                self.library.base.remove(removed);
            }
            self.roots.clear();
            self.items.clear();
            self.index = 0;
            return None;
        }
        let end = (self.index + 100).min(total);
        for item in &self.items[self.index..end] {
            let key = item.key();
            if self.roots.iter().any(|root| key != *root && is_under(&key, root)) {
                self.removed.insert(item.clone());
            }
        }
        self.index = end;
        Some(Progress::new(Phase::Remove, end, Some(total)))
    }
}
