//! Mount point detection.
//!
//! File items remember the root of the volume they live on. When that volume
//! goes away (a USB stick, a network share) the items are masked instead of
//! dropped, and come back once the volume is mounted again.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sysinfo::Disks;

/// How long a snapshot of the system's disks is trusted.
const REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Answers whether a directory is currently an active mount point.
pub trait MountProbe {
    fn is_mounted(&self, path: &Path) -> bool;
}

/// Mount detection against the running system's disk list.
///
/// The list is read through `sysinfo` and cached for a short while, since a
/// scan asks about the same few mount points many times in a row. The
/// filesystem root always counts as mounted.
#[derive(Debug)]
pub struct SystemMounts {
    points: RefCell<Vec<PathBuf>>,
    refreshed: Cell<Option<Instant>>,
    /// `None` for a fixed table that is never re-read.
    ttl: Option<Duration>,
}

impl SystemMounts {
    pub fn new() -> Self {
        Self::with_ttl(REFRESH_INTERVAL)
    }

    /// Re-read the disk list once a snapshot is older than `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            points: RefCell::new(Vec::new()),
            refreshed: Cell::new(None),
            ttl: Some(ttl),
        }
    }

    /// A fixed mount table, for hosts that track volumes themselves.
    pub fn from_points<P: Into<PathBuf>>(points: impl IntoIterator<Item = P>) -> Self {
        Self {
            points: RefCell::new(points.into_iter().map(Into::into).collect()),
            refreshed: Cell::new(Some(Instant::now())),
            ttl: None,
        }
    }

    /// Read the disk list now.
    pub fn refresh(&self) {
        if self.ttl.is_none() {
            return;
        }
        let disks = Disks::new_with_refreshed_list();
        let points: Vec<PathBuf> = disks
            .list()
            .iter()
            .map(|disk| disk.mount_point().to_path_buf())
            .filter(|point| point.is_absolute())
            .collect();
        tracing::trace!(target: "library::mounts", count = points.len(), "Refreshed disk list");
        *self.points.borrow_mut() = points;
        self.refreshed.set(Some(Instant::now()));
    }

    fn ensure_fresh(&self) {
        let stale = match (self.ttl, self.refreshed.get()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(ttl), Some(at)) => at.elapsed() > ttl,
        };
        if stale {
            self.refresh();
        }
    }

    /// Known mount points, sorted.
    pub fn mount_points(&self) -> Vec<PathBuf> {
        self.ensure_fresh();
        let mut points = self.points.borrow().clone();
        points.sort();
        points.dedup();
        points
    }

    /// The mount point holding `path`: the longest known mount point that
    /// `path` lies under, or the filesystem root.
    pub fn mountpoint_of(&self, path: &Path) -> PathBuf {
        self.ensure_fresh();
        let points = self.points.borrow();
        points
            .iter()
            .filter(|point| path.starts_with(point))
            .max_by_key(|point| point.components().count())
            .cloned()
            .unwrap_or_else(|| top_ancestor(path))
    }
}

impl Default for SystemMounts {
    fn default() -> Self {
        Self::new()
    }
}

impl MountProbe for SystemMounts {
    fn is_mounted(&self, path: &Path) -> bool {
        if path.has_root() && path.parent().is_none() {
            return true;
        }
        self.ensure_fresh();
        self.points.borrow().iter().any(|point| point == path)
    }
}

fn top_ancestor(path: &Path) -> PathBuf {
    path.ancestors().last().unwrap_or(path).to_path_buf()
}

/// Walk up from `path` to the closest ancestor that is a mount point.
///
/// Falls back to the filesystem root when nothing along the way is reported
/// as mounted.
pub fn find_mountpoint(path: &Path, probe: &dyn MountProbe) -> PathBuf {
    let mut current = Some(path);
    let mut last = path;
    while let Some(dir) = current {
        if probe.is_mounted(dir) {
            return dir.to_path_buf();
        }
        last = dir;
        current = dir.parent();
    }
    last.to_path_buf()
}
