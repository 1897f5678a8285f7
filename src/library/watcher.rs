//! Directory watching for library changes.
//!
//! Libraries do not talk to the OS directly. They install one watch per
//! directory through the [`DirectoryWatcher`] trait and periodically drain
//! translated [`FsEvent`]s from it on their own thread.
//!
//! # Design
//!
//! - **One watch per directory**: watches are non-recursive, new
//!   sub-directories get their own watch when they show up
//! - **Queued delivery**: the `notify` backend calls back on its own thread;
//!   raw events go through a channel and are translated in [`poll`]
//! - **Rename pairing**: `From`/`To` halves of a rename are joined into a
//!   single [`FsEventKind::Renamed`], even when they arrive in different
//!   polls; a `From` with no `To` after a short wait means the file left the
//!   watched tree, a lone `To` that it arrived
//!
//! [`poll`]: DirectoryWatcher::poll

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsEventKind {
    Created,
    Changed,
    /// `path` was renamed to `other`.
    Renamed,
    /// `path` moved somewhere outside the watched directories.
    MovedOut,
    Deleted,
    /// A writer closed the file; more events for it are unlikely.
    ChangesDoneHint,
}

/// A translated filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
    /// Destination of a rename.
    pub other: Option<PathBuf>,
}

impl FsEvent {
    pub fn new(kind: FsEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            other: None,
        }
    }

    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Renamed,
            path: from.into(),
            other: Some(to.into()),
        }
    }
}

/// Handle for one installed directory watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Source of filesystem events for individual directories.
pub trait DirectoryWatcher {
    /// Start watching `dir` (not recursively).
    fn watch(&mut self, dir: &Path) -> Result<WatchId, WatchError>;

    /// Stop a watch. Unknown ids are ignored.
    fn unwatch(&mut self, id: WatchId);

    /// Drain every event queued since the last call.
    fn poll(&mut self) -> Vec<FsEvent>;
}

/// [`DirectoryWatcher`] backed by the platform's `notify` watcher.
pub struct NotifyWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    buffered: VecDeque<notify::Result<Event>>,
    watches: HashMap<WatchId, PathBuf>,
    next_id: u64,
    translator: EventTranslator,
}

impl NotifyWatcher {
    pub fn new() -> Result<Self, WatchError> {
        let (tx, rx) = unbounded();
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            // The receiver is gone once the library stopped watching.
            let _ = tx.send(result);
        })
        .map_err(|e| WatchError::Init(e.to_string()))?;

        Ok(Self {
            watcher,
            rx,
            buffered: VecDeque::new(),
            watches: HashMap::new(),
            next_id: 1,
            translator: EventTranslator::default(),
        })
    }

    /// Block until at least one raw event is queued, or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if !self.buffered.is_empty() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.buffered.push_back(event);
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Number of installed watches.
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}

impl DirectoryWatcher for NotifyWatcher {
    fn watch(&mut self, dir: &Path) -> Result<WatchId, WatchError> {
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| match e.kind {
                notify::ErrorKind::MaxFilesWatch => {
                    WatchError::Watch(format!("{}: too many watches", dir.display()))
                }
                _ => WatchError::Watch(format!("{}: {e}", dir.display())),
            })?;
        let id = WatchId(self.next_id);
        self.next_id += 1;
        self.watches.insert(id, dir.to_path_buf());
        tracing::trace!(target: "library::watch", path = %dir.display(), "Watching directory");
        Ok(id)
    }

    fn unwatch(&mut self, id: WatchId) {
        let Some(dir) = self.watches.remove(&id) else {
            return;
        };
        if let Err(e) = self.watcher.unwatch(&dir) {
            // Deleted directories lose their watch on their own.
            tracing::debug!(
                target: "library::watch",
                path = %dir.display(),
                error = %e,
                "Could not remove watch"
            );
        }
    }

    fn poll(&mut self) -> Vec<FsEvent> {
        let mut raw: Vec<Event> = Vec::new();
        let queued = self.buffered.drain(..).chain(self.rx.try_iter());
        for result in queued {
            match result {
                Ok(event) => raw.push(event),
                Err(e) => tracing::warn!(target: "library::watch", error = %e, "Watch error"),
            }
        }
        self.translator.translate(raw)
    }
}

/// How long a rename `From` waits for its `To` before it counts as a move
/// out of the watched tree.
pub const PAIR_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug)]
enum Slot {
    Ready(FsEvent),
    /// A rename source still waiting for its destination.
    Waiting {
        tracker: Option<usize>,
        path: PathBuf,
        since: Instant,
    },
}

/// Turns raw `notify` events into [`FsEvent`]s.
///
/// Backends report a rename as separate `From` and `To` halves sharing a
/// tracker cookie, often followed by a combined `Both` event. Only one
/// `Renamed` is produced per rename.
///
/// A `From` may be delivered in one poll and its `To` in the next, so an
/// unpaired `From` is held for up to the pair timeout. Events that arrive
/// after it are held too, and everything comes out in arrival order: the
/// rename (or the move out) takes the place of its `From`.
#[derive(Debug)]
pub struct EventTranslator {
    queue: VecDeque<Slot>,
    recent: Vec<(PathBuf, PathBuf, Instant)>,
    pair_timeout: Duration,
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self::with_pair_timeout(PAIR_TIMEOUT)
    }
}

impl EventTranslator {
    pub fn with_pair_timeout(pair_timeout: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            recent: Vec::new(),
            pair_timeout,
        }
    }

    pub fn translate(&mut self, events: impl IntoIterator<Item = Event>) -> Vec<FsEvent> {
        self.translate_at(events, Instant::now())
    }

    /// [`translate`](Self::translate) with an explicit clock.
    pub fn translate_at(
        &mut self,
        events: impl IntoIterator<Item = Event>,
        now: Instant,
    ) -> Vec<FsEvent> {
        let timeout = self.pair_timeout;
        self.recent.retain(|(_, _, at)| now.duration_since(*at) <= timeout);
        // A `To` arriving after the timeout must not pair any more.
        self.expire(now);
        for event in events {
            self.translate_one(event, now);
        }
        self.release()
    }

    /// Rename sources still waiting for their destination.
    pub fn waiting(&self) -> usize {
        self.queue
            .iter()
            .filter(|slot| matches!(slot, Slot::Waiting { .. }))
            .count()
    }

    fn translate_one(&mut self, event: Event, now: Instant) {
        let tracker = event.tracker();
        let mut paths = event.paths.into_iter();
        let Some(path) = paths.next() else {
            return;
        };

        let kind = match event.kind {
            EventKind::Create(_) => FsEventKind::Created,
            EventKind::Remove(_) => FsEventKind::Deleted,
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => FsEventKind::ChangesDoneHint,
            EventKind::Modify(ModifyKind::Name(mode)) => {
                self.rename_half(mode, tracker, path, paths.next(), now);
                return;
            }
            EventKind::Modify(_) => FsEventKind::Changed,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => return,
        };
        self.push(FsEvent::new(kind, path));
    }

    fn rename_half(
        &mut self,
        mode: RenameMode,
        tracker: Option<usize>,
        path: PathBuf,
        second: Option<PathBuf>,
        now: Instant,
    ) {
        match mode {
            RenameMode::Both => {
                let Some(to) = second else {
                    self.push(FsEvent::new(FsEventKind::MovedOut, path));
                    return;
                };
                if self.recent.iter().any(|(from, dest, _)| *from == path && *dest == to) {
                    return;
                }
                match self.find_waiting(|_, from| from == path) {
                    Some(index) => self.resolve(index, to, now),
                    None => {
                        self.recent.push((path.clone(), to.clone(), now));
                        self.push(FsEvent::renamed(path, to));
                    }
                }
            }
            RenameMode::From => {
                if self.recent.iter().any(|(from, _, _)| *from == path) {
                    return;
                }
                self.queue.push_back(Slot::Waiting {
                    tracker,
                    path,
                    since: now,
                });
            }
            RenameMode::To => {
                if self.recent.iter().any(|(_, dest, _)| *dest == path) {
                    return;
                }
                let matched = self.find_waiting(|cookie, _| tracker.is_some() && cookie == tracker);
                match matched {
                    Some(index) => self.resolve(index, path, now),
                    None => self.push(FsEvent::new(FsEventKind::Created, path)),
                }
            }
            RenameMode::Any | RenameMode::Other => {
                let kind = if path.exists() {
                    FsEventKind::Created
                } else {
                    FsEventKind::MovedOut
                };
                self.push(FsEvent::new(kind, path));
            }
        }
    }

    fn push(&mut self, event: FsEvent) {
        self.queue.push_back(Slot::Ready(event));
    }

    fn find_waiting(&self, pred: impl Fn(Option<usize>, &Path) -> bool) -> Option<usize> {
        self.queue.iter().position(|slot| match slot {
            Slot::Waiting { tracker, path, .. } => pred(*tracker, path),
            Slot::Ready(_) => false,
        })
    }

    /// Turn the waiting `From` at `index` into a rename to `to`, in place.
    fn resolve(&mut self, index: usize, to: PathBuf, now: Instant) {
        let Some(Slot::Waiting { path, .. }) = self.queue.get_mut(index) else {
            return;
        };
        let from = std::mem::take(path);
        self.recent.push((from.clone(), to.clone(), now));
        self.queue[index] = Slot::Ready(FsEvent::renamed(from, to));
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.pair_timeout;
        for slot in &mut self.queue {
            let expired = match slot {
                Slot::Waiting { path, since, .. } if now.duration_since(*since) > timeout => {
                    Some(std::mem::take(path))
                }
                _ => None,
            };
            if let Some(path) = expired {
                tracing::trace!(target: "library::watch", path = %path.display(), "Rename source left the tree");
                *slot = Slot::Ready(FsEvent::new(FsEventKind::MovedOut, path));
            }
        }
    }

    /// Everything up to the first waiting `From`.
    fn release(&mut self) -> Vec<FsEvent> {
        let mut out = Vec::new();
        while matches!(self.queue.front(), Some(Slot::Ready(_))) {
            if let Some(Slot::Ready(event)) = self.queue.pop_front() {
                out.push(event);
            }
        }
        out
    }
}

/// Errors that can occur during file watching.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {0}")]
    Init(String),
    #[error("Failed to watch path: {0}")]
    Watch(String),
}
