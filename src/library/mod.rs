//! The in-memory media index.
//!
//! A [`Library`] is a keyed collection of shared items that announces every
//! mutation through `added`/`removed`/`changed` signals. On top of it:
//!
//! - [`FileLibrary`] keeps file-backed items in sync with the disk: scans,
//!   rebuilds, renames, root moves and masking of unmounted volumes.
//! - [`WatchedFileLibrary`] applies filesystem events as they arrive.
//! - [`AlbumLibrary`] is a derived index grouping songs into albums.
//! - [`Librarian`] fans signals from several libraries into one stream.
//!
//! Long operations are returned as resumable tasks (iterators of
//! [`Progress`]) that can be driven directly or through a [`CoPool`].
//! Everything here is single-threaded.

pub mod albums;
pub mod base;
pub mod copool;
pub mod file;
pub mod item;
pub mod librarian;
pub mod mounts;
pub mod paths;
pub mod persist;
pub mod signals;
pub mod watched;
pub mod watcher;

pub use albums::{Album, AlbumItem, AlbumKey, AlbumLibrary, AlbumSummary};
pub use base::{AsLibrary, Library};
pub use copool::{CoPool, Phase, Progress, Task};
pub use file::{FileLibrary, ScanPacing};
pub use item::{FileItem, Item, ItemLoader, ItemRef, ItemSet, ReloadOutcome};
pub use librarian::Librarian;
pub use mounts::{MountProbe, SystemMounts, find_mountpoint};
pub use paths::{clean_path, iter_paths, normalize_path};
pub use persist::{ItemCodec, JsonCodec, Persistent};
pub use signals::{Signal, Signals, SubscriptionId};
pub use watched::WatchedFileLibrary;
pub use watcher::{DirectoryWatcher, EventTranslator, FsEvent, FsEventKind, NotifyWatcher, WatchError};
