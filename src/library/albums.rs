//! Album grouping kept in sync with a song library.
//!
//! An [`AlbumLibrary`] listens to a source library's signals and moves songs
//! between [`Album`]s as they are added, removed or retagged. It never
//! regroups the whole source after the initial pass. Albums have their own
//! `added`/`removed`/`changed` signals, so album views update the same way
//! song views do.

use std::cell::{OnceCell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::base::{AsLibrary, Library};
use super::item::{Item, ItemRef, ItemSet};
use super::signals::{Signal, Signals, SubscriptionId};
use crate::error::{Error, Result};

/// Lower-case `text` and collapse runs of whitespace, so sort keys compare
/// the way people read them.
pub fn human_key(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identifies the album a song belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlbumKey {
    /// Grouping key, label id or release id; empty when none is tagged.
    pub id: String,
    pub sort: String,
    pub artist_sort: String,
}

impl AlbumKey {
    pub fn new(id: impl Into<String>, sort: &str, artist_sort: &str) -> Self {
        Self {
            id: id.into(),
            sort: human_key(sort),
            artist_sort: human_key(artist_sort),
        }
    }
}

impl fmt::Display for AlbumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.sort.is_empty(), self.artist_sort.is_empty()) {
            (true, _) => f.write_str("(no album)"),
            (false, true) => f.write_str(&self.sort),
            (false, false) => write!(f, "{} / {}", self.sort, self.artist_sort),
        }
    }
}

/// Songs that can be grouped into albums.
pub trait AlbumItem: Item {
    /// Value of a tag, by lower-case name.
    fn tag(&self, name: &str) -> Option<String>;

    fn duration(&self) -> Option<Duration> {
        None
    }

    fn album_key(&self) -> AlbumKey {
        let id = ["album_grouping_key", "labelid", "musicbrainz_albumid"]
            .iter()
            .find_map(|name| self.tag(name).filter(|v| !v.is_empty()))
            .unwrap_or_default();
        let sort = self
            .tag("albumsort")
            .or_else(|| self.tag("album"))
            .unwrap_or_default();
        let artist_sort = self
            .tag("albumartistsort")
            .or_else(|| self.tag("albumartist"))
            .unwrap_or_default();
        AlbumKey::new(id, &sort, &artist_sort)
    }
}

/// Cached album-level fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlbumSummary {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub genre: Option<String>,
    /// Earliest date among the songs.
    pub date: Option<String>,
    pub tracks: usize,
    pub duration: Duration,
}

/// A group of songs sharing an [`AlbumKey`].
pub struct Album<V> {
    key: AlbumKey,
    songs: ItemSet<V>,
    summary: OnceCell<AlbumSummary>,
}

impl<V: AlbumItem> Album<V> {
    fn new(key: AlbumKey) -> Self {
        Self {
            key,
            songs: ItemSet::new(),
            summary: OnceCell::new(),
        }
    }

    pub fn album_key(&self) -> &AlbumKey {
        &self.key
    }

    pub fn songs(&self) -> &ItemSet<V> {
        &self.songs
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    /// Drop cached fields after the song set changed.
    pub fn finalize(&mut self) {
        self.summary = OnceCell::new();
    }

    /// Album-level fields, computed on first use after [`finalize`](Self::finalize).
    pub fn summary(&self) -> &AlbumSummary {
        self.summary.get_or_init(|| summarize(&self.songs))
    }

    pub fn title(&self) -> Option<&str> {
        self.summary().title.as_deref()
    }

    pub fn artist(&self) -> Option<&str> {
        self.summary().artist.as_deref()
    }
}

impl<V: AlbumItem> Item for Album<V> {
    type Key = AlbumKey;

    fn key(&self) -> AlbumKey {
        self.key.clone()
    }
}

impl<V> fmt::Debug for Album<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Album")
            .field("key", &self.key)
            .field("songs", &self.songs.len())
            .finish()
    }
}

fn summarize<V: AlbumItem>(songs: &ItemSet<V>) -> AlbumSummary {
    let mut titles = BTreeMap::new();
    let mut artists = BTreeMap::new();
    let mut genres = BTreeMap::new();
    let mut date: Option<String> = None;
    let mut duration = Duration::ZERO;

    for song in songs {
        let song = song.borrow();
        if let Some(title) = song.tag("album") {
            *titles.entry(title).or_insert(0usize) += 1;
        }
        if let Some(artist) = song.tag("albumartist").or_else(|| song.tag("artist")) {
            *artists.entry(artist).or_insert(0usize) += 1;
        }
        if let Some(genre) = song.tag("genre") {
            *genres.entry(genre).or_insert(0usize) += 1;
        }
        if let Some(d) = song.tag("date").filter(|d| !d.is_empty()) {
            if date.as_ref().is_none_or(|earliest| d < *earliest) {
                date = Some(d);
            }
        }
        duration += song.duration().unwrap_or_default();
    }

    AlbumSummary {
        title: most_common(titles),
        artist: most_common(artists),
        genre: most_common(genres),
        date,
        tracks: songs.len(),
        duration,
    }
}

/// The most frequent value; ties go to the alphabetically first.
fn most_common(counts: BTreeMap<String, usize>) -> Option<String> {
    let mut best: Option<(String, usize)> = None;
    for (value, count) in counts {
        if best.as_ref().is_none_or(|(_, top)| count > *top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

type AlbumRef<V> = ItemRef<Album<V>>;

/// Albums derived from a song library, updated from its signals.
pub struct AlbumLibrary<V: AlbumItem> {
    albums: Library<Album<V>>,
    source: Signals<V>,
    subscriptions: RefCell<Vec<SubscriptionId>>,
}

impl<V: AlbumItem> AlbumLibrary<V> {
    /// Group the current contents of `source` and follow its signals.
    pub fn attach<L: AsLibrary<V>>(source: &L) -> Rc<Self> {
        let source = source.as_library();
        let library = Rc::new(Self {
            albums: Library::named(format!(
                "albums for {}",
                source.name().unwrap_or("library")
            )),
            source: source.signals().clone(),
            subscriptions: RefCell::new(Vec::new()),
        });

        // Initial grouping emits nothing.
        let mut created = ItemSet::new();
        for song in source.values() {
            let key = song.borrow().album_key();
            let (album, _) = library.attach_song(&song, key);
            created.insert(album);
        }
        tracing::debug!(
            target: "library::albums",
            songs = source.len(),
            albums = created.len(),
            "Grouped albums"
        );

        let handlers: [(Signal, fn(&Self, &ItemSet<V>)); 3] = [
            (Signal::Added, Self::on_added),
            (Signal::Removed, Self::on_removed),
            (Signal::Changed, Self::on_changed),
        ];
        let subscriptions = handlers
            .into_iter()
            .map(|(signal, handler)| {
                let weak: Weak<Self> = Rc::downgrade(&library);
                source.connect(signal, move |items| {
                    if let Some(albums) = weak.upgrade() {
                        handler(&albums, items);
                    }
                })
            })
            .collect();
        *library.subscriptions.borrow_mut() = subscriptions;
        library
    }

    /// Stop following the source library.
    pub fn detach(&self) {
        for id in self.subscriptions.borrow_mut().drain(..) {
            self.source.disconnect(id);
        }
    }

    pub fn albums(&self) -> &Library<Album<V>> {
        &self.albums
    }

    /// The album currently holding `song`.
    pub fn album_for(&self, song: &ItemRef<V>) -> Option<AlbumRef<V>> {
        let key = song.borrow().album_key();
        if let Some(album) = self.albums.get(&key)
            && album.borrow().songs.contains(song)
        {
            return Some(album);
        }
        self.albums
            .values()
            .into_iter()
            .find(|album| album.borrow().songs.contains(song))
    }

    /// Verify that `songs` are partitioned into non-empty albums.
    pub fn check_partition(&self, songs: &[ItemRef<V>]) -> Result<()> {
        let mut seen: HashMap<ItemRef<V>, usize> = HashMap::new();
        for album in self.albums.values() {
            let album = album.borrow();
            if album.songs.is_empty() {
                return Err(Error::Invariant(format!("album {} is empty", album.key)));
            }
            for song in &album.songs {
                *seen.entry(song.clone()).or_insert(0) += 1;
            }
        }
        for song in songs {
            match seen.remove(song) {
                Some(1) => {}
                Some(n) => {
                    return Err(Error::Invariant(format!(
                        "song is in {n} albums"
                    )));
                }
                None => return Err(Error::Invariant("song is in no album".to_string())),
            }
        }
        if !seen.is_empty() {
            return Err(Error::Invariant(format!(
                "{} album songs are not in the source",
                seen.len()
            )));
        }
        Ok(())
    }

    /// Put `song` into the album for `key`, creating it if needed.
    fn attach_song(&self, song: &ItemRef<V>, key: AlbumKey) -> (AlbumRef<V>, bool) {
        let (album, created) = match self.albums.get(&key) {
            Some(album) => (album, false),
            None => {
                let album = ItemRef::new(Album::new(key));
                self.albums.insert_silent(album.clone());
                (album, true)
            }
        };
        album.borrow_mut().songs.insert(song.clone());
        (album, created)
    }

    /// Take `song` out of whatever album holds it, trying `key` first.
    fn detach_song(&self, song: &ItemRef<V>, key: &AlbumKey) -> Option<AlbumRef<V>> {
        if let Some(album) = self.albums.get(key)
            && album.borrow_mut().songs.remove(song)
        {
            return Some(album);
        }
        // The song's key changed since it was grouped.
        let album = self
            .albums
            .values()
            .into_iter()
            .find(|album| album.borrow().songs.contains(song))?;
        album.borrow_mut().songs.remove(song);
        Some(album)
    }

    /// Drop emptied albums, refresh the rest, and announce everything.
    fn settle(&self, touched: ItemSet<Album<V>>, created: ItemSet<Album<V>>) {
        let mut removed = ItemSet::new();
        let mut changed = ItemSet::new();
        let mut added = ItemSet::new();

        for album in touched.union(&created) {
            if album.borrow().is_empty() {
                let key = album.key();
                if self.albums.get(&key).is_some_and(|stored| stored.ptr_eq(album)) {
                    self.albums.take(&key);
                }
                if !created.contains(album) {
                    removed.insert(album.clone());
                }
                continue;
            }
            album.borrow_mut().finalize();
            if created.contains(album) {
                added.insert(album.clone());
            } else {
                changed.insert(album.clone());
            }
        }

        debug_assert!(
            self.albums.values().iter().all(|a| !a.borrow().is_empty()),
            "empty album left in index"
        );

        self.albums.emit(Signal::Removed, &removed);
        self.albums.emit(Signal::Changed, &changed);
        self.albums.emit(Signal::Added, &added);
    }

    fn on_added(&self, songs: &ItemSet<V>) {
        let mut touched = ItemSet::new();
        let mut created = ItemSet::new();
        for song in songs {
            let key = song.borrow().album_key();
            let (album, is_new) = self.attach_song(song, key);
            if is_new {
                created.insert(album);
            } else if !created.contains(&album) {
                touched.insert(album);
            }
        }
        self.settle(touched, created);
    }

    fn on_removed(&self, songs: &ItemSet<V>) {
        let mut touched = ItemSet::new();
        for song in songs {
            let key = song.borrow().album_key();
            match self.detach_song(song, &key) {
                Some(album) => {
                    touched.insert(album);
                }
                None => tracing::warn!(
                    target: "library::albums",
                    album = %key,
                    "Removed song was in no album"
                ),
            }
        }
        self.settle(touched, ItemSet::new());
    }

    fn on_changed(&self, songs: &ItemSet<V>) {
        let mut touched = ItemSet::new();
        let mut created = ItemSet::new();
        for song in songs {
            let key = song.borrow().album_key();
            if let Some(album) = self.albums.get(&key)
                && album.borrow().songs.contains(song)
            {
                touched.insert(album);
                continue;
            }

            if let Some(old) = self.detach_song(song, &key) {
                touched.insert(old);
            }
            let (album, is_new) = self.attach_song(song, key);
            if is_new {
                created.insert(album);
            } else if !created.contains(&album) {
                touched.insert(album);
            }
        }
        // An album emptied and refilled within the batch is only changed.
        touched.retain(|album| !created.contains(album));
        self.settle(touched, created);
    }
}

impl<V: AlbumItem> Deref for AlbumLibrary<V> {
    type Target = Library<Album<V>>;

    fn deref(&self) -> &Library<Album<V>> {
        &self.albums
    }
}

impl<V: AlbumItem> AsLibrary<Album<V>> for AlbumLibrary<V> {
    fn as_library(&self) -> &Library<Album<V>> {
        &self.albums
    }
}

impl<V: AlbumItem> Drop for AlbumLibrary<V> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<V: AlbumItem> fmt::Debug for AlbumLibrary<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlbumLibrary")
            .field("albums", &self.albums.len())
            .finish()
    }
}
