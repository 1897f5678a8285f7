//! Audio file items backed by embedded tags.
//!
//! Uses the lofty crate for format-independent metadata access.
//! [`AudioFile`] is the item stored in song libraries; [`TagLoader`] builds
//! them during scans.
//!
//! Tags are kept as a flat, lower-case name to value map so album grouping
//! and display code never needs to know which tag format a file used.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use lofty::error::ErrorKind;
use lofty::file::{AudioFile as _, TaggedFileExt as _};
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::library::albums::AlbumItem;
use crate::library::item::{FileItem, Item, ItemLoader};

/// File extensions the loader picks up during scans.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "mp4", "aac", "wav", "aif", "aiff", "ape", "wv",
    "mpc", "spx",
];

/// Tag names we read, and where lofty keeps them.
const TAG_KEYS: &[(&str, ItemKey)] = &[
    ("title", ItemKey::TrackTitle),
    ("artist", ItemKey::TrackArtist),
    ("album", ItemKey::AlbumTitle),
    ("albumartist", ItemKey::AlbumArtist),
    ("albumsort", ItemKey::AlbumTitleSortOrder),
    ("albumartistsort", ItemKey::AlbumArtistSortOrder),
    ("genre", ItemKey::Genre),
    ("date", ItemKey::RecordingDate),
    ("tracknumber", ItemKey::TrackNumber),
    ("discnumber", ItemKey::DiscNumber),
    ("labelid", ItemKey::CatalogNumber),
    ("musicbrainz_albumid", ItemKey::MusicBrainzReleaseId),
];

/// A song in the library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFile {
    pub path: PathBuf,
    pub mountpoint: PathBuf,
    /// Modification time when the tags were last read.
    pub mtime: Option<SystemTime>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl AudioFile {
    /// An item for `path` with no tags read yet.
    pub fn new(path: impl Into<PathBuf>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mountpoint: mountpoint.into(),
            mtime: None,
            tags: BTreeMap::new(),
            duration_ms: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// Title, falling back to the file name.
    pub fn title(&self) -> String {
        self.get("title").map(str::to_string).unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_tags(tag: &Tag) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for (name, key) in TAG_KEYS {
        if let Some(value) = tag.get_string(key).map(str::trim)
            && !value.is_empty()
        {
            tags.insert((*name).to_string(), value.to_string());
        }
    }
    if !tags.contains_key("date")
        && let Some(year) = tag.get_string(&ItemKey::Year)
    {
        tags.insert("date".to_string(), year.trim().to_string());
    }
    tags
}

impl Item for AudioFile {
    type Key = PathBuf;

    fn key(&self) -> PathBuf {
        self.path.clone()
    }
}

impl FileItem for AudioFile {
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
        let mtime = file_mtime(&self.path);
        let tagged_file = Probe::open(&self.path)
            .map_err(|e| Error::load(&self.path, e.to_string()))?
            .read()
            .map_err(|e| match e.kind() {
                ErrorKind::UnknownFormat => Error::Unsupported(self.path.clone()),
                _ => Error::load(&self.path, e.to_string()),
            })?;

        // Get the primary tag, or fall back to the first available tag
        let tag = tagged_file
            .primary_tag()
            .or_else(|| tagged_file.first_tag());

        self.tags = tag.map(read_tags).unwrap_or_default();
        let duration = tagged_file.properties().duration();
        self.duration_ms = (!duration.is_zero()).then(|| duration.as_millis() as u64);
        self.mtime = mtime;
        Ok(())
    }

    fn relocate(&mut self, path: PathBuf, mountpoint: PathBuf) {
        self.path = path;
        self.mountpoint = mountpoint;
    }
}

impl AlbumItem for AudioFile {
    fn tag(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// Builds [`AudioFile`]s for known audio extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagLoader;

impl ItemLoader<AudioFile> for TagLoader {
    fn filter(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
    }

    fn load(&self, path: &Path, mountpoint: &Path) -> Result<AudioFile> {
        if !self.filter(path) {
            return Err(Error::Unsupported(path.to_path_buf()));
        }
        let mut file = AudioFile::new(path, mountpoint);
        file.reload()?;
        Ok(file)
    }
}
