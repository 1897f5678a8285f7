//! Loading and saving a library's full item set.
//!
//! The on-disk format is whatever the [`ItemCodec`] produces. A file that
//! fails to decode is moved aside to `<path>.not-valid` so the next save does
//! not silently overwrite something a user may want to recover, and the
//! library starts empty. Saves go through a temporary file and a rename, so a
//! failed save leaves the previous file untouched.

use std::cmp::Ordering;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::base::AsLibrary;
use super::item::{Item, ItemRef};
use crate::error::{Result, ResultExt};

/// Serializes a whole library to bytes and back.
pub trait ItemCodec<V> {
    fn encode(&self, items: &[&V]) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<V>>;
}

/// JSON array of items via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    pub pretty: bool,
}

impl<V: Serialize + DeserializeOwned> ItemCodec<V> for JsonCodec {
    fn encode(&self, items: &[&V]) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(items)?
        } else {
            serde_json::to_vec(items)?
        };
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<V>> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `<path>.not-valid`, where undecodable library files are moved.
pub fn not_valid_path(path: &Path) -> PathBuf {
    with_suffix(path, ".not-valid")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Read and decode the items stored at `path`.
///
/// Never fails: a missing or unreadable file yields nothing, and an
/// undecodable one is quarantined first.
pub fn load_items<V>(path: &Path, codec: &dyn ItemCodec<V>) -> Vec<V> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(target: "library::persist", path = %path.display(), "No library file yet");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(
                target: "library::persist",
                path = %path.display(),
                error = %e,
                "Could not read library file"
            );
            return Vec::new();
        }
    };

    match codec.decode(&bytes) {
        Ok(items) => {
            tracing::info!(
                target: "library::persist",
                path = %path.display(),
                count = items.len(),
                "Loaded library"
            );
            items
        }
        Err(e) => {
            let quarantine = not_valid_path(path);
            tracing::error!(
                target: "library::persist",
                path = %path.display(),
                error = %e,
                "Library file is corrupt, moving it to {}",
                quarantine.display()
            );
            if let Err(e) = fs::rename(path, &quarantine) {
                tracing::warn!(
                    target: "library::persist",
                    path = %path.display(),
                    error = %e,
                    "Could not move corrupt library file aside"
                );
            }
            Vec::new()
        }
    }
}

/// Encode `items` and atomically replace the file at `path`.
pub fn save_items<V>(path: &Path, codec: &dyn ItemCodec<V>, items: &[&V]) -> Result<()> {
    let bytes = codec.encode(items)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(format!("creating {}", parent.display()))?;
    }

    let temp_path = with_suffix(path, ".tmp");
    let written = write_synced(&temp_path, &bytes).and_then(|()| {
        fs::rename(&temp_path, path)
            .with_context(format!("renaming {} to {}", temp_path.display(), path.display()))
    });
    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let context = || format!("writing {}", path.display());
    let mut file = File::create(path).with_context(context())?;
    file.write_all(bytes).with_context(context())?;
    file.sync_all().with_context(context())?;
    Ok(())
}

/// Load/save support for any library layer.
pub trait Persistent<V: Item>: AsLibrary<V> {
    /// Put freshly decoded items in place. Emits nothing.
    fn load_init(&self, items: Vec<V>) {
        let library = self.as_library();
        for item in items {
            library.insert_silent(ItemRef::new(item));
        }
    }

    /// Everything that should be written on save, ordered by key.
    fn content(&self) -> Vec<ItemRef<V>> {
        let mut items = self.as_library().values();
        items.sort_by(|a, b| compare_keys(a, b));
        items
    }

    /// Load items from `path`. Returns how many were read.
    fn load(&self, path: &Path, codec: &dyn ItemCodec<V>) -> usize {
        let items = load_items(path, codec);
        let count = items.len();
        self.load_init(items);
        count
    }

    /// Save [`content`](Self::content) to `path`. The dirty flag is cleared
    /// only when the file was written.
    fn save(&self, path: &Path, codec: &dyn ItemCodec<V>) -> bool {
        let content = self.content();
        let borrowed: Vec<_> = content.iter().map(ItemRef::borrow).collect();
        let items: Vec<&V> = borrowed.iter().map(|item| &**item).collect();

        match save_items(path, codec, &items) {
            Ok(()) => {
                self.as_library().mark_clean();
                tracing::info!(
                    target: "library::persist",
                    path = %path.display(),
                    count = items.len(),
                    "Saved library"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    target: "library::persist",
                    path = %path.display(),
                    error = %e,
                    "Could not save library"
                );
                false
            }
        }
    }
}

impl<V: Item> Persistent<V> for super::base::Library<V> {}

pub(crate) fn compare_keys<V: Item>(a: &ItemRef<V>, b: &ItemRef<V>) -> Ordering {
    a.key().cmp(&b.key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::library::Library;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
        title: String,
    }

    impl Item for Row {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    fn row(id: u32, title: &str) -> ItemRef<Row> {
        ItemRef::new(Row {
            id,
            title: title.to_string(),
        })
    }

    struct FailingCodec;

    impl ItemCodec<Row> for FailingCodec {
        fn encode(&self, _items: &[&Row]) -> Result<Vec<u8>> {
            Err(Error::codec("refusing to encode"))
        }

        fn decode(&self, _bytes: &[u8]) -> Result<Vec<Row>> {
            Err(Error::codec("refusing to decode"))
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lib").join("rows.json");

        let library = Library::new();
        library.add([row(2, "two"), row(1, "one")]);
        assert!(library.is_dirty());
        assert!(library.save(&path, &JsonCodec::default()));
        assert!(!library.is_dirty());

        let restored = Library::<Row>::new();
        assert_eq!(restored.load(&path, &JsonCodec::default()), 2);
        assert_eq!(restored.get(&1).unwrap().borrow().title, "one");
        assert!(!restored.is_dirty());
    }

    #[test]
    fn test_content_is_key_sorted() {
        let library = Library::new();
        library.add([row(3, "c"), row(1, "a"), row(2, "b")]);
        let keys: Vec<u32> = library.content().iter().map(ItemRef::key).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let library = Library::<Row>::new();
        assert_eq!(library.load(&dir.path().join("absent"), &JsonCodec::default()), 0);
        assert!(library.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.json");
        fs::write(&path, b"[{\"id\": 1, \"tit").unwrap();

        let library = Library::<Row>::new();
        assert_eq!(library.load(&path, &JsonCodec::default()), 0);
        assert!(!path.exists());

        let quarantined = not_valid_path(&path);
        assert_eq!(quarantined, dir.path().join("rows.json.not-valid"));
        assert_eq!(fs::read(&quarantined).unwrap(), b"[{\"id\": 1, \"tit");
    }

    #[test]
    fn test_failed_save_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.json");
        fs::write(&path, b"previous").unwrap();

        let library = Library::new();
        library.add([row(1, "one")]);
        assert!(!library.save(&path, &FailingCodec));

        assert!(library.is_dirty());
        assert_eq!(fs::read(&path).unwrap(), b"previous");
        assert!(!with_suffix(&path, ".tmp").exists());
    }

    #[test]
    fn test_save_replaces_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.json");
        fs::write(&path, b"old").unwrap();

        let library = Library::new();
        library.add([row(1, "one")]);
        assert!(library.save(&path, &JsonCodec { pretty: true }));

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("rows.json")]);
        let decoded: Vec<Row> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(decoded[0].title, "one");
    }
}
