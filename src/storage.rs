//! Durable key/value storage the credential store mirrors itself into.
//!
//! Layout per origin: [`ACCESS_TOKEN_KEY`], [`REFRESH_TOKEN_KEY`] and [`USER_KEY`]
//! (the principal as JSON). The three are always written together and cleared together.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_KEY: &str = "user";

/// One pending change: `Some` overwrites the key, `None` removes it.
pub type StorageWrite = (&'static str, Option<String>);

/// Consumer-pluggable durable storage.
///
/// Implementations must apply a batch all-or-nothing so a crash never leaves
/// a token without its principal.
pub trait SessionStorage: Send + Sync + 'static {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Apply every write in `batch`, or none of them.
    fn apply(&self, batch: &[StorageWrite]) -> Result<(), Error>;
}

impl<T: SessionStorage> SessionStorage for Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn apply(&self, batch: &[StorageWrite]) -> Result<(), Error> {
        (**self).apply(batch)
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn apply(&self, batch: &[StorageWrite]) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        for (key, value) in batch {
            match value {
                Some(v) => {
                    entries.insert((*key).to_owned(), v.clone());
                }
                None => {
                    entries.remove(*key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(feature = "file-storage")]
pub use file::FileStorage;

#[cfg(feature = "file-storage")]
mod file {
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    use url::Url;

    use super::*;

    /// JSON file per API origin, replaced atomically (write temp file, then rename).
    #[derive(Debug)]
    pub struct FileStorage {
        path: PathBuf,
        entries: Mutex<BTreeMap<String, String>>,
    }

    impl FileStorage {
        /// Open (or lazily create) the storage file for `origin` inside `dir`.
        ///
        /// An unreadable or corrupt file is treated as empty: the user simply has
        /// to log in again.
        ///
        /// # Errors
        ///
        /// Returns [`Error::Storage`] if `dir` cannot be created or the file
        /// exists but cannot be read.
        pub fn open(dir: impl AsRef<Path>, origin: &Url) -> Result<Self, Error> {
            let dir = dir.as_ref();
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Storage(format!("create {}: {e}", dir.display())))?;

            let path = dir.join(file_name(origin));
            let entries = match std::fs::read_to_string(&path) {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                    tracing::warn!(path = %path.display(), error = %e, "Discarding corrupt session file");
                    BTreeMap::new()
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
                Err(e) => {
                    return Err(Error::Storage(format!("read {}: {e}", path.display())));
                }
            };

            Ok(Self {
                path,
                entries: Mutex::new(entries),
            })
        }

        #[must_use]
        pub fn path(&self) -> &Path {
            &self.path
        }

        fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), Error> {
            let raw = serde_json::to_vec_pretty(entries)?;
            let tmp = self.path.with_extension("json.tmp");
            std::fs::write(&tmp, raw)
                .map_err(|e| Error::Storage(format!("write {}: {e}", tmp.display())))?;
            std::fs::rename(&tmp, &self.path)
                .map_err(|e| Error::Storage(format!("rename {}: {e}", self.path.display())))
        }
    }

    impl SessionStorage for FileStorage {
        fn get(&self, key: &str) -> Option<String> {
            self.entries.lock().get(key).cloned()
        }

        fn apply(&self, batch: &[StorageWrite]) -> Result<(), Error> {
            let mut entries = self.entries.lock();
            let mut next = entries.clone();
            for (key, value) in batch {
                match value {
                    Some(v) => {
                        next.insert((*key).to_owned(), v.clone());
                    }
                    None => {
                        next.remove(*key);
                    }
                }
            }
            self.persist(&next)?;
            *entries = next;
            Ok(())
        }
    }

    /// `https://club.example.com:8443` → `https%3A%2F%2Fclub.example.com%3A8443.json`
    fn file_name(origin: &Url) -> String {
        let origin = origin.origin().ascii_serialization();
        format!("{}.json", urlencoding::encode(&origin))
    }

}
