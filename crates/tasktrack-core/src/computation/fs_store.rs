use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::computation::{
    ComputationEntry, ComputationError, ComputationResult, ComputationStore, now_millis,
};

const ENTRY_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";
/// Leaves room for the temp-file decorations under the usual 255-byte
/// file name limit.
const MAX_ENCODED_KEY_LEN: usize = 200;

/// One JSON document per key under `root`.
///
/// Writes land through a temp file and a rename so readers never see a torn
/// entry. With a TTL, terminal entries older than the TTL are deleted the
/// next time anyone reads them. Mutations through one store instance are
/// serialized, so a conditional write never resurrects a removed key.
pub struct FileSystemComputationStore {
    root: PathBuf,
    ttl: Option<Duration>,
    temp_counter: AtomicU64,
    mutation: Mutex<()>,
}

impl FileSystemComputationStore {
    pub fn new(root: impl Into<PathBuf>) -> ComputationResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|error| {
            ComputationError::Unavailable(format!(
                "failed to create computation store directory '{}': {error}",
                root.display()
            ))
        })?;

        Ok(Self {
            root,
            ttl: None,
            temp_counter: AtomicU64::new(0),
            mutation: Mutex::new(()),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// `None` for keys that cannot name an entry file.
    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        let encoded = encode_key(key)?;
        Some(self.root.join(format!("{encoded}{ENTRY_SUFFIX}")))
    }

    fn writable_path(&self, key: &str) -> ComputationResult<PathBuf> {
        if key.is_empty() {
            return Err(ComputationError::InvalidKey(
                "computation keys must not be empty".to_string(),
            ));
        }
        self.entry_path(key).ok_or_else(|| {
            ComputationError::InvalidKey(format!(
                "key of {} bytes encodes to a file name longer than {MAX_ENCODED_KEY_LEN} bytes",
                key.len()
            ))
        })
    }

    fn lock_mutations(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lands `entry` at `path` through a temp file and a rename.
    fn replace_entry(&self, path: &Path, entry: &ComputationEntry) -> ComputationResult<()> {
        let payload = serde_json::to_vec(entry).map_err(|error| {
            ComputationError::Unavailable(format!("failed to encode computation entry: {error}"))
        })?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self.root.join(format!(
            ".{file_name}.{}.{}{TEMP_SUFFIX}",
            std::process::id(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        fs::write(&temp_path, payload)
            .and_then(|_| fs::rename(&temp_path, path))
            .map_err(|error| {
                let _ = fs::remove_file(&temp_path);
                ComputationError::Unavailable(format!(
                    "failed to write '{}': {error}",
                    path.display()
                ))
            })
    }

    fn remove_path(&self, path: &Path) -> ComputationResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(ComputationError::Unavailable(format!(
                "failed to remove '{}': {error}",
                path.display()
            ))),
        }
    }

    /// Removes the entry at `path` unless a writer replaced it with a live
    /// one since it was read.
    fn expire(&self, key: &str, path: &Path) -> ComputationResult<()> {
        let _guard = self.lock_mutations();
        let still_expired = fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<ComputationEntry>(&bytes).ok())
            .is_some_and(|entry| self.is_expired(&entry));
        if still_expired {
            tracing::debug!(key, "expiring computation entry");
            self.remove_path(path)?;
        }
        Ok(())
    }

    fn is_expired(&self, entry: &ComputationEntry) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        entry.status.is_terminal()
            && now_millis().saturating_sub(entry.updated_at_ms) > ttl.as_millis() as u64
    }
}

impl ComputationStore for FileSystemComputationStore {
    fn read(&self, key: &str) -> ComputationResult<Option<ComputationEntry>> {
        let Some(path) = self.entry_path(key) else {
            return Ok(None);
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(ComputationError::Unavailable(format!(
                    "failed to read '{}': {error}",
                    path.display()
                )));
            }
        };

        let entry: ComputationEntry = serde_json::from_slice(&bytes).map_err(|error| {
            ComputationError::Unavailable(format!(
                "corrupt computation entry '{}': {error}",
                path.display()
            ))
        })?;

        if self.is_expired(&entry) {
            self.expire(key, &path)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn write(&self, key: &str, entry: &ComputationEntry) -> ComputationResult<()> {
        let path = self.writable_path(key)?;
        let _guard = self.lock_mutations();
        self.replace_entry(&path, entry)
    }

    fn write_if_present(&self, key: &str, entry: &ComputationEntry) -> ComputationResult<bool> {
        let Some(path) = self.entry_path(key) else {
            return Ok(false);
        };
        let _guard = self.lock_mutations();
        let exists = path.try_exists().map_err(|error| {
            ComputationError::Unavailable(format!(
                "failed to check '{}': {error}",
                path.display()
            ))
        })?;
        if !exists {
            return Ok(false);
        }
        self.replace_entry(&path, entry)?;
        Ok(true)
    }

    fn remove(&self, key: &str) -> ComputationResult<bool> {
        let Some(path) = self.entry_path(key) else {
            return Ok(false);
        };
        let _guard = self.lock_mutations();
        self.remove_path(&path)
    }

    /// Live keys in lexicographic order of their encoded file names.
    fn keys(&self) -> ComputationResult<Vec<String>> {
        let listing = fs::read_dir(&self.root).map_err(|error| {
            ComputationError::Unavailable(format!(
                "failed to list '{}': {error}",
                self.root.display()
            ))
        })?;

        let mut names = Vec::new();
        for item in listing {
            let item = item.map_err(|error| {
                ComputationError::Unavailable(format!(
                    "failed to list '{}': {error}",
                    self.root.display()
                ))
            })?;
            let file_name = item.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(ENTRY_SUFFIX) {
                names.push(stem.to_string());
            }
        }
        names.sort();

        let mut keys = Vec::with_capacity(names.len());
        for name in names {
            let Some(key) = decode_key(&name) else {
                continue;
            };
            // Reading also drops anything that has expired.
            if self.read(&key)?.is_some() {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Percent-encodes `key` into a file stem; `None` when the stem would be
/// too long to be a file name.
fn encode_key(key: &str) -> Option<String> {
    let encoded = urlencoding::encode(key);
    (encoded.len() <= MAX_ENCODED_KEY_LEN).then(|| encoded.into_owned())
}

fn decode_key(encoded: &str) -> Option<String> {
    urlencoding::decode(encoded).ok().map(|key| key.into_owned())
}

#[cfg(test)]
mod tests {
    use super::{MAX_ENCODED_KEY_LEN, decode_key, encode_key};

    #[test]
    fn keys_map_to_safe_file_names() {
        assert_eq!(encode_key("task-1_a").as_deref(), Some("task-1_a"));
        assert_eq!(
            encode_key("../etc/passwd").as_deref(),
            Some("..%2Fetc%2Fpasswd")
        );
        assert_eq!(encode_key("é").as_deref(), Some("%C3%A9"));

        for key in ["task-1_a", "../etc/passwd", "é", "a b.c%", ".hidden"] {
            let encoded = encode_key(key).unwrap();
            assert!(!encoded.contains('/'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
        assert_eq!(decode_key("%FF"), None);
    }

    #[test]
    fn overlong_keys_have_no_file_name() {
        assert!(encode_key(&"a".repeat(MAX_ENCODED_KEY_LEN)).is_some());
        assert_eq!(encode_key(&"a".repeat(MAX_ENCODED_KEY_LEN + 1)), None);
        assert_eq!(encode_key(&"/".repeat(90)), None);
    }
}
