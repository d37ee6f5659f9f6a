//! Object storage for per-instrument datasets.
//!
//! Keys are `/`-separated paths relative to a bucket (`alphavantage/AAPL.json`).
//! `get` distinguishes "not found" (`Ok(None)`) from every other failure, which
//! the merger relies on to tell an absent dataset from an unreadable one.
//!
//! Backends:
//! - [`FsObjectStore`]: bucket is a directory; writes are atomic (write `.tmp`, rename)
//! - [`MemoryObjectStore`]: mutex-guarded map for tests and dry runs

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Distinguishes concurrent scratch files written by one process.
static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("storage I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Narrow blob-store interface used by the merger, the upserter and the run lock.
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Read an object. `Ok(None)` means the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace an object as a whole.
    fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<(), StoreError>;

    /// Create an object only if the key is free. Returns `false` if it already exists.
    fn put_if_absent(&self, key: &str, body: &[u8], content_type: &str)
        -> Result<bool, StoreError>;

    /// Remove an object. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove an object only if its body is exactly `expected`.
    /// Returns `false` when the key is missing or holds something else.
    fn delete_if(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

    /// All keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Filesystem-backed bucket.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        let rel = Path::new(key);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn io_err(key: &str) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            key: key.to_string(),
            source,
        }
    }

    /// Unique `.tmp` sibling of `path`; `list` never reports these.
    fn scratch_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(
            ".{}.{}.tmp",
            std::process::id(),
            SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        PathBuf::from(name)
    }

    fn ensure_parent(path: &Path, key: &str) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Self::io_err(key))?;
        }
        Ok(())
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect_keys(&path, out)?;
                continue;
            }
            // In-flight atomic writes are not objects yet
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(&self.root) {
                let key: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(key.join("/"));
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn describe(&self) -> String {
        format!("fs://{}", self.root.display())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(key)(e)),
        }
    }

    fn put(&self, key: &str, body: &[u8], _content_type: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path, key)?;

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        fs::write(&tmp_path, body).map_err(Self::io_err(key))?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            Self::io_err(key)(e)
        })
    }

    fn put_if_absent(
        &self,
        key: &str,
        body: &[u8],
        _content_type: &str,
    ) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path, key)?;

        // Body is complete before the key appears: write a scratch file, then
        // hard-link it into place, which fails if the key already exists.
        let scratch = Self::scratch_path(&path);
        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&scratch)
            .and_then(|mut f| f.write_all(body).and_then(|_| f.sync_all()));
        if let Err(e) = written {
            let _ = fs::remove_file(&scratch);
            return Err(Self::io_err(key)(e));
        }

        let linked = fs::hard_link(&scratch, &path);
        let _ = fs::remove_file(&scratch);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(Self::io_err(key)(e)),
        }
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(key)(e)),
        }
    }

    fn delete_if(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        // Move the object aside atomically, then inspect what was taken.
        let aside = Self::scratch_path(&path);
        match fs::rename(&path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Self::io_err(key)(e)),
        }

        let taken = fs::read(&aside);
        let matches = taken.as_deref().map(|b| b == expected).unwrap_or(false);
        if !matches {
            // Put it back unless someone created the key in the meantime.
            if let Err(e) = fs::hard_link(&aside, &path) {
                if e.kind() != io::ErrorKind::AlreadyExists {
                    let _ = fs::remove_file(&aside);
                    return Err(Self::io_err(key)(e));
                }
            }
        }
        let _ = fs::remove_file(&aside);
        taken.map_err(Self::io_err(key))?;
        Ok(matches)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)
            .map_err(Self::io_err(prefix))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// In-memory bucket. Stores the content type next to each body.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, String)>>, StoreError> {
        self.objects
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Content type recorded for a key.
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.lock().ok()?.get(key).map(|(_, ct)| ct.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryObjectStore {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        Ok(self.lock()?.get(key).map(|(body, _)| body.clone()))
    }

    fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.lock()?
            .insert(key.to_string(), (body.to_vec(), content_type.to_string()));
        Ok(())
    }

    fn put_if_absent(
        &self,
        key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<bool, StoreError> {
        validate_key(key)?;
        let mut objects = self.lock()?;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), (body.to_vec(), content_type.to_string()));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.lock()?.remove(key);
        Ok(())
    }

    fn delete_if(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        validate_key(key)?;
        let mut objects = self.lock()?;
        let matches = objects
            .get(key)
            .is_some_and(|(body, _)| body.as_slice() == expected);
        if matches {
            objects.remove(key);
        }
        Ok(matches)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
