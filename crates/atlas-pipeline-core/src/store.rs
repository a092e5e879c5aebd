use crate::error::{AtlasPipelineError, Result};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

/// Binary payload storage keyed by string.
///
/// Shared by concurrently processed bundle groups, so implementations synchronize
/// internally. Groups never write the same key.
pub trait ResourceStore: Sync {
    fn read(&self, key: &str) -> Result<Vec<u8>>;
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn exists(&self, key: &str) -> bool;
    /// Byte length of the stored binary.
    fn size(&self, key: &str) -> Result<u64>;
    fn remove(&self, key: &str) -> Result<()>;
}

fn not_found(key: &str) -> AtlasPipelineError {
    AtlasPipelineError::Store {
        key: key.to_string(),
        reason: "not found".into(),
    }
}

fn poisoned(key: &str) -> AtlasPipelineError {
    AtlasPipelineError::Store {
        key: key.to_string(),
        reason: "store lock poisoned".into(),
    }
}

/// In-memory store; also counts writes so callers can observe cache behavior.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    writes: RwLock<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `write` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.read().map(|w| *w).unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blobs
            .read()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl ResourceStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.read().map_err(|_| poisoned(key))?;
        blobs.get(key).cloned().ok_or_else(|| not_found(key))
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .map_err(|_| poisoned(key))?
            .insert(key.to_string(), bytes.to_vec());
        *self.writes.write().map_err(|_| poisoned(key))? += 1;
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.blobs
            .read()
            .map(|b| b.contains_key(key))
            .unwrap_or(false)
    }

    fn size(&self, key: &str) -> Result<u64> {
        let blobs = self.blobs.read().map_err(|_| poisoned(key))?;
        blobs
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| not_found(key))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.blobs
            .write()
            .map_err(|_| poisoned(key))?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| not_found(key))
    }
}

/// Store rooted at a directory; keys are relative `/`-separated paths.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `key` inside the root, rejecting absolute paths and `..` components.
    pub fn path_of(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let escapes = key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(AtlasPipelineError::Store {
                key: key.to_string(),
                reason: "key must be a relative path inside the store".into(),
            });
        }
        Ok(self.root.join(rel))
    }
}

impl ResourceStore for DirStore {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found(key),
            _ => AtlasPipelineError::Io(e),
        })
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // atomic replace through `<file name>.partial`
        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| AtlasPipelineError::Store {
                key: key.to_string(),
                reason: "key does not name a file".into(),
            })?;
        tmp_name.push(".partial");
        let tmp = path.with_file_name(tmp_name);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.path_of(key).map(|p| p.is_file()).unwrap_or(false)
    }

    fn size(&self, key: &str) -> Result<u64> {
        let path = self.path_of(key)?;
        fs::metadata(&path).map(|m| m.len()).map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found(key),
            _ => AtlasPipelineError::Io(e),
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found(key),
            _ => AtlasPipelineError::Io(e),
        })
    }
}
