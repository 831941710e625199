//! Object fetch collaborators.
//!
//! An [`ObjectStore`] hands out compressed segment bodies by key; a missing
//! object is `Ok(None)`, not an error. Bodies are released explicitly through
//! [`ObjectBody::close`] so release failures can be reported.
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use crate::error::StorageError;
use crate::segment::SegmentKey;

/// A readable compressed object with explicit release.
pub trait ObjectBody: Read + Send {
    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

impl ObjectBody for File {}

impl ObjectBody for Cursor<Vec<u8>> {}

pub trait ObjectStore: Send + Sync {
    fn fetch(&self, key: &SegmentKey) -> Result<Option<Box<dyn ObjectBody>>, StorageError>;
}

/// Segment objects stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `key` under the root, refusing keys that would escape it.
    pub fn path_of(&self, key: &SegmentKey) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key.as_str());
        let plain = !key.as_str().is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl ObjectStore for FsObjectStore {
    fn fetch(&self, key: &SegmentKey) -> Result<Option<Box<dyn ObjectBody>>, StorageError> {
        let path = self.path_of(key)?;
        match File::open(&path) {
            Ok(f) => Ok(Some(Box::new(f))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Fetch { key: key.to_string(), source }),
        }
    }
}

/// In-memory store that records every fetch, for tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: HashMap<SegmentKey, Vec<u8>>,
    fetched: Mutex<Vec<SegmentKey>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: SegmentKey, bytes: Vec<u8>) {
        self.objects.insert(key, bytes);
    }

    /// Keys fetched so far, in fetch order (including absent ones).
    pub fn fetched(&self) -> Vec<SegmentKey> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn fetch(&self, key: &SegmentKey) -> Result<Option<Box<dyn ObjectBody>>, StorageError> {
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(key.clone());
        }
        Ok(self.objects.get(key).map(|b| Box::new(Cursor::new(b.clone())) as Box<dyn ObjectBody>))
    }
}
