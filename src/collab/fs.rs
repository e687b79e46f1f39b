//! Directory-backed object store.
//!
//! ```text
//! <root>/objects/<bookId>/<file>       object bytes
//! <root>/meta/<bookId>/<file>.json     ObjectMetadata as JSON
//! ```
//!
//! Writes go to a temporary file in the target directory and are renamed
//! into place, so a reader never sees half an object.

use super::{ObjectStore, StorageEvent};
use crate::error::Book2PdfError;
use crate::model::{ObjectMetadata, ObjectSummary, StoredObject};
use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub struct FsObjectStore {
    bucket: String,
    root: PathBuf,
    events: Mutex<Option<mpsc::UnboundedSender<StorageEvent>>>,
}

impl FsObjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Result<Self, Book2PdfError> {
        let root = root.into();
        for dir in [root.join("objects"), root.join("meta")] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| storage_err("open", &dir.display().to_string(), e))?;
        }
        Ok(Self {
            bucket: bucket.into(),
            root,
            events: Mutex::new(None),
        })
    }

    /// Like [`open`](Self::open), reporting every `put` on the returned receiver.
    pub async fn open_with_events(
        root: impl Into<PathBuf>,
        bucket: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StorageEvent>), Book2PdfError> {
        let store = Self::open(root, bucket).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        *store.events.lock().await = Some(tx);
        Ok((store, rx))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, Book2PdfError> {
        Ok(self.root.join("objects").join(checked_key(key)?))
    }

    fn meta_path(&self, key: &str) -> Result<PathBuf, Book2PdfError> {
        Ok(self.root.join("meta").join(format!("{}.json", checked_key(key)?)))
    }
}

/// Keys must be relative paths of normal components.
fn checked_key(key: &str) -> Result<&str, Book2PdfError> {
    let ok = !key.is_empty()
        && !key.contains('\\')
        && !key.split('/').any(str::is_empty)
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(key)
    } else {
        Err(Book2PdfError::UnexpectedKey {
            key: key.to_string(),
        })
    }
}

fn storage_err(op: &'static str, key: &str, e: impl std::fmt::Display) -> Book2PdfError {
    Book2PdfError::Storage {
        op,
        key: key.to_string(),
        reason: e.to_string(),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn remove_optional(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl FsObjectStore {
    async fn read_meta(&self, key: &str) -> Result<ObjectMetadata, Book2PdfError> {
        let path = self.meta_path(key)?;
        match read_optional(&path).await.map_err(|e| storage_err("head", key, e))? {
            Some(json) => serde_json::from_slice(&json).map_err(|e| storage_err("head", key, e)),
            None => Ok(ObjectMetadata::default()),
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), Book2PdfError> {
        let object_path = self.object_path(key)?;
        let meta_path = self.meta_path(key)?;
        let meta_json = serde_json::to_vec(&metadata).map_err(|e| storage_err("put", key, e))?;
        let size = bytes.len() as u64;

        tokio::task::spawn_blocking(move || {
            write_atomic(&meta_path, &meta_json)?;
            write_atomic(&object_path, &bytes)
        })
        .await
        .map_err(|e| storage_err("put", key, e))?
        .map_err(|e| storage_err("put", key, e))?;

        if let Some(tx) = self.events.lock().await.as_ref() {
            let event = StorageEvent {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                size,
            };
            if tx.send(event).is_err() {
                debug!(key, "Storage event receiver dropped");
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>, Book2PdfError> {
        let path = self.object_path(key)?;
        let Some(bytes) = read_optional(&path)
            .await
            .map_err(|e| storage_err("get", key, e))?
        else {
            return Ok(None);
        };
        Ok(Some(StoredObject {
            key: key.to_string(),
            bytes,
            metadata: self.read_meta(key).await?,
        }))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, Book2PdfError> {
        let path = self.object_path(key)?;
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| storage_err("head", key, e))?;
        if !exists {
            return Ok(None);
        }
        Ok(Some(self.read_meta(key).await?))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>, Book2PdfError> {
        let base = self.root.join("objects");
        // Walk only the directory part of the prefix.
        let start = match prefix.rfind('/') {
            Some(i) => base.join(checked_key(&prefix[..i])?),
            None => base.clone(),
        };
        let prefix_owned = prefix.to_string();

        let mut found = tokio::task::spawn_blocking(move || -> io::Result<Vec<ObjectSummary>> {
            let mut out = Vec::new();
            let mut stack = vec![start];
            while let Some(dir) = stack.pop() {
                let entries = match std::fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };
                for entry in entries {
                    let entry = entry?;
                    let path = entry.path();
                    // Entries deleted since read_dir returned them are skipped.
                    let metadata = match entry.metadata() {
                        Ok(metadata) => metadata,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e),
                    };
                    if metadata.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    let Ok(rel) = path.strip_prefix(&base) else {
                        continue;
                    };
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    // Temporary files of an in-flight write.
                    if key.rsplit('/').next().is_some_and(|n| n.starts_with(".tmp")) {
                        continue;
                    }
                    if key.starts_with(&prefix_owned) {
                        out.push(ObjectSummary {
                            key,
                            size: metadata.len(),
                        });
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| storage_err("list", prefix, e))?
        .map_err(|e| storage_err("list", prefix, e))?;

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn delete(&self, key: &str) -> Result<(), Book2PdfError> {
        remove_optional(&self.object_path(key)?)
            .await
            .map_err(|e| storage_err("delete", key, e))?;
        remove_optional(&self.meta_path(key)?)
            .await
            .map_err(|e| storage_err("delete", key, e))
    }

    async fn close(&self) {
        self.events.lock().await.take();
    }
}
