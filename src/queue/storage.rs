//! Durable storage for offline-eligible submit entries.
//!
//! Layout: an ordered list of [`PersistedEntry`] per queue key. Entries are
//! appended on enqueue, their retry counter is rewritten in place, and they
//! are removed by id once they settle.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::command::Command;
use crate::lock::mutex_lock;

const SOURCE: &str = "queue::storage";
const FILE_NAME: &str = "submit-queue.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub id: Uuid,
    pub queue_key: String,
    pub command: Command,
    pub retries: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt queue storage: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait QueueStorage: Send + Sync {
    async fn append(&self, entry: &PersistedEntry) -> Result<(), StorageError>;

    /// Returns false when no entry with that id was stored.
    async fn remove(&self, queue_key: &str, id: Uuid) -> Result<bool, StorageError>;

    async fn update_retries(
        &self,
        queue_key: &str,
        id: Uuid,
        retries: u32,
    ) -> Result<(), StorageError>;

    /// Entries for one queue key in the order they were appended.
    async fn list(&self, queue_key: &str) -> Result<Vec<PersistedEntry>, StorageError>;

    async fn queue_keys(&self) -> Result<Vec<String>, StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;
}

type Layout = BTreeMap<String, Vec<PersistedEntry>>;

fn remove_entry(layout: &mut Layout, queue_key: &str, id: Uuid) -> bool {
    let Some(entries) = layout.get_mut(queue_key) else {
        return false;
    };
    let before = entries.len();
    entries.retain(|entry| entry.id != id);
    let removed = entries.len() != before;
    if entries.is_empty() {
        layout.remove(queue_key);
    }
    removed
}

fn set_retries(layout: &mut Layout, queue_key: &str, id: Uuid, retries: u32) {
    if let Some(entry) = layout
        .get_mut(queue_key)
        .and_then(|entries| entries.iter_mut().find(|entry| entry.id == id))
    {
        entry.retries = retries;
    }
}

/// Process-local storage; nothing survives a restart.
#[derive(Default)]
pub struct MemoryQueueStorage {
    layout: Mutex<Layout>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn append(&self, entry: &PersistedEntry) -> Result<(), StorageError> {
        mutex_lock(&self.layout, SOURCE, "append")
            .entry(entry.queue_key.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn remove(&self, queue_key: &str, id: Uuid) -> Result<bool, StorageError> {
        Ok(remove_entry(
            &mut mutex_lock(&self.layout, SOURCE, "remove"),
            queue_key,
            id,
        ))
    }

    async fn update_retries(
        &self,
        queue_key: &str,
        id: Uuid,
        retries: u32,
    ) -> Result<(), StorageError> {
        set_retries(
            &mut mutex_lock(&self.layout, SOURCE, "update_retries"),
            queue_key,
            id,
            retries,
        );
        Ok(())
    }

    async fn list(&self, queue_key: &str) -> Result<Vec<PersistedEntry>, StorageError> {
        Ok(mutex_lock(&self.layout, SOURCE, "list")
            .get(queue_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn queue_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(mutex_lock(&self.layout, SOURCE, "queue_keys")
            .keys()
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        mutex_lock(&self.layout, SOURCE, "clear").clear();
        Ok(())
    }
}

/// JSON file storage under a directory.
///
/// Every mutation rewrites the file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new layout on disk.
pub struct FileQueueStorage {
    path: PathBuf,
    guard: tokio::sync::Mutex<()>,
}

impl FileQueueStorage {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            path: directory.as_ref().join(FILE_NAME),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn load(&self) -> Result<Layout, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Layout::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Layout::new()),
            Err(err) => Err(self.io_error(err)),
        }
    }

    async fn store(&self, layout: &Layout) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(err))?;
        }
        let encoded = serde_json::to_vec_pretty(layout)?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, encoded)
            .await
            .map_err(|err| self.io_error(err))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|err| self.io_error(err))
    }

    async fn modify<R>(&self, change: impl FnOnce(&mut Layout) -> R) -> Result<R, StorageError> {
        let _guard = self.guard.lock().await;
        let mut layout = self.load().await?;
        let result = change(&mut layout);
        self.store(&layout).await?;
        Ok(result)
    }
}

#[async_trait]
impl QueueStorage for FileQueueStorage {
    async fn append(&self, entry: &PersistedEntry) -> Result<(), StorageError> {
        let entry = entry.clone();
        self.modify(move |layout| {
            layout.entry(entry.queue_key.clone()).or_default().push(entry);
        })
        .await
    }

    async fn remove(&self, queue_key: &str, id: Uuid) -> Result<bool, StorageError> {
        self.modify(|layout| remove_entry(layout, queue_key, id)).await
    }

    async fn update_retries(
        &self,
        queue_key: &str,
        id: Uuid,
        retries: u32,
    ) -> Result<(), StorageError> {
        self.modify(|layout| set_retries(layout, queue_key, id, retries))
            .await
    }

    async fn list(&self, queue_key: &str) -> Result<Vec<PersistedEntry>, StorageError> {
        let _guard = self.guard.lock().await;
        Ok(self.load().await?.remove(queue_key).unwrap_or_default())
    }

    async fn queue_keys(&self) -> Result<Vec<String>, StorageError> {
        let _guard = self.guard.lock().await;
        Ok(self.load().await?.into_keys().collect())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.modify(Layout::clear).await
    }
}
