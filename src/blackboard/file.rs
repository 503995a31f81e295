use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ensure_value, Blackboard, BlackboardError, BoardEntry, Entry, Signal};

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BoardDocument {
    version: u32,
    entries: BTreeMap<Signal, StoredValue>,
}

impl Default for BoardDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredValue {
    value: String,
    updated_at: DateTime<Utc>,
}

/// Blackboard persisted as a single JSON document.
///
/// Every operation takes an advisory lock on a sibling `.lock` file, so
/// several processes (one per trigger invocation) can share the document.
/// Writes go to a temporary file that is renamed over the original, which
/// keeps a half-written document from ever being observed.
#[derive(Debug, Clone)]
pub struct FileBlackboard {
    path: PathBuf,
}

impl FileBlackboard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    async fn read(&self) -> Result<BoardDocument, BlackboardError> {
        let path = self.path.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || {
            let lock = fd_lock::RwLock::new(open_lock_file(&path, &lock_path)?);
            let _guard = lock.read()?;
            read_document(&path)
        })
        .await
        .map_err(|e| BlackboardError::Worker(e.to_string()))?
    }

    async fn update<F>(&self, mutate: F) -> Result<(), BlackboardError>
    where
        F: FnOnce(&mut BoardDocument) -> bool + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || {
            let mut lock = fd_lock::RwLock::new(open_lock_file(&path, &lock_path)?);
            let _guard = lock.write()?;
            let mut document = read_document(&path)?;
            if mutate(&mut document) {
                write_document(&path, &document)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| BlackboardError::Worker(e.to_string()))?
    }
}

fn open_lock_file(path: &Path, lock_path: &Path) -> Result<std::fs::File, BlackboardError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

fn read_document(path: &Path) -> Result<BoardDocument, BlackboardError> {
    match std::fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(BoardDocument::default()),
        Ok(contents) => serde_json::from_str(&contents).map_err(|e| BlackboardError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BoardDocument::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_document(path: &Path, document: &BoardDocument) -> Result<(), BlackboardError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "blackboard".to_string());
    let temp_path = path.with_file_name(format!(".{file_name}.{:08x}.tmp", rand::random::<u32>()));

    let encoded = serde_json::to_vec_pretty(document)?;
    let mut temp = std::fs::File::create(&temp_path)?;
    temp.write_all(&encoded)?;
    temp.sync_all()?;
    std::fs::rename(&temp_path, path)?;

    debug!(path = %path.display(), keys = document.entries.len(), "Blackboard document written");
    Ok(())
}

#[async_trait]
impl Blackboard for FileBlackboard {
    async fn get(&self, signal: Signal) -> Result<Entry, BlackboardError> {
        let document = self.read().await?;
        Ok(document.entries.get(&signal).map(|v| v.value.clone()).into())
    }

    async fn set(&self, signal: Signal, value: &str) -> Result<(), BlackboardError> {
        ensure_value(signal, value)?;
        let value = value.to_string();
        self.update(move |document| {
            document.entries.insert(
                signal,
                StoredValue {
                    value,
                    updated_at: Utc::now(),
                },
            );
            true
        })
        .await
    }

    async fn delete(&self, signal: Signal) -> Result<(), BlackboardError> {
        self.update(move |document| document.entries.remove(&signal).is_some())
            .await
    }

    async fn snapshot(&self) -> Result<Vec<BoardEntry>, BlackboardError> {
        let document = self.read().await?;
        Ok(document
            .entries
            .into_iter()
            .map(|(signal, stored)| BoardEntry {
                signal,
                value: stored.value,
                updated_at: stored.updated_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_reads_absent() {
        let dir = TempDir::new().unwrap();
        let board = FileBlackboard::new(dir.path().join("board.json"));
        assert_eq!(board.get(Signal::ClusterId).await.unwrap(), Entry::Absent);
        assert!(board.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_values_survive_new_instance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("board.json");

        FileBlackboard::new(&path)
            .set(Signal::ClusterId, "j-123")
            .await
            .unwrap();

        let reopened = FileBlackboard::new(&path);
        assert_eq!(
            reopened.get(Signal::ClusterId).await.unwrap(),
            Entry::Present("j-123".to_string())
        );
    }

    #[tokio::test]
    async fn test_delete_absent_key_leaves_no_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.json");
        let board = FileBlackboard::new(&path);
        board.delete(Signal::CombineDagState).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_document_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FileBlackboard::new(&path)
            .get(Signal::ClusterId)
            .await
            .unwrap_err();
        assert!(matches!(err, BlackboardError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_writers_to_distinct_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.json");

        let mut handles = Vec::new();
        for (signal, value) in [
            (Signal::ClusterId, "j-1"),
            (Signal::MasterSgId, "sg-m"),
            (Signal::SlaveSgId, "sg-s"),
            (Signal::KeypairName, "kp"),
        ] {
            let board = FileBlackboard::new(&path);
            handles.push(tokio::spawn(async move { board.set(signal, value).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let snapshot = FileBlackboard::new(&path).snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 4);
    }
}
