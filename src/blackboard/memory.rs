use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{ensure_value, Blackboard, BlackboardError, BoardEntry, Entry, Signal};

/// A write applied to a [`MemoryBlackboard`], kept in order for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardWrite {
    Set { signal: Signal, value: String },
    Delete { signal: Signal },
}

/// Process-local blackboard. Does not survive restarts; used by tests and
/// single-process runs.
#[derive(Debug, Default)]
pub struct MemoryBlackboard {
    entries: RwLock<BTreeMap<Signal, BoardEntry>>,
    writes: RwLock<Vec<BoardWrite>>,
}

impl MemoryBlackboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a board pre-populated with the given pairs.
    pub async fn seeded(pairs: &[(Signal, &str)]) -> Result<Self, BlackboardError> {
        let board = Self::new();
        for (signal, value) in pairs {
            board.set(*signal, value).await?;
        }
        board.writes.write().await.clear();
        Ok(board)
    }

    /// Every write since construction (seeding excluded), oldest first.
    pub async fn writes(&self) -> Vec<BoardWrite> {
        self.writes.read().await.clone()
    }
}

#[async_trait]
impl Blackboard for MemoryBlackboard {
    async fn get(&self, signal: Signal) -> Result<Entry, BlackboardError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&signal)
            .map(|entry| entry.value.clone())
            .into())
    }

    async fn set(&self, signal: Signal, value: &str) -> Result<(), BlackboardError> {
        ensure_value(signal, value)?;
        self.entries.write().await.insert(
            signal,
            BoardEntry {
                signal,
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );
        self.writes.write().await.push(BoardWrite::Set {
            signal,
            value: value.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, signal: Signal) -> Result<(), BlackboardError> {
        self.entries.write().await.remove(&signal);
        self.writes.write().await.push(BoardWrite::Delete { signal });
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<BoardEntry>, BlackboardError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }
}
