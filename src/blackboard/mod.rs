//! Shared key/value blackboard
//!
//! The blackboard is the only channel between chains. Keys are not free-form
//! strings: every key belongs to the fixed [`Signal`] vocabulary, and a read
//! returns an explicit [`Entry::Absent`] rather than an empty string or a
//! missing-key error.
//!
//! | signal                      | producer                  | consumers                          |
//! |-----------------------------|---------------------------|------------------------------------|
//! | `cluster_id`                | provisioning `Create`     | job chains (`Wait_for_cluster`)    |
//! | `master_sg_id`              | provisioning `Preparation`| `Create`, `Cleanup`                |
//! | `slave_sg_id`               | provisioning `Preparation`| `Create`, `Cleanup`                |
//! | `keypair_name`              | provisioning `Preparation`| `Create`, `Cleanup`                |
//! | `short_interests_dag_state` | short interests chain     | own self-barrier, combine chain    |
//! | `prices_dag_state`          | prices chain              | own self-barrier, other job chains |
//! | `combine_dag_state`         | combine chain             | provisioning `Check_etl_completion`|

pub mod file;
pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use file::FileBlackboard;
pub use memory::MemoryBlackboard;
#[cfg(feature = "database")]
pub use sqlite::SqliteBlackboard;

#[derive(Debug, Error)]
pub enum BlackboardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Refusing to store an empty value for '{key}'")]
    EmptyValue { key: String },

    #[error("Unknown blackboard key '{0}'")]
    UnknownKey(String),

    #[error("Blackboard document at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Blackboard worker failed: {0}")]
    Worker(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// The closed vocabulary of blackboard keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    ClusterId,
    MasterSgId,
    SlaveSgId,
    KeypairName,
    ShortInterestsDagState,
    PricesDagState,
    CombineDagState,
}

impl Signal {
    pub const ALL: [Signal; 7] = [
        Signal::ClusterId,
        Signal::KeypairName,
        Signal::MasterSgId,
        Signal::SlaveSgId,
        Signal::ShortInterestsDagState,
        Signal::PricesDagState,
        Signal::CombineDagState,
    ];

    /// Keys making up one cluster record; set together, cleared together.
    pub const CLUSTER_RECORD: [Signal; 4] = [
        Signal::ClusterId,
        Signal::KeypairName,
        Signal::MasterSgId,
        Signal::SlaveSgId,
    ];

    pub const PIPELINE_STATES: [Signal; 3] = [
        Signal::ShortInterestsDagState,
        Signal::PricesDagState,
        Signal::CombineDagState,
    ];

    pub fn as_key(&self) -> &'static str {
        match self {
            Signal::ClusterId => "cluster_id",
            Signal::MasterSgId => "master_sg_id",
            Signal::SlaveSgId => "slave_sg_id",
            Signal::KeypairName => "keypair_name",
            Signal::ShortInterestsDagState => "short_interests_dag_state",
            Signal::PricesDagState => "prices_dag_state",
            Signal::CombineDagState => "combine_dag_state",
        }
    }

    /// Whether this signal carries a [`PipelineFlag`].
    pub fn is_pipeline_flag(&self) -> bool {
        Self::PIPELINE_STATES.contains(self)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

impl FromStr for Signal {
    type Err = BlackboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signal::ALL
            .into_iter()
            .find(|signal| signal.as_key() == s)
            .ok_or_else(|| BlackboardError::UnknownKey(s.to_string()))
    }
}

/// Terminal value of a pipeline signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineFlag {
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl PipelineFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineFlag::Failed => "FAILED",
            PipelineFlag::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "FAILED" => Some(PipelineFlag::Failed),
            "COMPLETED" => Some(PipelineFlag::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a blackboard read. Absence is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Absent,
    Present(String),
}

impl Entry {
    pub fn is_present(&self) -> bool {
        matches!(self, Entry::Present(_))
    }

    pub fn as_deref(&self) -> Option<&str> {
        match self {
            Entry::Absent => None,
            Entry::Present(value) => Some(value.as_str()),
        }
    }

    pub fn into_option(self) -> Option<String> {
        match self {
            Entry::Absent => None,
            Entry::Present(value) => Some(value),
        }
    }
}

impl From<Option<String>> for Entry {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(value) => Entry::Present(value),
            None => Entry::Absent,
        }
    }
}

/// One stored key as reported by [`Blackboard::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardEntry {
    pub signal: Signal,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Externally persisted key/value store shared by every chain.
///
/// Single-key operations only; a reader may observe some keys of a multi-key
/// update before the rest. Each key has a single producer step.
#[async_trait]
pub trait Blackboard: Send + Sync {
    async fn get(&self, signal: Signal) -> Result<Entry, BlackboardError>;

    async fn set(&self, signal: Signal, value: &str) -> Result<(), BlackboardError>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, signal: Signal) -> Result<(), BlackboardError>;

    /// Every key currently present, in vocabulary order.
    async fn snapshot(&self) -> Result<Vec<BoardEntry>, BlackboardError>;

    /// Read a pipeline signal. Values outside the flag domain read as `None`.
    async fn flag(&self, signal: Signal) -> Result<Option<PipelineFlag>, BlackboardError> {
        Ok(self
            .get(signal)
            .await?
            .as_deref()
            .and_then(PipelineFlag::parse))
    }

    async fn raise(&self, signal: Signal, flag: PipelineFlag) -> Result<(), BlackboardError> {
        self.set(signal, flag.as_str()).await
    }
}

/// Delete every key in the vocabulary. This is the resynchronisation point
/// that gives each provisioning cycle a clean slate.
pub async fn clear_all<B: Blackboard + ?Sized>(board: &B) -> Result<(), BlackboardError> {
    for signal in Signal::ALL {
        board.delete(signal).await?;
    }
    Ok(())
}

pub(crate) fn ensure_value(signal: Signal, value: &str) -> Result<(), BlackboardError> {
    if value.is_empty() {
        return Err(BlackboardError::EmptyValue {
            key: signal.as_key().to_string(),
        });
    }
    Ok(())
}
