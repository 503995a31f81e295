//! Persistent run state, one JSON record per chain.
//!
//! The record is checkpointed after every step outcome, so a process restart
//! resumes the run at the first step that has not finished.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run record at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// Created but not yet advanced.
    Queued,
    /// Steps are executing. After a restart the run resumes at its cursor.
    Running,
    /// A barrier is not satisfied; advance again at or after `until`.
    Waiting { until: DateTime<Utc> },
    Succeeded,
    Failed { task_id: String, error: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Rescheduled,
    /// The step decided there was nothing to do.
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAttempt {
    pub task_id: String,
    pub at: DateTime<Utc>,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub chain: String,
    /// Start of the schedule interval this run covers
    pub interval_start: DateTime<Utc>,
    pub logical_date: NaiveDate,
    /// Index of the next step to execute
    pub cursor: usize,
    #[serde(flatten)]
    pub state: RunState,
    /// Number of invocations that advanced this run
    pub attempts: u32,
    pub step_history: Vec<StepAttempt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// A run for the schedule interval starting at `interval_start`.
    pub fn scheduled(chain: &str, interval_start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::new(
            format!("scheduled__{}", interval_start.format("%Y-%m-%dT%H:%M:%S")),
            chain,
            interval_start,
            now,
        )
    }

    /// A run requested outside the schedule, covering the moment it was made.
    pub fn manual(chain: &str, now: DateTime<Utc>) -> Self {
        Self::new(
            format!("manual__{}", now.format("%Y-%m-%dT%H:%M:%S")),
            chain,
            now,
            now,
        )
    }

    fn new(run_id: String, chain: &str, interval_start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            chain: chain.to_string(),
            interval_start,
            logical_date: interval_start.date_naive(),
            cursor: 0,
            state: RunState::Queued,
            attempts: 0,
            step_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record(&mut self, task_id: &str, outcome: StepOutcome, at: DateTime<Utc>) {
        self.step_history.push(StepAttempt {
            task_id: task_id.to_string(),
            at,
            outcome,
        });
        self.updated_at = at;
    }

    /// Whether the scheduler may advance this run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            RunState::Queued | RunState::Running => true,
            RunState::Waiting { until } => *until <= now,
            RunState::Succeeded | RunState::Failed { .. } => false,
        }
    }
}

/// Durable store for a run between its steps.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn checkpoint(&self, record: &RunRecord) -> Result<(), LedgerError>;
}

#[async_trait]
impl Checkpoint for RunLedger {
    async fn checkpoint(&self, record: &RunRecord) -> Result<(), LedgerError> {
        self.save(record).await
    }
}

/// Directory of run records, one file per chain.
#[derive(Debug, Clone)]
pub struct RunLedger {
    dir: PathBuf,
}

impl RunLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, chain: &str) -> PathBuf {
        self.dir.join(format!("{chain}.json"))
    }

    pub async fn load(&self, chain: &str) -> Result<Option<RunRecord>, LedgerError> {
        let path = self.path(chain);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(chain, "No run record");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let record: RunRecord =
            serde_json::from_str(&contents).map_err(|e| LedgerError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(record))
    }

    /// Write to a temporary file first, then rename over the record.
    pub async fn save(&self, record: &RunRecord) -> Result<(), LedgerError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path(&record.chain);
        let temp = self.dir.join(format!(
            ".{}.{:08x}.tmp",
            record.chain,
            rand::rng().random::<u32>()
        ));

        fs::write(&temp, serde_json::to_vec_pretty(record)?).await?;
        fs::rename(&temp, &path).await?;

        debug!(
            chain = %record.chain,
            run_id = %record.run_id,
            cursor = record.cursor,
            state = ?record.state,
            "Run record saved"
        );
        Ok(())
    }

    /// Forget the chain's run. Returns whether there was one.
    pub async fn clear(&self, chain: &str) -> Result<bool, LedgerError> {
        match fs::remove_file(self.path(chain)).await {
            Ok(()) => {
                info!(chain, "Run record cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn midnight() -> DateTime<Utc> {
        "2024-03-02T00:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let ledger = RunLedger::new(dir.path().join("runs"));
        let now = Utc::now();

        let mut record = RunRecord::scheduled("provisioning", midnight(), now);
        record.cursor = 2;
        record.state = RunState::Waiting { until: now };
        record.record("Create_cluster", StepOutcome::Completed, now);
        ledger.save(&record).await.unwrap();

        let loaded = RunLedger::new(dir.path().join("runs"))
            .load("provisioning")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_missing_record_is_none() {
        let dir = TempDir::new().unwrap();
        let ledger = RunLedger::new(dir.path());
        assert!(ledger.load("short_interests").await.unwrap().is_none());
        assert!(!ledger.clear("short_interests").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("provisioning.json"), "{ not json").unwrap();
        let ledger = RunLedger::new(dir.path());
        assert!(matches!(
            ledger.load("provisioning").await,
            Err(LedgerError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut record = RunRecord::scheduled("provisioning", midnight(), now);
        assert!(record.is_due(now));

        record.state = RunState::Waiting {
            until: now + chrono::Duration::seconds(120),
        };
        assert!(!record.is_due(now));
        assert!(record.is_due(now + chrono::Duration::seconds(120)));

        record.state = RunState::Succeeded;
        assert!(!record.is_due(now));
    }

    #[test]
    fn test_run_ids_name_the_interval() {
        let now: DateTime<Utc> = "2024-03-03T07:30:00Z".parse().unwrap();

        let scheduled = RunRecord::scheduled("prices", midnight(), now);
        assert_eq!(scheduled.run_id, "scheduled__2024-03-02T00:00:00");
        assert_eq!(scheduled.logical_date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(scheduled.created_at, now);

        let manual = RunRecord::manual("prices", now);
        assert_eq!(manual.run_id, "manual__2024-03-03T07:30:00");
        assert_eq!(manual.interval_start, now);
    }

    #[test]
    fn test_state_serialization_is_flat() {
        let now = Utc::now();
        let mut record = RunRecord::manual("prices", now);
        record.state = RunState::Failed {
            task_id: "Pull_prices".to_string(),
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["task_id"], "Pull_prices");
    }
}
