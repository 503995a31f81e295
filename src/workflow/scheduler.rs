//! Built-in trigger.
//!
//! Each chain has at most one active run. A run that failed blocks the chain
//! until it is cleared (`depends_on_past`). Scheduled runs cover consecutive
//! intervals aligned to the epoch: once a run succeeds, the next one covers
//! the following interval as soon as that interval has started, so intervals
//! missed while nothing was ticking are caught up one run at a time. Waiting
//! runs are advanced again once their `until` has passed.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ledger::{LedgerError, RunLedger, RunRecord, RunState};
use super::runner::ChainRunner;
use super::Chain;
use crate::shutdown::ShutdownListener;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The chain's run was advanced to this state.
    Advanced { run_id: String, state: RunState },
    /// The active run is waiting and not due yet.
    Waiting { run_id: String, until: DateTime<Utc> },
    /// The previous run failed and has not been cleared.
    Blocked { run_id: String },
    /// The previous run succeeded and the next interval has not started.
    NotDue { next_run_at: DateTime<Utc> },
}

/// Start of the interval containing `at`.
pub fn interval_start(at: DateTime<Utc>, interval: chrono::Duration) -> DateTime<Utc> {
    let secs = interval.num_seconds().max(1);
    DateTime::from_timestamp(at.timestamp().div_euclid(secs) * secs, 0).unwrap_or(at)
}

/// How a chain invocation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Honour waiting times and the calendar interval.
    Scheduled,
    /// Invoke now: advance a waiting run early, or start a manual run when
    /// the next interval has not started. A failed run still blocks.
    Manual,
}

pub struct Scheduler {
    ledger: RunLedger,
    runner: ChainRunner,
    interval: chrono::Duration,
}

impl Scheduler {
    pub fn new(ledger: RunLedger, runner: ChainRunner, interval: chrono::Duration) -> Self {
        Self {
            ledger,
            runner,
            interval,
        }
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub async fn tick(&self, chain: &Chain, now: DateTime<Utc>) -> Result<TickOutcome, LedgerError> {
        self.invoke(chain, now, Trigger::Scheduled).await
    }

    pub async fn invoke(
        &self,
        chain: &Chain,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<TickOutcome, LedgerError> {
        let mut run = match self.ledger.load(&chain.name).await? {
            None => RunRecord::scheduled(&chain.name, interval_start(now, self.interval), now),
            Some(run) => match run.state.clone() {
                RunState::Failed { task_id, .. } => {
                    debug!(chain = %chain.name, run_id = %run.run_id, task_id = %task_id, "Chain blocked by failed run");
                    return Ok(TickOutcome::Blocked { run_id: run.run_id });
                }
                RunState::Succeeded => {
                    let next_run_at = interval_start(run.interval_start, self.interval) + self.interval;
                    if now >= next_run_at {
                        RunRecord::scheduled(&chain.name, next_run_at, now)
                    } else if trigger == Trigger::Manual {
                        RunRecord::manual(&chain.name, now)
                    } else {
                        return Ok(TickOutcome::NotDue { next_run_at });
                    }
                }
                RunState::Waiting { until } if trigger == Trigger::Scheduled && !run.is_due(now) => {
                    return Ok(TickOutcome::Waiting {
                        run_id: run.run_id,
                        until,
                    });
                }
                RunState::Queued | RunState::Running | RunState::Waiting { .. } => run,
            },
        };

        if run.attempts == 0 {
            info!(chain = %chain.name, run_id = %run.run_id, logical_date = %run.logical_date, "Starting run");
        }

        let state = self.runner.advance(chain, &mut run, now, &self.ledger).await?;

        Ok(TickOutcome::Advanced {
            run_id: run.run_id,
            state,
        })
    }

    /// Tick every chain until shutdown is requested.
    pub async fn run(&self, chains: &[Chain], every: Duration, mut shutdown: ShutdownListener) {
        info!(chains = chains.len(), every_secs = every.as_secs(), "Scheduler started");
        loop {
            for chain in chains {
                if shutdown.is_shutdown() {
                    break;
                }
                match self.tick(chain, Utc::now()).await {
                    Ok(outcome) => debug!(chain = %chain.name, outcome = ?outcome, "Tick"),
                    Err(e) => warn!(chain = %chain.name, error = %e, "Tick failed"),
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(every) => {}
            }
        }
        info!("Scheduler stopped");
    }
}
