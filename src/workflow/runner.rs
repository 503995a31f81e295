use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

use super::ledger::{Checkpoint, LedgerError, RunRecord, RunState, StepOutcome};
use super::{Chain, RunContext, Step, StepKind};
use crate::barrier::Poke;
use crate::blackboard::Blackboard;
use crate::cluster::{ClusterLifecycle, TerminateOutcome};
use crate::error::FlowError;
use crate::session::JobSession;
use crate::telemetry::{chain_span, generate_correlation_id, step_span};

enum StepResult {
    Done,
    Skipped,
    Wait(Duration),
}

/// Executes chain steps on behalf of one trigger invocation.
pub struct ChainRunner {
    board: Arc<dyn Blackboard>,
    lifecycle: ClusterLifecycle,
    sessions: JobSession,
}

impl ChainRunner {
    pub fn new(board: Arc<dyn Blackboard>, lifecycle: ClusterLifecycle, sessions: JobSession) -> Self {
        Self {
            board,
            lifecycle,
            sessions,
        }
    }

    /// Execute steps from the run's cursor until one reschedules, one fails,
    /// or the chain ends. The run is checkpointed after every step outcome;
    /// a failed checkpoint stops the chain before the next step starts.
    /// Terminal runs are left untouched.
    pub async fn advance(
        &self,
        chain: &Chain,
        run: &mut RunRecord,
        now: DateTime<Utc>,
        store: &dyn Checkpoint,
    ) -> Result<RunState, LedgerError> {
        if run.state.is_terminal() {
            return Ok(run.state.clone());
        }

        let correlation_id = generate_correlation_id();
        let span = chain_span(&chain.name, &run.run_id, &correlation_id);

        async {
            run.attempts += 1;
            run.state = RunState::Running;
            info!(cursor = run.cursor, attempt = run.attempts, "Advancing chain");

            while let Some(step) = chain.steps.get(run.cursor) {
                let result = self
                    .run_step(step, run)
                    .instrument(step_span(&step.task_id))
                    .await;

                match result {
                    Ok(StepResult::Done) => {
                        run.record(&step.task_id, StepOutcome::Completed, now);
                        run.cursor += 1;
                    }
                    Ok(StepResult::Skipped) => {
                        run.record(&step.task_id, StepOutcome::Skipped, now);
                        run.cursor += 1;
                    }
                    Ok(StepResult::Wait(retry_after)) => {
                        let until = now
                            + chrono::Duration::from_std(retry_after)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60));
                        run.record(&step.task_id, StepOutcome::Rescheduled, now);
                        run.state = RunState::Waiting { until };
                        info!(task_id = %step.task_id, until = %until, "Step rescheduled");
                    }
                    Err(e) => {
                        error!(task_id = %step.task_id, kind = ?e.kind(), error = %e, "Step failed");
                        run.record(
                            &step.task_id,
                            StepOutcome::Failed {
                                error: e.to_string(),
                            },
                            now,
                        );
                        run.state = RunState::Failed {
                            task_id: step.task_id.clone(),
                            error: e.to_string(),
                        };
                    }
                }

                if let Err(e) = store.checkpoint(run).await {
                    error!(task_id = %step.task_id, cursor = run.cursor, error = %e, "Could not checkpoint run");
                    return Err(e);
                }
                if run.state != RunState::Running {
                    return Ok(run.state.clone());
                }
            }

            info!("Chain finished");
            run.state = RunState::Succeeded;
            store.checkpoint(run).await?;
            Ok(run.state.clone())
        }
        .instrument(span)
        .await
    }

    async fn run_step(&self, step: &Step, run: &RunRecord) -> Result<StepResult, FlowError> {
        match &step.kind {
            StepKind::Prepare => {
                self.lifecycle.prepare().await?;
                Ok(StepResult::Done)
            }
            StepKind::Create => {
                self.lifecycle.create().await?;
                Ok(StepResult::Done)
            }
            StepKind::Await(barrier) => match barrier.poke(self.board.as_ref()).await? {
                Poke::Ready => {
                    info!(barrier = %barrier, "Barrier released");
                    Ok(StepResult::Done)
                }
                Poke::NotYet { retry_after } => Ok(StepResult::Wait(retry_after)),
            },
            StepKind::Terminate => match self.lifecycle.terminate().await? {
                TerminateOutcome::Deleted(_) => Ok(StepResult::Done),
                TerminateOutcome::Skipped => {
                    warn!("Termination skipped");
                    Ok(StepResult::Skipped)
                }
            },
            StepKind::Cleanup => {
                self.lifecycle.cleanup().await?;
                Ok(StepResult::Done)
            }
            StepKind::Job(job) => {
                let context = RunContext {
                    run_id: run.run_id.clone(),
                    logical_date: run.logical_date,
                };
                let payload = context.render(job)?;
                self.sessions.run(job, &payload).await?;
                Ok(StepResult::Done)
            }
        }
    }
}
