//! Running one unit of work on the cluster.
//!
//! A [`JobSession`] checks that the cluster is alive and that no upstream
//! pipeline has failed, then creates a remote session, waits for it, submits
//! the job, tracks it to a terminal status and kills the session. The session
//! is killed on every path once it has been created. The outcome is decided
//! by the [`machine::JobMachine`]: a successful status can still be turned
//! into a failure by a `(FAIL)` line in the job's log.

pub mod machine;

use serde::{Deserialize, Serialize};
use statig::prelude::*;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::blackboard::{Blackboard, PipelineFlag, Signal};
use crate::error::FlowError;
use crate::providers::{
    ClusterProvider, JobPayload, ProviderError, RemoteExecutionProvider, SessionHandle, TrackedJob,
};
use machine::{JobEvent, JobFailure, JobMachine};

/// Marker a job prints to report a failed check.
pub const FAIL_MARKER: &str = "(FAIL)";

/// Lines of a job log that report a failure.
pub fn classify_logs(lines: &[String]) -> Vec<&str> {
    lines
        .iter()
        .filter(|line| line.contains(FAIL_MARKER))
        .map(String::as_str)
        .collect()
}

/// What runs after a job succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionAction {
    Raise { signal: Signal, flag: PipelineFlag },
}

/// One job step of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub task_id: String,
    /// Signal owned by the pipeline this job belongs to
    pub pipeline: Signal,
    /// Pipelines whose failure stops this job before it starts
    pub upstream: Vec<Signal>,
    /// Argument values are templates until rendered for a run
    pub payload: JobPayload,
    pub on_complete: Option<CompletionAction>,
}

pub struct JobSession {
    cluster: Arc<dyn ClusterProvider>,
    remote: Arc<dyn RemoteExecutionProvider>,
    board: Arc<dyn Blackboard>,
}

impl JobSession {
    pub fn new(
        cluster: Arc<dyn ClusterProvider>,
        remote: Arc<dyn RemoteExecutionProvider>,
        board: Arc<dyn Blackboard>,
    ) -> Self {
        Self {
            cluster,
            remote,
            board,
        }
    }

    /// Run `job` with an already rendered payload. Any failure after the
    /// precheck also raises the pipeline's FAILED flag.
    pub async fn run(&self, job: &JobSpec, payload: &JobPayload) -> Result<TrackedJob, FlowError> {
        let cluster_id = self.precheck(job).await?;

        let tracked = match self.attempt(job, payload, &cluster_id).await {
            Ok(tracked) => tracked,
            Err(e) => {
                self.board.raise(job.pipeline, PipelineFlag::Failed).await?;
                error!(task_id = %job.task_id, pipeline = %job.pipeline, error = %e, "Raised FAILED");
                return Err(e);
            }
        };

        if let Some(CompletionAction::Raise { signal, flag }) = &job.on_complete {
            self.board.raise(*signal, *flag).await?;
            info!(task_id = %job.task_id, signal = %signal, flag = %flag, "Published completion");
        }

        info!(task_id = %job.task_id, status = %tracked.status, "Job succeeded");
        Ok(tracked)
    }

    async fn attempt(
        &self,
        job: &JobSpec,
        payload: &JobPayload,
        cluster_id: &str,
    ) -> Result<TrackedJob, FlowError> {
        let address = self
            .cluster
            .get_cluster_address(cluster_id)
            .await
            .map_err(|e| FlowError::provider(&job.task_id, cluster_id, e))?;

        match self.remote.kill_all_inactive_sessions(&address).await {
            Ok(0) => {}
            Ok(killed) => info!(killed, "Reclaimed stale sessions"),
            Err(e) => warn!(address = %address, error = %e, "Could not reclaim stale sessions"),
        }

        let session = self
            .remote
            .create_session(&address)
            .await
            .map_err(|e| FlowError::provider(&job.task_id, &address, e))?;

        let mut sm = JobMachine::new(&job.task_id).state_machine();
        let result = self.execute(&address, &session, payload, &mut sm).await;
        self.release(&address, &session).await;

        let tracked =
            result.map_err(|e| FlowError::provider(&job.task_id, &format!("session {}", session.id), e))?;

        for line in &tracked.log_lines {
            info!(task_id = %job.task_id, "{line}");
        }
        for line in classify_logs(&tracked.log_lines) {
            error!(task_id = %job.task_id, "{line}");
            sm.handle(&JobEvent::LogFailure {
                line: line.to_string(),
            });
        }

        match sm.inner().failure().cloned() {
            None => Ok(tracked),
            Some(JobFailure::Status(status)) => Err(FlowError::JobFailed {
                task_id: job.task_id.clone(),
                status,
            }),
            Some(JobFailure::Log(line)) => Err(FlowError::LogFailure {
                task_id: job.task_id.clone(),
                line,
            }),
        }
    }

    /// Fail fast when the cluster is gone or an upstream pipeline failed,
    /// raising this pipeline's FAILED flag. Returns the live cluster id.
    async fn precheck(&self, job: &JobSpec) -> Result<String, FlowError> {
        let cluster_id = match self.board.get(Signal::ClusterId).await?.into_option() {
            Some(id) => id,
            None => return self.fail_fast(job, "cluster_id is absent".to_string()).await,
        };

        let terminated = self
            .cluster
            .is_cluster_terminated(&cluster_id)
            .await
            .map_err(|e| FlowError::provider(&job.task_id, &cluster_id, e))?;
        if terminated {
            return self
                .fail_fast(job, format!("cluster {cluster_id} has been terminated"))
                .await;
        }

        for upstream in &job.upstream {
            if self.board.flag(*upstream).await? == Some(PipelineFlag::Failed) {
                return self
                    .fail_fast(job, format!("upstream {upstream} is FAILED"))
                    .await;
            }
        }

        Ok(cluster_id)
    }

    async fn fail_fast<T>(&self, job: &JobSpec, reason: String) -> Result<T, FlowError> {
        self.board.raise(job.pipeline, PipelineFlag::Failed).await?;
        error!(task_id = %job.task_id, pipeline = %job.pipeline, reason = %reason, "Failing fast");
        Err(FlowError::FailFast {
            pipeline: job.pipeline,
            reason,
        })
    }

    async fn execute(
        &self,
        address: &str,
        session: &SessionHandle,
        payload: &JobPayload,
        sm: &mut StateMachine<JobMachine>,
    ) -> Result<TrackedJob, ProviderError> {
        self.remote.await_ready(address, session).await?;
        let job = self.remote.submit_job(address, session, payload).await?;
        sm.handle(&JobEvent::Started {
            statement_id: job.statement_id,
        });

        let tracked = self.remote.track_job(address, &job).await?;
        sm.handle(&JobEvent::Finished {
            status: tracked.status.clone(),
        });
        Ok(tracked)
    }

    async fn release(&self, address: &str, session: &SessionHandle) {
        if let Err(e) = self.remote.kill_session(address, session).await {
            warn!(session_id = session.id, error = %e, "Could not kill session");
        }
    }
}
