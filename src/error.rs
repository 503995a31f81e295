use thiserror::Error;

use crate::blackboard::{BlackboardError, Signal};
use crate::providers::ProviderError;

/// How a step failure should be treated by whoever drives the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Preparation or creation failed; the next cycle's reset recovers.
    FatalToCycle,
    /// Cluster gone or upstream failed; the own flag has been raised.
    FailFast,
    /// The job itself failed, by status or by log inspection.
    JobFailure,
    /// A step ran without its precondition being met.
    Programming,
    /// The blackboard or ledger could not be reached.
    Infrastructure,
}

/// Error returned by a failing step.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Pipeline {pipeline} stopped early: {reason}")]
    FailFast { pipeline: Signal, reason: String },

    #[error("Job {task_id} finished with status '{status}'")]
    JobFailed { task_id: String, status: String },

    #[error("Job {task_id} reported a failure in its log: {line}")]
    LogFailure { task_id: String, line: String },

    #[error("Required blackboard key '{signal}' is absent")]
    MissingSignal { signal: Signal },

    #[error("{step} failed on {resource}: {source}")]
    Provider {
        step: String,
        resource: String,
        #[source]
        source: ProviderError,
    },

    #[error("Could not render argument '{argument}' of {task_id}: {source}")]
    Template {
        task_id: String,
        argument: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("Blackboard error: {0}")]
    Blackboard(#[from] BlackboardError),
}

impl FlowError {
    pub fn provider(step: &str, resource: &str, source: ProviderError) -> Self {
        FlowError::Provider {
            step: step.to_string(),
            resource: resource.to_string(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::FailFast { .. } => ErrorKind::FailFast,
            FlowError::JobFailed { .. } | FlowError::LogFailure { .. } => ErrorKind::JobFailure,
            FlowError::MissingSignal { .. } | FlowError::Template { .. } => ErrorKind::Programming,
            FlowError::Provider { .. } => ErrorKind::FatalToCycle,
            FlowError::Blackboard(_) => ErrorKind::Infrastructure,
        }
    }
}
