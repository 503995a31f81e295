// Clusterflow Library - ephemeral cluster provisioning and job pipelines
// This exposes the core components for testing and integration

pub mod app;
pub mod barrier;
pub mod blackboard;
pub mod cluster;
pub mod config;
pub mod error;
pub mod providers;
pub mod session;
pub mod shutdown;
pub mod telemetry;
pub mod testing;
pub mod workflow;

// Re-export key types for easy access
pub use app::{build_chains, open_blackboard, App, AppError};
pub use barrier::{Barrier, Poke, Presence};
pub use blackboard::{
    clear_all, Blackboard, BlackboardError, BoardEntry, Entry, FileBlackboard, MemoryBlackboard,
    PipelineFlag, Signal,
};
pub use cluster::{ClusterLifecycle, ClusterPhase, ClusterRecord, TerminateOutcome};
pub use config::{ClusterflowConfig, ConfigError, PipelineConfig};
pub use error::{ErrorKind, FlowError};
pub use providers::{ClusterProvider, ProviderError, RemoteExecutionProvider};
pub use session::{classify_logs, JobSession, JobSpec};
pub use shutdown::{ShutdownCoordinator, ShutdownListener};
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use workflow::{
    job_chain, provisioning_chain, Chain, ChainRunner, Checkpoint, RunLedger, RunRecord, RunState, Scheduler,
    TickOutcome, Trigger,
};
