//! External capabilities the coordination core drives.
//!
//! [`ClusterProvider`] creates and destroys the cluster and its security
//! boundaries; [`RemoteExecutionProvider`] runs work inside sessions on a
//! live cluster. Both are traits so the core can be exercised against the
//! in-process fakes in [`crate::testing`].

pub mod aws_cli;
pub mod command;
pub mod livy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub use aws_cli::AwsCliClusterProvider;
pub use command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};
pub use livy::LivyClient;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("Session {session_id} entered state '{state}' before accepting work")]
    SessionUnusable { session_id: u64, state: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Access credential created alongside the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub name: String,
    /// Private key material, only returned at creation time.
    #[serde(skip_serializing)]
    pub material: Option<String>,
}

/// Everything needed to request one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRequest {
    pub name: String,
    pub master_sg_id: String,
    pub slave_sg_id: String,
    pub key_name: String,
    pub subnet_id: String,
}

/// Remote execution context on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: u64,
}

/// One submitted unit of work inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub session_id: u64,
    pub statement_id: u64,
}

/// What gets submitted: the job script, shared libraries prepended to it,
/// and the rendered argument map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub script: PathBuf,
    pub libraries: Vec<PathBuf>,
    pub args: BTreeMap<String, String>,
}

/// Terminal observation of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedJob {
    pub status: String,
    pub log_lines: Vec<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        network_id: &str,
    ) -> Result<String, ProviderError>;

    async fn delete_security_group(&self, group_id: &str) -> Result<(), ProviderError>;

    /// Delete any key pair with this name, then create a fresh one.
    async fn recreate_key_pair(&self, name: &str) -> Result<KeyPair, ProviderError>;

    async fn delete_key_pair(&self, name: &str) -> Result<(), ProviderError>;

    async fn recreate_default_roles(&self) -> Result<(), ProviderError>;

    async fn create_cluster(&self, request: &ClusterRequest) -> Result<String, ProviderError>;

    async fn delete_cluster(&self, cluster_id: &str) -> Result<(), ProviderError>;

    async fn is_cluster_terminated(&self, cluster_id: &str) -> Result<bool, ProviderError>;

    async fn get_cluster_address(&self, cluster_id: &str) -> Result<String, ProviderError>;

    async fn get_first_available_network(&self) -> Result<String, ProviderError>;

    async fn get_first_available_subnet(&self, network_id: &str) -> Result<String, ProviderError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutionProvider: Send + Sync {
    /// Kill sessions that can no longer run work. Returns how many were killed.
    async fn kill_all_inactive_sessions(&self, address: &str) -> Result<usize, ProviderError>;

    async fn create_session(&self, address: &str) -> Result<SessionHandle, ProviderError>;

    /// Suspend until the session accepts work.
    async fn await_ready(&self, address: &str, session: &SessionHandle) -> Result<(), ProviderError>;

    async fn submit_job(
        &self,
        address: &str,
        session: &SessionHandle,
        payload: &JobPayload,
    ) -> Result<JobHandle, ProviderError>;

    /// Suspend until the job reaches a terminal status.
    async fn track_job(&self, address: &str, job: &JobHandle) -> Result<TrackedJob, ProviderError>;

    async fn kill_session(&self, address: &str, session: &SessionHandle) -> Result<(), ProviderError>;
}
