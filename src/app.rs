//! Wiring from configuration to a runnable scheduler.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::blackboard::{Blackboard, BlackboardError, FileBlackboard};
use crate::cluster::ClusterLifecycle;
use crate::config::{BlackboardBackend, BlackboardConfig, ClusterflowConfig};
use crate::providers::{
    AwsCliClusterProvider, ClusterProvider, LivyClient, ProcessCommandExecutor, ProviderError,
    RemoteExecutionProvider,
};
use crate::session::JobSession;
use crate::workflow::{job_chain, provisioning_chain, Chain, ChainRunner, RunLedger, Scheduler};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Blackboard error: {0}")]
    Blackboard(#[from] BlackboardError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Blackboard backend '{backend}' requires the '{feature}' feature")]
    FeatureDisabled { backend: String, feature: String },
}

/// Open the configured blackboard backend.
pub async fn open_blackboard(settings: &BlackboardConfig) -> Result<Arc<dyn Blackboard>, AppError> {
    if let Some(parent) = settings.path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BlackboardError::from)?;
        }
    }

    match settings.backend {
        BlackboardBackend::File => {
            info!(path = %settings.path.display(), "Using file blackboard");
            Ok(Arc::new(FileBlackboard::new(&settings.path)))
        }
        #[cfg(feature = "database")]
        BlackboardBackend::Sqlite => {
            let url = format!("sqlite://{}", settings.path.display());
            info!(url = %url, "Using SQLite blackboard");
            Ok(Arc::new(
                crate::blackboard::SqliteBlackboard::connect(&url).await?,
            ))
        }
        #[cfg(not(feature = "database"))]
        BlackboardBackend::Sqlite => Err(AppError::FeatureDisabled {
            backend: "sqlite".to_string(),
            feature: "database".to_string(),
        }),
    }
}

/// Every chain the configuration defines: provisioning first, then one per
/// pipeline in configuration order.
pub fn build_chains(config: &ClusterflowConfig) -> Vec<Chain> {
    let poke = config.scheduler.poke_interval();
    std::iter::once(provisioning_chain(poke))
        .chain(config.pipelines.iter().map(|p| job_chain(p, poke)))
        .collect()
}

pub struct App {
    config: ClusterflowConfig,
    board: Arc<dyn Blackboard>,
    scheduler: Scheduler,
    chains: Vec<Chain>,
}

impl App {
    /// Build against the real `aws` CLI and Livy endpoints.
    pub async fn from_config(config: ClusterflowConfig) -> Result<Self, AppError> {
        let board = open_blackboard(&config.blackboard).await?;
        let cluster = Arc::new(AwsCliClusterProvider::new(
            Arc::new(ProcessCommandExecutor),
            config.aws.clone(),
        ));
        let remote = Arc::new(LivyClient::new(config.livy.clone())?);
        Ok(Self::with_providers(config, board, cluster, remote))
    }

    pub fn with_providers(
        config: ClusterflowConfig,
        board: Arc<dyn Blackboard>,
        cluster: Arc<dyn ClusterProvider>,
        remote: Arc<dyn RemoteExecutionProvider>,
    ) -> Self {
        let lifecycle = ClusterLifecycle::new(
            cluster.clone(),
            board.clone(),
            config.aws.clone(),
            config.teardown.clone(),
        );
        let sessions = JobSession::new(cluster, remote, board.clone());
        let runner = ChainRunner::new(board.clone(), lifecycle, sessions);
        let scheduler = Scheduler::new(
            RunLedger::new(&config.scheduler.ledger_dir),
            runner,
            config.scheduler.schedule_interval(),
        );
        let chains = build_chains(&config);

        Self {
            config,
            board,
            scheduler,
            chains,
        }
    }

    pub fn config(&self) -> &ClusterflowConfig {
        &self.config
    }

    pub fn board(&self) -> &Arc<dyn Blackboard> {
        &self.board
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }
}
