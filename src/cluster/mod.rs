//! Lifecycle of the shared ephemeral cluster.
//!
//! `Absent -> Preparing -> Created -> Terminating -> Absent`. The phase is
//! never stored; it is derived from the four [`Signal::CLUSTER_RECORD`] keys
//! on the blackboard, which are set together by [`ClusterLifecycle::prepare`]
//! and [`ClusterLifecycle::create`] and cleared together by
//! [`ClusterLifecycle::cleanup`].

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::blackboard::{clear_all, Blackboard, Signal};
use crate::config::{AwsConfig, TeardownConfig};
use crate::error::FlowError;
use crate::providers::{ClusterProvider, ClusterRequest};

/// Blackboard view of one cluster instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterRecord {
    pub cluster_id: Option<String>,
    pub master_sg_id: Option<String>,
    pub slave_sg_id: Option<String>,
    pub keypair_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPhase {
    Absent,
    Preparing,
    Created,
}

impl ClusterRecord {
    pub async fn observe<B: Blackboard + ?Sized>(board: &B) -> Result<Self, FlowError> {
        Ok(Self {
            cluster_id: board.get(Signal::ClusterId).await?.into_option(),
            master_sg_id: board.get(Signal::MasterSgId).await?.into_option(),
            slave_sg_id: board.get(Signal::SlaveSgId).await?.into_option(),
            keypair_name: board.get(Signal::KeypairName).await?.into_option(),
        })
    }

    pub fn phase(&self) -> ClusterPhase {
        if self.cluster_id.is_some() {
            ClusterPhase::Created
        } else if self.master_sg_id.is_some()
            || self.slave_sg_id.is_some()
            || self.keypair_name.is_some()
        {
            ClusterPhase::Preparing
        } else {
            ClusterPhase::Absent
        }
    }

    /// Whether all four keys are set.
    pub fn is_complete(&self) -> bool {
        self.cluster_id.is_some()
            && self.master_sg_id.is_some()
            && self.slave_sg_id.is_some()
            && self.keypair_name.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateOutcome {
    Deleted(String),
    /// `combine_dag_state` is absent; the downstream work has not finished.
    Skipped,
}

#[derive(Debug, Clone)]
struct Placement {
    network_id: String,
    subnet_id: String,
}

pub struct ClusterLifecycle {
    provider: Arc<dyn ClusterProvider>,
    board: Arc<dyn Blackboard>,
    settings: AwsConfig,
    teardown: TeardownConfig,
    placement: OnceCell<Placement>,
}

impl ClusterLifecycle {
    pub fn new(
        provider: Arc<dyn ClusterProvider>,
        board: Arc<dyn Blackboard>,
        settings: AwsConfig,
        teardown: TeardownConfig,
    ) -> Self {
        Self {
            provider,
            board,
            settings,
            teardown,
            placement: OnceCell::new(),
        }
    }

    pub fn master_group_name(&self) -> String {
        format!("{}SG", self.settings.cluster_name)
    }

    pub fn slave_group_name(&self) -> String {
        format!("{}SlaveSG", self.settings.cluster_name)
    }

    pub fn key_pair_name(&self) -> String {
        format!("{}_pem", self.settings.cluster_name)
    }

    /// Network and subnet, from configuration or else the provider's first
    /// available ones. Resolved once per lifecycle.
    async fn placement(&self) -> Result<&Placement, FlowError> {
        self.placement
            .get_or_try_init(|| async {
                let network_id = match &self.settings.vpc_id {
                    Some(id) => id.clone(),
                    None => self
                        .provider
                        .get_first_available_network()
                        .await
                        .map_err(|e| FlowError::provider("Placement", "network", e))?,
                };
                let subnet_id = match &self.settings.subnet_id {
                    Some(id) => id.clone(),
                    None => self
                        .provider
                        .get_first_available_subnet(&network_id)
                        .await
                        .map_err(|e| FlowError::provider("Placement", &network_id, e))?,
                };
                info!(network_id = %network_id, subnet_id = %subnet_id, "Resolved cluster placement");
                Ok::<_, FlowError>(Placement {
                    network_id,
                    subnet_id,
                })
            })
            .await
    }

    /// Clear every blackboard key, then create both security groups and the
    /// key pair and publish their identifiers. Safe to call repeatedly.
    pub async fn prepare(&self) -> Result<ClusterRecord, FlowError> {
        clear_all(self.board.as_ref()).await?;
        info!("Cleared blackboard for a fresh provisioning cycle");

        let network_id = self.placement().await?.network_id.clone();
        let name = &self.settings.cluster_name;

        let master_name = self.master_group_name();
        let master_sg_id = self
            .provider
            .create_security_group(&master_name, &format!("Master SG for {name}"), &network_id)
            .await
            .map_err(|e| FlowError::provider("Preparation", &master_name, e))?;

        let slave_name = self.slave_group_name();
        let slave_sg_id = self
            .provider
            .create_security_group(&slave_name, &format!("Slave SG for {name}"), &network_id)
            .await
            .map_err(|e| FlowError::provider("Preparation", &slave_name, e))?;

        self.board.set(Signal::MasterSgId, &master_sg_id).await?;
        self.board.set(Signal::SlaveSgId, &slave_sg_id).await?;

        let key_name = self.key_pair_name();
        let key_pair = self
            .provider
            .recreate_key_pair(&key_name)
            .await
            .map_err(|e| FlowError::provider("Preparation", &key_name, e))?;
        self.board.set(Signal::KeypairName, &key_pair.name).await?;

        self.provider
            .recreate_default_roles()
            .await
            .map_err(|e| FlowError::provider("Preparation", "default roles", e))?;

        info!(
            master_sg_id = %master_sg_id,
            slave_sg_id = %slave_sg_id,
            keypair_name = %key_pair.name,
            "Cluster prerequisites ready"
        );
        ClusterRecord::observe(self.board.as_ref()).await
    }

    /// Request the cluster and publish `cluster_id`.
    pub async fn create(&self) -> Result<String, FlowError> {
        let master_sg_id = self.required(Signal::MasterSgId).await?;
        let slave_sg_id = self.required(Signal::SlaveSgId).await?;
        let key_name = self.required(Signal::KeypairName).await?;
        let subnet_id = self.placement().await?.subnet_id.clone();

        let request = ClusterRequest {
            name: self.settings.cluster_name.clone(),
            master_sg_id,
            slave_sg_id,
            key_name,
            subnet_id,
        };
        let cluster_id = self
            .provider
            .create_cluster(&request)
            .await
            .map_err(|e| FlowError::provider("Create_cluster", &request.name, e))?;

        self.board.set(Signal::ClusterId, &cluster_id).await?;
        info!(cluster_id = %cluster_id, "Cluster created");
        Ok(cluster_id)
    }

    /// Delete the cluster once `combine_dag_state` is present. Otherwise a
    /// no-op; the caller re-invokes later.
    pub async fn terminate(&self) -> Result<TerminateOutcome, FlowError> {
        if !self.board.get(Signal::CombineDagState).await?.is_present() {
            info!("combine_dag_state absent, leaving cluster running");
            return Ok(TerminateOutcome::Skipped);
        }

        let cluster_id = self.required(Signal::ClusterId).await?;
        self.provider
            .delete_cluster(&cluster_id)
            .await
            .map_err(|e| FlowError::provider("Terminate_cluster", &cluster_id, e))?;

        info!(cluster_id = %cluster_id, "Cluster termination requested");
        Ok(TerminateOutcome::Deleted(cluster_id))
    }

    /// Delete the key pair and both security groups, then clear every key.
    pub async fn cleanup(&self) -> Result<(), FlowError> {
        let record = ClusterRecord::observe(self.board.as_ref()).await?;

        match &record.keypair_name {
            Some(name) => self
                .provider
                .delete_key_pair(name)
                .await
                .map_err(|e| FlowError::provider("Cleanup", name, e))?,
            None => warn!("keypair_name absent, nothing to delete"),
        }

        match &record.master_sg_id {
            Some(id) => self
                .provider
                .delete_security_group(id)
                .await
                .map_err(|e| FlowError::provider("Cleanup", id, e))?,
            None => warn!("master_sg_id absent, nothing to delete"),
        }

        if let Some(id) = &record.slave_sg_id {
            // The slave group is referenced by the master group's rules and
            // the provider needs time to drop that reference.
            tokio::time::sleep(self.teardown.group_deletion_delay()).await;
            self.provider
                .delete_security_group(id)
                .await
                .map_err(|e| FlowError::provider("Cleanup", id, e))?;
        } else {
            warn!("slave_sg_id absent, nothing to delete");
        }

        clear_all(self.board.as_ref()).await?;
        info!("Cluster resources cleaned up");
        Ok(())
    }

    async fn required(&self, signal: Signal) -> Result<String, FlowError> {
        self.board
            .get(signal)
            .await?
            .into_option()
            .ok_or(FlowError::MissingSignal { signal })
    }
}
