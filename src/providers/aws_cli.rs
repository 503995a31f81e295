//! [`ClusterProvider`] backed by the `aws` command line tool.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ClusterProvider, ClusterRequest, CommandExecutor, KeyPair, ProviderError};
use crate::config::AwsConfig;

const TERMINATED_STATES: [&str; 3] = ["TERMINATING", "TERMINATED", "TERMINATED_WITH_ERRORS"];

pub struct AwsCliClusterProvider {
    executor: Arc<dyn CommandExecutor>,
    settings: AwsConfig,
}

impl AwsCliClusterProvider {
    pub fn new(executor: Arc<dyn CommandExecutor>, settings: AwsConfig) -> Self {
        Self { executor, settings }
    }

    /// Run `aws <service> <args..>` with region and JSON output, parsing stdout.
    async fn aws(&self, service: &str, args: &[String]) -> Result<Value, ProviderError> {
        let mut full_args = Vec::with_capacity(args.len() + 5);
        full_args.push(service.to_string());
        full_args.extend(args.iter().cloned());
        full_args.extend([
            "--region".to_string(),
            self.settings.region.clone(),
            "--output".to_string(),
            "json".to_string(),
        ]);

        let command = format!("aws {service} {}", args.first().map(String::as_str).unwrap_or(""));
        debug!(command = %command, "Invoking AWS CLI");

        let output = self
            .executor
            .execute(&self.settings.cli_path, &full_args)
            .await?;

        if !output.success() {
            return Err(ProviderError::CommandFailed {
                command,
                status: output.status_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        if output.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&output.stdout).map_err(|e| ProviderError::InvalidResponse {
            endpoint: command,
            message: e.to_string(),
        })
    }

    async fn find_security_group(
        &self,
        name: &str,
        network_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        let response = self
            .aws(
                "ec2",
                &args([
                    "describe-security-groups",
                    "--filters",
                    format!("Name=group-name,Values={name}").as_str(),
                    format!("Name=vpc-id,Values={network_id}").as_str(),
                ]),
            )
            .await?;

        Ok(response
            .pointer("/SecurityGroups/0/GroupId")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn describe_cluster(&self, cluster_id: &str) -> Result<Value, ProviderError> {
        self.aws(
            "emr",
            &args(["describe-cluster", "--cluster-id", cluster_id]),
        )
        .await
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn pluck(value: &Value, pointer: &str, endpoint: &str) -> Result<String, ProviderError> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::InvalidResponse {
            endpoint: endpoint.to_string(),
            message: format!("missing {pointer}"),
        })
}

#[async_trait]
impl ClusterProvider for AwsCliClusterProvider {
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        network_id: &str,
    ) -> Result<String, ProviderError> {
        if let Some(existing) = self.find_security_group(name, network_id).await? {
            info!(group = %name, group_id = %existing, "Reusing existing security group");
            return Ok(existing);
        }

        let response = self
            .aws(
                "ec2",
                &args([
                    "create-security-group",
                    "--group-name",
                    name,
                    "--description",
                    description,
                    "--vpc-id",
                    network_id,
                ]),
            )
            .await?;
        let group_id = pluck(&response, "/GroupId", "ec2 create-security-group")?;
        info!(group = %name, group_id = %group_id, "Created security group");
        Ok(group_id)
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), ProviderError> {
        self.aws("ec2", &args(["delete-security-group", "--group-id", group_id]))
            .await?;
        Ok(())
    }

    async fn recreate_key_pair(&self, name: &str) -> Result<KeyPair, ProviderError> {
        self.delete_key_pair(name).await?;
        let response = self
            .aws("ec2", &args(["create-key-pair", "--key-name", name]))
            .await?;

        Ok(KeyPair {
            name: pluck(&response, "/KeyName", "ec2 create-key-pair")?,
            material: response
                .pointer("/KeyMaterial")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn delete_key_pair(&self, name: &str) -> Result<(), ProviderError> {
        self.aws("ec2", &args(["delete-key-pair", "--key-name", name]))
            .await?;
        Ok(())
    }

    async fn recreate_default_roles(&self) -> Result<(), ProviderError> {
        self.aws("emr", &args(["create-default-roles"])).await?;
        Ok(())
    }

    async fn create_cluster(&self, request: &ClusterRequest) -> Result<String, ProviderError> {
        let ec2_attributes = format!(
            "KeyName={},SubnetId={},EmrManagedMasterSecurityGroup={},EmrManagedSlaveSecurityGroup={}",
            request.key_name, request.subnet_id, request.master_sg_id, request.slave_sg_id
        );
        let instance_count = self.settings.instance_count.to_string();

        let response = self
            .aws(
                "emr",
                &args([
                    "create-cluster",
                    "--name",
                    request.name.as_str(),
                    "--release-label",
                    self.settings.release_label.as_str(),
                    "--applications",
                    "Name=Spark",
                    "Name=Livy",
                    "--instance-type",
                    self.settings.instance_type.as_str(),
                    "--instance-count",
                    instance_count.as_str(),
                    "--use-default-roles",
                    "--ec2-attributes",
                    ec2_attributes.as_str(),
                ]),
            )
            .await?;

        pluck(&response, "/ClusterId", "emr create-cluster")
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<(), ProviderError> {
        self.aws(
            "emr",
            &args(["terminate-clusters", "--cluster-ids", cluster_id]),
        )
        .await?;
        Ok(())
    }

    async fn is_cluster_terminated(&self, cluster_id: &str) -> Result<bool, ProviderError> {
        let response = self.describe_cluster(cluster_id).await?;
        let state = pluck(&response, "/Cluster/Status/State", "emr describe-cluster")?;
        Ok(TERMINATED_STATES.contains(&state.as_str()))
    }

    async fn get_cluster_address(&self, cluster_id: &str) -> Result<String, ProviderError> {
        let response = self.describe_cluster(cluster_id).await?;
        response
            .pointer("/Cluster/MasterPublicDnsName")
            .and_then(Value::as_str)
            .filter(|dns| !dns.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::NotFound(format!("master address of {cluster_id}")))
    }

    async fn get_first_available_network(&self) -> Result<String, ProviderError> {
        let response = self.aws("ec2", &args(["describe-vpcs"])).await?;
        response
            .pointer("/Vpcs/0/VpcId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::NotFound("any VPC".to_string()))
    }

    async fn get_first_available_subnet(&self, network_id: &str) -> Result<String, ProviderError> {
        let response = self
            .aws(
                "ec2",
                &args([
                    "describe-subnets",
                    "--filters",
                    format!("Name=vpc-id,Values={network_id}").as_str(),
                ]),
            )
            .await?;
        response
            .pointer("/Subnets/0/SubnetId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::NotFound(format!("subnet in {network_id}")))
    }
}
