use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::blackboard::Signal;

const DEFAULT_CONFIG_FILE: &str = "clusterflow.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to read .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Invalid pipeline '{pipeline}': {reason}")]
    InvalidPipeline { pipeline: String, reason: String },
}

/// Main configuration structure for clusterflow
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterflowConfig {
    /// Cloud provider settings for the ephemeral cluster
    pub aws: AwsConfig,
    /// Where the shared blackboard lives
    pub blackboard: BlackboardConfig,
    /// Built-in trigger settings
    pub scheduler: SchedulerConfig,
    pub teardown: TeardownConfig,
    /// Remote execution endpoint on the cluster
    pub livy: LivyConfig,
    pub observability: ObservabilityConfig,
    /// Job pipelines, each run as its own chain
    pub pipelines: Vec<PipelineConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    /// Base name for the cluster and its security groups and key pair
    pub cluster_name: String,
    /// Network to place the cluster in; the first available one when unset
    pub vpc_id: Option<String>,
    /// Subnet to place the cluster in; the first available one when unset
    pub subnet_id: Option<String>,
    pub release_label: String,
    pub instance_type: String,
    pub instance_count: u32,
    /// Path to the `aws` binary
    pub cli_path: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            cluster_name: "clusterflow".to_string(),
            vpc_id: None,
            subnet_id: None,
            release_label: "emr-5.28.0".to_string(),
            instance_type: "m5.xlarge".to_string(),
            instance_count: 3,
            cli_path: "aws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlackboardBackend {
    File,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BlackboardConfig {
    pub backend: BlackboardBackend,
    /// JSON document for `file`, database file for `sqlite`
    pub path: PathBuf,
}

impl Default for BlackboardConfig {
    fn default() -> Self {
        Self {
            backend: BlackboardBackend::File,
            path: PathBuf::from(".clusterflow/blackboard.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long a barrier waits between pokes
    pub poke_interval_seconds: u64,
    /// Calendar interval between scheduled runs of each chain
    pub schedule_interval_seconds: u64,
    /// How often the daemon loop ticks
    pub tick_seconds: u64,
    /// Directory holding one run record per chain
    pub ledger_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poke_interval_seconds: 120,
            schedule_interval_seconds: 86_400,
            tick_seconds: 30,
            ledger_dir: PathBuf::from(".clusterflow/runs"),
        }
    }
}

impl SchedulerConfig {
    pub fn poke_interval(&self) -> Duration {
        Duration::from_secs(self.poke_interval_seconds)
    }

    pub fn schedule_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.schedule_interval_seconds as i64)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// Wait between deleting the master and the slave security group. The
    /// provider rejects deleting a group in the same instant as the group
    /// that references it.
    pub group_deletion_delay_ms: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            group_deletion_delay_ms: 2_000,
        }
    }
}

impl TeardownConfig {
    pub fn group_deletion_delay(&self) -> Duration {
        Duration::from_millis(self.group_deletion_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LivyConfig {
    pub port: u16,
    pub session_kind: String,
    pub ready_poll_interval_ms: u64,
    pub track_poll_interval_ms: u64,
    pub request_timeout_seconds: u64,
    /// Maximum session log lines fetched after a job finishes
    pub log_lines: u32,
}

impl Default for LivyConfig {
    fn default() -> Self {
        Self {
            port: 8998,
            session_kind: "pyspark".to_string(),
            ready_poll_interval_ms: 5_000,
            track_poll_interval_ms: 10_000,
            request_timeout_seconds: 30,
            log_lines: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level, overridden by RUST_LOG
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// One job pipeline: a chain of job steps publishing a terminal flag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub name: String,
    /// Signal this pipeline owns
    pub flag: Signal,
    /// Pipeline signals whose FAILED value stops this pipeline
    #[serde(default)]
    pub upstream: Vec<Signal>,
    /// Pipeline signals that must be published before the first job starts.
    /// Each one also stops this pipeline when it is FAILED.
    #[serde(default)]
    pub requires: Vec<Signal>,
    pub steps: Vec<JobStepConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobStepConfig {
    pub task_id: String,
    pub script: PathBuf,
    #[serde(default)]
    pub libraries: Vec<PathBuf>,
    /// Values are templates rendered against the run context
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

fn etl_step(task_id: &str, script: &str, args: &[(&str, &str)]) -> JobStepConfig {
    JobStepConfig {
        task_id: task_id.to_string(),
        script: PathBuf::from(script),
        libraries: vec![PathBuf::from("etl/common.py"), PathBuf::from("etl/helpers.py")],
        args: args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

impl PipelineConfig {
    pub fn short_interests() -> Self {
        Self {
            name: "short_interests".to_string(),
            flag: Signal::ShortInterestsDagState,
            upstream: vec![Signal::PricesDagState],
            requires: Vec::new(),
            steps: vec![
                etl_step(
                    "Pull_stock_symbols",
                    "etl/pull_stock_symbols.py",
                    &[("STOCK_SYMBOLS_TABLE", "stock_symbols")],
                ),
                etl_step(
                    "Pull_short_interest_data",
                    "etl/pull_short_interests.py",
                    &[
                        ("STOCK_SYMBOLS_TABLE", "stock_symbols"),
                        ("SHORT_INTERESTS_TABLE", "short_interests"),
                        ("YESTERDAY_DATE", "{{ yesterday_ds }}"),
                    ],
                ),
                etl_step(
                    "Quality_check",
                    "etl/check_short_interests.py",
                    &[
                        ("SHORT_INTERESTS_TABLE", "short_interests"),
                        ("YESTERDAY_DATE", "{{ yesterday_ds }}"),
                    ],
                ),
            ],
        }
    }

    pub fn prices() -> Self {
        Self {
            name: "prices".to_string(),
            flag: Signal::PricesDagState,
            upstream: vec![Signal::ShortInterestsDagState],
            requires: Vec::new(),
            steps: vec![etl_step(
                "Pull_prices",
                "etl/pull_prices.py",
                &[("PRICES_TABLE", "prices"), ("YESTERDAY_DATE", "{{ yesterday_ds }}")],
            )],
        }
    }

    /// Joins the other two pipelines. Its flag releases cluster teardown, so
    /// it starts only after both have published.
    pub fn combine() -> Self {
        Self {
            name: "combine".to_string(),
            flag: Signal::CombineDagState,
            upstream: Vec::new(),
            requires: vec![Signal::ShortInterestsDagState, Signal::PricesDagState],
            steps: vec![etl_step(
                "Combine_data",
                "etl/combine.py",
                &[
                    ("SHORT_INTERESTS_TABLE", "short_interests"),
                    ("PRICES_TABLE", "prices"),
                    ("YESTERDAY_DATE", "{{ yesterday_ds }}"),
                ],
            )],
        }
    }

    /// Pipelines this one stops on when they report FAILED.
    pub fn fail_fast_on(&self) -> Vec<Signal> {
        let mut signals = self.upstream.clone();
        for signal in &self.requires {
            if !signals.contains(signal) {
                signals.push(*signal);
            }
        }
        signals
    }
}

/// The pipelines used when the configuration names none.
pub fn default_pipelines() -> Vec<PipelineConfig> {
    vec![
        PipelineConfig::short_interests(),
        PipelineConfig::prices(),
        PipelineConfig::combine(),
    ]
}

impl ClusterflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `clusterflow.toml`, or the file given explicitly
    /// 3. Environment variables (prefixed with `CLUSTERFLOW__`)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("CLUSTERFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ClusterflowConfig = builder.build()?.try_deserialize()?;
        if config.pipelines.is_empty() {
            config.pipelines = default_pipelines();
        }
        config.validate()?;
        Ok(config)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<(), ConfigError> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// The effective configuration in the same format it is read from.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut flags = HashSet::new();
        let mut names = HashSet::new();

        for pipeline in &self.pipelines {
            let invalid = |reason: &str| ConfigError::InvalidPipeline {
                pipeline: pipeline.name.clone(),
                reason: reason.to_string(),
            };

            if pipeline.name == crate::workflow::PROVISIONING_CHAIN {
                return Err(invalid("name is reserved for the provisioning chain"));
            }
            if !names.insert(pipeline.name.as_str()) {
                return Err(invalid("duplicate pipeline name"));
            }
            if !pipeline.flag.is_pipeline_flag() {
                return Err(invalid(&format!(
                    "'{}' is not a pipeline state signal",
                    pipeline.flag
                )));
            }
            if !flags.insert(pipeline.flag) {
                return Err(invalid(&format!(
                    "flag '{}' is already owned by another pipeline",
                    pipeline.flag
                )));
            }
            if pipeline.steps.is_empty() {
                return Err(invalid("no steps"));
            }
            if pipeline.upstream.contains(&pipeline.flag) {
                return Err(invalid("lists its own flag as upstream"));
            }
            if let Some(signal) = pipeline.upstream.iter().find(|s| !s.is_pipeline_flag()) {
                return Err(invalid(&format!(
                    "upstream '{signal}' is not a pipeline state signal"
                )));
            }
            if pipeline.requires.contains(&pipeline.flag) {
                return Err(invalid("requires its own flag"));
            }
            if let Some(signal) = pipeline.requires.iter().find(|s| !s.is_pipeline_flag()) {
                return Err(invalid(&format!(
                    "required '{signal}' is not a pipeline state signal"
                )));
            }
        }

        for pipeline in &self.pipelines {
            if let Some(signal) = pipeline
                .requires
                .iter()
                .find(|s| !self.pipelines.iter().any(|p| p.flag == **s))
            {
                return Err(ConfigError::InvalidPipeline {
                    pipeline: pipeline.name.clone(),
                    reason: format!("requires '{signal}' but no pipeline publishes it"),
                });
            }
            if self.requires_transitively(pipeline.flag, pipeline, &mut HashSet::new()) {
                return Err(ConfigError::InvalidPipeline {
                    pipeline: pipeline.name.clone(),
                    reason: "required pipelines wait on each other".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether `from` reaches `target` by following `requires` edges.
    fn requires_transitively(
        &self,
        target: Signal,
        from: &PipelineConfig,
        seen: &mut HashSet<Signal>,
    ) -> bool {
        for signal in &from.requires {
            if *signal == target {
                return true;
            }
            if !seen.insert(*signal) {
                continue;
            }
            if let Some(next) = self.pipelines.iter().find(|p| p.flag == *signal) {
                if self.requires_transitively(target, next, seen) {
                    return true;
                }
            }
        }
        false
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.name == name)
    }
}
