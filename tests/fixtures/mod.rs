//! Shared harness for integration tests: an [`App`] wired to the in-process
//! fakes and a memory blackboard, with the run ledger in a temp directory.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clusterflow::blackboard::{MemoryBlackboard, Signal};
use clusterflow::config::{ClusterflowConfig, JobStepConfig, PipelineConfig, TeardownConfig};
use clusterflow::testing::{FakeClusterProvider, FakeRemoteExecutor};
use clusterflow::App;
use tempfile::TempDir;

pub struct Harness {
    pub board: Arc<MemoryBlackboard>,
    pub cluster: Arc<FakeClusterProvider>,
    pub remote: Arc<FakeRemoteExecutor>,
    pub app: App,
    _ledger: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_cluster(FakeClusterProvider::new())
    }

    pub fn with_cluster(cluster: FakeClusterProvider) -> Self {
        let ledger = TempDir::new().unwrap();
        let mut config = ClusterflowConfig::default();
        config.scheduler.ledger_dir = ledger.path().to_path_buf();
        config.teardown = TeardownConfig {
            group_deletion_delay_ms: 0,
        };
        config.pipelines = pipelines();

        let board = Arc::new(MemoryBlackboard::new());
        let cluster = Arc::new(cluster);
        let remote = Arc::new(FakeRemoteExecutor::new());
        let app = App::with_providers(config, board.clone(), cluster.clone(), remote.clone());

        Self {
            board,
            cluster,
            remote,
            app,
            _ledger: ledger,
        }
    }
}

fn step(task_id: &str, script: &str, args: &[(&str, &str)]) -> JobStepConfig {
    JobStepConfig {
        task_id: task_id.to_string(),
        script: PathBuf::from(script),
        libraries: vec![PathBuf::from("etl/common.py")],
        args: args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Three pipelines: combine starts once short interests and prices have
/// published.
pub fn pipelines() -> Vec<PipelineConfig> {
    vec![
        PipelineConfig::short_interests(),
        PipelineConfig {
            name: "prices".to_string(),
            flag: Signal::PricesDagState,
            upstream: Vec::new(),
            requires: Vec::new(),
            steps: vec![step("Pull_prices", "etl/pull_prices.py", &[("DATE", "{{ ds }}")])],
        },
        PipelineConfig {
            name: "combine".to_string(),
            flag: Signal::CombineDagState,
            upstream: Vec::new(),
            requires: vec![Signal::ShortInterestsDagState, Signal::PricesDagState],
            steps: vec![step(
                "Combine_data",
                "etl/combine.py",
                &[("YESTERDAY_DATE", "{{ yesterday_ds }}")],
            )],
        },
    ]
}
