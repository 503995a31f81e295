//! Fixed chains of steps and the machinery that drives them.
//!
//! A [`Chain`] is a strictly sequential list of [`Step`]s. The
//! [`runner::ChainRunner`] executes a chain from the cursor stored in its
//! [`ledger::RunRecord`] until a barrier asks to be re-invoked later, a step
//! fails, or the chain ends. The [`scheduler::Scheduler`] decides when each
//! chain is invoked.

pub mod ledger;
pub mod runner;
pub mod scheduler;

use chrono::NaiveDate;
use minijinja::{context, Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::barrier::Barrier;
use crate::blackboard::{PipelineFlag, Signal};
use crate::config::PipelineConfig;
use crate::error::FlowError;
use crate::providers::JobPayload;
use crate::session::{CompletionAction, JobSpec};

pub use ledger::{Checkpoint, LedgerError, RunLedger, RunRecord, RunState, StepAttempt, StepOutcome};
pub use runner::ChainRunner;
pub use scheduler::{interval_start, Scheduler, TickOutcome, Trigger};

pub const PROVISIONING_CHAIN: &str = "provisioning";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    Prepare,
    Create,
    Await(Barrier),
    Terminate,
    Cleanup,
    Job(JobSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub task_id: String,
    pub kind: StepKind,
}

impl Step {
    fn new(task_id: &str, kind: StepKind) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Chain {
    pub fn task_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.task_id.as_str()).collect()
    }
}

/// Create the cluster, hold it until the combine pipeline reports, then
/// tear everything down.
pub fn provisioning_chain(poke_interval: Duration) -> Chain {
    Chain {
        name: PROVISIONING_CHAIN.to_string(),
        steps: vec![
            Step::new("Preparation", StepKind::Prepare),
            Step::new("Create_cluster", StepKind::Create),
            Step::new(
                "Check_etl_completion",
                StepKind::Await(Barrier::await_presence(Signal::CombineDagState, poke_interval)),
            ),
            Step::new("Terminate_cluster", StepKind::Terminate),
            Step::new("Cleanup", StepKind::Cleanup),
        ],
    }
}

/// Wait for the previous run's flag to be cleared, for the cluster, and for
/// every required pipeline to publish, then run each job in order. The last
/// job publishes `COMPLETED`.
pub fn job_chain(pipeline: &PipelineConfig, poke_interval: Duration) -> Chain {
    let mut steps = vec![
        Step::new(
            "Wait_for_fresh_run",
            StepKind::Await(Barrier::await_absence(pipeline.flag, poke_interval)),
        ),
        Step::new(
            "Wait_for_cluster",
            StepKind::Await(Barrier::await_presence(Signal::ClusterId, poke_interval)),
        ),
    ];
    for required in &pipeline.requires {
        steps.push(Step::new(
            &format!("Wait_for_{required}"),
            StepKind::Await(Barrier::await_presence(*required, poke_interval)),
        ));
    }

    let last = pipeline.steps.len().saturating_sub(1);
    for (index, step) in pipeline.steps.iter().enumerate() {
        let on_complete = (index == last).then_some(CompletionAction::Raise {
            signal: pipeline.flag,
            flag: PipelineFlag::Completed,
        });
        steps.push(Step::new(
            &step.task_id,
            StepKind::Job(JobSpec {
                task_id: step.task_id.clone(),
                pipeline: pipeline.flag,
                upstream: pipeline.fail_fast_on(),
                payload: JobPayload {
                    script: step.script.clone(),
                    libraries: step.libraries.clone(),
                    args: step.args.clone(),
                },
                on_complete,
            }),
        ));
    }

    Chain {
        name: pipeline.name.clone(),
        steps,
    }
}

/// Values available to argument templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    pub logical_date: NaiveDate,
}

impl RunContext {
    /// Render every argument of `job` against this run.
    pub fn render(&self, job: &JobSpec) -> Result<JobPayload, FlowError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        let yesterday = self.logical_date.pred_opt().unwrap_or(self.logical_date);
        let ctx = context! {
            ds => self.logical_date.format("%Y-%m-%d").to_string(),
            yesterday_ds => yesterday.format("%Y-%m-%d").to_string(),
            run_id => self.run_id.clone(),
        };

        let mut args = BTreeMap::new();
        for (name, template) in &job.payload.args {
            let value = env
                .render_str(template, &ctx)
                .map_err(|source| FlowError::Template {
                    task_id: job.task_id.clone(),
                    argument: name.clone(),
                    source,
                })?;
            args.insert(name.clone(), value);
        }

        Ok(JobPayload {
            script: job.payload.script.clone(),
            libraries: job.payload.libraries.clone(),
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POKE: Duration = Duration::from_secs(120);

    #[test]
    fn test_provisioning_chain_order() {
        let chain = provisioning_chain(POKE);
        assert_eq!(
            chain.task_ids(),
            vec![
                "Preparation",
                "Create_cluster",
                "Check_etl_completion",
                "Terminate_cluster",
                "Cleanup"
            ]
        );
        assert_eq!(
            chain.steps[2].kind,
            StepKind::Await(Barrier::await_presence(Signal::CombineDagState, POKE))
        );
    }

    #[test]
    fn test_job_chain_gates_and_completion() {
        let chain = job_chain(&PipelineConfig::short_interests(), POKE);
        assert_eq!(
            chain.task_ids(),
            vec![
                "Wait_for_fresh_run",
                "Wait_for_cluster",
                "Pull_stock_symbols",
                "Pull_short_interest_data",
                "Quality_check"
            ]
        );

        let completions: Vec<bool> = chain
            .steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Job(job) => Some(job.on_complete.is_some()),
                _ => None,
            })
            .collect();
        assert_eq!(completions, vec![false, false, true]);
    }

    #[test]
    fn test_required_pipelines_gate_first_job() {
        let chain = job_chain(&PipelineConfig::combine(), POKE);
        assert_eq!(
            chain.task_ids(),
            vec![
                "Wait_for_fresh_run",
                "Wait_for_cluster",
                "Wait_for_short_interests_dag_state",
                "Wait_for_prices_dag_state",
                "Combine_data"
            ]
        );
        assert_eq!(
            chain.steps[3].kind,
            StepKind::Await(Barrier::await_presence(Signal::PricesDagState, POKE))
        );

        let StepKind::Job(job) = &chain.steps[4].kind else {
            panic!("expected a job step");
        };
        assert_eq!(
            job.upstream,
            vec![Signal::ShortInterestsDagState, Signal::PricesDagState]
        );
    }

    #[test]
    fn test_render_arguments() {
        let chain = job_chain(&PipelineConfig::short_interests(), POKE);
        let StepKind::Job(job) = &chain.steps[3].kind else {
            panic!("expected a job step");
        };
        let run = RunContext {
            run_id: "scheduled__2024-03-02".to_string(),
            logical_date: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        };

        let payload = run.render(job).unwrap();
        assert_eq!(payload.args["YESTERDAY_DATE"], "2024-03-01");
        assert_eq!(payload.args["STOCK_SYMBOLS_TABLE"], "stock_symbols");
    }

    #[test]
    fn test_unknown_template_variable_is_rejected() {
        let mut job = JobSpec {
            task_id: "Pull_prices".to_string(),
            pipeline: Signal::PricesDagState,
            upstream: Vec::new(),
            payload: JobPayload {
                script: "etl/prices.py".into(),
                libraries: Vec::new(),
                args: BTreeMap::new(),
            },
            on_complete: None,
        };
        job.payload
            .args
            .insert("DATE".to_string(), "{{ tomorrow_ds }}".to_string());
        let run = RunContext {
            run_id: "manual".to_string(),
            logical_date: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        };

        assert!(matches!(
            run.render(&job),
            Err(FlowError::Template { ref argument, .. }) if argument == "DATE"
        ));
    }
}
