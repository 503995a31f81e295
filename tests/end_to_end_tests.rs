//! Full provisioning cycles driven through the scheduler against fakes.

mod fixtures;

use chrono::{Duration, Utc};
use clusterflow::blackboard::{Blackboard, PipelineFlag, Signal};
use clusterflow::testing::ClusterCall;
use clusterflow::{RunState, TickOutcome, Trigger};
use fixtures::Harness;

async fn invoke(h: &Harness, chain: &str, now: chrono::DateTime<Utc>) -> TickOutcome {
    let chain = h.app.chain(chain).unwrap();
    h.app
        .scheduler()
        .invoke(chain, now, Trigger::Manual)
        .await
        .unwrap()
}

fn state(outcome: &TickOutcome) -> &RunState {
    match outcome {
        TickOutcome::Advanced { state, .. } => state,
        other => panic!("expected an advanced run, got {other:?}"),
    }
}

#[tokio::test]
async fn test_full_cycle_creates_runs_and_tears_down() {
    let h = Harness::new();
    let now = Utc::now();

    let provisioning = invoke(&h, "provisioning", now).await;
    assert!(matches!(state(&provisioning), RunState::Waiting { .. }));
    assert_eq!(
        h.board.get(Signal::ClusterId).await.unwrap().as_deref(),
        Some("j-123")
    );

    for pipeline in ["short_interests", "prices", "combine"] {
        let outcome = invoke(&h, pipeline, now).await;
        assert_eq!(state(&outcome), &RunState::Succeeded, "{pipeline} did not finish");

        if pipeline != "combine" {
            // Only the combine flag releases teardown.
            let held = invoke(&h, "provisioning", now).await;
            assert!(matches!(state(&held), RunState::Waiting { .. }), "{pipeline}");
            assert_eq!(h.cluster.live_clusters(), vec!["j-123".to_string()]);
        }
    }
    for signal in Signal::PIPELINE_STATES {
        assert_eq!(h.board.flag(signal).await.unwrap(), Some(PipelineFlag::Completed));
    }

    let teardown = h
        .app
        .scheduler()
        .tick(h.app.chain("provisioning").unwrap(), now + Duration::seconds(120))
        .await
        .unwrap();
    assert_eq!(state(&teardown), &RunState::Succeeded);

    assert!(h.board.snapshot().await.unwrap().is_empty());
    assert!(h.cluster.live_clusters().is_empty());
    assert!(h.cluster.security_groups().is_empty());
    assert!(h.cluster.key_pairs().is_empty());
    assert_eq!(h.remote.killed_sessions(), h.remote.created_sessions());
    assert_eq!(h.remote.submissions().len(), 5);
}

#[tokio::test]
async fn test_combine_waits_for_required_pipelines() {
    let h = Harness::new();
    let now = Utc::now();
    invoke(&h, "provisioning", now).await;

    let early = invoke(&h, "combine", now).await;
    assert!(matches!(state(&early), RunState::Waiting { .. }));
    assert!(h.remote.submissions().is_empty());
    assert!(!h.board.get(Signal::CombineDagState).await.unwrap().is_present());

    assert_eq!(state(&invoke(&h, "short_interests", now).await), &RunState::Succeeded);
    assert!(matches!(state(&invoke(&h, "combine", now).await), RunState::Waiting { .. }));
    let run = h
        .app
        .scheduler()
        .ledger()
        .load("combine")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.app.chain("combine").unwrap().steps[run.cursor].task_id, "Wait_for_prices_dag_state");

    // Teardown still holds: nothing has published the combine flag.
    assert!(matches!(
        state(&invoke(&h, "provisioning", now).await),
        RunState::Waiting { .. }
    ));
    assert_eq!(h.cluster.live_clusters(), vec!["j-123".to_string()]);

    assert_eq!(state(&invoke(&h, "prices", now).await), &RunState::Succeeded);
    assert_eq!(state(&invoke(&h, "combine", now).await), &RunState::Succeeded);
    assert_eq!(h.remote.submissions().len(), 5);
    assert_eq!(
        h.remote.submissions().last().unwrap().script,
        std::path::PathBuf::from("etl/combine.py")
    );
    assert_eq!(state(&invoke(&h, "provisioning", now).await), &RunState::Succeeded);
    assert!(h.cluster.live_clusters().is_empty());
}

#[tokio::test]
async fn test_teardown_order() {
    let h = Harness::new();
    let now = Utc::now();
    invoke(&h, "provisioning", now).await;
    h.board.raise(Signal::CombineDagState, PipelineFlag::Completed).await.unwrap();
    invoke(&h, "provisioning", now).await;

    let teardown: Vec<ClusterCall> = h
        .cluster
        .calls()
        .into_iter()
        .filter(|c| {
            matches!(
                c,
                ClusterCall::DeleteCluster(_)
                    | ClusterCall::DeleteKeyPair(_)
                    | ClusterCall::DeleteSecurityGroup(_)
            )
        })
        .collect();
    assert_eq!(
        teardown,
        vec![
            ClusterCall::DeleteCluster("j-123".to_string()),
            ClusterCall::DeleteKeyPair("clusterflow_pem".to_string()),
            ClusterCall::DeleteSecurityGroup("sg-0001".to_string()),
            ClusterCall::DeleteSecurityGroup("sg-0002".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_job_chain_waits_for_cluster() {
    let h = Harness::new();
    let now = Utc::now();

    let outcome = invoke(&h, "short_interests", now).await;
    assert_eq!(
        state(&outcome),
        &RunState::Waiting {
            until: now + Duration::seconds(120)
        }
    );

    let run = h
        .app
        .scheduler()
        .ledger()
        .load("short_interests")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.cursor, 1);
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_rendered_arguments_use_logical_date() {
    let h = Harness::new();
    let now = Utc::now();
    invoke(&h, "provisioning", now).await;
    invoke(&h, "short_interests", now).await;

    let yesterday = (now.date_naive() - Duration::days(1))
        .format("%Y-%m-%d")
        .to_string();
    let submissions = h.remote.submissions();
    assert_eq!(submissions[1].args["YESTERDAY_DATE"], yesterday);
    assert_eq!(submissions[0].args["STOCK_SYMBOLS_TABLE"], "stock_symbols");
}

#[tokio::test]
async fn test_next_cycle_waits_for_cleanup() {
    let h = Harness::new();
    let now = Utc::now();
    invoke(&h, "provisioning", now).await;
    assert_eq!(state(&invoke(&h, "short_interests", now).await), &RunState::Succeeded);

    // Flag from this cycle is still set, so the next run holds at its first gate.
    let tomorrow = now + Duration::days(1);
    assert!(matches!(
        state(&invoke(&h, "short_interests", tomorrow).await),
        RunState::Waiting { .. }
    ));
    let run = h
        .app
        .scheduler()
        .ledger()
        .load("short_interests")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.cursor, 0);

    for pipeline in ["prices", "combine", "provisioning"] {
        invoke(&h, pipeline, now).await;
    }
    assert!(h.board.snapshot().await.unwrap().is_empty());

    // Next provisioning cycle; the held run now passes both gates.
    invoke(&h, "provisioning", tomorrow).await;
    assert_eq!(
        state(&invoke(&h, "short_interests", tomorrow).await),
        &RunState::Succeeded
    );
}
