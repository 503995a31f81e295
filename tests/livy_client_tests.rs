//! Livy client against a mock HTTP server.

use std::collections::BTreeMap;

use clusterflow::config::LivyConfig;
use clusterflow::providers::{
    JobHandle, JobPayload, LivyClient, ProviderError, RemoteExecutionProvider, SessionHandle,
};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> LivyClient {
    LivyClient::new(LivyConfig {
        ready_poll_interval_ms: 10,
        track_poll_interval_ms: 10,
        ..LivyConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_kill_all_inactive_spares_live_sessions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "from": 0,
            "total": 5,
            "sessions": [
                { "id": 1, "state": "idle" },
                { "id": 2, "state": "busy" },
                { "id": 3, "state": "dead" },
                { "id": 4, "state": "starting" },
                { "id": 5, "state": "error" }
            ]
        })))
        .mount(&server)
        .await;
    for id in [3, 5] {
        Mock::given(method("DELETE"))
            .and(path(format!("/sessions/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "msg": "deleted" })))
            .expect(1)
            .mount(&server)
            .await;
    }
    // An idle session may be between readiness and submission of another job.
    for id in [1, 2, 4] {
        Mock::given(method("DELETE"))
            .and(path(format!("/sessions/{id}")))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
    }

    let killed = client().kill_all_inactive_sessions(&server.uri()).await.unwrap();
    assert_eq!(killed, 2);
}

#[tokio::test]
async fn test_create_session_and_wait_until_idle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .and(body_partial_json(json!({ "kind": "pyspark" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 7, "state": "starting" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/7/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 7, "state": "starting" })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/7/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 7, "state": "idle" })))
        .mount(&server)
        .await;

    let client = client();
    let session = client.create_session(&server.uri()).await.unwrap();
    assert_eq!(session, SessionHandle { id: 7 });
    client.await_ready(&server.uri(), &session).await.unwrap();
}

#[tokio::test]
async fn test_dead_session_is_unusable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sessions/3/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 3, "state": "dead" })))
        .mount(&server)
        .await;

    let err = client()
        .await_ready(&server.uri(), &SessionHandle { id: 3 })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProviderError::SessionUnusable { session_id: 3, ref state } if state == "dead"
    ));
}

#[tokio::test]
async fn test_submit_sends_libraries_arguments_and_script() {
    let dir = TempDir::new().unwrap();
    let library = dir.path().join("common.py");
    let script = dir.path().join("quality_check.py");
    std::fs::write(&library, "def check(): pass").unwrap();
    std::fs::write(&script, "check()").unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions/7/statements"))
        .and(body_string_contains("def check(): pass"))
        .and(body_string_contains("YESTERDAY_DATE"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 0, "state": "waiting" })))
        .expect(1)
        .mount(&server)
        .await;

    let mut args = BTreeMap::new();
    args.insert("YESTERDAY_DATE".to_string(), "2024-03-01".to_string());
    let job = client()
        .submit_job(
            &server.uri(),
            &SessionHandle { id: 7 },
            &JobPayload {
                script,
                libraries: vec![library],
                args,
            },
        )
        .await
        .unwrap();

    assert_eq!(
        job,
        JobHandle {
            session_id: 7,
            statement_id: 0
        }
    );
}

#[tokio::test]
async fn test_track_job_collects_log_and_output() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sessions/7/statements/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 0, "state": "running" })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/7/statements/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 0,
            "state": "available",
            "output": {
                "status": "ok",
                "execution_count": 0,
                "data": { "text/plain": "checked 120 rows\n(FAIL) 3 rows missing" }
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/7/log"))
        .and(query_param("from", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 7,
            "from": 0,
            "total": 1,
            "log": ["stdout: starting check"]
        })))
        .mount(&server)
        .await;

    let tracked = client()
        .track_job(
            &server.uri(),
            &JobHandle {
                session_id: 7,
                statement_id: 0,
            },
        )
        .await
        .unwrap();

    assert_eq!(tracked.status, "ok");
    assert_eq!(
        tracked.log_lines,
        vec![
            "stdout: starting check".to_string(),
            "checked 120 rows".to_string(),
            "(FAIL) 3 rows missing".to_string()
        ]
    );
}

#[tokio::test]
async fn test_track_job_tolerates_missing_log() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sessions/2/statements/5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 5,
            "state": "error",
            "output": { "status": "error", "evalue": "name 'x' is not defined", "traceback": [] }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/2/log"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let tracked = client()
        .track_job(
            &server.uri(),
            &JobHandle {
                session_id: 2,
                statement_id: 5,
            },
        )
        .await
        .unwrap();

    assert_eq!(tracked.status, "error");
    assert_eq!(tracked.log_lines, vec!["name 'x' is not defined".to_string()]);
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client().create_session(&server.uri()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Http(_)));
}
