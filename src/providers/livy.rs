//! [`RemoteExecutionProvider`] speaking the Livy REST API on the cluster's
//! master node.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{JobHandle, JobPayload, ProviderError, RemoteExecutionProvider, SessionHandle, TrackedJob};
use crate::config::LivyConfig;

/// Sessions in these states can never run another statement. Any other
/// session, including an `idle` one, may belong to a job that is about to
/// submit.
const UNUSABLE_SESSION_STATES: [&str; 4] = ["dead", "error", "killed", "shutting_down"];
const TERMINAL_STATEMENT_STATES: [&str; 3] = ["available", "error", "cancelled"];

#[derive(Debug, Deserialize)]
struct SessionList {
    #[serde(default)]
    sessions: Vec<SessionInfo>,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: u64,
    state: String,
}

#[derive(Debug, Deserialize)]
struct StatementInfo {
    id: u64,
    state: String,
    #[serde(default)]
    output: Option<StatementOutput>,
}

#[derive(Debug, Deserialize)]
struct StatementOutput {
    status: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    evalue: Option<String>,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SessionLog {
    #[serde(default)]
    log: Vec<String>,
}

pub struct LivyClient {
    http: reqwest::Client,
    settings: LivyConfig,
}

impl LivyClient {
    pub fn new(settings: LivyConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()?;
        Ok(Self { http, settings })
    }

    /// `address` is either a bare host (the cluster's master DNS name) or a
    /// full base URL.
    fn url(&self, address: &str, path: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address.trim_end_matches('/'), path)
        } else {
            format!("http://{}:{}{}", address, self.settings.port, path)
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, ProviderError> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                endpoint: url.to_string(),
                message: e.to_string(),
            })
    }

    async fn session_log(&self, address: &str, session_id: u64) -> Result<Vec<String>, ProviderError> {
        let url = self.url(
            address,
            &format!("/sessions/{session_id}/log?from=0&size={}", self.settings.log_lines),
        );
        Ok(self.get_json::<SessionLog>(&url).await?.log)
    }

    /// Library files, then the argument preamble, then the job script.
    async fn build_code(&self, payload: &JobPayload) -> Result<String, ProviderError> {
        let mut code = String::new();
        for library in &payload.libraries {
            code.push_str(&read_source(library).await?);
            code.push('\n');
        }

        let encoded_args = serde_json::to_string(&payload.args).map_err(|e| ProviderError::InvalidResponse {
            endpoint: "argument encoding".to_string(),
            message: e.to_string(),
        })?;
        // A JSON string literal is also a valid Python string literal.
        let quoted = serde_json::to_string(&encoded_args).map_err(|e| ProviderError::InvalidResponse {
            endpoint: "argument encoding".to_string(),
            message: e.to_string(),
        })?;
        code.push_str(&format!("import json\nargs = json.loads({quoted})\n"));

        code.push_str(&read_source(&payload.script).await?);
        Ok(code)
    }
}

async fn read_source(path: &Path) -> Result<String, ProviderError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProviderError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn output_lines(output: &StatementOutput) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(text) = output
        .data
        .as_ref()
        .and_then(|data| data.get("text/plain"))
        .and_then(|text| text.as_str())
    {
        lines.extend(text.lines().map(str::to_string));
    }
    if let Some(evalue) = &output.evalue {
        lines.push(evalue.clone());
    }
    lines.extend(output.traceback.iter().map(|line| line.trim_end().to_string()));
    lines
}

#[async_trait]
impl RemoteExecutionProvider for LivyClient {
    async fn kill_all_inactive_sessions(&self, address: &str) -> Result<usize, ProviderError> {
        let list: SessionList = self.get_json(&self.url(address, "/sessions")).await?;

        let mut killed = 0;
        for session in list
            .sessions
            .iter()
            .filter(|s| UNUSABLE_SESSION_STATES.contains(&s.state.as_str()))
        {
            debug!(session_id = session.id, state = %session.state, "Killing stale session");
            self.kill_session(address, &SessionHandle { id: session.id })
                .await?;
            killed += 1;
        }
        Ok(killed)
    }

    async fn create_session(&self, address: &str) -> Result<SessionHandle, ProviderError> {
        let url = self.url(address, "/sessions");
        let session: SessionInfo = self
            .http
            .post(&url)
            .json(&json!({ "kind": self.settings.session_kind }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                endpoint: url.clone(),
                message: e.to_string(),
            })?;

        info!(session_id = session.id, state = %session.state, "Created Livy session");
        Ok(SessionHandle { id: session.id })
    }

    async fn await_ready(&self, address: &str, session: &SessionHandle) -> Result<(), ProviderError> {
        let url = self.url(address, &format!("/sessions/{}/state", session.id));
        let interval = Duration::from_millis(self.settings.ready_poll_interval_ms);

        loop {
            let state: SessionInfo = self.get_json(&url).await?;
            match state.state.as_str() {
                "idle" => {
                    info!(session_id = session.id, "Session ready");
                    return Ok(());
                }
                s if UNUSABLE_SESSION_STATES.contains(&s) => {
                    return Err(ProviderError::SessionUnusable {
                        session_id: session.id,
                        state: state.state,
                    });
                }
                s => debug!(session_id = session.id, state = %s, "Session not ready yet"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn submit_job(
        &self,
        address: &str,
        session: &SessionHandle,
        payload: &JobPayload,
    ) -> Result<JobHandle, ProviderError> {
        let code = self.build_code(payload).await?;
        let url = self.url(address, &format!("/sessions/{}/statements", session.id));

        let statement: StatementInfo = self
            .http
            .post(&url)
            .json(&json!({ "code": code }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                endpoint: url.clone(),
                message: e.to_string(),
            })?;

        info!(
            session_id = session.id,
            statement_id = statement.id,
            script = %payload.script.display(),
            "Submitted job"
        );
        Ok(JobHandle {
            session_id: session.id,
            statement_id: statement.id,
        })
    }

    async fn track_job(&self, address: &str, job: &JobHandle) -> Result<TrackedJob, ProviderError> {
        let url = self.url(
            address,
            &format!("/sessions/{}/statements/{}", job.session_id, job.statement_id),
        );
        let interval = Duration::from_millis(self.settings.track_poll_interval_ms);

        let statement = loop {
            let statement: StatementInfo = self.get_json(&url).await?;
            if TERMINAL_STATEMENT_STATES.contains(&statement.state.as_str()) {
                break statement;
            }
            debug!(
                session_id = job.session_id,
                statement_id = job.statement_id,
                state = %statement.state,
                "Job still running"
            );
            tokio::time::sleep(interval).await;
        };

        let mut log_lines = match self.session_log(address, job.session_id).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(session_id = job.session_id, error = %e, "Could not fetch session log");
                Vec::new()
            }
        };

        let status = match &statement.output {
            Some(output) => {
                log_lines.extend(output_lines(output));
                output.status.clone()
            }
            None => statement.state.clone(),
        };

        Ok(TrackedJob { status, log_lines })
    }

    async fn kill_session(&self, address: &str, session: &SessionHandle) -> Result<(), ProviderError> {
        let url = self.url(address, &format!("/sessions/{}", session.id));
        self.http.delete(&url).send().await?.error_for_status()?;
        debug!(session_id = session.id, "Killed session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_from_bare_host_uses_port() {
        let client = LivyClient::new(LivyConfig::default()).unwrap();
        assert_eq!(
            client.url("ec2-1.compute.amazonaws.com", "/sessions"),
            "http://ec2-1.compute.amazonaws.com:8998/sessions"
        );
    }

    #[test]
    fn test_url_from_base_url_is_kept() {
        let client = LivyClient::new(LivyConfig::default()).unwrap();
        assert_eq!(
            client.url("http://127.0.0.1:4000/", "/sessions/1/state"),
            "http://127.0.0.1:4000/sessions/1/state"
        );
    }

    #[test]
    fn test_output_lines_collects_text_and_traceback() {
        let output: StatementOutput = serde_json::from_value(json!({
            "status": "error",
            "evalue": "boom",
            "traceback": ["Traceback (most recent call last):\n", "ValueError: boom\n"]
        }))
        .unwrap();
        assert_eq!(
            output_lines(&output),
            vec![
                "boom".to_string(),
                "Traceback (most recent call last):".to_string(),
                "ValueError: boom".to_string()
            ]
        );

        let output: StatementOutput = serde_json::from_value(json!({
            "status": "ok",
            "data": { "text/plain": "rows: 10\n(FAIL) nulls found" }
        }))
        .unwrap();
        assert_eq!(output_lines(&output), vec!["rows: 10", "(FAIL) nulls found"]);
    }

    #[tokio::test]
    async fn test_build_code_orders_sources() {
        let dir = tempfile::TempDir::new().unwrap();
        let common = dir.path().join("common.py");
        let script = dir.path().join("job.py");
        std::fs::write(&common, "def helper(): pass").unwrap();
        std::fs::write(&script, "print(args['LIMIT'])").unwrap();

        let client = LivyClient::new(LivyConfig::default()).unwrap();
        let code = client
            .build_code(&JobPayload {
                script: script.clone(),
                libraries: vec![common],
                args: [("LIMIT".to_string(), "10".to_string())].into_iter().collect(),
            })
            .await
            .unwrap();

        let helper_at = code.find("def helper").unwrap();
        let args_at = code.find("args = json.loads(").unwrap();
        let script_at = code.find("print(args").unwrap();
        assert!(helper_at < args_at && args_at < script_at);
        assert!(code.contains(r#"json.loads("{\"LIMIT\":\"10\"}")"#));
    }

    #[tokio::test]
    async fn test_missing_script_reports_path() {
        let client = LivyClient::new(LivyConfig::default()).unwrap();
        let err = client
            .build_code(&JobPayload {
                script: "/nonexistent/job.py".into(),
                libraries: Vec::new(),
                args: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Io { path, .. } if path == "/nonexistent/job.py"));
    }
}
