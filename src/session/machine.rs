use statig::prelude::*;

/// Terminal statuses that count as success.
pub const SUCCESS_STATUSES: [&str; 2] = ["available", "ok"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started { statement_id: u64 },
    Finished { status: String },
    LogFailure { line: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Submitted,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Status(String),
    Log(String),
}

#[derive(Debug)]
pub struct JobMachine {
    pub task_id: String,
    phase: JobPhase,
    statement_id: Option<u64>,
    status: Option<String>,
    failure: Option<JobFailure>,
}

impl JobMachine {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            phase: JobPhase::Submitted,
            statement_id: None,
            status: None,
            failure: None,
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    fn finish(&mut self, status: &str) -> Outcome<State> {
        self.status = Some(status.to_string());
        if SUCCESS_STATUSES.contains(&status) {
            self.phase = JobPhase::Succeeded;
            Transition(State::succeeded())
        } else {
            self.phase = JobPhase::Failed;
            self.failure = Some(JobFailure::Status(status.to_string()));
            Transition(State::failed())
        }
    }
}

#[state_machine(initial = "State::submitted()")]
impl JobMachine {
    #[state]
    fn submitted(&mut self, event: &JobEvent) -> Outcome<State> {
        match event {
            JobEvent::Started { statement_id } => {
                self.statement_id = Some(*statement_id);
                self.phase = JobPhase::Running;
                tracing::debug!(task_id = %self.task_id, statement_id, "Job running");
                Transition(State::running())
            }
            _ => Handled,
        }
    }

    #[state]
    fn running(&mut self, event: &JobEvent) -> Outcome<State> {
        match event {
            JobEvent::Finished { status } => self.finish(status),
            _ => Handled,
        }
    }

    #[state]
    fn succeeded(&mut self, event: &JobEvent) -> Outcome<State> {
        match event {
            JobEvent::LogFailure { line } => {
                tracing::warn!(
                    task_id = %self.task_id,
                    status = ?self.status,
                    "Successful status overridden by log inspection"
                );
                self.phase = JobPhase::Failed;
                self.failure = Some(JobFailure::Log(line.clone()));
                Transition(State::failed())
            }
            _ => Handled,
        }
    }

    #[state]
    fn failed(&mut self, event: &JobEvent) -> Outcome<State> {
        // The first failure is the one reported; later log lines are only logged.
        let _ = event;
        Handled
    }
}
