//! Shared agent-task launcher.
//!
//! Cron ticks, webhook triggers, and manual API calls all start agent work
//! through the same path: refuse when the agent is already running, create a
//! thread of the right type, seed the agent's task instructions, create the
//! run, and hand over to the [`AgentRunner`]. The caller decides whether an
//! `AlreadyRunning` refusal is an error (manual/webhook) or a silent skip
//! (scheduled ticks).

use crate::overmind::agent_runner::AgentRunner;
use crate::overmind::models::*;
use crate::overmind::store::{AgentUpdate, NewThreadMessage, Store};
use chrono::Utc;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Errors from task launches.
#[derive(Debug)]
pub enum TaskError {
    /// The agent is already RUNNING. Scheduled callers downgrade this to a
    /// silent skip; everything else surfaces it.
    AlreadyRunning(Id),
    Other(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::AlreadyRunning(id) => write!(f, "agent {} already running", id),
            TaskError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for TaskError {}

/// The only component that launches agent runs (and therefore the only
/// mutator of `Agent.status`, via the runner).
pub struct TaskRunner {
    store: Arc<Store>,
    runner: Arc<AgentRunner>,
}

impl TaskRunner {
    pub fn new(store: Arc<Store>, runner: Arc<AgentRunner>) -> Self {
        Self { store, runner }
    }

    /// Launch one agent task end to end. Returns the terminal run.
    pub async fn execute_agent_task(
        &self,
        agent_id: Id,
        thread_type: ThreadType,
        trigger: RunTrigger,
    ) -> Result<AgentRun, TaskError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await
            .map_err(|e| TaskError::Other(e.to_string()))?;
        if agent.status == AgentStatus::Running {
            return Err(TaskError::AlreadyRunning(agent_id));
        }

        let title = format!(
            "{:?} run {}",
            trigger,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );
        let thread = self
            .store
            .create_thread(agent_id, &title, thread_type, false)
            .await
            .map_err(|e| TaskError::Other(e.to_string()))?;

        self.store
            .create_thread_message(NewThreadMessage::simple(
                thread.id,
                MessageRole::User,
                agent.task_instructions.clone(),
            ))
            .await
            .map_err(|e| TaskError::Other(e.to_string()))?;

        let run = self
            .store
            .create_run(agent_id, thread.id, trigger)
            .await
            .map_err(|e| TaskError::Other(e.to_string()))?;

        let outcome = self
            .runner
            .run_thread(agent_id, thread.id, run.id, None)
            .await;

        // Record the attempt on the agent either way; the runner already set
        // status and published the run transition.
        let last_error = match &outcome {
            Ok(_) => Some(None),
            Err(e) => Some(Some(e.to_string())),
        };
        self.store
            .update_agent(
                agent_id,
                AgentUpdate {
                    last_run_at: Some(Some(Utc::now())),
                    last_error,
                    ..AgentUpdate::default()
                },
            )
            .await
            .map_err(|e| TaskError::Other(e.to_string()))?;

        if let Err(e) = outcome {
            return Err(TaskError::Other(e.to_string()));
        }
        self.store
            .get_run(run.id)
            .await
            .map_err(|e| TaskError::Other(e.to_string()))
    }
}
