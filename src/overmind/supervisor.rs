//! Worker supervisor.
//!
//! A *worker* is a background agent run spawned on behalf of a supervisor
//! agent: it gets its own ephemeral agent + thread, runs under a
//! [`WorkerContext`] (so critical tool errors fail fast), and leaves a full
//! artifact trail in the [`WorkerArtifactStore`]. The supervisor observes it
//! through the roundabout monitor, never by blocking on the run.
//!
//! Three tools surface to the supervisor agent: `spawn_worker`,
//! `list_workers`, `read_worker_result`. Every read path is owner-scoped.

use crate::overmind::agent_runner::{AgentRunner, WorkerContext};
use crate::overmind::event_bus::{listener, EventBus, EventKind, SubscriptionId};
use crate::overmind::models::*;
use crate::overmind::roundabout::{RoundaboutMonitor, RoundaboutParams, RoundaboutResult};
use crate::overmind::store::{NewThreadMessage, Store};
use crate::overmind::tool_protocol::{Tool, ToolError};
use crate::overmind::worker_store::WorkerArtifactStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const WORKER_SYSTEM_PROMPT: &str = "You are a background worker. Complete the assigned task \
using your tools, then reply with your final result. Start the final reply with \"Result:\".";

/// Spawns and tracks background workers.
pub struct WorkerSupervisor {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    runner: Arc<AgentRunner>,
    artifacts: Arc<WorkerArtifactStore>,
}

impl WorkerSupervisor {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        runner: Arc<AgentRunner>,
        artifacts: Arc<WorkerArtifactStore>,
    ) -> Self {
        Self {
            store,
            bus,
            runner,
            artifacts,
        }
    }

    pub fn artifacts(&self) -> &Arc<WorkerArtifactStore> {
        &self.artifacts
    }

    /// Spawn a background worker for `task`. Returns the job once the worker
    /// is RUNNING; the run itself proceeds on its own task.
    pub async fn spawn_worker(
        &self,
        owner_id: Id,
        task: &str,
        model: &str,
    ) -> Result<WorkerJob, Box<dyn Error + Send + Sync>> {
        let job = self.store.create_worker_job(owner_id, task, model).await?;
        let worker_id = self
            .artifacts
            .create_worker(task, owner_id, json!({ "model": model }))?;
        self.store
            .update_worker_job(job.id, None, Some(worker_id.clone()), None)
            .await?;

        // Ephemeral agent + thread backing the run.
        let agent = self
            .store
            .create_agent(
                owner_id,
                &format!("worker {}", worker_id),
                WORKER_SYSTEM_PROMPT,
                task,
                model,
                None,
            )
            .await?;
        let thread = self
            .store
            .create_thread(agent.id, task, ThreadType::Manual, false)
            .await?;
        self.store
            .create_thread_message(NewThreadMessage::simple(thread.id, MessageRole::User, task))
            .await?;
        let run = self.store.create_run(agent.id, thread.id, RunTrigger::Api).await?;

        let ctx = Arc::new(WorkerContext::new(worker_id.clone(), job.id));
        let subscriptions = self.capture_tool_artifacts(&worker_id).await;

        self.artifacts.start_worker(&worker_id)?;
        let job = self
            .store
            .update_worker_job(job.id, Some(WorkerStatus::Running), None, None)
            .await?;

        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let runner = Arc::clone(&self.runner);
        let artifacts = Arc::clone(&self.artifacts);
        let job_id = job.id;
        let worker_id_task = worker_id.clone();
        tokio::spawn(async move {
            let outcome = runner
                .run_thread(agent.id, thread.id, run.id, Some(Arc::clone(&ctx)))
                .await;
            finish_worker(
                &store,
                &artifacts,
                job_id,
                &worker_id_task,
                &ctx,
                outcome,
            )
            .await;
            for (kind, id) in subscriptions {
                bus.unsubscribe(kind, id).await;
            }
        });

        Ok(job)
    }

    /// Monitor a worker with the roundabout loop.
    pub async fn monitor_worker(
        &self,
        job_id: Id,
        owner_id: Id,
        params: RoundaboutParams,
    ) -> RoundaboutResult {
        RoundaboutMonitor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            Arc::clone(&self.artifacts),
            job_id,
            owner_id,
            params,
        )
        .wait_for_completion()
        .await
    }

    /// Persist each of the worker's tool calls as a numbered artifact file.
    async fn capture_tool_artifacts(
        &self,
        worker_id: &str,
    ) -> Vec<(EventKind, SubscriptionId)> {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut subscriptions = Vec::new();
        for kind in [EventKind::WorkerToolCompleted, EventKind::WorkerToolFailed] {
            let artifacts = Arc::clone(&self.artifacts);
            let counter = Arc::clone(&counter);
            let worker_id = worker_id.to_string();
            let id = self
                .bus
                .subscribe(
                    kind,
                    listener(move |payload| {
                        let artifacts = Arc::clone(&artifacts);
                        let counter = Arc::clone(&counter);
                        let worker_id = worker_id.clone();
                        async move {
                            if payload.get("worker_id").and_then(|v| v.as_str())
                                != Some(worker_id.as_str())
                            {
                                return Ok(());
                            }
                            let seq = counter.fetch_add(1, Ordering::SeqCst) + 1;
                            let tool_name = payload
                                .get("tool_name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("unknown");
                            let body = payload
                                .get("result")
                                .or_else(|| payload.get("error"))
                                .map(|v| {
                                    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
                                })
                                .unwrap_or_default();
                            artifacts.save_tool_output(&worker_id, seq, tool_name, &body)?;
                            Ok(())
                        }
                    }),
                )
                .await;
            subscriptions.push((kind, id));
        }
        subscriptions
    }
}

/// Terminal bookkeeping shared by every worker outcome.
async fn finish_worker(
    store: &Arc<Store>,
    artifacts: &Arc<WorkerArtifactStore>,
    job_id: Id,
    worker_id: &str,
    ctx: &Arc<WorkerContext>,
    outcome: Result<Vec<ThreadMessage>, Box<dyn Error + Send + Sync>>,
) {
    match outcome {
        Ok(messages) => {
            for message in &messages {
                let row = serde_json::to_value(message).unwrap_or(Value::Null);
                if let Err(e) = artifacts.save_message(worker_id, &row) {
                    log::warn!("failed to log worker message: {}", e);
                }
            }
            let final_text = messages
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::Assistant)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            if let Err(e) = artifacts.save_result(worker_id, &final_text) {
                log::warn!("failed to save worker result: {}", e);
            }

            // A cancel from the roundabout wins over run completion.
            let already_cancelled = store
                .get_worker_job(job_id)
                .await
                .map(|j| j.status == WorkerStatus::Cancelled)
                .unwrap_or(false);
            if already_cancelled {
                let _ = artifacts.complete_worker(worker_id, "cancelled", None);
                return;
            }

            if ctx.has_critical_error() {
                let error = ctx.critical_error_message().unwrap_or_default();
                let _ = store
                    .update_worker_job(
                        job_id,
                        Some(WorkerStatus::Failed),
                        None,
                        Some(error.clone()),
                    )
                    .await;
                let _ = artifacts.complete_worker(worker_id, "failed", Some(error.as_str()));
            } else {
                let _ = store
                    .update_worker_job(job_id, Some(WorkerStatus::Success), None, None)
                    .await;
                let _ = artifacts.complete_worker(worker_id, "success", None);
            }
        }
        Err(e) => {
            let error = e.to_string();
            log::error!("worker {} run failed: {}", worker_id, error);
            let _ = store
                .update_worker_job(
                    job_id,
                    Some(WorkerStatus::Failed),
                    None,
                    Some(error.clone()),
                )
                .await;
            let _ = artifacts.complete_worker(worker_id, "failed", Some(error.as_str()));
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor-facing tools
// ---------------------------------------------------------------------------

/// The three tools exposed to supervisor agents, ready for registration.
pub fn supervisor_tools(supervisor: Arc<WorkerSupervisor>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(SpawnWorkerTool {
            supervisor: Arc::clone(&supervisor),
        }),
        Arc::new(ListWorkersTool {
            supervisor: Arc::clone(&supervisor),
        }),
        Arc::new(ReadWorkerResultTool { supervisor }),
    ]
}

fn owner_from_args(args: &Value) -> Result<Id, ToolError> {
    args.get("owner_id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ToolError::InvalidArguments("missing required field 'owner_id'".into()))
}

/// Spawns a background worker and returns its job/worker ids immediately.
pub struct SpawnWorkerTool {
    supervisor: Arc<WorkerSupervisor>,
}

#[async_trait]
impl Tool for SpawnWorkerTool {
    fn name(&self) -> &str {
        "spawn_worker"
    }

    fn description(&self) -> &str {
        "Spawn a background worker for a task; returns job_id and worker_id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string" },
                "model": { "type": "string", "default": "gpt-4o" },
                "owner_id": { "type": "integer" }
            },
            "required": ["task", "owner_id"]
        })
    }

    fn is_async(&self) -> bool {
        true
    }

    fn run(&self, _args: Value) -> Result<Value, ToolError> {
        Err(ToolError::ExecutionFailed(
            "spawn_worker is async-only".into(),
        ))
    }

    async fn ainvoke(&self, args: Value) -> Result<Value, ToolError> {
        let owner_id = owner_from_args(&args)?;
        let task = args
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing required field 'task'".into()))?;
        let model = args
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("gpt-4o");

        let job = self
            .supervisor
            .spawn_worker(owner_id, task, model)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({
            "job_id": job.id,
            "worker_id": job.worker_id,
            "status": job.status,
        }))
    }
}

/// Lists the caller's workers from the artifact index.
pub struct ListWorkersTool {
    supervisor: Arc<WorkerSupervisor>,
}

#[async_trait]
impl Tool for ListWorkersTool {
    fn name(&self) -> &str {
        "list_workers"
    }

    fn description(&self) -> &str {
        "List background workers belonging to the caller."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "owner_id": { "type": "integer" } },
            "required": ["owner_id"]
        })
    }

    fn run(&self, args: Value) -> Result<Value, ToolError> {
        let owner_id = owner_from_args(&args)?;
        Ok(Value::Array(
            self.supervisor.artifacts.list_workers(Some(owner_id)),
        ))
    }
}

/// Reads a worker's canonical result (owner-scoped).
pub struct ReadWorkerResultTool {
    supervisor: Arc<WorkerSupervisor>,
}

#[async_trait]
impl Tool for ReadWorkerResultTool {
    fn name(&self) -> &str {
        "read_worker_result"
    }

    fn description(&self) -> &str {
        "Read the final result of a worker by worker_id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "worker_id": { "type": "string" },
                "owner_id": { "type": "integer" }
            },
            "required": ["worker_id", "owner_id"]
        })
    }

    fn run(&self, args: Value) -> Result<Value, ToolError> {
        let owner_id = owner_from_args(&args)?;
        let worker_id = args
            .get("worker_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::InvalidArguments("missing required field 'worker_id'".into())
            })?;

        let metadata = self
            .supervisor
            .artifacts
            .get_worker_metadata(worker_id, Some(owner_id))
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let result = self
            .supervisor
            .artifacts
            .get_worker_result(worker_id, Some(owner_id))
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({
            "worker_id": worker_id,
            "status": metadata.get("status").cloned().unwrap_or(Value::Null),
            "summary": metadata.get("summary").cloned().unwrap_or(Value::Null),
            "result": result,
        }))
    }
}
