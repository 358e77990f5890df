//! Cron scheduler for agents and workflows.
//!
//! Keeps an in-memory job table keyed `agent_<id>` / `workflow_<id>` mapping
//! to `tokio-cron-scheduler` job handles. Crontab expressions are standard
//! 5-field and validated on persist (see
//! [`validate_cron`](crate::overmind::models::validate_cron)).
//!
//! The scheduler reacts to bus events so CRUD stays decoupled:
//!
//! - `AGENT_CREATED` — schedule if the agent has a crontab.
//! - `AGENT_UPDATED` — remove the job, re-schedule only if `schedule` is
//!   still non-null.
//! - `AGENT_DELETED` — remove the job.
//! - `TRIGGER_FIRED` — launch the agent with the trigger type from the
//!   payload (defaulting to `"webhook"` for compatibility, with a warning).
//!
//! Scheduled ticks silently skip an agent that is already RUNNING;
//! non-scheduled triggers always attempt and surface the refusal.

use crate::overmind::event_bus::{listener, EventBus, EventKind};
use crate::overmind::models::*;
use crate::overmind::store::Store;
use crate::overmind::task_runner::{TaskError, TaskRunner};
use crate::overmind::workflow_engine::WorkflowEngine;
use std::collections::HashMap;
use std::error::Error;
use std::io;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

fn sched_err(e: impl std::fmt::Display) -> Box<dyn Error + Send + Sync> {
    Box::new(io::Error::other(format!("scheduler error: {}", e)))
}

/// `tokio-cron-scheduler`'s `Job::new_async` requires an explicit seconds
/// field, while [`validate_cron`] (and the crontab UX) treats seconds as
/// optional. Pad a bare 5-field expression with a leading `0` so both
/// layers agree on the same schedule.
fn with_required_seconds(cron: &str) -> String {
    if cron.trim().split_whitespace().count() == 5 {
        format!("0 {}", cron)
    } else {
        cron.to_string()
    }
}

struct JobEntry {
    uuid: Uuid,
    cron: String,
}

/// Cron scheduler service. Shared as `Arc<SchedulerService>`; `start` wires
/// the event subscriptions and reinstates persisted schedules.
pub struct SchedulerService {
    sched: JobScheduler,
    jobs: RwLock<HashMap<String, JobEntry>>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    task_runner: Arc<TaskRunner>,
    workflow_engine: Option<Arc<WorkflowEngine>>,
}

impl SchedulerService {
    pub async fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        task_runner: Arc<TaskRunner>,
        workflow_engine: Option<Arc<WorkflowEngine>>,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let sched = JobScheduler::new().await.map_err(sched_err)?;
        Ok(Self {
            sched,
            jobs: RwLock::new(HashMap::new()),
            store,
            bus,
            task_runner,
            workflow_engine,
        })
    }

    /// Start ticking, reinstate all persisted agent schedules, and subscribe
    /// to lifecycle events.
    pub async fn start(self: &Arc<Self>) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut sched = self.sched.clone();
        sched.start().await.map_err(sched_err)?;

        for agent in self.store.list_scheduled_agents().await {
            if let Some(cron) = agent.schedule.clone() {
                if let Err(e) = self.schedule_agent(agent.id, &cron).await {
                    log::error!("failed to reinstate schedule for agent {}: {}", agent.id, e);
                }
            }
        }

        self.subscribe_to_events().await;
        log::info!("scheduler started");
        Ok(())
    }

    /// Stop the underlying scheduler. Job table survives for inspection.
    pub async fn stop(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut sched = self.sched.clone();
        sched.shutdown().await.map_err(sched_err)?;
        Ok(())
    }

    async fn subscribe_to_events(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.bus
            .subscribe(
                EventKind::AgentCreated,
                listener(move |payload| {
                    let this = Arc::clone(&this);
                    async move {
                        if let (Some(id), Some(cron)) = (
                            payload.get("id").and_then(|v| v.as_i64()),
                            payload.get("schedule").and_then(|v| v.as_str()),
                        ) {
                            this.schedule_agent(id, cron).await?;
                        }
                        Ok(())
                    }
                }),
            )
            .await;

        let this = Arc::clone(self);
        self.bus
            .subscribe(
                EventKind::AgentUpdated,
                listener(move |payload| {
                    let this = Arc::clone(&this);
                    async move {
                        let id = match payload.get("id").and_then(|v| v.as_i64()) {
                            Some(id) => id,
                            None => return Ok(()),
                        };
                        let incoming = payload.get("schedule").and_then(|v| v.as_str());
                        let recorded = this.recorded_cron(id).await;
                        match (incoming, recorded) {
                            // Unchanged: every status/next_run bookkeeping
                            // update lands here, including our own.
                            (Some(cron), Some(known)) if cron == known => {}
                            (Some(cron), _) => this.schedule_agent(id, cron).await?,
                            (None, Some(_)) => this.remove_agent_job(id).await?,
                            (None, None) => {}
                        }
                        Ok(())
                    }
                }),
            )
            .await;

        let this = Arc::clone(self);
        self.bus
            .subscribe(
                EventKind::AgentDeleted,
                listener(move |payload| {
                    let this = Arc::clone(&this);
                    async move {
                        if let Some(id) = payload.get("id").and_then(|v| v.as_i64()) {
                            this.remove_agent_job(id).await?;
                        }
                        Ok(())
                    }
                }),
            )
            .await;

        let this = Arc::clone(self);
        self.bus
            .subscribe(
                EventKind::TriggerFired,
                listener(move |payload| {
                    let this = Arc::clone(&this);
                    async move {
                        this.handle_trigger_fired(&payload).await;
                        Ok(())
                    }
                }),
            )
            .await;
    }

    /// Whether a job exists for `agent_<id>`.
    pub async fn has_agent_job(&self, agent_id: Id) -> bool {
        self.jobs
            .read()
            .await
            .contains_key(&format!("agent_{}", agent_id))
    }

    async fn recorded_cron(&self, agent_id: Id) -> Option<String> {
        self.jobs
            .read()
            .await
            .get(&format!("agent_{}", agent_id))
            .map(|entry| entry.cron.clone())
    }

    /// Number of registered jobs (agents plus workflows).
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Install (or replace) the cron job for an agent and persist the next
    /// fire time onto the row.
    pub async fn schedule_agent(
        &self,
        agent_id: Id,
        cron: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        validate_cron(cron).map_err(sched_err)?;
        self.remove_job(&format!("agent_{}", agent_id)).await?;

        let task_runner = Arc::clone(&self.task_runner);
        let job = Job::new_async(with_required_seconds(cron), move |_uuid, _l| {
            let task_runner = Arc::clone(&task_runner);
            Box::pin(async move {
                match task_runner
                    .execute_agent_task(agent_id, ThreadType::Schedule, RunTrigger::Schedule)
                    .await
                {
                    Ok(run) => {
                        log::info!("scheduled run {} finished for agent {}", run.id, agent_id)
                    }
                    // A tick that lands while the agent is busy is skipped
                    // silently; the next tick will try again.
                    Err(TaskError::AlreadyRunning(_)) => {
                        log::debug!("agent {} busy, skipping scheduled tick", agent_id)
                    }
                    Err(e) => log::error!("scheduled run failed for agent {}: {}", agent_id, e),
                }
            })
        })
        .map_err(sched_err)?;

        let uuid = self.sched.add(job).await.map_err(sched_err)?;
        self.jobs.write().await.insert(
            format!("agent_{}", agent_id),
            JobEntry {
                uuid,
                cron: cron.to_string(),
            },
        );

        let next = {
            let mut sched = self.sched.clone();
            sched.next_tick_for_job(uuid).await.ok().flatten()
        };
        if next.is_some() {
            self.store.set_agent_next_run(agent_id, next).await.ok();
        }
        log::info!("scheduled agent {} with cron {:?}", agent_id, cron);
        Ok(())
    }

    /// Remove the cron job for an agent and null its `next_run_at`.
    pub async fn remove_agent_job(
        &self,
        agent_id: Id,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let removed = self.remove_job(&format!("agent_{}", agent_id)).await?;
        if removed {
            self.store.set_agent_next_run(agent_id, None).await.ok();
        }
        Ok(())
    }

    /// Install (or replace) the cron job for a workflow.
    pub async fn schedule_workflow(
        &self,
        workflow_id: Id,
        cron: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let engine = match &self.workflow_engine {
            Some(engine) => Arc::clone(engine),
            None => return Err(sched_err("no workflow engine attached")),
        };
        validate_cron(cron).map_err(sched_err)?;
        self.remove_job(&format!("workflow_{}", workflow_id)).await?;

        let job = Job::new_async(with_required_seconds(cron), move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                match engine.execute_workflow(workflow_id, "schedule").await {
                    Ok(execution_id) => log::info!(
                        "scheduled workflow {} execution {} finished",
                        workflow_id,
                        execution_id
                    ),
                    Err(e) => {
                        log::error!("scheduled workflow {} failed: {}", workflow_id, e)
                    }
                }
            })
        })
        .map_err(sched_err)?;

        let uuid = self.sched.add(job).await.map_err(sched_err)?;
        self.jobs.write().await.insert(
            format!("workflow_{}", workflow_id),
            JobEntry {
                uuid,
                cron: cron.to_string(),
            },
        );
        Ok(())
    }

    /// Remove the cron job for a workflow.
    pub async fn unschedule_workflow(
        &self,
        workflow_id: Id,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.remove_job(&format!("workflow_{}", workflow_id)).await?;
        Ok(())
    }

    async fn remove_job(&self, key: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let existing = self.jobs.write().await.remove(key);
        if let Some(entry) = existing {
            self.sched.remove(&entry.uuid).await.map_err(sched_err)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn handle_trigger_fired(self: &Arc<Self>, payload: &serde_json::Value) {
        let agent_id = match payload.get("agent_id").and_then(|v| v.as_i64()) {
            Some(id) => id,
            None => {
                log::warn!("TRIGGER_FIRED payload without agent_id: {}", payload);
                return;
            }
        };
        let trigger = match payload.get("trigger_type").and_then(|v| v.as_str()) {
            Some(t) => RunTrigger::from_wire(t),
            None => {
                // Compatibility default; callers should always set the field.
                log::warn!(
                    "TRIGGER_FIRED for agent {} missing trigger_type, assuming webhook",
                    agent_id
                );
                RunTrigger::Webhook
            }
        };

        // Fire-and-forget: the bus dispatch loop must not wait on a full
        // agent run.
        let task_runner = Arc::clone(&self.task_runner);
        tokio::spawn(async move {
            match task_runner
                .execute_agent_task(agent_id, ThreadType::Manual, trigger)
                .await
            {
                Ok(run) => log::info!("trigger run {} finished for agent {}", run.id, agent_id),
                Err(TaskError::AlreadyRunning(_)) => {
                    log::warn!("trigger for agent {} refused: already running", agent_id)
                }
                Err(e) => log::error!("trigger run failed for agent {}: {}", agent_id, e),
            }
        });
    }
}
