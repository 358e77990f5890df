//! In-memory relational store for the orchestration core.
//!
//! The persistent storage engine is an external collaborator; the core owns
//! this process-wide store with the same relational shape and enforces every
//! data-level invariant at this boundary:
//!
//! - unique case-insensitive user emails, unique trigger secrets, unique
//!   `(owner, name)` among active workflows;
//! - dense, monotonic per-thread message ids (the authoritative chronological
//!   order);
//! - at most one active thread per agent, toggled atomically;
//! - `AgentRun` transitions restricted to QUEUED → RUNNING → (SUCCESS|FAILED);
//! - `phase == FINISHED ⇔ result != NULL` for executions and node states;
//! - client-supplied `sent_at` clamped to ±5 minutes of server time;
//! - cascade deletes (agent → threads → messages, runs, triggers);
//! - user `context`/`prefs` deep-merge with a 64 KiB cap on the serialized
//!   context;
//! - OAuth refresh tokens sealed via [`SecretBox`] before they are stored.
//!
//! Mutations publish CRUD events on the [`EventBus`] **after** the table lock
//! is released, so no lock is ever held across a call into another component.

use crate::overmind::crypto::{CryptoError, SecretBox};
use crate::overmind::event_bus::{EventBus, EventKind};
use crate::overmind::models::*;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Maximum serialized size of `User.context`.
pub const USER_CONTEXT_MAX_BYTES: usize = 64 * 1024;

/// Clamp window for client-supplied message timestamps.
const SENT_AT_CLAMP: i64 = 5 * 60;

/// Errors surfaced by store operations.
#[derive(Debug)]
pub enum StoreError {
    NotFound(&'static str, Id),
    Conflict(String),
    Validation(String),
    /// Exclusive access could not be acquired within the caller's timeout.
    Locked,
    Crypto(CryptoError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(entity, id) => write!(f, "{} {} not found", entity, id),
            StoreError::Conflict(msg) => write!(f, "conflict: {}", msg),
            StoreError::Validation(msg) => write!(f, "validation failed: {}", msg),
            StoreError::Locked => write!(f, "store is locked"),
            StoreError::Crypto(e) => write!(f, "crypto failure: {}", e),
        }
    }
}

impl Error for StoreError {}

impl From<CryptoError> for StoreError {
    fn from(e: CryptoError) -> Self {
        StoreError::Crypto(e)
    }
}

/// Partial update for an [`Agent`]. `None` fields are left untouched;
/// double-`Option` fields distinguish "leave" from "set to null".
#[derive(Default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub system_instructions: Option<String>,
    pub task_instructions: Option<String>,
    pub model: Option<String>,
    pub status: Option<AgentStatus>,
    pub schedule: Option<Option<String>>,
    pub config: Option<Map<String, Value>>,
    pub allowed_tools: Option<Option<Vec<String>>>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub last_run_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
}

/// Input for [`Store::create_thread_message`].
pub struct NewThreadMessage {
    pub thread_id: Id,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    /// Client-supplied send time; clamped. `None` means server time.
    pub sent_at: Option<DateTime<Utc>>,
    pub processed: bool,
    pub parent_id: Option<Id>,
    pub message_metadata: Option<Map<String, Value>>,
}

impl NewThreadMessage {
    /// A plain message with server timestamps and no tool linkage.
    pub fn simple(thread_id: Id, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            thread_id,
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            sent_at: None,
            processed: false,
            parent_id: None,
            message_metadata: None,
        }
    }
}

/// Before/after row counts for one table, as reported by `clear_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableCounts {
    pub before: usize,
    pub after: usize,
}

/// Report returned by [`Store::clear_data`].
#[derive(Debug)]
pub struct ClearDataReport {
    pub tables: BTreeMap<&'static str, TableCounts>,
    pub rows_cleared: usize,
}

#[derive(Default)]
struct Sequences {
    users: Id,
    agents: Id,
    threads: Id,
    runs: Id,
    triggers: Id,
    workflows: Id,
    executions: Id,
    node_states: Id,
    worker_jobs: Id,
    thread_messages: HashMap<Id, Id>,
}

impl Sequences {
    fn next(counter: &mut Id) -> Id {
        *counter += 1;
        *counter
    }
}

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    agents: Vec<Agent>,
    threads: Vec<Thread>,
    messages: Vec<ThreadMessage>,
    runs: Vec<AgentRun>,
    triggers: Vec<Trigger>,
    workflows: Vec<Workflow>,
    executions: Vec<WorkflowExecution>,
    node_states: Vec<NodeExecutionState>,
    worker_jobs: Vec<WorkerJob>,
    seq: Sequences,
}

/// The process-wide data store. Shared via `Arc<Store>`.
pub struct Store {
    bus: Arc<EventBus>,
    secrets: SecretBox,
    tables: RwLock<Tables>,
}

impl Store {
    pub fn new(bus: Arc<EventBus>, secret_key: &str) -> Self {
        Self {
            bus,
            secrets: SecretBox::new(secret_key),
            tables: RwLock::new(Tables::default()),
        }
    }

    // -- Users -------------------------------------------------------------

    /// Create a user. Emails are unique case-insensitively.
    pub async fn create_user(
        &self,
        email: &str,
        role: UserRole,
        display_name: Option<String>,
    ) -> Result<User, StoreError> {
        let now = Utc::now();
        let mut t = self.tables.write().await;
        let lowered = email.to_ascii_lowercase();
        if t.users.iter().any(|u| u.email.to_ascii_lowercase() == lowered) {
            return Err(StoreError::Conflict(format!(
                "email {} already registered",
                email
            )));
        }
        let user = User {
            id: Sequences::next(&mut t.seq.users),
            email: email.to_string(),
            role,
            display_name,
            avatar_url: None,
            prefs: Map::new(),
            gmail_refresh_token: None,
            context: Map::new(),
            created_at: now,
            updated_at: now,
        };
        t.users.push(user.clone());
        Ok(user)
    }

    pub async fn get_user(&self, id: Id) -> Result<User, StoreError> {
        let t = self.tables.read().await;
        t.users
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or(StoreError::NotFound("user", id))
    }

    pub async fn get_user_by_email(&self, email: &str) -> Option<User> {
        let lowered = email.to_ascii_lowercase();
        let t = self.tables.read().await;
        t.users
            .iter()
            .find(|u| u.email.to_ascii_lowercase() == lowered)
            .cloned()
    }

    /// Deep-merge `patch` into the user's context. Nested maps merge,
    /// sequences are replaced wholesale, scalars overwrite. The serialized
    /// result must stay within [`USER_CONTEXT_MAX_BYTES`].
    pub async fn update_user_context(
        &self,
        user_id: Id,
        patch: Map<String, Value>,
    ) -> Result<User, StoreError> {
        let mut t = self.tables.write().await;
        let user = t
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(StoreError::NotFound("user", user_id))?;
        let mut merged = user.context.clone();
        deep_merge(&mut merged, patch);
        let serialized = serde_json::to_vec(&merged).unwrap_or_default();
        if serialized.len() > USER_CONTEXT_MAX_BYTES {
            return Err(StoreError::Validation(format!(
                "user context exceeds {} bytes after merge",
                USER_CONTEXT_MAX_BYTES
            )));
        }
        user.context = merged;
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    /// Deep-merge `patch` into the user's UI preferences.
    pub async fn update_user_prefs(
        &self,
        user_id: Id,
        patch: Map<String, Value>,
    ) -> Result<User, StoreError> {
        let mut t = self.tables.write().await;
        let user = t
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(StoreError::NotFound("user", user_id))?;
        deep_merge(&mut user.prefs, patch);
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    /// Seal and store the user's Gmail refresh token.
    pub async fn set_gmail_refresh_token(
        &self,
        user_id: Id,
        token: &str,
    ) -> Result<(), StoreError> {
        let sealed = self.secrets.seal(token)?;
        let mut t = self.tables.write().await;
        let user = t
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(StoreError::NotFound("user", user_id))?;
        user.gmail_refresh_token = Some(sealed);
        user.updated_at = Utc::now();
        Ok(())
    }

    /// Decrypt the user's Gmail refresh token, if connected.
    pub async fn get_gmail_refresh_token(&self, user_id: Id) -> Result<Option<String>, StoreError> {
        let sealed = {
            let t = self.tables.read().await;
            t.users
                .iter()
                .find(|u| u.id == user_id)
                .ok_or(StoreError::NotFound("user", user_id))?
                .gmail_refresh_token
                .clone()
        };
        match sealed {
            Some(blob) => Ok(Some(self.secrets.open(&blob)?)),
            None => Ok(None),
        }
    }

    // -- Agents ------------------------------------------------------------

    pub async fn create_agent(
        &self,
        owner_id: Id,
        name: &str,
        system_instructions: &str,
        task_instructions: &str,
        model: &str,
        schedule: Option<String>,
    ) -> Result<Agent, StoreError> {
        if let Some(expr) = &schedule {
            validate_cron(expr).map_err(StoreError::Validation)?;
        }
        let now = Utc::now();
        let agent = {
            let mut t = self.tables.write().await;
            if !t.users.iter().any(|u| u.id == owner_id) {
                return Err(StoreError::NotFound("user", owner_id));
            }
            let agent = Agent {
                id: Sequences::next(&mut t.seq.agents),
                owner_id,
                name: name.to_string(),
                system_instructions: system_instructions.to_string(),
                task_instructions: task_instructions.to_string(),
                model: model.to_string(),
                status: AgentStatus::Idle,
                schedule,
                config: Map::new(),
                allowed_tools: None,
                next_run_at: None,
                last_run_at: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            t.agents.push(agent.clone());
            agent
        };
        self.bus
            .publish(EventKind::AgentCreated, entity_payload(&agent))
            .await;
        Ok(agent)
    }

    pub async fn get_agent(&self, id: Id) -> Result<Agent, StoreError> {
        let t = self.tables.read().await;
        t.agents
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(StoreError::NotFound("agent", id))
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        self.tables.read().await.agents.clone()
    }

    /// Agents with a non-null schedule, for scheduler startup.
    pub async fn list_scheduled_agents(&self) -> Vec<Agent> {
        let t = self.tables.read().await;
        t.agents
            .iter()
            .filter(|a| a.schedule.is_some())
            .cloned()
            .collect()
    }

    /// Apply a partial update; validates any new schedule and publishes
    /// `AGENT_UPDATED`.
    pub async fn update_agent(&self, id: Id, update: AgentUpdate) -> Result<Agent, StoreError> {
        if let Some(Some(expr)) = &update.schedule {
            validate_cron(expr).map_err(StoreError::Validation)?;
        }
        let agent = {
            let mut t = self.tables.write().await;
            let agent = t
                .agents
                .iter_mut()
                .find(|a| a.id == id)
                .ok_or(StoreError::NotFound("agent", id))?;
            if let Some(v) = update.name {
                agent.name = v;
            }
            if let Some(v) = update.system_instructions {
                agent.system_instructions = v;
            }
            if let Some(v) = update.task_instructions {
                agent.task_instructions = v;
            }
            if let Some(v) = update.model {
                agent.model = v;
            }
            if let Some(v) = update.status {
                agent.status = v;
            }
            if let Some(v) = update.schedule {
                agent.schedule = v;
            }
            if let Some(v) = update.config {
                agent.config = v;
            }
            if let Some(v) = update.allowed_tools {
                agent.allowed_tools = v;
            }
            if let Some(v) = update.next_run_at {
                agent.next_run_at = v;
            }
            if let Some(v) = update.last_run_at {
                agent.last_run_at = v;
            }
            if let Some(v) = update.last_error {
                agent.last_error = v;
            }
            agent.updated_at = Utc::now();
            agent.clone()
        };
        self.bus
            .publish(EventKind::AgentUpdated, entity_payload(&agent))
            .await;
        Ok(agent)
    }

    /// Persist the scheduler's next fire time without publishing
    /// `AGENT_UPDATED`. This is scheduler bookkeeping, not a CRUD mutation —
    /// publishing it would bounce straight back into the scheduler's own
    /// event handlers.
    pub async fn set_agent_next_run(
        &self,
        id: Id,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let agent = t
            .agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::NotFound("agent", id))?;
        agent.next_run_at = next_run_at;
        agent.updated_at = Utc::now();
        Ok(())
    }

    /// Set only the allowed-tools patterns (common enough to warrant a helper).
    pub async fn set_agent_allowed_tools(
        &self,
        id: Id,
        allowed: Option<Vec<String>>,
    ) -> Result<Agent, StoreError> {
        self.update_agent(
            id,
            AgentUpdate {
                allowed_tools: Some(allowed),
                ..AgentUpdate::default()
            },
        )
        .await
    }

    /// Delete an agent, cascading to its threads (and their messages), runs
    /// and triggers.
    pub async fn delete_agent(&self, id: Id) -> Result<(), StoreError> {
        {
            let mut t = self.tables.write().await;
            if !t.agents.iter().any(|a| a.id == id) {
                return Err(StoreError::NotFound("agent", id));
            }
            let thread_ids: Vec<Id> = t
                .threads
                .iter()
                .filter(|th| th.agent_id == id)
                .map(|th| th.id)
                .collect();
            t.messages.retain(|m| !thread_ids.contains(&m.thread_id));
            for tid in &thread_ids {
                t.seq.thread_messages.remove(tid);
            }
            t.threads.retain(|th| th.agent_id != id);
            t.runs.retain(|r| r.agent_id != id);
            t.triggers.retain(|tr| tr.agent_id != id);
            t.agents.retain(|a| a.id != id);
        }
        self.bus
            .publish(EventKind::AgentDeleted, json!({ "id": id }))
            .await;
        Ok(())
    }

    // -- Threads -----------------------------------------------------------

    /// Create a thread. When `active`, siblings of the same agent are
    /// deactivated in the same critical section.
    pub async fn create_thread(
        &self,
        agent_id: Id,
        title: &str,
        thread_type: ThreadType,
        active: bool,
    ) -> Result<Thread, StoreError> {
        let now = Utc::now();
        let thread = {
            let mut t = self.tables.write().await;
            if !t.agents.iter().any(|a| a.id == agent_id) {
                return Err(StoreError::NotFound("agent", agent_id));
            }
            if active {
                for th in t.threads.iter_mut().filter(|th| th.agent_id == agent_id) {
                    th.active = false;
                }
            }
            let thread = Thread {
                id: Sequences::next(&mut t.seq.threads),
                agent_id,
                title: title.to_string(),
                active,
                agent_state: Map::new(),
                memory_strategy: "buffer".to_string(),
                thread_type,
                created_at: now,
                updated_at: now,
            };
            t.threads.push(thread.clone());
            thread
        };
        self.bus
            .publish(EventKind::ThreadCreated, entity_payload(&thread))
            .await;
        Ok(thread)
    }

    pub async fn get_thread(&self, id: Id) -> Result<Thread, StoreError> {
        let t = self.tables.read().await;
        t.threads
            .iter()
            .find(|th| th.id == id)
            .cloned()
            .ok_or(StoreError::NotFound("thread", id))
    }

    pub async fn list_threads(&self, agent_id: Id) -> Vec<Thread> {
        let t = self.tables.read().await;
        t.threads
            .iter()
            .filter(|th| th.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Mark one thread active and atomically deactivate its siblings.
    pub async fn set_thread_active(&self, thread_id: Id) -> Result<Thread, StoreError> {
        let thread = {
            let mut t = self.tables.write().await;
            let agent_id = t
                .threads
                .iter()
                .find(|th| th.id == thread_id)
                .map(|th| th.agent_id)
                .ok_or(StoreError::NotFound("thread", thread_id))?;
            let mut updated = None;
            for th in t.threads.iter_mut().filter(|th| th.agent_id == agent_id) {
                th.active = th.id == thread_id;
                if th.id == thread_id {
                    th.updated_at = Utc::now();
                    updated = Some(th.clone());
                }
            }
            updated.ok_or(StoreError::NotFound("thread", thread_id))?
        };
        self.bus
            .publish(EventKind::ThreadUpdated, entity_payload(&thread))
            .await;
        Ok(thread)
    }

    // -- Thread messages ---------------------------------------------------

    /// Persist a message. Ids are dense and monotonic **per thread**;
    /// client-supplied `sent_at` more than 5 minutes from server time is
    /// clamped to server time.
    pub async fn create_thread_message(
        &self,
        new: NewThreadMessage,
    ) -> Result<ThreadMessage, StoreError> {
        let now = Utc::now();
        let sent_at = match new.sent_at {
            Some(client_ts) => {
                let delta = (client_ts - now).num_seconds().abs();
                if delta > SENT_AT_CLAMP {
                    now
                } else {
                    client_ts
                }
            }
            None => now,
        };
        let (message, agent_id, owner_id) = {
            let mut t = self.tables.write().await;
            let agent_id = t
                .threads
                .iter()
                .find(|th| th.id == new.thread_id)
                .map(|th| th.agent_id)
                .ok_or(StoreError::NotFound("thread", new.thread_id))?;
            let owner_id = t
                .agents
                .iter()
                .find(|a| a.id == agent_id)
                .map(|a| a.owner_id)
                .ok_or(StoreError::NotFound("agent", agent_id))?;
            let counter = t.seq.thread_messages.entry(new.thread_id).or_insert(0);
            *counter += 1;
            let message = ThreadMessage {
                id: *counter,
                thread_id: new.thread_id,
                role: new.role,
                content: new.content,
                tool_calls: new.tool_calls,
                tool_call_id: new.tool_call_id,
                name: new.name,
                sent_at,
                processed: new.processed,
                parent_id: new.parent_id,
                message_metadata: new.message_metadata,
            };
            t.messages.push(message.clone());
            (message, agent_id, owner_id)
        };
        self.bus
            .publish(
                EventKind::ThreadMessageCreated,
                json!({
                    "message": message,
                    "thread_id": message.thread_id,
                    "agent_id": agent_id,
                    "owner_id": owner_id,
                }),
            )
            .await;
        Ok(message)
    }

    /// Full thread history, ordered by the monotonic message id.
    pub async fn list_thread_messages(&self, thread_id: Id) -> Vec<ThreadMessage> {
        let t = self.tables.read().await;
        let mut rows: Vec<ThreadMessage> = t
            .messages
            .iter()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.id);
        rows
    }

    /// Mark every message in the thread with `id <= up_to` as processed.
    pub async fn mark_messages_processed(&self, thread_id: Id, up_to: Id) {
        let mut t = self.tables.write().await;
        for m in t
            .messages
            .iter_mut()
            .filter(|m| m.thread_id == thread_id && m.id <= up_to)
        {
            m.processed = true;
        }
    }

    // -- Agent runs --------------------------------------------------------

    pub async fn create_run(
        &self,
        agent_id: Id,
        thread_id: Id,
        trigger: RunTrigger,
    ) -> Result<AgentRun, StoreError> {
        let now = Utc::now();
        let run = {
            let mut t = self.tables.write().await;
            if !t.agents.iter().any(|a| a.id == agent_id) {
                return Err(StoreError::NotFound("agent", agent_id));
            }
            let run = AgentRun {
                id: Sequences::next(&mut t.seq.runs),
                agent_id,
                thread_id,
                trigger,
                status: RunStatus::Queued,
                started_at: None,
                finished_at: None,
                duration_ms: None,
                total_tokens: None,
                total_cost_usd: None,
                error: None,
                summary: None,
                created_at: now,
                updated_at: now,
            };
            t.runs.push(run.clone());
            run
        };
        self.bus
            .publish(EventKind::RunCreated, entity_payload(&run))
            .await;
        Ok(run)
    }

    pub async fn get_run(&self, id: Id) -> Result<AgentRun, StoreError> {
        let t = self.tables.read().await;
        t.runs
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound("run", id))
    }

    pub async fn list_runs(&self, agent_id: Id) -> Vec<AgentRun> {
        let t = self.tables.read().await;
        t.runs
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Move a run to RUNNING. Only legal from QUEUED.
    pub async fn mark_run_running(&self, id: Id) -> Result<AgentRun, StoreError> {
        let run = {
            let mut t = self.tables.write().await;
            let run = t
                .runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(StoreError::NotFound("run", id))?;
            if run.status != RunStatus::Queued {
                return Err(StoreError::Conflict(format!(
                    "run {} cannot transition {:?} -> RUNNING",
                    id, run.status
                )));
            }
            run.status = RunStatus::Running;
            run.started_at = Some(Utc::now());
            run.updated_at = Utc::now();
            run.clone()
        };
        self.bus
            .publish(EventKind::RunUpdated, entity_payload(&run))
            .await;
        Ok(run)
    }

    /// Terminate a run. Only legal from RUNNING; computes `duration_ms`.
    pub async fn finish_run(
        &self,
        id: Id,
        status: RunStatus,
        error: Option<String>,
        summary: Option<String>,
        total_tokens: Option<i64>,
    ) -> Result<AgentRun, StoreError> {
        if !matches!(status, RunStatus::Success | RunStatus::Failed) {
            return Err(StoreError::Validation(format!(
                "finish_run called with non-terminal status {:?}",
                status
            )));
        }
        let run = {
            let mut t = self.tables.write().await;
            let run = t
                .runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(StoreError::NotFound("run", id))?;
            if run.status != RunStatus::Running {
                return Err(StoreError::Conflict(format!(
                    "run {} cannot transition {:?} -> {:?}",
                    id, run.status, status
                )));
            }
            let now = Utc::now();
            run.status = status;
            run.finished_at = Some(now);
            run.duration_ms = run.started_at.map(|s| (now - s).num_milliseconds());
            run.error = error;
            run.summary = summary;
            run.total_tokens = total_tokens;
            run.updated_at = now;
            run.clone()
        };
        self.bus
            .publish(EventKind::RunUpdated, entity_payload(&run))
            .await;
        Ok(run)
    }

    // -- Triggers ----------------------------------------------------------

    pub async fn create_trigger(
        &self,
        agent_id: Id,
        trigger_type: &str,
        secret: &str,
        config: Map<String, Value>,
    ) -> Result<Trigger, StoreError> {
        let mut t = self.tables.write().await;
        if !t.agents.iter().any(|a| a.id == agent_id) {
            return Err(StoreError::NotFound("agent", agent_id));
        }
        if t.triggers.iter().any(|tr| tr.secret == secret) {
            return Err(StoreError::Conflict("trigger secret already in use".into()));
        }
        let trigger = Trigger {
            id: Sequences::next(&mut t.seq.triggers),
            agent_id,
            trigger_type: trigger_type.to_string(),
            secret: secret.to_string(),
            config,
            created_at: Utc::now(),
        };
        t.triggers.push(trigger.clone());
        Ok(trigger)
    }

    pub async fn get_trigger(&self, id: Id) -> Result<Trigger, StoreError> {
        let t = self.tables.read().await;
        t.triggers
            .iter()
            .find(|tr| tr.id == id)
            .cloned()
            .ok_or(StoreError::NotFound("trigger", id))
    }

    pub async fn list_triggers_by_type(&self, trigger_type: &str) -> Vec<Trigger> {
        let t = self.tables.read().await;
        t.triggers
            .iter()
            .filter(|tr| tr.trigger_type == trigger_type)
            .cloned()
            .collect()
    }

    /// Merge keys into a trigger's config (used to advance `history_id`).
    pub async fn update_trigger_config(
        &self,
        id: Id,
        patch: Map<String, Value>,
    ) -> Result<Trigger, StoreError> {
        let mut t = self.tables.write().await;
        let trigger = t
            .triggers
            .iter_mut()
            .find(|tr| tr.id == id)
            .ok_or(StoreError::NotFound("trigger", id))?;
        for (k, v) in patch {
            trigger.config.insert(k, v);
        }
        Ok(trigger.clone())
    }

    // -- Workflows ---------------------------------------------------------

    pub async fn create_workflow(
        &self,
        owner_id: Id,
        name: &str,
        description: Option<String>,
        canvas: WorkflowData,
        is_active: bool,
    ) -> Result<Workflow, StoreError> {
        let mut t = self.tables.write().await;
        if is_active
            && t.workflows
                .iter()
                .any(|w| w.is_active && w.owner_id == owner_id && w.name == name)
        {
            return Err(StoreError::Conflict(format!(
                "active workflow {:?} already exists for owner {}",
                name, owner_id
            )));
        }
        let workflow = Workflow {
            id: Sequences::next(&mut t.seq.workflows),
            owner_id,
            name: name.to_string(),
            description,
            canvas,
            is_active,
        };
        t.workflows.push(workflow.clone());
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: Id) -> Result<Workflow, StoreError> {
        let t = self.tables.read().await;
        t.workflows
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or(StoreError::NotFound("workflow", id))
    }

    // -- Workflow executions -----------------------------------------------

    /// Create an execution in WAITING. `attempt_no` counts prior executions
    /// of the same workflow.
    pub async fn create_execution(
        &self,
        workflow_id: Id,
        triggered_by: &str,
    ) -> Result<WorkflowExecution, StoreError> {
        let mut t = self.tables.write().await;
        if !t.workflows.iter().any(|w| w.id == workflow_id) {
            return Err(StoreError::NotFound("workflow", workflow_id));
        }
        let attempt_no = t
            .executions
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .count() as u32
            + 1;
        let execution = WorkflowExecution {
            id: Sequences::next(&mut t.seq.executions),
            workflow_id,
            phase: ExecutionPhase::Waiting,
            result: None,
            attempt_no,
            failure_kind: None,
            error_message: None,
            triggered_by: triggered_by.to_string(),
            started_at: None,
            finished_at: None,
            heartbeat_ts: None,
        };
        t.executions.push(execution.clone());
        Ok(execution)
    }

    pub async fn get_execution(&self, id: Id) -> Result<WorkflowExecution, StoreError> {
        let t = self.tables.read().await;
        t.executions
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(StoreError::NotFound("execution", id))
    }

    pub async fn mark_execution_running(&self, id: Id) -> Result<WorkflowExecution, StoreError> {
        let mut t = self.tables.write().await;
        let execution = t
            .executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound("execution", id))?;
        execution.phase = ExecutionPhase::Running;
        execution.started_at = Some(Utc::now());
        execution.heartbeat_ts = Some(Utc::now());
        Ok(execution.clone())
    }

    /// Terminate an execution. Enforces `FINISHED ⇔ result present`.
    pub async fn finish_execution(
        &self,
        id: Id,
        result: ExecutionResult,
        failure_kind: Option<FailureKind>,
        error_message: Option<String>,
    ) -> Result<WorkflowExecution, StoreError> {
        let mut t = self.tables.write().await;
        let execution = t
            .executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound("execution", id))?;
        execution.phase = ExecutionPhase::Finished;
        execution.result = Some(result);
        execution.failure_kind = failure_kind;
        execution.error_message = error_message;
        execution.finished_at = Some(Utc::now());
        Ok(execution.clone())
    }

    // -- Node execution states ----------------------------------------------

    /// Insert (or reset) the RUNNING record for a node.
    pub async fn start_node_state(
        &self,
        execution_id: Id,
        node_id: &str,
    ) -> Result<NodeExecutionState, StoreError> {
        let mut t = self.tables.write().await;
        if !t.executions.iter().any(|e| e.id == execution_id) {
            return Err(StoreError::NotFound("execution", execution_id));
        }
        let state = NodeExecutionState {
            id: Sequences::next(&mut t.seq.node_states),
            execution_id,
            node_id: node_id.to_string(),
            phase: ExecutionPhase::Running,
            result: None,
            output: None,
            error_message: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        };
        t.node_states
            .retain(|s| !(s.execution_id == execution_id && s.node_id == node_id));
        t.node_states.push(state.clone());
        Ok(state)
    }

    /// Terminate a node record. Enforces `FINISHED ⇔ result present`.
    pub async fn finish_node_state(
        &self,
        execution_id: Id,
        node_id: &str,
        result: ExecutionResult,
        output: Option<NodeEnvelope>,
        error_message: Option<String>,
    ) -> Result<NodeExecutionState, StoreError> {
        let mut t = self.tables.write().await;
        let state = t
            .node_states
            .iter_mut()
            .find(|s| s.execution_id == execution_id && s.node_id == node_id)
            .ok_or(StoreError::NotFound("execution", execution_id))?;
        state.phase = ExecutionPhase::Finished;
        state.result = Some(result);
        state.output = output;
        state.error_message = error_message;
        state.finished_at = Some(Utc::now());
        Ok(state.clone())
    }

    pub async fn get_node_state(
        &self,
        execution_id: Id,
        node_id: &str,
    ) -> Option<NodeExecutionState> {
        let t = self.tables.read().await;
        t.node_states
            .iter()
            .find(|s| s.execution_id == execution_id && s.node_id == node_id)
            .cloned()
    }

    pub async fn list_node_states(&self, execution_id: Id) -> Vec<NodeExecutionState> {
        let t = self.tables.read().await;
        t.node_states
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect()
    }

    // -- Worker jobs ---------------------------------------------------------

    pub async fn create_worker_job(
        &self,
        owner_id: Id,
        task: &str,
        model: &str,
    ) -> Result<WorkerJob, StoreError> {
        let mut t = self.tables.write().await;
        let job = WorkerJob {
            id: Sequences::next(&mut t.seq.worker_jobs),
            owner_id,
            task: task.to_string(),
            model: model.to_string(),
            status: WorkerStatus::Queued,
            worker_id: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        t.worker_jobs.push(job.clone());
        Ok(job)
    }

    pub async fn get_worker_job(&self, id: Id) -> Result<WorkerJob, StoreError> {
        let t = self.tables.read().await;
        t.worker_jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or(StoreError::NotFound("worker_job", id))
    }

    pub async fn list_worker_jobs(&self, owner_id: Id) -> Vec<WorkerJob> {
        let t = self.tables.read().await;
        t.worker_jobs
            .iter()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Update a worker job's status/ids/error. Terminal statuses stamp
    /// `finished_at`; RUNNING stamps `started_at`.
    pub async fn update_worker_job(
        &self,
        id: Id,
        status: Option<WorkerStatus>,
        worker_id: Option<String>,
        error: Option<String>,
    ) -> Result<WorkerJob, StoreError> {
        let mut t = self.tables.write().await;
        let job = t
            .worker_jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(StoreError::NotFound("worker_job", id))?;
        if let Some(status) = status {
            job.status = status;
            match status {
                WorkerStatus::Running => job.started_at = Some(Utc::now()),
                s if s.is_terminal() => job.finished_at = Some(Utc::now()),
                _ => {}
            }
        }
        if let Some(wid) = worker_id {
            job.worker_id = Some(wid);
        }
        if let Some(err) = error {
            job.error = Some(err);
        }
        Ok(job.clone())
    }

    // -- Admin primitives ----------------------------------------------------

    /// Current row counts per table.
    pub async fn table_counts(&self) -> BTreeMap<&'static str, usize> {
        let t = self.tables.read().await;
        let mut counts = BTreeMap::new();
        counts.insert("users", t.users.len());
        counts.insert("agents", t.agents.len());
        counts.insert("threads", t.threads.len());
        counts.insert("thread_messages", t.messages.len());
        counts.insert("agent_runs", t.runs.len());
        counts.insert("triggers", t.triggers.len());
        counts.insert("workflows", t.workflows.len());
        counts.insert("workflow_executions", t.executions.len());
        counts.insert("node_execution_states", t.node_states.len());
        counts.insert("worker_jobs", t.worker_jobs.len());
        counts
    }

    /// Truncate every table except `users`, restarting identity sequences.
    /// Never drops schema. Reports before/after counts per table.
    pub async fn clear_data(&self) -> ClearDataReport {
        let mut t = self.tables.write().await;
        let mut tables = BTreeMap::new();
        let mut cleared = 0usize;

        macro_rules! truncate {
            ($name:expr, $field:ident) => {{
                let before = t.$field.len();
                t.$field.clear();
                cleared += before;
                tables.insert($name, TableCounts { before, after: 0 });
            }};
        }

        tables.insert(
            "users",
            TableCounts {
                before: t.users.len(),
                after: t.users.len(),
            },
        );
        truncate!("agents", agents);
        truncate!("threads", threads);
        truncate!("thread_messages", messages);
        truncate!("agent_runs", runs);
        truncate!("triggers", triggers);
        truncate!("workflows", workflows);
        truncate!("workflow_executions", executions);
        truncate!("node_execution_states", node_states);
        truncate!("worker_jobs", worker_jobs);

        let users_seq = t.seq.users;
        t.seq = Sequences::default();
        t.seq.users = users_seq;

        ClearDataReport {
            tables,
            rows_cleared: cleared,
        }
    }

    /// Drop-and-recreate: every table including users, all sequences reset.
    /// The `timeout` bounds acquisition of the exclusive table lock; on
    /// expiry the caller sees [`StoreError::Locked`] and may retry.
    pub async fn rebuild_schema(
        &self,
        timeout: std::time::Duration,
    ) -> Result<(), StoreError> {
        let mut guard = tokio::time::timeout(timeout, self.tables.write())
            .await
            .map_err(|_| StoreError::Locked)?;
        *guard = Tables::default();
        Ok(())
    }
}

/// Deep-merge `patch` into `target`: nested maps merge recursively, sequences
/// are replaced wholesale, scalars overwrite. `null` removes the key.
pub fn deep_merge(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(&key);
            }
            Value::Object(incoming) => match target.get_mut(&key) {
                Some(Value::Object(existing)) => deep_merge(existing, incoming),
                _ => {
                    target.insert(key, Value::Object(incoming));
                }
            },
            other => {
                target.insert(key, other);
            }
        }
    }
}

fn entity_payload<T: serde::Serialize>(entity: &T) -> Value {
    serde_json::to_value(entity).unwrap_or(Value::Null)
}
