//! Core data model for the orchestration platform.
//!
//! Semantic types only — the storage shape lives in
//! [`store`](crate::overmind::store). Every type here is `serde`-derived so it
//! can cross the WebSocket boundary, land in artifact files, or be embedded in
//! event payloads without bespoke mapping code.
//!
//! Two envelope types are durable contracts and must not change shape
//! casually:
//!
//! - [`NodeEnvelope`] — the cross-node wire format of the workflow engine.
//!   Any reader outside the engine may rely on `output.value` and
//!   `output.meta`.
//! - The WebSocket envelope, defined in
//!   [`topic_manager`](crate::overmind::topic_manager).

use chrono::{DateTime, Utc};
use croner::parser::CronParser;
use croner::Cron;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row identifier used across all stored entities.
pub type Id = i64;

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Role attached to a [`User`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    User,
    Admin,
}

/// A platform account. `email` is unique case-insensitively.
///
/// `gmail_refresh_token` is stored encrypted at rest (see
/// [`crypto::SecretBox`](crate::overmind::crypto::SecretBox)); the field here
/// carries the sealed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub email: String,
    pub role: UserRole,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    /// Free-form UI preferences. Deep-merge semantics on PATCH.
    pub prefs: Map<String, Value>,
    /// Sealed OAuth refresh token, if Gmail triggers are connected.
    pub gmail_refresh_token: Option<String>,
    /// Arbitrary per-user context (≤ 64 KiB serialized). Deep-merge on PATCH.
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Lifecycle status of an [`Agent`]. Only the task runner (and the agent
/// runner it invokes) transitions this; everything else observes via events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Running,
    Error,
}

/// A configured LLM persona with tools, instructions, and an optional
/// crontab schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Id,
    pub owner_id: Id,
    pub name: String,
    /// System prompt prepended to every thread turn.
    pub system_instructions: String,
    /// Seed message used when the agent is launched by schedule or trigger.
    pub task_instructions: String,
    /// Provider model identifier (e.g. `"gpt-4o"`). Opaque to the core.
    pub model: String,
    pub status: AgentStatus,
    /// Standard 5-field crontab, or `None` for unscheduled agents.
    /// Validated via [`validate_cron`] on persist.
    pub schedule: Option<String>,
    pub config: Map<String, Value>,
    /// Ordered tool-name patterns (exact or `prefix*`). `None`/empty = all.
    pub allowed_tools: Option<Vec<String>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validate a crontab expression: standard 5-field, with an optional leading
/// seconds field (the scheduler accepts both).
///
/// Returns the parsed [`Cron`] so callers can derive the next occurrence
/// without re-parsing.
pub fn validate_cron(expression: &str) -> Result<Cron, String> {
    CronParser::new()
        .parse(expression)
        .map_err(|e| format!("invalid cron expression {:?}: {}", expression, e))
}

// ---------------------------------------------------------------------------
// Threads & messages
// ---------------------------------------------------------------------------

/// How a [`Thread`] came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadType {
    Chat,
    Schedule,
    Manual,
}

/// An ordered conversation with one agent. At most one thread per agent is
/// `active`; activating one deactivates its siblings atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Id,
    pub agent_id: Id,
    pub title: String,
    pub active: bool,
    /// Engine-private scratch state (memory strategies etc.).
    pub agent_state: Map<String, Value>,
    pub memory_strategy: String,
    pub thread_type: ThreadType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Author role of a [`ThreadMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call recorded on an assistant message, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Correlation id matched by the follow-up tool message.
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One message in a thread.
///
/// The monotonic `id` IS the authoritative chronological order; clients must
/// never reorder by `sent_at`. Server-assigned ids are dense per thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: Id,
    pub thread_id: Id,
    pub role: MessageRole,
    pub content: String,
    /// Tool calls requested by an assistant message, ordered.
    pub tool_calls: Vec<ToolCallRecord>,
    /// For `role = tool`: the assistant tool call this responds to.
    pub tool_call_id: Option<String>,
    /// For `role = tool`: the tool's name.
    pub name: Option<String>,
    /// UTC send time. Client-supplied values are clamped to ±5 min of server
    /// time on persist.
    pub sent_at: DateTime<Utc>,
    /// Whether a runner turn has consumed this message.
    pub processed: bool,
    pub parent_id: Option<Id>,
    pub message_metadata: Option<Map<String, Value>>,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// What caused an [`AgentRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunTrigger {
    Manual,
    Schedule,
    Api,
    Webhook,
}

impl RunTrigger {
    /// Parse the lowercase wire form used in `TRIGGER_FIRED` payloads.
    /// Unknown values fall back to `Webhook` (compatibility default — the
    /// scheduler logs when it happens).
    pub fn from_wire(value: &str) -> RunTrigger {
        match value.to_ascii_lowercase().as_str() {
            "manual" => RunTrigger::Manual,
            "schedule" => RunTrigger::Schedule,
            "api" => RunTrigger::Api,
            _ => RunTrigger::Webhook,
        }
    }
}

/// Status of an [`AgentRun`]. Transitions: QUEUED → RUNNING → (SUCCESS |
/// FAILED); no other edges. Enforced by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

/// A single execution instance of an agent over a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Id,
    pub agent_id: Id,
    pub thread_id: Id,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub total_tokens: Option<i64>,
    pub total_cost_usd: Option<f64>,
    pub error: Option<String>,
    /// First assistant message of the run, text-only, ≤ 500 chars.
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// An external event source that fires an agent (webhook, email, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Id,
    pub agent_id: Id,
    /// `"webhook"`, `"email"`, etc. Open set — new providers register
    /// without a schema change.
    pub trigger_type: String,
    /// Shared secret presented by the caller. Unique across triggers.
    pub secret: String,
    /// Provider-specific configuration (`history_id`, `filters`,
    /// `watch_expiry`, ...).
    pub config: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// Node kind inside a workflow canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Trigger,
    Tool,
    Agent,
    Conditional,
}

/// Canvas position. Semantically irrelevant to execution; round-trips so the
/// editor never loses layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One node of a workflow canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub position: Position,
    pub config: Map<String, Value>,
}

/// One edge of a workflow canvas. Edges out of a conditional node carry
/// `config.branch ∈ {"true","false"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from_node_id: String,
    pub to_node_id: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl WorkflowEdge {
    /// The `branch` label on this edge, if any.
    pub fn branch(&self) -> Option<&str> {
        self.config.get("branch").and_then(|v| v.as_str())
    }
}

/// The stored canvas: nodes plus edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowData {
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

/// A DAG of nodes composing agents, tools, conditionals and triggers.
/// `(owner_id, name)` is unique among active workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Id,
    pub owner_id: Id,
    pub name: String,
    pub description: Option<String>,
    pub canvas: WorkflowData,
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Phase of a workflow execution or node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPhase {
    Waiting,
    Running,
    Finished,
}

/// Terminal result. Present exactly when the phase is FINISHED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionResult {
    Success,
    Failure,
}

/// Failure classification for terminal events and retries policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Validation,
    System,
}

/// One execution of a [`Workflow`].
///
/// Hard constraint: `phase == Finished ⇔ result.is_some()`. The store
/// rejects writes that would violate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Id,
    pub workflow_id: Id,
    pub phase: ExecutionPhase,
    pub result: Option<ExecutionResult>,
    pub attempt_no: u32,
    pub failure_kind: Option<FailureKind>,
    pub error_message: Option<String>,
    /// `"manual"`, `"schedule"`, `"webhook"`, ...
    pub triggered_by: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_ts: Option<DateTime<Utc>>,
}

/// Metadata half of a [`NodeEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub phase: ExecutionPhase,
    pub result: Option<ExecutionResult>,
    pub node_type: NodeType,
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Id>,
    /// Open extension point; extra keys survive round-trips.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The cross-node wire format. All node outputs MUST be envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEnvelope {
    pub value: Value,
    pub meta: EnvelopeMeta,
}

impl NodeEnvelope {
    /// Wrap a successful node value.
    pub fn success(value: Value, node_type: NodeType, node_id: &str) -> Self {
        Self {
            value,
            meta: EnvelopeMeta {
                phase: ExecutionPhase::Finished,
                result: Some(ExecutionResult::Success),
                node_type,
                node_id: node_id.to_string(),
                tool_name: None,
                agent_id: None,
                extra: Map::new(),
            },
        }
    }
}

/// Per-node execution record. Same phase/result model (and constraint) as
/// [`WorkflowExecution`], plus the output envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionState {
    pub id: Id,
    pub execution_id: Id,
    pub node_id: String,
    pub phase: ExecutionPhase,
    pub result: Option<ExecutionResult>,
    pub output: Option<NodeEnvelope>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Worker jobs
// ---------------------------------------------------------------------------

/// Status of a background worker job. Lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl WorkerStatus {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerStatus::Success | WorkerStatus::Failed | WorkerStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Queued => "queued",
            WorkerStatus::Running => "running",
            WorkerStatus::Success => "success",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Cancelled => "cancelled",
        }
    }
}

/// A long-running background job spawned by the supervisor agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub id: Id,
    pub owner_id: Id,
    pub task: String,
    pub model: String,
    pub status: WorkerStatus,
    /// Artifact-store identifier, `"<compact-utc-timestamp>_<slug>"`.
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
