//! ReAct-style agent run loop.
//!
//! [`AgentRunner::run_thread`] executes one agent turn over a thread: it
//! calls the LLM with the accumulated history, persists the assistant
//! message, fans out any requested tool calls **in parallel**, feeds the
//! results back, and loops until the model produces an assistant message
//! with no tool calls. All messages created during the turn are persisted in
//! order and returned.
//!
//! # Events
//!
//! Every tool call emits `WORKER_TOOL_STARTED` followed by exactly one of
//! `WORKER_TOOL_COMPLETED` / `WORKER_TOOL_FAILED` for the same
//! `tool_call_id`. Run and agent state changes surface as `RUN_UPDATED` /
//! `AGENT_UPDATED` through the store.
//!
//! # Failure model
//!
//! Tool failures are **in-band**: the LLM sees a tool message containing
//! `<tool-error> ...` and can reason about recovery. Only inside a worker
//! context (set by the supervisor) do *critical* errors fail fast: the loop
//! breaks with a synthesized assistant message and the run is completed
//! normally — the worker harness then reports the failure.
//!
//! # Streaming
//!
//! The streaming flag is read from [`Config`] at invocation time. When
//! enabled and the client supports it, every chunk is forwarded to the
//! registered [`TokenSink`] (the WebSocket topic manager routes it to
//! `user:<owner_id>`).

use crate::overmind::client_wrapper::{
    ClientFactory, Message, NativeToolCall, Role, ToolDefinition,
};
use crate::overmind::config::Config;
use crate::overmind::event_bus::{EventBus, EventKind};
use crate::overmind::models::*;
use crate::overmind::store::{AgentUpdate, NewThreadMessage, Store};
use crate::overmind::tool_protocol::{ainvoke_tool, ToolRegistry};
use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use std::error::Error;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Replacement for redacted argument values.
const REDACTED: &str = "***REDACTED***";

/// Maximum length of a run summary.
const SUMMARY_MAX_CHARS: usize = 500;

/// Maximum length of a formatted critical-error message.
const CRITICAL_ERROR_MAX_CHARS: usize = 300;

/// Sink for streamed LLM tokens. Implemented by the WebSocket topic manager.
pub trait TokenSink: Send + Sync {
    fn emit_token(&self, owner_id: Id, thread_id: Id, token: &str);
}

/// Mutable context shared between the supervisor and a worker's run loop.
///
/// The runner records critical tool errors here; the supervisor reads the
/// message to build the worker's failure report.
pub struct WorkerContext {
    pub worker_id: String,
    pub job_id: Id,
    critical: Mutex<Option<String>>,
}

impl WorkerContext {
    pub fn new(worker_id: impl Into<String>, job_id: Id) -> Self {
        Self {
            worker_id: worker_id.into(),
            job_id,
            critical: Mutex::new(None),
        }
    }

    /// Record a critical error. The first message wins.
    pub fn mark_critical_error(&self, message: impl Into<String>) {
        let mut slot = self.critical.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    pub fn has_critical_error(&self) -> bool {
        self.critical.lock().unwrap().is_some()
    }

    pub fn critical_error_message(&self) -> Option<String> {
        self.critical.lock().unwrap().clone()
    }
}

/// Executes agent turns. Safe to call concurrently for different threads;
/// exactly-once per `(thread, run)` is the caller's contract (runs cannot
/// re-enter RUNNING).
pub struct AgentRunner {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    registry: Arc<RwLock<ToolRegistry>>,
    clients: Arc<dyn ClientFactory>,
    config: Arc<Config>,
    token_sink: std::sync::RwLock<Option<Arc<dyn TokenSink>>>,
}

impl AgentRunner {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        registry: Arc<RwLock<ToolRegistry>>,
        clients: Arc<dyn ClientFactory>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            clients,
            config,
            token_sink: std::sync::RwLock::new(None),
        }
    }

    /// Attach the token sink after construction (the topic manager is built
    /// later in the startup sequence).
    pub fn set_token_sink(&self, sink: Arc<dyn TokenSink>) {
        *self.token_sink.write().unwrap() = Some(sink);
    }

    /// Run one agent turn over `thread_id`, driving the QUEUED run `run_id`
    /// to a terminal state. Returns the messages created during the turn.
    pub async fn run_thread(
        &self,
        agent_id: Id,
        thread_id: Id,
        run_id: Id,
        worker_ctx: Option<Arc<WorkerContext>>,
    ) -> Result<Vec<ThreadMessage>, Box<dyn Error + Send + Sync>> {
        let agent = self.store.get_agent(agent_id).await?;
        self.store.mark_run_running(run_id).await?;
        self.store
            .update_agent(
                agent_id,
                AgentUpdate {
                    status: Some(AgentStatus::Running),
                    ..AgentUpdate::default()
                },
            )
            .await?;

        let outcome = self
            .run_loop(&agent, thread_id, worker_ctx.clone())
            .await;

        match outcome {
            Ok((created, total_tokens)) => {
                let summary = extract_summary(&created);
                self.store
                    .finish_run(run_id, RunStatus::Success, None, summary, total_tokens)
                    .await?;
                self.store
                    .update_agent(
                        agent_id,
                        AgentUpdate {
                            status: Some(AgentStatus::Idle),
                            ..AgentUpdate::default()
                        },
                    )
                    .await?;
                if let Some(last) = created.last() {
                    self.store
                        .mark_messages_processed(thread_id, last.id)
                        .await;
                }
                Ok(created)
            }
            Err(e) => {
                let message = e.to_string();
                self.store
                    .finish_run(run_id, RunStatus::Failed, Some(message.clone()), None, None)
                    .await?;
                self.store
                    .update_agent(
                        agent_id,
                        AgentUpdate {
                            status: Some(AgentStatus::Error),
                            last_error: Some(Some(message)),
                            ..AgentUpdate::default()
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_loop(
        &self,
        agent: &Agent,
        thread_id: Id,
        worker_ctx: Option<Arc<WorkerContext>>,
    ) -> Result<(Vec<ThreadMessage>, Option<i64>), Box<dyn Error + Send + Sync>> {
        let history = self.store.list_thread_messages(thread_id).await;

        let mut wire: Vec<Message> = Vec::with_capacity(history.len() + 1);
        if !agent.system_instructions.is_empty() {
            wire.push(Message::system(&agent.system_instructions));
        }
        for m in &history {
            wire.push(to_wire_message(m));
        }

        let (tools, tool_defs) = {
            let registry = self.registry.read().await;
            let tools = registry.filter_by_allowlist(agent.allowed_tools.as_deref());
            let defs: Vec<ToolDefinition> = tools
                .iter()
                .map(|t| ToolDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters_schema: t.parameters_schema(),
                })
                .collect();
            (tools, defs)
        };
        let client = self.clients.client_for(agent);

        let mut created: Vec<ThreadMessage> = Vec::new();
        let mut total_tokens: i64 = 0;

        loop {
            let defs = if tool_defs.is_empty() {
                None
            } else {
                Some(tool_defs.clone())
            };

            // The streaming flag is read here, per invocation, on purpose.
            let assistant = if self.config.llm_token_stream() {
                match client.send_message_stream(&wire, defs.clone()).await? {
                    Some(stream) => {
                        self.consume_stream(agent.owner_id, thread_id, stream)
                            .await?
                    }
                    None => client.send_message(&wire, defs).await?,
                }
            } else {
                client.send_message(&wire, defs).await?
            };

            if let Some(usage) = client.get_last_usage().await {
                total_tokens += usage.total_tokens as i64;
            }

            if assistant.tool_calls.is_empty() {
                let persisted = self
                    .store
                    .create_thread_message(NewThreadMessage {
                        processed: true,
                        ..NewThreadMessage::simple(
                            thread_id,
                            MessageRole::Assistant,
                            assistant.content.clone(),
                        )
                    })
                    .await?;
                created.push(persisted);
                break;
            }

            // Persist the assistant message with its ordered tool calls.
            let records: Vec<ToolCallRecord> = assistant
                .tool_calls
                .iter()
                .map(|tc| ToolCallRecord {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                })
                .collect();
            let persisted = self
                .store
                .create_thread_message(NewThreadMessage {
                    tool_calls: records,
                    processed: true,
                    ..NewThreadMessage::simple(
                        thread_id,
                        MessageRole::Assistant,
                        assistant.content.clone(),
                    )
                })
                .await?;
            created.push(persisted);
            wire.push(assistant.clone());

            // Fan out every tool call; join_all preserves request order.
            let futures = assistant
                .tool_calls
                .iter()
                .map(|tc| self.execute_tool_call(agent, thread_id, tc, &tools, worker_ctx.as_ref()));
            let results = join_all(futures).await;

            for (tc, content) in assistant.tool_calls.iter().zip(results) {
                let persisted = self
                    .store
                    .create_thread_message(NewThreadMessage {
                        tool_call_id: Some(tc.id.clone()),
                        name: Some(tc.name.clone()),
                        processed: true,
                        ..NewThreadMessage::simple(thread_id, MessageRole::Tool, content.clone())
                    })
                    .await?;
                created.push(persisted);
                wire.push(Message {
                    role: Role::Tool {
                        call_id: tc.id.clone(),
                    },
                    content,
                    tool_calls: Vec::new(),
                });
            }

            // Fail fast on critical tool errors inside a worker context.
            if let Some(ctx) = &worker_ctx {
                if ctx.has_critical_error() {
                    let detail = ctx.critical_error_message().unwrap_or_default();
                    let content = format!(
                        "I encountered a critical error that prevents me from completing this task:\n\n{}",
                        detail
                    );
                    log::warn!(
                        "worker {} stopping due to critical error: {}",
                        ctx.worker_id,
                        detail
                    );
                    let persisted = self
                        .store
                        .create_thread_message(NewThreadMessage {
                            processed: true,
                            ..NewThreadMessage::simple(thread_id, MessageRole::Assistant, content)
                        })
                        .await?;
                    created.push(persisted);
                    break;
                }
            }
        }

        let tokens = if total_tokens > 0 {
            Some(total_tokens)
        } else {
            None
        };
        Ok((created, tokens))
    }

    /// Execute one tool call with event emission. Returns the in-band tool
    /// message content (result JSON, or `<tool-error> ...` on failure).
    async fn execute_tool_call(
        &self,
        agent: &Agent,
        thread_id: Id,
        call: &NativeToolCall,
        tools: &[Arc<dyn crate::overmind::tool_protocol::Tool>],
        worker_ctx: Option<&Arc<WorkerContext>>,
    ) -> String {
        let redacted_args = redact_sensitive(call.arguments.clone());
        let base = json!({
            "tool_call_id": call.id,
            "tool_name": call.name,
            "agent_id": agent.id,
            "thread_id": thread_id,
            "owner_id": agent.owner_id,
            "worker_id": worker_ctx.map(|c| c.worker_id.clone()),
            "args": redacted_args,
            "ts": Utc::now().timestamp_millis(),
        });
        self.bus
            .publish(EventKind::WorkerToolStarted, base.clone())
            .await;

        let tool = tools.iter().find(|t| t.name() == call.name).cloned();
        let result = match tool {
            Some(tool) => ainvoke_tool(tool, call.arguments.clone()).await,
            None => Err(crate::overmind::tool_protocol::ToolError::NotFound(
                call.name.clone(),
            )),
        };

        match result {
            Ok(value) => {
                let mut payload = base.clone();
                payload["result"] = redact_sensitive(value.clone());
                self.bus
                    .publish(EventKind::WorkerToolCompleted, payload)
                    .await;
                serde_json::to_string(&value).unwrap_or_else(|_| value.to_string())
            }
            Err(e) => {
                let error = e.to_string();
                let content = format!("<tool-error> {}", error);
                let mut payload = base;
                payload["error"] = Value::from(error.clone());
                self.bus.publish(EventKind::WorkerToolFailed, payload).await;

                if let Some(ctx) = worker_ctx {
                    if is_critical_error(&content, Some(&error)) {
                        let formatted = format_critical_error(&call.name, &content);
                        log::error!(
                            "critical tool error in worker {}: {}",
                            ctx.worker_id,
                            formatted
                        );
                        ctx.mark_critical_error(formatted);
                    }
                }
                content
            }
        }
    }

    async fn consume_stream(
        &self,
        owner_id: Id,
        thread_id: Id,
        mut stream: crate::overmind::client_wrapper::MessageChunkStream,
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        let sink = self.token_sink.read().unwrap().clone();
        let mut content = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.content.is_empty() {
                if let Some(sink) = &sink {
                    sink.emit_token(owner_id, thread_id, &chunk.content);
                }
                content.push_str(&chunk.content);
            }
        }
        Ok(Message::assistant(content))
    }
}

/// Convert a stored thread message into its provider wire form.
fn to_wire_message(message: &ThreadMessage) -> Message {
    Message {
        role: Role::from_message(message),
        content: message.content.clone(),
        tool_calls: message
            .tool_calls
            .iter()
            .map(|tc| NativeToolCall {
                id: tc.id.clone(),
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            })
            .collect(),
    }
}

/// Extract the run summary: first assistant message without tool calls,
/// truncated to 500 chars with a trailing `…` when cut.
fn extract_summary(created: &[ThreadMessage]) -> Option<String> {
    let first = created
        .iter()
        .find(|m| m.role == MessageRole::Assistant && m.tool_calls.is_empty())?;
    let text = first.content.trim();
    if text.is_empty() {
        return None;
    }
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        Some(text.to_string())
    } else {
        let truncated: String = text.chars().take(SUMMARY_MAX_CHARS - 1).collect();
        Some(format!("{}…", truncated))
    }
}

/// Hide sensitive values in tool arguments before they reach events or logs.
/// Any key whose lowercased name contains `password`, `token`, `secret`,
/// `key` or `credential` is masked, recursively.
pub fn redact_sensitive(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let lowered = k.to_ascii_lowercase();
                let sensitive = ["password", "token", "secret", "key", "credential"]
                    .iter()
                    .any(|needle| lowered.contains(needle));
                if sensitive {
                    out.insert(k, Value::from(REDACTED));
                } else {
                    out.insert(k, redact_sensitive(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive).collect())
        }
        other => other,
    }
}

/// Classify whether a tool error should stop a worker immediately.
///
/// Critical errors are configuration/infrastructure problems that will not
/// resolve by continuing; transient failures stay in-band so the LLM can
/// reason about them. Matching is a case-insensitive substring scan over the
/// combined result content and extracted error message.
pub fn is_critical_error(result_content: &str, error_msg: Option<&str>) -> bool {
    let combined = format!(
        "{} {}",
        result_content.to_lowercase(),
        error_msg.unwrap_or("").to_lowercase()
    );

    const CONFIG_INDICATORS: &[&str] = &[
        "not configured",
        "no ssh key",
        "ssh key not found",
        "not connected",
        "not found in path",
        "ssh client not found",
        "connector_not_configured",
        "invalid_credentials",
        "credentials have expired",
    ];
    if CONFIG_INDICATORS.iter().any(|i| combined.contains(i)) {
        return true;
    }

    if combined.contains("permission_denied") || combined.contains("permission denied") {
        return true;
    }

    if combined.contains("execution_error") {
        if ["ssh", "connection", "host", "unreachable"]
            .iter()
            .any(|term| combined.contains(term))
        {
            return true;
        }
    }

    if combined.contains("validation_error") {
        return true;
    }

    const TRANSIENT_INDICATORS: &[&str] = &[
        "timeout",
        "timed out",
        "rate_limited",
        "rate limit",
        "temporarily unavailable",
    ];
    if TRANSIENT_INDICATORS.iter().any(|i| combined.contains(i)) {
        return false;
    }

    false
}

/// Format a critical error for the synthesized assistant message.
///
/// Prefers a `user_message` field when the content parses as JSON; otherwise
/// strips the `<tool-error>` prefix and truncates.
pub fn format_critical_error(tool_name: &str, error_content: &str) -> String {
    if error_content.contains("user_message") {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(error_content) {
            if let Some(user_msg) = map.get("user_message").and_then(|v| v.as_str()) {
                return format!("Tool '{}' failed: {}", tool_name, user_msg);
            }
        }
    }

    let cleaned = error_content.replace("<tool-error>", "");
    let cleaned = cleaned.trim();
    if cleaned.chars().count() > CRITICAL_ERROR_MAX_CHARS {
        let truncated: String = cleaned.chars().take(CRITICAL_ERROR_MAX_CHARS - 3).collect();
        format!("Tool '{}' failed: {}...", tool_name, truncated)
    } else {
        format!("Tool '{}' failed: {}", tool_name, cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_critical() {
        assert!(is_critical_error("tool returned: not configured", None));
        assert!(is_critical_error("", Some("SSH key not found")));
        assert!(is_critical_error("connector_not_configured", None));
        assert!(is_critical_error("invalid_credentials for jira", None));
    }

    #[test]
    fn test_permission_and_validation_are_critical() {
        assert!(is_critical_error("permission_denied", None));
        assert!(is_critical_error("Permission denied by host", None));
        assert!(is_critical_error(
            "validation_error: missing field 'token'",
            None
        ));
    }

    #[test]
    fn test_execution_error_needs_connectivity_term() {
        assert!(is_critical_error("execution_error: host unreachable", None));
        assert!(!is_critical_error("execution_error: exit code 3", None));
    }

    #[test]
    fn test_transient_errors_are_not_critical() {
        assert!(!is_critical_error("request timed out", None));
        assert!(!is_critical_error("rate limit exceeded", None));
        assert!(!is_critical_error("service temporarily unavailable", None));
    }

    #[test]
    fn test_unknown_errors_default_to_non_critical() {
        assert!(!is_critical_error("something odd happened", None));
    }

    #[test]
    fn test_format_critical_error_prefers_user_message() {
        let content = r#"{"code": "connector_not_configured", "user_message": "Connect GitHub first"}"#;
        assert_eq!(
            format_critical_error("github_tool", content),
            "Tool 'github_tool' failed: Connect GitHub first"
        );
    }

    #[test]
    fn test_format_critical_error_strips_prefix_and_truncates() {
        let formatted = format_critical_error("t", "<tool-error> boom");
        assert_eq!(formatted, "Tool 't' failed: boom");

        let long = format!("<tool-error> {}", "x".repeat(400));
        let formatted = format_critical_error("t", &long);
        assert!(formatted.ends_with("..."));
        assert!(formatted.len() < 400);
    }

    #[test]
    fn test_redaction_masks_sensitive_keys_recursively() {
        let args = json!({
            "query": "ok",
            "api_token": "abc",
            "nested": {"Password": "hunter2", "keep": 1},
            "list": [{"secret_key": "s"}]
        });
        let redacted = redact_sensitive(args);
        assert_eq!(redacted["query"], "ok");
        assert_eq!(redacted["api_token"], REDACTED);
        assert_eq!(redacted["nested"]["Password"], REDACTED);
        assert_eq!(redacted["nested"]["keep"], 1);
        assert_eq!(redacted["list"][0]["secret_key"], REDACTED);
    }

    #[test]
    fn test_summary_truncation() {
        let long = "a".repeat(600);
        let msg = ThreadMessage {
            id: 1,
            thread_id: 1,
            role: MessageRole::Assistant,
            content: long,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            sent_at: Utc::now(),
            processed: true,
            parent_id: None,
            message_metadata: None,
        };
        let summary = extract_summary(&[msg]).unwrap();
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS);
        assert!(summary.ends_with('…'));
    }
}
