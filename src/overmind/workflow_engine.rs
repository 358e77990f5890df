//! Workflow execution engine.
//!
//! Executes a validated [`ExecutionGraph`] with node-level parallelism:
//! every node whose live in-edges are satisfied runs as its own task, and
//! outputs merge into shared state through commutative reducers
//! (`node_outputs` merge-on-write, `completed_nodes` concatenation, `error`
//! first-non-null), so parallel branches may finish in any order.
//!
//! # Node executor protocol
//!
//! For each node the engine:
//!
//! 1. inserts a [`NodeExecutionState`] with phase RUNNING and publishes
//!    `NODE_STATE_CHANGED`;
//! 2. resolves `${...}` variables inside the node config (string
//!    interpolation inside strings, structural for maps and sequences);
//! 3. runs the node kind;
//! 4. wraps the value in a [`NodeEnvelope`] (FINISHED/SUCCESS), persists it,
//!    and publishes `NODE_STATE_CHANGED` again;
//! 5. on failure records FINISHED/FAILURE with the error message, publishes,
//!    and the engine terminates the whole execution as FAILURE.
//!
//! Conditional routing: the branch named by the node's output routes to the
//! first out-edge labelled with that branch; anything else routes to END.
//! The unchosen branch — and every node reachable only through it — is
//! skipped, never executed.
//!
//! # Background mode
//!
//! [`WorkflowEngine::start_in_background`] registers the task under the
//! execution id; [`WorkflowEngine::wait_for_completion`] returns `false` on
//! timeout while the task keeps running, and [`WorkflowEngine::shutdown`]
//! waits up to 30 s before cancelling stragglers.

use crate::overmind::agent_runner::AgentRunner;
use crate::overmind::event_bus::{EventBus, EventKind};
use crate::overmind::models::*;
use crate::overmind::store::{NewThreadMessage, Store};
use crate::overmind::tool_protocol::ToolRegistry;
use crate::overmind::workflow::{build_graph, ExecutionGraph, WorkflowError};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

/// How long `shutdown` waits before cancelling outstanding executions.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Shared execution state behind the reducers.
#[derive(Default)]
struct ExecState {
    node_outputs: HashMap<String, NodeEnvelope>,
    completed_nodes: Vec<String>,
    error: Option<String>,
}

enum NodeOutcome {
    Completed {
        node_id: String,
        envelope: NodeEnvelope,
    },
    Failed {
        node_id: String,
        error: String,
        kind: FailureKind,
    },
}

struct RunningExecution {
    handle: JoinHandle<()>,
    done_rx: watch::Receiver<bool>,
}

/// The workflow execution engine. Shared as `Arc<WorkflowEngine>`.
pub struct WorkflowEngine {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    registry: Arc<RwLock<ToolRegistry>>,
    runner: Arc<AgentRunner>,
    running: StdMutex<HashMap<Id, RunningExecution>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        registry: Arc<RwLock<ToolRegistry>>,
        runner: Arc<AgentRunner>,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            runner,
            running: StdMutex::new(HashMap::new()),
        }
    }

    /// Execute a workflow in-request and return the execution id. Node and
    /// engine failures are recorded on the execution (FINISHED/FAILURE), not
    /// raised; only a missing workflow or a store failure errors out.
    pub async fn execute_workflow(
        self: &Arc<Self>,
        workflow_id: Id,
        trigger_type: &str,
    ) -> Result<Id, WorkflowError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(|e| WorkflowError::NotFound(e.to_string()))?;
        let execution = self
            .store
            .create_execution(workflow_id, trigger_type)
            .await
            .map_err(|e| WorkflowError::System(e.to_string()))?;
        Arc::clone(self).run_execution(workflow, execution.id).await;
        Ok(execution.id)
    }

    /// Execute a workflow on a background task registered under the
    /// execution id. Returns immediately with the id.
    pub async fn start_in_background(
        self: &Arc<Self>,
        workflow_id: Id,
        trigger_type: &str,
    ) -> Result<Id, WorkflowError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(|e| WorkflowError::NotFound(e.to_string()))?;
        let execution = self
            .store
            .create_execution(workflow_id, trigger_type)
            .await
            .map_err(|e| WorkflowError::System(e.to_string()))?;
        let execution_id = execution.id;

        let (done_tx, done_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.run_execution(workflow, execution_id).await;
            let _ = done_tx.send(true);
        });

        self.running
            .lock()
            .unwrap()
            .insert(execution_id, RunningExecution { handle, done_rx });
        Ok(execution_id)
    }

    /// Wait for a background execution. `true` when the execution is done;
    /// `false` on timeout (the task continues running).
    pub async fn wait_for_completion(&self, execution_id: Id, timeout: Option<Duration>) -> bool {
        let mut rx = {
            let running = self.running.lock().unwrap();
            match running.get(&execution_id) {
                Some(entry) => entry.done_rx.clone(),
                None => {
                    drop(running);
                    // Not registered: consult the durable record.
                    return match self.store.get_execution(execution_id).await {
                        Ok(e) => e.phase == ExecutionPhase::Finished,
                        Err(_) => false,
                    };
                }
            }
        };

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if *rx.borrow() {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    match tokio::time::timeout(remaining, rx.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return *rx.borrow(),
                        Err(_) => return false,
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        return *rx.borrow();
                    }
                }
            }
        }
    }

    /// Execution ids with a live background task.
    pub fn get_running_executions(&self) -> Vec<Id> {
        self.running
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| !*entry.done_rx.borrow())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Wait up to 30 s for background executions, then cancel stragglers.
    pub async fn shutdown(&self) {
        let entries: Vec<(Id, RunningExecution)> = {
            let mut running = self.running.lock().unwrap();
            running.drain().collect()
        };
        if entries.is_empty() {
            return;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for (id, entry) in entries {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let mut rx = entry.done_rx.clone();
            let finished = *rx.borrow()
                || tokio::time::timeout(remaining, rx.changed()).await.is_ok();
            if !finished {
                log::warn!("cancelling workflow execution {} on shutdown", id);
                entry.handle.abort();
            }
        }
    }

    // -- Execution core ----------------------------------------------------

    async fn run_execution(self: Arc<Self>, workflow: Workflow, execution_id: Id) {
        let started = match self.store.mark_execution_running(execution_id).await {
            Ok(e) => e.started_at.unwrap_or_else(Utc::now),
            Err(e) => {
                log::error!("execution {} could not start: {}", execution_id, e);
                return;
            }
        };

        let graph = match build_graph(&workflow.canvas) {
            Ok(graph) => graph,
            Err(e) => {
                self.finish(
                    execution_id,
                    workflow.id,
                    started,
                    ExecutionResult::Failure,
                    Some(FailureKind::Validation),
                    Some(e.to_string()),
                )
                .await;
                return;
            }
        };

        // A workflow with zero nodes finishes immediately.
        if graph.node_count() == 0 {
            self.finish(
                execution_id,
                workflow.id,
                started,
                ExecutionResult::Success,
                None,
                None,
            )
            .await;
            return;
        }

        let state = Arc::new(StdMutex::new(ExecState::default()));
        let (tx, mut rx) = mpsc::unbounded_channel::<NodeOutcome>();

        let mut live_in: HashMap<String, usize> = graph.in_degree.clone();
        let mut activated: HashMap<String, usize> =
            graph.nodes.keys().map(|id| (id.clone(), 0)).collect();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut running = 0usize;
        let mut completed_count = 0usize;
        let total = graph.node_count();
        let mut failure: Option<(String, String, FailureKind)> = None;

        for node_id in &graph.start_nodes {
            let node = graph.nodes[node_id].clone();
            handles.push(self.spawn_node(execution_id, node, Arc::clone(&state), tx.clone()));
            running += 1;
        }

        while running > 0 {
            let outcome = match rx.recv().await {
                Some(outcome) => outcome,
                None => break,
            };
            running -= 1;

            match outcome {
                NodeOutcome::Failed {
                    node_id,
                    error,
                    kind,
                } => {
                    failure = Some((node_id, error, kind));
                    break;
                }
                NodeOutcome::Completed { node_id, envelope } => {
                    completed_count += 1;
                    self.bus
                        .publish(
                            EventKind::WorkflowProgress,
                            json!({
                                "execution_id": execution_id,
                                "node_id": node_id,
                                "completed": completed_count,
                                "total": total,
                            }),
                        )
                        .await;

                    let node = &graph.nodes[&node_id];
                    let edges = graph
                        .out_edges
                        .get(&node_id)
                        .cloned()
                        .unwrap_or_default();

                    // Partition out-edges into activated and voided.
                    let chosen: Option<usize> = if node.node_type == NodeType::Conditional {
                        envelope
                            .value
                            .get("branch")
                            .and_then(|v| v.as_str())
                            .and_then(|branch| {
                                edges.iter().position(|e| e.branch() == Some(branch))
                            })
                    } else {
                        None
                    };

                    let mut voided: VecDeque<String> = VecDeque::new();
                    for (idx, edge) in edges.iter().enumerate() {
                        let is_live = node.node_type != NodeType::Conditional
                            || Some(idx) == chosen;
                        if is_live {
                            *activated.get_mut(&edge.to_node_id).unwrap() += 1;
                        }
                        let remaining = live_in.get_mut(&edge.to_node_id).unwrap();
                        *remaining -= 1;
                        if *remaining == 0 {
                            if activated[&edge.to_node_id] > 0 {
                                if !skipped.contains(&edge.to_node_id) {
                                    let next = graph.nodes[&edge.to_node_id].clone();
                                    handles.push(self.spawn_node(
                                        execution_id,
                                        next,
                                        Arc::clone(&state),
                                        tx.clone(),
                                    ));
                                    running += 1;
                                }
                            } else {
                                voided.push_back(edge.to_node_id.clone());
                            }
                        }
                    }

                    // Propagate skips: a node reachable only through voided
                    // edges never runs, and voids its own out-edges in turn.
                    while let Some(dead) = voided.pop_front() {
                        if !skipped.insert(dead.clone()) {
                            continue;
                        }
                        if let Some(edges) = graph.out_edges.get(&dead) {
                            for edge in edges {
                                let remaining = live_in.get_mut(&edge.to_node_id).unwrap();
                                *remaining = remaining.saturating_sub(1);
                                if *remaining == 0 {
                                    if activated[&edge.to_node_id] > 0 {
                                        if !skipped.contains(&edge.to_node_id) {
                                            let next = graph.nodes[&edge.to_node_id].clone();
                                            handles.push(self.spawn_node(
                                                execution_id,
                                                next,
                                                Arc::clone(&state),
                                                tx.clone(),
                                            ));
                                            running += 1;
                                        }
                                    } else {
                                        voided.push_back(edge.to_node_id.clone());
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        if failure.is_some() {
            for handle in &handles {
                handle.abort();
            }
        }

        match failure {
            Some((node_id, error, kind)) => {
                self.finish(
                    execution_id,
                    workflow.id,
                    started,
                    ExecutionResult::Failure,
                    Some(kind),
                    Some(format!("node {} failed: {}", node_id, error)),
                )
                .await;
            }
            None => {
                let error = state.lock().unwrap().error.clone();
                match error {
                    Some(error) => {
                        self.finish(
                            execution_id,
                            workflow.id,
                            started,
                            ExecutionResult::Failure,
                            Some(FailureKind::System),
                            Some(error),
                        )
                        .await;
                    }
                    None => {
                        self.finish(
                            execution_id,
                            workflow.id,
                            started,
                            ExecutionResult::Success,
                            None,
                            None,
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        execution_id: Id,
        workflow_id: Id,
        started: chrono::DateTime<Utc>,
        result: ExecutionResult,
        failure_kind: Option<FailureKind>,
        error_message: Option<String>,
    ) {
        if let Err(e) = self
            .store
            .finish_execution(execution_id, result, failure_kind, error_message.clone())
            .await
        {
            log::error!("could not finish execution {}: {}", execution_id, e);
        }
        let duration_ms = (Utc::now() - started).num_milliseconds().max(0);
        self.bus
            .publish(
                EventKind::ExecutionFinished,
                json!({
                    "execution_id": execution_id,
                    "workflow_id": workflow_id,
                    "phase": ExecutionPhase::Finished,
                    "result": result,
                    "duration_ms": duration_ms,
                    "error_message": error_message,
                }),
            )
            .await;
    }

    fn spawn_node(
        self: &Arc<Self>,
        execution_id: Id,
        node: WorkflowNode,
        state: Arc<StdMutex<ExecState>>,
        tx: mpsc::UnboundedSender<NodeOutcome>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.execute_node(execution_id, node, state, tx).await;
        })
    }

    async fn execute_node(
        self: Arc<Self>,
        execution_id: Id,
        node: WorkflowNode,
        state: Arc<StdMutex<ExecState>>,
        tx: mpsc::UnboundedSender<NodeOutcome>,
    ) {
        if let Err(e) = self.store.start_node_state(execution_id, &node.id).await {
            let _ = tx.send(NodeOutcome::Failed {
                node_id: node.id.clone(),
                error: e.to_string(),
                kind: FailureKind::System,
            });
            return;
        }
        self.bus
            .publish(
                EventKind::NodeStateChanged,
                json!({
                    "execution_id": execution_id,
                    "node_id": node.id,
                    "phase": ExecutionPhase::Running,
                }),
            )
            .await;

        let outputs_snapshot = state.lock().unwrap().node_outputs.clone();
        let resolved = resolve_variables(
            &Value::Object(node.config.clone()),
            &outputs_snapshot,
        );
        let resolved_config = resolved.as_object().cloned().unwrap_or_default();

        let result = self
            .run_node_kind(execution_id, &node, &resolved_config, &outputs_snapshot)
            .await;

        match result {
            Ok(value) => {
                let mut envelope = NodeEnvelope::success(value, node.node_type, &node.id);
                envelope.meta.tool_name = resolved_config
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                envelope.meta.agent_id = resolved_config
                    .get("agent_id")
                    .and_then(value_as_id);

                if let Err(e) = self
                    .store
                    .finish_node_state(
                        execution_id,
                        &node.id,
                        ExecutionResult::Success,
                        Some(envelope.clone()),
                        None,
                    )
                    .await
                {
                    log::error!("node state persist failed for {}: {}", node.id, e);
                }

                {
                    let mut s = state.lock().unwrap();
                    s.node_outputs.insert(node.id.clone(), envelope.clone());
                    s.completed_nodes.push(node.id.clone());
                }

                self.bus
                    .publish(
                        EventKind::NodeStateChanged,
                        json!({
                            "execution_id": execution_id,
                            "node_id": node.id,
                            "phase": ExecutionPhase::Finished,
                            "result": ExecutionResult::Success,
                            "output": envelope,
                        }),
                    )
                    .await;

                let _ = tx.send(NodeOutcome::Completed {
                    node_id: node.id.clone(),
                    envelope,
                });
            }
            Err(e) => {
                let error = e.to_string();
                let kind = match e {
                    WorkflowError::Validation(_) => FailureKind::Validation,
                    _ => FailureKind::System,
                };
                log::error!("node {} failed: {}", node.id, error);
                if let Err(persist) = self
                    .store
                    .finish_node_state(
                        execution_id,
                        &node.id,
                        ExecutionResult::Failure,
                        None,
                        Some(error.clone()),
                    )
                    .await
                {
                    log::error!("node state persist failed for {}: {}", node.id, persist);
                }
                {
                    let mut s = state.lock().unwrap();
                    if s.error.is_none() {
                        s.error = Some(error.clone());
                    }
                }
                self.bus
                    .publish(
                        EventKind::NodeStateChanged,
                        json!({
                            "execution_id": execution_id,
                            "node_id": node.id,
                            "phase": ExecutionPhase::Finished,
                            "result": ExecutionResult::Failure,
                            "error": error,
                        }),
                    )
                    .await;
                let _ = tx.send(NodeOutcome::Failed {
                    node_id: node.id.clone(),
                    error,
                    kind,
                });
            }
        }
    }

    async fn run_node_kind(
        &self,
        execution_id: Id,
        node: &WorkflowNode,
        resolved_config: &Map<String, Value>,
        outputs: &HashMap<String, NodeEnvelope>,
    ) -> Result<Value, WorkflowError> {
        match node.node_type {
            NodeType::Trigger => Ok(json!({ "triggered": true })),
            NodeType::Tool => {
                let tool_name = resolved_config
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        WorkflowError::Validation(format!(
                            "tool node {} missing tool_name",
                            node.id
                        ))
                    })?;
                let params = resolved_config
                    .get("static_params")
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                let tool = {
                    let registry = self.registry.read().await;
                    registry.get_tool(tool_name).ok_or_else(|| {
                        WorkflowError::Validation(format!("tool {:?} not found", tool_name))
                    })?
                };
                // Tool nodes use the synchronous form, off the event loop.
                let handle = tokio::task::spawn_blocking(move || tool.run(params));
                let output = handle
                    .await
                    .map_err(|e| WorkflowError::System(format!("tool task panicked: {}", e)))?
                    .map_err(|e| WorkflowError::System(e.to_string()))?;
                Ok(output)
            }
            NodeType::Agent => {
                let agent_id = resolved_config
                    .get("agent_id")
                    .and_then(value_as_id)
                    .ok_or_else(|| {
                        WorkflowError::Validation(format!(
                            "agent node {} missing agent_id",
                            node.id
                        ))
                    })?;
                let message = resolved_config
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Execute this task")
                    .to_string();

                let thread = self
                    .store
                    .create_thread(
                        agent_id,
                        &format!("Workflow execution {}", execution_id),
                        ThreadType::Manual,
                        false,
                    )
                    .await
                    .map_err(|e| WorkflowError::System(e.to_string()))?;
                self.store
                    .create_thread_message(NewThreadMessage::simple(
                        thread.id,
                        MessageRole::User,
                        message,
                    ))
                    .await
                    .map_err(|e| WorkflowError::System(e.to_string()))?;
                let run = self
                    .store
                    .create_run(agent_id, thread.id, RunTrigger::Api)
                    .await
                    .map_err(|e| WorkflowError::System(e.to_string()))?;

                let created = self
                    .runner
                    .run_thread(agent_id, thread.id, run.id, None)
                    .await
                    .map_err(|e| WorkflowError::System(e.to_string()))?;

                Ok(json!({
                    "agent_id": agent_id,
                    "thread_id": thread.id,
                    "messages": created,
                    "messages_created": created.len(),
                }))
            }
            NodeType::Conditional => {
                let condition = resolved_config
                    .get("condition")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        WorkflowError::Validation(format!(
                            "conditional node {} missing condition",
                            node.id
                        ))
                    })?;
                let condition_type = resolved_config
                    .get("condition_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("expression");
                let result = evaluate_condition(condition, condition_type, outputs)?;
                Ok(json!({
                    "result": result,
                    "branch": if result { "true" } else { "false" },
                }))
            }
        }
    }
}

fn value_as_id(value: &Value) -> Option<Id> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Variable interpolation
// ---------------------------------------------------------------------------

/// Resolve `${...}` references inside a config value against prior node
/// outputs. Maps and sequences are traversed structurally; strings are
/// interpolated in place. Unresolved variables stay literal and log a
/// warning.
pub fn resolve_variables(data: &Value, outputs: &HashMap<String, NodeEnvelope>) -> Value {
    match data {
        Value::String(s) => Value::String(resolve_string(s, outputs)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_variables(v, outputs)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| resolve_variables(v, outputs)).collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(input: &str, outputs: &HashMap<String, NodeEnvelope>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                match lookup_path(path, outputs) {
                    Some(value) => result.push_str(&stringify(&value)),
                    None => {
                        log::warn!("unresolved workflow variable ${{{}}}", path);
                        result.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// Resolve a dotted path (`node`, `node.value.a.b`, `node.meta.key`) against
/// the envelopes of completed nodes. Numeric components index sequences.
pub fn lookup_path(path: &str, outputs: &HashMap<String, NodeEnvelope>) -> Option<Value> {
    let mut segments = path.split('.');
    let node_id = segments.next()?;
    let envelope = outputs.get(node_id)?;
    let mut current = serde_json::to_value(envelope).ok()?;
    for segment in segments {
        current = match current {
            Value::Object(mut map) => map.remove(segment)?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().ok()?;
                if index >= items.len() {
                    return None;
                }
                items.swap_remove(index)
            }
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Evaluate a conditional node's condition after variable substitution.
///
/// `expression` supports `==, !=, <, <=, >, >=` over numeric or quoted-string
/// operands; `exists` checks whether a dotted path resolves.
pub fn evaluate_condition(
    condition: &str,
    condition_type: &str,
    outputs: &HashMap<String, NodeEnvelope>,
) -> Result<bool, WorkflowError> {
    match condition_type {
        "expression" => {
            // Two-char operators first so ">=" never splits as ">".
            const OPERATORS: &[&str] = &[">=", "<=", "==", "!=", ">", "<"];
            for op in OPERATORS {
                if let Some(idx) = condition.find(op) {
                    let left = strip_quotes(condition[..idx].trim());
                    let right = strip_quotes(condition[idx + op.len()..].trim());
                    return compare(left, right, op);
                }
            }
            // No operator: truthiness of the single operand.
            let operand = strip_quotes(condition.trim());
            if let Ok(n) = operand.parse::<f64>() {
                return Ok(n != 0.0);
            }
            Ok(!operand.is_empty() && operand != "false")
        }
        "exists" => Ok(lookup_path(condition.trim(), outputs)
            .map(|v| !v.is_null())
            .unwrap_or(false)),
        other => Err(WorkflowError::Validation(format!(
            "unsupported condition type {:?}",
            other
        ))),
    }
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"'))
            || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn compare(left: &str, right: &str, op: &str) -> Result<bool, WorkflowError> {
    let left_num = left.parse::<f64>();
    let right_num = right.parse::<f64>();

    match (left_num, right_num) {
        (Ok(l), Ok(r)) => Ok(match op {
            "==" => (l - r).abs() < f64::EPSILON,
            "!=" => (l - r).abs() >= f64::EPSILON,
            ">" => l > r,
            "<" => l < r,
            ">=" => l >= r,
            "<=" => l <= r,
            _ => unreachable!(),
        }),
        _ => match op {
            "==" => Ok(left == right),
            "!=" => Ok(left != right),
            _ => Err(WorkflowError::Validation(format!(
                "operator {:?} requires numeric operands, got {:?} and {:?}",
                op, left, right
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(node_id: &str, value: Value) -> NodeEnvelope {
        NodeEnvelope::success(value, NodeType::Tool, node_id)
    }

    fn outputs() -> HashMap<String, NodeEnvelope> {
        let mut map = HashMap::new();
        map.insert(
            "tool-1".to_string(),
            envelope("tool-1", json!({"score": 95, "grade": "A"})),
        );
        map.insert(
            "tool-complex".to_string(),
            envelope(
                "tool-complex",
                json!({
                    "analysis": {
                        "metrics": {"accuracy": 0.95, "precision": 0.87},
                        "summary": "High performance",
                        "tags": ["production-ready", "validated"]
                    },
                    "metadata": {"version": "2.1.0"}
                }),
            ),
        );
        map
    }

    #[test]
    fn test_string_interpolation_with_nested_paths() {
        let outputs = outputs();
        let resolved = resolve_string(
            "score=${tool-1.value.score} acc=${tool-complex.value.analysis.metrics.accuracy} v${tool-complex.value.metadata.version}",
            &outputs,
        );
        assert_eq!(resolved, "score=95 acc=0.95 v2.1.0");
    }

    #[test]
    fn test_numeric_path_components_index_sequences() {
        let outputs = outputs();
        let resolved = resolve_string("tag=${tool-complex.value.analysis.tags.0}", &outputs);
        assert_eq!(resolved, "tag=production-ready");
    }

    #[test]
    fn test_unresolved_variables_stay_literal() {
        let outputs = outputs();
        let resolved = resolve_string("x=${ghost.value.y}", &outputs);
        assert_eq!(resolved, "x=${ghost.value.y}");
    }

    #[test]
    fn test_meta_paths_resolve() {
        let outputs = outputs();
        let resolved = resolve_string("${tool-1.meta.node_id}", &outputs);
        assert_eq!(resolved, "tool-1");
    }

    #[test]
    fn test_structural_resolution_of_maps_and_lists() {
        let outputs = outputs();
        let config = json!({
            "static_params": {"score": "${tool-1.value.score}"},
            "list": ["${tool-1.value.grade}"]
        });
        let resolved = resolve_variables(&config, &outputs);
        assert_eq!(resolved["static_params"]["score"], "95");
        assert_eq!(resolved["list"][0], "A");
    }

    #[test]
    fn test_expression_conditions() {
        let outputs = outputs();
        assert!(evaluate_condition("95 >= 90", "expression", &outputs).unwrap());
        assert!(!evaluate_condition("0.87 > 0.9", "expression", &outputs).unwrap());
        assert!(evaluate_condition("\"A\" == \"A\"", "expression", &outputs).unwrap());
        assert!(evaluate_condition("'A' != 'B'", "expression", &outputs).unwrap());
        assert!(evaluate_condition("0.95 > 0.9", "expression", &outputs).unwrap());
    }

    #[test]
    fn test_ordering_on_strings_is_a_validation_error() {
        let outputs = outputs();
        assert!(matches!(
            evaluate_condition("\"abc\" > 5", "expression", &outputs),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn test_exists_condition() {
        let outputs = outputs();
        assert!(evaluate_condition("tool-1.value.score", "exists", &outputs).unwrap());
        assert!(!evaluate_condition("tool-1.value.missing", "exists", &outputs).unwrap());
        assert!(!evaluate_condition("ghost", "exists", &outputs).unwrap());
    }

    #[test]
    fn test_unknown_condition_type_is_validation_error() {
        let outputs = outputs();
        assert!(matches!(
            evaluate_condition("x", "fuzzy", &outputs),
            Err(WorkflowError::Validation(_))
        ));
    }
}
