//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use overmind::overmind::agent_runner::AgentRunner;
use overmind::overmind::client_wrapper::{
    ClientFactory, ClientWrapper, Message, NativeToolCall, ScriptedClient, ToolDefinition,
};
use overmind::overmind::config::Config;
use overmind::overmind::event_bus::EventBus;
use overmind::overmind::models::*;
use overmind::overmind::store::Store;
use overmind::overmind::tool_protocol::{Tool, ToolError, ToolRegistry};
use serde_json::{json, Value};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Everything a test needs, freshly constructed per case.
pub struct Harness {
    pub bus: Arc<EventBus>,
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub registry: Arc<RwLock<ToolRegistry>>,
    pub runner: Arc<AgentRunner>,
}

/// Build a harness around the given client script and tool set.
pub fn harness(script: Vec<Message>, tools: Vec<Arc<dyn Tool>>) -> Harness {
    harness_with_client(Arc::new(ScriptedClient::new(script)), tools)
}

pub fn harness_with_client(
    client: Arc<dyn ClientWrapper>,
    tools: Vec<Arc<dyn Tool>>,
) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(Store::new(Arc::clone(&bus), "test-key"));
    let config = Arc::new(Config::for_testing());
    let registry = Arc::new(RwLock::new(ToolRegistry::with_builtins(tools)));
    let runner = Arc::new(AgentRunner::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::new(FixedFactory { client }),
        Arc::clone(&config),
    ));
    Harness {
        bus,
        store,
        config,
        registry,
        runner,
    }
}

pub async fn seed_agent(store: &Store) -> (User, Agent) {
    let user = store
        .create_user("owner@example.com", UserRole::User, None)
        .await
        .unwrap();
    let agent = store
        .create_agent(
            user.id,
            "Helper",
            "You are a helpful agent.",
            "Do the daily task.",
            "gpt-4o",
            None,
        )
        .await
        .unwrap();
    (user, agent)
}

/// Assistant message that requests tool calls.
pub fn assistant_with_tools(content: &str, calls: Vec<(&str, &str, Value)>) -> Message {
    Message {
        role: overmind::overmind::client_wrapper::Role::Assistant,
        content: content.to_string(),
        tool_calls: calls
            .into_iter()
            .map(|(id, name, arguments)| NativeToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            })
            .collect(),
    }
}

/// A factory handing the same client to every agent.
pub struct FixedFactory {
    pub client: Arc<dyn ClientWrapper>,
}

impl ClientFactory for FixedFactory {
    fn client_for(&self, _agent: &Agent) -> Arc<dyn ClientWrapper> {
        Arc::clone(&self.client)
    }
}

/// Client that never answers within a test's lifetime. Used to keep a worker
/// visibly "running" while monitors poll.
pub struct StalledClient;

#[async_trait]
impl ClientWrapper for StalledClient {
    async fn send_message(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Message::assistant("unreachable"))
    }

    fn model_name(&self) -> &str {
        "stalled"
    }
}

/// Tool returning a fixed value.
pub struct FixedTool {
    pub tool_name: &'static str,
    pub value: Value,
}

#[async_trait]
impl Tool for FixedTool {
    fn name(&self) -> &str {
        self.tool_name
    }
    fn description(&self) -> &str {
        "returns a fixed value"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn run(&self, _args: Value) -> Result<Value, ToolError> {
        Ok(self.value.clone())
    }
}

/// Tool that always fails with a fixed error message.
pub struct FailingTool {
    pub tool_name: &'static str,
    pub error: &'static str,
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        self.tool_name
    }
    fn description(&self) -> &str {
        "always fails"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn run(&self, _args: Value) -> Result<Value, ToolError> {
        Err(ToolError::ExecutionFailed(self.error.to_string()))
    }
}

/// Tool that sleeps before answering (sync, runs on the blocking pool).
pub struct SlowTool {
    pub tool_name: &'static str,
    pub delay: Duration,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        self.tool_name
    }
    fn description(&self) -> &str {
        "answers slowly"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn run(&self, _args: Value) -> Result<Value, ToolError> {
        std::thread::sleep(self.delay);
        Ok(json!({"done": true}))
    }
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
