//! Provider-agnostic LLM client seam.
//!
//! The agent runner talks to language models exclusively through the
//! [`ClientWrapper`] trait and the lightweight data types in this module.
//! Provider transports (OpenAI, Anthropic, Gemini, local inference, ...) are
//! external collaborators: the embedding application implements
//! [`ClientWrapper`] and supplies a [`ClientFactory`] that maps an agent row
//! to a client. The core ships only [`ScriptedClient`], a deterministic
//! double used by tests and local development.
//!
//! # Native tool calls
//!
//! [`ClientWrapper::send_message`] receives the resolved tool set as
//! [`ToolDefinition`]s and may return an assistant [`Message`] carrying
//! [`NativeToolCall`]s. Tool results flow back as `Role::Tool` messages
//! correlated by `call_id`.
//!
//! # Streaming
//!
//! [`ClientWrapper::send_message_stream`] yields [`MessageChunk`]s. Providers
//! without streaming inherit the default implementation which resolves to
//! `Ok(None)`; the runner then falls back to the non-streaming path. The
//! runner decides whether to even attempt streaming by reading the
//! configuration flag **at invocation time**.

use crate::overmind::models::{Agent, MessageRole, ThreadMessage};
use async_trait::async_trait;
use futures_util::stream::Stream;
use serde_json::Value;
use std::collections::VecDeque;
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Role of a chat message on the provider wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// System priming message.
    System,
    /// End-user (or seeded task) message.
    User,
    /// Model output, possibly carrying tool calls.
    Assistant,
    /// Tool result correlated with a prior assistant [`NativeToolCall`].
    Tool { call_id: String },
}

impl Role {
    /// Map a stored thread-message role onto the wire role.
    pub fn from_message(message: &ThreadMessage) -> Role {
        match message.role {
            MessageRole::System => Role::System,
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
            MessageRole::Tool => Role::Tool {
                call_id: message.tool_call_id.clone().unwrap_or_default(),
            },
        }
    }
}

/// A single tool call returned by the LLM in a native function-calling
/// response. The provider-assigned `id` correlates the follow-up tool result.
#[derive(Debug, Clone)]
pub struct NativeToolCall {
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments supplied by the LLM for this call.
    pub arguments: Value,
}

/// Provider-agnostic tool schema passed along with a chat request.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: Value,
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Clone, Debug, Default)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// A generic chat message exchanged with an LLM.
#[derive(Clone, Debug)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Native tool calls requested by the assistant. Non-empty only on
    /// assistant messages returned by [`ClientWrapper::send_message`].
    pub tool_calls: Vec<NativeToolCall>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// A chunk of content in a streaming response.
#[derive(Clone, Debug)]
pub struct MessageChunk {
    /// Incremental content delta; may be empty on bookkeeping chunks.
    pub content: String,
    /// Provider-specific completion status (e.g. `"stop"`), when final.
    pub finish_reason: Option<String>,
}

/// Stream of message chunks compatible with `Send` executors.
pub type MessageChunkStream =
    Pin<Box<dyn Stream<Item = Result<MessageChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Trait defining the interface to an LLM provider.
///
/// Implementations must be `Send + Sync` so clients can be shared between
/// tasks. Providers that report billing data should keep the most recent
/// usage reachable via [`get_last_usage`](ClientWrapper::get_last_usage).
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Full request/response chat completion. `tools` carries the resolved
    /// tool set; when the provider selects tools, the returned assistant
    /// message has non-empty [`Message::tool_calls`].
    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error + Send + Sync>>;

    /// Streaming variant. `Ok(None)` means "no streaming support" and the
    /// caller falls back to [`send_message`](ClientWrapper::send_message).
    async fn send_message_stream(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Option<MessageChunkStream>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }

    /// Identifier of the upstream model (e.g. `"gpt-4o"`).
    fn model_name(&self) -> &str;

    /// Usage from the most recent [`send_message`](ClientWrapper::send_message).
    async fn get_last_usage(&self) -> Option<TokenUsage> {
        None
    }
}

/// Maps an agent row to a concrete client. The embedding application decides
/// providers, API keys and model routing; the core never sees any of it.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, agent: &Agent) -> Arc<dyn ClientWrapper>;
}

/// Deterministic client double used by tests and local development.
///
/// Responses are scripted in order; once the script is exhausted it echoes a
/// fixed completion so ReAct loops terminate.
///
/// # Example
///
/// ```rust
/// use overmind::overmind::client_wrapper::{ClientWrapper, Message, ScriptedClient};
///
/// let client = ScriptedClient::new(vec![Message::assistant("All done.")]);
/// assert_eq!(client.model_name(), "scripted");
/// ```
pub struct ScriptedClient {
    script: Mutex<VecDeque<Message>>,
    usage: Mutex<Option<TokenUsage>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<Message>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            usage: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn send_message(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        let mut usage = self.usage.lock().await;
        let input_tokens = messages.iter().map(|m| m.content.len() / 4).sum();
        let response = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Message::assistant("Done."));
        let output_tokens = response.content.len() / 4;
        *usage = Some(TokenUsage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        });
        Ok(response)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn get_last_usage(&self) -> Option<TokenUsage> {
        self.usage.lock().await.clone()
    }
}

/// Factory that hands the same scripted client to every agent.
pub struct ScriptedFactory {
    client: Arc<ScriptedClient>,
}

impl ScriptedFactory {
    pub fn new(client: Arc<ScriptedClient>) -> Self {
        Self { client }
    }
}

impl ClientFactory for ScriptedFactory {
    fn client_for(&self, _agent: &Agent) -> Arc<dyn ClientWrapper> {
        Arc::clone(&self.client) as Arc<dyn ClientWrapper>
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_client_plays_responses_in_order() {
        let client = ScriptedClient::new(vec![
            Message::assistant("first"),
            Message::assistant("second"),
        ]);
        let history = [Message::user("hi")];
        assert_eq!(
            client.send_message(&history, None).await.unwrap().content,
            "first"
        );
        assert_eq!(
            client.send_message(&history, None).await.unwrap().content,
            "second"
        );
        // Exhausted scripts echo a terminal completion.
        assert_eq!(
            client.send_message(&history, None).await.unwrap().content,
            "Done."
        );
        assert!(client.get_last_usage().await.is_some());
    }
}
