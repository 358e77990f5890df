//! Agent runner integration tests: the ReAct loop over a real store and bus.

mod common;

use common::*;
use overmind::overmind::client_wrapper::Message;
use overmind::overmind::event_bus::{listener, EventKind};
use overmind::overmind::models::*;
use overmind::overmind::store::NewThreadMessage;
use serde_json::json;
use std::sync::{Arc, Mutex};

async fn seeded_thread(h: &Harness) -> (User, Agent, Thread, AgentRun) {
    let (user, agent) = seed_agent(&h.store).await;
    let thread = h
        .store
        .create_thread(agent.id, "chat", ThreadType::Chat, true)
        .await
        .unwrap();
    h.store
        .create_thread_message(NewThreadMessage::simple(
            thread.id,
            MessageRole::User,
            "please compute",
        ))
        .await
        .unwrap();
    let run = h
        .store
        .create_run(agent.id, thread.id, RunTrigger::Manual)
        .await
        .unwrap();
    (user, agent, thread, run)
}

#[tokio::test]
async fn test_loop_until_no_tool_calls() {
    let h = harness(
        vec![
            assistant_with_tools(
                "",
                vec![("call_1", "grading_tool", json!({"assignment": "final"}))],
            ),
            Message::assistant("The grade is A."),
        ],
        vec![Arc::new(FixedTool {
            tool_name: "grading_tool",
            value: json!({"score": 95, "grade": "A"}),
        })],
    );
    let (_user, agent, thread, run) = seeded_thread(&h).await;

    let created = h
        .runner
        .run_thread(agent.id, thread.id, run.id, None)
        .await
        .unwrap();

    // assistant(tool call) -> tool result -> final assistant
    assert_eq!(created.len(), 3);
    assert_eq!(created[0].role, MessageRole::Assistant);
    assert_eq!(created[0].tool_calls.len(), 1);
    assert_eq!(created[1].role, MessageRole::Tool);
    assert_eq!(created[1].tool_call_id.as_deref(), Some("call_1"));
    assert!(created[1].content.contains("95"));
    assert_eq!(created[2].role, MessageRole::Assistant);
    assert!(created[2].tool_calls.is_empty());

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.summary.as_deref(), Some("The grade is A."));
    assert!(run.duration_ms.unwrap() >= 0);

    let agent = h.store.get_agent(agent.id).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
}

#[tokio::test]
async fn test_message_ids_are_the_chronological_order() {
    let h = harness(
        vec![
            assistant_with_tools("", vec![("c1", "grading_tool", json!({}))]),
            Message::assistant("done"),
        ],
        vec![Arc::new(FixedTool {
            tool_name: "grading_tool",
            value: json!({"ok": true}),
        })],
    );
    let (_user, agent, thread, run) = seeded_thread(&h).await;
    h.runner
        .run_thread(agent.id, thread.id, run.id, None)
        .await
        .unwrap();

    let messages = h.store.list_thread_messages(thread.id).await;
    let ids: Vec<Id> = messages.iter().map(|m| m.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    // Dense per thread: 1..=n.
    assert_eq!(ids, (1..=ids.len() as Id).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_tool_failure_is_in_band_and_run_succeeds() {
    let h = harness(
        vec![
            assistant_with_tools("", vec![("c1", "flaky", json!({}))]),
            Message::assistant("I could not fetch the data, sorry."),
        ],
        vec![Arc::new(FailingTool {
            tool_name: "flaky",
            error: "upstream timed out",
        })],
    );
    let (_user, agent, thread, run) = seeded_thread(&h).await;
    let created = h
        .runner
        .run_thread(agent.id, thread.id, run.id, None)
        .await
        .unwrap();

    let tool_msg = created.iter().find(|m| m.role == MessageRole::Tool).unwrap();
    assert!(tool_msg.content.starts_with("<tool-error>"));
    assert!(tool_msg.content.contains("timed out"));

    // Transient failure: the run itself still completes.
    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn test_parallel_tool_calls_persist_in_request_order() {
    let h = harness(
        vec![
            assistant_with_tools(
                "",
                vec![
                    ("c1", "slow_tool", json!({})),
                    ("c2", "fast_tool", json!({})),
                ],
            ),
            Message::assistant("both done"),
        ],
        vec![
            Arc::new(SlowTool {
                tool_name: "slow_tool",
                delay: std::time::Duration::from_millis(100),
            }),
            Arc::new(FixedTool {
                tool_name: "fast_tool",
                value: json!({"fast": true}),
            }),
        ],
    );
    let (_user, agent, thread, run) = seeded_thread(&h).await;
    let created = h
        .runner
        .run_thread(agent.id, thread.id, run.id, None)
        .await
        .unwrap();

    // Even though fast_tool finishes first, persisted order follows the
    // request order of the assistant message.
    let tool_ids: Vec<&str> = created
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .map(|m| m.tool_call_id.as_deref().unwrap())
        .collect();
    assert_eq!(tool_ids, vec!["c1", "c2"]);
}

#[tokio::test]
async fn test_every_started_event_pairs_with_one_terminal_event() {
    let h = harness(
        vec![
            assistant_with_tools(
                "",
                vec![
                    ("c1", "grading_tool", json!({})),
                    ("c2", "flaky", json!({})),
                ],
            ),
            Message::assistant("done"),
        ],
        vec![
            Arc::new(FixedTool {
                tool_name: "grading_tool",
                value: json!({"ok": true}),
            }),
            Arc::new(FailingTool {
                tool_name: "flaky",
                error: "nope",
            }),
        ],
    );

    let events: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    for (kind, tag) in [
        (EventKind::WorkerToolStarted, "started"),
        (EventKind::WorkerToolCompleted, "completed"),
        (EventKind::WorkerToolFailed, "failed"),
    ] {
        let events = Arc::clone(&events);
        h.bus
            .subscribe(
                kind,
                listener(move |payload| {
                    let events = Arc::clone(&events);
                    async move {
                        let call_id = payload
                            .get("tool_call_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        events.lock().unwrap().push((call_id, tag.to_string()));
                        Ok(())
                    }
                }),
            )
            .await;
    }

    let (_user, agent, thread, run) = seeded_thread(&h).await;
    h.runner
        .run_thread(agent.id, thread.id, run.id, None)
        .await
        .unwrap();

    let events = events.lock().unwrap();
    for call_id in ["c1", "c2"] {
        let started = events
            .iter()
            .filter(|(id, tag)| id == call_id && tag == "started")
            .count();
        let terminal = events
            .iter()
            .filter(|(id, tag)| id == call_id && (tag == "completed" || tag == "failed"))
            .count();
        assert_eq!(started, 1, "call {}", call_id);
        assert_eq!(terminal, 1, "call {}", call_id);
    }
}

#[tokio::test]
async fn test_sensitive_arguments_are_redacted_in_events() {
    let h = harness(
        vec![
            assistant_with_tools(
                "",
                vec![(
                    "c1",
                    "grading_tool",
                    json!({"query": "x", "api_token": "secret-value"}),
                )],
            ),
            Message::assistant("done"),
        ],
        vec![Arc::new(FixedTool {
            tool_name: "grading_tool",
            value: json!({"ok": true}),
        })],
    );

    let captured: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let captured = Arc::clone(&captured);
        h.bus
            .subscribe(
                EventKind::WorkerToolStarted,
                listener(move |payload| {
                    let captured = Arc::clone(&captured);
                    async move {
                        captured.lock().unwrap().push(payload);
                        Ok(())
                    }
                }),
            )
            .await;
    }

    let (_user, agent, thread, run) = seeded_thread(&h).await;
    h.runner
        .run_thread(agent.id, thread.id, run.id, None)
        .await
        .unwrap();

    let captured = captured.lock().unwrap();
    let args = &captured[0]["args"];
    assert_eq!(args["query"], "x");
    assert_eq!(args["api_token"], "***REDACTED***");
    assert!(!captured[0].to_string().contains("secret-value"));
}

#[tokio::test]
async fn test_streaming_tokens_reach_the_sink() {
    use overmind::overmind::agent_runner::TokenSink;
    use overmind::overmind::client_wrapper::{MessageChunk, MessageChunkStream, ToolDefinition};

    struct StreamingClient;

    #[async_trait::async_trait]
    impl overmind::overmind::client_wrapper::ClientWrapper for StreamingClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Message::assistant("non-streamed"))
        }

        async fn send_message_stream(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Option<MessageChunkStream>, Box<dyn std::error::Error + Send + Sync>>
        {
            let chunks = vec!["All ", "tokens ", "arrived."].into_iter().map(|c| {
                Ok(MessageChunk {
                    content: c.to_string(),
                    finish_reason: None,
                })
            });
            Ok(Some(Box::pin(futures_util::stream::iter(chunks))))
        }

        fn model_name(&self) -> &str {
            "streaming"
        }
    }

    struct CollectingSink(Mutex<Vec<String>>);

    impl TokenSink for CollectingSink {
        fn emit_token(&self, _owner_id: Id, _thread_id: Id, token: &str) {
            self.0.lock().unwrap().push(token.to_string());
        }
    }

    let h = harness_with_client(Arc::new(StreamingClient), vec![]);
    let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
    h.runner.set_token_sink(Arc::clone(&sink) as Arc<dyn TokenSink>);
    // The flag is read at invocation time, so flipping it now is enough.
    h.config.set_llm_token_stream(true);

    let (_user, agent, thread, run) = seeded_thread(&h).await;
    let created = h
        .runner
        .run_thread(agent.id, thread.id, run.id, None)
        .await
        .unwrap();

    assert_eq!(created[0].content, "All tokens arrived.");
    assert_eq!(
        *sink.0.lock().unwrap(),
        vec!["All ", "tokens ", "arrived."]
    );
}

#[tokio::test]
async fn test_run_failure_marks_agent_error() {
    struct BrokenClient;

    #[async_trait::async_trait]
    impl overmind::overmind::client_wrapper::ClientWrapper for BrokenClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<overmind::overmind::client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error + Send + Sync>> {
            Err("provider exploded".into())
        }
        fn model_name(&self) -> &str {
            "broken"
        }
    }

    let h = harness_with_client(Arc::new(BrokenClient), vec![]);
    let (_user, agent, thread, run) = seeded_thread(&h).await;

    assert!(h
        .runner
        .run_thread(agent.id, thread.id, run.id, None)
        .await
        .is_err());

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("provider exploded"));

    let agent = h.store.get_agent(agent.id).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Error);
    assert!(agent.last_error.unwrap().contains("provider exploded"));
}
