//! End-to-end trigger path: webhook delivery → TRIGGER_FIRED → scheduler →
//! agent run.

mod common;

use common::*;
use overmind::overmind::models::*;
use overmind::overmind::scheduler::SchedulerService;
use overmind::overmind::task_runner::TaskRunner;
use overmind::overmind::triggers::{WebhookIngestor, WebhookOutcome};
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_webhook_delivery_runs_the_agent() {
    let h = harness(vec![], vec![]);
    let task_runner = Arc::new(TaskRunner::new(
        Arc::clone(&h.store),
        Arc::clone(&h.runner),
    ));
    let scheduler = Arc::new(
        SchedulerService::new(
            Arc::clone(&h.store),
            Arc::clone(&h.bus),
            task_runner,
            None,
        )
        .await
        .unwrap(),
    );
    scheduler.start().await.unwrap();

    let (_user, agent) = seed_agent(&h.store).await;
    let trigger = h
        .store
        .create_trigger(agent.id, "webhook", "hook-secret", Map::new())
        .await
        .unwrap();

    let ingestor = WebhookIngestor::new(Arc::clone(&h.store), Arc::clone(&h.bus));

    // Wrong secret: rejected, nothing runs.
    assert_eq!(
        ingestor.handle(trigger.id, "bad").await,
        WebhookOutcome::Unauthorized
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.store.list_runs(agent.id).await.is_empty());

    // Right secret: accepted and the agent runs with trigger=WEBHOOK.
    assert_eq!(
        ingestor.handle(trigger.id, "hook-secret").await,
        WebhookOutcome::Accepted
    );
    let ran = wait_until(Duration::from_secs(3), || {
        let store = Arc::clone(&h.store);
        let id = agent.id;
        async move {
            store
                .list_runs(id)
                .await
                .iter()
                .any(|r| r.trigger == RunTrigger::Webhook && r.status == RunStatus::Success)
        }
    })
    .await;
    assert!(ran);

    // The run left a thread seeded with the agent's task instructions.
    let threads = h.store.list_threads(agent.id).await;
    assert_eq!(threads.len(), 1);
    let messages = h.store.list_thread_messages(threads[0].id).await;
    assert_eq!(messages[0].content, "Do the daily task.");

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_trigger_is_not_found() {
    let h = harness(vec![], vec![]);
    let ingestor = WebhookIngestor::new(Arc::clone(&h.store), Arc::clone(&h.bus));
    assert_eq!(ingestor.handle(404, "x").await, WebhookOutcome::NotFound);
}
