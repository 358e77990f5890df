//! Scheduler integration tests: job table lifecycle, event reactions, and a
//! live schedule-and-run pass.

mod common;

use common::*;
use overmind::overmind::event_bus::EventKind;
use overmind::overmind::models::*;
use overmind::overmind::scheduler::SchedulerService;
use overmind::overmind::store::AgentUpdate;
use overmind::overmind::task_runner::TaskRunner;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn scheduler(h: &Harness) -> Arc<SchedulerService> {
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
    scheduler
}

#[tokio::test]
async fn test_schedule_agent_is_idempotent() {
    let h = harness(vec![], vec![]);
    let scheduler = scheduler(&h).await;
    let (_user, agent) = seed_agent(&h.store).await;

    scheduler.schedule_agent(agent.id, "*/5 * * * *").await.unwrap();
    scheduler.schedule_agent(agent.id, "*/5 * * * *").await.unwrap();

    assert!(scheduler.has_agent_job(agent.id).await);
    assert_eq!(scheduler.job_count().await, 1);

    // The next fire time was persisted onto the row.
    let agent = h.store.get_agent(agent.id).await.unwrap();
    assert!(agent.next_run_at.is_some());

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_cron_is_rejected() {
    let h = harness(vec![], vec![]);
    let scheduler = scheduler(&h).await;
    let (_user, agent) = seed_agent(&h.store).await;

    assert!(scheduler
        .schedule_agent(agent.id, "every full moon")
        .await
        .is_err());
    assert!(!scheduler.has_agent_job(agent.id).await);
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_agent_update_reschedules_and_unschedules() {
    let h = harness(vec![], vec![]);
    let scheduler = scheduler(&h).await;
    let (_user, agent) = seed_agent(&h.store).await;

    // Setting a schedule via CRUD reaches the scheduler through the bus.
    h.store
        .update_agent(
            agent.id,
            AgentUpdate {
                schedule: Some(Some("0 9 * * 1-5".to_string())),
                ..AgentUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let scheduler = Arc::clone(&scheduler);
            let id = agent.id;
            async move { scheduler.has_agent_job(id).await }
        })
        .await
    );

    // Nulling the schedule removes the job and clears next_run_at.
    h.store
        .update_agent(
            agent.id,
            AgentUpdate {
                schedule: Some(None),
                ..AgentUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let scheduler = Arc::clone(&scheduler);
            let id = agent.id;
            async move { !scheduler.has_agent_job(id).await }
        })
        .await
    );
    let agent = h.store.get_agent(agent.id).await.unwrap();
    assert!(agent.next_run_at.is_none());

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_agent_delete_removes_job() {
    let h = harness(vec![], vec![]);
    let scheduler = scheduler(&h).await;
    let (_user, agent) = seed_agent(&h.store).await;
    scheduler.schedule_agent(agent.id, "*/5 * * * *").await.unwrap();

    h.store.delete_agent(agent.id).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let scheduler = Arc::clone(&scheduler);
            let id = agent.id;
            async move { !scheduler.has_agent_job(id).await }
        })
        .await
    );
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_schedule_and_run_end_to_end() {
    // A per-second cron so the test observes a real tick.
    let h = harness(vec![], vec![]);
    let scheduler = scheduler(&h).await;
    let (_user, agent) = seed_agent(&h.store).await;

    h.store
        .update_agent(
            agent.id,
            AgentUpdate {
                schedule: Some(Some("* * * * * *".to_string())),
                ..AgentUpdate::default()
            },
        )
        .await
        .unwrap();

    let ran = wait_until(Duration::from_secs(5), || {
        let store = Arc::clone(&h.store);
        let id = agent.id;
        async move {
            store
                .list_runs(id)
                .await
                .iter()
                .any(|r| r.trigger == RunTrigger::Schedule && r.status == RunStatus::Success)
        }
    })
    .await;
    assert!(ran, "no successful scheduled run observed");

    // The agent settles back to IDLE with its last run recorded.
    assert!(
        wait_until(Duration::from_secs(2), || {
            let store = Arc::clone(&h.store);
            let id = agent.id;
            async move {
                let agent = store.get_agent(id).await.unwrap();
                agent.status == AgentStatus::Idle && agent.last_run_at.is_some()
            }
        })
        .await
    );

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_trigger_fired_launches_run_with_payload_trigger() {
    let h = harness(vec![], vec![]);
    let scheduler = scheduler(&h).await;
    let (_user, agent) = seed_agent(&h.store).await;

    h.bus
        .publish(
            EventKind::TriggerFired,
            json!({"agent_id": agent.id, "trigger_type": "webhook"}),
        )
        .await;

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
    assert!(ran, "trigger-fired run not observed");
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_trigger_without_type_defaults_to_webhook() {
    let h = harness(vec![], vec![]);
    let scheduler = scheduler(&h).await;
    let (_user, agent) = seed_agent(&h.store).await;

    h.bus
        .publish(EventKind::TriggerFired, json!({"agent_id": agent.id}))
        .await;

    let ran = wait_until(Duration::from_secs(3), || {
        let store = Arc::clone(&h.store);
        let id = agent.id;
        async move {
            store
                .list_runs(id)
                .await
                .iter()
                .any(|r| r.trigger == RunTrigger::Webhook)
        }
    })
    .await;
    assert!(ran);
    scheduler.stop().await.unwrap();
}
