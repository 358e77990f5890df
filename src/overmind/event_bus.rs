//! Process-wide typed pub/sub.
//!
//! Every component communicates state changes through the [`EventBus`]:
//! the store announces CRUD mutations, the agent runner announces tool
//! activity, the workflow engine announces node state, and the WebSocket
//! relay turns all of it into client-visible envelopes.
//!
//! # Contract
//!
//! - Listeners for a kind run **serially, in subscription order** per
//!   `publish` call.
//! - A listener failure is logged and MUST NOT prevent the remaining
//!   listeners from running, nor propagate to the publisher.
//! - Re-entrant publishes are allowed: the listener list is snapshotted
//!   before dispatch, so a listener may publish (or subscribe) without
//!   deadlocking.
//!
//! # Example
//!
//! ```rust,no_run
//! use overmind::overmind::event_bus::{listener, EventBus, EventKind};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async {
//! let bus = Arc::new(EventBus::new());
//! bus.subscribe(
//!     EventKind::AgentUpdated,
//!     listener(|payload| async move {
//!         println!("agent updated: {}", payload);
//!         Ok(())
//!     }),
//! )
//! .await;
//! bus.publish(EventKind::AgentUpdated, json!({"id": 1})).await;
//! # };
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Kinds of events flowing through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentCreated,
    AgentUpdated,
    AgentDeleted,
    ThreadCreated,
    ThreadUpdated,
    ThreadDeleted,
    ThreadMessageCreated,
    RunCreated,
    RunUpdated,
    NodeStateChanged,
    ExecutionFinished,
    WorkflowProgress,
    WorkerToolStarted,
    WorkerToolCompleted,
    WorkerToolFailed,
    TriggerFired,
}

impl EventKind {
    /// Wire name used in logs and envelope `type` derivations.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AgentCreated => "agent_created",
            EventKind::AgentUpdated => "agent_updated",
            EventKind::AgentDeleted => "agent_deleted",
            EventKind::ThreadCreated => "thread_created",
            EventKind::ThreadUpdated => "thread_updated",
            EventKind::ThreadDeleted => "thread_deleted",
            EventKind::ThreadMessageCreated => "thread_message_created",
            EventKind::RunCreated => "run_created",
            EventKind::RunUpdated => "run_updated",
            EventKind::NodeStateChanged => "node_state_changed",
            EventKind::ExecutionFinished => "execution_finished",
            EventKind::WorkflowProgress => "workflow_progress",
            EventKind::WorkerToolStarted => "worker_tool_started",
            EventKind::WorkerToolCompleted => "worker_tool_completed",
            EventKind::WorkerToolFailed => "worker_tool_failed",
            EventKind::TriggerFired => "trigger_fired",
        }
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Trait for receiving events.
///
/// Implementations must be cheap to call — long work should be spawned, not
/// awaited inline, since listeners run serially per publish.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn handle(&self, payload: &Value) -> Result<(), Box<dyn Error + Send + Sync>>;
}

struct FnListener<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventListener for FnListener<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Box<dyn Error + Send + Sync>>> + Send,
{
    async fn handle(&self, payload: &Value) -> Result<(), Box<dyn Error + Send + Sync>> {
        (self.f)(payload.clone()).await
    }
}

/// Adapt an async closure into an [`EventListener`].
pub fn listener<F, Fut>(f: F) -> Arc<dyn EventListener>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Box<dyn Error + Send + Sync>>> + Send + 'static,
{
    Arc::new(FnListener { f })
}

/// Process-wide typed pub/sub. Constructed once at startup and shared via
/// `Arc<EventBus>`; tests build a fresh bus per case.
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<(u64, Arc<dyn EventListener>)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for `kind`. Listeners fire in subscription order.
    pub async fn subscribe(
        &self,
        kind: EventKind,
        listener: Arc<dyn EventListener>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.listeners.write().await;
        map.entry(kind).or_insert_with(Vec::new).push((id, listener));
        SubscriptionId(id)
    }

    /// Remove a previously registered listener. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        let mut map = self.listeners.write().await;
        if let Some(entries) = map.get_mut(&kind) {
            entries.retain(|(entry_id, _)| *entry_id != id.0);
        }
    }

    /// Publish `payload` to every listener of `kind`, serially, in
    /// subscription order. Listener failures are logged and contained.
    pub async fn publish(&self, kind: EventKind, payload: Value) {
        // Snapshot outside the lock so listeners can re-enter the bus.
        let snapshot: Vec<Arc<dyn EventListener>> = {
            let map = self.listeners.read().await;
            match map.get(&kind) {
                Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };

        for listener in snapshot {
            if let Err(e) = listener.handle(&payload).await {
                log::error!("event listener failed for {}: {}", kind.as_str(), e);
            }
        }
    }

    /// Number of listeners currently registered for `kind`.
    pub async fn listener_count(&self, kind: EventKind) -> usize {
        let map = self.listeners.read().await;
        map.get(&kind).map(|v| v.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_listeners_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(
                EventKind::AgentCreated,
                listener(move |_| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().unwrap().push(tag);
                        Ok(())
                    }
                }),
            )
            .await;
        }

        bus.publish(EventKind::AgentCreated, json!({})).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_listener_error_does_not_stop_the_rest() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.subscribe(
            EventKind::RunUpdated,
            listener(|_| async { Err("boom".into()) }),
        )
        .await;
        let reached_clone = Arc::clone(&reached);
        bus.subscribe(
            EventKind::RunUpdated,
            listener(move |_| {
                let reached = Arc::clone(&reached_clone);
                async move {
                    *reached.lock().unwrap() = true;
                    Ok(())
                }
            }),
        )
        .await;

        bus.publish(EventKind::RunUpdated, json!({})).await;
        assert!(*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_listener() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0usize));
        let count_clone = Arc::clone(&count);

        let id = bus
            .subscribe(
                EventKind::TriggerFired,
                listener(move |_| {
                    let count = Arc::clone(&count_clone);
                    async move {
                        *count.lock().unwrap() += 1;
                        Ok(())
                    }
                }),
            )
            .await;

        bus.publish(EventKind::TriggerFired, json!({})).await;
        bus.unsubscribe(EventKind::TriggerFired, id).await;
        bus.publish(EventKind::TriggerFired, json!({})).await;

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.listener_count(EventKind::TriggerFired).await, 0);
    }
}
