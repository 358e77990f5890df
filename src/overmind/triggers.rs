//! Webhook trigger ingestion.
//!
//! An external system POSTs to the trigger's URL with the shared secret; the
//! ingestor verifies it in constant time and converts the event into a
//! `TRIGGER_FIRED` bus event that the scheduler consumes. HTTP status
//! mapping (202/401/404) lives in the gateway; this module only decides the
//! outcome.
//!
//! Secrets are compared via SHA-256 digests and `subtle::ConstantTimeEq`, so
//! neither length nor prefix leaks through timing.

use crate::overmind::event_bus::{EventBus, EventKind};
use crate::overmind::models::Id;
use crate::overmind::store::Store;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Outcome of a webhook delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Secret verified; `TRIGGER_FIRED` published. HTTP 202.
    Accepted,
    /// Secret mismatch. HTTP 401.
    Unauthorized,
    /// Unknown trigger id. HTTP 404.
    NotFound,
}

/// Verifies webhook secrets and publishes `TRIGGER_FIRED`.
pub struct WebhookIngestor {
    store: Arc<Store>,
    bus: Arc<EventBus>,
}

impl WebhookIngestor {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Handle one webhook delivery. The secret arrives via header or body
    /// depending on the trigger type; the caller extracts it.
    pub async fn handle(&self, trigger_id: Id, secret: &str) -> WebhookOutcome {
        let trigger = match self.store.get_trigger(trigger_id).await {
            Ok(trigger) => trigger,
            Err(_) => return WebhookOutcome::NotFound,
        };

        if !constant_time_eq(&trigger.secret, secret) {
            log::warn!("webhook secret mismatch for trigger {}", trigger_id);
            return WebhookOutcome::Unauthorized;
        }

        self.bus
            .publish(
                EventKind::TriggerFired,
                json!({
                    "trigger_id": trigger.id,
                    "agent_id": trigger.agent_id,
                    "trigger_type": "webhook",
                }),
            )
            .await;
        WebhookOutcome::Accepted
    }
}

/// Constant-time string comparison over SHA-256 digests. Hashing first makes
/// the comparison length-independent; `ct_eq` keeps the optimizer from
/// short-circuiting.
pub fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let expected_hash = Sha256::digest(expected.as_bytes());
    let provided_hash = Sha256::digest(provided.as_bytes());
    expected_hash.ct_eq(&provided_hash).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overmind::models::UserRole;
    use serde_json::Map;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("s3cret", "s3cret"));
        assert!(!constant_time_eq("s3cret", "s3cres"));
        assert!(!constant_time_eq("s3cret", "s3cret-but-longer"));
    }

    #[tokio::test]
    async fn test_outcomes() {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::new(Arc::clone(&bus), "k"));
        let user = store
            .create_user("o@example.com", UserRole::User, None)
            .await
            .unwrap();
        let agent = store
            .create_agent(user.id, "A", "", "", "gpt-4o", None)
            .await
            .unwrap();
        let trigger = store
            .create_trigger(agent.id, "webhook", "s3cret", Map::new())
            .await
            .unwrap();

        let ingestor = WebhookIngestor::new(Arc::clone(&store), Arc::clone(&bus));
        assert_eq!(
            ingestor.handle(trigger.id, "s3cret").await,
            WebhookOutcome::Accepted
        );
        assert_eq!(
            ingestor.handle(trigger.id, "wrong").await,
            WebhookOutcome::Unauthorized
        );
        assert_eq!(
            ingestor.handle(999, "s3cret").await,
            WebhookOutcome::NotFound
        );
    }
}
