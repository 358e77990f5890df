//! Email trigger polling tests against a scripted Gmail API.

mod common;

use async_trait::async_trait;
use common::*;
use overmind::overmind::event_bus::{listener, EventKind};
use overmind::overmind::gmail::{
    AccessToken, EmailMeta, EmailTriggerService, GmailApi, GmailError, HistoryPage, WatchInfo,
};
use overmind::overmind::metrics;
use overmind::overmind::models::*;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FakeGmail {
    token_exchanges: AtomicUsize,
    pages: Mutex<Vec<HistoryPage>>,
    metadata: Mutex<Vec<EmailMeta>>,
    renewals: AtomicUsize,
}

impl FakeGmail {
    fn new(pages: Vec<HistoryPage>, metadata: Vec<EmailMeta>) -> Self {
        Self {
            token_exchanges: AtomicUsize::new(0),
            pages: Mutex::new(pages),
            metadata: Mutex::new(metadata),
            renewals: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GmailApi for FakeGmail {
    async fn exchange_refresh_token(
        &self,
        _refresh_token: &str,
    ) -> Result<AccessToken, GmailError> {
        self.token_exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken {
            token: "access-token".to_string(),
        })
    }

    async fn list_history(
        &self,
        _access_token: &str,
        start_history_id: u64,
    ) -> Result<HistoryPage, GmailError> {
        let mut pages = self.pages.lock().unwrap();
        if pages.is_empty() {
            return Ok(HistoryPage {
                last_history_id: start_history_id,
                messages_added: Vec::new(),
            });
        }
        Ok(pages.remove(0))
    }

    async fn get_message_metadata(
        &self,
        _access_token: &str,
        message_id: &str,
    ) -> Result<EmailMeta, GmailError> {
        self.metadata
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| EmailMeta {
                id: m.id.clone(),
                from: m.from.clone(),
                subject: m.subject.clone(),
            })
            .ok_or_else(|| GmailError(format!("unknown message {}", message_id)))
    }

    async fn renew_watch(&self, _access_token: &str) -> Result<WatchInfo, GmailError> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(WatchInfo {
            history_id: 1000,
            expiry: chrono::Utc::now() + chrono::Duration::days(7),
        })
    }
}

struct Fixture {
    h: Harness,
    trigger: Trigger,
    fired: Arc<Mutex<Vec<Value>>>,
}

async fn fixture(config: Map<String, Value>) -> Fixture {
    let h = harness(vec![], vec![]);
    let (user, agent) = seed_agent(&h.store).await;
    h.store
        .set_gmail_refresh_token(user.id, "refresh-token")
        .await
        .unwrap();
    let trigger = h
        .store
        .create_trigger(agent.id, "email", "mail-secret", config)
        .await
        .unwrap();

    let fired = Arc::new(Mutex::new(Vec::new()));
    {
        let fired = Arc::clone(&fired);
        h.bus
            .subscribe(
                EventKind::TriggerFired,
                listener(move |payload| {
                    let fired = Arc::clone(&fired);
                    async move {
                        fired.lock().unwrap().push(payload);
                        Ok(())
                    }
                }),
            )
            .await;
    }

    Fixture { h, trigger, fired }
}

fn service(f: &Fixture, api: Arc<FakeGmail>) -> EmailTriggerService {
    EmailTriggerService::new(
        Arc::clone(&f.h.store),
        Arc::clone(&f.h.bus),
        api,
        Duration::from_secs(600),
    )
}

#[tokio::test]
async fn test_matching_mail_fires_trigger() {
    let config = json!({
        "history_id": 5,
        "filters": {"from_contains": "alerts@", "subject_contains": "incident"}
    })
    .as_object()
    .cloned()
    .unwrap();
    let f = fixture(config).await;

    let api = Arc::new(FakeGmail::new(
        vec![HistoryPage {
            last_history_id: 9,
            messages_added: vec!["m1".to_string(), "m2".to_string()],
        }],
        vec![
            EmailMeta {
                id: "m1".to_string(),
                from: "alerts@corp.com".to_string(),
                subject: "Incident #42 opened".to_string(),
            },
            EmailMeta {
                id: "m2".to_string(),
                from: "newsletter@corp.com".to_string(),
                subject: "Weekly digest".to_string(),
            },
        ],
    ));
    service(&f, api).poll_all().await;

    let fired = f.fired.lock().unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0]["trigger_type"], "email");
    assert_eq!(fired[0]["agent_id"], f.trigger.agent_id);
    assert_eq!(fired[0]["message_id"], "m1");
}

#[tokio::test]
async fn test_history_advances_even_without_matches() {
    let config = json!({
        "history_id": 5,
        "filters": {"from_contains": "nobody@"}
    })
    .as_object()
    .cloned()
    .unwrap();
    let f = fixture(config).await;

    let api = Arc::new(FakeGmail::new(
        vec![HistoryPage {
            last_history_id: 17,
            messages_added: vec!["m1".to_string()],
        }],
        vec![EmailMeta {
            id: "m1".to_string(),
            from: "someone@else.com".to_string(),
            subject: "irrelevant".to_string(),
        }],
    ));
    service(&f, api).poll_all().await;

    assert!(f.fired.lock().unwrap().is_empty());
    // The watermark still moved: this mail is never examined again.
    let trigger = f.h.store.get_trigger(f.trigger.id).await.unwrap();
    assert_eq!(trigger.config["history_id"], 17);
}

#[tokio::test]
async fn test_access_token_is_cached_across_polls() {
    let config = json!({"history_id": 0}).as_object().cloned().unwrap();
    let f = fixture(config).await;

    let api = Arc::new(FakeGmail::new(vec![], vec![]));
    let service = service(&f, Arc::clone(&api));
    service.poll_all().await;
    service.poll_all().await;
    service.poll_all().await;

    assert_eq!(api.token_exchanges.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_watch_renewal_when_expiry_is_near() {
    let soon = (chrono::Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
    let config = json!({"history_id": 0, "watch_expiry": soon})
        .as_object()
        .cloned()
        .unwrap();
    let f = fixture(config).await;

    let before = metrics::snapshot()["gmail_watch_renew_total"];
    let api = Arc::new(FakeGmail::new(vec![], vec![]));
    service(&f, Arc::clone(&api)).poll_all().await;

    assert_eq!(api.renewals.load(Ordering::SeqCst), 1);
    assert!(metrics::snapshot()["gmail_watch_renew_total"] > before);

    // Expiry was pushed a week out; a second poll does not renew again.
    service(&f, Arc::clone(&api)).poll_all().await;
    assert_eq!(api.renewals.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_owner_without_gmail_connection_is_skipped() {
    let h = harness(vec![], vec![]);
    let (_user, agent) = seed_agent(&h.store).await;
    // No refresh token stored for this owner.
    h.store
        .create_trigger(agent.id, "email", "mail-secret", Map::new())
        .await
        .unwrap();

    let api = Arc::new(FakeGmail::new(vec![], vec![]));
    let service = EmailTriggerService::new(
        Arc::clone(&h.store),
        Arc::clone(&h.bus),
        Arc::clone(&api) as Arc<dyn GmailApi>,
        Duration::from_secs(600),
    );
    service.poll_all().await;
    assert_eq!(api.token_exchanges.load(Ordering::SeqCst), 0);
}
