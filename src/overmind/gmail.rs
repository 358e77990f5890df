//! Gmail trigger polling.
//!
//! Email triggers fire agents when matching mail arrives. Each `email`
//! trigger stores a `history_id` watermark in its config; on every poll the
//! service fetches the Gmail history since that watermark, applies the
//! trigger's filters to each added message, publishes `TRIGGER_FIRED` for
//! every match, and **always** advances the watermark to the maximum history
//! id seen — even when nothing matched — so the same mail is never examined
//! twice.
//!
//! Access tokens are minted from the owner's (encrypted) refresh token and
//! cached for 55 minutes. When a trigger's push-watch expires in under 24
//! hours the watch is renewed; `gmail_watch_renew_total` /
//! `gmail_api_error_total` count the outcomes.
//!
//! The Gmail API is consumed through the [`GmailApi`] trait;
//! [`HttpGmailApi`] is the reqwest implementation and tests supply scripted
//! fakes.

use crate::overmind::event_bus::{EventBus, EventKind};
use crate::overmind::metrics;
use crate::overmind::models::{Id, Trigger};
use crate::overmind::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default cadence of the polling loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(600);
/// Access tokens live ~60 min; refresh a little early.
const TOKEN_TTL: Duration = Duration::from_secs(55 * 60);
/// Renew the push watch when it expires within this window.
const WATCH_RENEW_WINDOW_HOURS: i64 = 24;

/// Errors from the Gmail API boundary.
#[derive(Debug)]
pub struct GmailError(pub String);

impl fmt::Display for GmailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gmail api error: {}", self.0)
    }
}

impl Error for GmailError {}

/// A freshly minted access token.
pub struct AccessToken {
    pub token: String,
}

/// One page of history results.
pub struct HistoryPage {
    /// Highest history id observed in this page.
    pub last_history_id: u64,
    /// Message ids from `messagesAdded` entries.
    pub messages_added: Vec<String>,
}

/// Minimal metadata for filter matching.
pub struct EmailMeta {
    pub id: String,
    pub from: String,
    pub subject: String,
}

/// Result of a watch renewal.
pub struct WatchInfo {
    pub history_id: u64,
    pub expiry: DateTime<Utc>,
}

/// The slice of the Gmail API this service consumes.
#[async_trait]
pub trait GmailApi: Send + Sync {
    async fn exchange_refresh_token(&self, refresh_token: &str)
        -> Result<AccessToken, GmailError>;
    async fn list_history(
        &self,
        access_token: &str,
        start_history_id: u64,
    ) -> Result<HistoryPage, GmailError>;
    async fn get_message_metadata(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<EmailMeta, GmailError>;
    async fn renew_watch(&self, access_token: &str) -> Result<WatchInfo, GmailError>;
}

/// reqwest-backed [`GmailApi`] implementation.
pub struct HttpGmailApi {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
}

impl HttpGmailApi {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    async fn get_json(&self, url: &str, access_token: &str) -> Result<Value, GmailError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| GmailError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GmailError(format!("{} -> {}", url, response.status())));
        }
        response.json().await.map_err(|e| GmailError(e.to_string()))
    }
}

#[async_trait]
impl GmailApi for HttpGmailApi {
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<AccessToken, GmailError> {
        let body = format!(
            "client_id={}&client_secret={}&refresh_token={}&grant_type=refresh_token",
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.client_secret),
            urlencoding::encode(refresh_token),
        );
        let response = self
            .client
            .post("https://oauth2.googleapis.com/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| GmailError(e.to_string()))?;
        let payload: Value = response.json().await.map_err(|e| GmailError(e.to_string()))?;
        let token = payload
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GmailError(format!("token exchange failed: {}", payload)))?;
        Ok(AccessToken {
            token: token.to_string(),
        })
    }

    async fn list_history(
        &self,
        access_token: &str,
        start_history_id: u64,
    ) -> Result<HistoryPage, GmailError> {
        let url = format!(
            "https://gmail.googleapis.com/gmail/v1/users/me/history?startHistoryId={}&historyTypes=messageAdded",
            start_history_id
        );
        let payload = self.get_json(&url, access_token).await?;

        let mut messages_added = Vec::new();
        let mut last_history_id = start_history_id;
        if let Some(entries) = payload.get("history").and_then(|v| v.as_array()) {
            for entry in entries {
                if let Some(id) = entry.get("id").and_then(history_id_of) {
                    last_history_id = last_history_id.max(id);
                }
                if let Some(added) = entry.get("messagesAdded").and_then(|v| v.as_array()) {
                    for item in added {
                        if let Some(id) = item
                            .get("message")
                            .and_then(|m| m.get("id"))
                            .and_then(|v| v.as_str())
                        {
                            messages_added.push(id.to_string());
                        }
                    }
                }
            }
        }
        if let Some(id) = payload.get("historyId").and_then(history_id_of) {
            last_history_id = last_history_id.max(id);
        }
        Ok(HistoryPage {
            last_history_id,
            messages_added,
        })
    }

    async fn get_message_metadata(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<EmailMeta, GmailError> {
        let url = format!(
            "https://gmail.googleapis.com/gmail/v1/users/me/messages/{}?format=metadata&metadataHeaders=From&metadataHeaders=Subject",
            urlencoding::encode(message_id)
        );
        let payload = self.get_json(&url, access_token).await?;

        let mut from = String::new();
        let mut subject = String::new();
        if let Some(headers) = payload
            .get("payload")
            .and_then(|p| p.get("headers"))
            .and_then(|v| v.as_array())
        {
            for header in headers {
                let name = header.get("name").and_then(|v| v.as_str()).unwrap_or("");
                let value = header.get("value").and_then(|v| v.as_str()).unwrap_or("");
                if name.eq_ignore_ascii_case("from") {
                    from = value.to_string();
                } else if name.eq_ignore_ascii_case("subject") {
                    subject = value.to_string();
                }
            }
        }
        Ok(EmailMeta {
            id: message_id.to_string(),
            from,
            subject,
        })
    }

    async fn renew_watch(&self, access_token: &str) -> Result<WatchInfo, GmailError> {
        let response = self
            .client
            .post("https://gmail.googleapis.com/gmail/v1/users/me/watch")
            .bearer_auth(access_token)
            .json(&json!({ "labelIds": ["INBOX"] }))
            .send()
            .await
            .map_err(|e| GmailError(e.to_string()))?;
        let payload: Value = response.json().await.map_err(|e| GmailError(e.to_string()))?;
        let history_id = payload
            .get("historyId")
            .and_then(history_id_of)
            .ok_or_else(|| GmailError(format!("watch renewal failed: {}", payload)))?;
        let expiry_ms = payload
            .get("expiration")
            .and_then(history_id_of)
            .unwrap_or(0) as i64;
        let expiry = DateTime::<Utc>::from_timestamp_millis(expiry_ms).unwrap_or_else(Utc::now);
        Ok(WatchInfo { history_id, expiry })
    }
}

/// Gmail returns numeric ids as strings or numbers depending on endpoint.
fn history_id_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

struct CachedToken {
    token: String,
    expires_at: tokio::time::Instant,
}

/// Polls email triggers and converts matching mail into `TRIGGER_FIRED`.
pub struct EmailTriggerService {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    api: Arc<dyn GmailApi>,
    poll_interval: Duration,
    token_cache: Mutex<HashMap<Id, CachedToken>>,
}

impl EmailTriggerService {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        api: Arc<dyn GmailApi>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            api,
            poll_interval,
            token_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the polling loop. Returns the task handle so the embedding
    /// application can abort it on shutdown.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            log::info!(
                "email trigger poller started (interval {}s)",
                service.poll_interval.as_secs()
            );
            loop {
                service.poll_all().await;
                tokio::time::sleep(service.poll_interval).await;
            }
        })
    }

    /// One pass over every email trigger. Public so tests drive polls
    /// directly instead of sleeping.
    pub async fn poll_all(&self) {
        for trigger in self.store.list_triggers_by_type("email").await {
            if let Err(e) = self.poll_trigger(&trigger).await {
                metrics::incr(&metrics::GMAIL_API_ERROR_TOTAL);
                log::error!("email poll failed for trigger {}: {}", trigger.id, e);
            }
        }
    }

    async fn poll_trigger(&self, trigger: &Trigger) -> Result<(), Box<dyn Error + Send + Sync>> {
        let agent = self.store.get_agent(trigger.agent_id).await?;
        let refresh_token = match self.store.get_gmail_refresh_token(agent.owner_id).await? {
            Some(token) => token,
            None => {
                log::debug!(
                    "trigger {} owner {} has no gmail connection, skipping",
                    trigger.id,
                    agent.owner_id
                );
                return Ok(());
            }
        };
        let access_token = self.access_token(agent.owner_id, &refresh_token).await?;

        let since = trigger
            .config
            .get("history_id")
            .and_then(history_id_of)
            .unwrap_or(0);
        let page = self.api.list_history(&access_token, since).await?;

        for message_id in &page.messages_added {
            let meta = self
                .api
                .get_message_metadata(&access_token, message_id)
                .await?;
            if !matches_filters(trigger.config.get("filters"), &meta) {
                continue;
            }
            self.bus
                .publish(
                    EventKind::TriggerFired,
                    json!({
                        "trigger_id": trigger.id,
                        "agent_id": trigger.agent_id,
                        "trigger_type": "email",
                        "message_id": meta.id,
                    }),
                )
                .await;
        }

        // Advance the watermark even when nothing fired; history already
        // examined must never be re-fetched.
        let max_seen = since.max(page.last_history_id);
        if max_seen != since {
            let mut patch = Map::new();
            patch.insert("history_id".into(), Value::from(max_seen));
            self.store.update_trigger_config(trigger.id, patch).await?;
        }

        self.maybe_renew_watch(trigger, &access_token).await;
        Ok(())
    }

    async fn maybe_renew_watch(&self, trigger: &Trigger, access_token: &str) {
        let expiry = trigger
            .config
            .get("watch_expiry")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let expiry = match expiry {
            Some(expiry) => expiry,
            None => return,
        };
        if expiry - Utc::now() >= ChronoDuration::hours(WATCH_RENEW_WINDOW_HOURS) {
            return;
        }

        match self.api.renew_watch(access_token).await {
            Ok(watch) => {
                metrics::incr(&metrics::GMAIL_WATCH_RENEW_TOTAL);
                let mut patch = Map::new();
                patch.insert(
                    "watch_expiry".into(),
                    Value::from(watch.expiry.to_rfc3339()),
                );
                if let Err(e) = self.store.update_trigger_config(trigger.id, patch).await {
                    log::warn!("failed to persist renewed watch: {}", e);
                }
                log::info!(
                    "renewed gmail watch for trigger {} (new expiry {})",
                    trigger.id,
                    watch.expiry
                );
            }
            Err(e) => {
                metrics::incr(&metrics::GMAIL_API_ERROR_TOTAL);
                log::error!("gmail watch renewal failed for trigger {}: {}", trigger.id, e);
            }
        }
    }

    async fn access_token(
        &self,
        owner_id: Id,
        refresh_token: &str,
    ) -> Result<String, GmailError> {
        {
            let cache = self.token_cache.lock().await;
            if let Some(cached) = cache.get(&owner_id) {
                if cached.expires_at > tokio::time::Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
        }
        let fresh = self.api.exchange_refresh_token(refresh_token).await?;
        let mut cache = self.token_cache.lock().await;
        cache.insert(
            owner_id,
            CachedToken {
                token: fresh.token.clone(),
                expires_at: tokio::time::Instant::now() + TOKEN_TTL,
            },
        );
        Ok(fresh.token)
    }
}

/// Filter matching: `from_contains` / `subject_contains`, both optional and
/// case-insensitive. No filters means every message matches.
fn matches_filters(filters: Option<&Value>, meta: &EmailMeta) -> bool {
    let filters = match filters.and_then(|v| v.as_object()) {
        Some(f) => f,
        None => return true,
    };
    if let Some(needle) = filters.get("from_contains").and_then(|v| v.as_str()) {
        if !meta.from.to_lowercase().contains(&needle.to_lowercase()) {
            return false;
        }
    }
    if let Some(needle) = filters.get("subject_contains").and_then(|v| v.as_str()) {
        if !meta.subject.to_lowercase().contains(&needle.to_lowercase()) {
            return false;
        }
    }
    true
}
