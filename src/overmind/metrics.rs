//! Process-wide counters.
//!
//! Telemetry sinks are out of scope for the core; this module is the counter
//! surface they scrape. Counters are monotonically increasing atomics and
//! never reset during the process lifetime.

use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

lazy_static! {
    /// Successful Gmail watch renewals.
    pub static ref GMAIL_WATCH_RENEW_TOTAL: AtomicU64 = AtomicU64::new(0);
    /// Gmail API failures (any endpoint).
    pub static ref GMAIL_API_ERROR_TOTAL: AtomicU64 = AtomicU64::new(0);
    /// WebSocket frames broadcast to subscribed clients.
    pub static ref WS_BROADCAST_TOTAL: AtomicU64 = AtomicU64::new(0);
    /// Connections dropped by the heartbeat watchdog.
    pub static ref WS_WATCHDOG_DROPS_TOTAL: AtomicU64 = AtomicU64::new(0);
}

/// Increment a counter by one.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot every counter by name.
pub fn snapshot() -> BTreeMap<&'static str, u64> {
    let mut map = BTreeMap::new();
    map.insert(
        "gmail_watch_renew_total",
        GMAIL_WATCH_RENEW_TOTAL.load(Ordering::Relaxed),
    );
    map.insert(
        "gmail_api_error_total",
        GMAIL_API_ERROR_TOTAL.load(Ordering::Relaxed),
    );
    map.insert(
        "ws_broadcast_total",
        WS_BROADCAST_TOTAL.load(Ordering::Relaxed),
    );
    map.insert(
        "ws_watchdog_drops_total",
        WS_WATCHDOG_DROPS_TOTAL.load(Ordering::Relaxed),
    );
    map
}
