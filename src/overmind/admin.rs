//! Admin surface: data-only reset and full schema rebuild.
//!
//! Both operations require the ADMIN role. `clear_data` truncates every
//! table except users and restarts id sequences — schema untouched, row
//! counts reported. `full_rebuild` drops and recreates everything, gated by
//! environment (`development` or `production` only) and, in production, a
//! confirmation password compared in constant time. Lock acquisition uses a
//! short timeout and retries up to 3 times with 1 s backoff.

use crate::overmind::config::{Config, Environment};
use crate::overmind::models::{User, UserRole};
use crate::overmind::store::{ClearDataReport, Store, StoreError};
use crate::overmind::triggers::constant_time_eq;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lock-acquisition timeout per rebuild attempt.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Retry policy on lock contention.
const REBUILD_ATTEMPTS: u32 = 3;
const REBUILD_BACKOFF: Duration = Duration::from_secs(1);

/// Errors from admin operations.
#[derive(Debug)]
pub enum AdminError {
    /// Caller lacks the ADMIN role, the environment refuses the operation,
    /// or the confirmation password does not match.
    Forbidden(String),
    /// The store lock could not be acquired within the retry budget.
    Locked,
    Other(String),
}

impl fmt::Display for AdminError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            AdminError::Locked => write!(f, "database is locked; rebuild retries exhausted"),
            AdminError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for AdminError {}

/// Admin operations over the store.
pub struct AdminSurface {
    store: Arc<Store>,
    config: Arc<Config>,
}

impl AdminSurface {
    pub fn new(store: Arc<Store>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    fn require_admin(&self, actor: &User) -> Result<(), AdminError> {
        if actor.role == UserRole::Admin || self.config.is_admin_email(&actor.email) {
            Ok(())
        } else {
            Err(AdminError::Forbidden(format!(
                "user {} is not an admin",
                actor.email
            )))
        }
    }

    /// Truncate every table except users. Never drops schema.
    pub async fn clear_data(&self, actor: &User) -> Result<ClearDataReport, AdminError> {
        self.require_admin(actor)?;
        let report = self.store.clear_data().await;
        log::warn!(
            "clear_data by {}: {} rows cleared",
            actor.email,
            report.rows_cleared
        );
        Ok(report)
    }

    /// Drop and recreate the schema. Development needs no confirmation;
    /// production requires the configured reset password; any other
    /// environment refuses outright.
    pub async fn full_rebuild(
        &self,
        actor: &User,
        confirmation: Option<&str>,
    ) -> Result<(), AdminError> {
        self.require_admin(actor)?;

        match self.config.environment {
            Environment::Development => {}
            Environment::Production => {
                let expected = self.config.db_reset_password.as_deref().ok_or_else(|| {
                    AdminError::Forbidden("no reset password configured".to_string())
                })?;
                let provided = confirmation.unwrap_or("");
                if !constant_time_eq(expected, provided) {
                    return Err(AdminError::Forbidden(
                        "confirmation password mismatch".to_string(),
                    ));
                }
            }
            Environment::Other => {
                return Err(AdminError::Forbidden(
                    "full_rebuild is only available in development or production".to_string(),
                ))
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.rebuild_schema(LOCK_TIMEOUT).await {
                Ok(()) => {
                    log::warn!(
                        "full_rebuild by {} succeeded on attempt {}",
                        actor.email,
                        attempt
                    );
                    return Ok(());
                }
                Err(StoreError::Locked) if attempt < REBUILD_ATTEMPTS => {
                    log::warn!(
                        "full_rebuild attempt {} hit lock contention, retrying",
                        attempt
                    );
                    tokio::time::sleep(REBUILD_BACKOFF).await;
                }
                Err(StoreError::Locked) => return Err(AdminError::Locked),
                Err(e) => return Err(AdminError::Other(e.to_string())),
            }
        }
    }
}
