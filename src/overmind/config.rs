//! Runtime configuration for the orchestration core.
//!
//! Provides the [`Config`] struct consumed by every service. Values are read
//! from environment variables by [`Config::from_env`]; tests construct the
//! struct directly (or via [`Config::for_testing`]) and mutate the runtime
//! toggles.
//!
//! The LLM token-streaming flag is deliberately **not** a plain field: the
//! agent runner must observe flips at invocation time, not at construction
//! time, so it lives behind an [`AtomicBool`].
//!
//! # Example
//!
//! ```rust
//! use overmind::overmind::config::Config;
//!
//! let config = Config::for_testing();
//! assert!(!config.llm_token_stream());
//! config.set_llm_token_stream(true);
//! assert!(config.llm_token_stream());
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Deployment environment the process believes it is running in.
///
/// Gates the admin `full_rebuild` operation: only `Development` and
/// `Production` may rebuild, and `Production` additionally requires the
/// confirmation password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    /// Anything else (staging, CI, unknown). Destructive schema operations
    /// are refused in this state.
    Other,
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "development" | "dev" => Environment::Development,
            "production" | "prod" => Environment::Production,
            _ => Environment::Other,
        }
    }
}

/// Global configuration for the orchestration core.
///
/// Constructed once at startup and shared via `Arc<Config>`. No config-file
/// parsing is involved; the embedding binary decides how values reach the
/// environment.
pub struct Config {
    /// Testing flag. When set, services may shorten internal timers.
    pub testing: bool,
    /// Upper bound on LLM output tokens forwarded to clients.
    pub max_output_tokens: usize,
    /// Emails granted the ADMIN role on first sight.
    pub admin_emails: Vec<String>,
    /// Hard cap on registered users (0 = unlimited).
    pub max_users: usize,
    /// Confirmation password required for `full_rebuild` in production.
    pub db_reset_password: Option<String>,
    /// Key material for secrets at rest (see [`crate::overmind::crypto`]).
    pub secret_key: String,
    /// Deployment environment.
    pub environment: Environment,
    /// WebSocket envelope version stamped on every frame.
    pub ws_envelope_version: u8,
    /// Base directory for worker artifact storage.
    pub worker_artifact_dir: PathBuf,

    llm_token_stream: AtomicBool,
}

impl Config {
    /// Read configuration from `OVERMIND_*` environment variables.
    ///
    /// Unset variables fall back to conservative defaults; malformed numeric
    /// values are treated as unset.
    pub fn from_env() -> Self {
        Self {
            testing: env_flag("OVERMIND_TESTING"),
            max_output_tokens: env_usize("OVERMIND_MAX_OUTPUT_TOKENS").unwrap_or(8_192),
            admin_emails: env::var("OVERMIND_ADMIN_EMAILS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            max_users: env_usize("OVERMIND_MAX_USERS").unwrap_or(0),
            db_reset_password: env::var("OVERMIND_DB_RESET_PASSWORD").ok(),
            secret_key: env::var("OVERMIND_SECRET_KEY").unwrap_or_default(),
            environment: Environment::parse(
                &env::var("OVERMIND_ENVIRONMENT").unwrap_or_default(),
            ),
            ws_envelope_version: env_usize("OVERMIND_WS_ENVELOPE_V").unwrap_or(1) as u8,
            worker_artifact_dir: PathBuf::from(
                env::var("OVERMIND_WORKER_ARTIFACT_DIR")
                    .unwrap_or_else(|_| "worker_artifacts".to_string()),
            ),
            llm_token_stream: AtomicBool::new(env_flag("OVERMIND_LLM_TOKEN_STREAM")),
        }
    }

    /// Construct a configuration suitable for tests: testing flag on,
    /// development environment, streaming off, artifacts in a relative
    /// directory the test is expected to override.
    pub fn for_testing() -> Self {
        Self {
            testing: true,
            max_output_tokens: 8_192,
            admin_emails: Vec::new(),
            max_users: 0,
            db_reset_password: Some("reset-me".to_string()),
            secret_key: "test-secret-key".to_string(),
            environment: Environment::Development,
            ws_envelope_version: 1,
            worker_artifact_dir: PathBuf::from("worker_artifacts"),
            llm_token_stream: AtomicBool::new(false),
        }
    }

    /// Whether LLM responses should be streamed token-by-token.
    ///
    /// Read at every agent-runner invocation so the flag can be flipped on a
    /// live process.
    pub fn llm_token_stream(&self) -> bool {
        self.llm_token_stream.load(Ordering::Relaxed)
    }

    /// Flip the streaming flag at runtime.
    pub fn set_llm_token_stream(&self, enabled: bool) {
        self.llm_token_stream.store(enabled, Ordering::Relaxed);
    }

    /// Whether the given email belongs to the configured admin list.
    pub fn is_admin_email(&self, email: &str) -> bool {
        let lowered = email.to_ascii_lowercase();
        self.admin_emails.iter().any(|e| e == &lowered)
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(Environment::parse("development"), Environment::Development);
        assert_eq!(Environment::parse("PROD"), Environment::Production);
        assert_eq!(Environment::parse("staging"), Environment::Other);
    }

    #[test]
    fn test_streaming_flag_flips_at_runtime() {
        let config = Config::for_testing();
        assert!(!config.llm_token_stream());
        config.set_llm_token_stream(true);
        assert!(config.llm_token_stream());
        config.set_llm_token_stream(false);
        assert!(!config.llm_token_stream());
    }

    #[test]
    fn test_admin_email_check_is_case_insensitive() {
        let mut config = Config::for_testing();
        config.admin_emails = vec!["ops@example.com".to_string()];
        assert!(config.is_admin_email("Ops@Example.com"));
        assert!(!config.is_admin_email("user@example.com"));
    }
}
