//! Engine configuration, supplied once at startup.

use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};

pub const ENV_HOST: &str = "XENSERVER_HOST";
pub const ENV_USERNAME: &str = "XENSERVER_USERNAME";
pub const ENV_PASSWORD: &str = "XENSERVER_PASSWORD";

/// Connection settings, timeouts and retry budgets.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pool coordinator address; `https://` is assumed when no scheme is given.
    pub host: String,
    pub username: String,
    pub password: String,
    /// Accept self-signed host certificates.
    pub insecure_tls: bool,

    /// Sessions are renewed proactively after this long.
    pub session_ttl_secs: u64,
    /// Upper bound for a single remote task.
    pub task_timeout_secs: u64,
    /// Upper bound for waiting on the pool lock.
    pub lock_timeout_secs: u64,

    pub poll_initial_ms: u64,
    pub poll_multiplier: f64,
    pub poll_max_interval_ms: u64,
    /// Retries for transient network failures before escalating.
    pub transient_attempts: u32,
    /// Re-reads allowed while waiting for a post-condition to become visible.
    pub verify_attempts: u32,
    /// Upper bound for joined hosts to report live.
    pub host_live_timeout_secs: u64,
    /// Upper bound for a PIF switched to DHCP to obtain an address.
    pub dhcp_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            insecure_tls: false,
            session_ttl_secs: 20 * 60,
            task_timeout_secs: 10 * 60,
            lock_timeout_secs: 5 * 60,
            poll_initial_ms: 1000,
            poll_multiplier: 2.0,
            poll_max_interval_ms: 10_000,
            transient_attempts: 5,
            verify_attempts: 3,
            host_live_timeout_secs: 5 * 60,
            dhcp_timeout_secs: 60,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure_tls", &self.insecure_tls)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("task_timeout_secs", &self.task_timeout_secs)
            .field("lock_timeout_secs", &self.lock_timeout_secs)
            .field("transient_attempts", &self.transient_attempts)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Fill connection settings from `XENSERVER_*` variables via `lookup`.
    ///
    /// Values already set take precedence over the environment.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.host.is_empty()
            && let Some(host) = lookup(ENV_HOST)
        {
            self.host = host;
        }
        if self.username.is_empty()
            && let Some(username) = lookup(ENV_USERNAME)
        {
            self.username = username;
        }
        if self.password.is_empty()
            && let Some(password) = lookup(ENV_PASSWORD)
        {
            self.password = password;
        }
        self
    }

    /// Same as [`EngineConfig::with_env`] reading the process environment.
    pub fn with_process_env(self) -> Self {
        self.with_env(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(config_error("host must be set"));
        }
        if self.username.trim().is_empty() {
            return Err(config_error("username must be set"));
        }
        if self.task_timeout_secs == 0 || self.lock_timeout_secs == 0 {
            return Err(config_error("timeouts must be greater than zero"));
        }
        if self.poll_initial_ms == 0 || self.poll_multiplier < 1.0 {
            return Err(config_error(
                "poll interval must be positive and must not shrink",
            ));
        }
        Ok(())
    }

    /// Base URL of the coordinator.
    pub fn endpoint(&self) -> String {
        normalize_endpoint(&self.host)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn host_live_timeout(&self) -> Duration {
        Duration::from_secs(self.host_live_timeout_secs)
    }

    pub fn dhcp_timeout(&self) -> Duration {
        Duration::from_secs(self.dhcp_timeout_secs)
    }

    /// Backoff used for polling and for retrying transient failures.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.poll_initial_ms),
            self.poll_multiplier,
            Duration::from_millis(self.poll_max_interval_ms),
            self.transient_attempts,
        )
    }

    /// Backoff used for post-condition re-reads.
    pub fn verify_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.verify_attempts,
            ..self.backoff()
        }
    }
}

/// Prefix `https://` when the address carries no scheme and drop trailing slashes.
pub fn normalize_endpoint(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

fn config_error(message: &str) -> Error {
    Error::Config(message.to_string())
}
