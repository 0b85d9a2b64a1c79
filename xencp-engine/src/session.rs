//! Session manager.
//!
//! Owns the single authenticated session for the target pool. Readers share
//! the cached session; re-authentication is serialized so that concurrent
//! callers hitting an expired session trigger exactly one login.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ErrorCategory, XenApi};
use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};

const API_VERSION: &str = "2.0";
const ORIGINATOR: &str = "xencp";

/// Consecutive credential rejections tolerated before giving up.
const MAX_REJECTIONS: u32 = 2;

/// Username and password for `session.login_with_password`.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// An authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    token: String,
    generation: u64,
    expires_at: Instant,
}

impl Session {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Increments on every successful login.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct SessionManager {
    transport: Arc<dyn XenApi>,
    credentials: Credentials,
    ttl: Duration,
    retry: BackoffPolicy,
    current: RwLock<Option<Session>>,
    login_lock: Mutex<()>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn XenApi>,
        credentials: Credentials,
        ttl: Duration,
        retry: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            credentials,
            ttl,
            retry,
            current: RwLock::new(None),
            login_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Return a valid session, logging in if none is cached or it has expired.
    pub async fn acquire(&self) -> Result<Session> {
        if let Some(session) = self.current.read().await.as_ref()
            && !session.is_expired()
        {
            return Ok(session.clone());
        }
        self.refresh(None).await
    }

    /// Replace `stale` after the remote side rejected it.
    ///
    /// If another caller already replaced it, their session is returned.
    pub async fn renew(&self, stale: &Session) -> Result<Session> {
        self.refresh(Some(stale.generation)).await
    }

    /// Number of successful logins so far.
    pub fn login_count(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn refresh(&self, stale_generation: Option<u64>) -> Result<Session> {
        let _login = self.login_lock.lock().await;

        // Someone may have logged in while we waited for the lock.
        if let Some(session) = self.current.read().await.as_ref()
            && !session.is_expired()
            && stale_generation != Some(session.generation)
        {
            debug!(generation = session.generation, "Reusing freshly renewed session");
            return Ok(session.clone());
        }

        let session = self.login().await?;
        *self.current.write().await = Some(session.clone());
        Ok(session)
    }

    async fn login(&self) -> Result<Session> {
        let mut delays = self.retry.delays();
        let mut rejections = 0;

        loop {
            let params = vec![
                json!(self.credentials.username),
                json!(self.credentials.password),
                json!(API_VERSION),
                json!(ORIGINATOR),
            ];

            let err = match self
                .transport
                .call("session.login_with_password", params)
                .await
            {
                Ok(Value::String(token)) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(user = %self.credentials.username, generation, "Logged in");
                    return Ok(Session {
                        token,
                        generation,
                        expires_at: Instant::now() + self.ttl,
                    });
                }
                Ok(other) => {
                    return Err(Error::RemoteInternal(format!(
                        "login returned {} instead of a session reference",
                        other
                    )));
                }
                Err(err) => err,
            };

            match err.category() {
                ErrorCategory::Auth => {
                    rejections += 1;
                    if rejections >= MAX_REJECTIONS {
                        return Err(Error::Auth(format!(
                            "credentials for '{}' rejected {} times: {}",
                            self.credentials.username, rejections, err
                        )));
                    }
                    warn!(user = %self.credentials.username, "Login rejected, retrying once: {}", err);
                }
                ErrorCategory::TransientNetwork => {
                    rejections = 0;
                    match delays.next() {
                        Some(delay) => {
                            warn!("Login failed, retrying in {:?}: {}", delay, err);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(Error::TransientNetwork {
                                attempts: delays.attempts() + 1,
                                message: format!("login: {}", err),
                            });
                        }
                    }
                }
                _ => return Err(err.into()),
            }
        }
    }

    /// Log out and drop the cached session.
    pub async fn logout(&self) -> Result<()> {
        let _login = self.login_lock.lock().await;
        let Some(session) = self.current.write().await.take() else {
            return Ok(());
        };
        self.transport
            .call("session.logout", vec![json!(session.token)])
            .await
            .map(|_| ())
            .map_err(Error::from)?;
        info!("Logged out");
        Ok(())
    }
}
