//! Pool coordinator.
//!
//! Serializes pool-topology changes (join, eject, HA, management network)
//! behind a single lock. The lock is `Free` or `Held(owner)`. Before granting
//! it, the coordinator re-reads pool membership and compares it with the
//! membership the caller's plan was computed against. Membership changes
//! made by earlier lock holders are published on release and accepted; any
//! other difference means the pool changed out of band, and the caller gets
//! [`Error::DriftDetected`] instead of the lock and must re-plan.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ApiClient, HostRecord, PoolRecord};
use crate::audit::AuditLogger;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Pool topology as seen at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// Coordinator host uuid.
    pub coordinator: String,
    /// Uuids of every member, coordinator included.
    pub hosts: BTreeSet<String>,
    pub ha_enabled: bool,
}

impl Membership {
    /// Human-readable difference from `earlier`.
    pub fn describe_change(&self, earlier: &Membership) -> String {
        let mut changes = Vec::new();
        let joined: Vec<&String> = self.hosts.difference(&earlier.hosts).collect();
        let left: Vec<&String> = earlier.hosts.difference(&self.hosts).collect();
        if !joined.is_empty() {
            changes.push(format!("hosts joined: {}", join(&joined)));
        }
        if !left.is_empty() {
            changes.push(format!("hosts left: {}", join(&left)));
        }
        if self.coordinator != earlier.coordinator {
            changes.push(format!(
                "coordinator changed from {} to {}",
                earlier.coordinator, self.coordinator
            ));
        }
        if self.ha_enabled != earlier.ha_enabled {
            changes.push(format!("ha_enabled changed to {}", self.ha_enabled));
        }
        changes.join("; ")
    }
}

fn join(items: &[&String]) -> String {
    items.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
}

/// Reads the current pool membership.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn membership(&self) -> Result<Membership>;
}

#[async_trait]
impl MembershipSource for ApiClient {
    async fn membership(&self) -> Result<Membership> {
        let (_, pool) = self
            .get_all_records::<PoolRecord>()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::RemoteInternal("no pool object on coordinator".into()))?;
        let hosts = self.get_all_records::<HostRecord>().await?;
        let coordinator = hosts
            .iter()
            .find(|(r, _)| *r == pool.master)
            .map(|(_, h)| h.uuid.clone())
            .ok_or_else(|| Error::RemoteInternal(format!("pool master {} is not a host", pool.master)))?;
        Ok(Membership {
            coordinator,
            hosts: hosts.into_iter().map(|(_, h)| h.uuid).collect(),
            ha_enabled: pool.ha_enabled,
        })
    }
}

/// Transitions kept for matching older plans against the current pool.
const MAX_TRANSITIONS: usize = 64;

/// Proof of holding the pool lock.
#[derive(Debug)]
pub struct PoolLockToken {
    id: u64,
    owner: String,
    /// Membership read right after acquiring.
    before: Membership,
}

impl PoolLockToken {
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[derive(Default)]
struct LockState {
    holder: Option<(u64, String)>,
    next_id: u64,
    /// Membership changes made by lock holders, oldest first.
    transitions: Vec<(Membership, Membership)>,
}

impl LockState {
    /// Whether `current` follows from `baseline` through holders' own changes.
    fn explains(&self, baseline: &Membership, current: &Membership) -> bool {
        let mut reached = vec![baseline];
        let mut next = 0;
        while let Some(from) = reached.get(next).copied() {
            if from == current {
                return true;
            }
            for (before, after) in &self.transitions {
                if before == from && !reached.contains(&after) {
                    reached.push(after);
                }
            }
            next += 1;
        }
        false
    }
}

pub struct PoolCoordinator {
    source: Arc<dyn MembershipSource>,
    state: Mutex<LockState>,
    released: Notify,
    audit: Arc<AuditLogger>,
}

impl PoolCoordinator {
    pub fn new(source: Arc<dyn MembershipSource>, audit: Arc<AuditLogger>) -> Self {
        Self {
            source,
            state: Mutex::new(LockState::default()),
            released: Notify::new(),
            audit,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        // Critical sections never panic; recover the data if one somehow did.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.lock_state().holder.as_ref().map(|(_, owner)| owner.clone())
    }

    pub fn is_held(&self) -> bool {
        self.lock_state().holder.is_some()
    }

    /// Current membership, to be recorded as a plan's baseline.
    pub async fn membership(&self) -> Result<Membership> {
        self.source.membership().await
    }

    /// Wait for the lock, then verify membership has not drifted.
    ///
    /// `baseline` is the membership the caller planned against; `None` skips
    /// the drift check. Returns the token together with the freshly read
    /// membership. Fails with [`Error::Timeout`] when `timeout` passes,
    /// [`Error::Cancelled`] when `cancel` fires, or [`Error::DriftDetected`]
    /// when membership differs from the baseline in a way no lock holder
    /// accounts for. In every failure case the lock is not held afterwards.
    pub async fn acquire_token(
        &self,
        owner: &str,
        baseline: Option<&Membership>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<(PoolLockToken, Membership)> {
        let started = Instant::now();
        let deadline = started + timeout;

        let id = loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();
                match &state.holder {
                    None => {
                        state.next_id += 1;
                        let id = state.next_id;
                        state.holder = Some((id, owner.to_string()));
                        break id;
                    }
                    Some((_, holder)) => {
                        debug!(owner, holder = %holder, "Waiting for pool lock");
                    }
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout {
                        what: format!("pool lock for {}", owner),
                        elapsed_secs: started.elapsed().as_secs(),
                    });
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        };

        let current = match self.source.membership().await {
            Ok(current) => current,
            Err(err) => {
                self.release_id(id, owner);
                return Err(err);
            }
        };

        let drift = baseline
            .filter(|baseline| !self.lock_state().explains(baseline, &current))
            .map(|baseline| current.describe_change(baseline));

        if let Some(detail) = drift {
            warn!(owner, "Pool membership changed out of band: {}", detail);
            self.audit.drift_detected(&detail);
            self.release_id(id, owner);
            return Err(Error::DriftDetected(detail));
        }

        let token = PoolLockToken {
            id,
            owner: owner.to_string(),
            before: current.clone(),
        };
        self.audit.lock_acquired(owner);
        Ok((token, current))
    }

    /// Acquire and wrap the token in a guard that releases on drop.
    pub async fn acquire(
        self: &Arc<Self>,
        owner: &str,
        baseline: Option<&Membership>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<PoolLockGuard> {
        let (token, membership) = self.acquire_token(owner, baseline, timeout, cancel).await?;
        Ok(PoolLockGuard {
            coordinator: Arc::clone(self),
            token: Some(token),
            membership,
        })
    }

    /// Release the lock held by `token`.
    ///
    /// `after` is the membership the holder left behind. A change from the
    /// membership at acquire time is published so plans made before it still
    /// match. `None` publishes nothing: plans from before the lock was taken
    /// keep detecting any change.
    pub fn release(&self, token: &PoolLockToken, after: Option<Membership>) -> Result<()> {
        {
            let mut state = self.lock_state();
            match &state.holder {
                Some((id, _)) if *id == token.id => {}
                Some((_, holder)) => {
                    return Err(Error::LockMisuse(format!(
                        "{} tried to release a lock held by {}",
                        token.owner, holder
                    )));
                }
                None => {
                    return Err(Error::LockMisuse(format!(
                        "{} released a lock that is not held",
                        token.owner
                    )));
                }
            }
            state.holder = None;
            if let Some(after) = after
                && after != token.before
            {
                state.transitions.push((token.before.clone(), after));
                if state.transitions.len() > MAX_TRANSITIONS {
                    state.transitions.remove(0);
                }
            }
        }
        self.audit.lock_released(&token.owner);
        self.released.notify_waiters();
        Ok(())
    }

    fn release_id(&self, id: u64, owner: &str) {
        let released = {
            let mut state = self.lock_state();
            if state.holder.as_ref().is_some_and(|(held, _)| *held == id) {
                state.holder = None;
                true
            } else {
                false
            }
        };
        if released {
            debug!(owner, "Pool lock released without acquiring");
            self.released.notify_waiters();
        }
    }
}

/// Holds the pool lock until [`PoolLockGuard::release`] or drop.
pub struct PoolLockGuard {
    coordinator: Arc<PoolCoordinator>,
    token: Option<PoolLockToken>,
    membership: Membership,
}

impl PoolLockGuard {
    /// Membership read while acquiring.
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn owner(&self) -> &str {
        self.token.as_ref().map(|t| t.owner.as_str()).unwrap_or_default()
    }

    /// Release, publishing the change to `after`.
    pub fn release(mut self, after: Option<Membership>) -> Result<()> {
        match self.token.take() {
            Some(token) => self.coordinator.release(&token, after),
            None => Ok(()),
        }
    }

    /// Re-read membership and release, publishing the holder's change.
    pub async fn finish(self) -> Result<()> {
        let after = match self.coordinator.source.membership().await {
            Ok(membership) => Some(membership),
            Err(err) => {
                warn!(owner = %self.owner(), "Could not read membership before releasing pool lock: {}", err);
                None
            }
        };
        self.release(after)
    }
}

impl Drop for PoolLockGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take()
            && let Err(err) = self.coordinator.release(&token, None)
        {
            warn!(owner = %token.owner, "Pool lock release on drop failed: {}", err);
        }
    }
}

impl fmt::Debug for PoolLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLockGuard")
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Membership that tests can change between reads.
    struct FakePool {
        hosts: Mutex<BTreeSet<String>>,
        reads: AtomicUsize,
        fail: AtomicBool,
    }

    impl FakePool {
        fn new(hosts: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                hosts: Mutex::new(hosts.iter().map(|h| h.to_string()).collect()),
                reads: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn join(&self, host: &str) {
            self.hosts.lock().unwrap().insert(host.to_string());
        }
    }

    #[async_trait]
    impl MembershipSource for FakePool {
        async fn membership(&self) -> Result<Membership> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::TransientNetwork {
                    attempts: 1,
                    message: "unreachable".into(),
                });
            }
            Ok(Membership {
                coordinator: "h1".into(),
                hosts: self.hosts.lock().unwrap().clone(),
                ha_enabled: false,
            })
        }
    }

    fn coordinator(pool: &Arc<FakePool>) -> Arc<PoolCoordinator> {
        Arc::new(PoolCoordinator::new(pool.clone(), Arc::new(AuditLogger::new_noop())))
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        let cancel = CancelToken::new();

        let (token, membership) = coord.acquire_token("join a", None, WAIT, &cancel).await.unwrap();
        assert_eq!(coord.holder().as_deref(), Some("join a"));
        assert_eq!(membership.hosts.len(), 1);

        coord.release(&token, Some(membership)).unwrap();
        assert!(!coord.is_held());
    }

    #[tokio::test]
    async fn test_stale_token_is_misuse() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        let cancel = CancelToken::new();

        let (first, _) = coord.acquire_token("first", None, WAIT, &cancel).await.unwrap();
        coord.release(&first, None).unwrap();
        assert!(matches!(coord.release(&first, None), Err(Error::LockMisuse(_))));

        let (second, _) = coord.acquire_token("second", None, WAIT, &cancel).await.unwrap();
        assert!(matches!(coord.release(&first, None), Err(Error::LockMisuse(_))));
        assert_eq!(coord.holder().as_deref(), Some("second"));
        coord.release(&second, None).unwrap();
    }

    #[tokio::test]
    async fn test_out_of_band_change_is_drift() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        let cancel = CancelToken::new();

        let baseline = coord.membership().await.unwrap();
        pool.join("h9");
        match coord.acquire_token("join h2", Some(&baseline), WAIT, &cancel).await {
            Err(Error::DriftDetected(detail)) => assert!(detail.contains("h9")),
            other => panic!("Unexpected response: {:?}", other),
        }
        assert!(!coord.is_held());

        // A plan made after the change goes through.
        let fresh = coord.membership().await.unwrap();
        let (token, membership) = coord.acquire_token("join h2", Some(&fresh), WAIT, &cancel).await.unwrap();
        assert!(membership.hosts.contains("h9"));
        coord.release(&token, Some(membership)).unwrap();
    }

    #[tokio::test]
    async fn test_holder_changes_are_not_drift() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        let cancel = CancelToken::new();
        let baseline = coord.membership().await.unwrap();

        let first = coord.acquire("join a", Some(&baseline), WAIT, &cancel).await.unwrap();
        pool.join("a");
        first.finish().await.unwrap();

        let second = coord.acquire("join b", Some(&baseline), WAIT, &cancel).await.unwrap();
        pool.join("b");
        second.finish().await.unwrap();

        // Both published changes chain back to the original baseline.
        let (token, _) = coord.acquire_token("join c", Some(&baseline), WAIT, &cancel).await.unwrap();
        coord.release(&token, None).unwrap();

        pool.join("x");
        let err = coord.acquire_token("join c", Some(&baseline), WAIT, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::DriftDetected(_)));
    }

    #[tokio::test]
    async fn test_newer_baseline_does_not_mask_older_plan() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        let cancel = CancelToken::new();

        let older = coord.membership().await.unwrap();
        pool.join("h5");
        let newer = coord.membership().await.unwrap();

        let (token, _) = coord.acquire_token("rename", Some(&newer), WAIT, &cancel).await.unwrap();
        coord.release(&token, None).unwrap();

        let err = coord.acquire_token("join h2", Some(&older), WAIT, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::DriftDetected(_)));
    }

    #[tokio::test]
    async fn test_dropped_guard_publishes_nothing() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        let cancel = CancelToken::new();
        let baseline = coord.membership().await.unwrap();

        {
            let _guard = coord.acquire("join a", Some(&baseline), WAIT, &cancel).await.unwrap();
            pool.join("a");
        }
        assert!(!coord.is_held());

        let err = coord.acquire_token("join b", Some(&baseline), WAIT, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::DriftDetected(_)));
    }

    #[tokio::test]
    async fn test_no_baseline_skips_drift_check() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        pool.join("h2");
        tokio_test::assert_ok!(coord.acquire_token("operator", None, WAIT, &CancelToken::new()).await);
    }

    #[tokio::test]
    async fn test_membership_read_failure_releases() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        pool.fail.store(true, Ordering::SeqCst);

        let err = coord
            .acquire_token("join", None, WAIT, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!coord.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        let cancel = CancelToken::new();

        let _held = coord.acquire("holder", None, WAIT, &cancel).await.unwrap();
        let err = coord
            .acquire_token("waiter", None, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(coord.holder().as_deref(), Some("holder"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_take_lock() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);

        let held = coord.acquire("holder", None, WAIT, &CancelToken::new()).await.unwrap();
        let cancel = CancelToken::new();
        let waiter = {
            let coord = Arc::clone(&coord);
            let cancel = cancel.clone();
            tokio::spawn(async move { coord.acquire_token("waiter", None, Duration::from_secs(60), &cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
        drop(held);
        assert!(!coord.is_held());
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        {
            let guard = coord.acquire("scoped", None, WAIT, &CancelToken::new()).await.unwrap();
            assert_eq!(guard.owner(), "scoped");
            assert!(coord.is_held());
        }
        assert!(!coord.is_held());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release_with_fresh_membership() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        let cancel = CancelToken::new();

        let first = coord.acquire("join a", None, WAIT, &cancel).await.unwrap();
        let second = {
            let coord = Arc::clone(&coord);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let guard = coord.acquire("join b", None, WAIT, &cancel).await?;
                let hosts = guard.membership().hosts.clone();
                guard.finish().await?;
                Ok::<_, Error>(hosts)
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coord.holder().as_deref(), Some("join a"));
        pool.join("a");
        first.finish().await.unwrap();

        let hosts = second.await.unwrap().unwrap();
        assert!(hosts.contains("a"));
        assert!(!coord.is_held());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_under_contention() {
        let pool = FakePool::new(&["h1"]);
        let coord = coordinator(&pool);
        let inside = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let coord = Arc::clone(&coord);
            let inside = Arc::clone(&inside);
            let entries = Arc::clone(&entries);
            tasks.push(tokio::spawn(async move {
                let guard = coord
                    .acquire(&format!("worker {}", i), None, Duration::from_secs(30), &CancelToken::new())
                    .await
                    .unwrap();
                assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                entries.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.store(false, Ordering::SeqCst);
                if i % 2 == 0 {
                    drop(guard);
                } else {
                    guard.finish().await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 16);
        assert!(!coord.is_held());
    }
}
