//! Plan executor.
//!
//! Runs a plan's operations strictly in order. Operations that change pool
//! topology run while holding the pool lock; the guard releases it on every
//! exit path, including cancellation and a dropped future. Each operation is
//! confirmed by re-reading the entity before it counts as applied.
//!
//! Nothing is rolled back. When operation *k* fails, the report lists
//! operations before it as applied and the rest as pending; the next cycle
//! observes the true state and plans only what is still missing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::coordinator::{Membership, PoolCoordinator};
use crate::differ::delta;
use crate::error::{Error, Result};
use crate::model::{Action, ActualState, Operation, Plan};
use crate::reconciler::{Context, Reconciler, Reconcilers};

/// One operation confirmed by re-reading the entity.
#[derive(Debug, Clone)]
pub struct AppliedOperation {
    pub operation: Operation,
    /// Verified live state; `None` after a delete.
    pub actual: Option<ActualState>,
}

/// Outcome of executing a plan.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<AppliedOperation>,
    /// The operation that stopped execution and why.
    pub failed: Option<(Operation, Error)>,
    /// Operations after the failed one, never attempted.
    pub pending: Vec<Operation>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }
}

pub struct Executor {
    ctx: Context,
    reconcilers: Arc<Reconcilers>,
    coordinator: Arc<PoolCoordinator>,
}

impl Executor {
    pub fn new(ctx: Context, reconcilers: Arc<Reconcilers>, coordinator: Arc<PoolCoordinator>) -> Self {
        Self {
            ctx,
            reconcilers,
            coordinator,
        }
    }

    /// Execute `plan` in order, stopping at the first failure.
    pub async fn execute(&self, plan: Plan, cancel: &CancelToken) -> ApplyReport {
        let ctx = self.ctx.with_cancel(cancel.clone());
        let mut report = ApplyReport::default();
        let baseline = plan.baseline;
        let mut operations = plan.operations.into_iter();

        while let Some(op) = operations.next() {
            let outcome = match ctx.check_cancelled() {
                Ok(()) => {
                    tokio::select! {
                        result = self.execute_one(&ctx, &op, baseline.as_ref()) => result,
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                    }
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(actual) => {
                    ctx.audit
                        .applied(op.action, &op.id, actual.as_ref().map(|a| a.uuid.as_str()));
                    report.applied.push(AppliedOperation { operation: op, actual });
                }
                Err(err) => {
                    let err = err.in_operation(op.action, op.kind(), op.key());
                    warn!(op = %op, "Operation failed: {}", err);
                    ctx.audit.failed(op.action, &op.id, &err);
                    report.failed = Some((op, err));
                    report.pending = operations.collect();
                    break;
                }
            }
        }

        info!(
            applied = report.applied.len(),
            pending = report.pending.len(),
            failed = report.failed.is_some(),
            "Plan executed"
        );
        report
    }

    async fn execute_one(
        &self,
        ctx: &Context,
        op: &Operation,
        baseline: Option<&Membership>,
    ) -> Result<Option<ActualState>> {
        let reconciler = self.reconcilers.get(op.kind());

        if !reconciler.touches_topology(op) {
            return self.run(ctx, reconciler, op).await;
        }

        let owner = op.to_string();
        let guard = self
            .coordinator
            .acquire(&owner, baseline, ctx.config.lock_timeout(), &ctx.cancel)
            .await?;
        debug!(owner = %guard.owner(), "Running topology operation");
        let result = self.run(ctx, reconciler, op).await;
        // Publish our own change so plans made before it still match.
        guard.finish().await?;
        result
    }

    async fn run(&self, ctx: &Context, reconciler: &dyn Reconciler, op: &Operation) -> Result<Option<ActualState>> {
        match op.action {
            Action::Create => {
                let uuid = reconciler.create(ctx, op).await?;
                debug!(entity = %op.id, uuid = %uuid, "Created");
                self.verify_present(ctx, reconciler, op, Some(&uuid)).await.map(Some)
            }
            Action::Update => {
                let actual = reconciler
                    .observe(ctx, op.key(), op.uuid.as_deref(), op.spec.as_ref())
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("{} vanished before update", op.id)))?;
                reconciler.update(ctx, op, &actual).await?;
                self.verify_present(ctx, reconciler, op, Some(&actual.uuid)).await.map(Some)
            }
            Action::Delete => {
                match reconciler.observe(ctx, op.key(), op.uuid.as_deref(), None).await? {
                    Some(actual) => reconciler.delete(ctx, op, &actual).await?,
                    None => debug!(entity = %op.id, "Already gone"),
                }
                self.verify_absent(ctx, reconciler, op).await.map(|_| None)
            }
        }
    }

    /// Re-read until every desired attribute shows, within the verify budget.
    async fn verify_present(
        &self,
        ctx: &Context,
        reconciler: &dyn Reconciler,
        op: &Operation,
        uuid: Option<&str>,
    ) -> Result<ActualState> {
        let desired = op.spec.as_ref().map(|s| s.attributes()).unwrap_or_default();
        let mut delays = ctx.config.verify_backoff().delays();

        loop {
            let message = match reconciler.observe(ctx, op.key(), uuid, op.spec.as_ref()).await? {
                Some(actual) => {
                    let missing = delta(&desired, &actual.attributes);
                    if missing.is_empty() && !actual.incomplete {
                        return Ok(actual);
                    }
                    if missing.is_empty() {
                        "creation has not finished".to_string()
                    } else {
                        let names: Vec<&str> = missing.keys().map(String::as_str).collect();
                        format!("attributes {} still differ", names.join(", "))
                    }
                }
                None => "entity not found after the change".to_string(),
            };

            match delays.next() {
                Some(delay) => {
                    debug!(entity = %op.id, "Post-condition not met yet: {}", message);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(Error::verification(op.kind(), op.key(), message)),
            }
        }
    }

    async fn verify_absent(&self, ctx: &Context, reconciler: &dyn Reconciler, op: &Operation) -> Result<()> {
        let mut delays = ctx.config.verify_backoff().delays();
        loop {
            if reconciler
                .observe(ctx, op.key(), op.uuid.as_deref(), None)
                .await?
                .is_none()
            {
                return Ok(());
            }
            match delays.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(Error::verification(op.kind(), op.key(), "entity still present after delete"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::coordinator::MembershipSource;
    use crate::differ::diff;
    use crate::mock::{MOCK_TEMPLATE, MockCluster};
    use crate::model::{DesiredState, EntityKind};
    use crate::reconciler::testing::{context, desired};
    use serde_json::json;

    fn executor(cluster: &MockCluster) -> Executor {
        let ctx = context(cluster);
        let source: Arc<dyn MembershipSource> = Arc::new(ctx.api.clone());
        let coordinator = Arc::new(PoolCoordinator::new(source, Arc::clone(&ctx.audit)));
        Executor::new(ctx, Arc::new(Reconcilers::new()), coordinator)
    }

    fn network(key: &str, mtu: u32) -> DesiredState {
        desired(json!({"key": key, "kind": "network", "name_label": key, "mtu": mtu}))
    }

    fn vm(key: &str) -> DesiredState {
        desired(json!({
            "key": key, "kind": "vm", "name_label": key, "template": MOCK_TEMPLATE,
            "vcpus": 1, "memory_static_max": 1073741824,
            "interfaces": [{"network": "lan", "device": 0}]
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_in_order_and_verify() {
        let cluster = MockCluster::new();
        let executor = executor(&cluster);
        let plan = diff(&[vm("app"), network("lan", 1500)], &[]).unwrap();

        let report = executor.execute(plan, &CancelToken::new()).await;
        assert!(report.is_success(), "{:?}", report.failed);
        let order: Vec<&str> = report.applied.iter().map(|a| a.operation.key()).collect();
        assert_eq!(order, vec!["lan", "app"]);
        assert!(report.applied.iter().all(|a| a.actual.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reports_pending_without_rollback() {
        let cluster = MockCluster::new();
        let executor = executor(&cluster);
        cluster.inject(
            "Async.VM.provision",
            crate::api::ApiError::code("INTERNAL_ERROR", &["disk full"]),
            1,
        );
        let plan = diff(&[vm("app"), network("lan", 1500), network("zz", 9000)], &[]).unwrap();

        let report = executor.execute(plan, &CancelToken::new()).await;
        let (failed, err) = report.failed.as_ref().unwrap();
        assert_eq!(failed.key(), "app");
        assert!(matches!(err.root(), Error::RemoteInternal(_)));
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.pending.len(), 1);
        assert_eq!(report.pending[0].key(), "zz");
        assert!(cluster.find("network", "name_label", "lan").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_runs_nothing() {
        let cluster = MockCluster::new();
        let executor = executor(&cluster);
        let cancel = CancelToken::new();
        cancel.cancel();
        let plan = diff(&[network("lan", 1500)], &[]).unwrap();

        let report = executor.execute(plan, &cancel).await;
        assert!(matches!(report.failed.as_ref().unwrap().1.root(), Error::Cancelled));
        assert!(report.applied.is_empty());
        assert!(cluster.find("network", "name_label", "lan").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_of_vanished_entity_succeeds() {
        let cluster = MockCluster::new();
        let executor = executor(&cluster);
        let plan = Plan {
            operations: vec![Operation {
                action: Action::Delete,
                id: crate::model::EntityId::new(EntityKind::Network, "gone"),
                uuid: None,
                delta: Default::default(),
                spec: None,
                depends_on: vec![],
            }],
            baseline: None,
        };

        let report = executor.execute(plan, &CancelToken::new()).await;
        assert!(report.is_success());
        assert!(report.applied[0].actual.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_topology_operation_releases_lock_on_failure() {
        let cluster = MockCluster::new();
        let executor = executor(&cluster);
        cluster.inject("pool.set_name_label", crate::api::ApiError::code("INTERNAL_ERROR", &[]), 1);
        let pool = desired(json!({"key": "main", "kind": "pool", "name_label": "main"}));
        let plan = diff(&[pool], &[]).unwrap();

        let report = executor.execute(plan, &CancelToken::new()).await;
        assert!(!report.is_success());
        assert!(!executor.coordinator.is_held());
        let events = executor.ctx.audit.events();
        assert!(events.contains(&AuditEvent::LockAcquired { owner: "create pool/main".into() }));
        assert!(events.contains(&AuditEvent::LockReleased { owner: "create pool/main".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_audit_records_applied_operations() {
        let cluster = MockCluster::new();
        let executor = executor(&cluster);

        let plan = diff(&[network("lan", 1500)], &[]).unwrap();
        executor.execute(plan, &CancelToken::new()).await;
        assert!(matches!(
            executor.ctx.audit.events().as_slice(),
            [AuditEvent::Applied { action: Action::Create, .. }]
        ));
    }
}
