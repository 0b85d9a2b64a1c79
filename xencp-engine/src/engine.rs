//! Engine facade.
//!
//! The entry point callers use: observe live state, plan against declared
//! state, apply a plan, or run the whole cycle for a single entity.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::api::jsonrpc::{HttpConnector, JsonRpcTransport};
use crate::api::{ApiClient, Connector, OpaqueRef, XenApi};
use crate::audit::AuditLogger;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::coordinator::{MembershipSource, PoolCoordinator};
use crate::differ;
use crate::error::{Error, Result};
use crate::executor::{ApplyReport, Executor};
use crate::model::{ActualState, DesiredState, EntityId, EntityKind, PersistedRecord, Plan};
use crate::reconciler::{Context, Reconcilers};
use crate::session::{Credentials, SessionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Something the caller should tell the operator about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
}

impl Diagnostic {
    fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
        }
    }

    fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
        }
    }
}

/// Result of reconciling one entity.
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// Live state after the cycle; `None` when the entity does not exist.
    pub new_actual: Option<ActualState>,
    pub diagnostics: Vec<Diagnostic>,
    pub report: ApplyReport,
}

impl ReconcileOutcome {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }
}

pub struct Engine {
    ctx: Context,
    reconcilers: Arc<Reconcilers>,
    coordinator: Arc<PoolCoordinator>,
    executor: Executor,
}

impl Engine {
    /// Build an engine over an existing transport.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn XenApi>,
        connector: Arc<dyn Connector>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self> {
        config.validate()?;
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&transport),
            Credentials::new(config.username.clone(), config.password.clone()),
            config.session_ttl(),
            config.backoff(),
        ));
        let api = ApiClient::new(transport, sessions, config.backoff());
        let ctx = Context::new(api, Arc::new(config), connector, Arc::clone(&audit));

        let source: Arc<dyn MembershipSource> = Arc::new(ctx.api.clone());
        let coordinator = Arc::new(PoolCoordinator::new(source, audit));
        let reconcilers = Arc::new(Reconcilers::new());
        let executor = Executor::new(ctx.clone(), Arc::clone(&reconcilers), Arc::clone(&coordinator));

        Ok(Self {
            ctx,
            reconcilers,
            coordinator,
            executor,
        })
    }

    /// Build an engine speaking JSON-RPC to `config.host`.
    pub fn connect(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn XenApi> = Arc::new(JsonRpcTransport::new(&config.host, config.insecure_tls)?);
        let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(config.insecure_tls));
        info!(endpoint = %config.endpoint(), "Connecting to pool coordinator");
        Self::new(config, transport, connector, Arc::new(AuditLogger::new("engine")))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.ctx.audit
    }

    pub fn coordinator(&self) -> &Arc<PoolCoordinator> {
        &self.coordinator
    }

    /// Read one entity. `prior` supplies the uuid to try first.
    pub async fn observe(
        &self,
        kind: EntityKind,
        key: &str,
        prior: Option<&PersistedRecord>,
    ) -> Result<Option<ActualState>> {
        self.reconcilers
            .get(kind)
            .observe(&self.ctx, key, prior.map(|p| p.uuid.as_str()), None)
            .await
    }

    /// Every live entity relevant to `desired`: the declared ones plus every
    /// managed entity of every kind.
    pub async fn observe_all(&self, desired: &[DesiredState], prior: &[PersistedRecord]) -> Result<Vec<ActualState>> {
        let hints: BTreeMap<EntityId, &str> = prior.iter().map(|p| (p.id(), p.uuid.as_str())).collect();
        let mut observed: BTreeMap<EntityId, ActualState> = BTreeMap::new();

        for state in desired {
            let id = state.id();
            let reconciler = self.reconcilers.get(id.kind);
            let hint = hints.get(&id).copied();
            if let Some(actual) = reconciler.observe(&self.ctx, &id.key, hint, Some(&state.spec)).await? {
                observed.insert(id, actual);
            }
        }

        for kind in EntityKind::ALL {
            for actual in self.reconcilers.get(kind).list_managed(&self.ctx).await? {
                observed.entry(actual.id.clone()).or_insert(actual);
            }
        }
        Ok(observed.into_values().collect())
    }

    /// Observe and diff. Records the pool membership the plan is based on.
    pub async fn plan(&self, desired: &[DesiredState], prior: &[PersistedRecord]) -> Result<Plan> {
        for state in desired {
            state.validate()?;
        }
        let baseline = self.coordinator.membership().await?;
        let actual = self.observe_all(desired, prior).await?;
        let mut plan = differ::diff(desired, &actual)?;
        plan.baseline = Some(baseline);
        let (creates, updates, deletes) = plan.counts();
        info!(creates, updates, deletes, "Plan computed");
        Ok(plan)
    }

    pub async fn apply(&self, plan: Plan, cancel: &CancelToken) -> ApplyReport {
        self.executor.execute(plan, cancel).await
    }

    /// Full cycle for one entity.
    ///
    /// With `desired` absent, a managed entity under `key` is deleted. Errors
    /// from planning are returned; errors while applying land in the outcome.
    pub async fn reconcile(
        &self,
        kind: EntityKind,
        key: &str,
        desired: Option<&DesiredState>,
        prior: Option<&PersistedRecord>,
        cancel: &CancelToken,
    ) -> Result<ReconcileOutcome> {
        if let Some(state) = desired
            && state.id() != EntityId::new(kind, key)
        {
            return Err(Error::validation(
                kind,
                key,
                format!("desired state describes {}", state.id()),
            ));
        }
        if let Some(state) = desired {
            state.validate()?;
        }

        let reconciler = self.reconcilers.get(kind);
        let hint = prior.map(|p| p.uuid.as_str());
        let baseline = self.coordinator.membership().await?;
        let actual = reconciler
            .observe(&self.ctx, key, hint, desired.map(|d| &d.spec))
            .await?;

        let mut diagnostics = Vec::new();
        if let (Some(prior), Some(actual)) = (prior, &actual)
            && prior.attributes != actual.attributes
        {
            let changed: Vec<&str> = actual
                .attributes
                .iter()
                .filter(|(name, value)| prior.attributes.get(*name) != Some(*value))
                .map(|(name, _)| name.as_str())
                .collect();
            warn!(entity = %actual.id, "Changed outside xencp: {}", changed.join(", "));
            diagnostics.push(Diagnostic::warning(
                format!("{} changed outside xencp", actual.id),
                format!("attributes differ from the last recorded state: {}", changed.join(", ")),
            ));
        }

        let desired_set: Vec<DesiredState> = desired.cloned().into_iter().collect();
        let actual_set: Vec<ActualState> = actual.into_iter().collect();
        let mut plan = differ::diff(&desired_set, &actual_set)?;
        plan.baseline = Some(baseline);
        let report = self.executor.execute(plan, cancel).await;

        if let Some((op, err)) = &report.failed {
            diagnostics.push(Diagnostic::error(format!("{} failed", op), err.to_string()));
        }

        let new_actual = match reconciler
            .observe(&self.ctx, key, hint, desired.map(|d| &d.spec))
            .await
        {
            Ok(state) => state,
            Err(err) => {
                diagnostics.push(Diagnostic::error(
                    format!("could not read {} after the change", EntityId::new(kind, key)),
                    err.to_string(),
                ));
                None
            }
        };

        Ok(ReconcileOutcome {
            new_actual,
            diagnostics,
            report,
        })
    }

    /// Adopt an existing entity as managed under `key`.
    pub async fn import(&self, kind: EntityKind, uuid: &str, key: &str) -> Result<ActualState> {
        let reconciler = self.reconcilers.get(kind);
        if let Some(existing) = reconciler.observe(&self.ctx, key, None, None).await?
            && existing.uuid != uuid
        {
            return Err(Error::validation(
                kind,
                key,
                format!("key is already used by {}", existing.uuid),
            ));
        }
        reconciler.import(&self.ctx, uuid, key).await?;
        info!(entity = %EntityId::new(kind, key), uuid, "Imported");
        reconciler
            .observe(&self.ctx, key, Some(uuid), None)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {} after import", kind, uuid)))
    }

    /// Every managed entity of `kind`.
    pub async fn list_managed(&self, kind: EntityKind) -> Result<Vec<ActualState>> {
        self.reconcilers.get(kind).list_managed(&self.ctx).await
    }

    /// Raw attribute maps of every object of `kind`, managed or not.
    pub async fn list_entities(&self, kind: EntityKind) -> Result<Vec<(OpaqueRef, BTreeMap<String, serde_json::Value>)>> {
        self.ctx.api.list_entities(kind.class()).await
    }

    /// Log out of the coordinator.
    pub async fn shutdown(&self) -> Result<()> {
        self.ctx.api.sessions().logout().await
    }
}
