//! Reconcilers for the managed entity kinds.
//!
//! Each reconciler observes live state for its kind and carries out the
//! create, update and delete operations the differ produced. The set of kinds
//! is fixed; [`Reconcilers::get`] selects the implementation by kind tag.
//!
//! Ownership is recorded in the entity's `other_config`: `xencp_managed`,
//! `xencp_key` and `xencp_kind`. Only tagged entities are ever observed as
//! managed or deleted.

pub mod network;
pub mod pif;
pub mod pool;
pub mod snapshot;
pub mod sr;
pub mod vdi;
pub mod vm;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use crate::api::{ApiClient, Connector, OpaqueRef, RemoteCall, Tagged, XenRecord, is_null_ref};
use crate::audit::AuditLogger;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{ActualState, Attributes, EntityKind, EntitySpec, Operation, ResourceSpec, is_uuid};
use crate::task::TaskPoller;

pub const TAG_MANAGED: &str = "xencp_managed";
pub const TAG_KEY: &str = "xencp_key";
pub const TAG_KIND: &str = "xencp_kind";
/// Comma-separated user `other_config` keys owned by the engine.
pub const TAG_OTHER_CONFIG_KEYS: &str = "xencp_other_config_keys";

/// Everything a reconciler needs for one cycle.
#[derive(Clone)]
pub struct Context {
    pub api: ApiClient,
    pub tasks: Arc<TaskPoller>,
    pub audit: Arc<AuditLogger>,
    pub config: Arc<EngineConfig>,
    pub connector: Arc<dyn Connector>,
    pub cancel: CancelToken,
}

impl Context {
    pub fn new(
        api: ApiClient,
        config: Arc<EngineConfig>,
        connector: Arc<dyn Connector>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let tasks = TaskPoller::new(api.clone(), config.backoff(), config.transient_attempts);
        Self {
            api,
            tasks: Arc::new(tasks),
            audit,
            config,
            connector,
            cancel: CancelToken::new(),
        }
    }

    /// Same context bound to another cancellation token.
    pub fn with_cancel(&self, cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Run `method` as a task and wait for it.
    ///
    /// Returns the reference the task produced, or `None` when the task
    /// object vanished and `post_condition` confirmed the effect.
    pub async fn run_task<F, Fut>(
        &self,
        method: &str,
        params: Vec<Value>,
        post_condition: F,
    ) -> Result<Option<OpaqueRef>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.tasks
            .run(
                RemoteCall::task(method, params),
                self.config.task_timeout(),
                &self.cancel,
                post_condition,
            )
            .await
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-kind reconciliation capability set.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Read the live entity managed under `key`.
    ///
    /// `uuid_hint` (from the persisted record) is tried before searching by
    /// tag. `desired`, when given, controls how references are spelled so
    /// that a uuid reference compares equal to the same object's key.
    async fn observe(
        &self,
        ctx: &Context,
        key: &str,
        uuid_hint: Option<&str>,
        desired: Option<&ResourceSpec>,
    ) -> Result<Option<ActualState>>;

    /// Every managed entity of this kind.
    async fn list_managed(&self, ctx: &Context) -> Result<Vec<ActualState>>;

    /// Create the entity and return its uuid.
    async fn create(&self, ctx: &Context, op: &Operation) -> Result<String>;

    async fn update(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()>;

    async fn delete(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()>;

    /// Whether `op` changes pool membership and needs the pool lock.
    fn touches_topology(&self, _op: &Operation) -> bool {
        false
    }

    /// Tag an existing unmanaged entity as managed under `key`.
    async fn import(&self, ctx: &Context, uuid: &str, key: &str) -> Result<()>;
}

/// The fixed set of reconcilers.
pub struct Reconcilers {
    pool: pool::PoolReconciler,
    sr: sr::SrReconciler,
    network: network::NetworkReconciler,
    vdi: vdi::VdiReconciler,
    vm: vm::VmReconciler,
    snapshot: snapshot::SnapshotReconciler,
    pif: pif::PifReconciler,
}

impl Reconcilers {
    pub fn new() -> Self {
        Self {
            pool: pool::PoolReconciler,
            sr: sr::SrReconciler,
            network: network::NetworkReconciler,
            vdi: vdi::VdiReconciler,
            vm: vm::VmReconciler,
            snapshot: snapshot::SnapshotReconciler,
            pif: pif::PifReconciler,
        }
    }

    pub fn get(&self, kind: EntityKind) -> &dyn Reconciler {
        match kind {
            EntityKind::Pool => &self.pool,
            EntityKind::StorageRepository => &self.sr,
            EntityKind::Network => &self.network,
            EntityKind::Vdi => &self.vdi,
            EntityKind::Vm => &self.vm,
            EntityKind::Snapshot => &self.snapshot,
            EntityKind::PifConfiguration => &self.pif,
        }
    }
}

impl Default for Reconcilers {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Spec helpers =====

/// Error for an operation that carries no desired resource of its kind.
pub(crate) fn missing_spec(op: &Operation) -> Error {
    Error::Plan(format!("{} carries no {} spec", op, op.kind()))
}

/// Build an [`ActualState`] from a spec reconstructed out of live data.
pub(crate) fn actual_from<S: EntitySpec>(key: &str, uuid: &str, spec: &S, computed: Attributes) -> ActualState {
    ActualState {
        id: crate::model::EntityId::new(S::KIND, key),
        uuid: uuid.to_string(),
        managed: true,
        attributes: spec.attributes(),
        computed,
        references: spec.references(),
        incomplete: false,
    }
}

pub(crate) fn require_non_empty(kind: EntityKind, key: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(kind, key, format!("{} must not be empty", field)));
    }
    Ok(())
}

/// User `other_config` keys may not collide with ownership tags.
pub(crate) fn validate_other_config(kind: EntityKind, key: &str, other_config: &BTreeMap<String, String>) -> Result<()> {
    for name in other_config.keys() {
        if name.starts_with("xencp_") {
            return Err(Error::validation(
                kind,
                key,
                format!("other_config key '{}' is reserved", name),
            ));
        }
        if name.contains(',') {
            return Err(Error::validation(
                kind,
                key,
                format!("other_config key '{}' must not contain ','", name),
            ));
        }
    }
    Ok(())
}

// ===== Ownership tags =====

/// Key the entity is managed under, if it carries tags for `kind`.
pub(crate) fn managed_key(other_config: &BTreeMap<String, String>, kind: EntityKind) -> Option<&str> {
    let tagged = other_config.get(TAG_MANAGED).map(String::as_str) == Some("true")
        && other_config.get(TAG_KIND).map(String::as_str) == Some(kind.as_str());
    if tagged {
        other_config.get(TAG_KEY).map(String::as_str)
    } else {
        None
    }
}

/// `other_config` for a new entity: ownership tags plus user keys.
pub(crate) fn tagged_other_config(
    kind: EntityKind,
    key: &str,
    user: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut config = user.clone();
    config.insert(TAG_MANAGED.into(), "true".into());
    config.insert(TAG_KEY.into(), key.into());
    config.insert(TAG_KIND.into(), kind.as_str().into());
    config.insert(TAG_OTHER_CONFIG_KEYS.into(), tracked_keys(user));
    config
}

fn tracked_keys(user: &BTreeMap<String, String>) -> String {
    user.keys().cloned().collect::<Vec<_>>().join(",")
}

/// User keys the engine owns, with their live values.
pub(crate) fn user_other_config(other_config: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    other_config
        .get(TAG_OTHER_CONFIG_KEYS)
        .map(|keys| {
            keys.split(',')
                .filter(|k| !k.is_empty())
                .filter_map(|k| other_config.get(k).map(|v| (k.to_string(), v.clone())))
                .collect()
        })
        .unwrap_or_default()
}

/// Replace one `other_config` entry.
pub(crate) async fn set_other_config(ctx: &Context, class: &str, opaque_ref: &str, name: &str, value: &str) -> Result<()> {
    ctx.api
        .call(&format!("{}.remove_from_other_config", class), vec![json!(opaque_ref), json!(name)])
        .await?;
    ctx.api
        .call(
            &format!("{}.add_to_other_config", class),
            vec![json!(opaque_ref), json!(name), json!(value)],
        )
        .await?;
    Ok(())
}

pub(crate) async fn tag(ctx: &Context, kind: EntityKind, opaque_ref: &str, key: &str) -> Result<()> {
    set_other_config(ctx, kind.class(), opaque_ref, TAG_MANAGED, "true").await?;
    set_other_config(ctx, kind.class(), opaque_ref, TAG_KIND, kind.as_str()).await?;
    set_other_config(ctx, kind.class(), opaque_ref, TAG_KEY, key).await
}

pub(crate) async fn untag(ctx: &Context, class: &str, opaque_ref: &str) -> Result<()> {
    for name in [TAG_MANAGED, TAG_KEY, TAG_KIND, TAG_OTHER_CONFIG_KEYS] {
        ctx.api
            .call(&format!("{}.remove_from_other_config", class), vec![json!(opaque_ref), json!(name)])
            .await?;
    }
    Ok(())
}

/// Converge the engine-owned `other_config` keys to `desired`.
pub(crate) async fn sync_other_config(
    ctx: &Context,
    class: &str,
    opaque_ref: &str,
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> Result<()> {
    for (name, _) in user_other_config(current) {
        if !desired.contains_key(&name) {
            ctx.api
                .call(&format!("{}.remove_from_other_config", class), vec![json!(opaque_ref), json!(name)])
                .await?;
        }
    }
    for (name, value) in desired {
        if current.get(name) != Some(value) {
            set_other_config(ctx, class, opaque_ref, name, value).await?;
        }
    }
    let keys = tracked_keys(desired);
    if current.get(TAG_OTHER_CONFIG_KEYS) != Some(&keys) {
        set_other_config(ctx, class, opaque_ref, TAG_OTHER_CONFIG_KEYS, &keys).await?;
    }
    Ok(())
}

// ===== Lookup =====

/// Find the entity managed under `key`, trying `uuid_hint` first.
pub(crate) async fn find_managed<R>(
    ctx: &Context,
    kind: EntityKind,
    key: &str,
    uuid_hint: Option<&str>,
) -> Result<Option<(OpaqueRef, R)>>
where
    R: XenRecord + Tagged,
{
    if let Some(uuid) = uuid_hint {
        match ctx.api.get_by_uuid::<R>(uuid).await {
            Ok(opaque_ref) => {
                let record: R = ctx.api.get_record(&opaque_ref).await?;
                if !record.is_snapshot_copy() && managed_key(record.other_config(), kind) == Some(key) {
                    return Ok(Some((opaque_ref, record)));
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }

    let mut matches: Vec<(OpaqueRef, R)> = ctx
        .api
        .get_all_records::<R>()
        .await?
        .into_iter()
        .filter(|(_, record)| !record.is_snapshot_copy() && managed_key(record.other_config(), kind) == Some(key))
        .collect();
    matches.sort_by(|a, b| a.1.uuid().cmp(b.1.uuid()));
    if matches.len() > 1 {
        warn!(kind = %kind, key, count = matches.len(), "Several objects carry the same key; using the first");
    }
    Ok(matches.into_iter().next())
}

/// Every entity of `kind` carrying ownership tags, with its key.
pub(crate) async fn all_managed<R>(ctx: &Context, kind: EntityKind) -> Result<Vec<(OpaqueRef, R, String)>>
where
    R: XenRecord + Tagged,
{
    let mut found: Vec<(OpaqueRef, R, String)> = ctx
        .api
        .get_all_records::<R>()
        .await?
        .into_iter()
        .filter(|(_, record)| !record.is_snapshot_copy())
        .filter_map(|(opaque_ref, record)| {
            let key = managed_key(record.other_config(), kind)?.to_string();
            Some((opaque_ref, record, key))
        })
        .collect();
    found.sort_by(|a, b| a.2.cmp(&b.2));
    Ok(found)
}

/// Resolve a reference written as a managed key or a raw uuid.
pub(crate) async fn resolve<R>(ctx: &Context, kind: EntityKind, reference: &str) -> Result<(OpaqueRef, R)>
where
    R: XenRecord + Tagged,
{
    if is_uuid(reference) {
        let opaque_ref = ctx.api.get_by_uuid::<R>(reference).await?;
        let record = ctx.api.get_record::<R>(&opaque_ref).await?;
        return Ok((opaque_ref, record));
    }
    find_managed::<R>(ctx, kind, reference, None)
        .await?
        .ok_or_else(|| Error::NotFound(format!("{} '{}' is not managed on this pool", kind, reference)))
}

/// Spelling of a reference in observed attributes.
///
/// Uses the desired spelling when it names the same object; otherwise the
/// managed key, falling back to the uuid.
pub(crate) fn reference_name(desired: Option<&str>, uuid: &str, key: Option<&str>) -> String {
    match desired {
        Some(d) if d == uuid || Some(d) == key => d.to_string(),
        _ => key.map(str::to_string).unwrap_or_else(|| uuid.to_string()),
    }
}

/// Observed reference to the object at `opaque_ref`, or `None` for a null reference.
pub(crate) async fn reference_of<R>(
    ctx: &Context,
    kind: EntityKind,
    opaque_ref: &str,
    desired: Option<&str>,
) -> Result<Option<String>>
where
    R: XenRecord + Tagged,
{
    if is_null_ref(opaque_ref) {
        return Ok(None);
    }
    let record: R = ctx.api.get_record(opaque_ref).await?;
    Ok(Some(reference_name(
        desired,
        record.uuid(),
        managed_key(record.other_config(), kind),
    )))
}

/// Uuid of the object at `opaque_ref`.
pub(crate) async fn uuid_of(ctx: &Context, class: &str, opaque_ref: &str) -> Result<String> {
    match ctx
        .api
        .call(&format!("{}.get_uuid", class), vec![json!(opaque_ref)])
        .await?
    {
        Value::String(uuid) => Ok(uuid),
        other => Err(Error::RemoteInternal(format!(
            "{}.get_uuid returned {}",
            class, other
        ))),
    }
}

/// Treat a missing object as already gone.
pub(crate) fn ignore_not_found(result: Result<Value>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::mock::MockCluster;

    pub fn context(cluster: &MockCluster) -> Context {
        Context::new(
            cluster.client(),
            Arc::new(MockCluster::config()),
            cluster.connector(),
            Arc::new(AuditLogger::new_recording("test")),
        )
    }

    pub fn desired(value: Value) -> crate::model::DesiredState {
        serde_json::from_value(value).unwrap()
    }

    pub fn create_op(state: &crate::model::DesiredState) -> Operation {
        Operation {
            action: crate::model::Action::Create,
            id: state.id(),
            uuid: None,
            delta: state.spec.attributes(),
            spec: Some(state.spec.clone()),
            depends_on: vec![],
        }
    }

    /// Create that continues from the unfinished object in `actual`.
    pub fn resume_op(state: &crate::model::DesiredState, actual: &ActualState) -> Operation {
        Operation {
            uuid: Some(actual.uuid.clone()),
            ..create_op(state)
        }
    }

    pub fn update_op(state: &crate::model::DesiredState, actual: &ActualState) -> Operation {
        Operation {
            action: crate::model::Action::Update,
            id: state.id(),
            uuid: Some(actual.uuid.clone()),
            delta: state
                .spec
                .attributes()
                .into_iter()
                .filter(|(k, v)| actual.attributes.get(k) != Some(v))
                .collect(),
            spec: Some(state.spec.clone()),
            depends_on: vec![],
        }
    }

    pub fn delete_op(actual: &ActualState) -> Operation {
        Operation {
            action: crate::model::Action::Delete,
            id: actual.id.clone(),
            uuid: Some(actual.uuid.clone()),
            delta: Attributes::new(),
            spec: None,
            depends_on: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_key_requires_kind() {
        let config = tagged_other_config(EntityKind::Vm, "vm1", &BTreeMap::new());
        assert_eq!(managed_key(&config, EntityKind::Vm), Some("vm1"));
        assert_eq!(managed_key(&config, EntityKind::Snapshot), None);
        assert_eq!(managed_key(&BTreeMap::new(), EntityKind::Vm), None);
    }

    #[test]
    fn test_user_other_config_only_tracks_owned_keys() {
        let user = BTreeMap::from([("owner".to_string(), "ops".to_string())]);
        let mut config = tagged_other_config(EntityKind::Network, "net", &user);
        config.insert("xenrt".into(), "foreign".into());
        assert_eq!(user_other_config(&config), user);
    }

    #[test]
    fn test_reference_name_keeps_desired_spelling() {
        let uuid = "0c6a1d5e-7c8d-4d4e-9e0f-3f2b1a0c9d8e";
        assert_eq!(reference_name(Some(uuid), uuid, Some("sr1")), uuid);
        assert_eq!(reference_name(Some("sr1"), uuid, Some("sr1")), "sr1");
        assert_eq!(reference_name(Some("other"), uuid, Some("sr1")), "sr1");
        assert_eq!(reference_name(None, uuid, None), uuid);
    }

    #[test]
    fn test_reserved_other_config_keys() {
        let config = BTreeMap::from([("xencp_key".to_string(), "x".to_string())]);
        assert!(validate_other_config(EntityKind::Vdi, "d", &config).is_err());
    }
}
