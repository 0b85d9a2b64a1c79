//! Pool reconciler - the singleton pool and its membership.
//!
//! Every operation here except a pure rename changes topology and runs under
//! the pool lock (see [`Reconciler::touches_topology`]). Joining logs into
//! the supporter itself and asks it to join the coordinator; the host counts
//! as joined once the coordinator reports its metrics as live.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    Context, Reconciler, actual_from, all_managed, find_managed, managed_key, missing_spec, reference_name,
    reference_of, resolve, tag, untag,
};
use crate::api::{
    ApiClient, ApiError, HostMetricsRecord, HostRecord, NetworkRecord, OpaqueRef, PifRecord, PoolRecord,
    SrRecord, is_null_ref,
};
use crate::error::{Error, Result};
use crate::model::{
    Action, ActualState, Attributes, EntityId, EntityKind, EntitySpec, Operation, ResourceSpec, is_uuid,
    reference, to_attributes,
};
use crate::session::{Credentials, SessionManager};

/// Delta keys that change pool membership or pool-wide networking.
const TOPOLOGY_ATTRIBUTES: &[&str] = &["supporters", "eject", "management_network", "ha_enabled"];

/// A host to join, addressed by its management IP or hostname.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SupporterSpec {
    pub host: String,
    /// Login on the supporter; defaults to the engine credentials.
    #[serde(default, skip_serializing)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoolSpec {
    #[serde(default)]
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    /// Shared SR, by key or uuid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_sr: Option<String>,
    /// Network, by key or uuid, carrying management traffic on every member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_network: Option<String>,
    #[serde(default)]
    pub ha_enabled: bool,
    #[serde(default, skip_serializing)]
    pub ha_heartbeat_srs: Vec<String>,
    #[serde(default)]
    pub supporters: Vec<SupporterSpec>,
    /// Uuids of hosts to remove from the pool.
    #[serde(default)]
    pub eject: Vec<String>,
}

impl EntitySpec for PoolSpec {
    const KIND: EntityKind = EntityKind::Pool;

    fn attributes(&self) -> Attributes {
        let mut normalized = self.clone();
        normalized.supporters.sort();
        normalized.eject.sort();
        to_attributes(&normalized)
    }

    fn references(&self) -> Vec<EntityId> {
        let mut refs: Vec<EntityId> = self
            .default_sr
            .iter()
            .chain(self.ha_heartbeat_srs.iter())
            .filter_map(|sr| reference(EntityKind::StorageRepository, sr))
            .collect();
        refs.extend(
            self.management_network
                .iter()
                .filter_map(|n| reference(EntityKind::Network, n)),
        );
        refs
    }

    fn validate(&self, key: &str) -> Result<()> {
        let mut seen = BTreeSet::new();
        for supporter in &self.supporters {
            if supporter.host.trim().is_empty() {
                return Err(Error::validation(Self::KIND, key, "supporter host must not be empty"));
            }
            if !seen.insert(supporter.host.as_str()) {
                return Err(Error::validation(
                    Self::KIND,
                    key,
                    format!("supporter '{}' is listed twice", supporter.host),
                ));
            }
            if self.eject.contains(&supporter.host) {
                return Err(Error::validation(
                    Self::KIND,
                    key,
                    format!("host '{}' is listed both to join and to eject", supporter.host),
                ));
            }
        }
        if let Some(host) = self.eject.iter().find(|h| !is_uuid(h)) {
            return Err(Error::validation(
                Self::KIND,
                key,
                format!("eject entry '{}' is not a host uuid", host),
            ));
        }
        if self.ha_enabled && self.ha_heartbeat_srs.is_empty() {
            return Err(Error::validation(Self::KIND, key, "ha_enabled requires ha_heartbeat_srs"));
        }
        Ok(())
    }
}

fn pool_spec(op: &Operation) -> Result<&PoolSpec> {
    match &op.spec {
        Some(ResourceSpec::Pool(spec)) => Ok(spec),
        _ => Err(missing_spec(op)),
    }
}

/// The pool object of the coordinator.
pub(crate) async fn pool_record(ctx: &Context) -> Result<(OpaqueRef, PoolRecord)> {
    ctx.api
        .get_all_records::<PoolRecord>()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::RemoteInternal("no pool object on coordinator".into()))
}

fn is_host_is_slave(err: &Error) -> Option<&ApiError> {
    match err {
        Error::Conflict(api) if api.error_code() == Some("HOST_IS_SLAVE") => Some(api),
        _ => None,
    }
}

pub struct PoolReconciler;

impl PoolReconciler {
    async fn observed(
        &self,
        ctx: &Context,
        key: &str,
        pool: &PoolRecord,
        desired: Option<&PoolSpec>,
    ) -> Result<ActualState> {
        let hosts = ctx.api.get_all_records::<HostRecord>().await?;
        let coordinator = hosts
            .iter()
            .find(|(r, _)| *r == pool.master)
            .map(|(_, h)| h.clone())
            .ok_or_else(|| Error::RemoteInternal(format!("pool master {} is not a host", pool.master)))?;
        let members: BTreeSet<String> = hosts.iter().map(|(_, h)| h.uuid.clone()).collect();
        let addresses: BTreeSet<&str> = hosts
            .iter()
            .filter(|(r, _)| *r != pool.master)
            .map(|(_, h)| h.address.as_str())
            .collect();

        let supporters = match desired {
            Some(d) => d
                .supporters
                .iter()
                .filter(|s| addresses.contains(s.host.as_str()))
                .map(|s| SupporterSpec {
                    host: s.host.clone(),
                    username: None,
                    password: None,
                })
                .collect(),
            None => addresses
                .iter()
                .map(|a| SupporterSpec {
                    host: a.to_string(),
                    username: None,
                    password: None,
                })
                .collect(),
        };
        let eject = desired
            .map(|d| d.eject.iter().filter(|h| !members.contains(*h)).cloned().collect())
            .unwrap_or_default();

        let default_sr = reference_of::<SrRecord>(
            ctx,
            EntityKind::StorageRepository,
            &pool.default_sr,
            desired.and_then(|d| d.default_sr.as_deref()),
        )
        .await?;
        let management_network = self
            .management_network(ctx, &pool.master, desired.and_then(|d| d.management_network.as_deref()))
            .await?;

        let spec = PoolSpec {
            name_label: pool.name_label.clone(),
            name_description: pool.name_description.clone(),
            default_sr,
            management_network,
            ha_enabled: pool.ha_enabled,
            ha_heartbeat_srs: desired.map(|d| d.ha_heartbeat_srs.clone()).unwrap_or_default(),
            supporters,
            eject,
        };
        let computed = Attributes::from([
            ("coordinator".to_string(), json!(coordinator.uuid)),
            ("members".to_string(), json!(members)),
        ]);
        Ok(actual_from(key, &pool.uuid, &spec, computed))
    }

    /// Network of the coordinator's management interface.
    async fn management_network(&self, ctx: &Context, master: &str, desired: Option<&str>) -> Result<Option<String>> {
        let pif = ctx
            .api
            .get_all_records::<PifRecord>()
            .await?
            .into_iter()
            .find(|(_, pif)| pif.host == master && pif.management);
        let Some((_, pif)) = pif else {
            return Ok(None);
        };
        if is_null_ref(&pif.network) {
            return Ok(None);
        }
        let network: NetworkRecord = ctx.api.get_record(&pif.network).await?;
        Ok(Some(reference_name(
            desired,
            &network.uuid,
            managed_key(&network.other_config, EntityKind::Network),
        )))
    }

    /// Converge the pool to `spec`, touching only what `delta` names.
    async fn apply(&self, ctx: &Context, key: &str, spec: &PoolSpec, delta: &Attributes) -> Result<()> {
        let (pool_ref, pool) = pool_record(ctx).await?;

        if delta.contains_key("ha_enabled") && !spec.ha_enabled && pool.ha_enabled {
            info!("Disabling HA on pool {}", key);
            ctx.api.call("pool.disable_ha", vec![]).await?;
        }

        if delta.contains_key("eject") {
            for host_uuid in &spec.eject {
                ctx.check_cancelled()?;
                self.eject(ctx, key, &pool, host_uuid).await?;
            }
        }

        if delta.contains_key("supporters") {
            let coordinator: HostRecord = ctx.api.get_record(&pool.master).await?;
            for supporter in &spec.supporters {
                ctx.check_cancelled()?;
                self.join(ctx, key, spec, supporter, &coordinator.address).await?;
            }
        }

        if delta.contains_key("management_network")
            && let Some(network) = &spec.management_network
        {
            let (network_ref, _) = resolve::<NetworkRecord>(ctx, EntityKind::Network, network).await?;
            info!("Moving management interface of pool {} to {}", key, network);
            ctx.api
                .call("pool.management_reconfigure", vec![json!(network_ref)])
                .await?;
        }

        if delta.contains_key("default_sr")
            && let Some(sr) = &spec.default_sr
        {
            let (sr_ref, record) = resolve::<SrRecord>(ctx, EntityKind::StorageRepository, sr).await?;
            if !record.shared {
                return Err(Error::validation(
                    EntityKind::Pool,
                    key,
                    format!("default_sr '{}' is not shared", sr),
                ));
            }
            ctx.api
                .call("pool.set_default_SR", vec![json!(pool_ref), json!(sr_ref)])
                .await?;
        }

        if delta.contains_key("name_label") {
            ctx.api
                .call("pool.set_name_label", vec![json!(pool_ref), json!(spec.name_label)])
                .await?;
        }
        if delta.contains_key("name_description") {
            ctx.api
                .call("pool.set_name_description", vec![json!(pool_ref), json!(spec.name_description)])
                .await?;
        }

        if delta.contains_key("ha_enabled") && spec.ha_enabled && !pool.ha_enabled {
            let mut heartbeat = Vec::new();
            for sr in &spec.ha_heartbeat_srs {
                heartbeat.push(resolve::<SrRecord>(ctx, EntityKind::StorageRepository, sr).await?.0);
            }
            info!("Enabling HA on pool {}", key);
            let target = pool_ref.as_str();
            ctx.run_task("pool.enable_ha", vec![json!(heartbeat), json!({})], move || async move {
                Ok(ctx.api.get_record::<PoolRecord>(target).await?.ha_enabled)
            })
            .await?;
        }
        Ok(())
    }

    async fn eject(&self, ctx: &Context, key: &str, pool: &PoolRecord, host_uuid: &str) -> Result<()> {
        let host_ref = match ctx.api.get_by_uuid::<HostRecord>(host_uuid).await {
            Ok(host_ref) => host_ref,
            Err(err) if err.is_not_found() => {
                debug!(host = host_uuid, "Host already left the pool");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if host_ref == pool.master {
            return Err(Error::validation(
                EntityKind::Pool,
                key,
                format!("host {} is the coordinator and cannot be ejected", host_uuid),
            ));
        }
        info!("Ejecting host {} from the pool", host_uuid);
        ctx.api.call("pool.eject", vec![json!(host_ref)]).await?;
        ctx.audit.host_ejected(host_uuid);
        Ok(())
    }

    /// Join one supporter, skipping hosts that are already members.
    async fn join(
        &self,
        ctx: &Context,
        key: &str,
        spec: &PoolSpec,
        supporter: &SupporterSpec,
        coordinator_address: &str,
    ) -> Result<()> {
        let credentials = Credentials::new(
            supporter
                .username
                .clone()
                .unwrap_or_else(|| ctx.config.username.clone()),
            supporter
                .password
                .clone()
                .unwrap_or_else(|| ctx.config.password.clone()),
        );
        let transport = ctx.connector.connect(&supporter.host).await?;
        let retry = ctx.config.backoff();
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&transport),
            credentials,
            ctx.config.session_ttl(),
            retry.clone(),
        ));
        let client = ApiClient::new(transport, Arc::clone(&sessions), retry);

        let hosts = match client.call("host.get_all", vec![]).await {
            Ok(hosts) => hosts,
            Err(err) => {
                if let Some(api) = is_host_is_slave(&err) {
                    let pool_of = api.params().first().map(String::as_str).unwrap_or_default();
                    if pool_of == coordinator_address {
                        debug!(host = %supporter.host, "Already a member of this pool");
                        return Ok(());
                    }
                    warn!(host = %supporter.host, coordinator = pool_of, "Supporter belongs to another pool");
                }
                return Err(err);
            }
        };

        let result = self
            .join_standalone(ctx, key, spec, supporter, &client, hosts, coordinator_address)
            .await;
        if let Err(err) = sessions.logout().await {
            debug!(host = %supporter.host, "Logout from supporter failed: {}", err);
        }
        let host_uuid = result?;

        self.wait_live(ctx, &host_uuid).await?;
        ctx.audit.host_joined(&supporter.host);
        info!("Host {} ({}) joined pool {}", supporter.host, host_uuid, key);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn join_standalone(
        &self,
        ctx: &Context,
        key: &str,
        spec: &PoolSpec,
        supporter: &SupporterSpec,
        client: &ApiClient,
        hosts: Value,
        coordinator_address: &str,
    ) -> Result<String> {
        let host_refs: Vec<OpaqueRef> = serde_json::from_value(hosts)
            .map_err(|e| Error::RemoteInternal(format!("host.get_all on {}: {}", supporter.host, e)))?;
        let [host_ref] = host_refs.as_slice() else {
            return Err(Error::validation(
                EntityKind::Pool,
                key,
                format!(
                    "supporter '{}' is the coordinator of a pool with {} hosts",
                    supporter.host,
                    host_refs.len()
                ),
            ));
        };
        let host: HostRecord = client.get_record(host_ref).await?;
        if spec.eject.contains(&host.uuid) {
            return Err(Error::validation(
                EntityKind::Pool,
                key,
                format!("host '{}' ({}) is listed both to join and to eject", supporter.host, host.uuid),
            ));
        }

        info!("Joining host {} ({}) to pool {}", supporter.host, host.uuid, key);
        client
            .call(
                "pool.join",
                vec![
                    json!(coordinator_address),
                    json!(ctx.config.username),
                    json!(ctx.config.password),
                ],
            )
            .await?;
        Ok(host.uuid)
    }

    /// Wait until the coordinator reports the host's metrics as live.
    async fn wait_live(&self, ctx: &Context, host_uuid: &str) -> Result<()> {
        let timeout = ctx.config.host_live_timeout();
        let started = Instant::now();
        let mut intervals = ctx.config.backoff().intervals();

        loop {
            if self.is_live(ctx, host_uuid).await? {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::Timeout {
                    what: format!("host {} to become live", host_uuid),
                    elapsed_secs: elapsed.as_secs(),
                });
            }
            let delay = intervals
                .next()
                .unwrap_or(Duration::from_secs(1))
                .min(timeout - elapsed);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    async fn is_live(&self, ctx: &Context, host_uuid: &str) -> Result<bool> {
        let host_ref = match ctx.api.get_by_uuid::<HostRecord>(host_uuid).await {
            Ok(host_ref) => host_ref,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };
        let host: HostRecord = ctx.api.get_record(&host_ref).await?;
        if is_null_ref(&host.metrics) {
            return Ok(false);
        }
        match ctx.api.get_record::<HostMetricsRecord>(&host.metrics).await {
            Ok(metrics) => Ok(metrics.live),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Reconciler for PoolReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::Pool
    }

    async fn observe(
        &self,
        ctx: &Context,
        key: &str,
        uuid_hint: Option<&str>,
        desired: Option<&ResourceSpec>,
    ) -> Result<Option<ActualState>> {
        let desired = match desired {
            Some(ResourceSpec::Pool(spec)) => Some(spec),
            _ => None,
        };
        match find_managed::<PoolRecord>(ctx, EntityKind::Pool, key, uuid_hint).await? {
            Some((_, pool)) => Ok(Some(self.observed(ctx, key, &pool, desired).await?)),
            None => Ok(None),
        }
    }

    async fn list_managed(&self, ctx: &Context) -> Result<Vec<ActualState>> {
        let mut states = Vec::new();
        for (_, pool, key) in all_managed::<PoolRecord>(ctx, EntityKind::Pool).await? {
            states.push(self.observed(ctx, &key, &pool, None).await?);
        }
        Ok(states)
    }

    /// Adopt the pool under `key` and converge it.
    async fn create(&self, ctx: &Context, op: &Operation) -> Result<String> {
        let spec = pool_spec(op)?;
        let (pool_ref, pool) = pool_record(ctx).await?;
        if let Some(existing) = managed_key(&pool.other_config, EntityKind::Pool)
            && existing != op.key()
        {
            return Err(Error::validation(
                EntityKind::Pool,
                op.key(),
                format!("the pool is already managed as '{}'", existing),
            ));
        }
        info!("Adopting pool {} as {}", pool.uuid, op.key());
        tag(ctx, EntityKind::Pool, &pool_ref, op.key()).await?;
        self.apply(ctx, op.key(), spec, &op.delta).await?;
        Ok(pool.uuid)
    }

    async fn update(&self, ctx: &Context, op: &Operation, _actual: &ActualState) -> Result<()> {
        let spec = pool_spec(op)?;
        info!("Updating pool {}", op.key());
        self.apply(ctx, op.key(), spec, &op.delta).await
    }

    async fn delete(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        info!("Releasing pool {}", op.key());
        let pool_ref = ctx.api.get_by_uuid::<PoolRecord>(&actual.uuid).await?;
        let pool: PoolRecord = ctx.api.get_record(&pool_ref).await?;

        ctx.api
            .call("pool.set_name_label", vec![json!(pool_ref), json!("")])
            .await?;
        for (host_ref, host) in ctx.api.get_all_records::<HostRecord>().await? {
            if host_ref != pool.master {
                ctx.check_cancelled()?;
                self.eject(ctx, op.key(), &pool, &host.uuid).await?;
            }
        }
        untag(ctx, "pool", &pool_ref).await
    }

    fn touches_topology(&self, op: &Operation) -> bool {
        match op.action {
            Action::Create | Action::Delete => true,
            Action::Update => TOPOLOGY_ATTRIBUTES.iter().any(|a| op.delta.contains_key(*a)),
        }
    }

    async fn import(&self, ctx: &Context, uuid: &str, key: &str) -> Result<()> {
        let pool_ref = ctx.api.get_by_uuid::<PoolRecord>(uuid).await?;
        tag(ctx, EntityKind::Pool, &pool_ref, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, create_op, delete_op, desired, update_op};
    use super::*;
    use crate::audit::AuditEvent;
    use crate::mock::{MOCK_COORDINATOR, MockCluster};

    fn pool(value: Value) -> crate::model::DesiredState {
        let mut value = value;
        value["key"] = json!("main");
        value["kind"] = json!("pool");
        desired(value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopt_and_join() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let xen2 = cluster.add_standalone_host("10.0.0.2", "xen2");
        let state = pool(json!({"name_label": "prod", "supporters": [{"host": "10.0.0.2"}]}));

        PoolReconciler.create(&ctx, &create_op(&state)).await.unwrap();

        assert_eq!(cluster.member_addresses(), vec![MOCK_COORDINATOR, "10.0.0.2"]);
        let actual = PoolReconciler
            .observe(&ctx, "main", None, Some(&state.spec))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(actual.attributes["supporters"], state.spec.attributes()["supporters"]);
        assert_eq!(actual.attributes["name_label"], "prod");
        assert!(actual.computed["members"].as_array().unwrap().contains(&json!(xen2)));
        assert!(ctx.audit.events().contains(&AuditEvent::HostJoined {
            address: "10.0.0.2".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_member_is_skipped() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        cluster.add_standalone_host("10.0.0.2", "xen2");
        cluster.join_out_of_band("10.0.0.2").unwrap();
        let state = pool(json!({"supporters": [{"host": "10.0.0.2"}]}));

        PoolReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        assert_eq!(cluster.call_count("pool.join"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_with_wrong_credentials_fails() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        cluster.add_standalone_host("10.0.0.3", "xen3");
        let state = pool(json!({
            "supporters": [{"host": "10.0.0.3", "username": "root", "password": "wrong"}]
        }));

        let err = PoolReconciler.create(&ctx, &create_op(&state)).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(cluster.member_addresses(), vec![MOCK_COORDINATOR]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eject_and_observe() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let xen2 = cluster.add_standalone_host("10.0.0.2", "xen2");
        cluster.join_out_of_band("10.0.0.2").unwrap();
        PoolReconciler.create(&ctx, &create_op(&pool(json!({})))).await.unwrap();
        let actual = PoolReconciler.observe(&ctx, "main", None, None).await.unwrap().unwrap();

        let state = pool(json!({"eject": [xen2]}));
        let op = update_op(&state, &actual);
        assert!(PoolReconciler.touches_topology(&op));
        PoolReconciler.update(&ctx, &op, &actual).await.unwrap();

        assert_eq!(cluster.member_addresses(), vec![MOCK_COORDINATOR]);
        let after = PoolReconciler
            .observe(&ctx, "main", None, Some(&state.spec))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.attributes["eject"], json!([xen2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_does_not_touch_topology() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        PoolReconciler.create(&ctx, &create_op(&pool(json!({})))).await.unwrap();
        let actual = PoolReconciler.observe(&ctx, "main", None, None).await.unwrap().unwrap();

        let op = update_op(&pool(json!({"name_label": "renamed"})), &actual);
        assert!(!PoolReconciler.touches_topology(&op));
        PoolReconciler.update(&ctx, &op, &actual).await.unwrap();
        let (_, record) = pool_record(&ctx).await.unwrap();
        assert_eq!(record.name_label, "renamed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unshared_default_sr_is_rejected() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let (_, local) = cluster.find("SR", "name_label", "Local storage").unwrap();
        let state = pool(json!({"default_sr": local["uuid"]}));

        let err = PoolReconciler.create(&ctx, &create_op(&state)).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_managed_under_other_key() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        PoolReconciler.create(&ctx, &create_op(&pool(json!({})))).await.unwrap();

        let mut other = pool(json!({}));
        other.key = "second".into();
        let err = PoolReconciler.create(&ctx, &create_op(&other)).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_ejects_supporters_and_untags() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        cluster.add_standalone_host("10.0.0.2", "xen2");
        let state = pool(json!({"name_label": "prod", "supporters": [{"host": "10.0.0.2"}]}));
        PoolReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = PoolReconciler.observe(&ctx, "main", None, None).await.unwrap().unwrap();

        PoolReconciler.delete(&ctx, &delete_op(&actual), &actual).await.unwrap();
        assert_eq!(cluster.member_addresses(), vec![MOCK_COORDINATOR]);
        assert!(PoolReconciler.observe(&ctx, "main", None, None).await.unwrap().is_none());
    }

    #[test]
    fn test_validation() {
        let both = pool(json!({
            "supporters": [{"host": "0c6a1d5e-7c8d-4d4e-9e0f-3f2b1a0c9d8e"}],
            "eject": ["0c6a1d5e-7c8d-4d4e-9e0f-3f2b1a0c9d8e"]
        }));
        assert!(both.validate().is_err());
        let ha = pool(json!({"ha_enabled": true}));
        assert!(ha.validate().is_err());
    }

    #[test]
    fn test_supporter_credentials_are_not_compared() {
        let with_password = pool(json!({"supporters": [{"host": "b", "password": "x"}, {"host": "a"}]}));
        let attrs = with_password.spec.attributes();
        assert_eq!(attrs["supporters"], json!([{"host": "a"}, {"host": "b"}]));
    }
}
