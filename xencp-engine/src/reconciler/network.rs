//! Network reconciler - pool-wide networks, optionally VLAN-tagged.
//!
//! A VLAN network is created in two steps. A network that is wanted with a
//! VLAN but has no VLAN PIF observes as incomplete, and create adds the
//! VLAN to it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{
    Context, Reconciler, actual_from, all_managed, find_managed, missing_spec, require_non_empty,
    sync_other_config, tag, tagged_other_config, user_other_config, validate_other_config,
};
use crate::api::{NetworkRecord, OpaqueRef, PifRecord, is_null_ref};
use crate::error::{Error, Result};
use crate::model::{ActualState, Attributes, EntityKind, EntitySpec, Operation, ResourceSpec, to_attributes};

const MAX_MTU: u32 = 9216;

fn default_mtu() -> u32 {
    1500
}

/// VLAN on top of a physical NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanSpec {
    /// Device name of the physical interface, e.g. `eth1`.
    pub nic: String,
    pub tag: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanSpec>,
}

impl EntitySpec for NetworkSpec {
    const KIND: EntityKind = EntityKind::Network;

    fn attributes(&self) -> Attributes {
        to_attributes(self)
    }

    fn immutable_attributes(&self) -> &'static [&'static str] {
        &["vlan"]
    }

    fn validate(&self, key: &str) -> Result<()> {
        require_non_empty(Self::KIND, key, "name_label", &self.name_label)?;
        if self.mtu == 0 || self.mtu > MAX_MTU {
            return Err(Error::validation(
                Self::KIND,
                key,
                format!("mtu must be between 1 and {}", MAX_MTU),
            ));
        }
        if let Some(vlan) = &self.vlan {
            require_non_empty(Self::KIND, key, "vlan.nic", &vlan.nic)?;
            if !(1..=4094).contains(&vlan.tag) {
                return Err(Error::validation(Self::KIND, key, "vlan.tag must be between 1 and 4094"));
            }
        }
        validate_other_config(Self::KIND, key, &self.other_config)
    }
}

fn network_spec(op: &Operation) -> Result<&NetworkSpec> {
    match &op.spec {
        Some(ResourceSpec::Network(spec)) => Ok(spec),
        _ => Err(missing_spec(op)),
    }
}

pub struct NetworkReconciler;

impl NetworkReconciler {
    async fn observed(
        &self,
        ctx: &Context,
        key: &str,
        record: &NetworkRecord,
        desired: Option<&NetworkSpec>,
    ) -> Result<ActualState> {
        let mut vlan = None;
        for pif in &record.pifs {
            let pif: PifRecord = ctx.api.get_record(pif).await?;
            if pif.vlan >= 0 {
                vlan = Some(VlanSpec {
                    nic: pif.device,
                    tag: pif.vlan,
                });
                break;
            }
        }

        let missing_vlan = vlan.is_none() && desired.is_some_and(|d| d.vlan.is_some());
        let spec = NetworkSpec {
            name_label: record.name_label.clone(),
            name_description: record.name_description.clone(),
            mtu: u32::try_from(record.mtu).unwrap_or_default(),
            other_config: user_other_config(&record.other_config),
            vlan,
        };
        let computed = Attributes::from([
            ("bridge".to_string(), json!(record.bridge)),
            ("uuid".to_string(), json!(record.uuid)),
        ]);
        let mut actual = actual_from(key, &record.uuid, &spec, computed);
        actual.incomplete = missing_vlan;
        Ok(actual)
    }

    fn has_vlan(&self, pifs: &[PifRecord]) -> bool {
        pifs.iter().any(|pif| pif.vlan >= 0)
    }

    /// Converge the plain attributes of a network left by an unfinished create.
    async fn converge(&self, ctx: &Context, network_ref: &str, record: &NetworkRecord, spec: &NetworkSpec) -> Result<()> {
        if record.name_label != spec.name_label {
            ctx.api
                .call("network.set_name_label", vec![json!(network_ref), json!(spec.name_label)])
                .await?;
        }
        if record.name_description != spec.name_description {
            ctx.api
                .call(
                    "network.set_name_description",
                    vec![json!(network_ref), json!(spec.name_description)],
                )
                .await?;
        }
        if record.mtu != i64::from(spec.mtu) {
            ctx.api
                .call("network.set_MTU", vec![json!(network_ref), json!(spec.mtu)])
                .await?;
        }
        sync_other_config(ctx, "network", network_ref, &record.other_config, &spec.other_config).await
    }

    async fn create_network(&self, ctx: &Context, key: &str, spec: &NetworkSpec) -> Result<(OpaqueRef, NetworkRecord)> {
        let record = json!({
            "name_label": spec.name_label,
            "name_description": spec.name_description,
            "MTU": spec.mtu,
            "other_config": tagged_other_config(EntityKind::Network, key, &spec.other_config),
            "tags": [],
        });
        let created = ctx
            .run_task("network.create", vec![record], || async move {
                Ok(find_managed::<NetworkRecord>(ctx, EntityKind::Network, key, None)
                    .await?
                    .is_some())
            })
            .await?;

        match created {
            Some(network_ref) => {
                let record: NetworkRecord = ctx.api.get_record(&network_ref).await?;
                Ok((network_ref, record))
            }
            None => find_managed::<NetworkRecord>(ctx, EntityKind::Network, key, None)
                .await?
                .ok_or_else(|| Error::verification(EntityKind::Network, key, "created network not found")),
        }
    }

    /// Physical (untagged) PIF named `nic` on the coordinator.
    async fn physical_pif(&self, ctx: &Context, nic: &str) -> Result<OpaqueRef> {
        let (_, pool) = super::pool::pool_record(ctx).await?;
        ctx.api
            .get_all_records::<PifRecord>()
            .await?
            .into_iter()
            .find(|(_, pif)| pif.host == pool.master && pif.device == nic && pif.vlan < 0)
            .map(|(r, _)| r)
            .ok_or_else(|| Error::NotFound(format!("no physical interface '{}' on the coordinator", nic)))
    }
}

#[async_trait]
impl Reconciler for NetworkReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::Network
    }

    async fn observe(
        &self,
        ctx: &Context,
        key: &str,
        uuid_hint: Option<&str>,
        desired: Option<&ResourceSpec>,
    ) -> Result<Option<ActualState>> {
        let desired = match desired {
            Some(ResourceSpec::Network(spec)) => Some(spec),
            _ => None,
        };
        match find_managed::<NetworkRecord>(ctx, EntityKind::Network, key, uuid_hint).await? {
            Some((_, record)) => Ok(Some(self.observed(ctx, key, &record, desired).await?)),
            None => Ok(None),
        }
    }

    async fn list_managed(&self, ctx: &Context) -> Result<Vec<ActualState>> {
        let mut states = Vec::new();
        for (_, record, key) in all_managed::<NetworkRecord>(ctx, EntityKind::Network).await? {
            states.push(self.observed(ctx, &key, &record, None).await?);
        }
        Ok(states)
    }

    async fn create(&self, ctx: &Context, op: &Operation) -> Result<String> {
        let spec = network_spec(op)?;

        // Resolve the NIC before creating anything.
        let pif = match &spec.vlan {
            Some(vlan) => Some(self.physical_pif(ctx, &vlan.nic).await?),
            None => None,
        };

        let (network_ref, record) = match &op.uuid {
            Some(uuid) => {
                info!("Resuming creation of network {} ({})", spec.name_label, op.key());
                let network_ref = ctx.api.get_by_uuid::<NetworkRecord>(uuid).await?;
                let record: NetworkRecord = ctx.api.get_record(&network_ref).await?;
                self.converge(ctx, &network_ref, &record, spec).await?;
                (network_ref, record)
            }
            None => {
                info!("Creating network {} ({})", spec.name_label, op.key());
                self.create_network(ctx, op.key(), spec).await?
            }
        };

        let mut pifs = Vec::new();
        for pif_ref in &record.pifs {
            pifs.push(ctx.api.get_record::<PifRecord>(pif_ref).await?);
        }
        if let (Some(vlan), Some(pif)) = (&spec.vlan, pif)
            && !self.has_vlan(&pifs)
        {
            ctx.api
                .call(
                    "pool.create_VLAN_from_PIF",
                    vec![json!(pif), json!(network_ref), json!(vlan.tag)],
                )
                .await?;
        }

        Ok(record.uuid)
    }

    async fn update(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        let spec = network_spec(op)?;
        let network_ref = ctx.api.get_by_uuid::<NetworkRecord>(&actual.uuid).await?;
        info!("Updating network {} ({})", spec.name_label, op.key());

        if op.delta.contains_key("name_label") {
            ctx.api
                .call("network.set_name_label", vec![json!(network_ref), json!(spec.name_label)])
                .await?;
        }
        if op.delta.contains_key("name_description") {
            ctx.api
                .call(
                    "network.set_name_description",
                    vec![json!(network_ref), json!(spec.name_description)],
                )
                .await?;
        }
        if op.delta.contains_key("mtu") {
            ctx.api
                .call("network.set_MTU", vec![json!(network_ref), json!(spec.mtu)])
                .await?;
        }
        if op.delta.contains_key("other_config") {
            let record: NetworkRecord = ctx.api.get_record(&network_ref).await?;
            sync_other_config(ctx, "network", &network_ref, &record.other_config, &spec.other_config).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        info!("Deleting network {}", op.key());
        let network_ref = ctx.api.get_by_uuid::<NetworkRecord>(&actual.uuid).await?;
        let record: NetworkRecord = ctx.api.get_record(&network_ref).await?;

        for pif in &record.pifs {
            let pif: PifRecord = ctx.api.get_record(pif).await?;
            if !is_null_ref(&pif.vlan_master_of) {
                ctx.api.call("VLAN.destroy", vec![json!(pif.vlan_master_of)]).await?;
            }
        }

        let network = network_ref.clone();
        ctx.run_task("network.destroy", vec![json!(network_ref)], || {
            let network = network.clone();
            async move {
                match ctx.api.get_record::<NetworkRecord>(&network).await {
                    Ok(_) => Ok(false),
                    Err(err) if err.is_not_found() => Ok(true),
                    Err(err) => Err(err),
                }
            }
        })
        .await?;
        Ok(())
    }

    async fn import(&self, ctx: &Context, uuid: &str, key: &str) -> Result<()> {
        let network_ref = ctx.api.get_by_uuid::<NetworkRecord>(uuid).await?;
        tag(ctx, EntityKind::Network, &network_ref, key).await
    }
}
