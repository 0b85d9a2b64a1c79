//! VDI reconciler - virtual disks in a storage repository.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{
    Context, Reconciler, actual_from, all_managed, find_managed, missing_spec, reference_of,
    require_non_empty, resolve, sync_other_config, tag, tagged_other_config, user_other_config,
    validate_other_config,
};
use crate::api::{SrRecord, VdiRecord};
use crate::error::{Error, Result};
use crate::model::{
    ActualState, Attributes, EntityId, EntityKind, EntitySpec, Operation, ResourceSpec, reference,
    to_attributes,
};

const VDI_TYPES: &[&str] = &["user", "system", "ephemeral", "suspend", "crashdump"];

fn default_type() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VdiSpec {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    /// Storage repository key or uuid.
    pub sr: String,
    /// Size in bytes.
    pub virtual_size: u64,
    #[serde(rename = "type", default = "default_type")]
    pub vdi_type: String,
    #[serde(default)]
    pub sharable: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
}

impl EntitySpec for VdiSpec {
    const KIND: EntityKind = EntityKind::Vdi;

    fn attributes(&self) -> Attributes {
        to_attributes(self)
    }

    fn references(&self) -> Vec<EntityId> {
        reference(EntityKind::StorageRepository, &self.sr).into_iter().collect()
    }

    fn immutable_attributes(&self) -> &'static [&'static str] {
        &["sr", "virtual_size", "type", "sharable", "read_only"]
    }

    fn validate(&self, key: &str) -> Result<()> {
        require_non_empty(Self::KIND, key, "name_label", &self.name_label)?;
        require_non_empty(Self::KIND, key, "sr", &self.sr)?;
        if self.virtual_size == 0 {
            return Err(Error::validation(Self::KIND, key, "virtual_size must be greater than zero"));
        }
        if !VDI_TYPES.contains(&self.vdi_type.as_str()) {
            return Err(Error::validation(
                Self::KIND,
                key,
                format!("type must be one of {}", VDI_TYPES.join(", ")),
            ));
        }
        validate_other_config(Self::KIND, key, &self.other_config)
    }
}

fn vdi_spec(op: &Operation) -> Result<&VdiSpec> {
    match &op.spec {
        Some(ResourceSpec::Vdi(spec)) => Ok(spec),
        _ => Err(missing_spec(op)),
    }
}

pub struct VdiReconciler;

impl VdiReconciler {
    async fn observed(
        &self,
        ctx: &Context,
        key: &str,
        record: &VdiRecord,
        desired: Option<&VdiSpec>,
    ) -> Result<ActualState> {
        let sr = reference_of::<SrRecord>(
            ctx,
            EntityKind::StorageRepository,
            &record.sr,
            desired.map(|d| d.sr.as_str()),
        )
        .await?
        .unwrap_or_default();

        let spec = VdiSpec {
            name_label: record.name_label.clone(),
            name_description: record.name_description.clone(),
            sr,
            virtual_size: u64::try_from(record.virtual_size).unwrap_or_default(),
            vdi_type: record.vdi_type.clone(),
            sharable: record.sharable,
            read_only: record.read_only,
            other_config: user_other_config(&record.other_config),
        };
        let computed = Attributes::from([("attached_vbds".to_string(), json!(record.vbds.len()))]);
        Ok(actual_from(key, &record.uuid, &spec, computed))
    }
}

#[async_trait]
impl Reconciler for VdiReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::Vdi
    }

    async fn observe(
        &self,
        ctx: &Context,
        key: &str,
        uuid_hint: Option<&str>,
        desired: Option<&ResourceSpec>,
    ) -> Result<Option<ActualState>> {
        let desired = match desired {
            Some(ResourceSpec::Vdi(spec)) => Some(spec),
            _ => None,
        };
        match find_managed::<VdiRecord>(ctx, EntityKind::Vdi, key, uuid_hint).await? {
            Some((_, record)) => Ok(Some(self.observed(ctx, key, &record, desired).await?)),
            None => Ok(None),
        }
    }

    async fn list_managed(&self, ctx: &Context) -> Result<Vec<ActualState>> {
        let mut states = Vec::new();
        for (_, record, key) in all_managed::<VdiRecord>(ctx, EntityKind::Vdi).await? {
            states.push(self.observed(ctx, &key, &record, None).await?);
        }
        Ok(states)
    }

    async fn create(&self, ctx: &Context, op: &Operation) -> Result<String> {
        let spec = vdi_spec(op)?;
        let (sr_ref, _) = resolve::<SrRecord>(ctx, EntityKind::StorageRepository, &spec.sr).await?;
        info!("Creating VDI {} ({}) in {}", spec.name_label, op.key(), spec.sr);

        let record = json!({
            "name_label": spec.name_label,
            "name_description": spec.name_description,
            "SR": sr_ref,
            "virtual_size": spec.virtual_size.to_string(),
            "type": spec.vdi_type,
            "sharable": spec.sharable,
            "read_only": spec.read_only,
            "other_config": tagged_other_config(EntityKind::Vdi, op.key(), &spec.other_config),
            "xenstore_data": {},
            "sm_config": {},
            "tags": [],
        });
        let key = op.key();
        let created = ctx
            .run_task("VDI.create", vec![record], move || async move {
                Ok(find_managed::<VdiRecord>(ctx, EntityKind::Vdi, key, None).await?.is_some())
            })
            .await?;

        match created {
            Some(vdi_ref) => Ok(ctx.api.get_record::<VdiRecord>(&vdi_ref).await?.uuid),
            None => find_managed::<VdiRecord>(ctx, EntityKind::Vdi, key, None)
                .await?
                .map(|(_, record)| record.uuid)
                .ok_or_else(|| Error::verification(EntityKind::Vdi, key, "created VDI not found")),
        }
    }

    async fn update(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        let spec = vdi_spec(op)?;
        let vdi_ref = ctx.api.get_by_uuid::<VdiRecord>(&actual.uuid).await?;
        info!("Updating VDI {} ({})", spec.name_label, op.key());

        if op.delta.contains_key("name_label") {
            ctx.api
                .call("VDI.set_name_label", vec![json!(vdi_ref), json!(spec.name_label)])
                .await?;
        }
        if op.delta.contains_key("name_description") {
            ctx.api
                .call("VDI.set_name_description", vec![json!(vdi_ref), json!(spec.name_description)])
                .await?;
        }
        if op.delta.contains_key("other_config") {
            let record: VdiRecord = ctx.api.get_record(&vdi_ref).await?;
            sync_other_config(ctx, "VDI", &vdi_ref, &record.other_config, &spec.other_config).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        info!("Deleting VDI {}", op.key());
        let vdi_ref = ctx.api.get_by_uuid::<VdiRecord>(&actual.uuid).await?;
        let target = vdi_ref.as_str();
        ctx.run_task("VDI.destroy", vec![json!(vdi_ref)], move || async move {
            match ctx.api.get_record::<VdiRecord>(target).await {
                Ok(_) => Ok(false),
                Err(err) if err.is_not_found() => Ok(true),
                Err(err) => Err(err),
            }
        })
        .await?;
        Ok(())
    }

    async fn import(&self, ctx: &Context, uuid: &str, key: &str) -> Result<()> {
        let vdi_ref = ctx.api.get_by_uuid::<VdiRecord>(uuid).await?;
        tag(ctx, EntityKind::Vdi, &vdi_ref, key).await
    }
}
