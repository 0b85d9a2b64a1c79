//! Snapshot reconciler.
//!
//! A snapshot is a VM record with `is_a_snapshot` set. It is tagged with its
//! own kind so the VM reconciler never mistakes it for the VM it was taken
//! from, even though the snapshot starts out as a copy of that VM's tags.
//!
//! Setting `revert` rolls the VM back to the snapshot once. The disks the VM
//! has afterwards are kept on the snapshot under `xencp_revert_vdis`, which
//! also marks the revert as done.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::vm::{resolve_vm, revert_to_snapshot};
use super::{
    Context, Reconciler, actual_from, all_managed, find_managed, ignore_not_found, missing_spec, reference_of,
    require_non_empty, set_other_config, tag, untag, uuid_of,
};
use crate::api::{OpaqueRef, VbdRecord, VmRecord, is_null_ref};
use crate::error::{Error, Result};
use crate::model::{
    ActualState, Attributes, EntityId, EntityKind, EntitySpec, Operation, ResourceSpec, reference, to_attributes,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    pub name_label: String,
    /// VM key or uuid.
    pub vm: String,
    /// Include the memory image (checkpoint). Requires a running VM.
    #[serde(default)]
    pub with_memory: bool,
    /// Roll the VM back to this snapshot.
    #[serde(default)]
    pub revert: bool,
}

/// Uuids of the VM's disks after a revert, comma-separated.
const REVERT_VDIS_KEY: &str = "xencp_revert_vdis";

fn revert_vdis(record: &VmRecord) -> Option<Vec<String>> {
    record
        .other_config
        .get(REVERT_VDIS_KEY)
        .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
}

async fn disk_uuids(ctx: &Context, record: &VmRecord) -> Result<Vec<String>> {
    let mut disks = Vec::new();
    for vbd_ref in &record.vbds {
        let vbd: VbdRecord = ctx.api.get_record(vbd_ref).await?;
        if vbd.vbd_type.eq_ignore_ascii_case("disk") && !is_null_ref(&vbd.vdi) {
            disks.push(uuid_of(ctx, "VDI", &vbd.vdi).await?);
        }
    }
    Ok(disks)
}

impl EntitySpec for SnapshotSpec {
    const KIND: EntityKind = EntityKind::Snapshot;

    fn attributes(&self) -> Attributes {
        to_attributes(self)
    }

    fn references(&self) -> Vec<EntityId> {
        reference(EntityKind::Vm, &self.vm).into_iter().collect()
    }

    fn immutable_attributes(&self) -> &'static [&'static str] {
        &["vm", "with_memory"]
    }

    fn validate(&self, key: &str) -> Result<()> {
        require_non_empty(Self::KIND, key, "name_label", &self.name_label)?;
        require_non_empty(Self::KIND, key, "vm", &self.vm)
    }
}

fn snapshot_spec(op: &Operation) -> Result<&SnapshotSpec> {
    match &op.spec {
        Some(ResourceSpec::Snapshot(spec)) => Ok(spec),
        _ => Err(missing_spec(op)),
    }
}

pub struct SnapshotReconciler;

impl SnapshotReconciler {
    async fn observed(
        &self,
        ctx: &Context,
        key: &str,
        record: &VmRecord,
        desired: Option<&SnapshotSpec>,
    ) -> Result<ActualState> {
        // The source VM may be gone; the snapshot outlives it.
        let vm = if is_null_ref(&record.snapshot_of) {
            String::new()
        } else {
            reference_of::<VmRecord>(ctx, EntityKind::Vm, &record.snapshot_of, desired.map(|d| d.vm.as_str()))
                .await?
                .unwrap_or_default()
        };
        let spec = SnapshotSpec {
            name_label: record.name_label.clone(),
            vm,
            with_memory: record.power_state.eq_ignore_ascii_case("suspended"),
            revert: record.other_config.contains_key(REVERT_VDIS_KEY),
        };
        let computed = Attributes::from([
            ("disks".to_string(), json!(record.vbds.len())),
            ("revert_vdis".to_string(), json!(revert_vdis(record).unwrap_or_default())),
        ]);
        Ok(actual_from(key, &record.uuid, &spec, computed))
    }
}

#[async_trait]
impl Reconciler for SnapshotReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::Snapshot
    }

    async fn observe(
        &self,
        ctx: &Context,
        key: &str,
        uuid_hint: Option<&str>,
        desired: Option<&ResourceSpec>,
    ) -> Result<Option<ActualState>> {
        let desired = match desired {
            Some(ResourceSpec::Snapshot(spec)) => Some(spec),
            _ => None,
        };
        match find_managed::<VmRecord>(ctx, EntityKind::Snapshot, key, uuid_hint).await? {
            Some((_, record)) if record.is_a_snapshot => Ok(Some(self.observed(ctx, key, &record, desired).await?)),
            _ => Ok(None),
        }
    }

    async fn list_managed(&self, ctx: &Context) -> Result<Vec<ActualState>> {
        let mut states = Vec::new();
        for (_, record, key) in all_managed::<VmRecord>(ctx, EntityKind::Snapshot).await? {
            if record.is_a_snapshot {
                states.push(self.observed(ctx, &key, &record, None).await?);
            }
        }
        Ok(states)
    }

    async fn create(&self, ctx: &Context, op: &Operation) -> Result<String> {
        let spec = snapshot_spec(op)?;
        let key = op.key();
        let (vm_ref, _) = resolve_vm(ctx, &spec.vm).await?;
        let method = if spec.with_memory { "VM.checkpoint" } else { "VM.snapshot" };
        info!("Taking snapshot {} ({}) of {}", spec.name_label, key, spec.vm);

        let source = vm_ref.as_str();
        let name_label = spec.name_label.as_str();
        let taken = move || async move {
            Ok::<_, Error>(
                ctx.api
                    .get_all_records::<VmRecord>()
                    .await?
                    .into_iter()
                    .filter(|(_, vm)| vm.is_a_snapshot && vm.snapshot_of == source && vm.name_label == name_label)
                    .filter(|(_, vm)| super::managed_key(&vm.other_config, EntityKind::Snapshot).is_none())
                    .map(|(r, _)| r)
                    .next(),
            )
        };
        let result = ctx
            .run_task(method, vec![json!(vm_ref), json!(spec.name_label)], move || async move {
                Ok(taken().await?.is_some())
            })
            .await?;
        let snapshot_ref: OpaqueRef = match result {
            Some(r) => r,
            None => taken()
                .await?
                .ok_or_else(|| Error::verification(EntityKind::Snapshot, key, "snapshot not found"))?,
        };

        // The copy carries the source VM's tags; replace them with our own.
        untag(ctx, "VM", &snapshot_ref).await?;
        tag(ctx, EntityKind::Snapshot, &snapshot_ref, key).await?;

        // Freshly taken, the VM already matches it.
        if spec.revert {
            let vm: VmRecord = ctx.api.get_record(&vm_ref).await?;
            let disks = disk_uuids(ctx, &vm).await?;
            set_other_config(ctx, "VM", &snapshot_ref, REVERT_VDIS_KEY, &disks.join(",")).await?;
        }
        Ok(ctx.api.get_record::<VmRecord>(&snapshot_ref).await?.uuid)
    }

    async fn update(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        let spec = snapshot_spec(op)?;
        let snapshot_ref = ctx.api.get_by_uuid::<VmRecord>(&actual.uuid).await?;
        if op.delta.contains_key("name_label") {
            info!("Renaming snapshot {} to {}", op.key(), spec.name_label);
            ctx.api
                .call("VM.set_name_label", vec![json!(snapshot_ref), json!(spec.name_label)])
                .await?;
        }
        if !op.delta.contains_key("revert") {
            return Ok(());
        }

        if !spec.revert {
            ctx.api
                .call("VM.remove_from_other_config", vec![json!(snapshot_ref), json!(REVERT_VDIS_KEY)])
                .await?;
            return Ok(());
        }
        let record: VmRecord = ctx.api.get_record(&snapshot_ref).await?;
        if is_null_ref(&record.snapshot_of) {
            return Err(Error::NotFound(format!(
                "VM snapshotted by {} no longer exists, nothing to revert",
                op.key()
            )));
        }
        info!("Reverting {} to snapshot {}", spec.vm, op.key());
        let disks = revert_to_snapshot(ctx, &record.snapshot_of, &snapshot_ref).await?;
        set_other_config(ctx, "VM", &snapshot_ref, REVERT_VDIS_KEY, &disks.join(",")).await
    }

    async fn delete(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        info!("Deleting snapshot {}", op.key());
        let snapshot_ref = ctx.api.get_by_uuid::<VmRecord>(&actual.uuid).await?;
        let record: VmRecord = ctx.api.get_record(&snapshot_ref).await?;

        let mut disks = Vec::new();
        for vbd_ref in &record.vbds {
            let vbd: VbdRecord = ctx.api.get_record(vbd_ref).await?;
            if !is_null_ref(&vbd.vdi) {
                disks.push(vbd.vdi);
            }
        }
        ctx.api.call("VM.destroy", vec![json!(snapshot_ref)]).await?;
        for vdi_ref in disks {
            ignore_not_found(ctx.api.call("VDI.destroy", vec![json!(vdi_ref)]).await)?;
        }
        Ok(())
    }

    async fn import(&self, ctx: &Context, uuid: &str, key: &str) -> Result<()> {
        let snapshot_ref = ctx.api.get_by_uuid::<VmRecord>(uuid).await?;
        let record: VmRecord = ctx.api.get_record(&snapshot_ref).await?;
        if !record.is_a_snapshot {
            return Err(Error::validation(EntityKind::Snapshot, key, format!("{} is not a snapshot", uuid)));
        }
        untag(ctx, "VM", &snapshot_ref).await?;
        tag(ctx, EntityKind::Snapshot, &snapshot_ref, key).await
    }
}
