//! VM reconciler.
//!
//! VMs are cloned from a template found by exact name and provisioned, which
//! may create disks of its own. Those disks are recorded in `other_config` so
//! that observation only reports the disks the caller declared and delete
//! removes the provisioned ones too.
//!
//! A clone is tagged as soon as it exists but only counts as created once
//! `xencp_provisioned` is set, after every create step went through. Until
//! then it observes as incomplete and the next create picks it up where the
//! last one stopped.
//!
//! Memory and vCPU limits can only change while the VM is halted. An update
//! that needs them on a running VM is a conflict unless the same update also
//! halts the VM.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{
    Context, Reconciler, actual_from, ignore_not_found, managed_key, missing_spec, reference_name,
    require_non_empty, resolve, set_other_config, sync_other_config, tag, user_other_config, uuid_of,
    validate_other_config,
};
use crate::api::{ApiError, NetworkRecord, OpaqueRef, VbdRecord, VdiRecord, VifRecord, VmRecord, is_null_ref};
use crate::error::{Error, Result};
use crate::model::{
    ActualState, Attributes, EntityId, EntityKind, EntitySpec, Operation, ResourceSpec, is_uuid, reference,
    to_attributes,
};

/// Template the VM was cloned from.
const TEMPLATE_KEY: &str = "xencp_template";
/// Comma-separated uuids of disks created by template provisioning.
const TEMPLATE_VDIS_KEY: &str = "xencp_template_vdis";
/// Written last by create. A tagged VM without it is an unfinished create.
const PROVISIONED_KEY: &str = "xencp_provisioned";

const MEMORY_ATTRIBUTES: &[&str] = &[
    "memory_static_min",
    "memory_static_max",
    "memory_dynamic_min",
    "memory_dynamic_max",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMode {
    #[default]
    Bios,
    Uefi,
    UefiSecurity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    #[default]
    Halted,
    Paused,
    Suspended,
}

impl PowerState {
    fn from_xapi(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" => PowerState::Running,
            "paused" => PowerState::Paused,
            "suspended" => PowerState::Suspended,
            _ => PowerState::Halted,
        }
    }
}

fn default_boot_order() -> String {
    "cd".to_string()
}

fn default_mode() -> String {
    "RW".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// VDI key or uuid.
    pub vdi: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub bootable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Network key or uuid.
    pub network: String,
    pub device: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    /// Exact name of the template to clone.
    pub template: String,
    pub vcpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores_per_socket: Option<u32>,
    pub memory_static_max: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_static_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_dynamic_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_dynamic_max: Option<u64>,
    #[serde(default)]
    pub boot_mode: BootMode,
    #[serde(default = "default_boot_order")]
    pub boot_order: String,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
}

impl VmSpec {
    /// `[static_min, static_max, dynamic_min, dynamic_max]`, unset values
    /// defaulting to the static maximum.
    pub fn memory_limits(&self) -> [u64; 4] {
        let max = self.memory_static_max;
        [
            self.memory_static_min.unwrap_or(max),
            max,
            self.memory_dynamic_min.unwrap_or(max),
            self.memory_dynamic_max.unwrap_or(max),
        ]
    }
}

fn is_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

impl EntitySpec for VmSpec {
    const KIND: EntityKind = EntityKind::Vm;

    fn attributes(&self) -> Attributes {
        let mut normalized = self.clone();
        normalized
            .disks
            .sort_by(|a, b| b.bootable.cmp(&a.bootable).then_with(|| a.vdi.cmp(&b.vdi)));
        normalized.interfaces.sort_by_key(|i| i.device);
        to_attributes(&normalized)
    }

    fn references(&self) -> Vec<EntityId> {
        let disks = self
            .disks
            .iter()
            .filter_map(|d| reference(EntityKind::Vdi, &d.vdi));
        let networks = self
            .interfaces
            .iter()
            .filter_map(|i| reference(EntityKind::Network, &i.network));
        disks.chain(networks).collect()
    }

    fn immutable_attributes(&self) -> &'static [&'static str] {
        &["template", "boot_mode"]
    }

    fn validate(&self, key: &str) -> Result<()> {
        let invalid = |message: String| Err(Error::validation(Self::KIND, key, message));

        require_non_empty(Self::KIND, key, "name_label", &self.name_label)?;
        require_non_empty(Self::KIND, key, "template", &self.template)?;
        if self.vcpus == 0 {
            return invalid("vcpus must be at least 1".into());
        }
        if let Some(cores) = self.cores_per_socket
            && (cores == 0 || self.vcpus % cores != 0)
        {
            return invalid(format!("cores_per_socket {} does not divide vcpus {}", cores, self.vcpus));
        }

        let [static_min, static_max, dynamic_min, dynamic_max] = self.memory_limits();
        if static_max == 0 {
            return invalid("memory_static_max must be greater than zero".into());
        }
        if !(static_min <= dynamic_min && dynamic_min <= dynamic_max && dynamic_max <= static_max) {
            return invalid("memory must satisfy static_min <= dynamic_min <= dynamic_max <= static_max".into());
        }

        if self.boot_order.is_empty()
            || self.boot_order.len() > 3
            || !self.boot_order.chars().all(|c| matches!(c, 'c' | 'd' | 'n'))
        {
            return invalid(format!("boot_order '{}' must be 1-3 of c, d, n", self.boot_order));
        }

        let mut vdis = BTreeSet::new();
        for disk in &self.disks {
            if disk.mode != "RW" && disk.mode != "RO" {
                return invalid(format!("disk '{}' mode must be RW or RO", disk.vdi));
            }
            if !vdis.insert(disk.vdi.as_str()) {
                return invalid(format!("disk '{}' is attached twice", disk.vdi));
            }
        }
        let mut devices = BTreeSet::new();
        for interface in &self.interfaces {
            if !devices.insert(interface.device) {
                return invalid(format!("interface device {} is used twice", interface.device));
            }
            if let Some(mac) = &interface.mac
                && !is_mac(mac)
            {
                return invalid(format!("'{}' is not a MAC address", mac));
            }
        }

        if matches!(self.power_state, PowerState::Paused | PowerState::Suspended) {
            return invalid("power_state must be running or halted".into());
        }
        validate_other_config(Self::KIND, key, &self.other_config)
    }
}

fn vm_spec(op: &Operation) -> Result<&VmSpec> {
    match &op.spec {
        Some(ResourceSpec::Vm(spec)) => Ok(spec),
        _ => Err(missing_spec(op)),
    }
}

/// Template disk uuids recorded at provisioning.
fn template_vdis(record: &VmRecord) -> BTreeSet<String> {
    record
        .other_config
        .get(TEMPLATE_VDIS_KEY)
        .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Spelling of a reference: the first desired candidate naming the same object wins.
fn spelling<'a>(candidates: impl IntoIterator<Item = &'a str>, uuid: &str, key: Option<&str>) -> String {
    let wanted = candidates.into_iter().find(|c| *c == uuid || Some(*c) == key);
    reference_name(wanted, uuid, key)
}

/// VM (not snapshot) managed under `key`.
pub(crate) async fn find_vm(ctx: &Context, key: &str, uuid_hint: Option<&str>) -> Result<Option<(OpaqueRef, VmRecord)>> {
    if let Some(uuid) = uuid_hint {
        match ctx.api.get_by_uuid::<VmRecord>(uuid).await {
            Ok(vm_ref) => {
                let record: VmRecord = ctx.api.get_record(&vm_ref).await?;
                if !record.is_a_snapshot && managed_key(&record.other_config, EntityKind::Vm) == Some(key) {
                    return Ok(Some((vm_ref, record)));
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    let mut matches: Vec<(OpaqueRef, VmRecord)> = ctx
        .api
        .get_all_records::<VmRecord>()
        .await?
        .into_iter()
        .filter(|(_, vm)| !vm.is_a_snapshot && managed_key(&vm.other_config, EntityKind::Vm) == Some(key))
        .collect();
    matches.sort_by(|a, b| a.1.uuid.cmp(&b.1.uuid));
    if matches.len() > 1 {
        warn!(key, count = matches.len(), "Several VMs carry the same key; using the first");
    }
    Ok(matches.into_iter().next())
}

/// Resolve a VM reference written as a managed key or a uuid.
pub(crate) async fn resolve_vm(ctx: &Context, reference: &str) -> Result<(OpaqueRef, VmRecord)> {
    if is_uuid(reference) {
        let vm_ref = ctx.api.get_by_uuid::<VmRecord>(reference).await?;
        let record = ctx.api.get_record(&vm_ref).await?;
        return Ok((vm_ref, record));
    }
    find_vm(ctx, reference, None)
        .await?
        .ok_or_else(|| Error::NotFound(format!("vm '{}' is not managed on this pool", reference)))
}

fn vm_is_running_conflict(vm_ref: &str) -> Error {
    Error::Conflict(ApiError::code("VM_BAD_POWER_STATE", &[vm_ref, "halted", "running"]))
}

/// Revert the VM at `vm_ref` to `snapshot_ref` and return the uuids of its
/// disks afterwards.
///
/// Reverting replaces every disk with a copy of the snapshot's. Provisioned
/// disks are matched by device position so they stay out of the observed
/// disk list. A VM snapshotted while running is started again.
pub(crate) async fn revert_to_snapshot(ctx: &Context, vm_ref: &str, snapshot_ref: &str) -> Result<Vec<String>> {
    let before: VmRecord = ctx.api.get_record(vm_ref).await?;
    let from_template = template_vdis(&before);
    let mut template_devices = BTreeSet::new();
    for vbd_ref in &before.vbds {
        let vbd: VbdRecord = ctx.api.get_record(vbd_ref).await?;
        if !is_null_ref(&vbd.vdi) && from_template.contains(&uuid_of(ctx, "VDI", &vbd.vdi).await?) {
            template_devices.insert(vbd.userdevice);
        }
    }

    let replaced: BTreeSet<OpaqueRef> = before.vbds.iter().cloned().collect();
    let replaced = &replaced;
    ctx.run_task("VM.revert", vec![json!(snapshot_ref)], move || async move {
        let record = ctx.api.get_record::<VmRecord>(vm_ref).await?;
        Ok(!record.is_running() && record.vbds.iter().all(|vbd| !replaced.contains(vbd)))
    })
    .await?;

    let after: VmRecord = ctx.api.get_record(vm_ref).await?;
    let mut disks = Vec::new();
    let mut provisioned = Vec::new();
    for vbd_ref in &after.vbds {
        let vbd: VbdRecord = ctx.api.get_record(vbd_ref).await?;
        if vbd.empty || !vbd.vbd_type.eq_ignore_ascii_case("disk") || is_null_ref(&vbd.vdi) {
            continue;
        }
        let uuid = uuid_of(ctx, "VDI", &vbd.vdi).await?;
        if template_devices.contains(&vbd.userdevice) {
            provisioned.push(uuid.clone());
        }
        disks.push(uuid);
    }
    if !from_template.is_empty() {
        set_other_config(ctx, "VM", vm_ref, TEMPLATE_VDIS_KEY, &provisioned.join(",")).await?;
    }

    let snapshot: VmRecord = ctx.api.get_record(snapshot_ref).await?;
    let was_running = snapshot
        .snapshot_info
        .get("power-state-at-snapshot")
        .is_some_and(|state| state.eq_ignore_ascii_case("running"));
    if was_running {
        debug!("Restarting VM {} as it was running when snapshotted", after.uuid);
        VmReconciler.start(ctx, vm_ref, &after).await?;
    }
    Ok(disks)
}

pub struct VmReconciler;

impl VmReconciler {
    async fn observed(&self, ctx: &Context, key: &str, record: &VmRecord, desired: Option<&VmSpec>) -> Result<ActualState> {
        let from_template = template_vdis(record);

        let mut disks = Vec::new();
        for vbd_ref in &record.vbds {
            let vbd: VbdRecord = ctx.api.get_record(vbd_ref).await?;
            if vbd.empty || !vbd.vbd_type.eq_ignore_ascii_case("disk") || is_null_ref(&vbd.vdi) {
                continue;
            }
            let vdi: VdiRecord = ctx.api.get_record(&vbd.vdi).await?;
            if from_template.contains(&vdi.uuid) {
                continue;
            }
            let candidates = desired.into_iter().flat_map(|d| d.disks.iter().map(|disk| disk.vdi.as_str()));
            disks.push(DiskSpec {
                vdi: spelling(candidates, &vdi.uuid, managed_key(&vdi.other_config, EntityKind::Vdi)),
                mode: vbd.mode,
                bootable: vbd.bootable,
            });
        }

        let mut interfaces = Vec::new();
        let mut macs = BTreeMap::new();
        for vif_ref in &record.vifs {
            let vif: VifRecord = ctx.api.get_record(vif_ref).await?;
            let device: u32 = vif.device.parse().unwrap_or_default();
            let wanted = desired.and_then(|d| d.interfaces.iter().find(|i| i.device == device));
            let network: NetworkRecord = ctx.api.get_record(&vif.network).await?;
            macs.insert(device.to_string(), json!(vif.mac));
            interfaces.push(InterfaceSpec {
                network: spelling(
                    wanted.map(|i| i.network.as_str()),
                    &network.uuid,
                    managed_key(&network.other_config, EntityKind::Network),
                ),
                device,
                mac: wanted.and_then(|i| i.mac.as_ref()).map(|_| vif.mac.clone()),
            });
        }

        let as_u64 = |v: i64| u64::try_from(v).unwrap_or_default();
        let optional = |wanted: Option<u64>, live: i64| wanted.map(|_| as_u64(live));
        let uefi = record.hvm_boot_params.get("firmware").map(String::as_str) == Some("uefi");
        let secure = record.platform.get("secureboot").map(String::as_str) == Some("true");

        let spec = VmSpec {
            name_label: record.name_label.clone(),
            name_description: record.name_description.clone(),
            template: record.other_config.get(TEMPLATE_KEY).cloned().unwrap_or_default(),
            vcpus: u32::try_from(record.vcpus_at_startup).unwrap_or_default(),
            cores_per_socket: record
                .platform
                .get("cores-per-socket")
                .and_then(|c| c.parse().ok()),
            memory_static_max: as_u64(record.memory_static_max),
            memory_static_min: optional(desired.and_then(|d| d.memory_static_min), record.memory_static_min),
            memory_dynamic_min: optional(desired.and_then(|d| d.memory_dynamic_min), record.memory_dynamic_min),
            memory_dynamic_max: optional(desired.and_then(|d| d.memory_dynamic_max), record.memory_dynamic_max),
            boot_mode: match (uefi, secure) {
                (true, true) => BootMode::UefiSecurity,
                (true, false) => BootMode::Uefi,
                _ => BootMode::Bios,
            },
            boot_order: record
                .hvm_boot_params
                .get("order")
                .cloned()
                .unwrap_or_else(default_boot_order),
            disks,
            interfaces,
            power_state: PowerState::from_xapi(&record.power_state),
            other_config: user_other_config(&record.other_config),
        };
        let computed = Attributes::from([
            ("power_state".to_string(), json!(record.power_state)),
            ("mac_addresses".to_string(), Value::Object(macs.into_iter().collect())),
            ("template_disks".to_string(), json!(from_template.len())),
        ]);
        let mut actual = actual_from(key, &record.uuid, &spec, computed);
        actual.incomplete = !record.other_config.contains_key(PROVISIONED_KEY);
        Ok(actual)
    }

    async fn find_template(&self, ctx: &Context, name: &str) -> Result<OpaqueRef> {
        let refs: Vec<OpaqueRef> = serde_json::from_value(
            ctx.api.call("VM.get_by_name_label", vec![json!(name)]).await?,
        )
        .map_err(|e| Error::RemoteInternal(format!("VM.get_by_name_label: {}", e)))?;

        let mut templates = Vec::new();
        for vm_ref in refs {
            let record: VmRecord = ctx.api.get_record(&vm_ref).await?;
            if record.is_a_template && !record.is_a_snapshot {
                templates.push((record.uuid, vm_ref));
            }
        }
        templates.sort();
        if templates.len() > 1 {
            warn!(template = name, count = templates.len(), "Several templates share this name; using the first");
        }
        templates
            .into_iter()
            .next()
            .map(|(_, vm_ref)| vm_ref)
            .ok_or_else(|| Error::NotFound(format!("template '{}'", name)))
    }

    async fn set_memory(&self, ctx: &Context, vm_ref: &str, spec: &VmSpec) -> Result<()> {
        let [static_min, static_max, dynamic_min, dynamic_max] = spec.memory_limits();
        ctx.api
            .call(
                "VM.set_memory_limits",
                vec![
                    json!(vm_ref),
                    json!(static_min.to_string()),
                    json!(static_max.to_string()),
                    json!(dynamic_min.to_string()),
                    json!(dynamic_max.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Raise the maximum first when growing, lower at-startup first when shrinking.
    async fn set_vcpus(&self, ctx: &Context, vm_ref: &str, current_max: i64, vcpus: u32) -> Result<()> {
        let max = ("VM.set_VCPUs_max", vcpus);
        let at_startup = ("VM.set_VCPUs_at_startup", vcpus);
        let order = if i64::from(vcpus) > current_max {
            [max, at_startup]
        } else {
            [at_startup, max]
        };
        for (method, value) in order {
            ctx.api
                .call(method, vec![json!(vm_ref), json!(value.to_string())])
                .await?;
        }
        Ok(())
    }

    async fn set_boot(&self, ctx: &Context, vm_ref: &str, record: &VmRecord, spec: &VmSpec) -> Result<()> {
        let mut platform = record.platform.clone();
        match spec.cores_per_socket {
            Some(cores) => platform.insert("cores-per-socket".into(), cores.to_string()),
            None => platform.remove("cores-per-socket"),
        };
        platform.insert(
            "secureboot".into(),
            (spec.boot_mode == BootMode::UefiSecurity).to_string(),
        );
        if platform != record.platform {
            ctx.api
                .call("VM.set_platform", vec![json!(vm_ref), json!(platform)])
                .await?;
        }

        let mut boot_params = record.hvm_boot_params.clone();
        boot_params.insert("order".into(), spec.boot_order.clone());
        let firmware = if spec.boot_mode == BootMode::Bios { "bios" } else { "uefi" };
        boot_params.insert("firmware".into(), firmware.into());
        if boot_params != record.hvm_boot_params {
            ctx.api
                .call("VM.set_HVM_boot_params", vec![json!(vm_ref), json!(boot_params)])
                .await?;
        }
        Ok(())
    }

    async fn create_vbd(&self, ctx: &Context, vm_ref: &str, disk: &DiskSpec, userdevice: u32) -> Result<OpaqueRef> {
        let (vdi_ref, _) = resolve::<VdiRecord>(ctx, EntityKind::Vdi, &disk.vdi).await?;
        debug!(vdi = %disk.vdi, userdevice, "Attaching disk");
        ctx.api
            .call_ref(
                "VBD.create",
                vec![json!({
                    "VM": vm_ref,
                    "VDI": vdi_ref,
                    "userdevice": userdevice.to_string(),
                    "bootable": disk.bootable,
                    "mode": disk.mode,
                    "type": "Disk",
                    "empty": false,
                    "unpluggable": true,
                    "other_config": {},
                    "qos_algorithm_type": "",
                    "qos_algorithm_params": {},
                })],
            )
            .await
    }

    async fn create_vif(&self, ctx: &Context, vm_ref: &str, interface: &InterfaceSpec) -> Result<OpaqueRef> {
        let (network_ref, network) = resolve::<NetworkRecord>(ctx, EntityKind::Network, &interface.network).await?;
        debug!(network = %interface.network, device = interface.device, "Attaching interface");
        ctx.api
            .call_ref(
                "VIF.create",
                vec![json!({
                    "device": interface.device.to_string(),
                    "network": network_ref,
                    "VM": vm_ref,
                    "MAC": interface.mac.clone().unwrap_or_default(),
                    "MTU": network.mtu.to_string(),
                    "other_config": {},
                    "qos_algorithm_type": "",
                    "qos_algorithm_params": {},
                })],
            )
            .await
    }

    /// Bring the attached disks to `spec.disks`, ignoring template disks.
    async fn sync_disks(&self, ctx: &Context, vm_ref: &str, record: &VmRecord, spec: &VmSpec) -> Result<()> {
        let running = record.is_running();
        let from_template = template_vdis(record);

        let mut wanted = BTreeMap::new();
        for disk in &spec.disks {
            let (_, vdi) = resolve::<VdiRecord>(ctx, EntityKind::Vdi, &disk.vdi).await?;
            wanted.insert(vdi.uuid, disk);
        }

        let mut userdevices = BTreeSet::new();
        let mut present = BTreeSet::new();
        for vbd_ref in &record.vbds {
            let vbd: VbdRecord = ctx.api.get_record(vbd_ref).await?;
            userdevices.insert(vbd.userdevice.parse::<u32>().unwrap_or_default());
            if vbd.empty || !vbd.vbd_type.eq_ignore_ascii_case("disk") || is_null_ref(&vbd.vdi) {
                continue;
            }
            let vdi_uuid = uuid_of(ctx, "VDI", &vbd.vdi).await?;
            if from_template.contains(&vdi_uuid) {
                continue;
            }
            let keep = wanted
                .get(&vdi_uuid)
                .is_some_and(|d| d.mode == vbd.mode && d.bootable == vbd.bootable);
            if keep {
                present.insert(vdi_uuid);
                continue;
            }
            if vbd.currently_attached {
                ctx.api.call("VBD.unplug", vec![json!(vbd_ref)]).await?;
            }
            ctx.api.call("VBD.destroy", vec![json!(vbd_ref)]).await?;
            userdevices.remove(&vbd.userdevice.parse::<u32>().unwrap_or_default());
        }

        let mut disks: Vec<&DiskSpec> = spec.disks.iter().collect();
        disks.sort_by(|a, b| b.bootable.cmp(&a.bootable).then_with(|| a.vdi.cmp(&b.vdi)));
        for disk in disks {
            let (_, vdi) = resolve::<VdiRecord>(ctx, EntityKind::Vdi, &disk.vdi).await?;
            if present.contains(&vdi.uuid) {
                continue;
            }
            let userdevice = (0..).find(|n| !userdevices.contains(n)).unwrap_or_default();
            userdevices.insert(userdevice);
            let vbd_ref = self.create_vbd(ctx, vm_ref, disk, userdevice).await?;
            if running {
                ctx.api.call("VBD.plug", vec![json!(vbd_ref)]).await?;
            }
        }
        Ok(())
    }

    /// Bring the interfaces to `spec.interfaces`, keyed by device index.
    async fn sync_interfaces(&self, ctx: &Context, vm_ref: &str, record: &VmRecord, spec: &VmSpec) -> Result<()> {
        let running = record.is_running();
        let mut present = BTreeSet::new();

        for vif_ref in &record.vifs {
            let vif: VifRecord = ctx.api.get_record(vif_ref).await?;
            let device: u32 = vif.device.parse().unwrap_or_default();
            let mut keep = false;
            if let Some(wanted) = spec.interfaces.iter().find(|i| i.device == device) {
                let (network_ref, _) = resolve::<NetworkRecord>(ctx, EntityKind::Network, &wanted.network).await?;
                let mac_matches = wanted
                    .mac
                    .as_ref()
                    .is_none_or(|mac| mac.eq_ignore_ascii_case(&vif.mac));
                keep = network_ref == vif.network && mac_matches;
            }
            if keep {
                present.insert(device);
                continue;
            }
            if vif.currently_attached {
                ctx.api.call("VIF.unplug", vec![json!(vif_ref)]).await?;
            }
            ctx.api.call("VIF.destroy", vec![json!(vif_ref)]).await?;
        }

        let mut interfaces: Vec<&InterfaceSpec> = spec.interfaces.iter().collect();
        interfaces.sort_by_key(|i| i.device);
        for interface in interfaces {
            if present.contains(&interface.device) {
                continue;
            }
            let vif_ref = self.create_vif(ctx, vm_ref, interface).await?;
            if running {
                ctx.api.call("VIF.plug", vec![json!(vif_ref)]).await?;
            }
        }
        Ok(())
    }

    /// Clone the template and tag the clone so a failed create can be resumed.
    async fn clone_template(&self, ctx: &Context, key: &str, spec: &VmSpec) -> Result<OpaqueRef> {
        let template = self.find_template(ctx, &spec.template).await?;
        info!("Creating VM {} ({}) from {}", spec.name_label, key, spec.template);

        let existing: BTreeSet<OpaqueRef> = ctx
            .api
            .get_all_records::<VmRecord>()
            .await?
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        let existing = &existing;
        let name_label = spec.name_label.as_str();
        let clone_of = move || async move {
            Ok::<_, Error>(
                ctx.api
                    .get_all_records::<VmRecord>()
                    .await?
                    .into_iter()
                    .find(|(r, vm)| !existing.contains(r) && !vm.is_a_snapshot && vm.name_label == name_label)
                    .map(|(r, _)| r),
            )
        };
        let cloned = ctx
            .run_task("VM.clone", vec![json!(template), json!(spec.name_label)], move || async move {
                Ok(clone_of().await?.is_some())
            })
            .await?;
        let vm_ref = match cloned {
            Some(vm_ref) => vm_ref,
            None => clone_of()
                .await?
                .ok_or_else(|| Error::verification(EntityKind::Vm, key, "cloned VM not found"))?,
        };

        tag(ctx, EntityKind::Vm, &vm_ref, key).await?;
        set_other_config(ctx, "VM", &vm_ref, TEMPLATE_KEY, &spec.template).await?;
        Ok(vm_ref)
    }

    /// Run template provisioning and record the disks it created.
    async fn provision(&self, ctx: &Context, vm_ref: &str) -> Result<()> {
        ctx.run_task("VM.provision", vec![json!(vm_ref)], move || async move {
            let record = ctx.api.get_record::<VmRecord>(vm_ref).await?;
            Ok(!record.other_config.contains_key("disks"))
        })
        .await?;

        let record: VmRecord = ctx.api.get_record(vm_ref).await?;
        let mut provisioned = Vec::new();
        for vbd_ref in &record.vbds {
            let vbd: VbdRecord = ctx.api.get_record(vbd_ref).await?;
            if !is_null_ref(&vbd.vdi) {
                provisioned.push(uuid_of(ctx, "VDI", &vbd.vdi).await?);
            }
        }
        set_other_config(ctx, "VM", vm_ref, TEMPLATE_VDIS_KEY, &provisioned.join(",")).await
    }

    async fn start(&self, ctx: &Context, vm_ref: &str, record: &VmRecord) -> Result<()> {
        let method = match PowerState::from_xapi(&record.power_state) {
            PowerState::Running => return Ok(()),
            PowerState::Paused => "VM.unpause",
            PowerState::Suspended => "VM.resume",
            PowerState::Halted => "VM.start",
        };
        let mut params = vec![json!(vm_ref)];
        if method != "VM.unpause" {
            // start_paused / force
            params.extend([json!(false), json!(false)]);
        }
        ctx.run_task(method, params, move || async move {
            Ok(ctx.api.get_record::<VmRecord>(vm_ref).await?.is_running())
        })
        .await?;
        Ok(())
    }

    async fn shutdown(&self, ctx: &Context, vm_ref: &str) -> Result<()> {
        ctx.run_task("VM.hard_shutdown", vec![json!(vm_ref)], move || async move {
            let record = ctx.api.get_record::<VmRecord>(vm_ref).await?;
            Ok(PowerState::from_xapi(&record.power_state) == PowerState::Halted)
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VmReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::Vm
    }

    async fn observe(
        &self,
        ctx: &Context,
        key: &str,
        uuid_hint: Option<&str>,
        desired: Option<&ResourceSpec>,
    ) -> Result<Option<ActualState>> {
        let desired = match desired {
            Some(ResourceSpec::Vm(spec)) => Some(spec),
            _ => None,
        };
        match find_vm(ctx, key, uuid_hint).await? {
            Some((_, record)) => Ok(Some(self.observed(ctx, key, &record, desired).await?)),
            None => Ok(None),
        }
    }

    async fn list_managed(&self, ctx: &Context) -> Result<Vec<ActualState>> {
        let mut found: Vec<(VmRecord, String)> = ctx
            .api
            .get_all_records::<VmRecord>()
            .await?
            .into_iter()
            .filter(|(_, vm)| !vm.is_a_snapshot)
            .filter_map(|(_, vm)| {
                let key = managed_key(&vm.other_config, EntityKind::Vm)?.to_string();
                Some((vm, key))
            })
            .collect();
        found.sort_by(|a, b| a.1.cmp(&b.1));

        let mut states = Vec::new();
        for (record, key) in found {
            states.push(self.observed(ctx, &key, &record, None).await?);
        }
        Ok(states)
    }

    async fn create(&self, ctx: &Context, op: &Operation) -> Result<String> {
        let spec = vm_spec(op)?;
        let key = op.key();
        let vm_ref = match &op.uuid {
            Some(uuid) => {
                info!("Resuming creation of VM {} ({})", spec.name_label, key);
                ctx.api.get_by_uuid::<VmRecord>(uuid).await?
            }
            None => self.clone_template(ctx, key, spec).await?,
        };

        let record: VmRecord = ctx.api.get_record(&vm_ref).await?;
        if !record.other_config.contains_key(TEMPLATE_KEY) {
            set_other_config(ctx, "VM", &vm_ref, TEMPLATE_KEY, &spec.template).await?;
        }
        if !record.other_config.contains_key(TEMPLATE_VDIS_KEY) {
            self.provision(ctx, &vm_ref).await?;
        }
        let record: VmRecord = ctx.api.get_record(&vm_ref).await?;
        if record.is_a_template {
            ctx.api
                .call("VM.set_is_a_template", vec![json!(vm_ref), json!(false)])
                .await?;
        }

        if record.name_label != spec.name_label {
            ctx.api
                .call("VM.set_name_label", vec![json!(vm_ref), json!(spec.name_label)])
                .await?;
        }
        if record.name_description != spec.name_description {
            ctx.api
                .call("VM.set_name_description", vec![json!(vm_ref), json!(spec.name_description)])
                .await?;
        }
        if PowerState::from_xapi(&record.power_state) == PowerState::Halted {
            self.set_memory(ctx, &vm_ref, spec).await?;
            self.set_vcpus(ctx, &vm_ref, record.vcpus_max, spec.vcpus).await?;
        }
        self.set_boot(ctx, &vm_ref, &record, spec).await?;

        let record: VmRecord = ctx.api.get_record(&vm_ref).await?;
        sync_other_config(ctx, "VM", &vm_ref, &record.other_config, &spec.other_config).await?;

        self.sync_disks(ctx, &vm_ref, &record, spec).await?;
        self.sync_interfaces(ctx, &vm_ref, &record, spec).await?;
        set_other_config(ctx, "VM", &vm_ref, PROVISIONED_KEY, "true").await?;

        if spec.power_state == PowerState::Running {
            let record: VmRecord = ctx.api.get_record(&vm_ref).await?;
            self.start(ctx, &vm_ref, &record).await?;
        }
        Ok(record.uuid)
    }

    async fn update(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        let spec = vm_spec(op)?;
        let vm_ref = ctx.api.get_by_uuid::<VmRecord>(&actual.uuid).await?;
        let mut record: VmRecord = ctx.api.get_record(&vm_ref).await?;
        info!("Updating VM {} ({})", spec.name_label, op.key());

        let delta = &op.delta;
        let needs_halt = delta.contains_key("vcpus")
            || delta.contains_key("cores_per_socket")
            || MEMORY_ATTRIBUTES.iter().any(|a| delta.contains_key(*a));
        let halted = PowerState::from_xapi(&record.power_state) == PowerState::Halted;

        if !halted && spec.power_state == PowerState::Halted {
            info!("Shutting down VM {}", op.key());
            self.shutdown(ctx, &vm_ref).await?;
            record = ctx.api.get_record(&vm_ref).await?;
        } else if !halted && needs_halt {
            return Err(vm_is_running_conflict(&vm_ref));
        }

        if delta.contains_key("name_label") {
            ctx.api
                .call("VM.set_name_label", vec![json!(vm_ref), json!(spec.name_label)])
                .await?;
        }
        if delta.contains_key("name_description") {
            ctx.api
                .call("VM.set_name_description", vec![json!(vm_ref), json!(spec.name_description)])
                .await?;
        }
        if MEMORY_ATTRIBUTES.iter().any(|a| delta.contains_key(*a)) {
            self.set_memory(ctx, &vm_ref, spec).await?;
        }
        if delta.contains_key("vcpus") {
            self.set_vcpus(ctx, &vm_ref, record.vcpus_max, spec.vcpus).await?;
        }
        if delta.contains_key("cores_per_socket") || delta.contains_key("boot_order") {
            self.set_boot(ctx, &vm_ref, &record, spec).await?;
        }
        if delta.contains_key("other_config") {
            sync_other_config(ctx, "VM", &vm_ref, &record.other_config, &spec.other_config).await?;
        }
        if delta.contains_key("disks") {
            self.sync_disks(ctx, &vm_ref, &record, spec).await?;
        }
        if delta.contains_key("interfaces") {
            self.sync_interfaces(ctx, &vm_ref, &record, spec).await?;
        }

        if spec.power_state == PowerState::Running {
            let record: VmRecord = ctx.api.get_record(&vm_ref).await?;
            self.start(ctx, &vm_ref, &record).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        info!("Deleting VM {}", op.key());
        let vm_ref = ctx.api.get_by_uuid::<VmRecord>(&actual.uuid).await?;
        let record: VmRecord = ctx.api.get_record(&vm_ref).await?;
        if PowerState::from_xapi(&record.power_state) != PowerState::Halted {
            self.shutdown(ctx, &vm_ref).await?;
        }

        let from_template = template_vdis(&record);
        let mut template_disks = Vec::new();
        for vif_ref in &record.vifs {
            ignore_not_found(ctx.api.call("VIF.destroy", vec![json!(vif_ref)]).await)?;
        }
        for vbd_ref in &record.vbds {
            let vbd: VbdRecord = ctx.api.get_record(vbd_ref).await?;
            if !is_null_ref(&vbd.vdi) {
                let vdi_uuid = uuid_of(ctx, "VDI", &vbd.vdi).await?;
                if from_template.contains(&vdi_uuid) {
                    template_disks.push(vbd.vdi.clone());
                }
            }
            ignore_not_found(ctx.api.call("VBD.destroy", vec![json!(vbd_ref)]).await)?;
        }
        for vdi_ref in template_disks {
            ignore_not_found(ctx.api.call("VDI.destroy", vec![json!(vdi_ref)]).await)?;
        }
        ctx.api.call("VM.destroy", vec![json!(vm_ref)]).await?;
        Ok(())
    }

    async fn import(&self, ctx: &Context, uuid: &str, key: &str) -> Result<()> {
        let vm_ref = ctx.api.get_by_uuid::<VmRecord>(uuid).await?;
        let record: VmRecord = ctx.api.get_record(&vm_ref).await?;
        if record.is_a_template || record.is_a_snapshot || record.is_control_domain {
            return Err(Error::validation(
                EntityKind::Vm,
                key,
                format!("{} is not a regular VM", uuid),
            ));
        }
        tag(ctx, EntityKind::Vm, &vm_ref, key).await?;
        set_other_config(ctx, "VM", &vm_ref, PROVISIONED_KEY, "true").await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, create_op, delete_op, desired, resume_op, update_op};
    use super::super::vdi::VdiReconciler;
    use super::*;
    use crate::api::ApiError;
    use crate::mock::{MOCK_TEMPLATE, MockCluster};

    async fn with_disk(cluster: &MockCluster, ctx: &Context) {
        let (_, sr) = cluster.find("SR", "name_label", "Local storage").unwrap();
        let disk = desired(json!({
            "key": "data", "kind": "vdi", "name_label": "data", "sr": sr["uuid"], "virtual_size": 1048576
        }));
        VdiReconciler.create(ctx, &create_op(&disk)).await.unwrap();
    }

    fn vm(extra: Value) -> crate::model::DesiredState {
        let mut value = json!({
            "key": "web", "kind": "vm", "name_label": "web", "template": MOCK_TEMPLATE,
            "vcpus": 2, "memory_static_max": 2147483648u64
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut value, extra) {
            base.extend(extra);
        }
        desired(value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_running_vm_round_trip() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        with_disk(&cluster, &ctx).await;
        let (_, eth0) = cluster.find("network", "bridge", "xenbr0").unwrap();
        let state = vm(json!({
            "cores_per_socket": 2,
            "boot_mode": "uefi",
            "disks": [{"vdi": "data"}],
            "interfaces": [{"network": eth0["uuid"], "device": 0}],
            "power_state": "running",
            "other_config": {"role": "frontend"}
        }));

        let uuid = VmReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = VmReconciler
            .observe(&ctx, "web", Some(&uuid), Some(&state.spec))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(actual.attributes, state.spec.attributes());
        assert_eq!(actual.computed["template_disks"], 1);
        assert_eq!(actual.computed["power_state"], "Running");
        assert_eq!(actual.references, vec![EntityId::new(EntityKind::Vdi, "data")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_provision_is_resumed() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let state = vm(json!({"power_state": "running"}));
        cluster.inject("Async.VM.provision", ApiError::code("INTERNAL_ERROR", &["disk full"]), 1);

        assert!(VmReconciler.create(&ctx, &create_op(&state)).await.is_err());
        let partial = VmReconciler.observe(&ctx, "web", None, Some(&state.spec)).await.unwrap().unwrap();
        assert!(partial.incomplete);
        assert_eq!(cluster.records("VDI").len(), 0);

        let uuid = VmReconciler.create(&ctx, &resume_op(&state, &partial)).await.unwrap();
        assert_eq!(uuid, partial.uuid);
        assert_eq!(cluster.call_count("Async.VM.clone"), 1);
        let (_, record) = cluster.find("VM", "uuid", &uuid).unwrap();
        assert_eq!(record["is_a_template"], false);
        assert_eq!(cluster.records("VDI").len(), 1);

        let actual = VmReconciler.observe(&ctx, "web", None, Some(&state.spec)).await.unwrap().unwrap();
        assert!(!actual.incomplete);
        assert_eq!(actual.attributes, state.spec.attributes());
        assert_eq!(actual.computed["template_disks"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_boot_leaves_created_vm() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let state = vm(json!({"power_state": "running"}));
        cluster.inject("Async.VM.start", ApiError::code("HOST_NOT_ENOUGH_FREE_MEMORY", &["2147483648", "0"]), 1);

        assert!(VmReconciler.create(&ctx, &create_op(&state)).await.is_err());
        let actual = VmReconciler.observe(&ctx, "web", None, Some(&state.spec)).await.unwrap().unwrap();
        assert!(!actual.incomplete);
        assert_eq!(actual.attributes["power_state"], "halted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_without_task_records() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let (_, eth0) = cluster.find("network", "bridge", "xenbr0").unwrap();
        let state = vm(json!({"power_state": "running", "interfaces": [{"network": eth0["uuid"], "device": 0}]}));
        cluster.set_vanishing_tasks(true);

        let uuid = VmReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = VmReconciler.observe(&ctx, "web", Some(&uuid), Some(&state.spec)).await.unwrap().unwrap();
        assert!(!actual.incomplete);
        assert_eq!(actual.attributes, state.spec.attributes());
        assert_eq!(cluster.records("VM").iter().filter(|(_, vm)| vm["name_label"] == "web").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_counts_as_created() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let template = cluster.find("VM", "name_label", MOCK_TEMPLATE).unwrap().0;
        let vm_ref = ctx
            .api
            .call_ref("VM.clone", vec![json!(template), json!("legacy")])
            .await
            .unwrap();
        ctx.api.call("VM.set_is_a_template", vec![json!(vm_ref), json!(false)]).await.unwrap();
        let legacy_uuid = uuid_of(&ctx, "VM", &vm_ref).await.unwrap();

        VmReconciler.import(&ctx, &legacy_uuid, "legacy").await.unwrap();
        let imported = VmReconciler.observe(&ctx, "legacy", None, None).await.unwrap().unwrap();
        assert!(!imported.incomplete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_template_is_not_found() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let state = vm(json!({"template": "Windows 95"}));
        let err = VmReconciler.create(&ctx, &create_op(&state)).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(cluster.call_count("Async.VM.clone"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_vcpus_lowers_startup_first() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let state = vm(json!({"vcpus": 4}));
        VmReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = VmReconciler.observe(&ctx, "web", None, Some(&state.spec)).await.unwrap().unwrap();

        let smaller = vm(json!({"vcpus": 1}));
        VmReconciler.update(&ctx, &update_op(&smaller, &actual), &actual).await.unwrap();
        let after = VmReconciler.observe(&ctx, "web", None, Some(&smaller.spec)).await.unwrap().unwrap();
        assert_eq!(after.attributes["vcpus"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_change_on_running_vm_is_conflict() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let state = vm(json!({"power_state": "running"}));
        VmReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = VmReconciler.observe(&ctx, "web", None, Some(&state.spec)).await.unwrap().unwrap();

        let bigger = vm(json!({"power_state": "running", "memory_static_max": 4294967296u64}));
        let err = VmReconciler
            .update(&ctx, &update_op(&bigger, &actual), &actual)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_change_with_halt_is_applied() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let state = vm(json!({"power_state": "running"}));
        VmReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = VmReconciler.observe(&ctx, "web", None, Some(&state.spec)).await.unwrap().unwrap();

        let halted = vm(json!({"power_state": "halted", "memory_static_max": 4294967296u64}));
        VmReconciler.update(&ctx, &update_op(&halted, &actual), &actual).await.unwrap();
        let after = VmReconciler.observe(&ctx, "web", None, Some(&halted.spec)).await.unwrap().unwrap();
        assert_eq!(after.attributes, halted.spec.attributes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_plug_disk_and_interface() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        with_disk(&cluster, &ctx).await;
        let (_, eth1) = cluster.find("network", "bridge", "xenbr1").unwrap();
        let state = vm(json!({"power_state": "running"}));
        VmReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = VmReconciler.observe(&ctx, "web", None, Some(&state.spec)).await.unwrap().unwrap();

        let more = vm(json!({
            "power_state": "running",
            "disks": [{"vdi": "data", "mode": "RO"}],
            "interfaces": [{"network": eth1["uuid"], "device": 1}]
        }));
        VmReconciler.update(&ctx, &update_op(&more, &actual), &actual).await.unwrap();
        let after = VmReconciler.observe(&ctx, "web", None, Some(&more.spec)).await.unwrap().unwrap();
        assert_eq!(after.attributes, more.spec.attributes());
        assert_eq!(cluster.call_count("VBD.plug"), 1);
        assert_eq!(cluster.call_count("VIF.plug"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_template_disks_but_not_declared_ones() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        with_disk(&cluster, &ctx).await;
        let state = vm(json!({"power_state": "running", "disks": [{"vdi": "data"}]}));
        VmReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = VmReconciler.observe(&ctx, "web", None, None).await.unwrap().unwrap();
        assert_eq!(cluster.records("VDI").len(), 2);

        VmReconciler.delete(&ctx, &delete_op(&actual), &actual).await.unwrap();
        assert!(VmReconciler.list_managed(&ctx).await.unwrap().is_empty());
        let remaining = cluster.records("VDI");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1["name_label"], "data");
    }

    #[test]
    fn test_validation() {
        assert!(vm(json!({"cores_per_socket": 3})).validate().is_err());
        assert!(vm(json!({"boot_order": "cdx"})).validate().is_err());
        assert!(vm(json!({"memory_dynamic_min": 4294967296u64})).validate().is_err());
        assert!(vm(json!({"power_state": "paused"})).validate().is_err());
        assert!(vm(json!({"interfaces": [{"network": "n", "device": 0, "mac": "nope"}]})).validate().is_err());
        assert!(vm(json!({"disks": [{"vdi": "a"}, {"vdi": "a"}]})).validate().is_err());
        assert!(vm(json!({})).validate().is_ok());
    }

    #[test]
    fn test_disks_sorted_bootable_first() {
        let state = vm(json!({"disks": [{"vdi": "a"}, {"vdi": "b", "bootable": true}]}));
        let attrs = state.spec.attributes();
        assert_eq!(attrs["disks"][0]["vdi"], "b");
    }
}
