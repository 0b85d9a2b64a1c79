//! Typed XenAPI records.
//!
//! Raw attribute maps are deserialized into these structs at the adapter
//! boundary. Integer fields are accepted as JSON numbers or as decimal strings
//! since XenAPI transports int64 either way.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// Opaque object reference (`OpaqueRef:...`).
pub type OpaqueRef = String;

pub const NULL_REF: &str = "OpaqueRef:NULL";

pub fn is_null_ref(r: &str) -> bool {
    r.is_empty() || r == NULL_REF
}

/// A XenAPI class whose records can be fetched through the adapter.
pub trait XenRecord: serde::de::DeserializeOwned + Send {
    const CLASS: &'static str;
}

/// Records that carry an `other_config` map.
pub trait Tagged {
    fn uuid(&self) -> &str;
    fn other_config(&self) -> &BTreeMap<String, String>;

    /// Snapshot copies inherit their source's `other_config`, tags included.
    fn is_snapshot_copy(&self) -> bool {
        false
    }
}

macro_rules! xen_record {
    ($ty:ty, $class:literal) => {
        impl XenRecord for $ty {
            const CLASS: &'static str = $class;
        }
    };
    ($ty:ty, $class:literal, tagged) => {
        xen_record!($ty, $class);

        impl Tagged for $ty {
            fn uuid(&self) -> &str {
                &self.uuid
            }

            fn other_config(&self) -> &BTreeMap<String, String> {
                &self.other_config
            }
        }
    };
    ($ty:ty, $class:literal, tagged, snapshots) => {
        xen_record!($ty, $class);

        impl Tagged for $ty {
            fn uuid(&self) -> &str {
                &self.uuid
            }

            fn other_config(&self) -> &BTreeMap<String, String> {
                &self.other_config
            }

            fn is_snapshot_copy(&self) -> bool {
                self.is_a_snapshot
            }
        }
    };
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub master: OpaqueRef,
    #[serde(rename = "default_SR")]
    pub default_sr: OpaqueRef,
    pub ha_enabled: bool,
    pub other_config: BTreeMap<String, String>,
}
xen_record!(PoolRecord, "pool", tagged);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostRecord {
    pub uuid: String,
    pub name_label: String,
    pub address: String,
    pub enabled: bool,
    pub metrics: OpaqueRef,
    #[serde(rename = "PIFs")]
    pub pifs: Vec<OpaqueRef>,
    #[serde(rename = "PBDs")]
    pub pbds: Vec<OpaqueRef>,
}
xen_record!(HostRecord, "host");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostMetricsRecord {
    pub uuid: String,
    pub live: bool,
}
xen_record!(HostMetricsRecord, "host_metrics");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SrRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "type")]
    pub sr_type: String,
    pub content_type: String,
    pub shared: bool,
    #[serde(deserialize_with = "lenient_i64")]
    pub physical_size: i64,
    #[serde(rename = "PBDs")]
    pub pbds: Vec<OpaqueRef>,
    #[serde(rename = "VDIs")]
    pub vdis: Vec<OpaqueRef>,
    pub other_config: BTreeMap<String, String>,
    pub sm_config: BTreeMap<String, String>,
}
xen_record!(SrRecord, "SR", tagged);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PbdRecord {
    pub uuid: String,
    pub host: OpaqueRef,
    #[serde(rename = "SR")]
    pub sr: OpaqueRef,
    pub device_config: BTreeMap<String, String>,
    pub currently_attached: bool,
}
xen_record!(PbdRecord, "PBD");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecretRecord {
    pub uuid: String,
    pub value: String,
}
xen_record!(SecretRecord, "secret");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VdiRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "SR")]
    pub sr: OpaqueRef,
    #[serde(deserialize_with = "lenient_i64")]
    pub virtual_size: i64,
    #[serde(rename = "type")]
    pub vdi_type: String,
    pub sharable: bool,
    pub read_only: bool,
    pub is_a_snapshot: bool,
    #[serde(rename = "VBDs")]
    pub vbds: Vec<OpaqueRef>,
    pub other_config: BTreeMap<String, String>,
}
xen_record!(VdiRecord, "VDI", tagged, snapshots);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VbdRecord {
    pub uuid: String,
    #[serde(rename = "VM")]
    pub vm: OpaqueRef,
    #[serde(rename = "VDI")]
    pub vdi: OpaqueRef,
    pub userdevice: String,
    pub bootable: bool,
    pub mode: String,
    #[serde(rename = "type")]
    pub vbd_type: String,
    pub empty: bool,
    pub currently_attached: bool,
}
xen_record!(VbdRecord, "VBD");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VifRecord {
    pub uuid: String,
    #[serde(rename = "VM")]
    pub vm: OpaqueRef,
    pub network: OpaqueRef,
    pub device: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    pub currently_attached: bool,
}
xen_record!(VifRecord, "VIF");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub power_state: String,
    pub is_a_template: bool,
    pub is_a_snapshot: bool,
    pub is_control_domain: bool,
    pub snapshot_of: OpaqueRef,
    pub snapshot_info: BTreeMap<String, String>,
    #[serde(rename = "VCPUs_max", deserialize_with = "lenient_i64")]
    pub vcpus_max: i64,
    #[serde(rename = "VCPUs_at_startup", deserialize_with = "lenient_i64")]
    pub vcpus_at_startup: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub memory_static_min: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub memory_static_max: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub memory_dynamic_min: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub memory_dynamic_max: i64,
    pub platform: BTreeMap<String, String>,
    #[serde(rename = "HVM_boot_params")]
    pub hvm_boot_params: BTreeMap<String, String>,
    pub other_config: BTreeMap<String, String>,
    #[serde(rename = "VBDs")]
    pub vbds: Vec<OpaqueRef>,
    #[serde(rename = "VIFs")]
    pub vifs: Vec<OpaqueRef>,
}
xen_record!(VmRecord, "VM", tagged);

impl VmRecord {
    pub fn is_running(&self) -> bool {
        self.power_state.eq_ignore_ascii_case("running")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "MTU", deserialize_with = "lenient_i64")]
    pub mtu: i64,
    pub bridge: String,
    #[serde(rename = "PIFs")]
    pub pifs: Vec<OpaqueRef>,
    #[serde(rename = "VIFs")]
    pub vifs: Vec<OpaqueRef>,
    pub other_config: BTreeMap<String, String>,
}
xen_record!(NetworkRecord, "network", tagged);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PifRecord {
    pub uuid: String,
    pub device: String,
    pub host: OpaqueRef,
    pub network: OpaqueRef,
    #[serde(rename = "VLAN", deserialize_with = "lenient_i64")]
    pub vlan: i64,
    pub management: bool,
    #[serde(rename = "VLAN_master_of")]
    pub vlan_master_of: OpaqueRef,
    pub ip_configuration_mode: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    #[serde(rename = "DNS")]
    pub dns: String,
    pub disallow_unplug: bool,
    pub metrics: OpaqueRef,
    pub other_config: BTreeMap<String, String>,
}
xen_record!(PifRecord, "PIF", tagged);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PifMetricsRecord {
    pub uuid: String,
    pub carrier: bool,
}
xen_record!(PifMetricsRecord, "PIF_metrics");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VlanRecord {
    pub uuid: String,
    #[serde(rename = "tagged_PIF")]
    pub tagged_pif: OpaqueRef,
    #[serde(rename = "untagged_PIF")]
    pub untagged_pif: OpaqueRef,
    #[serde(deserialize_with = "lenient_i64")]
    pub tag: i64,
}
xen_record!(VlanRecord, "VLAN");

/// Remote task status as reported by `task.get_record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskRecord {
    pub uuid: String,
    pub name_label: String,
    pub status: TaskStatus,
    #[serde(deserialize_with = "lenient_f64")]
    pub progress: f64,
    pub result: String,
    pub error_info: Vec<String>,
}
xen_record!(TaskRecord, "task");

/// Extract the object reference from a task result (`<value>OpaqueRef:...</value>`).
pub fn parse_task_result(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix("<value>")
        .and_then(|s| s.strip_suffix("</value>"))
        .unwrap_or(trimmed)
        .trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Int(i64),
    Float(f64),
    Text(String),
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Int(v) => Ok(v),
        NumberOrString::Float(v) => Ok(v as i64),
        NumberOrString::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Int(v) => Ok(v as f64),
        NumberOrString::Float(v) => Ok(v),
        NumberOrString::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vm_record_accepts_string_integers() {
        let vm: VmRecord = serde_json::from_value(json!({
            "uuid": "u1",
            "name_label": "vm1",
            "power_state": "Running",
            "VCPUs_max": "4",
            "VCPUs_at_startup": 2,
            "memory_static_max": "2147483648",
            "platform": {"cores-per-socket": "2"}
        }))
        .unwrap();

        assert_eq!(vm.vcpus_max, 4);
        assert_eq!(vm.vcpus_at_startup, 2);
        assert_eq!(vm.memory_static_max, 2_147_483_648);
        assert!(vm.is_running());
        assert!(vm.vbds.is_empty());
    }

    #[test]
    fn test_malformed_record_is_rejected() {
        let result: Result<VmRecord, _> = serde_json::from_value(json!({
            "VCPUs_max": "many"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_task_record_status() {
        let task: TaskRecord = serde_json::from_value(json!({
            "status": "failure",
            "progress": "1.0",
            "error_info": ["VDI_IN_USE", "OpaqueRef:abc"]
        }))
        .unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.error_info.len(), 2);
    }

    #[test]
    fn test_parse_task_result() {
        assert_eq!(
            parse_task_result("<value>OpaqueRef:1234</value>"),
            Some("OpaqueRef:1234".to_string())
        );
        assert_eq!(parse_task_result("OpaqueRef:5"), Some("OpaqueRef:5".to_string()));
        assert_eq!(parse_task_result("  "), None);
    }

    #[test]
    fn test_null_ref() {
        assert!(is_null_ref(NULL_REF));
        assert!(is_null_ref(""));
        assert!(!is_null_ref("OpaqueRef:1"));
    }
}
