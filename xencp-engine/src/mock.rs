//! In-memory XenAPI simulator for testing and development.
//!
//! Simulates a pool with one coordinator plus any number of standalone hosts
//! that can be joined. Objects are stored as XenAPI-shaped JSON records so the
//! typed adapter is exercised end to end. Supports fault injection:
//! - injected errors or results per method
//! - task latency (number of polls a task stays pending)
//! - vanishing task objects
//! - session expiry
//! - out-of-band pool membership changes

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::api::{ApiClient, ApiError, Connector, NULL_REF, XenApi};
use crate::backoff::BackoffPolicy;
use crate::config::EngineConfig;
use crate::session::{Credentials, SessionManager};

pub const MOCK_USERNAME: &str = "root";
pub const MOCK_PASSWORD: &str = "password";
pub const MOCK_COORDINATOR: &str = "10.0.0.1";
pub const MOCK_TEMPLATE: &str = "Debian Bookworm 12";
/// Size of the disk a template provisions.
pub const MOCK_TEMPLATE_DISK_SIZE: i64 = 10 * 1024 * 1024 * 1024;

type ApiResult = Result<Value, ApiError>;

enum FaultEffect {
    Error(ApiError),
    Result(Value),
}

struct Fault {
    method: String,
    effect: FaultEffect,
    remaining: u32,
}

struct PendingTask {
    polls_remaining: u32,
    status: &'static str,
    result: String,
    error_info: Vec<String>,
}

enum Role {
    Coordinator,
    Member,
    Standalone,
    Unknown,
}

struct SimState {
    objects: BTreeMap<String, BTreeMap<String, Value>>,
    sessions: HashSet<String>,
    coordinator_address: String,
    /// Hosts not in the pool, by address.
    standalone: BTreeMap<String, Value>,
    faults: Vec<Fault>,
    task_latency: u32,
    vanishing_tasks: bool,
    tasks: HashMap<String, PendingTask>,
    calls: Vec<String>,
    logins: usize,
}

fn new_ref() -> String {
    format!("OpaqueRef:{}", Uuid::new_v4())
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

fn err(code: &str, params: &[&str]) -> ApiError {
    ApiError::code(code, params)
}

fn str_of(record: &Value, field: &str) -> String {
    match record.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn bool_of(record: &Value, field: &str) -> bool {
    record.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn i64_of(record: &Value, field: &str) -> i64 {
    match record.get(field) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn refs_of(record: &Value, field: &str) -> Vec<String> {
    record
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn arg(args: &[Value], index: usize) -> Result<&Value, ApiError> {
    args.get(index)
        .ok_or_else(|| err("MESSAGE_PARAMETER_COUNT_MISMATCH", &[&index.to_string()]))
}

fn arg_str(args: &[Value], index: usize) -> Result<String, ApiError> {
    match arg(args, index)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(err("FIELD_TYPE_ERROR", &[&other.to_string()])),
    }
}

fn arg_i64(args: &[Value], index: usize) -> Result<i64, ApiError> {
    match arg(args, index)? {
        Value::Number(n) => n.as_i64().ok_or_else(|| err("FIELD_TYPE_ERROR", &[&n.to_string()])),
        Value::String(s) => s.parse().map_err(|_| err("FIELD_TYPE_ERROR", &[s])),
        other => Err(err("FIELD_TYPE_ERROR", &[&other.to_string()])),
    }
}

fn arg_object(args: &[Value], index: usize) -> Result<Map<String, Value>, ApiError> {
    match arg(args, index)? {
        Value::Object(map) => Ok(map.clone()),
        other => Err(err("FIELD_TYPE_ERROR", &[&other.to_string()])),
    }
}

/// Fill missing fields of a record with defaults.
fn with_defaults(mut record: Map<String, Value>, defaults: Value) -> Value {
    if let Value::Object(defaults) = defaults {
        for (k, v) in defaults {
            record.entry(k).or_insert(v);
        }
    }
    record.entry("uuid").or_insert_with(|| json!(new_uuid()));
    Value::Object(record)
}

impl SimState {
    fn table(&self, class: &str) -> impl Iterator<Item = (&String, &Value)> {
        self.objects.get(class).into_iter().flat_map(|t| t.iter())
    }

    fn get(&self, class: &str, r: &str) -> Result<&Value, ApiError> {
        self.objects
            .get(class)
            .and_then(|t| t.get(r))
            .ok_or_else(|| err("HANDLE_INVALID", &[class, r]))
    }

    fn get_mut(&mut self, class: &str, r: &str) -> Result<&mut Value, ApiError> {
        self.objects
            .get_mut(class)
            .and_then(|t| t.get_mut(r))
            .ok_or_else(|| err("HANDLE_INVALID", &[class, r]))
    }

    fn insert(&mut self, class: &str, record: Value) -> String {
        let r = new_ref();
        self.objects
            .entry(class.to_string())
            .or_default()
            .insert(r.clone(), record);
        r
    }

    /// PIF with its metrics and no IP configuration.
    fn insert_pif(&mut self, fields: Value) -> String {
        let metrics = self.insert("PIF_metrics", json!({"uuid": new_uuid(), "carrier": true}));
        let record = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let record = with_defaults(
            record,
            json!({"metrics": metrics, "other_config": {}, "ip_configuration_mode": "None",
                   "IP": "", "netmask": "", "gateway": "", "DNS": "", "disallow_unplug": false}),
        );
        self.insert("PIF", record)
    }

    fn remove_pif(&mut self, pif: &str) {
        if let Some(pif_record) = self.remove("PIF", pif) {
            self.pull_ref("network", &str_of(&pif_record, "network"), "PIFs", pif);
            self.pull_ref("host", &str_of(&pif_record, "host"), "PIFs", pif);
            self.remove("PIF_metrics", &str_of(&pif_record, "metrics"));
        }
    }

    fn remove(&mut self, class: &str, r: &str) -> Option<Value> {
        self.objects.get_mut(class).and_then(|t| t.remove(r))
    }

    fn set(&mut self, class: &str, r: &str, field: &str, value: Value) -> Result<(), ApiError> {
        match self.get_mut(class, r)? {
            Value::Object(map) => {
                map.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(err("INTERNAL_ERROR", &["record is not an object"])),
        }
    }

    fn push_ref(&mut self, class: &str, r: &str, field: &str, item: &str) {
        if let Ok(Value::Object(map)) = self.get_mut(class, r) {
            let list = map.entry(field.to_string()).or_insert_with(|| json!([]));
            if let Value::Array(items) = list {
                items.push(json!(item));
            }
        }
    }

    fn pull_ref(&mut self, class: &str, r: &str, field: &str, item: &str) {
        if let Ok(Value::Object(map)) = self.get_mut(class, r)
            && let Some(Value::Array(items)) = map.get_mut(field)
        {
            items.retain(|v| v.as_str() != Some(item));
        }
    }

    fn find_by(&self, class: &str, field: &str, value: &str) -> Option<String> {
        self.table(class)
            .find(|(_, rec)| str_of(rec, field) == value)
            .map(|(r, _)| r.clone())
    }

    fn pool_ref(&self) -> Result<String, ApiError> {
        self.table("pool")
            .next()
            .map(|(r, _)| r.clone())
            .ok_or_else(|| err("INTERNAL_ERROR", &["no pool"]))
    }

    fn master_ref(&self) -> Result<String, ApiError> {
        let pool = self.get("pool", &self.pool_ref()?)?;
        Ok(str_of(pool, "master"))
    }

    fn role(&self, address: &str) -> Role {
        if address == self.coordinator_address {
            Role::Coordinator
        } else if self.standalone.contains_key(address) {
            Role::Standalone
        } else if self.find_by("host", "address", address).is_some() {
            Role::Member
        } else {
            Role::Unknown
        }
    }

    fn take_fault(&mut self, method: &str) -> Option<ApiResult> {
        let index = self
            .faults
            .iter()
            .position(|f| f.method == method && f.remaining > 0)?;
        let fault = &mut self.faults[index];
        fault.remaining -= 1;
        let outcome = match &fault.effect {
            FaultEffect::Error(e) => Err(e.clone()),
            FaultEffect::Result(v) => Ok(v.clone()),
        };
        if fault.remaining == 0 {
            self.faults.remove(index);
        }
        Some(outcome)
    }

    fn login(&mut self, args: &[Value]) -> ApiResult {
        let user = arg_str(args, 0)?;
        let pass = arg_str(args, 1)?;
        if user != MOCK_USERNAME || pass != MOCK_PASSWORD {
            return Err(err(
                "SESSION_AUTHENTICATION_FAILED",
                &[&user, "Authentication failure"],
            ));
        }
        let token = new_ref();
        self.sessions.insert(token.clone());
        self.logins += 1;
        Ok(json!(token))
    }

    fn dispatch(&mut self, address: &str, method: &str, params: Vec<Value>) -> ApiResult {
        let role = self.role(address);
        if matches!(role, Role::Unknown) {
            return Err(ApiError::transport(format!("connection refused: {}", address)));
        }
        if matches!(role, Role::Member) {
            return Err(err("HOST_IS_SLAVE", &[&self.coordinator_address.clone()]));
        }

        if method == "session.login_with_password" {
            return self.login(&params);
        }

        let (session, args) = match params.split_first() {
            Some((Value::String(session), rest)) => (session.clone(), rest.to_vec()),
            _ => return Err(err("SESSION_INVALID", &[""])),
        };
        if !self.sessions.contains(&session) {
            return Err(err("SESSION_INVALID", &[&session]));
        }
        if method == "session.logout" {
            self.sessions.remove(&session);
            return Ok(Value::Null);
        }

        match role {
            Role::Standalone => self.standalone_call(address, method, &args),
            _ => match method.strip_prefix("Async.") {
                Some(inner) => self.submit_task(inner, &args),
                None => self.call(method, &args),
            },
        }
    }

    // ===== Tasks =====

    fn submit_task(&mut self, method: &str, args: &[Value]) -> ApiResult {
        let outcome = self.call(method, args);
        let task_ref = new_ref();
        if self.vanishing_tasks {
            return Ok(json!(task_ref));
        }

        let (status, result, error_info) = match outcome {
            Ok(Value::String(s)) => ("success", format!("<value>{}</value>", s), vec![]),
            Ok(Value::Null) => ("success", String::new(), vec![]),
            Ok(other) => ("success", format!("<value>{}</value>", other), vec![]),
            Err(ApiError::Remote { code, params }) => {
                let mut info = vec![code];
                info.extend(params);
                ("failure", String::new(), info)
            }
            Err(e) => ("failure", String::new(), vec!["INTERNAL_ERROR".into(), e.to_string()]),
        };

        self.objects.entry("task".into()).or_default().insert(
            task_ref.clone(),
            json!({
                "uuid": new_uuid(),
                "name_label": method,
                "status": "pending",
                "progress": 0.0,
                "result": "",
                "error_info": [],
            }),
        );
        self.tasks.insert(
            task_ref.clone(),
            PendingTask {
                polls_remaining: self.task_latency,
                status,
                result,
                error_info,
            },
        );
        Ok(json!(task_ref))
    }

    fn poll_task(&mut self, task_ref: &str) -> ApiResult {
        self.get("task", task_ref)?;
        let Some(pending) = self.tasks.get_mut(task_ref) else {
            return Ok(self.get("task", task_ref)?.clone());
        };
        if pending.polls_remaining > 0 {
            pending.polls_remaining -= 1;
            let progress = if pending.polls_remaining == 0 { 0.9 } else { 0.0 };
            self.set("task", task_ref, "progress", json!(progress))?;
        } else {
            let (status, result, info) = (
                pending.status,
                pending.result.clone(),
                pending.error_info.clone(),
            );
            self.set("task", task_ref, "status", json!(status))?;
            self.set("task", task_ref, "progress", json!(1.0))?;
            self.set("task", task_ref, "result", json!(result))?;
            self.set("task", task_ref, "error_info", json!(info))?;
        }
        Ok(self.get("task", task_ref)?.clone())
    }

    // ===== Coordinator methods =====

    fn call(&mut self, method: &str, args: &[Value]) -> ApiResult {
        match method {
            "task.get_record" => self.poll_task(&arg_str(args, 0)?),
            "task.destroy" => {
                let task_ref = arg_str(args, 0)?;
                self.get("task", &task_ref)?;
                self.remove("task", &task_ref);
                self.tasks.remove(&task_ref);
                Ok(Value::Null)
            }
            "task.cancel" => {
                let task_ref = arg_str(args, 0)?;
                self.set("task", &task_ref, "status", json!("cancelled"))?;
                self.tasks.remove(&task_ref);
                Ok(Value::Null)
            }
            "pool.eject" => self.pool_eject(&arg_str(args, 0)?),
            "pool.enable_ha" => {
                let pool = self.pool_ref()?;
                if bool_of(self.get("pool", &pool)?, "ha_enabled") {
                    return Err(err("HA_IS_ENABLED", &[]));
                }
                self.set("pool", &pool, "ha_enabled", json!(true))?;
                Ok(Value::Null)
            }
            "pool.disable_ha" => {
                let pool = self.pool_ref()?;
                if !bool_of(self.get("pool", &pool)?, "ha_enabled") {
                    return Err(err("HA_NOT_ENABLED", &[]));
                }
                self.set("pool", &pool, "ha_enabled", json!(false))?;
                Ok(Value::Null)
            }
            "pool.management_reconfigure" => self.management_reconfigure(&arg_str(args, 0)?),
            "pool.create_VLAN_from_PIF" => {
                self.create_vlan(&arg_str(args, 0)?, &arg_str(args, 1)?, arg_i64(args, 2)?)
            }
            "VLAN.destroy" => self.destroy_vlan(&arg_str(args, 0)?),
            "network.create" => {
                let record = with_defaults(
                    arg_object(args, 0)?,
                    json!({"name_label": "", "name_description": "", "MTU": "1500",
                           "bridge": format!("xapi{}", self.table("network").count()),
                           "PIFs": [], "VIFs": [], "other_config": {}}),
                );
                Ok(json!(self.insert("network", record)))
            }
            "network.destroy" => {
                let r = arg_str(args, 0)?;
                let network = self.get("network", &r)?;
                if !refs_of(network, "VIFs").is_empty() {
                    return Err(err("NETWORK_CONTAINS_VIF", &[&r]));
                }
                if !refs_of(network, "PIFs").is_empty() {
                    return Err(err("NETWORK_CONTAINS_PIF", &[&r]));
                }
                self.remove("network", &r);
                Ok(Value::Null)
            }
            "SR.create" => self.sr_create(args),
            "SR.forget" => {
                let r = arg_str(args, 0)?;
                let sr = self.get("SR", &r)?.clone();
                for pbd in refs_of(&sr, "PBDs") {
                    if bool_of(self.get("PBD", &pbd)?, "currently_attached") {
                        return Err(err("SR_HAS_PBD", &[&r]));
                    }
                }
                for pbd in refs_of(&sr, "PBDs") {
                    if let Some(record) = self.remove("PBD", &pbd) {
                        self.pull_ref("host", &str_of(&record, "host"), "PBDs", &pbd);
                    }
                }
                for vdi in refs_of(&sr, "VDIs") {
                    self.remove("VDI", &vdi);
                }
                self.remove("SR", &r);
                Ok(Value::Null)
            }
            "PBD.plug" => {
                let r = arg_str(args, 0)?;
                self.set("PBD", &r, "currently_attached", json!(true))?;
                Ok(Value::Null)
            }
            "PBD.unplug" => {
                let r = arg_str(args, 0)?;
                let sr = str_of(self.get("PBD", &r)?, "SR");
                for vdi in refs_of(self.get("SR", &sr)?, "VDIs") {
                    if !refs_of(self.get("VDI", &vdi)?, "VBDs").is_empty() {
                        return Err(err("VDI_IN_USE", &[&vdi, "PBD.unplug"]));
                    }
                }
                self.set("PBD", &r, "currently_attached", json!(false))?;
                Ok(Value::Null)
            }
            "secret.create" => {
                let record = with_defaults(arg_object(args, 0)?, json!({"value": "", "other_config": {}}));
                Ok(json!(self.insert("secret", record)))
            }
            "VDI.create" => {
                let record = arg_object(args, 0)?;
                let sr = record.get("SR").and_then(Value::as_str).unwrap_or_default().to_string();
                self.get("SR", &sr)?;
                let record = with_defaults(
                    record,
                    json!({"name_label": "", "name_description": "", "virtual_size": "0",
                           "type": "user", "sharable": false, "read_only": false,
                           "is_a_snapshot": false, "VBDs": [], "other_config": {}}),
                );
                let r = self.insert("VDI", record);
                self.push_ref("SR", &sr, "VDIs", &r);
                Ok(json!(r))
            }
            "VDI.destroy" => {
                let r = arg_str(args, 0)?;
                let vdi = self.get("VDI", &r)?;
                if !refs_of(vdi, "VBDs").is_empty() {
                    return Err(err("VDI_IN_USE", &[&r, "destroy"]));
                }
                let sr = str_of(vdi, "SR");
                self.remove("VDI", &r);
                self.pull_ref("SR", &sr, "VDIs", &r);
                Ok(Value::Null)
            }
            "VM.clone" | "VM.copy" => self.vm_clone(&arg_str(args, 0)?, &arg_str(args, 1)?, false, false),
            "VM.snapshot" => self.vm_clone(&arg_str(args, 0)?, &arg_str(args, 1)?, true, false),
            "VM.checkpoint" => self.vm_clone(&arg_str(args, 0)?, &arg_str(args, 1)?, true, true),
            "VM.provision" => self.vm_provision(&arg_str(args, 0)?),
            "VM.revert" => self.vm_revert(&arg_str(args, 0)?),
            "PIF.reconfigure_ip" => self.pif_reconfigure_ip(args),
            "VM.start" => self.vm_start(&arg_str(args, 0)?),
            "VM.resume" => {
                let r = arg_str(args, 0)?;
                let state = str_of(self.get("VM", &r)?, "power_state");
                if state != "Suspended" {
                    return Err(err("VM_BAD_POWER_STATE", &[&r, "suspended", &state.to_lowercase()]));
                }
                self.set("VM", &r, "power_state", json!("Halted"))?;
                self.vm_start(&r)
            }
            "VM.hard_shutdown" | "VM.clean_shutdown" => self.vm_shutdown(&arg_str(args, 0)?),
            "VM.destroy" => self.vm_destroy(&arg_str(args, 0)?),
            "VM.set_memory_limits" => {
                let r = arg_str(args, 0)?;
                self.require_halted(&r)?;
                let values = [
                    arg_i64(args, 1)?,
                    arg_i64(args, 2)?,
                    arg_i64(args, 3)?,
                    arg_i64(args, 4)?,
                ];
                let [static_min, static_max, dynamic_min, dynamic_max] = values;
                if !(static_min <= dynamic_min && dynamic_min <= dynamic_max && dynamic_max <= static_max) {
                    return Err(err("MEMORY_CONSTRAINT_VIOLATION", &["static_min <= dynamic_min <= dynamic_max <= static_max"]));
                }
                for (field, value) in [
                    ("memory_static_min", static_min),
                    ("memory_static_max", static_max),
                    ("memory_dynamic_min", dynamic_min),
                    ("memory_dynamic_max", dynamic_max),
                ] {
                    self.set("VM", &r, field, json!(value.to_string()))?;
                }
                Ok(Value::Null)
            }
            "VM.set_VCPUs_max" => {
                let r = arg_str(args, 0)?;
                self.require_halted(&r)?;
                let n = arg_i64(args, 1)?;
                if n < i64_of(self.get("VM", &r)?, "VCPUs_at_startup") {
                    return Err(err("INVALID_VALUE", &["VCPUs_max", &n.to_string()]));
                }
                self.set("VM", &r, "VCPUs_max", json!(n.to_string()))?;
                Ok(Value::Null)
            }
            "VM.set_VCPUs_at_startup" => {
                let r = arg_str(args, 0)?;
                self.require_halted(&r)?;
                let n = arg_i64(args, 1)?;
                if n < 1 || n > i64_of(self.get("VM", &r)?, "VCPUs_max") {
                    return Err(err("INVALID_VALUE", &["VCPUs_at_startup", &n.to_string()]));
                }
                self.set("VM", &r, "VCPUs_at_startup", json!(n.to_string()))?;
                Ok(Value::Null)
            }
            "VBD.create" => {
                let record = arg_object(args, 0)?;
                let vm = record.get("VM").and_then(Value::as_str).unwrap_or_default().to_string();
                let vdi = record.get("VDI").and_then(Value::as_str).unwrap_or(NULL_REF).to_string();
                self.get("VM", &vm)?;
                if vdi != NULL_REF {
                    self.get("VDI", &vdi)?;
                }
                let record = with_defaults(
                    record,
                    json!({"userdevice": "0", "bootable": false, "mode": "RW", "type": "Disk",
                           "empty": false, "currently_attached": false}),
                );
                let r = self.insert("VBD", record);
                self.push_ref("VM", &vm, "VBDs", &r);
                if vdi != NULL_REF {
                    self.push_ref("VDI", &vdi, "VBDs", &r);
                }
                Ok(json!(r))
            }
            "VBD.plug" | "VIF.plug" => {
                let class = &method[..3];
                let r = arg_str(args, 0)?;
                let vm = str_of(self.get(class, &r)?, "VM");
                if str_of(self.get("VM", &vm)?, "power_state") != "Running" {
                    return Err(err("VM_BAD_POWER_STATE", &[&vm, "running", "halted"]));
                }
                self.set(class, &r, "currently_attached", json!(true))?;
                Ok(Value::Null)
            }
            "VBD.unplug" | "VIF.unplug" => {
                let class = &method[..3];
                let r = arg_str(args, 0)?;
                if !bool_of(self.get(class, &r)?, "currently_attached") {
                    return Err(err("DEVICE_ALREADY_DETACHED", &[&r]));
                }
                self.set(class, &r, "currently_attached", json!(false))?;
                Ok(Value::Null)
            }
            "VBD.destroy" => {
                let r = arg_str(args, 0)?;
                let vbd = self.get("VBD", &r)?.clone();
                if bool_of(&vbd, "currently_attached") {
                    return Err(err("DEVICE_ALREADY_ATTACHED", &[&r]));
                }
                self.remove_vbd(&r, &vbd);
                Ok(Value::Null)
            }
            "VIF.create" => {
                let record = arg_object(args, 0)?;
                let vm = record.get("VM").and_then(Value::as_str).unwrap_or_default().to_string();
                let network = record.get("network").and_then(Value::as_str).unwrap_or_default().to_string();
                self.get("VM", &vm)?;
                self.get("network", &network)?;
                let record = with_defaults(
                    record,
                    json!({"device": "0", "MAC": "", "MTU": "1500", "currently_attached": false}),
                );
                let r = self.insert("VIF", record);
                if str_of(self.get("VIF", &r)?, "MAC").is_empty() {
                    let bytes = Uuid::new_v4().into_bytes();
                    let mac = format!(
                        "c2:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
                    );
                    self.set("VIF", &r, "MAC", json!(mac))?;
                }
                self.push_ref("VM", &vm, "VIFs", &r);
                self.push_ref("network", &network, "VIFs", &r);
                Ok(json!(r))
            }
            "VIF.destroy" => {
                let r = arg_str(args, 0)?;
                let vif = self.get("VIF", &r)?.clone();
                self.remove_vif(&r, &vif);
                Ok(Value::Null)
            }
            _ => self.generic(method, args),
        }
    }

    fn generic(&mut self, method: &str, args: &[Value]) -> ApiResult {
        let Some((class, name)) = method.split_once('.') else {
            return Err(err("MESSAGE_METHOD_UNKNOWN", &[method]));
        };

        match name {
            "get_all" => Ok(json!(self.table(class).map(|(r, _)| r.clone()).collect::<Vec<_>>())),
            "get_all_records" => Ok(Value::Object(
                self.table(class)
                    .map(|(r, rec)| (r.clone(), rec.clone()))
                    .collect(),
            )),
            "get_record" => Ok(self.get(class, &arg_str(args, 0)?)?.clone()),
            "get_by_uuid" => {
                let uuid = arg_str(args, 0)?;
                self.find_by(class, "uuid", &uuid)
                    .map(|r| json!(r))
                    .ok_or_else(|| err("UUID_INVALID", &[class, &uuid]))
            }
            "get_by_name_label" => {
                let name = arg_str(args, 0)?;
                Ok(json!(
                    self.table(class)
                        .filter(|(_, rec)| str_of(rec, "name_label") == name)
                        .map(|(r, _)| r.clone())
                        .collect::<Vec<_>>()
                ))
            }
            "destroy" => {
                let r = arg_str(args, 0)?;
                self.get(class, &r)?;
                self.remove(class, &r);
                Ok(Value::Null)
            }
            _ => {
                if let Some(field) = name.strip_prefix("get_") {
                    let record = self.get(class, &arg_str(args, 0)?)?;
                    return record
                        .get(field)
                        .cloned()
                        .ok_or_else(|| err("MESSAGE_METHOD_UNKNOWN", &[method]));
                }
                if let Some(field) = name.strip_prefix("set_") {
                    let r = arg_str(args, 0)?;
                    let value = arg(args, 1)?.clone();
                    self.set(class, &r, field, value)?;
                    return Ok(Value::Null);
                }
                if let Some(field) = name.strip_prefix("add_to_") {
                    let r = arg_str(args, 0)?;
                    let key = arg_str(args, 1)?;
                    let value = arg(args, 2)?.clone();
                    if let Value::Object(map) = self.get_mut(class, &r)? {
                        let entry = map.entry(field.to_string()).or_insert_with(|| json!({}));
                        if let Value::Object(inner) = entry {
                            if inner.contains_key(&key) {
                                return Err(err("MAP_DUPLICATE_KEY", &[class, field, &r, &key]));
                            }
                            inner.insert(key, value);
                        }
                    }
                    return Ok(Value::Null);
                }
                if let Some(field) = name.strip_prefix("remove_from_") {
                    let r = arg_str(args, 0)?;
                    let key = arg_str(args, 1)?;
                    if let Value::Object(map) = self.get_mut(class, &r)?
                        && let Some(Value::Object(inner)) = map.get_mut(field)
                    {
                        inner.remove(&key);
                    }
                    return Ok(Value::Null);
                }
                Err(err("MESSAGE_METHOD_UNKNOWN", &[method]))
            }
        }
    }

    // ===== Pool topology =====

    fn join_host(&mut self, address: &str) -> Result<(), ApiError> {
        let standalone = self
            .standalone
            .remove(address)
            .ok_or_else(|| ApiError::transport(format!("connection refused: {}", address)))?;

        let metrics = self.insert("host_metrics", json!({"uuid": new_uuid(), "live": true}));
        let host_record = json!({
            "uuid": str_of(&standalone, "uuid"),
            "name_label": str_of(&standalone, "name_label"),
            "address": address,
            "enabled": true,
            "metrics": metrics,
            "PIFs": [],
            "PBDs": [],
        });
        let host = self.insert("host", host_record);

        // Mirror every physical PIF of the coordinator.
        let master = self.master_ref()?;
        let physical: Vec<(String, String, bool)> = self
            .table("PIF")
            .filter(|(_, pif)| str_of(pif, "host") == master && i64_of(pif, "VLAN") == -1)
            .map(|(_, pif)| (str_of(pif, "device"), str_of(pif, "network"), bool_of(pif, "management")))
            .collect();
        for (device, network, management) in physical {
            let pif = self.insert_pif(json!({"device": device, "host": host, "network": network,
                                             "VLAN": "-1", "management": management, "VLAN_master_of": NULL_REF}));
            self.push_ref("host", &host, "PIFs", &pif);
            self.push_ref("network", &network, "PIFs", &pif);
        }

        // Shared SRs are plugged on every member.
        let shared: Vec<(String, Value)> = self
            .table("SR")
            .filter(|(_, sr)| bool_of(sr, "shared"))
            .filter_map(|(r, sr)| {
                let pbd = refs_of(sr, "PBDs").into_iter().next()?;
                Some((r.clone(), pbd))
            })
            .filter_map(|(sr, pbd)| {
                let config = self.get("PBD", &pbd).ok()?.get("device_config")?.clone();
                Some((sr, config))
            })
            .collect();
        for (sr, device_config) in shared {
            let pbd = self.insert(
                "PBD",
                json!({"uuid": new_uuid(), "host": host, "SR": sr,
                       "device_config": device_config, "currently_attached": true}),
            );
            self.push_ref("SR", &sr, "PBDs", &pbd);
            self.push_ref("host", &host, "PBDs", &pbd);
        }
        Ok(())
    }

    fn pool_eject(&mut self, host: &str) -> ApiResult {
        let record = self.get("host", host)?.clone();
        if host == self.master_ref()? {
            return Err(err("HOST_IS_MASTER", &[host]));
        }
        for pif in refs_of(&record, "PIFs") {
            self.remove_pif(&pif);
        }
        for pbd in refs_of(&record, "PBDs") {
            if let Some(pbd_record) = self.remove("PBD", &pbd) {
                self.pull_ref("SR", &str_of(&pbd_record, "SR"), "PBDs", &pbd);
            }
        }
        self.remove("host_metrics", &str_of(&record, "metrics"));
        self.remove("host", host);
        let address = str_of(&record, "address");
        self.standalone.insert(
            address.clone(),
            json!({"uuid": str_of(&record, "uuid"), "name_label": str_of(&record, "name_label"), "address": address}),
        );
        Ok(Value::Null)
    }

    fn management_reconfigure(&mut self, network: &str) -> ApiResult {
        self.get("network", network)?;
        let hosts: Vec<String> = self.table("host").map(|(r, _)| r.clone()).collect();
        for host in hosts {
            let pifs: Vec<(String, bool)> = self
                .table("PIF")
                .filter(|(_, pif)| str_of(pif, "host") == host)
                .map(|(r, pif)| (r.clone(), str_of(pif, "network") == network))
                .collect();
            if !pifs.iter().any(|(_, on_network)| *on_network) {
                return Err(err("PIF_NOT_PRESENT", &[&host, network]));
            }
            for (pif, on_network) in pifs {
                self.set("PIF", &pif, "management", json!(on_network))?;
            }
        }
        Ok(Value::Null)
    }

    fn create_vlan(&mut self, pif: &str, network: &str, tag: i64) -> ApiResult {
        let device = str_of(self.get("PIF", pif)?, "device");
        let requested_host = str_of(self.get("PIF", pif)?, "host");
        self.get("network", network)?;

        if self
            .table("PIF")
            .any(|(_, p)| str_of(p, "device") == device && i64_of(p, "VLAN") == tag)
        {
            return Err(err("PIF_VLAN_EXISTS", &[pif]));
        }

        let bases: Vec<(String, String)> = self
            .table("PIF")
            .filter(|(_, p)| str_of(p, "device") == device && i64_of(p, "VLAN") == -1)
            .map(|(r, p)| (r.clone(), str_of(p, "host")))
            .collect();

        let mut result = Value::Null;
        for (base, host) in bases {
            let vlan = self.insert(
                "VLAN",
                json!({"uuid": new_uuid(), "tagged_PIF": base, "untagged_PIF": NULL_REF, "tag": tag.to_string()}),
            );
            let new_pif = self.insert_pif(json!({"device": device, "host": host, "network": network,
                                                 "VLAN": tag.to_string(), "management": false, "VLAN_master_of": vlan}));
            self.set("VLAN", &vlan, "untagged_PIF", json!(new_pif))?;
            self.push_ref("network", network, "PIFs", &new_pif);
            self.push_ref("host", &host, "PIFs", &new_pif);
            if host == requested_host {
                result = json!(new_pif);
            }
        }
        Ok(result)
    }

    /// DHCP leases an address from 192.168.100.0/24 right away.
    fn pif_reconfigure_ip(&mut self, args: &[Value]) -> ApiResult {
        let pif = arg_str(args, 0)?;
        let mode = arg_str(args, 1)?;
        self.get("PIF", &pif)?;
        let (ip, netmask, gateway, dns) = match mode.as_str() {
            "Static" => (arg_str(args, 2)?, arg_str(args, 3)?, arg_str(args, 4)?, arg_str(args, 5)?),
            "DHCP" => {
                let leased = self
                    .table("PIF")
                    .filter(|(_, p)| str_of(p, "ip_configuration_mode") == "DHCP")
                    .count();
                (
                    format!("192.168.100.{}", 10 + leased),
                    "255.255.255.0".to_string(),
                    "192.168.100.1".to_string(),
                    String::new(),
                )
            }
            "None" => Default::default(),
            other => return Err(err("INVALID_VALUE", &["mode", other])),
        };
        if mode == "Static" && (ip.is_empty() || netmask.is_empty()) {
            return Err(err("INVALID_VALUE", &["IP", &ip]));
        }
        self.set("PIF", &pif, "ip_configuration_mode", json!(mode))?;
        self.set("PIF", &pif, "IP", json!(ip))?;
        self.set("PIF", &pif, "netmask", json!(netmask))?;
        self.set("PIF", &pif, "gateway", json!(gateway))?;
        self.set("PIF", &pif, "DNS", json!(dns))?;
        Ok(Value::Null)
    }

    fn destroy_vlan(&mut self, vlan: &str) -> ApiResult {
        let record = self.get("VLAN", vlan)?.clone();
        self.remove_pif(&str_of(&record, "untagged_PIF"));
        self.remove("VLAN", vlan);
        Ok(Value::Null)
    }

    // ===== Storage =====

    fn sr_create(&mut self, args: &[Value]) -> ApiResult {
        let host = arg_str(args, 0)?;
        let device_config = arg(args, 1)?.clone();
        let physical_size = arg_i64(args, 2).unwrap_or(0);
        let name_label = arg_str(args, 3)?;
        let name_description = arg_str(args, 4)?;
        let sr_type = arg_str(args, 5)?;
        let content_type = arg_str(args, 6)?;
        let shared = arg(args, 7)?.as_bool().unwrap_or(false);
        let sm_config = args.get(8).cloned().unwrap_or_else(|| json!({}));

        self.get("host", &host)?;
        if sr_type.is_empty() {
            return Err(err("SR_UNKNOWN_DRIVER", &[""]));
        }
        if sr_type == "nfs"
            && (device_config.get("server").is_none() || device_config.get("serverpath").is_none())
        {
            return Err(err("SR_BACKEND_FAILURE_101", &["", "The request is missing the server parameter"]));
        }

        let sr = self.insert(
            "SR",
            json!({"uuid": new_uuid(), "name_label": name_label, "name_description": name_description,
                   "type": sr_type, "content_type": content_type, "shared": shared,
                   "physical_size": physical_size.to_string(), "PBDs": [], "VDIs": [],
                   "other_config": {}, "sm_config": sm_config}),
        );

        let hosts: Vec<String> = if shared {
            self.table("host").map(|(r, _)| r.clone()).collect()
        } else {
            vec![host]
        };
        for host in hosts {
            let pbd = self.insert(
                "PBD",
                json!({"uuid": new_uuid(), "host": host, "SR": sr,
                       "device_config": device_config, "currently_attached": true}),
            );
            self.push_ref("SR", &sr, "PBDs", &pbd);
            self.push_ref("host", &host, "PBDs", &pbd);
        }
        Ok(json!(sr))
    }

    // ===== VMs =====

    fn require_halted(&self, vm: &str) -> Result<(), ApiError> {
        let state = str_of(self.get("VM", vm)?, "power_state");
        if state != "Halted" {
            return Err(err("VM_BAD_POWER_STATE", &[vm, "halted", &state.to_lowercase()]));
        }
        Ok(())
    }

    fn vm_clone(&mut self, source: &str, name: &str, snapshot: bool, with_memory: bool) -> ApiResult {
        let original = self.get("VM", source)?.clone();
        if with_memory && str_of(&original, "power_state") != "Running" {
            return Err(err("VM_BAD_POWER_STATE", &[source, "running", "halted"]));
        }

        let mut copy = original.clone();
        if let Value::Object(map) = &mut copy {
            map.insert("uuid".into(), json!(new_uuid()));
            map.insert("name_label".into(), json!(name));
            map.insert("VBDs".into(), json!([]));
            map.insert("VIFs".into(), json!([]));
            map.insert("snapshots".into(), json!([]));
            if snapshot {
                map.insert("is_a_snapshot".into(), json!(true));
                map.insert("snapshot_of".into(), json!(source));
                map.insert(
                    "snapshot_info".into(),
                    json!({"power-state-at-snapshot": str_of(&original, "power_state")}),
                );
                let state = if with_memory { "Suspended" } else { "Halted" };
                map.insert("power_state".into(), json!(state));
            } else {
                map.insert("power_state".into(), json!("Halted"));
            }
        }
        let vm = self.insert("VM", copy);

        for vbd in refs_of(&original, "VBDs") {
            let vbd_record = self.get("VBD", &vbd)?.clone();
            let vdi = str_of(&vbd_record, "VDI");
            let new_vdi = match self.get("VDI", &vdi) {
                Ok(vdi_record) => {
                    let mut vdi_copy = vdi_record.clone();
                    let sr = str_of(vdi_record, "SR");
                    if let Value::Object(map) = &mut vdi_copy {
                        map.insert("uuid".into(), json!(new_uuid()));
                        map.insert("VBDs".into(), json!([]));
                        map.insert("is_a_snapshot".into(), json!(snapshot));
                    }
                    let new_vdi = self.insert("VDI", vdi_copy);
                    self.push_ref("SR", &sr, "VDIs", &new_vdi);
                    new_vdi
                }
                Err(_) => NULL_REF.to_string(),
            };
            let mut vbd_copy = vbd_record.clone();
            if let Value::Object(map) = &mut vbd_copy {
                map.insert("uuid".into(), json!(new_uuid()));
                map.insert("VM".into(), json!(vm));
                map.insert("VDI".into(), json!(new_vdi));
                map.insert("currently_attached".into(), json!(false));
            }
            let new_vbd = self.insert("VBD", vbd_copy);
            self.push_ref("VM", &vm, "VBDs", &new_vbd);
            if new_vdi != NULL_REF {
                self.push_ref("VDI", &new_vdi, "VBDs", &new_vbd);
            }
        }

        if snapshot {
            self.push_ref("VM", source, "snapshots", &vm);
        }
        Ok(json!(vm))
    }

    fn vm_provision(&mut self, vm: &str) -> ApiResult {
        let record = self.get("VM", vm)?.clone();
        let has_disks = record
            .get("other_config")
            .and_then(|c| c.get("disks"))
            .is_some();
        if !has_disks {
            return Ok(Value::Null);
        }

        let pool = self.pool_ref()?;
        let mut sr = str_of(self.get("pool", &pool)?, "default_SR");
        if self.get("SR", &sr).is_err() {
            sr = self
                .table("SR")
                .find(|(_, s)| str_of(s, "content_type") != "iso")
                .map(|(r, _)| r.clone())
                .ok_or_else(|| err("SR_NOT_FOUND", &[]))?;
        }
        let vdi = self.insert(
            "VDI",
            json!({"uuid": new_uuid(), "name_label": format!("{} 0", str_of(&record, "name_label")),
                   "name_description": "Created by template provisioner", "SR": sr,
                   "virtual_size": MOCK_TEMPLATE_DISK_SIZE.to_string(), "type": "system",
                   "sharable": false, "read_only": false, "is_a_snapshot": false,
                   "VBDs": [], "other_config": {}}),
        );
        self.push_ref("SR", &sr, "VDIs", &vdi);
        let vbd = self.insert(
            "VBD",
            json!({"uuid": new_uuid(), "VM": vm, "VDI": vdi, "userdevice": "0", "bootable": true,
                   "mode": "RW", "type": "Disk", "empty": false, "currently_attached": false}),
        );
        self.push_ref("VM", vm, "VBDs", &vbd);
        self.push_ref("VDI", &vdi, "VBDs", &vbd);
        if let Ok(Value::Object(map)) = self.get_mut("VM", vm)
            && let Some(Value::Object(config)) = map.get_mut("other_config")
        {
            config.remove("disks");
        }
        Ok(Value::Null)
    }

    /// Replace the disks of the snapshotted VM with copies of the snapshot's.
    fn vm_revert(&mut self, snapshot: &str) -> ApiResult {
        let snap = self.get("VM", snapshot)?.clone();
        if !bool_of(&snap, "is_a_snapshot") {
            return Err(err("VM_REVERT_FAILED", &[snapshot, "not a snapshot"]));
        }
        let vm = str_of(&snap, "snapshot_of");
        let record = self
            .get("VM", &vm)
            .map_err(|_| err("VM_REVERT_FAILED", &[snapshot, "the snapshotted VM is gone"]))?
            .clone();

        for vbd in refs_of(&record, "VBDs") {
            let Ok(vbd_record) = self.get("VBD", &vbd).cloned() else {
                continue;
            };
            self.remove_vbd(&vbd, &vbd_record);
            let vdi = str_of(&vbd_record, "VDI");
            let orphaned = self.get("VDI", &vdi).map(|v| refs_of(v, "VBDs").is_empty()).unwrap_or(false);
            if orphaned && let Some(vdi_record) = self.remove("VDI", &vdi) {
                self.pull_ref("SR", &str_of(&vdi_record, "SR"), "VDIs", &vdi);
            }
        }

        for vbd in refs_of(&snap, "VBDs") {
            let vbd_record = self.get("VBD", &vbd)?.clone();
            let new_vdi = match self.get("VDI", &str_of(&vbd_record, "VDI")) {
                Ok(vdi_record) => {
                    let mut vdi_copy = vdi_record.clone();
                    let sr = str_of(vdi_record, "SR");
                    if let Value::Object(map) = &mut vdi_copy {
                        map.insert("uuid".into(), json!(new_uuid()));
                        map.insert("VBDs".into(), json!([]));
                        map.insert("is_a_snapshot".into(), json!(false));
                    }
                    let new_vdi = self.insert("VDI", vdi_copy);
                    self.push_ref("SR", &sr, "VDIs", &new_vdi);
                    new_vdi
                }
                Err(_) => NULL_REF.to_string(),
            };
            let mut vbd_copy = vbd_record.clone();
            if let Value::Object(map) = &mut vbd_copy {
                map.insert("uuid".into(), json!(new_uuid()));
                map.insert("VM".into(), json!(vm));
                map.insert("VDI".into(), json!(new_vdi));
                map.insert("currently_attached".into(), json!(false));
            }
            let new_vbd = self.insert("VBD", vbd_copy);
            self.push_ref("VM", &vm, "VBDs", &new_vbd);
            if new_vdi != NULL_REF {
                self.push_ref("VDI", &new_vdi, "VBDs", &new_vbd);
            }
        }

        let state = if str_of(&snap, "power_state") == "Suspended" { "Suspended" } else { "Halted" };
        self.set("VM", &vm, "power_state", json!(state))?;
        for vif in refs_of(&record, "VIFs") {
            self.set("VIF", &vif, "currently_attached", json!(false))?;
        }
        Ok(Value::Null)
    }

    fn vm_start(&mut self, vm: &str) -> ApiResult {
        let record = self.get("VM", vm)?.clone();
        if bool_of(&record, "is_a_template") {
            return Err(err("VM_IS_TEMPLATE", &[vm]));
        }
        self.require_halted(vm)?;
        self.set("VM", vm, "power_state", json!("Running"))?;
        for vbd in refs_of(&record, "VBDs") {
            self.set("VBD", &vbd, "currently_attached", json!(true))?;
        }
        for vif in refs_of(&record, "VIFs") {
            self.set("VIF", &vif, "currently_attached", json!(true))?;
        }
        Ok(Value::Null)
    }

    fn vm_shutdown(&mut self, vm: &str) -> ApiResult {
        let record = self.get("VM", vm)?.clone();
        let state = str_of(&record, "power_state");
        if state != "Running" {
            return Err(err("VM_BAD_POWER_STATE", &[vm, "running", &state.to_lowercase()]));
        }
        self.set("VM", vm, "power_state", json!("Halted"))?;
        for vbd in refs_of(&record, "VBDs") {
            self.set("VBD", &vbd, "currently_attached", json!(false))?;
        }
        for vif in refs_of(&record, "VIFs") {
            self.set("VIF", &vif, "currently_attached", json!(false))?;
        }
        Ok(Value::Null)
    }

    fn vm_destroy(&mut self, vm: &str) -> ApiResult {
        let record = self.get("VM", vm)?.clone();
        if str_of(&record, "power_state") == "Running" {
            return Err(err("VM_BAD_POWER_STATE", &[vm, "halted", "running"]));
        }
        for vbd in refs_of(&record, "VBDs") {
            if let Ok(vbd_record) = self.get("VBD", &vbd).cloned() {
                self.remove_vbd(&vbd, &vbd_record);
            }
        }
        for vif in refs_of(&record, "VIFs") {
            if let Ok(vif_record) = self.get("VIF", &vif).cloned() {
                self.remove_vif(&vif, &vif_record);
            }
        }
        let parent = str_of(&record, "snapshot_of");
        self.pull_ref("VM", &parent, "snapshots", vm);
        self.remove("VM", vm);
        Ok(Value::Null)
    }

    fn remove_vbd(&mut self, vbd: &str, record: &Value) {
        self.pull_ref("VM", &str_of(record, "VM"), "VBDs", vbd);
        self.pull_ref("VDI", &str_of(record, "VDI"), "VBDs", vbd);
        self.remove("VBD", vbd);
    }

    fn remove_vif(&mut self, vif: &str, record: &Value) {
        self.pull_ref("VM", &str_of(record, "VM"), "VIFs", vif);
        self.pull_ref("network", &str_of(record, "network"), "VIFs", vif);
        self.remove("VIF", vif);
    }

    // ===== Standalone hosts =====

    fn standalone_call(&mut self, address: &str, method: &str, args: &[Value]) -> ApiResult {
        let host = self
            .standalone
            .get(address)
            .cloned()
            .ok_or_else(|| ApiError::transport(format!("connection refused: {}", address)))?;
        let host_ref = format!("OpaqueRef:standalone-{}", str_of(&host, "uuid"));

        match method {
            "host.get_all" => Ok(json!([host_ref])),
            "host.get_record" => Ok(host),
            "host.get_uuid" => Ok(json!(str_of(&host, "uuid"))),
            "pool.join" => {
                let master_address = arg_str(args, 0)?;
                let user = arg_str(args, 1)?;
                let pass = arg_str(args, 2)?;
                if master_address != self.coordinator_address {
                    return Err(err("POOL_JOINING_HOST_CONNECTION_FAILED", &[]));
                }
                if user != MOCK_USERNAME || pass != MOCK_PASSWORD {
                    return Err(err("SESSION_AUTHENTICATION_FAILED", &[&user, "Authentication failure"]));
                }
                self.join_host(address)?;
                Ok(Value::Null)
            }
            _ => Err(err("MESSAGE_METHOD_UNKNOWN", &[method])),
        }
    }
}

/// Simulated pool shared by every [`MockHost`] view.
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<SimState>>,
}

impl MockCluster {
    /// One coordinator with two physical NICs, local storage, a control
    /// domain and the [`MOCK_TEMPLATE`] template.
    pub fn new() -> Self {
        let mut state = SimState {
            objects: BTreeMap::new(),
            sessions: HashSet::new(),
            coordinator_address: MOCK_COORDINATOR.to_string(),
            standalone: BTreeMap::new(),
            faults: Vec::new(),
            task_latency: 1,
            vanishing_tasks: false,
            tasks: HashMap::new(),
            calls: Vec::new(),
            logins: 0,
        };

        let metrics = state.insert("host_metrics", json!({"uuid": new_uuid(), "live": true}));
        let host = state.insert(
            "host",
            json!({"uuid": new_uuid(), "name_label": "xen1", "address": MOCK_COORDINATOR,
                   "enabled": true, "metrics": metrics, "PIFs": [], "PBDs": []}),
        );

        for (index, device) in ["eth0", "eth1"].iter().enumerate() {
            let network = state.insert(
                "network",
                json!({"uuid": new_uuid(),
                       "name_label": format!("Pool-wide network associated with {}", device),
                       "name_description": "", "MTU": "1500", "bridge": format!("xenbr{}", index),
                       "PIFs": [], "VIFs": [], "other_config": {}}),
            );
            let pif = state.insert_pif(json!({"device": device, "host": host, "network": network,
                                              "VLAN": "-1", "management": index == 0, "VLAN_master_of": NULL_REF}));
            state.push_ref("host", &host, "PIFs", &pif);
            state.push_ref("network", &network, "PIFs", &pif);
        }

        let local_sr = state.insert(
            "SR",
            json!({"uuid": new_uuid(), "name_label": "Local storage", "name_description": "",
                   "type": "lvm", "content_type": "user", "shared": false,
                   "physical_size": "500000000000", "PBDs": [], "VDIs": [],
                   "other_config": {}, "sm_config": {}}),
        );
        let pbd = state.insert(
            "PBD",
            json!({"uuid": new_uuid(), "host": host, "SR": local_sr,
                   "device_config": {"device": "/dev/sda3"}, "currently_attached": true}),
        );
        state.push_ref("SR", &local_sr, "PBDs", &pbd);
        state.push_ref("host", &host, "PBDs", &pbd);

        state.insert(
            "pool",
            json!({"uuid": new_uuid(), "name_label": "", "name_description": "",
                   "master": host, "default_SR": local_sr, "ha_enabled": false,
                   "other_config": {}}),
        );

        state.insert(
            "VM",
            json!({"uuid": new_uuid(), "name_label": "Control domain on host: xen1",
                   "name_description": "", "power_state": "Running", "is_a_template": false,
                   "is_a_snapshot": false, "is_control_domain": true, "snapshot_of": NULL_REF,
                   "VCPUs_max": "4", "VCPUs_at_startup": "4",
                   "memory_static_min": "4294967296", "memory_static_max": "4294967296",
                   "memory_dynamic_min": "4294967296", "memory_dynamic_max": "4294967296",
                   "platform": {}, "HVM_boot_params": {}, "other_config": {},
                   "VBDs": [], "VIFs": [], "snapshots": []}),
        );

        let cluster = Self {
            state: Arc::new(Mutex::new(state)),
        };
        cluster.add_template(MOCK_TEMPLATE);
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread poisons the lock; the data is still usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Transport speaking to the coordinator.
    pub fn transport(&self) -> Arc<MockHost> {
        self.host(MOCK_COORDINATOR)
    }

    /// Transport speaking to `address`.
    pub fn host(&self, address: &str) -> Arc<MockHost> {
        Arc::new(MockHost {
            state: Arc::clone(&self.state),
            address: address.to_string(),
        })
    }

    pub fn connector(&self) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            cluster: self.clone(),
        })
    }

    /// Session-aware client against the coordinator with fast backoff.
    pub fn client(&self) -> ApiClient {
        let retry = BackoffPolicy::new(Duration::from_millis(10), 2.0, Duration::from_millis(100), 3);
        let transport: Arc<dyn XenApi> = self.transport();
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&transport),
            Credentials::new(MOCK_USERNAME, MOCK_PASSWORD),
            Duration::from_secs(3600),
            retry.clone(),
        ));
        ApiClient::new(transport, sessions, retry)
    }

    /// Engine configuration matching this cluster, with short intervals.
    pub fn config() -> EngineConfig {
        EngineConfig {
            host: MOCK_COORDINATOR.to_string(),
            username: MOCK_USERNAME.to_string(),
            password: MOCK_PASSWORD.to_string(),
            poll_initial_ms: 10,
            poll_max_interval_ms: 100,
            task_timeout_secs: 30,
            lock_timeout_secs: 30,
            host_live_timeout_secs: 30,
            ..Default::default()
        }
    }

    // ===== Topology =====

    /// Register a host that is not yet in the pool. Returns its uuid.
    pub fn add_standalone_host(&self, address: &str, name: &str) -> String {
        let uuid = new_uuid();
        self.lock().standalone.insert(
            address.to_string(),
            json!({"uuid": uuid, "name_label": name, "address": address}),
        );
        uuid
    }

    /// Join a standalone host without going through the engine.
    pub fn join_out_of_band(&self, address: &str) -> Result<(), ApiError> {
        self.lock().join_host(address)
    }

    /// Eject a member without going through the engine.
    pub fn eject_out_of_band(&self, address: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        let host = state
            .find_by("host", "address", address)
            .ok_or_else(|| err("HANDLE_INVALID", &["host", address]))?;
        state.pool_eject(&host).map(|_| ())
    }

    pub fn add_template(&self, name: &str) -> String {
        let mut state = self.lock();
        let uuid = new_uuid();
        state.insert(
            "VM",
            json!({"uuid": uuid, "name_label": name, "name_description": "",
                   "power_state": "Halted", "is_a_template": true, "is_a_snapshot": false,
                   "is_control_domain": false, "snapshot_of": NULL_REF,
                   "VCPUs_max": "1", "VCPUs_at_startup": "1",
                   "memory_static_min": "1073741824", "memory_static_max": "1073741824",
                   "memory_dynamic_min": "1073741824", "memory_dynamic_max": "1073741824",
                   "platform": {"device-model": "qemu-upstream-compat"},
                   "HVM_boot_params": {"order": "cd", "firmware": "bios"},
                   "other_config": {"disks": "<provision><disk device=\"0\" size=\"10737418240\" sr=\"\" bootable=\"true\" type=\"system\"/></provision>"},
                   "VBDs": [], "VIFs": [], "snapshots": []}),
        );
        uuid
    }

    /// Address of every pool member.
    pub fn member_addresses(&self) -> Vec<String> {
        let state = self.lock();
        let mut addresses: Vec<String> = state.table("host").map(|(_, h)| str_of(h, "address")).collect();
        addresses.sort();
        addresses
    }

    // ===== Fault injection =====

    /// Fail the next `times` calls of `method` with `error`.
    pub fn inject(&self, method: &str, error: ApiError, times: u32) {
        self.lock().faults.push(Fault {
            method: method.to_string(),
            effect: FaultEffect::Error(error),
            remaining: times,
        });
    }

    /// Answer the next call of `method` with `value` without executing it.
    pub fn inject_result(&self, method: &str, value: Value) {
        self.lock().faults.push(Fault {
            method: method.to_string(),
            effect: FaultEffect::Result(value),
            remaining: 1,
        });
    }

    /// Number of polls a task reports `pending` before its final status.
    pub fn set_task_latency(&self, polls: u32) {
        self.lock().task_latency = polls;
    }

    /// Tasks still take effect but their task objects are never readable.
    pub fn set_vanishing_tasks(&self, vanishing: bool) {
        self.lock().vanishing_tasks = vanishing;
    }

    /// Invalidate every open session.
    pub fn expire_sessions(&self) {
        self.lock().sessions.clear();
    }

    // ===== Inspection =====

    pub fn call_count(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|m| m.as_str() == method).count()
    }

    pub fn login_count(&self) -> usize {
        self.lock().logins
    }

    /// Every record of `class`, keyed by reference.
    pub fn records(&self, class: &str) -> Vec<(String, Value)> {
        self.lock()
            .table(class)
            .map(|(r, rec)| (r.clone(), rec.clone()))
            .collect()
    }

    /// First record of `class` whose `field` equals `value`.
    pub fn find(&self, class: &str, field: &str, value: &str) -> Option<(String, Value)> {
        let state = self.lock();
        let r = state.find_by(class, field, value)?;
        let record = state.get(class, &r).ok()?.clone();
        Some((r, record))
    }

    /// Overwrite one field, simulating an out-of-band edit.
    pub fn set_field(&self, class: &str, r: &str, field: &str, value: Value) -> Result<(), ApiError> {
        self.lock().set(class, r, field, value)
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One host's view of the simulated cluster.
pub struct MockHost {
    state: Arc<Mutex<SimState>>,
    address: String,
}

#[async_trait]
impl XenApi for MockHost {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ApiError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.calls.push(method.to_string());
        if let Some(outcome) = state.take_fault(method) {
            debug!(method, "Injected fault");
            return outcome;
        }
        state.dispatch(&self.address, method, params)
    }
}

/// Connects to any host of a [`MockCluster`] by address.
pub struct MockConnector {
    cluster: MockCluster,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn XenApi>, ApiError> {
        Ok(self.cluster.host(address))
    }
}
