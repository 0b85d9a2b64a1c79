//! PIF configuration reconciler.
//!
//! Manages the IP settings and the unplug policy of an existing physical
//! interface. The PIF itself is never created or destroyed: create claims it
//! by tagging and applies the settings, delete only drops the tags and leaves
//! the settings in place.
//!
//! The carrier is checked before an interface is reconfigured. A switch to
//! DHCP waits until the interface has obtained an address.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    Context, Reconciler, actual_from, all_managed, find_managed, managed_key, missing_spec, set_other_config, tag,
    untag,
};
use crate::api::{ApiError, OpaqueRef, PifMetricsRecord, PifRecord, is_null_ref};
use crate::error::{Error, Result};
use crate::model::{ActualState, Attributes, EntityKind, EntitySpec, Operation, ResourceSpec, is_uuid, to_attributes};

/// `other_config` entry naming what the interface is used for.
const MANAGEMENT_PURPOSE: &str = "management_purpose";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMode {
    #[default]
    None,
    Dhcp,
    Static,
}

impl IpMode {
    fn as_xapi(self) -> &'static str {
        match self {
            IpMode::None => "None",
            IpMode::Dhcp => "DHCP",
            IpMode::Static => "Static",
        }
    }

    fn from_xapi(mode: &str) -> Self {
        match mode.to_ascii_lowercase().as_str() {
            "dhcp" => IpMode::Dhcp,
            "static" => IpMode::Static,
            _ => IpMode::None,
        }
    }
}

/// IP settings of the interface. Addresses are only given in static mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSettings {
    /// Recorded as `management_purpose`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_label: Option<String>,
    pub mode: IpMode,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub gateway: String,
    /// Comma-separated name servers.
    #[serde(default)]
    pub dns: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PifConfigurationSpec {
    /// Uuid of the PIF.
    pub pif: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disallow_unplug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<IpSettings>,
}

impl EntitySpec for PifConfigurationSpec {
    const KIND: EntityKind = EntityKind::PifConfiguration;

    fn attributes(&self) -> Attributes {
        to_attributes(self)
    }

    fn immutable_attributes(&self) -> &'static [&'static str] {
        &["pif"]
    }

    fn validate(&self, key: &str) -> Result<()> {
        if !is_uuid(&self.pif) {
            return Err(Error::validation(
                Self::KIND,
                key,
                format!("pif must be a uuid, got '{}'", self.pif),
            ));
        }
        let Some(settings) = &self.interface else {
            return Ok(());
        };
        match settings.mode {
            IpMode::Static => {
                if settings.ip.is_empty() || settings.netmask.is_empty() {
                    return Err(Error::validation(Self::KIND, key, "static mode needs ip and netmask"));
                }
                let addresses = [("ip", &settings.ip), ("netmask", &settings.netmask), ("gateway", &settings.gateway)];
                for (field, value) in addresses {
                    if !value.is_empty() && value.parse::<Ipv4Addr>().is_err() {
                        return Err(Error::validation(
                            Self::KIND,
                            key,
                            format!("{} '{}' is not an IPv4 address", field, value),
                        ));
                    }
                }
            }
            _ => {
                let addressed = [&settings.ip, &settings.netmask, &settings.gateway, &settings.dns];
                if addressed.iter().any(|value| !value.is_empty()) {
                    return Err(Error::validation(
                        Self::KIND,
                        key,
                        "ip, netmask, gateway and dns are only accepted in static mode",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn pif_spec(op: &Operation) -> Result<&PifConfigurationSpec> {
    match &op.spec {
        Some(ResourceSpec::PifConfiguration(spec)) => Ok(spec),
        _ => Err(missing_spec(op)),
    }
}

fn observed(key: &str, record: &PifRecord, desired: Option<&PifConfigurationSpec>) -> ActualState {
    let mode = IpMode::from_xapi(&record.ip_configuration_mode);
    let wanted = desired.and_then(|d| d.interface.as_ref());
    let purpose = record.other_config.get(MANAGEMENT_PURPOSE);
    let interface = if wanted.is_some() || mode != IpMode::None {
        let statically = |value: &str| {
            if mode == IpMode::Static {
                value.to_string()
            } else {
                String::new()
            }
        };
        Some(IpSettings {
            name_label: match wanted {
                Some(w) => w.name_label.as_ref().map(|_| purpose.cloned().unwrap_or_default()),
                None => purpose.cloned(),
            },
            mode,
            ip: statically(&record.ip),
            netmask: statically(&record.netmask),
            gateway: statically(&record.gateway),
            dns: statically(&record.dns),
        })
    } else {
        None
    };
    let spec = PifConfigurationSpec {
        pif: record.uuid.clone(),
        disallow_unplug: match desired {
            Some(d) => d.disallow_unplug.map(|_| record.disallow_unplug),
            None => Some(record.disallow_unplug),
        },
        interface,
    };
    let computed = Attributes::from([
        ("device".to_string(), json!(record.device)),
        ("ip".to_string(), json!(record.ip)),
        ("netmask".to_string(), json!(record.netmask)),
        ("gateway".to_string(), json!(record.gateway)),
    ]);
    actual_from(key, &record.uuid, &spec, computed)
}

pub struct PifReconciler;

impl PifReconciler {
    async fn check_carrier(&self, ctx: &Context, record: &PifRecord) -> Result<()> {
        if is_null_ref(&record.metrics) {
            return Ok(());
        }
        let metrics: PifMetricsRecord = ctx.api.get_record(&record.metrics).await?;
        if !metrics.carrier {
            return Err(Error::Conflict(ApiError::code("PIF_CARRIER_DOWN", &[&record.uuid, &record.device])));
        }
        Ok(())
    }

    async fn configure(&self, ctx: &Context, pif_ref: &str, record: &PifRecord, settings: &IpSettings) -> Result<()> {
        self.check_carrier(ctx, record).await?;

        if let Some(purpose) = &settings.name_label
            && record.other_config.get(MANAGEMENT_PURPOSE) != Some(purpose)
        {
            set_other_config(ctx, "PIF", pif_ref, MANAGEMENT_PURPOSE, purpose).await?;
        }

        info!(device = %record.device, mode = settings.mode.as_xapi(), "Reconfiguring PIF {}", record.uuid);
        ctx.api
            .call(
                "PIF.reconfigure_ip",
                vec![
                    json!(pif_ref),
                    json!(settings.mode.as_xapi()),
                    json!(settings.ip),
                    json!(settings.netmask),
                    json!(settings.gateway),
                    json!(settings.dns),
                ],
            )
            .await?;

        if settings.mode == IpMode::Dhcp {
            self.wait_for_lease(ctx, pif_ref, &record.uuid).await?;
        }
        Ok(())
    }

    /// Wait until the PIF reports an address.
    async fn wait_for_lease(&self, ctx: &Context, pif_ref: &str, uuid: &str) -> Result<()> {
        let timeout = ctx.config.dhcp_timeout();
        let started = Instant::now();
        let mut intervals = ctx.config.backoff().intervals();

        loop {
            let record: PifRecord = ctx.api.get_record(pif_ref).await?;
            if !record.ip.is_empty() {
                debug!(ip = %record.ip, "PIF {} obtained an address", uuid);
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::Timeout {
                    what: format!("PIF {} to obtain a DHCP address", uuid),
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

    async fn set_disallow_unplug(&self, ctx: &Context, pif_ref: &str, value: bool) -> Result<()> {
        ctx.api
            .call("PIF.set_disallow_unplug", vec![json!(pif_ref), json!(value)])
            .await?;
        Ok(())
    }

    /// PIF by uuid, refusing one already claimed under another key.
    async fn claim(&self, ctx: &Context, uuid: &str, key: &str) -> Result<(OpaqueRef, PifRecord)> {
        let pif_ref = ctx.api.get_by_uuid::<PifRecord>(uuid).await?;
        let record: PifRecord = ctx.api.get_record(&pif_ref).await?;
        match managed_key(&record.other_config, EntityKind::PifConfiguration) {
            Some(owner) if owner != key => Err(Error::validation(
                EntityKind::PifConfiguration,
                key,
                format!("PIF {} is already configured by '{}'", uuid, owner),
            )),
            _ => Ok((pif_ref, record)),
        }
    }
}

#[async_trait]
impl Reconciler for PifReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::PifConfiguration
    }

    async fn observe(
        &self,
        ctx: &Context,
        key: &str,
        uuid_hint: Option<&str>,
        desired: Option<&ResourceSpec>,
    ) -> Result<Option<ActualState>> {
        let desired = match desired {
            Some(ResourceSpec::PifConfiguration(spec)) => Some(spec),
            _ => None,
        };
        Ok(find_managed::<PifRecord>(ctx, EntityKind::PifConfiguration, key, uuid_hint)
            .await?
            .map(|(_, record)| observed(key, &record, desired)))
    }

    async fn list_managed(&self, ctx: &Context) -> Result<Vec<ActualState>> {
        Ok(all_managed::<PifRecord>(ctx, EntityKind::PifConfiguration)
            .await?
            .into_iter()
            .map(|(_, record, key)| observed(&key, &record, None))
            .collect())
    }

    async fn create(&self, ctx: &Context, op: &Operation) -> Result<String> {
        let spec = pif_spec(op)?;
        let key = op.key();
        let (pif_ref, record) = self.claim(ctx, &spec.pif, key).await?;
        info!("Configuring PIF {} ({}) as {}", record.uuid, record.device, key);

        tag(ctx, EntityKind::PifConfiguration, &pif_ref, key).await?;
        if let Some(value) = spec.disallow_unplug
            && value != record.disallow_unplug
        {
            self.set_disallow_unplug(ctx, &pif_ref, value).await?;
        }
        if let Some(settings) = &spec.interface {
            self.configure(ctx, &pif_ref, &record, settings).await?;
        }
        Ok(record.uuid)
    }

    async fn update(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        let spec = pif_spec(op)?;
        let pif_ref = ctx.api.get_by_uuid::<PifRecord>(&actual.uuid).await?;
        let record: PifRecord = ctx.api.get_record(&pif_ref).await?;

        if op.delta.contains_key("disallow_unplug")
            && let Some(value) = spec.disallow_unplug
        {
            self.set_disallow_unplug(ctx, &pif_ref, value).await?;
        }
        if op.delta.contains_key("interface")
            && let Some(settings) = &spec.interface
        {
            self.configure(ctx, &pif_ref, &record, settings).await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        info!("Releasing PIF {} from {}; its settings stay in place", actual.uuid, op.key());
        let pif_ref = ctx.api.get_by_uuid::<PifRecord>(&actual.uuid).await?;
        untag(ctx, "PIF", &pif_ref).await
    }

    async fn import(&self, ctx: &Context, uuid: &str, key: &str) -> Result<()> {
        let (pif_ref, _) = self.claim(ctx, uuid, key).await?;
        tag(ctx, EntityKind::PifConfiguration, &pif_ref, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, create_op, delete_op, desired, update_op};
    use super::*;
    use crate::mock::MockCluster;
    use serde_json::Value;

    fn eth1(cluster: &MockCluster) -> (String, Value) {
        cluster.find("PIF", "device", "eth1").unwrap()
    }

    fn configuration(pif: &Value, interface: Value) -> crate::model::DesiredState {
        desired(json!({
            "key": "storage-nic", "kind": "pif_configuration", "pif": pif["uuid"], "interface": interface
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_configuration() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let (pif_ref, pif) = eth1(&cluster);
        let state = configuration(
            &pif,
            json!({
                "name_label": "storage", "mode": "static",
                "ip": "10.0.0.5", "netmask": "255.255.255.0", "gateway": "10.0.0.1"
            }),
        );

        let uuid = PifReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        assert_eq!(uuid, pif["uuid"]);

        let actual = PifReconciler
            .observe(&ctx, "storage-nic", None, Some(&state.spec))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(actual.attributes, state.spec.attributes());
        let live = cluster.find("PIF", "uuid", &uuid).unwrap().1;
        assert_eq!(live["IP"], "10.0.0.5");
        assert_eq!(live["ip_configuration_mode"], "Static");
        assert_eq!(live["other_config"][MANAGEMENT_PURPOSE], "storage");
        assert_eq!(cluster.find("PIF", "uuid", &uuid).unwrap().0, pif_ref);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dhcp_waits_for_address() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let (_, pif) = eth1(&cluster);
        let state = configuration(&pif, json!({"mode": "dhcp"}));

        PifReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = PifReconciler
            .observe(&ctx, "storage-nic", None, Some(&state.spec))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(actual.attributes, state.spec.attributes());
        assert!(actual.computed["ip"].as_str().unwrap().starts_with("192.168.100."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dhcp_without_lease_times_out() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let (_, pif) = eth1(&cluster);
        cluster.inject_result("PIF.reconfigure_ip", Value::Null);
        let state = configuration(&pif, json!({"mode": "dhcp"}));

        let err = PifReconciler.create(&ctx, &create_op(&state)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_carrier_is_conflict() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let (_, pif) = eth1(&cluster);
        let metrics = pif["metrics"].as_str().unwrap().to_string();
        cluster.set_field("PIF_metrics", &metrics, "carrier", json!(false)).unwrap();
        let state = configuration(&pif, json!({"mode": "dhcp"}));

        let err = PifReconciler.create(&ctx, &create_op(&state)).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(cluster.call_count("PIF.reconfigure_ip"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_then_delete_keeps_settings() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let (_, pif) = eth1(&cluster);
        let state = configuration(&pif, json!({"mode": "static", "ip": "10.0.0.5", "netmask": "255.255.255.0"}));
        PifReconciler.create(&ctx, &create_op(&state)).await.unwrap();
        let actual = PifReconciler.observe(&ctx, "storage-nic", None, Some(&state.spec)).await.unwrap().unwrap();

        let changed = desired(json!({
            "key": "storage-nic", "kind": "pif_configuration", "pif": pif["uuid"], "disallow_unplug": true,
            "interface": {"mode": "static", "ip": "10.0.0.6", "netmask": "255.255.255.0"}
        }));
        let op = update_op(&changed, &actual);
        assert!(op.delta.contains_key("disallow_unplug"));
        assert!(op.delta.contains_key("interface"));
        PifReconciler.update(&ctx, &op, &actual).await.unwrap();
        let actual = PifReconciler
            .observe(&ctx, "storage-nic", None, Some(&changed.spec))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(actual.attributes, changed.spec.attributes());

        PifReconciler.delete(&ctx, &delete_op(&actual), &actual).await.unwrap();
        assert!(PifReconciler.list_managed(&ctx).await.unwrap().is_empty());
        let live = cluster.find("PIF", "device", "eth1").unwrap().1;
        assert_eq!(live["IP"], "10.0.0.6");
        assert_eq!(live["disallow_unplug"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pif_claimed_by_another_key_is_rejected() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        let (_, pif) = eth1(&cluster);
        let uuid = pif["uuid"].as_str().unwrap();
        PifReconciler.import(&ctx, uuid, "first").await.unwrap();

        let err = PifReconciler.import(&ctx, uuid, "second").await.unwrap_err();
        assert!(err.to_string().contains("already configured by 'first'"));
        let managed = PifReconciler.list_managed(&ctx).await.unwrap();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].id.key, "first");
    }

    #[test]
    fn test_validation() {
        let uuid = "0c6a1d5e-7c8d-4d4e-9e0f-3f2b1a0c9d8e";
        let spec = |pif: &str, interface: Value| PifConfigurationSpec {
            pif: pif.to_string(),
            disallow_unplug: None,
            interface: serde_json::from_value(interface).unwrap(),
        };
        assert!(spec(uuid, json!({"mode": "dhcp"})).validate("n").is_ok());
        assert!(spec("eth1", json!({"mode": "dhcp"})).validate("n").is_err());
        assert!(spec(uuid, json!({"mode": "dhcp", "ip": "10.0.0.5"})).validate("n").is_err());
        assert!(spec(uuid, json!({"mode": "static", "ip": "10.0.0.5"})).validate("n").is_err());
        assert!(spec(uuid, json!({"mode": "static", "ip": "10.0.0", "netmask": "255.0.0.0"})).validate("n").is_err());
        assert!(spec(uuid, Value::Null).validate("n").is_ok());
    }
}
