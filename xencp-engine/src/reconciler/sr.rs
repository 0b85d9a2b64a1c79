//! Storage repository reconciler.
//!
//! SRs are created on one host (the coordinator unless `host` is given) and
//! plugged through PBDs. Credentials in `device_config` never reach XenAPI in
//! clear text: `password`, `cifspassword` and `chappassword` are stored as
//! secrets and passed as `<key>_secret` holding the secret uuid.
//!
//! An SR with an unplugged PBD observes as incomplete. Create then finishes
//! the existing SR instead of making a new one.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{
    Context, Reconciler, actual_from, all_managed, find_managed, ignore_not_found, missing_spec,
    require_non_empty, set_other_config, tag, uuid_of,
};
use crate::api::{HostRecord, OpaqueRef, PbdRecord, SecretRecord, SrRecord};
use crate::error::{Error, Result};
use crate::model::{ActualState, Attributes, EntityKind, EntitySpec, Operation, ResourceSpec, is_uuid, to_attributes};

/// `device_config` keys stored as secrets.
const SECRET_KEYS: &[&str] = &["password", "cifspassword", "chappassword"];

fn default_content_type() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrSpec {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    /// Storage driver, e.g. `nfs`, `lvmoiscsi`, `iso`.
    #[serde(rename = "type")]
    pub sr_type: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub shared: bool,
    /// Uuid of the host a local SR lives on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub device_config: BTreeMap<String, String>,
    #[serde(default)]
    pub sm_config: BTreeMap<String, String>,
}

impl EntitySpec for SrSpec {
    const KIND: EntityKind = EntityKind::StorageRepository;

    fn attributes(&self) -> Attributes {
        to_attributes(self)
    }

    fn immutable_attributes(&self) -> &'static [&'static str] {
        &["type", "content_type", "shared", "host", "device_config", "sm_config"]
    }

    fn validate(&self, key: &str) -> Result<()> {
        require_non_empty(Self::KIND, key, "name_label", &self.name_label)?;
        require_non_empty(Self::KIND, key, "type", &self.sr_type)?;
        if let Some(host) = &self.host {
            if self.shared {
                return Err(Error::validation(Self::KIND, key, "shared SRs are created on the coordinator; drop 'host'"));
            }
            if !is_uuid(host) {
                return Err(Error::validation(Self::KIND, key, format!("host '{}' is not a uuid", host)));
            }
        }
        for name in self.device_config.keys() {
            if let Some(base) = name.strip_suffix("_secret")
                && SECRET_KEYS.contains(&base)
            {
                return Err(Error::validation(
                    Self::KIND,
                    key,
                    format!("pass '{}' instead of '{}'", base, name),
                ));
            }
        }
        Ok(())
    }
}

fn sr_spec(op: &Operation) -> Result<&SrSpec> {
    match &op.spec {
        Some(ResourceSpec::StorageRepository(spec)) => Ok(spec),
        _ => Err(missing_spec(op)),
    }
}

/// Keep only the keys the caller declared; XenAPI adds its own.
fn project(live: BTreeMap<String, String>, desired: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    match desired {
        Some(desired) => live.into_iter().filter(|(k, _)| desired.contains_key(k)).collect(),
        None => live,
    }
}

fn is_iso(record: &SrRecord) -> bool {
    record.content_type == "iso"
}

fn auto_scans(record: &SrRecord) -> bool {
    record.other_config.get("auto-scan").map(String::as_str) == Some("true")
}

pub struct SrReconciler;

impl SrReconciler {
    async fn observed(
        &self,
        ctx: &Context,
        key: &str,
        record: &SrRecord,
        desired: Option<&SrSpec>,
    ) -> Result<ActualState> {
        let pbd = match record.pbds.first() {
            Some(pbd) => Some(ctx.api.get_record::<PbdRecord>(pbd).await?),
            None => None,
        };
        let host_uuid = match &pbd {
            Some(pbd) => Some(uuid_of(ctx, "host", &pbd.host).await?),
            None => None,
        };
        let device_config = match &pbd {
            Some(pbd) => self.reveal_secrets(ctx, &pbd.device_config).await?,
            None => BTreeMap::new(),
        };

        let spec = SrSpec {
            name_label: record.name_label.clone(),
            name_description: record.name_description.clone(),
            sr_type: record.sr_type.clone(),
            content_type: record.content_type.clone(),
            shared: record.shared,
            host: desired
                .and_then(|d| d.host.as_ref())
                .and(host_uuid.clone()),
            device_config: project(device_config, desired.map(|d| &d.device_config)),
            sm_config: project(record.sm_config.clone(), desired.map(|d| &d.sm_config)),
        };

        let mut attached = 0;
        for pbd in &record.pbds {
            if ctx.api.get_record::<PbdRecord>(pbd).await?.currently_attached {
                attached += 1;
            }
        }
        let mut computed = Attributes::from([
            ("physical_size".to_string(), json!(record.physical_size)),
            ("attached_pbds".to_string(), json!(attached)),
        ]);
        if let Some(host) = host_uuid {
            computed.insert("host".to_string(), json!(host));
        }
        let mut actual = actual_from(key, &record.uuid, &spec, computed);
        actual.incomplete = attached < record.pbds.len() || (is_iso(record) && !auto_scans(record));
        Ok(actual)
    }

    /// Replace `<key>_secret` entries with the secret values they point to.
    async fn reveal_secrets(
        &self,
        ctx: &Context,
        device_config: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut revealed = BTreeMap::new();
        for (name, value) in device_config {
            let base = name
                .strip_suffix("_secret")
                .filter(|base| SECRET_KEYS.contains(base));
            match base {
                Some(base) => match ctx.api.get_by_uuid::<SecretRecord>(value).await {
                    Ok(secret_ref) => {
                        let secret: SecretRecord = ctx.api.get_record(&secret_ref).await?;
                        revealed.insert(base.to_string(), secret.value);
                    }
                    Err(err) if err.is_not_found() => {
                        warn!(secret = %value, "Secret referenced by device_config is gone");
                        revealed.insert(name.clone(), value.clone());
                    }
                    Err(err) => return Err(err),
                },
                None => {
                    revealed.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(revealed)
    }

    /// Store credential keys as secrets.
    async fn hide_secrets(
        &self,
        ctx: &Context,
        device_config: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut hidden = BTreeMap::new();
        for (name, value) in device_config {
            if SECRET_KEYS.contains(&name.as_str()) {
                let secret_ref = ctx
                    .api
                    .call_ref("secret.create", vec![json!({"value": value, "other_config": {}})])
                    .await?;
                let uuid = uuid_of(ctx, "secret", &secret_ref).await?;
                hidden.insert(format!("{}_secret", name), uuid);
            } else {
                hidden.insert(name.clone(), value.clone());
            }
        }
        Ok(hidden)
    }

    async fn target_host(&self, ctx: &Context, spec: &SrSpec) -> Result<OpaqueRef> {
        match &spec.host {
            Some(uuid) => ctx.api.get_by_uuid::<HostRecord>(uuid).await,
            None => Ok(super::pool::pool_record(ctx).await?.1.master),
        }
    }

    /// Run `SR.create` on the target host and tag the result.
    async fn create_sr(&self, ctx: &Context, key: &str, spec: &SrSpec) -> Result<OpaqueRef> {
        let host = self.target_host(ctx, spec).await?;
        info!("Creating SR {} ({}) of type {}", spec.name_label, key, spec.sr_type);

        let existing: BTreeSet<OpaqueRef> = ctx
            .api
            .get_all_records::<SrRecord>()
            .await?
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        let device_config = self.hide_secrets(ctx, &spec.device_config).await?;

        let params = vec![
            json!(host),
            json!(device_config),
            json!("0"),
            json!(spec.name_label),
            json!(spec.name_description),
            json!(spec.sr_type),
            json!(spec.content_type),
            json!(spec.shared),
            json!(spec.sm_config),
        ];
        let existing_ref = &existing;
        let name_label = spec.name_label.as_str();
        let new_sr = move || async move {
            Ok::<_, Error>(
                ctx.api
                    .get_all_records::<SrRecord>()
                    .await?
                    .into_iter()
                    .find(|(r, sr)| !existing_ref.contains(r) && sr.name_label == name_label)
                    .map(|(r, _)| r),
            )
        };
        let created = ctx
            .run_task("SR.create", params, move || async move { Ok(new_sr().await?.is_some()) })
            .await?;

        let sr_ref = match created {
            Some(sr_ref) => sr_ref,
            None => new_sr().await?.ok_or_else(|| {
                Error::verification(EntityKind::StorageRepository, key, "created SR not found")
            })?,
        };
        tag(ctx, EntityKind::StorageRepository, &sr_ref, key).await?;
        Ok(sr_ref)
    }

    async fn rename(&self, ctx: &Context, sr_ref: &str, record: &SrRecord, spec: &SrSpec) -> Result<()> {
        if record.name_label != spec.name_label {
            ctx.api
                .call("SR.set_name_label", vec![json!(sr_ref), json!(spec.name_label)])
                .await?;
        }
        if record.name_description != spec.name_description {
            ctx.api
                .call("SR.set_name_description", vec![json!(sr_ref), json!(spec.name_description)])
                .await?;
        }
        Ok(())
    }

    /// Plug every PBD of the SR that is not attached yet.
    async fn plug_all(&self, ctx: &Context, record: &SrRecord) -> Result<()> {
        for pbd_ref in &record.pbds {
            let pbd: PbdRecord = ctx.api.get_record(pbd_ref).await?;
            if !pbd.currently_attached {
                ctx.api.call("PBD.plug", vec![json!(pbd_ref)]).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for SrReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::StorageRepository
    }

    async fn observe(
        &self,
        ctx: &Context,
        key: &str,
        uuid_hint: Option<&str>,
        desired: Option<&ResourceSpec>,
    ) -> Result<Option<ActualState>> {
        let desired = match desired {
            Some(ResourceSpec::StorageRepository(spec)) => Some(spec),
            _ => None,
        };
        match find_managed::<SrRecord>(ctx, EntityKind::StorageRepository, key, uuid_hint).await? {
            Some((_, record)) => Ok(Some(self.observed(ctx, key, &record, desired).await?)),
            None => Ok(None),
        }
    }

    async fn list_managed(&self, ctx: &Context) -> Result<Vec<ActualState>> {
        let mut states = Vec::new();
        for (_, record, key) in all_managed::<SrRecord>(ctx, EntityKind::StorageRepository).await? {
            states.push(self.observed(ctx, &key, &record, None).await?);
        }
        Ok(states)
    }

    async fn create(&self, ctx: &Context, op: &Operation) -> Result<String> {
        let spec = sr_spec(op)?;
        let sr_ref = match &op.uuid {
            Some(uuid) => {
                info!("Resuming creation of SR {} ({})", spec.name_label, op.key());
                let sr_ref = ctx.api.get_by_uuid::<SrRecord>(uuid).await?;
                let record: SrRecord = ctx.api.get_record(&sr_ref).await?;
                self.rename(ctx, &sr_ref, &record, spec).await?;
                sr_ref
            }
            None => self.create_sr(ctx, op.key(), spec).await?,
        };

        let record: SrRecord = ctx.api.get_record(&sr_ref).await?;
        if is_iso(&record) && !auto_scans(&record) {
            set_other_config(ctx, "SR", &sr_ref, "auto-scan", "true").await?;
        }
        self.plug_all(ctx, &record).await?;
        Ok(record.uuid)
    }

    async fn update(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        let spec = sr_spec(op)?;
        let sr_ref = ctx.api.get_by_uuid::<SrRecord>(&actual.uuid).await?;
        info!("Updating SR {} ({})", spec.name_label, op.key());

        if op.delta.contains_key("name_label") {
            ctx.api
                .call("SR.set_name_label", vec![json!(sr_ref), json!(spec.name_label)])
                .await?;
        }
        if op.delta.contains_key("name_description") {
            ctx.api
                .call("SR.set_name_description", vec![json!(sr_ref), json!(spec.name_description)])
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, ctx: &Context, op: &Operation, actual: &ActualState) -> Result<()> {
        info!("Deleting SR {}", op.key());
        let sr_ref = ctx.api.get_by_uuid::<SrRecord>(&actual.uuid).await?;
        let record: SrRecord = ctx.api.get_record(&sr_ref).await?;
        let (_, pool) = super::pool::pool_record(ctx).await?;

        let mut pbds = Vec::new();
        for pbd_ref in &record.pbds {
            pbds.push((pbd_ref.clone(), ctx.api.get_record::<PbdRecord>(pbd_ref).await?));
        }
        // Supporters first, the coordinator last.
        pbds.sort_by_key(|(_, pbd)| pbd.host == pool.master);

        let mut secrets = BTreeSet::new();
        for (pbd_ref, pbd) in &pbds {
            for (name, value) in &pbd.device_config {
                if name.strip_suffix("_secret").is_some_and(|base| SECRET_KEYS.contains(&base)) {
                    secrets.insert(value.clone());
                }
            }
            if pbd.currently_attached {
                ctx.api.call("PBD.unplug", vec![json!(pbd_ref)]).await?;
            }
        }

        let target = sr_ref.as_str();
        ctx.run_task("SR.forget", vec![json!(sr_ref)], move || async move {
            match ctx.api.get_record::<SrRecord>(target).await {
                Ok(_) => Ok(false),
                Err(err) if err.is_not_found() => Ok(true),
                Err(err) => Err(err),
            }
        })
        .await?;

        for uuid in secrets {
            match ctx.api.get_by_uuid::<SecretRecord>(&uuid).await {
                Ok(secret_ref) => ignore_not_found(ctx.api.call("secret.destroy", vec![json!(secret_ref)]).await)?,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn import(&self, ctx: &Context, uuid: &str, key: &str) -> Result<()> {
        let sr_ref = ctx.api.get_by_uuid::<SrRecord>(uuid).await?;
        tag(ctx, EntityKind::StorageRepository, &sr_ref, key).await
    }
}
