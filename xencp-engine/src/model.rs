//! Core data model: entity identity, desired and actual state, operations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coordinator::Membership;
use crate::error::{Error, Result};
use crate::reconciler::network::NetworkSpec;
use crate::reconciler::pif::PifConfigurationSpec;
use crate::reconciler::pool::PoolSpec;
use crate::reconciler::snapshot::SnapshotSpec;
use crate::reconciler::sr::SrSpec;
use crate::reconciler::vdi::VdiSpec;
use crate::reconciler::vm::VmSpec;

/// Version of the [`PersistedRecord`] layout.
pub const SCHEMA_VERSION: u32 = 1;

/// Attribute map compared by the differ.
pub type Attributes = BTreeMap<String, Value>;

/// Managed entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Pool,
    StorageRepository,
    Network,
    Vdi,
    Vm,
    Snapshot,
    PifConfiguration,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Pool,
        EntityKind::StorageRepository,
        EntityKind::Network,
        EntityKind::Vdi,
        EntityKind::Vm,
        EntityKind::Snapshot,
        EntityKind::PifConfiguration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Pool => "pool",
            EntityKind::StorageRepository => "storage_repository",
            EntityKind::Network => "network",
            EntityKind::Vdi => "vdi",
            EntityKind::Vm => "vm",
            EntityKind::Snapshot => "snapshot",
            EntityKind::PifConfiguration => "pif_configuration",
        }
    }

    /// XenAPI class backing this kind.
    pub fn class(&self) -> &'static str {
        match self {
            EntityKind::Pool => "pool",
            EntityKind::StorageRepository => "SR",
            EntityKind::Network => "network",
            EntityKind::Vdi => "VDI",
            EntityKind::Vm | EntityKind::Snapshot => "VM",
            EntityKind::PifConfiguration => "PIF",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pool" => Ok(EntityKind::Pool),
            "storage_repository" | "sr" => Ok(EntityKind::StorageRepository),
            "network" => Ok(EntityKind::Network),
            "vdi" => Ok(EntityKind::Vdi),
            "vm" => Ok(EntityKind::Vm),
            "snapshot" => Ok(EntityKind::Snapshot),
            "pif_configuration" | "pif" => Ok(EntityKind::PifConfiguration),
            other => Err(Error::Config(format!("unknown entity kind: {}", other))),
        }
    }
}

/// Kind plus identifying key.
///
/// Ordered by key first so ties in the plan resolve by ascending key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub kind: EntityKind,
    pub key: String,
}

impl EntityId {
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// Kind of change an [`Operation`] makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        })
    }
}

/// Whether a reference names a remote object directly (uuid) rather than a managed key.
pub fn is_uuid(reference: &str) -> bool {
    uuid::Uuid::parse_str(reference).is_ok()
}

/// Reference to another entity: a managed key, or a raw uuid of an unmanaged object.
pub fn reference(kind: EntityKind, target: &str) -> Option<EntityId> {
    if target.is_empty() || is_uuid(target) {
        None
    } else {
        Some(EntityId::new(kind, target))
    }
}

/// Serialize a spec into its comparable attribute map, dropping nulls.
pub fn to_attributes<T: Serialize>(spec: &T) -> Attributes {
    match serde_json::to_value(spec) {
        Ok(Value::Object(map)) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => Attributes::new(),
    }
}

/// Typed desired-state description of one entity kind.
pub trait EntitySpec {
    const KIND: EntityKind;

    /// Attributes the differ compares against the live entity.
    fn attributes(&self) -> Attributes;

    /// Other managed entities this one refers to.
    fn references(&self) -> Vec<EntityId> {
        Vec::new()
    }

    /// Attributes that can only be set at creation.
    fn immutable_attributes(&self) -> &'static [&'static str] {
        &[]
    }

    fn validate(&self, key: &str) -> Result<()>;
}

/// Desired-state description, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Pool(PoolSpec),
    StorageRepository(SrSpec),
    Network(NetworkSpec),
    Vdi(VdiSpec),
    Vm(VmSpec),
    Snapshot(SnapshotSpec),
    PifConfiguration(PifConfigurationSpec),
}

macro_rules! dispatch {
    ($self:expr, $spec:ident => $body:expr) => {
        match $self {
            ResourceSpec::Pool($spec) => $body,
            ResourceSpec::StorageRepository($spec) => $body,
            ResourceSpec::Network($spec) => $body,
            ResourceSpec::Vdi($spec) => $body,
            ResourceSpec::Vm($spec) => $body,
            ResourceSpec::Snapshot($spec) => $body,
            ResourceSpec::PifConfiguration($spec) => $body,
        }
    };
}

impl ResourceSpec {
    pub fn kind(&self) -> EntityKind {
        match self {
            ResourceSpec::Pool(_) => EntityKind::Pool,
            ResourceSpec::StorageRepository(_) => EntityKind::StorageRepository,
            ResourceSpec::Network(_) => EntityKind::Network,
            ResourceSpec::Vdi(_) => EntityKind::Vdi,
            ResourceSpec::Vm(_) => EntityKind::Vm,
            ResourceSpec::Snapshot(_) => EntityKind::Snapshot,
            ResourceSpec::PifConfiguration(_) => EntityKind::PifConfiguration,
        }
    }

    pub fn attributes(&self) -> Attributes {
        dispatch!(self, spec => spec.attributes())
    }

    pub fn references(&self) -> Vec<EntityId> {
        dispatch!(self, spec => spec.references())
    }

    pub fn immutable_attributes(&self) -> &'static [&'static str] {
        dispatch!(self, spec => spec.immutable_attributes())
    }

    pub fn validate(&self, key: &str) -> Result<()> {
        dispatch!(self, spec => spec.validate(key))
    }
}

/// Declared target for one entity. Owned by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub key: String,
    #[serde(flatten)]
    pub spec: ResourceSpec,
}

impl DesiredState {
    pub fn new(key: impl Into<String>, spec: ResourceSpec) -> Self {
        Self {
            key: key.into(),
            spec,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.spec.kind()
    }

    pub fn id(&self) -> EntityId {
        EntityId::new(self.kind(), self.key.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(Error::validation(self.kind(), &self.key, "key must not be empty"));
        }
        self.spec.validate(&self.key)
    }
}

/// Point-in-time read of one live entity. Never reused across cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct ActualState {
    pub id: EntityId,
    pub uuid: String,
    /// Carries the engine's ownership tag.
    pub managed: bool,
    /// Same shape as the desired attributes.
    pub attributes: Attributes,
    /// Read-only values derived from the live entity.
    pub computed: Attributes,
    /// Managed entities this one currently refers to.
    pub references: Vec<EntityId>,
    /// A create started on this entity but did not finish. The next plan
    /// creates it again, continuing from what is already there.
    pub incomplete: bool,
}

impl ActualState {
    pub fn to_record(&self) -> PersistedRecord {
        PersistedRecord {
            kind: self.id.kind,
            key: self.id.key.clone(),
            uuid: self.uuid.clone(),
            attributes: self.attributes.clone(),
            computed: self.computed.clone(),
            schema_version: SCHEMA_VERSION,
            updated_at: Utc::now(),
        }
    }
}

/// Per-entity record persisted by the caller between cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub kind: EntityKind,
    pub key: String,
    pub uuid: String,
    pub attributes: Attributes,
    #[serde(default)]
    pub computed: Attributes,
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
}

impl PersistedRecord {
    pub fn id(&self) -> EntityId {
        EntityId::new(self.kind, self.key.clone())
    }
}

/// A single required change.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub action: Action,
    pub id: EntityId,
    /// Live uuid for updates and deletes, and for creates that resume a
    /// partial object.
    pub uuid: Option<String>,
    /// Attributes to set: everything for a create, changed values for an update.
    pub delta: Attributes,
    /// Full desired spec for creates and updates.
    pub spec: Option<ResourceSpec>,
    /// Entities whose operations in the same plan must run first.
    pub depends_on: Vec<EntityId>,
}

impl Operation {
    pub fn kind(&self) -> EntityKind {
        self.id.kind
    }

    pub fn key(&self) -> &str {
        &self.id.key
    }

    /// Identity of the change, ignoring bookkeeping fields.
    pub fn same_change(&self, other: &Operation) -> bool {
        self.action == other.action && self.id == other.id && self.delta == other.delta
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.id)
    }
}

/// Ordered operations produced by the differ.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub operations: Vec<Operation>,
    /// Pool membership the plan was computed against. Topology operations
    /// fail with drift when the pool has since changed out of band.
    pub baseline: Option<Membership>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    /// Number of creates, updates and deletes.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.operations
            .iter()
            .fold((0, 0, 0), |(c, u, d), op| match op.action {
                Action::Create => (c + 1, u, d),
                Action::Update => (c, u + 1, d),
                Action::Delete => (c, u, d + 1),
            })
    }
}
