//! xencp reconciliation engine.
//!
//! Converges declared XenServer pool state (pools, storage repositories,
//! networks, virtual disks, VMs and snapshots) against a live pool through
//! the XenAPI. Callers hand in desired state plus whatever they persisted on
//! the previous cycle; the engine observes, plans an ordered set of
//! operations and applies them one by one.

pub mod api;
pub mod audit;
pub mod backoff;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod differ;
pub mod engine;
pub mod error;
pub mod executor;
pub mod mock;
pub mod model;
pub mod reconciler;
pub mod session;
pub mod task;

pub use api::{ApiClient, ApiError, Connector, XenApi};
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use engine::{Engine, ReconcileOutcome};
pub use error::{Error, Result};
pub use executor::ApplyReport;
pub use model::{
    Action, ActualState, Attributes, DesiredState, EntityId, EntityKind, Operation,
    PersistedRecord, Plan, ResourceSpec,
};
