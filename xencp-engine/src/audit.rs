//! Audit trail for changes the engine makes to the cluster.
//!
//! Events are emitted on the `audit` tracing target. A recording logger keeps
//! them in memory as well so tests can assert on the sequence.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::model::{Action, EntityId};

/// One auditable event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    Applied {
        action: Action,
        entity: EntityId,
        uuid: Option<String>,
    },
    Failed {
        action: Action,
        entity: EntityId,
        error: String,
    },
    HostJoined {
        address: String,
    },
    HostEjected {
        host_uuid: String,
    },
    LockAcquired {
        owner: String,
    },
    LockReleased {
        owner: String,
    },
    DriftDetected {
        detail: String,
    },
}

enum Mode {
    Tracing,
    Recording(Mutex<Vec<AuditEvent>>),
    Noop,
}

/// Audit logger shared by the executor, coordinator and reconcilers.
pub struct AuditLogger {
    component: String,
    mode: Mode,
}

impl AuditLogger {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            mode: Mode::Tracing,
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self {
            component: String::new(),
            mode: Mode::Noop,
        }
    }

    /// Logger that also keeps every event in memory.
    pub fn new_recording(component: &str) -> Self {
        Self {
            component: component.to_string(),
            mode: Mode::Recording(Mutex::new(Vec::new())),
        }
    }

    /// Events recorded so far; empty unless created with [`AuditLogger::new_recording`].
    pub fn events(&self) -> Vec<AuditEvent> {
        match &self.mode {
            Mode::Recording(events) => events.lock().map(|e| e.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn emit(&self, event: AuditEvent) {
        match &self.mode {
            Mode::Noop => return,
            Mode::Recording(events) => {
                if let Ok(mut events) = events.lock() {
                    events.push(event.clone());
                }
            }
            Mode::Tracing => {}
        }

        match &event {
            AuditEvent::Applied {
                action,
                entity,
                uuid,
            } => info!(
                target: "audit",
                component = %self.component,
                entity = %entity,
                uuid = uuid.as_deref().unwrap_or("-"),
                "{} applied",
                action
            ),
            AuditEvent::Failed {
                action,
                entity,
                error,
            } => warn!(
                target: "audit",
                component = %self.component,
                entity = %entity,
                "{} failed: {}",
                action,
                error
            ),
            AuditEvent::HostJoined { address } => {
                info!(target: "audit", component = %self.component, host = %address, "Host joined pool")
            }
            AuditEvent::HostEjected { host_uuid } => {
                info!(target: "audit", component = %self.component, host = %host_uuid, "Host ejected from pool")
            }
            AuditEvent::LockAcquired { owner } => {
                info!(target: "audit", component = %self.component, owner = %owner, "Pool lock acquired")
            }
            AuditEvent::LockReleased { owner } => {
                info!(target: "audit", component = %self.component, owner = %owner, "Pool lock released")
            }
            AuditEvent::DriftDetected { detail } => {
                warn!(target: "audit", component = %self.component, "Pool drift detected: {}", detail)
            }
        }
    }

    pub fn applied(&self, action: Action, entity: &EntityId, uuid: Option<&str>) {
        self.emit(AuditEvent::Applied {
            action,
            entity: entity.clone(),
            uuid: uuid.map(str::to_string),
        });
    }

    pub fn failed(&self, action: Action, entity: &EntityId, error: &dyn std::fmt::Display) {
        self.emit(AuditEvent::Failed {
            action,
            entity: entity.clone(),
            error: error.to_string(),
        });
    }

    pub fn host_joined(&self, address: &str) {
        self.emit(AuditEvent::HostJoined {
            address: address.to_string(),
        });
    }

    pub fn host_ejected(&self, host_uuid: &str) {
        self.emit(AuditEvent::HostEjected {
            host_uuid: host_uuid.to_string(),
        });
    }

    pub fn lock_acquired(&self, owner: &str) {
        self.emit(AuditEvent::LockAcquired {
            owner: owner.to_string(),
        });
    }

    pub fn lock_released(&self, owner: &str) {
        self.emit(AuditEvent::LockReleased {
            owner: owner.to_string(),
        });
    }

    pub fn drift_detected(&self, detail: &str) {
        self.emit(AuditEvent::DriftDetected {
            detail: detail.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;

    #[test]
    fn test_recording_keeps_order() {
        let audit = AuditLogger::new_recording("test");
        let vm = EntityId::new(EntityKind::Vm, "vm1");
        audit.lock_acquired("owner-a");
        audit.applied(Action::Create, &vm, Some("uuid-1"));
        audit.lock_released("owner-a");

        let events = audit.events();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[1],
            AuditEvent::Applied {
                action: Action::Create,
                entity: vm,
                uuid: Some("uuid-1".to_string()),
            }
        );
    }

    #[test]
    fn test_noop_records_nothing() {
        let audit = AuditLogger::new_noop();
        audit.host_joined("10.0.0.2");
        assert!(audit.events().is_empty());
    }
}
