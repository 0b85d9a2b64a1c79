//! State differ.
//!
//! Compares desired state against a fresh actual-state snapshot and produces
//! an ordered [`Plan`]. Ordering is a topological sort over reference edges
//! with ties broken by ascending key, so identical inputs always yield the
//! same operation sequence.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Action, ActualState, Attributes, DesiredState, EntityId, Operation, Plan};

/// Compute the operations that move `actual` to `desired`, in execution order.
///
/// `actual` holds every live entity relevant to the cycle: the ones matching
/// desired keys plus every managed entity found on the pool. Only managed
/// entities are ever deleted.
pub fn diff(desired: &[DesiredState], actual: &[ActualState]) -> Result<Plan> {
    let operations = operations(desired, actual)?;
    let operations = link(operations, desired, actual);
    order(operations)
}

/// Unordered operations with empty dependency lists.
fn operations(desired: &[DesiredState], actual: &[ActualState]) -> Result<Vec<Operation>> {
    let mut wanted: BTreeMap<EntityId, &DesiredState> = BTreeMap::new();
    for state in desired {
        state.validate()?;
        if wanted.insert(state.id(), state).is_some() {
            return Err(Error::Plan(format!("{} is declared more than once", state.id())));
        }
    }

    let mut live: BTreeMap<EntityId, &ActualState> = BTreeMap::new();
    for state in actual {
        if let Some(previous) = live.insert(state.id.clone(), state)
            && previous.uuid != state.uuid
        {
            return Err(Error::Plan(format!(
                "{} matches more than one live object ({} and {})",
                state.id, previous.uuid, state.uuid
            )));
        }
    }

    let mut operations = Vec::new();

    for (id, state) in &wanted {
        let attributes = state.spec.attributes();
        match live.get(id) {
            None => operations.push(Operation {
                action: Action::Create,
                id: id.clone(),
                uuid: None,
                delta: attributes,
                spec: Some(state.spec.clone()),
                depends_on: Vec::new(),
            }),
            Some(current) if current.incomplete => operations.push(Operation {
                action: Action::Create,
                id: id.clone(),
                uuid: Some(current.uuid.clone()),
                delta: attributes,
                spec: Some(state.spec.clone()),
                depends_on: Vec::new(),
            }),
            Some(current) => {
                let delta = delta(&attributes, &current.attributes);
                if delta.is_empty() {
                    continue;
                }
                if let Some(attribute) = state
                    .spec
                    .immutable_attributes()
                    .iter()
                    .find(|a| delta.contains_key(**a))
                {
                    return Err(Error::Immutable {
                        kind: id.kind,
                        key: id.key.clone(),
                        attribute: attribute.to_string(),
                    });
                }
                operations.push(Operation {
                    action: Action::Update,
                    id: id.clone(),
                    uuid: Some(current.uuid.clone()),
                    delta,
                    spec: Some(state.spec.clone()),
                    depends_on: Vec::new(),
                });
            }
        }
    }

    for (id, current) in &live {
        if current.managed && !wanted.contains_key(id) {
            operations.push(Operation {
                action: Action::Delete,
                id: id.clone(),
                uuid: Some(current.uuid.clone()),
                delta: Attributes::new(),
                spec: None,
                depends_on: Vec::new(),
            });
        }
    }

    Ok(operations)
}

/// Desired attributes whose live value is absent or different.
pub(crate) fn delta(desired: &Attributes, actual: &Attributes) -> Attributes {
    desired
        .iter()
        .filter(|(name, value)| actual.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Fill `depends_on` from references.
///
/// - A create or update runs after creates and updates of what it references.
/// - A delete runs before the delete of anything it references.
/// - An update that drops a reference runs before the delete of the dropped target.
fn link(mut operations: Vec<Operation>, desired: &[DesiredState], actual: &[ActualState]) -> Vec<Operation> {
    let actions: BTreeMap<EntityId, Action> = operations
        .iter()
        .map(|op| (op.id.clone(), op.action))
        .collect();
    let live_refs: BTreeMap<&EntityId, &Vec<EntityId>> =
        actual.iter().map(|a| (&a.id, &a.references)).collect();
    let wanted_refs: BTreeMap<EntityId, Vec<EntityId>> = desired
        .iter()
        .map(|d| (d.id(), d.spec.references()))
        .collect();

    // (before, after)
    let mut edges: BTreeSet<(EntityId, EntityId)> = BTreeSet::new();
    let is_write = |id: &EntityId| matches!(actions.get(id), Some(Action::Create | Action::Update));
    let is_delete = |id: &EntityId| matches!(actions.get(id), Some(Action::Delete));

    for op in &operations {
        let current = live_refs.get(&op.id).map(|r| r.as_slice()).unwrap_or(&[]);
        match op.action {
            Action::Create | Action::Update => {
                let wanted = wanted_refs.get(&op.id).map(Vec::as_slice).unwrap_or(&[]);
                for target in wanted.iter().filter(|t| *t != &op.id && is_write(t)) {
                    edges.insert((target.clone(), op.id.clone()));
                }
                for dropped in current.iter().filter(|t| !wanted.contains(t) && is_delete(t)) {
                    edges.insert((op.id.clone(), dropped.clone()));
                }
            }
            Action::Delete => {
                for target in current.iter().filter(|t| *t != &op.id && is_delete(t)) {
                    edges.insert((op.id.clone(), target.clone()));
                }
            }
        }
    }

    for op in &mut operations {
        op.depends_on = edges
            .iter()
            .filter(|(_, after)| after == &op.id)
            .map(|(before, _)| before.clone())
            .collect();
    }
    operations
}

/// Topologically order operations by their `depends_on` lists.
///
/// Among operations that are ready at the same time the smallest key runs
/// first. Dependencies on entities without an operation in the plan are
/// ignored. Fails with [`Error::Plan`] on a cycle.
pub fn order(operations: Vec<Operation>) -> Result<Plan> {
    let mut pending: BTreeMap<EntityId, Operation> = BTreeMap::new();
    for op in operations {
        let id = op.id.clone();
        if pending.insert(id.clone(), op).is_some() {
            return Err(Error::Plan(format!("more than one operation for {}", id)));
        }
    }

    let mut indegree: BTreeMap<EntityId, usize> = pending.keys().map(|id| (id.clone(), 0)).collect();
    let mut successors: BTreeMap<EntityId, BTreeSet<EntityId>> = BTreeMap::new();
    for (id, op) in &pending {
        let predecessors: BTreeSet<&EntityId> = op
            .depends_on
            .iter()
            .filter(|dep| *dep != id && pending.contains_key(*dep))
            .collect();
        for dep in predecessors {
            successors.entry(dep.clone()).or_default().insert(id.clone());
            *indegree.entry(id.clone()).or_default() += 1;
        }
    }

    let mut ready: BTreeSet<EntityId> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut ordered = Vec::with_capacity(pending.len());

    while let Some(id) = ready.pop_first() {
        for next in successors.get(&id).into_iter().flatten() {
            if let Some(n) = indegree.get_mut(next) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(next.clone());
                }
            }
        }
        if let Some(op) = pending.remove(&id) {
            ordered.push(op);
        }
    }

    if !pending.is_empty() {
        let stuck: Vec<String> = pending.keys().map(|id| id.to_string()).collect();
        return Err(Error::Plan(format!(
            "circular dependency between {}",
            stuck.join(", ")
        )));
    }

    debug!(operations = ordered.len(), "Plan computed");
    Ok(Plan {
        operations: ordered,
        baseline: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use serde_json::{Value, json};

    fn desired(value: Value) -> DesiredState {
        serde_json::from_value(value).unwrap()
    }

    /// Live state that exactly matches `state`.
    fn converged(state: &DesiredState) -> ActualState {
        ActualState {
            id: state.id(),
            uuid: format!("uuid-{}", state.key),
            managed: true,
            attributes: state.spec.attributes(),
            computed: Attributes::new(),
            references: state.spec.references(),
            incomplete: false,
        }
    }

    fn unmanaged(kind: EntityKind, key: &str) -> ActualState {
        ActualState {
            id: EntityId::new(kind, key),
            uuid: format!("uuid-{}", key),
            managed: false,
            attributes: Attributes::new(),
            computed: Attributes::new(),
            references: vec![],
            incomplete: false,
        }
    }

    fn network(key: &str, mtu: u32) -> DesiredState {
        desired(json!({"key": key, "kind": "network", "name_label": key, "mtu": mtu}))
    }

    fn sr(key: &str) -> DesiredState {
        desired(json!({
            "key": key, "kind": "storage_repository", "name_label": key, "type": "nfs",
            "shared": true, "device_config": {"server": "10.0.0.9", "serverpath": "/export"}
        }))
    }

    fn vdi(key: &str, sr: &str) -> DesiredState {
        desired(json!({"key": key, "kind": "vdi", "name_label": key, "sr": sr, "virtual_size": 1073741824}))
    }

    fn vm(key: &str, disks: &[&str], networks: &[&str]) -> DesiredState {
        let disks: Vec<Value> = disks.iter().map(|d| json!({"vdi": d})).collect();
        let interfaces: Vec<Value> = networks
            .iter()
            .enumerate()
            .map(|(i, n)| json!({"network": n, "device": i}))
            .collect();
        desired(json!({
            "key": key, "kind": "vm", "name_label": key, "template": "Debian Bookworm 12",
            "vcpus": 2, "memory_static_max": 2147483648u64, "disks": disks, "interfaces": interfaces
        }))
    }

    fn summary(plan: &Plan) -> Vec<String> {
        plan.iter().map(|op| op.to_string()).collect()
    }

    #[test]
    fn test_create_missing_entity() {
        let plan = diff(&[vm("vm1", &[], &[])], &[]).unwrap();
        assert_eq!(summary(&plan), vec!["create vm/vm1"]);
        assert_eq!(plan.operations[0].delta.get("vcpus"), Some(&json!(2)));
    }

    #[test]
    fn test_converged_state_yields_empty_plan() {
        let wanted = vec![sr("sr1"), vdi("disk1", "sr1"), vm("vm1", &["disk1"], &[]), network("net", 1500)];
        let live: Vec<ActualState> = wanted.iter().map(converged).collect();
        assert!(diff(&wanted, &live).unwrap().is_empty());
    }

    #[test]
    fn test_update_carries_only_changed_attributes() {
        let live = converged(&network("net", 1500));
        let plan = diff(&[network("net", 9000)], &[live]).unwrap();

        assert_eq!(summary(&plan), vec!["update network/net"]);
        let op = &plan.operations[0];
        assert_eq!(op.uuid.as_deref(), Some("uuid-net"));
        assert_eq!(op.delta.len(), 1);
        assert_eq!(op.delta.get("mtu"), Some(&json!(9000)));
    }

    #[test]
    fn test_extra_live_attributes_are_ignored() {
        let state = network("net", 1500);
        let mut live = converged(&state);
        live.attributes.insert("bridge".into(), json!("xapi3"));
        assert!(diff(&[state], &[live]).unwrap().is_empty());
    }

    #[test]
    fn test_only_managed_entities_are_deleted() {
        let mut stale = converged(&network("old", 1500));
        stale.managed = true;
        let foreign = unmanaged(EntityKind::Network, "Pool-wide network associated with eth0");

        let plan = diff(&[], &[stale, foreign]).unwrap();
        assert_eq!(summary(&plan), vec!["delete network/old"]);
    }

    #[test]
    fn test_immutable_change_is_rejected() {
        let mut live = converged(&vdi("disk1", "sr1"));
        live.attributes.insert("virtual_size".into(), json!(1));

        match diff(&[vdi("disk1", "sr1")], &[live]) {
            Err(Error::Immutable { attribute, .. }) => assert_eq!(attribute, "virtual_size"),
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_unfinished_create_is_resumed() {
        let state = vdi("disk1", "sr1");
        let mut live = converged(&state);
        live.attributes.insert("virtual_size".into(), json!(1));
        live.incomplete = true;

        let plan = diff(&[state.clone()], &[live]).unwrap();
        assert_eq!(summary(&plan), vec!["create vdi/disk1"]);
        let op = &plan.operations[0];
        assert_eq!(op.uuid.as_deref(), Some("uuid-disk1"));
        assert_eq!(op.delta, state.spec.attributes());
    }

    #[test]
    fn test_unfinished_create_of_unwanted_entity_is_deleted() {
        let mut live = converged(&network("old", 1500));
        live.incomplete = true;
        let plan = diff(&[], &[live]).unwrap();
        assert_eq!(summary(&plan), vec!["delete network/old"]);
    }

    #[test]
    fn test_duplicate_desired_key_is_plan_error() {
        let err = diff(&[network("net", 1500), network("net", 9000)], &[]).unwrap_err();
        assert!(matches!(err, Error::Plan(_)));
    }

    #[test]
    fn test_invalid_desired_state_is_rejected() {
        let err = diff(&[network("net", 0)], &[]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_creates_follow_references() {
        // Keys chosen so that alphabetical order alone would be wrong.
        let wanted = vec![vm("a-vm", &["b-disk"], &["c-net"]), vdi("b-disk", "z-sr"), sr("z-sr"), network("c-net", 1500)];
        let plan = diff(&wanted, &[]).unwrap();

        assert_eq!(
            summary(&plan),
            vec![
                "create network/c-net",
                "create storage_repository/z-sr",
                "create vdi/b-disk",
                "create vm/a-vm",
            ]
        );
        let vm_op = plan.operations.last().unwrap();
        assert_eq!(
            vm_op.depends_on,
            vec![EntityId::new(EntityKind::Vdi, "b-disk"), EntityId::new(EntityKind::Network, "c-net")]
        );
    }

    #[test]
    fn test_deletes_run_referrer_first() {
        let chain = vec![sr("a-sr"), vdi("b-disk", "a-sr"), vm("c-vm", &["b-disk"], &[])];
        let live: Vec<ActualState> = chain.iter().map(converged).collect();

        let plan = diff(&[], &live).unwrap();
        assert_eq!(
            summary(&plan),
            vec!["delete vm/c-vm", "delete vdi/b-disk", "delete storage_repository/a-sr"]
        );
    }

    #[test]
    fn test_detach_runs_before_delete() {
        let before = vec![vdi("a-disk", "sr"), vm("vm1", &["a-disk"], &[])];
        let live: Vec<ActualState> = before.iter().map(converged).collect();

        let plan = diff(&[vm("vm1", &[], &[])], &live).unwrap();
        assert_eq!(summary(&plan), vec!["update vm/vm1", "delete vdi/a-disk"]);
    }

    #[test]
    fn test_unrelated_operations_sorted_by_key() {
        let wanted = vec![network("net-c", 1500), network("net-a", 1500), network("net-b", 1500)];
        let plan = diff(&wanted, &[]).unwrap();
        let keys: Vec<&str> = plan.iter().map(|op| op.key()).collect();
        assert_eq!(keys, vec!["net-a", "net-b", "net-c"]);
    }

    #[test]
    fn test_diff_is_deterministic() {
        let wanted = vec![
            vm("vm2", &["d2"], &["n1"]),
            vm("vm1", &["d1"], &["n1"]),
            vdi("d1", "s1"),
            vdi("d2", "s1"),
            sr("s1"),
            network("n1", 1500),
        ];
        let mut old = converged(&network("n0", 1500));
        old.managed = true;
        let live = vec![old];

        let first = diff(&wanted, &live).unwrap();
        for _ in 0..10 {
            assert_eq!(diff(&wanted, &live).unwrap(), first);
        }
        let mut reversed = wanted.clone();
        reversed.reverse();
        assert_eq!(diff(&reversed, &live).unwrap(), first);
    }

    #[test]
    fn test_cycle_is_plan_error() {
        let op = |key: &str, dep: &str| Operation {
            action: Action::Create,
            id: EntityId::new(EntityKind::Network, key),
            uuid: None,
            delta: Attributes::new(),
            spec: None,
            depends_on: vec![EntityId::new(EntityKind::Network, dep)],
        };
        match order(vec![op("a", "b"), op("b", "a"), op("c", "zzz")]) {
            Err(Error::Plan(msg)) => {
                assert!(msg.contains("network/a"));
                assert!(msg.contains("network/b"));
                assert!(!msg.contains("network/c"));
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }
}
