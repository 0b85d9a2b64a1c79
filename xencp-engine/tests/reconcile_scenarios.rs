//! End-to-end reconciliation against the simulated cluster.

mod common;

use serde_json::json;
use tokio_test::assert_ok;
use xencp_engine::mock::{MOCK_TEMPLATE, MockCluster};
use xencp_engine::{Action, ApiError, CancelToken, EntityKind, Error};

use common::{converge, engine, keys, state};

fn nfs(key: &str) -> serde_json::Value {
    json!({
        "key": key, "kind": "storage_repository", "name_label": key, "type": "nfs", "shared": true,
        "device_config": {"server": "10.0.0.9", "serverpath": format!("/export/{}", key)}
    })
}

#[tokio::test(start_paused = true)]
async fn test_create_vm_then_plan_is_empty() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let desired = vec![state(json!({
        "key": "vm1", "kind": "vm", "name_label": "vm1", "template": MOCK_TEMPLATE,
        "vcpus": 2, "memory_static_max": 2147483648u64
    }))];

    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(keys(&plan.operations), vec!["create vm/vm1"]);

    let report = engine.apply(plan, &CancelToken::new()).await;
    assert!(report.is_success(), "{:?}", report.failed);
    let actual = assert_ok!(engine.observe(EntityKind::Vm, "vm1", None).await).unwrap();
    assert_eq!(actual.attributes["vcpus"], 2);

    let again = assert_ok!(engine.plan(&desired, &[]).await);
    assert!(again.is_empty(), "{:?}", again);
}

#[tokio::test(start_paused = true)]
async fn test_delete_sr_in_use_keeps_prior_operations() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let disk = state(json!({"key": "disk", "kind": "vdi", "name_label": "disk", "sr": "sr1", "virtual_size": 1048576}));
    let vm = state(json!({
        "key": "vm1", "kind": "vm", "name_label": "vm1", "template": MOCK_TEMPLATE,
        "vcpus": 1, "memory_static_max": 1073741824, "disks": [{"vdi": "disk"}]
    }));
    let (report, _) = converge(&engine, &[state(nfs("sr1")), disk.clone(), vm.clone()], &[]).await;
    assert!(report.is_success(), "{:?}", report.failed);

    let lan = state(json!({"key": "lan", "kind": "network", "name_label": "lan"}));
    let desired = vec![lan, disk, vm];
    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(keys(&plan.operations), vec!["create network/lan", "delete storage_repository/sr1"]);

    let report = engine.apply(plan, &CancelToken::new()).await;
    assert_eq!(report.applied.len(), 1);
    let (failed, err) = report.failed.as_ref().unwrap();
    assert_eq!(failed.action, Action::Delete);
    assert!(err.is_conflict(), "{}", err);
    assert!(cluster.find("network", "name_label", "lan").is_some());

    // The next cycle resumes with only the failed delete.
    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(keys(&plan.operations), vec!["delete storage_repository/sr1"]);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_partial_failure() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let (_, local) = cluster.find("SR", "name_label", "Local storage").unwrap();
    let desired = vec![
        state(json!({"key": "a", "kind": "network", "name_label": "a"})),
        state(json!({"key": "b", "kind": "network", "name_label": "b"})),
        state(json!({"key": "c", "kind": "vdi", "name_label": "c", "sr": local["uuid"], "virtual_size": 4096})),
        state(json!({"key": "d", "kind": "network", "name_label": "d"})),
    ];
    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(plan.len(), 4);

    cluster.inject("Async.VDI.create", ApiError::code("INTERNAL_ERROR", &["backend"]), 1);
    let report = engine.apply(plan.clone(), &CancelToken::new()).await;
    assert_eq!(report.applied.len(), 2);
    assert!(matches!(report.failed.as_ref().unwrap().1.root(), Error::RemoteInternal(_)));

    let resumed = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(resumed.len(), 2);
    for (expected, actual) in plan.operations[2..].iter().zip(resumed.iter()) {
        assert!(expected.same_change(actual), "{} != {}", expected, actual);
    }

    let report = engine.apply(resumed, &CancelToken::new()).await;
    assert!(report.is_success());
    assert!(assert_ok!(engine.plan(&desired, &[]).await).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_plan_is_deterministic() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let desired = vec![
        state(json!({"key": "web", "kind": "vm", "name_label": "web", "template": MOCK_TEMPLATE,
                     "vcpus": 1, "memory_static_max": 1073741824,
                     "interfaces": [{"network": "lan", "device": 0}]})),
        state(json!({"key": "lan", "kind": "network", "name_label": "lan"})),
        state(nfs("store")),
        state(json!({"key": "data", "kind": "vdi", "name_label": "data", "sr": "store", "virtual_size": 4096})),
    ];

    let first = assert_ok!(engine.plan(&desired, &[]).await);
    let mut reversed = desired.clone();
    reversed.reverse();
    let second = assert_ok!(engine.plan(&reversed, &[]).await);
    assert_eq!(first, second);
    assert_eq!(
        keys(&first.operations),
        vec![
            "create network/lan",
            "create storage_repository/store",
            "create vdi/data",
            "create vm/web",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_full_stack_converges() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let desired = vec![
        state(json!({"key": "main", "kind": "pool", "name_label": "prod", "default_sr": "store"})),
        state(nfs("store")),
        state(json!({"key": "lan", "kind": "network", "name_label": "lan", "mtu": 9000,
                     "other_config": {"owner": "ops"}})),
        state(json!({"key": "data", "kind": "vdi", "name_label": "data", "sr": "store", "virtual_size": 1073741824u64})),
        state(json!({"key": "web", "kind": "vm", "name_label": "web", "template": MOCK_TEMPLATE,
                     "vcpus": 2, "memory_static_max": 2147483648u64, "power_state": "running",
                     "disks": [{"vdi": "data"}],
                     "interfaces": [{"network": "lan", "device": 0}]})),
        state(json!({"key": "web-snap", "kind": "snapshot", "name_label": "web-snap", "vm": "web"})),
    ];

    let (report, records) = converge(&engine, &desired, &[]).await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(records.len(), 6);

    let plan = assert_ok!(engine.plan(&desired, &records).await);
    assert!(plan.is_empty(), "{:?}", keys(&plan.operations));

    // Tearing everything down deletes dependents first.
    let plan = assert_ok!(engine.plan(&[], &records).await);
    let order = keys(&plan.operations);
    let position = |op: &str| order.iter().position(|o| o == op).unwrap();
    assert!(position("delete snapshot/web-snap") < position("delete vm/web"));
    assert!(position("delete vm/web") < position("delete vdi/data"));
    assert!(position("delete vdi/data") < position("delete storage_repository/store"));
    assert!(position("delete pool/main") < position("delete storage_repository/store"));

    let report = engine.apply(plan, &CancelToken::new()).await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert!(assert_ok!(engine.plan(&[], &[]).await).is_empty());
    assert!(!engine.coordinator().is_held());
}

#[tokio::test(start_paused = true)]
async fn test_immutable_change_is_rejected_at_plan_time() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let (_, local) = cluster.find("SR", "name_label", "Local storage").unwrap();
    let disk = json!({"key": "d", "kind": "vdi", "name_label": "d", "sr": local["uuid"], "virtual_size": 4096});
    let (report, _) = converge(&engine, &[state(disk.clone())], &[]).await;
    assert!(report.is_success());

    let mut bigger = disk;
    bigger["virtual_size"] = json!(8192);
    let err = engine.plan(&[state(bigger)], &[]).await.unwrap_err();
    assert!(matches!(err, Error::Immutable { ref attribute, .. } if attribute == "virtual_size"));
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_is_transparent() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let lan = vec![state(json!({"key": "lan", "kind": "network", "name_label": "lan"}))];
    let (report, _) = converge(&engine, &lan, &[]).await;
    assert!(report.is_success());
    let logins = cluster.login_count();

    cluster.expire_sessions();
    assert!(assert_ok!(engine.plan(&lan, &[]).await).is_empty());
    assert_eq!(cluster.login_count(), logins + 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_tasks_are_polled_to_completion() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    cluster.set_task_latency(5);
    let (_, local) = cluster.find("SR", "name_label", "Local storage").unwrap();
    let disk = vec![state(json!({"key": "d", "kind": "vdi", "name_label": "d", "sr": local["uuid"], "virtual_size": 4096}))];

    let (report, records) = converge(&engine, &disk, &[]).await;
    assert!(report.is_success());
    assert!(cluster.call_count("task.get_record") >= 5);
    assert_eq!(records[0].attributes["virtual_size"], 4096);
}

fn vm1(power_state: &str) -> serde_json::Value {
    json!({
        "key": "vm1", "kind": "vm", "name_label": "vm1", "template": MOCK_TEMPLATE,
        "vcpus": 1, "memory_static_max": 1073741824, "power_state": power_state
    })
}

#[tokio::test(start_paused = true)]
async fn test_failed_provision_is_finished_next_cycle() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let desired = vec![state(vm1("running"))];
    cluster.inject("Async.VM.provision", ApiError::code("INTERNAL_ERROR", &["disk full"]), 1);

    let (report, _) = converge(&engine, &desired, &[]).await;
    assert!(report.failed.is_some());
    let (clone_ref, clone) = cluster.find("VM", "name_label", "vm1").unwrap();
    assert_eq!(clone["is_a_template"], true);

    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(keys(&plan.operations), vec!["create vm/vm1"]);
    assert_eq!(plan.operations[0].uuid.as_deref(), clone["uuid"].as_str());

    let report = engine.apply(plan, &CancelToken::new()).await;
    assert!(report.is_success(), "{:?}", report.failed);
    let (vm_ref, vm) = cluster.find("VM", "name_label", "vm1").unwrap();
    assert_eq!(vm_ref, clone_ref);
    assert_eq!(vm["is_a_template"], false);
    assert_eq!(vm["power_state"], "Running");
    assert_eq!(cluster.call_count("Async.VM.clone"), 1);

    assert!(assert_ok!(engine.plan(&desired, &[]).await).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_boot_is_retried_as_update() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let desired = vec![state(vm1("running"))];
    cluster.inject("Async.VM.start", ApiError::code("HOST_NOT_ENOUGH_FREE_MEMORY", &["1073741824", "0"]), 1);

    let (report, _) = converge(&engine, &desired, &[]).await;
    assert!(report.failed.is_some());

    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(keys(&plan.operations), vec!["update vm/vm1"]);
    assert_eq!(plan.operations[0].delta.keys().collect::<Vec<_>>(), vec!["power_state"]);

    let report = engine.apply(plan, &CancelToken::new()).await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert!(assert_ok!(engine.plan(&desired, &[]).await).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_vlan_is_finished_next_cycle() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let desired = vec![state(json!({
        "key": "storage", "kind": "network", "name_label": "storage", "vlan": {"nic": "eth1", "tag": 42}
    }))];
    cluster.inject("pool.create_VLAN_from_PIF", ApiError::code("INTERNAL_ERROR", &["vlan"]), 1);

    let (report, _) = converge(&engine, &desired, &[]).await;
    assert!(report.failed.is_some());
    assert!(cluster.records("VLAN").is_empty());

    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(keys(&plan.operations), vec!["create network/storage"]);
    assert!(plan.operations[0].uuid.is_some());

    let report = engine.apply(plan, &CancelToken::new()).await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(cluster.records("VLAN").len(), 1);
    assert_eq!(cluster.call_count("Async.network.create"), 1);
    assert!(assert_ok!(engine.plan(&desired, &[]).await).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unplugged_sr_is_replugged() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let desired = vec![state(nfs("store"))];
    let (report, _) = converge(&engine, &desired, &[]).await;
    assert!(report.is_success(), "{:?}", report.failed);

    let (sr_ref, _) = cluster.find("SR", "name_label", "store").unwrap();
    let (pbd_ref, _) = cluster.find("PBD", "SR", &sr_ref).unwrap();
    cluster.set_field("PBD", &pbd_ref, "currently_attached", json!(false)).unwrap();
    cluster.inject("PBD.plug", ApiError::code("SR_BACKEND_FAILURE_73", &["", "NFS mount error", ""]), 1);

    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(keys(&plan.operations), vec!["create storage_repository/store"]);
    let report = engine.apply(plan, &CancelToken::new()).await;
    assert!(report.failed.is_some());

    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(keys(&plan.operations), vec!["create storage_repository/store"]);
    let report = engine.apply(plan, &CancelToken::new()).await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(cluster.records("SR").iter().filter(|(_, sr)| sr["name_label"] == "store").count(), 1);
    assert!(assert_ok!(engine.plan(&desired, &[]).await).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_creates_verify_without_task_records() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    cluster.set_vanishing_tasks(true);
    let desired = vec![
        state(nfs("store")),
        state(json!({"key": "storage", "kind": "network", "name_label": "storage",
                     "vlan": {"nic": "eth1", "tag": 42}})),
        state(json!({"key": "web", "kind": "vm", "name_label": "web", "template": MOCK_TEMPLATE,
                     "vcpus": 1, "memory_static_max": 1073741824, "power_state": "running",
                     "interfaces": [{"network": "storage", "device": 0}]})),
    ];

    let (report, records) = converge(&engine, &desired, &[]).await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(records.len(), 3);
    assert!(cluster.call_count("task.get_record") > 0);
    assert!(assert_ok!(engine.plan(&desired, &records).await).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pif_settings_and_snapshot_revert_converge() {
    let cluster = MockCluster::new();
    let engine = engine(&cluster);
    let (_, eth1) = cluster.find("PIF", "device", "eth1").unwrap();
    let pif = state(json!({
        "key": "storage-nic", "kind": "pif_configuration", "pif": eth1["uuid"], "disallow_unplug": true,
        "interface": {"mode": "static", "ip": "10.0.0.5", "netmask": "255.255.255.0"}
    }));
    let snapshot = |revert: bool| {
        state(json!({
            "key": "before", "kind": "snapshot", "name_label": "before", "vm": "vm1", "revert": revert
        }))
    };
    let desired = vec![pif.clone(), state(vm1("running")), snapshot(false)];

    let (report, _) = converge(&engine, &desired, &[]).await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert!(assert_ok!(engine.plan(&desired, &[]).await).is_empty());

    let desired = vec![pif, state(vm1("running")), snapshot(true)];
    let plan = assert_ok!(engine.plan(&desired, &[]).await);
    assert_eq!(keys(&plan.operations), vec!["update snapshot/before"]);
    let report = engine.apply(plan, &CancelToken::new()).await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(cluster.call_count("Async.VM.revert"), 1);
    assert!(assert_ok!(engine.plan(&desired, &[]).await).is_empty());
}
