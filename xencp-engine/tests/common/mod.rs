#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use xencp_engine::audit::AuditLogger;
use xencp_engine::mock::MockCluster;
use xencp_engine::{ApplyReport, CancelToken, DesiredState, Engine, PersistedRecord};

pub fn engine(cluster: &MockCluster) -> Engine {
    Engine::new(
        MockCluster::config(),
        cluster.transport(),
        cluster.connector(),
        Arc::new(AuditLogger::new_recording("it")),
    )
    .expect("engine")
}

pub fn state(value: Value) -> DesiredState {
    serde_json::from_value(value).expect("desired state")
}

/// Plan and apply once, returning the report and the records to persist.
pub async fn converge(engine: &Engine, desired: &[DesiredState], prior: &[PersistedRecord]) -> (ApplyReport, Vec<PersistedRecord>) {
    let plan = engine.plan(desired, prior).await.expect("plan");
    let report = engine.apply(plan, &CancelToken::new()).await;
    let records = report
        .applied
        .iter()
        .filter_map(|a| a.actual.as_ref())
        .map(|a| a.to_record())
        .collect();
    (report, records)
}

pub fn keys(operations: &[xencp_engine::Operation]) -> Vec<String> {
    operations.iter().map(|op| op.to_string()).collect()
}
