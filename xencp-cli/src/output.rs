use std::collections::BTreeMap;

use serde_json::Value;
use tabled::{Table, Tabled};
use xencp_engine::engine::Diagnostic;
use xencp_engine::{ActualState, ApplyReport, Operation, PersistedRecord, Plan};

#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "ACTION")]
    action: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "KEY")]
    key: String,
    #[tabled(rename = "UUID")]
    uuid: String,
    #[tabled(rename = "CHANGES")]
    changes: String,
}

impl From<&Operation> for OperationRow {
    fn from(op: &Operation) -> Self {
        let changes: Vec<&str> = op.delta.keys().map(String::as_str).collect();
        Self {
            action: op.action.to_string(),
            kind: op.kind().to_string(),
            key: op.key().to_string(),
            uuid: op.uuid.clone().unwrap_or_else(|| "-".to_string()),
            changes: if changes.is_empty() { "-".to_string() } else { changes.join(", ") },
        }
    }
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "KEY")]
    key: String,
    #[tabled(rename = "UUID")]
    uuid: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "UPDATED")]
    updated: String,
}

impl From<&PersistedRecord> for RecordRow {
    fn from(record: &PersistedRecord) -> Self {
        Self {
            kind: record.kind.to_string(),
            key: record.key.clone(),
            uuid: record.uuid.clone(),
            name: name_of(&record.attributes),
            updated: record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Tabled)]
struct EntityRow {
    #[tabled(rename = "UUID")]
    uuid: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "MANAGED")]
    managed: String,
}

#[derive(Tabled)]
struct AttributeRow {
    #[tabled(rename = "ATTRIBUTE")]
    name: String,
    #[tabled(rename = "VALUE")]
    value: String,
}

fn name_of(attributes: &BTreeMap<String, Value>) -> String {
    attributes
        .get("name_label")
        .and_then(Value::as_str)
        .unwrap_or("-")
        .to_string()
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn print_plan(plan: &Plan) {
    if plan.is_empty() {
        println!("No changes. Live state matches the manifest.");
        return;
    }
    let rows: Vec<OperationRow> = plan.iter().map(OperationRow::from).collect();
    println!("{}", Table::new(rows));
    let (create, update, delete) = plan.counts();
    println!("Plan: {} to create, {} to update, {} to delete.", create, update, delete);
}

pub fn print_report(report: &ApplyReport) {
    println!("Applied {} operation(s).", report.applied.len());
    if let Some((op, err)) = &report.failed {
        eprintln!("Error: {} failed: {}", op, err);
        if !report.pending.is_empty() {
            let rows: Vec<OperationRow> = report.pending.iter().map(OperationRow::from).collect();
            eprintln!("Not attempted:");
            eprintln!("{}", Table::new(rows));
        }
    }
}

pub fn print_records(records: &[&PersistedRecord]) {
    if records.is_empty() {
        println!("No managed entities recorded.");
        return;
    }
    let rows: Vec<RecordRow> = records.iter().map(|r| RecordRow::from(*r)).collect();
    println!("{}", Table::new(rows));
}

/// Attribute table for one live entity.
pub fn print_actual(actual: &ActualState) {
    println!("{} ({})", actual.id, actual.uuid);
    if actual.incomplete {
        println!("Creation did not finish; the next apply completes it.");
    }
    let rows: Vec<AttributeRow> = actual
        .attributes
        .iter()
        .chain(actual.computed.iter())
        .map(|(name, value)| AttributeRow {
            name: name.clone(),
            value: render(value),
        })
        .collect();
    println!("{}", Table::new(rows));
}

/// Raw objects of one class; `managed` holds the uuids under management.
pub fn print_entities(entities: &[BTreeMap<String, Value>], managed: &[String]) {
    let mut rows: Vec<EntityRow> = entities
        .iter()
        .map(|fields| {
            let uuid = fields.get("uuid").map(render).unwrap_or_default();
            EntityRow {
                managed: if managed.contains(&uuid) { "yes" } else { "no" }.to_string(),
                name: name_of(fields),
                uuid,
            }
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.uuid.cmp(&b.uuid)));
    println!("{}", Table::new(rows));
}

pub fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        eprintln!("{:?}: {}", diagnostic.severity, diagnostic.summary);
        eprintln!("  {}", diagnostic.detail);
    }
}
