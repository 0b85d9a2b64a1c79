//! Desired-state manifests.
//!
//! A manifest is a JSON document holding either a bare array of resources
//! or an object with a `resources` array. Each resource carries `key`,
//! `kind` and the attributes of that kind.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use xencp_engine::DesiredState;

#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    List(Vec<DesiredState>),
    Document { resources: Vec<DesiredState> },
}

pub async fn load(path: &Path) -> Result<Vec<DesiredState>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    parse(&bytes).with_context(|| format!("Invalid manifest {}", path.display()))
}

pub fn parse(bytes: &[u8]) -> Result<Vec<DesiredState>> {
    let resources = match serde_json::from_slice(bytes)? {
        Manifest::List(resources) => resources,
        Manifest::Document { resources } => resources,
    };

    let mut seen = BTreeSet::new();
    for resource in &resources {
        if !seen.insert(resource.id()) {
            bail!("{} is declared more than once", resource.id());
        }
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xencp_engine::EntityKind;

    #[test]
    fn test_bare_array() {
        let resources = parse(br#"[{"key": "lan", "kind": "network", "name_label": "lan"}]"#).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].kind(), EntityKind::Network);
    }

    #[test]
    fn test_resources_document() {
        let resources = parse(
            br#"{"resources": [
                {"key": "lan", "kind": "network", "name_label": "lan"},
                {"key": "lan", "kind": "vdi", "name_label": "lan", "sr": "store", "virtual_size": 4096}
            ]}"#,
        )
        .unwrap();
        assert_eq!(resources.len(), 2);
    }

    #[test]
    fn test_duplicate_resource_is_rejected() {
        let err = parse(
            br#"[{"key": "lan", "kind": "network", "name_label": "a"},
                 {"key": "lan", "kind": "network", "name_label": "b"}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("network/lan"));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(parse(br#"[{"key": "x", "kind": "router"}]"#).is_err());
    }
}
