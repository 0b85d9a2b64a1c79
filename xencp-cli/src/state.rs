//! Local state file holding one record per managed entity.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use xencp_engine::model::SCHEMA_VERSION;
use xencp_engine::{ActualState, EntityId, PersistedRecord};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    records: Vec<PersistedRecord>,
}

/// Records persisted between runs, kept sorted by kind then key.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    records: Vec<PersistedRecord>,
}

impl StateFile {
    /// Load `path`, or start empty when it does not exist yet.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let doc: StateDocument = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse state file {}", path.display()))?;
                if doc.version > SCHEMA_VERSION {
                    bail!(
                        "State file {} has version {}, this build understands up to {}",
                        path.display(),
                        doc.version,
                        SCHEMA_VERSION
                    );
                }
                doc.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state file {}", path.display()));
            }
        };

        let mut state = Self { path, records };
        state.sort();
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[PersistedRecord] {
        &self.records
    }

    pub fn get(&self, id: &EntityId) -> Option<&PersistedRecord> {
        self.records.iter().find(|r| r.kind == id.kind && r.key == id.key)
    }

    /// Replace or add the record for a verified live state.
    pub fn upsert(&mut self, actual: &ActualState) {
        self.remove(&actual.id);
        self.records.push(actual.to_record());
        self.sort();
    }

    /// Rebuild from a fresh observation of every managed entity.
    pub fn replace<'a>(&mut self, observed: impl IntoIterator<Item = &'a ActualState>) {
        self.records = observed
            .into_iter()
            .filter(|a| a.managed)
            .map(ActualState::to_record)
            .collect();
        self.sort();
    }

    pub fn remove(&mut self, id: &EntityId) -> bool {
        let before = self.records.len();
        self.records.retain(|r| !(r.kind == id.kind && r.key == id.key));
        self.records.len() != before
    }

    /// Write the file atomically: a sibling temp file renamed into place.
    pub async fn save(&self) -> Result<()> {
        let doc = StateDocument {
            version: SCHEMA_VERSION,
            records: self.records.clone(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace state file {}", self.path.display()))?;
        Ok(())
    }

    fn sort(&mut self) {
        self.records
            .sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.key.cmp(&b.key)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xencp_engine::EntityKind;

    fn actual(kind: EntityKind, key: &str, uuid: &str) -> ActualState {
        ActualState {
            id: EntityId::new(kind, key),
            uuid: uuid.to_string(),
            managed: true,
            attributes: [("name_label".to_string(), json!(key))].into_iter().collect(),
            computed: Default::default(),
            references: vec![],
            incomplete: false,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::load(dir.path().join("absent.json")).await.unwrap();
        assert!(state.records().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xencp.state.json");

        let mut state = StateFile::load(&path).await.unwrap();
        state.upsert(&actual(EntityKind::Vm, "web", "u-1"));
        state.upsert(&actual(EntityKind::Network, "lan", "u-2"));
        state.save().await.unwrap();

        let reloaded = StateFile::load(&path).await.unwrap();
        let keys: Vec<&str> = reloaded.records().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["lan", "web"]);
        assert!(!dir.path().join("xencp.state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_remove_drops() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = StateFile::load(dir.path().join("s.json")).await.unwrap();
        state.upsert(&actual(EntityKind::Vdi, "d", "u-1"));
        state.upsert(&actual(EntityKind::Vdi, "d", "u-2"));
        assert_eq!(state.records().len(), 1);
        assert_eq!(state.records()[0].uuid, "u-2");

        let id = EntityId::new(EntityKind::Vdi, "d");
        assert!(state.remove(&id));
        assert!(!state.remove(&id));
        assert!(state.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_replace_keeps_only_managed() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = StateFile::load(dir.path().join("s.json")).await.unwrap();
        state.upsert(&actual(EntityKind::Vm, "old", "u-0"));

        let mut foreign = actual(EntityKind::Network, "foreign", "u-9");
        foreign.managed = false;
        let observed = [actual(EntityKind::Network, "lan", "u-1"), foreign];
        state.replace(&observed);

        let keys: Vec<&str> = state.records().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["lan"]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = StateFile::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse state file"));
    }

    #[tokio::test]
    async fn test_newer_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, br#"{"version": 99, "records": []}"#).unwrap();
        assert!(StateFile::load(&path).await.is_err());
    }
}
