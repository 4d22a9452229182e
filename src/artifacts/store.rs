//! Artifact Store
//!
//! Shared, indexed storage for rendered artifacts and deployment manifests.
//! Writes are serialized behind one lock; artifacts are handed out as
//! `Arc<Artifact>` so the executor references them without copying.

use crate::artifacts::{Artifact, ArtifactType, DeploymentManifest};
use crate::error::{conflict_error, not_found_error, PipelineError, PipelineResult};
use crate::evidence::{EvidenceRecord, GeneratedChain, Stage};
use crate::persist::{read_json_dir, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Audit entry written when an artifact is removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalRecord {
    pub id: Uuid,
    pub artifact_id: Uuid,
    pub name: String,
    pub content_hash: String,
    pub actor: String,
    pub reason: String,
    pub removed_at: DateTime<Utc>,
}

impl RemovalRecord {
    pub fn evidence(&self) -> EvidenceRecord {
        EvidenceRecord::success(Stage::Artifacts, "artifact_manager", "remove_artifact")
            .with_input(json!({ "artifactId": self.artifact_id, "actor": self.actor }))
            .with_output(json!({ "reason": self.reason, "contentHash": self.content_hash }))
    }
}

#[derive(Default)]
struct Index {
    by_id: HashMap<Uuid, Arc<Artifact>>,
    by_type: HashMap<ArtifactType, Vec<Uuid>>,
    by_tag: HashMap<String, Vec<Uuid>>,
    manifests: HashMap<Uuid, DeploymentManifest>,
    removals: Vec<RemovalRecord>,
}

impl Index {
    fn insert(&mut self, artifact: Arc<Artifact>) {
        self.by_type
            .entry(artifact.artifact_type)
            .or_default()
            .push(artifact.id);
        for tag in &artifact.tags {
            self.by_tag.entry(tag.clone()).or_default().push(artifact.id);
        }
        self.by_id.insert(artifact.id, artifact);
    }

    fn remove(&mut self, id: Uuid) -> Option<Arc<Artifact>> {
        let artifact = self.by_id.remove(&id)?;
        if let Some(ids) = self.by_type.get_mut(&artifact.artifact_type) {
            ids.retain(|i| *i != id);
        }
        for tag in &artifact.tags {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.retain(|i| *i != id);
            }
        }
        Some(artifact)
    }

    fn resolve(&self, ids: Option<&Vec<Uuid>>) -> Vec<Arc<Artifact>> {
        ids.map(|ids| ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

/// Store for artifacts and manifests
#[derive(Clone)]
pub struct ArtifactManager {
    index: Arc<RwLock<Index>>,
    /// Root directory; `None` keeps everything in memory
    dir: Option<PathBuf>,
}

impl ArtifactManager {
    pub fn in_memory() -> Self {
        Self {
            index: Arc::new(RwLock::new(Index::default())),
            dir: None,
        }
    }

    /// Open a directory-backed store and reload its contents
    pub async fn open(dir: impl Into<PathBuf>) -> PipelineResult<Self> {
        let dir = dir.into();
        let mut index = Index::default();

        for (path, artifact) in read_json_dir::<Artifact>(&dir.join("artifacts")).await? {
            if !artifact.verify_hash() {
                warn!("Skipping artifact {} with mismatched hash", path.display());
                continue;
            }
            index.insert(Arc::new(artifact));
        }
        for (_, manifest) in read_json_dir::<DeploymentManifest>(&dir.join("manifests")).await? {
            index.manifests.insert(manifest.id, manifest);
        }
        let mut removals: Vec<RemovalRecord> = read_json_dir(&dir.join("removals"))
            .await?
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        removals.sort_by(|a, b| a.removed_at.cmp(&b.removed_at));
        index.removals = removals;

        info!(
            "Opened artifact store at {} ({} artifacts, {} manifests)",
            dir.display(),
            index.by_id.len(),
            index.manifests.len()
        );
        Ok(Self {
            index: Arc::new(RwLock::new(index)),
            dir: Some(dir),
        })
    }

    /// Store an artifact. Ids are never reused and hashes must match content.
    pub async fn store(&self, artifact: Artifact) -> PipelineResult<Arc<Artifact>> {
        if !artifact.verify_hash() {
            return Err(PipelineError::Conflict {
                message: format!("Artifact {} content does not match its hash", artifact.id),
            });
        }

        let mut index = self.index.write().await;
        if index.by_id.contains_key(&artifact.id) {
            return Err(conflict_error(format!("Artifact {} already stored", artifact.id)));
        }
        if let Some(dir) = &self.dir {
            write_json_atomic(
                &dir.join("artifacts").join(format!("{}.json", artifact.id)),
                &artifact,
            )
            .await?;
        }

        info!(
            "Stored artifact {} ({}, {})",
            artifact.name, artifact.artifact_type, artifact.content_hash
        );
        let artifact = Arc::new(artifact);
        index.insert(artifact.clone());
        Ok(artifact)
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Artifact>> {
        let index = self.index.read().await;
        index.by_id.get(&id).cloned()
    }

    pub async fn by_type(&self, artifact_type: ArtifactType) -> Vec<Arc<Artifact>> {
        let index = self.index.read().await;
        index.resolve(index.by_type.get(&artifact_type))
    }

    pub async fn by_tag(&self, tag: &str) -> Vec<Arc<Artifact>> {
        let index = self.index.read().await;
        index.resolve(index.by_tag.get(tag))
    }

    /// Every stored artifact, oldest first
    pub async fn list(&self) -> Vec<Arc<Artifact>> {
        let index = self.index.read().await;
        let mut all: Vec<_> = index.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        all
    }

    pub async fn count(&self) -> usize {
        self.index.read().await.by_id.len()
    }

    /// Remove an artifact on behalf of `actor`, leaving an audit record
    pub async fn remove(
        &self,
        id: Uuid,
        actor: impl Into<String>,
        reason: impl Into<String>,
    ) -> PipelineResult<RemovalRecord> {
        let mut index = self.index.write().await;
        let artifact = index
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found_error(format!("Artifact {} not found", id)))?;

        let record = RemovalRecord {
            id: Uuid::new_v4(),
            artifact_id: id,
            name: artifact.name.clone(),
            content_hash: artifact.content_hash.clone(),
            actor: actor.into(),
            reason: reason.into(),
            removed_at: Utc::now(),
        };

        if let Some(dir) = &self.dir {
            write_json_atomic(&dir.join("removals").join(format!("{}.json", record.id)), &record)
                .await?;
            let file = dir.join("artifacts").join(format!("{}.json", id));
            if let Err(e) = tokio::fs::remove_file(&file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        index.remove(id);
        index.removals.push(record.clone());
        info!("Removed artifact {} by {}: {}", id, record.actor, record.reason);
        Ok(record)
    }

    pub async fn removals(&self) -> Vec<RemovalRecord> {
        self.index.read().await.removals.clone()
    }

    pub async fn save_manifest(&self, manifest: DeploymentManifest) -> PipelineResult<()> {
        let mut index = self.index.write().await;
        if index.manifests.contains_key(&manifest.id) {
            return Err(conflict_error(format!("Manifest {} already stored", manifest.id)));
        }
        if let Some(dir) = &self.dir {
            write_json_atomic(&dir.join("manifests").join(format!("{}.json", manifest.id)), &manifest)
                .await?;
        }
        info!(
            "Saved manifest {} for run {} ({} artifacts)",
            manifest.id,
            manifest.run_id,
            manifest.artifacts.len()
        );
        index.manifests.insert(manifest.id, manifest);
        Ok(())
    }

    /// Build and store the manifest for a run's artifacts
    pub async fn generate_manifest(
        &self,
        run_id: Uuid,
        environment: &str,
        dry_run: bool,
        artifacts: &[Arc<Artifact>],
        chain: &GeneratedChain,
    ) -> PipelineResult<DeploymentManifest> {
        let manifest = DeploymentManifest::new(run_id, environment, dry_run, artifacts, chain);
        self.save_manifest(manifest.clone()).await?;
        Ok(manifest)
    }

    pub async fn get_manifest(&self, id: Uuid) -> Option<DeploymentManifest> {
        self.index.read().await.manifests.get(&id).cloned()
    }

    /// Manifests bound to an evidence chain
    pub async fn manifests_for_chain(&self, chain_id: Uuid) -> Vec<DeploymentManifest> {
        let index = self.index.read().await;
        index
            .manifests
            .values()
            .filter(|m| m.evidence_chain_id == chain_id)
            .cloned()
            .collect()
    }
}

impl Default for ArtifactManager {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceChain;

    fn artifact(name: &str, t: ArtifactType, tags: &[&str]) -> Artifact {
        Artifact::new(name, t, format!("content of {}", name), format!("{}.hbs", name))
            .with_tags(tags.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_indexes_by_id_type_and_tag() {
        let manager = ArtifactManager::in_memory();
        let a = manager.store(artifact("a", ArtifactType::File, &["web"])).await.unwrap();
        manager.store(artifact("b", ArtifactType::Script, &["web", "db"])).await.unwrap();
        manager.store(artifact("c", ArtifactType::File, &[])).await.unwrap();

        assert_eq!(manager.get(a.id).await.unwrap().name, "a");
        assert_eq!(manager.by_type(ArtifactType::File).await.len(), 2);
        assert_eq!(manager.by_tag("web").await.len(), 2);
        assert_eq!(manager.by_tag("db").await[0].name, "b");
        assert!(manager.by_tag("none").await.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_duplicates_and_bad_hashes() {
        let manager = ArtifactManager::in_memory();
        let original = artifact("a", ArtifactType::File, &[]);
        manager.store(original.clone()).await.unwrap();
        assert!(matches!(
            manager.store(original).await.unwrap_err(),
            PipelineError::Conflict { .. }
        ));

        let mut tampered = artifact("b", ArtifactType::File, &[]);
        tampered.content = "changed".to_string();
        assert!(manager.store(tampered).await.is_err());
    }

    #[tokio::test]
    async fn test_removal_is_explicit_and_audited() {
        let manager = ArtifactManager::in_memory();
        let a = manager.store(artifact("a", ArtifactType::File, &["web"])).await.unwrap();

        let record = manager.remove(a.id, "ops@example.com", "superseded").await.unwrap();
        assert_eq!(record.artifact_id, a.id);
        assert!(manager.get(a.id).await.is_none());
        assert!(manager.by_tag("web").await.is_empty());
        assert_eq!(manager.removals().await.len(), 1);
        assert_eq!(record.evidence().action, "remove_artifact");

        let err = manager.remove(a.id, "ops", "again").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (kept, removed, manifest_id, chain_id) = {
            let manager = ArtifactManager::open(dir.path()).await.unwrap();
            let kept = manager.store(artifact("kept", ArtifactType::File, &["x"])).await.unwrap();
            let removed = manager.store(artifact("gone", ArtifactType::File, &[])).await.unwrap();
            manager.remove(removed.id, "ops", "cleanup").await.unwrap();

            let chain = EvidenceChain::new().generate();
            let manifest =
                DeploymentManifest::new(Uuid::new_v4(), "dev", false, &[kept.clone()], &chain);
            let manifest_id = manifest.id;
            manager.save_manifest(manifest).await.unwrap();
            (kept.id, removed.id, manifest_id, chain.chain_id)
        };

        let reopened = ArtifactManager::open(dir.path()).await.unwrap();
        assert!(reopened.get(kept).await.is_some());
        assert!(reopened.get(removed).await.is_none());
        assert_eq!(reopened.by_tag("x").await.len(), 1);
        assert_eq!(reopened.removals().await.len(), 1);
        assert!(reopened.get_manifest(manifest_id).await.unwrap().verify());
        assert_eq!(reopened.manifests_for_chain(chain_id).await.len(), 1);
    }
}
