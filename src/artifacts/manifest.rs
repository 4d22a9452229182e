//! Deployment manifests

use crate::artifacts::{Artifact, ArtifactType};
use crate::evidence::GeneratedChain;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub content_hash: String,
    pub source_template: String,
}

impl From<&Artifact> for ManifestEntry {
    fn from(a: &Artifact) -> Self {
        Self {
            id: a.id,
            name: a.name.clone(),
            artifact_type: a.artifact_type,
            content_hash: a.content_hash.clone(),
            source_template: a.source_template.clone(),
        }
    }
}

/// The artifacts of one run, bound to the run's evidence chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentManifest {
    pub id: Uuid,
    pub run_id: Uuid,
    pub environment: String,
    pub created_at: DateTime<Utc>,
    pub dry_run: bool,
    pub artifacts: Vec<ManifestEntry>,
    pub evidence_chain_id: Uuid,
    pub evidence_chain_hash: String,
    /// SHA-256 over everything above except `id` and `createdAt`
    pub manifest_hash: String,
}

impl DeploymentManifest {
    pub fn new(
        run_id: Uuid,
        environment: impl Into<String>,
        dry_run: bool,
        artifacts: &[Arc<Artifact>],
        chain: &GeneratedChain,
    ) -> Self {
        let mut manifest = Self {
            id: Uuid::new_v4(),
            run_id,
            environment: environment.into(),
            created_at: Utc::now(),
            dry_run,
            artifacts: artifacts.iter().map(|a| ManifestEntry::from(a.as_ref())).collect(),
            evidence_chain_id: chain.chain_id,
            evidence_chain_hash: chain.hash.clone(),
            manifest_hash: String::new(),
        };
        manifest.manifest_hash = manifest.compute_hash();
        manifest
    }

    pub fn compute_hash(&self) -> String {
        #[derive(Serialize)]
        struct Digestible<'a> {
            run_id: &'a Uuid,
            environment: &'a str,
            dry_run: bool,
            artifacts: &'a [ManifestEntry],
            evidence_chain_id: &'a Uuid,
            evidence_chain_hash: &'a str,
        }

        let bytes = serde_json::to_vec(&Digestible {
            run_id: &self.run_id,
            environment: &self.environment,
            dry_run: self.dry_run,
            artifacts: &self.artifacts,
            evidence_chain_id: &self.evidence_chain_id,
            evidence_chain_hash: &self.evidence_chain_hash,
        })
        .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self) -> bool {
        self.compute_hash() == self.manifest_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceChain, EvidenceRecord, Stage};

    #[test]
    fn test_manifest_references_chain() {
        let mut chain = EvidenceChain::new();
        chain.add(EvidenceRecord::success(Stage::Render, "renderer", "render"));
        let generated = chain.generate();

        let artifact = Arc::new(Artifact::new("app.conf", ArtifactType::File, "x=1", "app.hbs"));
        let manifest = DeploymentManifest::new(Uuid::new_v4(), "prod", false, &[artifact.clone()], &generated);

        assert_eq!(manifest.evidence_chain_id, generated.chain_id);
        assert_eq!(manifest.evidence_chain_hash, generated.hash);
        assert_eq!(manifest.artifacts[0].content_hash, artifact.content_hash);
        assert!(manifest.verify());

        let mut tampered = manifest.clone();
        tampered.artifacts[0].content_hash = "0".repeat(64);
        assert!(!tampered.verify());
    }
}
