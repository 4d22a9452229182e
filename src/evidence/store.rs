//! Evidence Store
//!
//! Durable, append-only home of generated evidence chains. Chains are keyed
//! by chain id, never overwritten, and can be verified without re-running
//! the pipeline that produced them.

use crate::error::{conflict_error, not_found_error, PipelineResult};
use crate::evidence::chain::{ChainVerification, GeneratedChain};
use crate::persist::{read_json_dir, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lightweight listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSummary {
    pub chain_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    pub hash: String,
}

impl From<&GeneratedChain> for ChainSummary {
    fn from(chain: &GeneratedChain) -> Self {
        Self {
            chain_id: chain.chain_id,
            created_at: chain.created_at,
            record_count: chain.evidence.len(),
            hash: chain.hash.clone(),
        }
    }
}

/// Store for generated evidence chains
pub struct EvidenceStore {
    chains: Arc<RwLock<HashMap<Uuid, GeneratedChain>>>,
    /// Directory chains are persisted to; `None` keeps them in memory only
    dir: Option<PathBuf>,
}

impl EvidenceStore {
    pub fn in_memory() -> Self {
        Self {
            chains: Arc::new(RwLock::new(HashMap::new())),
            dir: None,
        }
    }

    /// Open a directory-backed store, loading previously persisted chains
    pub async fn open(dir: impl Into<PathBuf>) -> PipelineResult<Self> {
        let dir = dir.into();
        let mut chains = HashMap::new();
        for (_, chain) in read_json_dir::<GeneratedChain>(&dir).await? {
            chains.insert(chain.chain_id, chain);
        }
        tracing::info!("Opened evidence store at {} ({} chains)", dir.display(), chains.len());

        Ok(Self {
            chains: Arc::new(RwLock::new(chains)),
            dir: Some(dir),
        })
    }

    /// Persist a chain. Chains are immutable once stored.
    pub async fn save(&self, chain: GeneratedChain) -> PipelineResult<ChainSummary> {
        // Hold the write lock across the file write so concurrent saves serialize
        let mut chains = self.chains.write().await;
        if chains.contains_key(&chain.chain_id) {
            return Err(conflict_error(format!(
                "Evidence chain {} already stored",
                chain.chain_id
            )));
        }

        if let Some(dir) = &self.dir {
            write_json_atomic(&dir.join(format!("{}.json", chain.chain_id)), &chain).await?;
        }

        let summary = ChainSummary::from(&chain);
        tracing::info!(
            "Saved evidence chain {}: {} records, hash {}",
            summary.chain_id,
            summary.record_count,
            summary.hash
        );
        chains.insert(chain.chain_id, chain);
        Ok(summary)
    }

    pub async fn get(&self, chain_id: Uuid) -> Option<GeneratedChain> {
        let chains = self.chains.read().await;
        chains.get(&chain_id).cloned()
    }

    /// List stored chains, newest first
    pub async fn list(&self) -> Vec<ChainSummary> {
        let chains = self.chains.read().await;
        let mut list: Vec<_> = chains.values().map(ChainSummary::from).collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Verify a stored chain from its records alone
    pub async fn verify(&self, chain_id: Uuid) -> PipelineResult<ChainVerification> {
        let chain = self
            .get(chain_id)
            .await
            .ok_or_else(|| not_found_error(format!("Evidence chain {} not found", chain_id)))?;
        Ok(chain.verify())
    }

    pub async fn count(&self) -> usize {
        let chains = self.chains.read().await;
        chains.len()
    }
}

impl Default for EvidenceStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::evidence::chain::{EvidenceChain, EvidenceRecord, Stage};

    fn generated() -> GeneratedChain {
        let mut chain = EvidenceChain::new();
        chain.add(EvidenceRecord::success(Stage::Load, "loader", "read_file"));
        chain.add(EvidenceRecord::success(Stage::Parse, "parser", "parse"));
        chain.generate()
    }

    #[tokio::test]
    async fn test_save_and_verify() {
        let store = EvidenceStore::in_memory();
        let chain = generated();
        let id = chain.chain_id;
        store.save(chain).await.unwrap();

        let verification = store.verify(id).await.unwrap();
        assert!(verification.valid);
        assert_eq!(verification.verified_records, 2);
    }

    #[tokio::test]
    async fn test_chains_are_never_overwritten() {
        let store = EvidenceStore::in_memory();
        let chain = generated();
        store.save(chain.clone()).await.unwrap();
        let err = store.save(chain).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_persisted_chains_reload() {
        let dir = tempfile::tempdir().unwrap();
        let chain = generated();
        let id = chain.chain_id;
        {
            let store = EvidenceStore::open(dir.path()).await.unwrap();
            store.save(chain).await.unwrap();
        }

        let reopened = EvidenceStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.count().await, 1);
        assert!(reopened.verify(id).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_verify_unknown_chain() {
        let store = EvidenceStore::in_memory();
        let err = store.verify(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }
}
