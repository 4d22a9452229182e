//! Evidence Module
//!
//! The audit backbone of the pipeline:
//! - Evidence records (one per audited operation)
//! - Hash-chained, run-scoped evidence chains
//! - A durable store for generated chains with offline verification

pub mod chain;
pub mod store;

pub use chain::{
    compute_chain_hash, ChainVerification, EvidenceChain, EvidenceRecord, EvidenceStatus,
    GeneratedChain, Stage,
};
pub use store::{ChainSummary, EvidenceStore};
