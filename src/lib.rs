//! ConfigFlow - declarative configuration pipeline
//!
//! Loads configuration from directories or git, merges and normalizes it,
//! validates and governs the result, renders artifacts and applies them with
//! rollback. Every step is recorded in a verifiable evidence chain.

pub mod artifacts;
pub mod cancel;
pub mod config;
pub mod document;
pub mod error;
pub mod evidence;
pub mod executor;
pub mod governance;
pub mod loader;
pub mod normalizer;
pub mod parser;
pub mod persist;
pub mod pipeline;
pub mod references;
pub mod renderer;
pub mod validator;

pub use artifacts::{Artifact, ArtifactManager, ArtifactType, DeploymentManifest};
pub use cancel::CancellationToken;
pub use config::Settings;
pub use document::ConfigDocument;
pub use error::{PipelineError, PipelineResult};
pub use evidence::{EvidenceChain, EvidenceRecord, EvidenceStore, GeneratedChain};
pub use executor::{Environment, RemoteHost};
pub use loader::{MergeStrategy, SourceRef};
pub use pipeline::{run_pipeline, Pipeline, PipelineOptions, PipelineRun, StageResult, StageStatus};
