//! Pipeline Module
//!
//! Drives a configuration run through its stages:
//!
//! 1. **Load**: read files from directory trees or git snapshots
//! 2. **Parse**: YAML/JSON into documents, then merge them under a strategy
//! 3. **Normalize**: environment overlay, schema defaults, reference resolution
//! 4. **Validate**: structural schema checks and naming rules
//! 5. **Govern**: policy rules whose verdict can veto the run
//! 6. **Render**: templates into immutable artifacts
//! 7. **Execute**: apply artifacts locally or remotely, rolling back on failure
//!
//! Every stage contributes to one hash-chained evidence chain per run.

pub mod orchestrator;
pub mod types;

pub use orchestrator::{run_pipeline, Pipeline};
pub use types::{PipelineOptions, PipelineRun, StageResult, StageStatus};
