//! Orchestrator - runs the stages of one configuration run
//!
//! Stages run strictly in order. After each stage the driver records its
//! evidence and a boundary record, then decides whether the run continues:
//! it halts on an error, on warnings unless `continue_on_warning` is set, on
//! a governance veto and on cancellation. The evidence chain is sealed and
//! persisted whatever the outcome.

use crate::artifacts::{Artifact, ArtifactManager, DeploymentManifest};
use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::document::ConfigDocument;
use crate::error::{PipelineError, PipelineResult};
use crate::evidence::{EvidenceChain, EvidenceRecord, EvidenceStore, Stage};
use crate::executor::{Environment, ExecuteOptions, Executor};
use crate::governance::{GovernanceContext, GovernanceEngine, Rule};
use crate::loader::{DocumentMerger, Loader, SourceRef};
use crate::normalizer::Normalizer;
use crate::parser::Parser;
use crate::pipeline::types::{PipelineOptions, PipelineRun, StageResult, StageStatus};
use crate::renderer::{RenderBatch, Renderer, Template};
use crate::validator::{Schema, Validator};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

const COMPONENT: &str = "pipeline";

/// Whether the run goes past a stage boundary
enum Flow {
    Continue(StageResult),
    Halt(StageResult),
}

/// Mutable state of one run
struct RunContext {
    run_id: Uuid,
    started: Instant,
    chain: EvidenceChain,
    completed: Vec<String>,
    halted_at: Option<String>,
    continue_on_warning: bool,
    cancel: CancellationToken,
    environment: String,
    dry_run: bool,
    artifacts: Vec<Arc<Artifact>>,
}

impl RunContext {
    /// Record a stage's evidence and decide whether the run continues
    fn gate(&mut self, result: StageResult) -> Flow {
        self.chain.extend(result.evidence());
        let name = result.name();
        let status = result.status();

        let reason = if status.is_error() {
            let first = result
                .errors()
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "stage failed".to_string());
            Some(format!("{} failed: {}", name, first))
        } else if matches!(&result, StageResult::Govern(g) if !g.passed) {
            Some("governance veto".to_string())
        } else if status == StageStatus::Warning && !self.continue_on_warning {
            Some(format!("{} finished with warnings", name))
        } else if self.cancel.is_cancelled() {
            Some("run cancelled".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => {
                warn!("Run {} halted at {}: {}", self.run_id, name, reason);
                self.chain.add(
                    EvidenceRecord::error(Stage::Pipeline, COMPONENT, "halt")
                        .with_input(json!({ "stage": name, "status": status }))
                        .with_output(json!({ "reason": reason, "errors": result.errors() })),
                );
                self.halted_at = Some(name.to_string());
                Flow::Halt(result)
            }
            None => {
                info!("Run {}: {} {:?}", self.run_id, name, status);
                self.chain.add(
                    EvidenceRecord::new(Stage::Pipeline, COMPONENT, "stage_complete", status.into())
                        .with_input(json!({ "stage": name }))
                        .with_output(result.summary()),
                );
                self.completed.push(name.to_string());
                Flow::Continue(result)
            }
        }
    }

    /// Halt outside a stage result (artifact storage failures)
    fn halt(&mut self, stage: &str, error: &PipelineError) {
        warn!("Run {} halted at {}: {}", self.run_id, stage, error);
        self.chain.add(
            EvidenceRecord::error(Stage::Pipeline, COMPONENT, "halt")
                .with_input(json!({ "stage": stage }))
                .with_error(error),
        );
        self.halted_at = Some(stage.to_string());
    }
}

/// Unwrap the expected variant after a gate, or finish the run
macro_rules! proceed {
    ($self:ident, $ctx:ident, $result:expr, $variant:ident) => {
        match $ctx.gate($result) {
            Flow::Continue(StageResult::$variant(r)) => r,
            Flow::Continue(other) | Flow::Halt(other) => return $self.finish($ctx, other).await,
        }
    };
}

/// The configuration pipeline and the shared stores it writes to
pub struct Pipeline {
    loader: Loader,
    parser: Parser,
    schema: Option<Arc<Schema>>,
    governance: GovernanceEngine,
    governance_context: Option<GovernanceContext>,
    templates: Vec<Template>,
    renderer: Renderer,
    executor: Executor,
    artifacts: ArtifactManager,
    evidence: Arc<EvidenceStore>,
}

impl Pipeline {
    /// Pipeline with memory-only stores
    pub fn new(settings: &Settings) -> Self {
        Self {
            loader: Loader::new(settings.loader.clone()),
            parser: Parser::new(),
            schema: None,
            governance: GovernanceEngine::default(),
            governance_context: None,
            templates: Vec::new(),
            renderer: Renderer::new(),
            executor: Executor::new(settings.executor.clone()),
            artifacts: ArtifactManager::in_memory(),
            evidence: Arc::new(EvidenceStore::in_memory()),
        }
    }

    /// Pipeline whose stores are opened from the configured directories
    pub async fn from_settings(settings: &Settings) -> PipelineResult<Self> {
        let mut pipeline = Self::new(settings);
        if let Some(dir) = &settings.storage.evidence_dir {
            pipeline.evidence = Arc::new(EvidenceStore::open(dir.clone()).await?);
        }
        if let Some(dir) = &settings.storage.artifact_dir {
            pipeline.artifacts = ArtifactManager::open(dir.clone()).await?;
        }
        Ok(pipeline)
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        for rule in rules {
            self.governance.add_rule(rule);
        }
        self
    }

    pub fn with_governance_context(mut self, context: GovernanceContext) -> Self {
        self.governance_context = Some(context);
        self
    }

    pub fn with_templates(mut self, templates: Vec<Template>) -> Self {
        self.templates.extend(templates);
        self
    }

    pub fn with_artifact_manager(mut self, artifacts: ArtifactManager) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_evidence_store(mut self, evidence: Arc<EvidenceStore>) -> Self {
        self.evidence = evidence;
        self
    }

    /// Register predicates or further rules
    pub fn governance_mut(&mut self) -> &mut GovernanceEngine {
        &mut self.governance
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    pub fn evidence_store(&self) -> &Arc<EvidenceStore> {
        &self.evidence
    }

    /// Run every stage for `source` against `environment`
    pub async fn run(
        &self,
        source: &SourceRef,
        environment: &Environment,
        options: PipelineOptions,
        cancel: CancellationToken,
    ) -> PipelineRun {
        let mut ctx = RunContext {
            run_id: Uuid::new_v4(),
            started: Instant::now(),
            chain: EvidenceChain::new(),
            completed: Vec::new(),
            halted_at: None,
            continue_on_warning: options.continue_on_warning,
            cancel: cancel.clone(),
            environment: environment.name.clone(),
            dry_run: options.dry_run,
            artifacts: Vec::new(),
        };
        info!(
            "Starting run {} for {} in environment '{}'{}",
            ctx.run_id,
            source.describe(),
            environment.name,
            if options.dry_run { " (dry run)" } else { "" }
        );
        ctx.chain.add(
            EvidenceRecord::success(Stage::Pipeline, COMPONENT, "start")
                .with_input(json!({
                    "runId": ctx.run_id,
                    "source": source,
                    "environment": environment.name,
                    "options": options,
                })),
        );

        // Load
        let load = proceed!(self, ctx, StageResult::Load(self.loader.load(source).await), Load);

        // Parse
        let parsed = proceed!(self, ctx, StageResult::Parse(self.parser.parse_all(&load.files)), Parse);

        // Merge
        let merger = DocumentMerger::new(options.merge_strategy, options.conflict_resolver.clone());
        let merged = proceed!(self, ctx, StageResult::Merge(merger.merge(parsed.documents)), Merge);

        // Normalize
        let normalizer = Normalizer::new(self.schema.clone());
        let normalized = proceed!(
            self,
            ctx,
            StageResult::Normalize(
                normalizer.normalize(&merged.data, options.environment_overlay.as_ref())
            ),
            Normalize
        );
        let document = normalized.data.unwrap_or_else(ConfigDocument::empty);

        // Validate
        let validation = match &self.schema {
            Some(schema) => Validator::new().validate(&document, schema),
            None => Validator::new().skipped(&document),
        };
        proceed!(self, ctx, StageResult::Validate(validation), Validate);

        // Govern
        proceed!(
            self,
            ctx,
            StageResult::Govern(self.governance.enforce(
                &document,
                &environment.name,
                self.governance_context.as_ref()
            )),
            Govern
        );

        // Render
        let rendered = proceed!(
            self,
            ctx,
            StageResult::Render(
                self.renderer
                    .render_all(&self.templates, &document, !options.dry_run)
                    .await
            ),
            Render
        );

        if let Err(e) = self.store_artifacts(&mut ctx, &rendered).await {
            ctx.halt("artifacts", &e);
            return self.finish(ctx, StageResult::Render(rendered)).await;
        }

        // Execute
        let batch = self
            .executor
            .execute_all(
                &ctx.artifacts,
                environment,
                &ExecuteOptions::from(&options),
                &cancel,
            )
            .await;
        let result = match ctx.gate(StageResult::Execute(batch)) {
            Flow::Continue(r) | Flow::Halt(r) => r,
        };
        self.finish(ctx, result).await
    }

    async fn store_artifacts(&self, ctx: &mut RunContext, rendered: &RenderBatch) -> PipelineResult<()> {
        for result in &rendered.results {
            let Some(content) = &result.content else {
                continue;
            };
            let artifact = Artifact::new(
                result.template.clone(),
                result.artifact_type,
                content.clone(),
                result.template.clone(),
            )
            .with_tags(result.tags.clone())
            .with_directives(result.directives.clone())
            .with_run_id(ctx.run_id);

            let stored = self.artifacts.store(artifact).await?;
            ctx.chain.add(
                EvidenceRecord::success(Stage::Artifacts, "artifact_manager", "store_artifact")
                    .with_input(json!({ "template": result.template }))
                    .with_output(json!({
                        "artifactId": stored.id,
                        "type": stored.artifact_type,
                        "contentHash": stored.content_hash,
                    })),
            );
            ctx.artifacts.push(stored);
        }
        Ok(())
    }

    /// Seal the chain, persist it and bind a manifest to it
    async fn finish(&self, mut ctx: RunContext, final_result: StageResult) -> PipelineRun {
        let duration_ms = ctx.started.elapsed().as_millis() as u64;
        let succeeded = ctx.halted_at.is_none() && !final_result.status().is_error();
        let record = if succeeded {
            EvidenceRecord::success(Stage::Pipeline, COMPONENT, "complete")
        } else {
            EvidenceRecord::error(Stage::Pipeline, COMPONENT, "complete")
        };
        ctx.chain.add(
            record
                .with_output(json!({
                    "completed": ctx.completed,
                    "haltedAt": ctx.halted_at,
                    "artifacts": ctx.artifacts.len(),
                }))
                .with_metric("duration_ms", duration_ms),
        );

        let evidence_chain = ctx.chain.generate();
        if let Err(e) = self.evidence.save(evidence_chain.clone()).await {
            error!("Failed to persist evidence chain {}: {}", evidence_chain.chain_id, e);
        }

        let manifest: Option<DeploymentManifest> = if ctx.artifacts.is_empty() {
            None
        } else {
            match self
                .artifacts
                .generate_manifest(
                    ctx.run_id,
                    &ctx.environment,
                    ctx.dry_run,
                    &ctx.artifacts,
                    &evidence_chain,
                )
                .await
            {
                Ok(manifest) => Some(manifest),
                Err(e) => {
                    error!("Failed to store manifest for run {}: {}", ctx.run_id, e);
                    None
                }
            }
        };

        if succeeded {
            info!(
                "Run {} completed in {}ms: {} records, chain hash {}",
                ctx.run_id,
                duration_ms,
                evidence_chain.evidence.len(),
                evidence_chain.hash
            );
        } else {
            warn!(
                "Run {} did not complete (halted at {})",
                ctx.run_id,
                ctx.halted_at.as_deref().unwrap_or(final_result.name())
            );
        }

        PipelineRun {
            run_id: ctx.run_id,
            final_result,
            evidence_chain,
            completed: ctx.completed,
            halted_at: ctx.halted_at,
            artifacts: ctx.artifacts,
            manifest,
        }
    }
}

/// Run the pipeline once with default settings and memory-only stores
pub async fn run_pipeline(
    source: &SourceRef,
    environment: &Environment,
    options: PipelineOptions,
) -> PipelineRun {
    Pipeline::new(&Settings::default())
        .run(source, environment, options, CancellationToken::new())
        .await
}
