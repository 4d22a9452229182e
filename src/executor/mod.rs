//! Executor Module
//!
//! Applies stored artifacts to an environment:
//! - `state`: per-execution state machine
//! - `local`: shell, script, file and service operations
//! - `remote`: ssh fan-out and HTTP calls
//! - `rollback`: snapshots taken before applying and their restoration
//!
//! Each artifact expands to one action per target. Targets run
//! independently (remote ones concurrently, bounded) and a failed target is
//! rolled back on its own.

pub mod local;
pub mod remote;
pub mod rollback;
pub mod state;

pub use remote::RemoteHost;
pub use rollback::Snapshot;
pub use state::{ExecutionState, StateMachine, Transition};

use crate::artifacts::{Artifact, ArtifactType};
use crate::cancel::CancellationToken;
use crate::config::ExecutorSettings;
use crate::error::{execution_error, PipelineError, PipelineResult};
use crate::evidence::{EvidenceRecord, Stage};
use crate::persist::write_bytes_atomic;
use crate::pipeline::{PipelineOptions, StageStatus};
use futures::stream::{self, StreamExt};
use local::{run_checked, run_process, shell_command, with_deadline};
use remote::{parse_method, parse_url, send_request, ssh_command};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

/// Where artifacts are applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Environment {
    pub name: String,
    /// Base for relative file targets and working directory of local commands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub hosts: Vec<RemoteHost>,
    /// Extra variables exported to local commands
    pub variables: BTreeMap<String, String>,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_host(mut self, host: RemoteHost) -> Self {
        self.hosts.push(host);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Read an environment description from a YAML or JSON file
    pub async fn load(path: &Path) -> PipelineResult<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        serde_yaml::from_str(&text).map_err(|e| PipelineError::Config {
            message: format!("invalid environment file {}: {}", path.display(), e),
        })
    }

    pub fn resolve_path(&self, target: &str) -> PathBuf {
        let path = PathBuf::from(target);
        match &self.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }

    /// Hosts named in `names`, or every host when `names` is empty
    pub fn select_hosts(&self, names: &[String]) -> PipelineResult<Vec<RemoteHost>> {
        let hosts: Vec<RemoteHost> = if names.is_empty() {
            self.hosts.clone()
        } else {
            names
                .iter()
                .map(|name| {
                    self.hosts
                        .iter()
                        .find(|h| &h.name == name)
                        .cloned()
                        .ok_or_else(|| {
                            execution_error(format!(
                                "unknown host '{}' in environment '{}'",
                                name, self.name
                            ))
                        })
                })
                .collect::<PipelineResult<_>>()?
        };
        if hosts.is_empty() {
            return Err(execution_error(format!(
                "environment '{}' has no remote hosts",
                self.name
            )));
        }
        Ok(hosts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    /// Maximum number of targets applied at once
    pub remote_concurrency: usize,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            remote_concurrency: 4,
        }
    }
}

impl From<&PipelineOptions> for ExecuteOptions {
    fn from(options: &PipelineOptions) -> Self {
        Self {
            dry_run: options.dry_run,
            remote_concurrency: options.remote_concurrency,
        }
    }
}

/// One concrete operation against one target
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    WriteFile { path: PathBuf },
    Shell { errexit: bool },
    Service { unit: String, action: String },
    Ssh { host: RemoteHost },
    Http { method: Method, url: Url },
}

impl Action {
    fn target(&self) -> String {
        match self {
            Action::WriteFile { path } => path.display().to_string(),
            Action::Shell { .. } => "local".to_string(),
            Action::Service { unit, .. } => unit.clone(),
            Action::Ssh { host } => host.name.clone(),
            Action::Http { url, .. } => url.to_string(),
        }
    }

    fn describe(&self, artifact: &Artifact, settings: &ExecutorSettings) -> String {
        match self {
            Action::WriteFile { path } => {
                format!("write {} bytes to {}", artifact.content.len(), path.display())
            }
            Action::Shell { errexit: true } => format!("run script '{}' with {} -e", artifact.name, settings.shell),
            Action::Shell { errexit: false } => {
                format!("run command '{}' with {}", artifact.content.trim(), settings.shell)
            }
            Action::Service { unit, action } => {
                format!("{} {} {}", settings.service_manager, action, unit)
            }
            Action::Ssh { host } => format!("ssh {}: {}", host.destination(), artifact.content.trim()),
            Action::Http { method, url } => {
                format!("{} {} ({} bytes)", method, url, artifact.content.len())
            }
        }
    }
}

/// Outcome for one target of an artifact
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub target: String,
    pub state: ExecutionState,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
    /// Restoration failure, reported next to the original error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<PipelineError>,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub artifact_id: Uuid,
    pub artifact_name: String,
    pub artifact_type: ArtifactType,
    pub status: StageStatus,
    pub state: ExecutionState,
    pub dry_run: bool,
    pub output: String,
    pub planned_actions: Vec<String>,
    pub targets: Vec<TargetOutcome>,
    /// Original failures first, then any rollback failures
    pub errors: Vec<PipelineError>,
    pub duration_ms: u64,
    pub transitions: Vec<Transition>,
    pub evidence: Vec<EvidenceRecord>,
}

impl ExecutionResult {
    fn new(artifact: &Artifact, dry_run: bool) -> Self {
        Self {
            artifact_id: artifact.id,
            artifact_name: artifact.name.clone(),
            artifact_type: artifact.artifact_type,
            status: StageStatus::Success,
            state: ExecutionState::Pending,
            dry_run,
            output: String::new(),
            planned_actions: Vec::new(),
            targets: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
            transitions: Vec::new(),
            evidence: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state.is_success()
    }
}

/// Results of executing a run's artifacts in order
#[derive(Debug, Clone)]
pub struct ExecutionBatch {
    pub status: StageStatus,
    pub results: Vec<ExecutionResult>,
    /// Artifacts not attempted because an earlier one failed
    pub skipped: Vec<Uuid>,
}

impl ExecutionBatch {
    pub fn errors(&self) -> Vec<PipelineError> {
        self.results.iter().flat_map(|r| r.errors.clone()).collect()
    }

    pub fn evidence(&self) -> Vec<EvidenceRecord> {
        self.results.iter().flat_map(|r| r.evidence.clone()).collect()
    }
}

fn advance(sm: &mut StateMachine, next: ExecutionState) {
    if let Err(e) = sm.transition(next) {
        warn!("{}", e);
    }
}

/// Artifact executor
#[derive(Clone)]
pub struct Executor {
    settings: ExecutorSettings,
    http: reqwest::Client,
}

impl Executor {
    pub fn new(settings: ExecutorSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout())
            .build()
            .unwrap_or_default();
        Self { settings, http }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Expand an artifact into its target actions, validating directives
    fn plan(&self, artifact: &Artifact, env: &Environment) -> PipelineResult<Vec<Action>> {
        let directives = &artifact.directives;
        let target = || {
            directives
                .target
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    execution_error(format!(
                        "{} artifact '{}' has no target",
                        artifact.artifact_type, artifact.name
                    ))
                })
        };
        let body = || {
            if artifact.content.trim().is_empty() {
                Err(execution_error(format!(
                    "{} artifact '{}' is empty",
                    artifact.artifact_type, artifact.name
                )))
            } else {
                Ok(())
            }
        };

        let actions = match artifact.artifact_type {
            ArtifactType::Config => Vec::new(),
            ArtifactType::File => vec![Action::WriteFile {
                path: env.resolve_path(target()?),
            }],
            ArtifactType::Script | ArtifactType::Command => {
                body()?;
                vec![Action::Shell {
                    errexit: artifact.artifact_type == ArtifactType::Script,
                }]
            }
            ArtifactType::Service => vec![Action::Service {
                unit: target()?.to_string(),
                action: directives
                    .action
                    .clone()
                    .unwrap_or_else(|| "restart".to_string()),
            }],
            ArtifactType::RemoteCommand => {
                body()?;
                env.select_hosts(&directives.hosts)?
                    .into_iter()
                    .map(|host| Action::Ssh { host })
                    .collect()
            }
            ArtifactType::HttpRequest => vec![Action::Http {
                method: parse_method(directives.method.as_deref())?,
                url: parse_url(target()?)?,
            }],
        };
        Ok(actions)
    }

    /// Execute one artifact. Failures are reported in the result, never
    /// raised.
    pub async fn execute(
        &self,
        artifact: &Artifact,
        env: &Environment,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let start = Instant::now();
        let mut result = ExecutionResult::new(artifact, options.dry_run);
        let mut sm = StateMachine::new();

        let actions = match self.plan(artifact, env) {
            Ok(actions) => actions,
            Err(e) => {
                advance(&mut sm, ExecutionState::Failed);
                result.errors.push(e);
                return self.finish(result, sm, start);
            }
        };
        result.planned_actions = actions
            .iter()
            .map(|a| a.describe(artifact, &self.settings))
            .collect();
        if actions.is_empty() {
            result
                .planned_actions
                .push(format!("store '{}' as data; nothing to execute", artifact.name));
        }

        if options.dry_run {
            advance(&mut sm, ExecutionState::Planned);
            result.output = result.planned_actions.join("\n");
            result.evidence.push(
                EvidenceRecord::success(Stage::Execute, "executor", "plan")
                    .with_input(json!({ "artifactId": artifact.id, "environment": env.name }))
                    .with_output(json!({ "actions": result.planned_actions })),
            );
            return self.finish(result, sm, start);
        }

        if cancel.is_cancelled() {
            advance(&mut sm, ExecutionState::Failed);
            result.errors.push(PipelineError::Cancelled {
                message: format!("execution of '{}' cancelled before start", artifact.name),
            });
            return self.finish(result, sm, start);
        }

        advance(&mut sm, ExecutionState::Running);
        let concurrency = options.remote_concurrency.max(1);
        let outcomes: Vec<(TargetOutcome, Vec<EvidenceRecord>)> = stream::iter(actions)
            .map(|action| self.run_target(artifact, action, env, cancel))
            .buffered(concurrency)
            .collect()
            .await;

        let mut targets = Vec::with_capacity(outcomes.len());
        for (outcome, evidence) in outcomes {
            result.evidence.extend(evidence);
            targets.push(outcome);
        }
        for target in &targets {
            result.errors.extend(target.error.clone());
        }
        for target in &targets {
            result.errors.extend(target.rollback_error.clone());
        }

        if targets.iter().all(|t| t.state.is_success()) {
            advance(&mut sm, ExecutionState::Succeeded);
        } else {
            advance(&mut sm, ExecutionState::Failed);
            let rolled: Vec<_> = targets
                .iter()
                .filter(|t| {
                    matches!(
                        t.state,
                        ExecutionState::RolledBack | ExecutionState::RollbackFailed
                    )
                })
                .collect();
            if !rolled.is_empty() {
                advance(&mut sm, ExecutionState::RollingBack);
                if rolled.iter().any(|t| t.state == ExecutionState::RollbackFailed) {
                    advance(&mut sm, ExecutionState::RollbackFailed);
                } else {
                    advance(&mut sm, ExecutionState::RolledBack);
                }
            }
        }

        result.output = if targets.len() == 1 {
            targets[0].output.clone()
        } else {
            targets
                .iter()
                .map(|t| format!("[{}] {}", t.target, t.output.trim_end()))
                .collect::<Vec<_>>()
                .join("\n")
        };
        if targets.is_empty() {
            result.output = result.planned_actions.join("\n");
        }
        result.targets = targets;
        self.finish(result, sm, start)
    }

    fn finish(&self, mut result: ExecutionResult, sm: StateMachine, start: Instant) -> ExecutionResult {
        result.state = sm.state();
        result.transitions = sm.transitions().to_vec();
        result.status = if result.state.is_success() {
            StageStatus::Success
        } else {
            StageStatus::Error
        };
        result.duration_ms = start.elapsed().as_millis() as u64;

        let record = EvidenceRecord::new(
            Stage::Execute,
            "executor",
            "execute",
            result.status.into(),
        )
        .with_input(json!({
            "artifactId": result.artifact_id,
            "name": result.artifact_name,
            "type": result.artifact_type,
            "dryRun": result.dry_run,
        }))
        .with_output(json!({
            "state": result.state,
            "targets": result.targets,
            "errors": result.errors,
        }))
        .with_metric("duration_ms", result.duration_ms)
        .with_metric("targets", result.targets.len());
        result.evidence.push(record);

        if result.succeeded() {
            info!(
                "Executed '{}' ({}): {} in {}ms",
                result.artifact_name, result.artifact_type, result.state, result.duration_ms
            );
        } else {
            warn!(
                "Execution of '{}' ended {}: {} errors",
                result.artifact_name,
                result.state,
                result.errors.len()
            );
        }
        result
    }

    async fn run_target(
        &self,
        artifact: &Artifact,
        action: Action,
        env: &Environment,
        cancel: &CancellationToken,
    ) -> (TargetOutcome, Vec<EvidenceRecord>) {
        let mut sm = StateMachine::new();
        let mut evidence = Vec::new();
        let target = action.target();
        let input = json!({ "artifactId": artifact.id, "target": target });
        advance(&mut sm, ExecutionState::Running);

        let mut outcome = TargetOutcome {
            target: target.clone(),
            state: ExecutionState::Running,
            output: String::new(),
            snapshot: None,
            error: None,
            rollback_error: None,
            transitions: Vec::new(),
        };

        let snapshot = match self.capture(artifact, &action, cancel).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                advance(&mut sm, ExecutionState::Failed);
                evidence.push(
                    EvidenceRecord::error(Stage::Execute, "executor", "capture")
                        .with_input(input)
                        .with_error(&e),
                );
                outcome.error = Some(e);
                outcome.state = sm.state();
                outcome.transitions = sm.transitions().to_vec();
                return (outcome, evidence);
            }
        };
        outcome.snapshot = snapshot.as_ref().map(Snapshot::describe);

        let applied = async {
            let output = self.apply(artifact, &action, env, cancel).await?;
            self.verify(artifact, &action, env, cancel).await?;
            Ok::<_, PipelineError>(output)
        }
        .await;

        match applied {
            Ok(output) => {
                advance(&mut sm, ExecutionState::Succeeded);
                evidence.push(
                    EvidenceRecord::success(Stage::Execute, "executor", "apply")
                        .with_input(input)
                        .with_output(json!({ "output": output, "snapshot": outcome.snapshot })),
                );
                outcome.output = output;
            }
            Err(e) => {
                advance(&mut sm, ExecutionState::Failed);
                warn!("Applying '{}' to {} failed: {}", artifact.name, target, e);
                evidence.push(
                    EvidenceRecord::error(Stage::Execute, "executor", "apply")
                        .with_input(input.clone())
                        .with_error(&e),
                );
                outcome.error = Some(e);

                if let Some(snapshot) = snapshot {
                    advance(&mut sm, ExecutionState::RollingBack);
                    match self.restore(&snapshot, env).await {
                        Ok(()) => {
                            advance(&mut sm, ExecutionState::RolledBack);
                            info!("Rolled back '{}' on {}", artifact.name, target);
                            evidence.push(
                                EvidenceRecord::success(Stage::Execute, "executor", "rollback")
                                    .with_input(input)
                                    .with_output(json!({ "restored": snapshot.describe() })),
                            );
                        }
                        Err(rollback_error) => {
                            advance(&mut sm, ExecutionState::RollbackFailed);
                            error!(
                                "Rollback of '{}' on {} failed: {}",
                                artifact.name, target, rollback_error
                            );
                            evidence.push(
                                EvidenceRecord::error(Stage::Execute, "executor", "rollback")
                                    .with_input(input)
                                    .with_error(&rollback_error),
                            );
                            outcome.rollback_error = Some(rollback_error);
                        }
                    }
                }
            }
        }

        outcome.state = sm.state();
        outcome.transitions = sm.transitions().to_vec();
        (outcome, evidence)
    }

    async fn apply(
        &self,
        artifact: &Artifact,
        action: &Action,
        env: &Environment,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let settings = &self.settings;
        match action {
            Action::WriteFile { path } => {
                let label = format!("write {}", path.display());
                let write = async {
                    write_bytes_atomic(path, artifact.content.as_bytes())
                        .await
                        .map_err(|e| execution_error(format!("cannot write {}: {}", path.display(), e)))
                };
                with_deadline(write, settings.command_timeout(), cancel, &label).await?;
                Ok(format!(
                    "wrote {} bytes to {}",
                    artifact.content.len(),
                    path.display()
                ))
            }
            Action::Shell { errexit } => {
                let cmd = shell_command(
                    &settings.shell,
                    &artifact.content,
                    *errexit,
                    env.working_dir.as_deref(),
                    &env.variables,
                );
                let output =
                    run_checked(cmd, None, settings.command_timeout(), cancel, &artifact.name).await?;
                Ok(output.text())
            }
            Action::Service { unit, action } => {
                let mut cmd = Command::new(&settings.service_manager);
                cmd.arg(action).arg(unit);
                let label = format!("{} {} {}", settings.service_manager, action, unit);
                let output = run_checked(cmd, None, settings.command_timeout(), cancel, &label).await?;
                Ok(output.text())
            }
            Action::Ssh { host } => {
                let cmd = ssh_command(&settings.ssh_binary, host, &artifact.content);
                let label = format!("ssh {}", host.name);
                let output = run_checked(cmd, None, settings.remote_timeout(), cancel, &label).await?;
                Ok(output.text())
            }
            Action::Http { method, url } => {
                let response = send_request(
                    &self.http,
                    method.clone(),
                    url,
                    Some(&artifact.content),
                    settings.http_timeout(),
                    cancel,
                )
                .await?;
                if !response.is_success() {
                    return Err(execution_error(format!(
                        "{} {} returned {}: {}",
                        method,
                        url,
                        response.status,
                        response.body.trim()
                    )));
                }
                Ok(response.body)
            }
        }
    }

    /// Run the artifact's `verify` command against the target, if any
    async fn verify(
        &self,
        artifact: &Artifact,
        action: &Action,
        env: &Environment,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let Some(check) = artifact.directives.verify.as_deref() else {
            return Ok(());
        };
        let settings = &self.settings;
        let (cmd, timeout) = match action {
            Action::Ssh { host } => (
                ssh_command(&settings.ssh_binary, host, check),
                settings.remote_timeout(),
            ),
            _ => (
                shell_command(
                    &settings.shell,
                    check,
                    false,
                    env.working_dir.as_deref(),
                    &env.variables,
                ),
                settings.command_timeout(),
            ),
        };
        let output = run_process(cmd, None, timeout, cancel, "verify").await?;
        if output.success() {
            Ok(())
        } else {
            Err(execution_error(format!(
                "verification '{}' failed on {}: {}",
                check,
                action.target(),
                output.text().trim()
            )))
        }
    }

    /// Execute artifacts in order; the first failure skips the rest
    pub async fn execute_all(
        &self,
        artifacts: &[Arc<Artifact>],
        env: &Environment,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> ExecutionBatch {
        let mut results = Vec::with_capacity(artifacts.len());
        let mut skipped = Vec::new();

        for artifact in artifacts {
            if results.iter().any(|r: &ExecutionResult| !r.succeeded()) {
                skipped.push(artifact.id);
                continue;
            }
            results.push(self.execute(artifact, env, options, cancel).await);
        }
        if !skipped.is_empty() {
            warn!("Skipped {} artifacts after a failed execution", skipped.len());
        }

        let status = results
            .iter()
            .fold(StageStatus::Success, |acc, r| acc.worst(r.status));
        ExecutionBatch {
            status,
            results,
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactDirectives;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn executable(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn file_artifact(target: &Path, content: &str, verify: Option<&str>) -> Artifact {
        Artifact::new("app.conf", ArtifactType::File, content, "app.hbs").with_directives(ArtifactDirectives {
            target: Some(target.display().to_string()),
            verify: verify.map(str::to_string),
            ..Default::default()
        })
    }

    /// Stand-in for ssh: runs the command locally unless the destination
    /// contains `bad.example`
    const FAKE_SSH: &str = r#"#!/bin/sh
dest=""
while [ "$#" -gt 0 ]; do
  case "$1" in
    -o|-p) shift 2 ;;
    --) shift; break ;;
    *) dest="$1"; shift ;;
  esac
done
case "$dest" in
  *bad.example*) echo "ssh: connect to host $dest: Connection refused" >&2; exit 255 ;;
esac
exec sh -c "$*"
"#;

    #[tokio::test]
    async fn test_file_write_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("conf/app.conf");
        let executor = Executor::new(ExecutorSettings::default());
        let artifact = file_artifact(&target, "port=8080\n", Some(&format!("grep -q 8080 {}", target.display())));

        let result = executor
            .execute(&artifact, &Environment::new("dev"), &ExecuteOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(result.state, ExecutionState::Succeeded);
        assert_eq!(result.status, StageStatus::Success);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "port=8080\n");
        assert_eq!(result.evidence.last().unwrap().action, "execute");
        let states: Vec<_> = result.transitions.iter().map(|t| t.to).collect();
        assert_eq!(states, vec![ExecutionState::Running, ExecutionState::Succeeded]);
    }

    #[tokio::test]
    async fn test_failed_verify_restores_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.conf");
        std::fs::write(&target, "port=80\n").unwrap();
        let executor = Executor::new(ExecutorSettings::default());
        let artifact = file_artifact(&target, "port=8080\n", Some("exit 1"));

        let result = executor
            .execute(&artifact, &Environment::new("dev"), &ExecuteOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(result.state, ExecutionState::RolledBack);
        assert_eq!(result.status, StageStatus::Error);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind(), "ExecutionError");
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "port=80\n");
        assert!(result.evidence.iter().any(|r| r.action == "rollback"));
    }

    #[tokio::test]
    async fn test_rollback_removes_file_that_did_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new.conf");
        let executor = Executor::new(ExecutorSettings::default());
        let artifact = file_artifact(&target, "x=1", Some("false"));

        let result = executor
            .execute(&artifact, &Environment::new("dev"), &ExecuteOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(result.state, ExecutionState::RolledBack);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.conf");
        std::fs::write(&target, "old").unwrap();
        let executor = Executor::new(ExecutorSettings::default());
        let artifact = file_artifact(&target, "new", None);
        let options = ExecuteOptions {
            dry_run: true,
            ..Default::default()
        };

        let result = executor
            .execute(&artifact, &Environment::new("dev"), &options, &CancellationToken::new())
            .await;

        assert_eq!(result.state, ExecutionState::Planned);
        assert_eq!(result.status, StageStatus::Success);
        assert!(result.planned_actions[0].starts_with("write 3 bytes to"));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "old");
        assert!(result.evidence.iter().any(|r| r.action == "plan"));
    }

    #[tokio::test]
    async fn test_invalid_directives_fail_before_running() {
        let executor = Executor::new(ExecutorSettings::default());
        let no_target = Artifact::new("svc", ArtifactType::Service, "", "svc.hbs");
        let result = executor
            .execute(&no_target, &Environment::new("dev"), &ExecuteOptions::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.state, ExecutionState::Failed);
        assert!(result.errors[0].to_string().contains("has no target"));

        let bad_url = Artifact::new("hook", ArtifactType::HttpRequest, "{}", "hook.hbs").with_directives(
            ArtifactDirectives {
                target: Some("not a url".to_string()),
                ..Default::default()
            },
        );
        let result = executor
            .execute(&bad_url, &Environment::new("dev"), &ExecuteOptions { dry_run: true, ..Default::default() }, &CancellationToken::new())
            .await;
        assert_eq!(result.state, ExecutionState::Failed);
    }

    #[tokio::test]
    async fn test_config_artifacts_are_not_executed() {
        let executor = Executor::new(ExecutorSettings::default());
        let artifact = Artifact::new("values", ArtifactType::Config, "a: 1", "values.hbs");
        let result = executor
            .execute(&artifact, &Environment::new("dev"), &ExecuteOptions::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.state, ExecutionState::Succeeded);
        assert!(result.targets.is_empty());
        assert!(result.output.contains("nothing to execute"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("undone");
        let executor = Executor::new(ExecutorSettings::default());
        let artifact = Artifact::new("slow", ArtifactType::Command, "sleep 5", "slow.hbs").with_directives(
            ArtifactDirectives {
                rollback: Some(format!("touch {}", marker.display())),
                ..Default::default()
            },
        );

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = executor
            .execute(&artifact, &Environment::new("dev"), &ExecuteOptions::default(), &token)
            .await;

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(result.state, ExecutionState::RolledBack);
        assert_eq!(result.errors[0].kind(), "CancelledError");
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_mask_original_error() {
        let executor = Executor::new(ExecutorSettings::default());
        let artifact = Artifact::new("migrate", ArtifactType::Script, "exit 2", "migrate.hbs").with_directives(
            ArtifactDirectives {
                rollback: Some("exit 3".to_string()),
                ..Default::default()
            },
        );

        let result = executor
            .execute(&artifact, &Environment::new("dev"), &ExecuteOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(result.state, ExecutionState::RollbackFailed);
        let kinds: Vec<_> = result.errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["ExecutionError", "RollbackError"]);
    }

    #[tokio::test]
    async fn test_service_restart_failure_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let manager = executable(
            dir.path(),
            "fake-systemctl",
            &format!(
                "#!/bin/sh\necho \"$@\" >> {}\ncase \"$1\" in\n  is-active) exit 0 ;;\n  restart) exit 1 ;;\nesac\nexit 0\n",
                log.display()
            ),
        );
        let executor = Executor::new(ExecutorSettings {
            service_manager: manager,
            ..Default::default()
        });
        let artifact = Artifact::new("api", ArtifactType::Service, "", "api.hbs").with_directives(ArtifactDirectives {
            target: Some("api.service".to_string()),
            ..Default::default()
        });

        let result = executor
            .execute(&artifact, &Environment::new("dev"), &ExecuteOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(result.state, ExecutionState::RolledBack);
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            calls.lines().collect::<Vec<_>>(),
            vec!["is-active api.service", "restart api.service", "start api.service"]
        );
    }

    #[tokio::test]
    async fn test_remote_fan_out_isolates_host_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = executable(dir.path(), "fake-ssh", FAKE_SSH);
        let executor = Executor::new(ExecutorSettings {
            ssh_binary: ssh,
            ..Default::default()
        });
        let env = Environment::new("prod")
            .with_host(RemoteHost::new("web-1", "web-1.example").with_user("deploy"))
            .with_host(RemoteHost::new("web-2", "bad.example").with_port(2222))
            .with_host(RemoteHost::new("web-3", "web-3.example"));
        let artifact = Artifact::new("reload", ArtifactType::RemoteCommand, "echo reloaded", "reload.hbs");

        let result = executor
            .execute(&artifact, &env, &ExecuteOptions::default(), &CancellationToken::new())
            .await;

        let states: Vec<_> = result.targets.iter().map(|t| (t.target.as_str(), t.state)).collect();
        assert_eq!(
            states,
            vec![
                ("web-1", ExecutionState::Succeeded),
                ("web-2", ExecutionState::Failed),
                ("web-3", ExecutionState::Succeeded),
            ]
        );
        assert_eq!(result.state, ExecutionState::Failed);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].to_string().contains("Connection refused"));
        assert_eq!(result.targets[0].output.trim(), "reloaded");
    }

    #[tokio::test]
    async fn test_remote_capture_and_restore_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = executable(dir.path(), "fake-ssh", FAKE_SSH);
        let state = dir.path().join("state");
        std::fs::write(&state, "v1\n").unwrap();
        let executor = Executor::new(ExecutorSettings {
            ssh_binary: ssh,
            ..Default::default()
        });
        let env = Environment::new("prod").with_host(RemoteHost::new("web-1", "web-1.example"));
        let artifact = Artifact::new(
            "bump",
            ArtifactType::RemoteCommand,
            format!("echo v2 > {}; exit 1", state.display()),
            "bump.hbs",
        )
        .with_directives(ArtifactDirectives {
            capture: Some(format!("cat {}", state.display())),
            restore: Some(format!("cat > {}", state.display())),
            hosts: vec!["web-1".to_string()],
            ..Default::default()
        });

        let result = executor
            .execute(&artifact, &env, &ExecuteOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(result.state, ExecutionState::RolledBack);
        assert_eq!(std::fs::read_to_string(&state).unwrap(), "v1\n");
    }

    #[tokio::test]
    async fn test_unknown_host_is_rejected() {
        let env = Environment::new("prod").with_host(RemoteHost::new("web-1", "web-1.example"));
        assert!(env.select_hosts(&["db-1".to_string()]).is_err());
        assert!(Environment::new("empty").select_hosts(&[]).is_err());
        assert_eq!(env.select_hosts(&[]).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_all_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Executor::new(ExecutorSettings::default());
        let first = Arc::new(Artifact::new("fail", ArtifactType::Command, "exit 1", "fail.hbs"));
        let second = Arc::new(file_artifact(&dir.path().join("never"), "x", None));

        let batch = executor
            .execute_all(
                &[first, second.clone()],
                &Environment::new("dev"),
                &ExecuteOptions::default(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(batch.status, StageStatus::Error);
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.skipped, vec![second.id]);
        assert!(!dir.path().join("never").exists());
    }

    #[tokio::test]
    async fn test_environment_loads_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prod.yaml");
        std::fs::write(
            &path,
            "name: prod\nworkingDir: /srv/app\nhosts:\n  - name: web-1\n    address: 10.0.0.5\n    user: deploy\nvariables:\n  REGION: eu-west-1\n",
        )
        .unwrap();

        let env = Environment::load(&path).await.unwrap();
        assert_eq!(env.name, "prod");
        assert_eq!(env.hosts[0].destination(), "deploy@10.0.0.5");
        assert_eq!(env.resolve_path("app.conf"), PathBuf::from("/srv/app/app.conf"));
        assert_eq!(env.resolve_path("/etc/app.conf"), PathBuf::from("/etc/app.conf"));
        assert_eq!(env.variables["REGION"], "eu-west-1");
    }
}
