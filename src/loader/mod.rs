//! Loader Module
//!
//! First stage of the pipeline. Acquires raw configuration files from
//! directory trees and git snapshots, and merges the parsed documents of a
//! load under an explicit conflict strategy.

pub mod merge;
pub mod source;

pub use merge::{
    ConflictResolver, DocumentMerger, MergeCandidate, MergeConflict, MergeDecision, MergeResult,
    MergeStrategy, SourcedDocument,
};
pub use source::SourceRef;

use crate::config::LoaderSettings;
use crate::error::{load_error, PipelineError, PipelineResult};
use crate::evidence::{EvidenceRecord, Stage};
use crate::pipeline::types::StageStatus;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use source::{enumerate_directory, enumerate_git, read_pending, PendingFile};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

const COMPONENT: &str = "loader";

/// A raw configuration file
#[derive(Debug, Clone)]
pub struct LoadedFile {
    /// Display path (absolute path or `repo@ref:path`)
    pub path: String,
    /// Path relative to the source root, `/`-separated
    pub relative_path: String,
    pub source: String,
    /// Position in the deterministic load order
    pub order: usize,
    pub modified: Option<DateTime<Utc>>,
    pub content: Vec<u8>,
}

/// Result of the load stage
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub status: StageStatus,
    pub source: String,
    /// Files in load order
    pub files: Vec<LoadedFile>,
    pub errors: Vec<PipelineError>,
    pub evidence: Vec<EvidenceRecord>,
    pub duration_ms: u64,
}

impl LoadResult {
    pub fn failed(source: impl Into<String>, error: PipelineError) -> Self {
        let source = source.into();
        let record = EvidenceRecord::error(Stage::Load, COMPONENT, "load")
            .with_input(json!({ "source": source }))
            .with_error(&error);
        Self {
            status: StageStatus::Error,
            source,
            files: Vec::new(),
            errors: vec![error],
            evidence: vec![record],
            duration_ms: 0,
        }
    }

    /// Content keyed by display path
    pub fn files_by_path(&self) -> BTreeMap<&str, &[u8]> {
        self.files
            .iter()
            .map(|f| (f.path.as_str(), f.content.as_slice()))
            .collect()
    }
}

/// Reads configuration sources
pub struct Loader {
    settings: LoaderSettings,
}

impl Loader {
    pub fn new(settings: LoaderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// Load every configuration file of `source`
    pub async fn load(&self, source: &SourceRef) -> LoadResult {
        let started = Instant::now();
        let description = source.describe();
        info!("📥 Loading configuration from {}", description);

        let pending = match self.enumerate(source).await {
            Ok(files) => files,
            Err(e) => {
                warn!("Source {} is unreadable: {}", description, e);
                let mut failed = LoadResult::failed(description, e);
                failed.duration_ms = started.elapsed().as_millis() as u64;
                return failed;
            }
        };

        let timeout = self.settings.read_timeout();
        let workers = self.settings.worker_count.max(1);
        // `buffered` keeps completion results in submission order
        let reads: Vec<(PendingFile, PipelineResult<_>)> = stream::iter(pending)
            .map(|file| async move {
                let outcome = read_pending(&file, timeout).await;
                (file, outcome)
            })
            .buffered(workers)
            .collect()
            .await;

        let mut files = Vec::new();
        let mut errors = Vec::new();
        let mut evidence = Vec::new();

        for (file, outcome) in reads {
            match outcome {
                Ok((content, modified)) => {
                    debug!("Read {} ({} bytes)", file.path, content.len());
                    evidence.push(
                        EvidenceRecord::success(Stage::Load, COMPONENT, "read_file")
                            .with_input(json!({ "path": file.path, "source": file.source }))
                            .with_output(json!({ "order": files.len() }))
                            .with_metric("bytes", content.len()),
                    );
                    files.push(LoadedFile {
                        path: file.path,
                        relative_path: file.relative_path,
                        source: file.source,
                        order: files.len(),
                        modified,
                        content,
                    });
                }
                Err(e) => {
                    warn!("Failed to read {}: {}", file.path, e);
                    evidence.push(
                        EvidenceRecord::error(Stage::Load, COMPONENT, "read_file")
                            .with_input(json!({ "path": file.path, "source": file.source }))
                            .with_error(&e),
                    );
                    errors.push(e);
                }
            }
        }

        let status = if files.is_empty() {
            if errors.is_empty() {
                errors.push(load_error(format!(
                    "No configuration files found in {}",
                    description
                )));
            }
            StageStatus::Error
        } else if errors.is_empty() {
            StageStatus::Success
        } else {
            StageStatus::Warning
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        evidence.push(
            EvidenceRecord::new(Stage::Load, COMPONENT, "load", status.into())
                .with_input(json!({ "source": description }))
                .with_output(json!({
                    "files": files.iter().map(|f| f.path.clone()).collect::<Vec<_>>(),
                }))
                .with_metric("files", files.len())
                .with_metric("errors", errors.len())
                .with_metric("duration_ms", duration_ms),
        );

        info!(
            "📥 Loaded {} files from {} ({} errors)",
            files.len(),
            description,
            errors.len()
        );

        LoadResult {
            status,
            source: description,
            files,
            errors,
            evidence,
            duration_ms,
        }
    }

    async fn enumerate(&self, source: &SourceRef) -> PipelineResult<Vec<PendingFile>> {
        let mut all = Vec::new();
        for leaf in source.leaves() {
            let files = match leaf {
                SourceRef::Directory { root, ignore } => {
                    let root = root.clone();
                    let ignore = ignore.clone();
                    let settings = self.settings.clone();
                    let walk = tokio::task::spawn_blocking(move || {
                        enumerate_directory(&root, &ignore, &settings)
                    });
                    tokio::time::timeout(self.settings.read_timeout(), walk)
                        .await
                        .map_err(|_| PipelineError::Timeout {
                            message: format!("Enumerating {} timed out", leaf.describe()),
                        })?
                        .map_err(|e| load_error(format!("Directory walk aborted: {}", e)))??
                }
                SourceRef::Git {
                    repository,
                    reference,
                    subdir,
                    ignore,
                } => {
                    enumerate_git(repository, reference, subdir.as_deref(), ignore, &self.settings)
                        .await?
                }
                SourceRef::Layered { .. } => Vec::new(),
            };
            all.extend(files);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn loader() -> Loader {
        Loader::new(LoaderSettings::default())
    }

    #[tokio::test]
    async fn test_load_directory_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20-team.yaml"), "replicas: 3").unwrap();
        fs::write(dir.path().join("10-base.yaml"), "replicas: 1").unwrap();

        let result = loader().load(&SourceRef::directory(dir.path())).await;
        assert_eq!(result.status, StageStatus::Success);
        let order: Vec<_> = result.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(order, vec!["10-base.yaml", "20-team.yaml"]);
        assert_eq!(result.files[1].order, 1);
        assert!(result.files[0].modified.is_some());

        // one record per file plus the summary
        let reads = result.evidence.iter().filter(|r| r.action == "read_file").count();
        assert_eq!(reads, 2);
        assert_eq!(result.files_by_path().len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_source_returns_no_files() {
        let result = loader()
            .load(&SourceRef::directory("/no/such/configflow/source"))
            .await;
        assert_eq!(result.status, StageStatus::Error);
        assert!(result.files.is_empty());
        assert_eq!(result.errors[0].kind(), "LoadError");
    }

    #[tokio::test]
    async fn test_empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = loader().load(&SourceRef::directory(dir.path())).await;
        assert_eq!(result.status, StageStatus::Error);
        assert!(result.errors[0].to_string().contains("No configuration files"));
    }

    #[tokio::test]
    async fn test_layered_sources_follow_declaration_order() {
        let base = tempfile::tempdir().unwrap();
        let team = tempfile::tempdir().unwrap();
        fs::write(base.path().join("z.yaml"), "a: 1").unwrap();
        fs::write(team.path().join("a.yaml"), "a: 2").unwrap();

        let source = SourceRef::Layered {
            sources: vec![SourceRef::directory(base.path()), SourceRef::directory(team.path())],
        };
        let result = loader().load(&source).await;
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.files[0].relative_path, "z.yaml");
        assert_eq!(result.files[1].relative_path, "a.yaml");
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(repo: &std::path::Path, args: &[&str], at: i64) {
        let date = format!("@{} +0000", at);
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(["-c", "commit.gpgsign=false", "-c", "tag.gpgsign=false"])
            .args(args)
            .env("GIT_AUTHOR_NAME", "configflow")
            .env("GIT_AUTHOR_EMAIL", "configflow@example.com")
            .env("GIT_COMMITTER_NAME", "configflow")
            .env("GIT_COMMITTER_EMAIL", "configflow@example.com")
            .env("GIT_AUTHOR_DATE", &date)
            .env("GIT_COMMITTER_DATE", &date)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    /// conf/base.yaml at t=1000, conf/app.yaml at t=2000 (tagged v1), then
    /// conf/app.yaml changed at t=3000. other.yaml sits outside `conf`.
    fn git_fixture() -> tempfile::TempDir {
        let repo = tempfile::tempdir().unwrap();
        let root = repo.path();
        git(root, &["init", "-q"], 0);
        fs::create_dir_all(root.join("conf")).unwrap();

        fs::write(root.join("conf/base.yaml"), "replicas: 1\n").unwrap();
        fs::write(root.join("other.yaml"), "outside: true\n").unwrap();
        git(root, &["add", "."], 1000);
        git(root, &["commit", "-q", "-m", "base"], 1000);

        fs::write(root.join("conf/app.yaml"), "replicas: 2\n").unwrap();
        git(root, &["add", "."], 2000);
        git(root, &["commit", "-q", "-m", "app"], 2000);
        git(root, &["tag", "v1"], 2000);

        fs::write(root.join("conf/app.yaml"), "replicas: 9\n").unwrap();
        git(root, &["commit", "-q", "-am", "bump"], 3000);
        repo
    }

    fn git_source(repo: &std::path::Path, reference: &str) -> SourceRef {
        SourceRef::Git {
            repository: repo.to_path_buf(),
            reference: reference.to_string(),
            subdir: Some("conf".to_string()),
            ignore: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_git_source_reads_snapshot_of_reference() {
        if !git_available() {
            return;
        }
        let repo = git_fixture();

        let tagged = loader().load(&git_source(repo.path(), "v1")).await;
        assert_eq!(tagged.status, StageStatus::Success);
        let order: Vec<_> = tagged.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(order, vec!["app.yaml", "base.yaml"]);
        assert_eq!(tagged.files[0].content, b"replicas: 2\n".to_vec());
        assert_eq!(tagged.files[0].modified, DateTime::<Utc>::from_timestamp(2000, 0));
        assert_eq!(tagged.files[1].modified, DateTime::<Utc>::from_timestamp(1000, 0));
        assert!(tagged.files[0].path.ends_with("@v1:conf/app.yaml"));

        let head = loader().load(&git_source(repo.path(), "HEAD")).await;
        assert_eq!(head.files[0].content, b"replicas: 9\n".to_vec());
        assert_eq!(head.files[0].modified, DateTime::<Utc>::from_timestamp(3000, 0));
    }

    #[tokio::test]
    async fn test_unknown_git_reference_is_load_error() {
        if !git_available() {
            return;
        }
        let repo = git_fixture();
        let result = loader().load(&git_source(repo.path(), "no-such-branch")).await;
        assert_eq!(result.status, StageStatus::Error);
        assert!(result.files.is_empty());
        assert_eq!(result.errors[0].kind(), "LoadError");
        assert!(result.errors[0].to_string().contains("Cannot resolve reference"));
    }

    #[tokio::test]
    async fn test_configured_git_binary_is_used() {
        let repo = tempfile::tempdir().unwrap();
        let settings = LoaderSettings {
            git_binary: "/no/such/git-binary".to_string(),
            ..LoaderSettings::default()
        };
        let result = Loader::new(settings).load(&git_source(repo.path(), "main")).await;
        assert_eq!(result.status, StageStatus::Error);
        assert!(result.errors[0].to_string().contains("/no/such/git-binary"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_partial_read_failure_is_a_warning() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok.yaml"), "a: 1").unwrap();
        let locked = dir.path().join("locked.yaml");
        fs::write(&locked, "b: 1").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // root can read anything; only assert when the permission took effect
        if fs::read(&locked).is_err() {
            let result = loader().load(&SourceRef::directory(dir.path())).await;
            assert_eq!(result.status, StageStatus::Warning);
            assert_eq!(result.files.len(), 1);
            assert_eq!(result.errors.len(), 1);
        }
    }
}
