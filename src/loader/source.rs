//! Configuration sources
//!
//! Enumerates and reads raw configuration files from local directory trees
//! and git snapshots. Ordering is explicit: sources in declaration order,
//! then files in lexicographic order of their relative path.

use crate::config::LoaderSettings;
use crate::error::{load_error, PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

/// Where configuration documents come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRef {
    /// Recursive walk of a local directory
    Directory {
        root: PathBuf,
        #[serde(default)]
        ignore: Vec<String>,
    },
    /// Snapshot of a git branch, tag or commit
    Git {
        repository: PathBuf,
        reference: String,
        #[serde(default)]
        subdir: Option<String>,
        #[serde(default)]
        ignore: Vec<String>,
    },
    /// Several sources loaded in declaration order
    Layered { sources: Vec<SourceRef> },
}

impl SourceRef {
    pub fn directory(root: impl Into<PathBuf>) -> Self {
        SourceRef::Directory {
            root: root.into(),
            ignore: Vec::new(),
        }
    }

    pub fn git(repository: impl Into<PathBuf>, reference: impl Into<String>) -> Self {
        SourceRef::Git {
            repository: repository.into(),
            reference: reference.into(),
            subdir: None,
            ignore: Vec::new(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SourceRef::Directory { root, .. } => root.display().to_string(),
            SourceRef::Git {
                repository,
                reference,
                ..
            } => format!("{}@{}", repository.display(), reference),
            SourceRef::Layered { sources } => sources
                .iter()
                .map(|s| s.describe())
                .collect::<Vec<_>>()
                .join(" + "),
        }
    }

    /// Flatten nested layers into leaf sources, preserving order
    pub fn leaves(&self) -> Vec<&SourceRef> {
        match self {
            SourceRef::Layered { sources } => sources.iter().flat_map(|s| s.leaves()).collect(),
            leaf => vec![leaf],
        }
    }
}

/// How a pending file will be read
#[derive(Debug, Clone)]
pub(crate) enum FileLocator {
    Fs(PathBuf),
    Git {
        git: String,
        repository: PathBuf,
        commit: String,
        path: String,
    },
}

/// A file discovered during enumeration but not yet read
#[derive(Debug, Clone)]
pub(crate) struct PendingFile {
    pub path: String,
    pub relative_path: String,
    pub source: String,
    pub locator: FileLocator,
}

fn compile_ignores(settings: &LoaderSettings, extra: &[String]) -> PipelineResult<Vec<Pattern>> {
    settings
        .ignore
        .iter()
        .chain(extra.iter())
        .map(|g| {
            Pattern::new(g).map_err(|e| load_error(format!("Invalid ignore glob '{}': {}", g, e)))
        })
        .collect()
}

fn is_ignored(relative: &str, ignores: &[Pattern]) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    ignores.iter().any(|p| p.matches_with(relative, options))
}

fn has_config_extension(relative: &str, settings: &LoaderSettings) -> bool {
    Path::new(relative)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| settings.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Enumerate a directory tree (blocking; callers run it off the runtime)
pub(crate) fn enumerate_directory(
    root: &Path,
    ignore: &[String],
    settings: &LoaderSettings,
) -> PipelineResult<Vec<PendingFile>> {
    if !root.is_dir() {
        return Err(load_error(format!(
            "Source directory {} is not readable",
            root.display()
        )));
    }
    let ignores = compile_ignores(settings, ignore)?;
    let source = root.display().to_string();

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry.map_err(|e| load_error(format!("Failed to walk {}: {}", source, e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if !has_config_extension(&relative, settings) || is_ignored(&relative, &ignores) {
            continue;
        }
        files.push(PendingFile {
            path: entry.path().display().to_string(),
            relative_path: relative,
            source: source.clone(),
            locator: FileLocator::Fs(entry.path().to_path_buf()),
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Run a git command in `repository` with an explicit timeout
pub(crate) async fn run_git(
    git: &str,
    repository: &Path,
    args: &[&str],
    timeout: Duration,
) -> PipelineResult<Vec<u8>> {
    let output = tokio::time::timeout(
        timeout,
        Command::new(git)
            .arg("-C")
            .arg(repository)
            .args(args)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| PipelineError::Timeout {
        message: format!("git {} timed out after {:?}", args.join(" "), timeout),
    })?
    .map_err(|e| load_error(format!("Failed to run {}: {}", git, e)))?;

    if !output.status.success() {
        return Err(load_error(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

/// Enumerate the files of a git snapshot
pub(crate) async fn enumerate_git(
    repository: &Path,
    reference: &str,
    subdir: Option<&str>,
    ignore: &[String],
    settings: &LoaderSettings,
) -> PipelineResult<Vec<PendingFile>> {
    let timeout = settings.read_timeout();
    let git = settings.git_binary.as_str();
    let ignores = compile_ignores(settings, ignore)?;

    let revspec = format!("{}^{{commit}}", reference);
    let rev_parse = ["rev-parse", "--verify", "--quiet", revspec.as_str()];
    let commit_raw = run_git(git, repository, &rev_parse, timeout)
        .await
        .map_err(|e| load_error(format!("Cannot resolve reference '{}': {}", reference, e)))?;
    let commit = String::from_utf8_lossy(&commit_raw).trim().to_string();

    let mut args = vec!["ls-tree", "-r", "--name-only", "-z", commit.as_str()];
    let prefix = subdir.map(|s| s.trim_matches('/').to_string());
    if let Some(p) = prefix.as_deref() {
        args.push("--");
        args.push(p);
    }
    let listing = run_git(git, repository, &args, timeout).await?;

    let source = format!("{}@{}", repository.display(), reference);
    let mut files: Vec<PendingFile> = listing
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).to_string())
        .filter_map(|full| {
            let relative = match prefix.as_deref() {
                Some(p) => full.strip_prefix(p)?.trim_start_matches('/').to_string(),
                None => full.clone(),
            };
            let hidden = relative.split('/').any(|c| c.starts_with('.'));
            if hidden || !has_config_extension(&relative, settings) || is_ignored(&relative, &ignores)
            {
                return None;
            }
            Some(PendingFile {
                path: format!("{}:{}", source, full),
                relative_path: relative,
                source: source.clone(),
                locator: FileLocator::Git {
                    git: git.to_string(),
                    repository: repository.to_path_buf(),
                    commit: commit.clone(),
                    path: full,
                },
            })
        })
        .collect();

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Read one pending file, returning its bytes and modification time
pub(crate) async fn read_pending(
    file: &PendingFile,
    timeout: Duration,
) -> PipelineResult<(Vec<u8>, Option<DateTime<Utc>>)> {
    match &file.locator {
        FileLocator::Fs(path) => {
            let content = tokio::time::timeout(timeout, tokio::fs::read(path))
                .await
                .map_err(|_| PipelineError::Timeout {
                    message: format!("Reading {} timed out after {:?}", path.display(), timeout),
                })?
                .map_err(|e| load_error(format!("Failed to read {}: {}", path.display(), e)))?;
            let modified = tokio::fs::metadata(path)
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);
            Ok((content, modified))
        }
        FileLocator::Git {
            git,
            repository,
            commit,
            path,
        } => {
            let object = format!("{}:{}", commit, path);
            let content = run_git(git, repository, &["show", &object], timeout).await?;
            let stamp = run_git(
                git,
                repository,
                &["log", "-1", "--format=%ct", commit, "--", path],
                timeout,
            )
            .await?;
            let modified = String::from_utf8_lossy(&stamp)
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
            Ok((content, modified))
        }
    }
}
