//! Artifacts Module
//!
//! Rendered, immutable output units and their durable store:
//! - `Artifact`: content plus content hash and execution directives
//! - `ArtifactManager`: indexed by id, type and tag; removal is explicit and audited
//! - `DeploymentManifest`: the artifacts of one run tied to its evidence chain

pub mod manifest;
pub mod store;

pub use manifest::{DeploymentManifest, ManifestEntry};
pub use store::{ArtifactManager, RemovalRecord};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// SHA-256 of artifact content, hex encoded
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Where an artifact type executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Local,
    Remote,
    /// Stored and manifested, never executed
    DataOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Content written to the `target` path
    File,
    /// Content run by the shell with `-e`
    Script,
    /// Content run as a single shell command
    Command,
    /// `action` applied to the `target` unit through the service manager
    Service,
    /// Content run on every selected host over ssh
    RemoteCommand,
    /// Content sent as the body of a request to the `target` URL
    HttpRequest,
    #[default]
    Config,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::File => "file",
            ArtifactType::Script => "script",
            ArtifactType::Command => "command",
            ArtifactType::Service => "service",
            ArtifactType::RemoteCommand => "remote_command",
            ArtifactType::HttpRequest => "http_request",
            ArtifactType::Config => "config",
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        match self {
            ArtifactType::File | ArtifactType::Script | ArtifactType::Command | ArtifactType::Service => {
                ExecutionMode::Local
            }
            ArtifactType::RemoteCommand | ArtifactType::HttpRequest => ExecutionMode::Remote,
            ArtifactType::Config => ExecutionMode::DataOnly,
        }
    }

    pub fn modifies_state(&self) -> bool {
        self.mode() != ExecutionMode::DataOnly
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ArtifactType::File),
            "script" => Ok(ArtifactType::Script),
            "command" => Ok(ArtifactType::Command),
            "service" => Ok(ArtifactType::Service),
            "remote_command" => Ok(ArtifactType::RemoteCommand),
            "http_request" => Ok(ArtifactType::HttpRequest),
            "config" => Ok(ArtifactType::Config),
            other => Err(format!("unknown artifact type '{}'", other)),
        }
    }
}

/// How an artifact is applied, verified and rolled back
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ArtifactDirectives {
    /// File path, service unit or URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Command that must succeed after applying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    /// Command that undoes a script or command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<String>,
    /// Remote command whose output is the rollback snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<String>,
    /// Remote command fed the captured snapshot on stdin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<String>,
    /// Service action (default `restart`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// HTTP method (default `POST`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Names of the environment hosts to target; empty means all
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
}

/// An immutable rendered output unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub content: String,
    pub content_hash: String,
    pub source_template: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub directives: ArtifactDirectives,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        artifact_type: ArtifactType,
        content: impl Into<String>,
        source_template: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            artifact_type,
            content_hash: hash_content(&content),
            content,
            source_template: source_template.into(),
            tags: Vec::new(),
            directives: ArtifactDirectives::default(),
            created_at: Utc::now(),
            run_id: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_directives(mut self, directives: ArtifactDirectives) -> Self {
        self.directives = directives;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Whether the stored hash still matches the content
    pub fn verify_hash(&self) -> bool {
        hash_content(&self.content) == self.content_hash
    }
}
