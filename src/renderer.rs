//! Renderer Module
//!
//! Expands Handlebars templates against the canonical document. Rendering is
//! strict (a missing variable is an error), unescaped, and deterministic:
//! the same template and document always produce the same content hash.
//! Templates live in `*.hbs` files with an optional YAML front-matter
//! header describing the artifact they produce.

use crate::artifacts::{hash_content, ArtifactDirectives, ArtifactType};
use crate::document::ConfigDocument;
use crate::error::{PipelineError, PipelineResult};
use crate::evidence::{EvidenceRecord, Stage};
use crate::persist::{write_bytes_atomic, StagedWrite};
use crate::pipeline::types::StageStatus;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const COMPONENT: &str = "renderer";
const FRONT_MATTER: &str = "---";

/// A template and the artifact it produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    pub source: String,
    #[serde(rename = "type", default)]
    pub artifact_type: ArtifactType,
    /// Directive strings are templates too
    #[serde(default)]
    pub directives: ArtifactDirectives,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Where rendered content is written, if anywhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

/// Front-matter header of a `*.hbs` file
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Header {
    name: Option<String>,
    #[serde(rename = "type")]
    artifact_type: ArtifactType,
    tags: Vec<String>,
    output: Option<PathBuf>,
    #[serde(flatten)]
    directives: ArtifactDirectives,
}

impl Template {
    pub fn new(name: impl Into<String>, source: impl Into<String>, artifact_type: ArtifactType) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            artifact_type,
            directives: ArtifactDirectives::default(),
            tags: Vec::new(),
            output_path: None,
        }
    }

    pub fn with_directives(mut self, directives: ArtifactDirectives) -> Self {
        self.directives = directives;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Parse a template file body, splitting off the front matter
    pub fn parse(default_name: &str, text: &str) -> PipelineResult<Self> {
        let (header, body) = split_front_matter(text);
        let header: Header = match header {
            Some(h) if !h.trim().is_empty() => serde_yaml::from_str(h).map_err(|e| {
                PipelineError::Config {
                    message: format!("Invalid front matter in template {}: {}", default_name, e),
                }
            })?,
            _ => Header::default(),
        };

        Ok(Self {
            name: header.name.unwrap_or_else(|| default_name.to_string()),
            source: body.to_string(),
            artifact_type: header.artifact_type,
            directives: header.directives,
            tags: header.tags,
            output_path: header.output,
        })
    }

    /// Load every `*.hbs` file of a directory, in file name order
    pub async fn load_dir(dir: &Path) -> PipelineResult<Vec<Self>> {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| PipelineError::Config {
            message: format!("Cannot read template directory {}: {}", dir.display(), e),
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("hbs") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut templates = Vec::with_capacity(paths.len());
        for path in paths {
            let text = tokio::fs::read_to_string(&path).await?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            templates.push(Self::parse(&stem, &text)?);
        }
        info!("Loaded {} templates from {}", templates.len(), dir.display());
        Ok(templates)
    }
}

fn split_front_matter(text: &str) -> (Option<&str>, &str) {
    let Some(rest) = text
        .strip_prefix(FRONT_MATTER)
        .and_then(|r| r.strip_prefix("\r\n").or_else(|| r.strip_prefix('\n')))
    else {
        return (None, text);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FRONT_MATTER {
            return (Some(&rest[..offset]), &rest[offset + line.len()..]);
        }
        offset += line.len();
    }
    (None, text)
}

/// Result of rendering one template
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub status: StageStatus,
    pub template: String,
    pub artifact_type: ArtifactType,
    /// Rendered content; `None` when rendering failed
    pub content: Option<String>,
    pub content_hash: Option<String>,
    /// Directives with their templates expanded
    pub directives: ArtifactDirectives,
    pub tags: Vec<String>,
    pub output_path: Option<PathBuf>,
    pub errors: Vec<PipelineError>,
    pub evidence: Vec<EvidenceRecord>,
}

/// Results for every template of a run; all or nothing
#[derive(Debug, Clone)]
pub struct RenderBatch {
    pub status: StageStatus,
    pub results: Vec<RenderResult>,
}

impl RenderBatch {
    pub fn errors(&self) -> Vec<PipelineError> {
        self.results.iter().flat_map(|r| r.errors.clone()).collect()
    }

    pub fn evidence(&self) -> Vec<EvidenceRecord> {
        self.results.iter().flat_map(|r| r.evidence.clone()).collect()
    }
}

pub struct Renderer {
    handlebars: Handlebars<'static>,
}

impl Renderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);

        // Register helpers
        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        Self { handlebars }
    }

    /// Render one template and write it to `output_path` (or the template's
    /// own output path) when one is given
    pub async fn render(
        &self,
        template: &Template,
        document: &ConfigDocument,
        output_path: Option<&Path>,
    ) -> RenderResult {
        let mut result = self.render_in_memory(template, document, output_path);
        if result.status != StageStatus::Error {
            self.write_output(&mut result).await;
        }
        result
    }

    /// Render every template; outputs are written only when all succeed
    pub async fn render_all(
        &self,
        templates: &[Template],
        document: &ConfigDocument,
        write_outputs: bool,
    ) -> RenderBatch {
        let mut results: Vec<RenderResult> = templates
            .iter()
            .map(|t| self.render_in_memory(t, document, None))
            .collect();

        let mut failed = results.iter().any(|r| r.status == StageStatus::Error);
        if !failed && write_outputs {
            failed = !write_all(&mut results).await;
        }
        if failed {
            warn!("Rendering failed; discarding output of {} templates", results.len());
            for r in results.iter_mut() {
                r.content = None;
                r.content_hash = None;
            }
        }

        let status = results
            .iter()
            .fold(StageStatus::Success, |acc, r| acc.worst(r.status));
        RenderBatch { status, results }
    }

    fn render_in_memory(
        &self,
        template: &Template,
        document: &ConfigDocument,
        output_path: Option<&Path>,
    ) -> RenderResult {
        let data = document.to_value();
        let input = json!({
            "template": template.name,
            "templateHash": hash_content(&template.source),
            "documentHash": document.content_hash(),
        });
        let output_path = output_path
            .map(Path::to_path_buf)
            .or_else(|| template.output_path.clone());

        let rendered = self
            .expand(&template.source, &data)
            .and_then(|content| Ok((content, self.expand_directives(&template.directives, &data)?)));

        match rendered {
            Ok((content, directives)) => {
                let content_hash = hash_content(&content);
                debug!("Rendered {} ({} bytes, {})", template.name, content.len(), content_hash);
                let record = EvidenceRecord::success(Stage::Render, COMPONENT, "render")
                    .with_input(input)
                    .with_output(json!({
                        "contentHash": content_hash,
                        "outputPath": output_path,
                    }))
                    .with_metric("bytes", content.len());
                RenderResult {
                    status: StageStatus::Success,
                    template: template.name.clone(),
                    artifact_type: template.artifact_type,
                    content: Some(content),
                    content_hash: Some(content_hash),
                    directives,
                    tags: template.tags.clone(),
                    output_path,
                    errors: Vec::new(),
                    evidence: vec![record],
                }
            }
            Err(message) => {
                warn!("Failed to render {}: {}", template.name, message);
                let error = PipelineError::Render {
                    message: format!("{}: {}", template.name, message),
                };
                let record = EvidenceRecord::error(Stage::Render, COMPONENT, "render")
                    .with_input(input)
                    .with_error(&error);
                RenderResult {
                    status: StageStatus::Error,
                    template: template.name.clone(),
                    artifact_type: template.artifact_type,
                    content: None,
                    content_hash: None,
                    directives: template.directives.clone(),
                    tags: template.tags.clone(),
                    output_path,
                    errors: vec![error],
                    evidence: vec![record],
                }
            }
        }
    }

    fn expand(&self, source: &str, data: &Value) -> Result<String, String> {
        self.handlebars
            .render_template(source, data)
            .map_err(|e| e.to_string())
    }

    fn expand_directives(&self, d: &ArtifactDirectives, data: &Value) -> Result<ArtifactDirectives, String> {
        let expand = |s: &Option<String>| -> Result<Option<String>, String> {
            s.as_deref().map(|s| self.expand(s, data)).transpose()
        };
        Ok(ArtifactDirectives {
            target: expand(&d.target)?,
            verify: expand(&d.verify)?,
            rollback: expand(&d.rollback)?,
            capture: expand(&d.capture)?,
            restore: expand(&d.restore)?,
            action: expand(&d.action)?,
            method: expand(&d.method)?,
            hosts: d
                .hosts
                .iter()
                .map(|h| self.expand(h, data))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Write rendered content atomically; a failed write fails the result
    async fn write_output(&self, result: &mut RenderResult) {
        let (Some(path), Some(content)) = (result.output_path.clone(), result.content.clone()) else {
            return;
        };
        if let Err(e) = write_bytes_atomic(&path, content.as_bytes()).await {
            fail_write(result, &path, &e);
            result.content = None;
            result.content_hash = None;
            return;
        }
        record_write(result, &path);
    }
}

fn fail_write(result: &mut RenderResult, path: &Path, cause: &PipelineError) {
    let error = PipelineError::Render {
        message: format!("{}: cannot write {}: {}", result.template, path.display(), cause),
    };
    result
        .evidence
        .push(EvidenceRecord::error(Stage::Render, COMPONENT, "write_output").with_error(&error));
    result.errors.push(error);
    result.status = StageStatus::Error;
}

fn record_write(result: &mut RenderResult, path: &Path) {
    info!("Wrote {} to {}", result.template, path.display());
    result.evidence.push(
        EvidenceRecord::success(Stage::Render, COMPONENT, "write_output")
            .with_output(json!({ "path": path, "contentHash": result.content_hash })),
    );
}

/// Stage every output beside its destination, then move them all into
/// place. Any failure leaves every destination as it was. Returns whether
/// the outputs were written.
async fn write_all(results: &mut [RenderResult]) -> bool {
    let mut staged: Vec<(usize, StagedWrite)> = Vec::new();
    let mut failure: Option<(usize, PathBuf, PipelineError)> = None;

    for (index, result) in results.iter().enumerate() {
        let (Some(path), Some(content)) = (&result.output_path, &result.content) else {
            continue;
        };
        match StagedWrite::stage(path, content.as_bytes()).await {
            Ok(write) => staged.push((index, write)),
            Err(e) => {
                failure = Some((index, path.clone(), e));
                break;
            }
        }
    }

    if failure.is_none() {
        for (n, (index, write)) in staged.iter().enumerate() {
            if let Err(e) = write.commit().await {
                for (_, done) in &staged[..n] {
                    if let Err(undo) = done.revert().await {
                        warn!("Could not restore {}: {}", done.path.display(), undo);
                    }
                }
                for (_, pending) in &staged[n..] {
                    pending.discard().await;
                }
                failure = Some((*index, write.path.clone(), e));
                break;
            }
        }
    } else {
        for (_, write) in &staged {
            write.discard().await;
        }
    }

    match failure {
        Some((index, path, cause)) => {
            fail_write(&mut results[index], &path, &cause);
            false
        }
        None => {
            for (index, write) in &staged {
                record_write(&mut results[*index], &write.path);
            }
            true
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

// Handlebars helpers

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    if let Some(v) = h.param(0) {
        out.write(&serde_json::to_string(v.value()).unwrap_or_default())?;
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&param.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&param.to_lowercase())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Provenance;
    use pretty_assertions::assert_eq;

    fn doc(value: Value) -> ConfigDocument {
        ConfigDocument::from_value(value, Provenance::inline("test")).unwrap()
    }

    #[tokio::test]
    async fn test_render_is_deterministic() {
        let renderer = Renderer::new();
        let template = Template::new(
            "app",
            "name={{service.name}}\nreplicas={{replicas}}\nlabels={{json labels}}\n",
            ArtifactType::File,
        );
        let d = doc(json!({"service": {"name": "api"}, "replicas": 3, "labels": {"a": "<b>"}}));

        let first = renderer.render(&template, &d, None).await;
        let second = renderer.render(&template, &d, None).await;
        assert_eq!(first.status, StageStatus::Success);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(
            first.content.as_deref(),
            Some("name=api\nreplicas=3\nlabels={\"a\":\"<b>\"}\n")
        );
        assert_eq!(first.content_hash, Some(hash_content(first.content.as_deref().unwrap())));
    }

    #[tokio::test]
    async fn test_missing_variable_is_render_error() {
        let renderer = Renderer::new();
        let template = Template::new("app", "owner={{owner}}", ArtifactType::File);
        let result = renderer.render(&template, &doc(json!({"env": "dev"})), None).await;
        assert_eq!(result.status, StageStatus::Error);
        assert!(result.content.is_none());
        assert_eq!(result.errors[0].kind(), "RenderError");
    }

    #[tokio::test]
    async fn test_render_writes_output_and_expands_directives() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out/api.conf");
        let template = Template::new("svc", "{{upper name}}", ArtifactType::Service).with_directives(
            ArtifactDirectives {
                target: Some("{{lower name}}.service".to_string()),
                ..Default::default()
            },
        );

        let result = Renderer::new()
            .render(&template, &doc(json!({"name": "Api"})), Some(&out))
            .await;
        assert_eq!(result.status, StageStatus::Success);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "API");
        assert_eq!(result.directives.target.as_deref(), Some("api.service"));
        assert_eq!(result.evidence.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_discards_everything_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good_path = dir.path().join("good.txt");
        let mut good = Template::new("good", "{{env}}", ArtifactType::File);
        good.output_path = Some(good_path.clone());
        let bad = Template::new("bad", "{{missing}}", ArtifactType::File);

        let batch = Renderer::new()
            .render_all(&[good, bad], &doc(json!({"env": "dev"})), true)
            .await;
        assert_eq!(batch.status, StageStatus::Error);
        assert!(batch.results.iter().all(|r| r.content.is_none()));
        assert!(!good_path.exists());
        assert_eq!(batch.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_write_failure_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let good_path = dir.path().join("good.txt");
        std::fs::write(dir.path().join("blocker"), "a regular file").unwrap();

        let mut good = Template::new("good", "{{env}}", ArtifactType::File);
        good.output_path = Some(good_path.clone());
        let mut blocked = Template::new("blocked", "{{env}}", ArtifactType::File);
        blocked.output_path = Some(dir.path().join("blocker/nested.txt"));

        let batch = Renderer::new()
            .render_all(&[good, blocked], &doc(json!({"env": "dev"})), true)
            .await;
        assert_eq!(batch.status, StageStatus::Error);
        assert!(!good_path.exists());
        assert!(batch.results.iter().all(|r| r.content.is_none() && r.content_hash.is_none()));
        assert_eq!(batch.errors().len(), 1);
        assert_eq!(batch.results[1].status, StageStatus::Error);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["blocker"]);
    }

    #[tokio::test]
    async fn test_batch_writes_every_output_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = Template::new("a", "a={{env}}", ArtifactType::File);
        a.output_path = Some(dir.path().join("a.txt"));
        let mut b = Template::new("b", "b={{env}}", ArtifactType::File);
        b.output_path = Some(dir.path().join("nested/b.txt"));

        let batch = Renderer::new()
            .render_all(&[a, b], &doc(json!({"env": "prod"})), true)
            .await;
        assert_eq!(batch.status, StageStatus::Success);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "a=prod");
        assert_eq!(std::fs::read_to_string(dir.path().join("nested/b.txt")).unwrap(), "b=prod");
        assert!(batch.results.iter().all(|r| r.evidence.len() == 2));
    }

    #[test]
    fn test_front_matter() {
        let text = "---\nname: nginx\ntype: file\ntarget: /etc/nginx/{{site}}.conf\nverify: nginx -t\ntags: [web, edge]\n---\nserver {{site}};\n";
        let template = Template::parse("fallback", text).unwrap();
        assert_eq!(template.name, "nginx");
        assert_eq!(template.artifact_type, ArtifactType::File);
        assert_eq!(template.directives.verify.as_deref(), Some("nginx -t"));
        assert_eq!(template.tags, vec!["web", "edge"]);
        assert_eq!(template.source, "server {{site}};\n");

        let plain = Template::parse("plain", "just {{text}}").unwrap();
        assert_eq!(plain.name, "plain");
        assert_eq!(plain.artifact_type, ArtifactType::Config);
        assert_eq!(plain.source, "just {{text}}");
    }

    #[tokio::test]
    async fn test_load_dir_reads_hbs_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.hbs"), "b").unwrap();
        std::fs::write(dir.path().join("a.hbs"), "---\ntype: script\n---\necho a\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "skip").unwrap();

        let templates = Template::load_dir(dir.path()).await.unwrap();
        let names: Vec<_> = templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(templates[0].artifact_type, ArtifactType::Script);
    }
}
