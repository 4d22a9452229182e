//! Remote targets: ssh sessions and HTTP endpoints

use crate::cancel::CancellationToken;
use crate::error::{execution_error, PipelineError, PipelineResult};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;
use url::Url;

/// A host reachable over ssh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteHost {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl RemoteHost {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            user: None,
            port: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// `user@address`, or the bare address
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }
}

/// Non-interactive ssh invocation running `command` on `host`
pub fn ssh_command(ssh_binary: &str, host: &RemoteHost, command: &str) -> Command {
    let mut cmd = Command::new(ssh_binary);
    cmd.arg("-o").arg("BatchMode=yes");
    if let Some(port) = host.port {
        cmd.arg("-p").arg(port.to_string());
    }
    cmd.arg(host.destination()).arg("--").arg(command);
    cmd
}

/// Request method from a directive, `POST` when absent
pub fn parse_method(method: Option<&str>) -> PipelineResult<Method> {
    let raw = method.unwrap_or("POST").trim().to_ascii_uppercase();
    Method::from_bytes(raw.as_bytes())
        .map_err(|_| execution_error(format!("invalid HTTP method '{}'", raw)))
}

/// Absolute http(s) URL from a directive
pub fn parse_url(target: &str) -> PipelineResult<Url> {
    let url = Url::parse(target.trim())
        .map_err(|e| execution_error(format!("invalid URL '{}': {}", target, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(execution_error(format!(
            "unsupported URL scheme '{}' in '{}'",
            other, target
        ))),
    }
}

/// Methods whose effect is undone by restoring the prior body
pub fn is_reversible(method: &Method) -> bool {
    *method == Method::PUT || *method == Method::PATCH || *method == Method::DELETE
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Send one request under a timeout, aborting when the run is cancelled.
/// Any status is returned; callers decide what counts as failure.
pub async fn send_request(
    client: &reqwest::Client,
    method: Method,
    url: &Url,
    body: Option<&str>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> PipelineResult<HttpResponse> {
    let label = format!("{} {}", method, url);
    let mut request = client.request(method, url.clone()).timeout(timeout);
    if let Some(body) = body {
        let content_type = if serde_json::from_str::<serde_json::Value>(body).is_ok() {
            "application/json"
        } else {
            "text/plain"
        };
        request = request.header(CONTENT_TYPE, content_type).body(body.to_string());
    }

    let exchange = async {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok::<_, reqwest::Error>(HttpResponse { status, body })
    };

    tokio::select! {
        result = exchange => result.map_err(|e| {
            if e.is_timeout() {
                PipelineError::Timeout {
                    message: format!("{} timed out after {:?}", label, timeout),
                }
            } else {
                execution_error(format!("{}: {}", label, e))
            }
        }),
        _ = cancel.cancelled() => Err(PipelineError::Cancelled {
            message: format!("{} cancelled", label),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_arguments() {
        let host = RemoteHost::new("web-1", "10.0.0.5").with_user("deploy").with_port(2222);
        let cmd = ssh_command("ssh", &host, "systemctl reload nginx");
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["-o", "BatchMode=yes", "-p", "2222", "deploy@10.0.0.5", "--", "systemctl reload nginx"]
        );

        assert_eq!(RemoteHost::new("db", "db.internal").destination(), "db.internal");
    }

    #[test]
    fn test_method_and_url_parsing() {
        assert_eq!(parse_method(None).unwrap(), Method::POST);
        assert_eq!(parse_method(Some("put")).unwrap(), Method::PUT);
        assert!(is_reversible(&Method::DELETE));
        assert!(!is_reversible(&Method::POST));

        assert_eq!(parse_url("https://api.example.com/v1/config").unwrap().host_str(), Some("api.example.com"));
        assert!(parse_url("ftp://example.com").is_err());
        assert!(parse_url("not a url").is_err());
    }
}
