//! Rollback snapshots
//!
//! A snapshot is taken per target before a state-modifying artifact is
//! applied. When applying or verifying fails, the snapshot is restored for
//! that target only.

use super::local::{read_optional, run_checked, run_process, shell_command, with_deadline};
use super::remote::{is_reversible, send_request, ssh_command, RemoteHost};
use super::{Action, Environment, Executor};
use crate::artifacts::Artifact;
use crate::cancel::CancellationToken;
use crate::error::{execution_error, PipelineError, PipelineResult};
use crate::persist::write_bytes_atomic;
use reqwest::Method;
use std::path::PathBuf;
use tokio::process::Command;
use url::Url;

/// Prior state of one target
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// Previous file content, `None` when the file did not exist
    File {
        path: PathBuf,
        previous: Option<Vec<u8>>,
    },
    Service {
        unit: String,
        was_active: bool,
    },
    /// Declared command that undoes a script or command
    Command { command: String },
    /// Output of the capture command, fed to the restore command on stdin
    Remote {
        host: RemoteHost,
        restore: String,
        captured: String,
    },
    /// Resource body before the request, `None` when it did not exist
    Http { url: Url, previous: Option<String> },
}

impl Snapshot {
    pub fn describe(&self) -> String {
        match self {
            Snapshot::File {
                path,
                previous: Some(bytes),
            } => format!("{} ({} bytes)", path.display(), bytes.len()),
            Snapshot::File { path, previous: None } => format!("{} (absent)", path.display()),
            Snapshot::Service { unit, was_active } => format!(
                "{} ({})",
                unit,
                if *was_active { "active" } else { "inactive" }
            ),
            Snapshot::Command { command } => format!("rollback command '{}'", command),
            Snapshot::Remote { host, captured, .. } => {
                format!("{} ({} bytes captured)", host.name, captured.len())
            }
            Snapshot::Http {
                url,
                previous: Some(body),
            } => format!("{} ({} bytes)", url, body.len()),
            Snapshot::Http { url, previous: None } => format!("{} (absent)", url),
        }
    }
}

impl Executor {
    /// Snapshot a target before applying. `None` means there is nothing to
    /// restore for this action.
    pub(super) async fn capture(
        &self,
        artifact: &Artifact,
        action: &Action,
        cancel: &CancellationToken,
    ) -> PipelineResult<Option<Snapshot>> {
        let settings = &self.settings;
        let directives = &artifact.directives;

        match action {
            Action::WriteFile { path } => {
                let label = format!("snapshot {}", path.display());
                let previous =
                    with_deadline(read_optional(path), settings.command_timeout(), cancel, &label)
                        .await?;
                Ok(Some(Snapshot::File {
                    path: path.clone(),
                    previous,
                }))
            }
            Action::Shell { .. } => Ok(directives
                .rollback
                .clone()
                .map(|command| Snapshot::Command { command })),
            Action::Service { unit, .. } => {
                let mut cmd = Command::new(&settings.service_manager);
                cmd.arg("is-active").arg(unit);
                let label = format!("{} is-active {}", settings.service_manager, unit);
                let output =
                    run_process(cmd, None, settings.command_timeout(), cancel, &label).await?;
                Ok(Some(Snapshot::Service {
                    unit: unit.clone(),
                    was_active: output.success(),
                }))
            }
            Action::Ssh { host } => match (&directives.capture, &directives.restore) {
                (Some(capture), Some(restore)) => {
                    let cmd = ssh_command(&settings.ssh_binary, host, capture);
                    let label = format!("capture on {}", host.name);
                    let output =
                        run_checked(cmd, None, settings.remote_timeout(), cancel, &label).await?;
                    Ok(Some(Snapshot::Remote {
                        host: host.clone(),
                        restore: restore.clone(),
                        captured: output.stdout,
                    }))
                }
                _ => Ok(None),
            },
            Action::Http { method, url } if is_reversible(method) => {
                let response =
                    send_request(&self.http, Method::GET, url, None, settings.http_timeout(), cancel)
                        .await?;
                let previous = if response.is_success() {
                    Some(response.body)
                } else if response.status == 404 {
                    None
                } else {
                    return Err(execution_error(format!(
                        "cannot snapshot {}: GET returned {}",
                        url, response.status
                    )));
                };
                Ok(Some(Snapshot::Http {
                    url: url.clone(),
                    previous,
                }))
            }
            Action::Http { .. } => Ok(None),
        }
    }

    /// Put a target back into its snapshot state. Runs to completion even
    /// when the run has been cancelled.
    pub(super) async fn restore(&self, snapshot: &Snapshot, env: &Environment) -> PipelineResult<()> {
        self.put_back(snapshot, env)
            .await
            .map_err(|e| PipelineError::Rollback {
                message: format!("restoring {}: {}", snapshot.describe(), e),
            })
    }

    async fn put_back(&self, snapshot: &Snapshot, env: &Environment) -> PipelineResult<()> {
        let settings = &self.settings;
        let token = CancellationToken::new();

        match snapshot {
            Snapshot::File { path, previous } => {
                let label = format!("restore {}", path.display());
                let put_back = async {
                    match previous {
                        Some(bytes) => write_bytes_atomic(path, bytes).await,
                        None => match tokio::fs::remove_file(path).await {
                            Ok(()) => Ok(()),
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                            Err(e) => Err(e.into()),
                        },
                    }
                };
                with_deadline(put_back, settings.command_timeout(), &token, &label).await
            }
            Snapshot::Service { unit, was_active } => {
                let verb = if *was_active { "start" } else { "stop" };
                let mut cmd = Command::new(&settings.service_manager);
                cmd.arg(verb).arg(unit);
                let label = format!("{} {} {}", settings.service_manager, verb, unit);
                run_checked(cmd, None, settings.command_timeout(), &token, &label).await?;
                Ok(())
            }
            Snapshot::Command { command } => {
                let cmd = shell_command(
                    &settings.shell,
                    command,
                    true,
                    env.working_dir.as_deref(),
                    &env.variables,
                );
                run_checked(cmd, None, settings.command_timeout(), &token, "rollback").await?;
                Ok(())
            }
            Snapshot::Remote {
                host,
                restore,
                captured,
            } => {
                let cmd = ssh_command(&settings.ssh_binary, host, restore);
                let label = format!("restore on {}", host.name);
                run_checked(
                    cmd,
                    Some(captured.as_bytes()),
                    settings.remote_timeout(),
                    &token,
                    &label,
                )
                .await?;
                Ok(())
            }
            Snapshot::Http { url, previous } => {
                let (method, body) = match previous {
                    Some(body) => (Method::PUT, Some(body.as_str())),
                    None => (Method::DELETE, None),
                };
                let response = send_request(
                    &self.http,
                    method.clone(),
                    url,
                    body,
                    settings.http_timeout(),
                    &token,
                )
                .await?;
                if response.is_success() || (method == Method::DELETE && response.status == 404) {
                    Ok(())
                } else {
                    Err(execution_error(format!(
                        "{} {} returned {}",
                        method, url, response.status
                    )))
                }
            }
        }
    }
}
