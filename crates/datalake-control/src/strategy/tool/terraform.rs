//! Terraform CLI driver.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::ProviderError;

use super::{ProvisioningTool, Workspace};

/// How much of stderr to keep in error messages.
const STDERR_TAIL: usize = 4096;

/// State file written by the local backend.
const LOCAL_STATE: &str = "terraform.tfstate";

/// Runs the `terraform` binary inside a workspace.
#[derive(Debug, Clone)]
pub struct Terraform {
    binary: PathBuf,
    timeout: Duration,
}

impl Terraform {
    /// Create a driver for `binary` with a per-operation time limit.
    #[must_use]
    pub const fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    #[instrument(skip(self, workspace, args), fields(dir = %workspace.dir().display()))]
    async fn run(
        &self,
        workspace: &Workspace,
        operation: &'static str,
        args: &[String],
    ) -> Result<String, ProviderError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("-chdir={}", workspace.dir().display()))
            .args(args)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in workspace.env() {
            cmd.env(name, value.expose_secret());
        }

        debug!("spawning terraform");
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|e| ProviderError::Spawn {
            binary: self.binary.display().to_string(),
            message: e.to_string(),
        })?;

        let stdout_task = tokio::spawn(read_all(child.stdout.take()));
        let stderr_task = tokio::spawn(read_all(child.stderr.take()));

        let status = match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ProviderError::Spawn {
                    binary: self.binary.display().to_string(),
                    message: format!("process error: {e}"),
                });
            }
            Err(_) => {
                warn!(limit = ?self.timeout, "terraform timed out, killing");
                child.kill().await.ok();
                return Err(ProviderError::Timeout {
                    operation,
                    limit: self.timeout,
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        debug!(
            exit_code = ?status.code(),
            duration = ?start.elapsed(),
            "terraform finished"
        );

        if !status.success() {
            return Err(ProviderError::CommandFailed {
                operation,
                exit_code: status.code(),
                stderr: tail(&stderr, STDERR_TAIL),
            });
        }

        Ok(stdout)
    }
}

async fn read_all<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_string(&mut buf).await {
            warn!(error = %e, "failed to read terraform output");
        }
    }
    buf
}

fn tail(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_owned();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

fn common_args(subcommand: &str) -> Vec<String> {
    vec![
        subcommand.to_owned(),
        "-input=false".to_owned(),
        "-no-color".to_owned(),
    ]
}

/// Flatten `terraform output -json` into name/value strings.
fn parse_outputs(stdout: &str) -> Result<BTreeMap<String, String>, ProviderError> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(stdout)
        .map_err(|e| ProviderError::MalformedOutput(e.to_string()))?;

    raw.into_iter()
        .map(|(name, output)| {
            let value = match output.get("value") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    return Err(ProviderError::MalformedOutput(format!(
                        "output {name} has no value"
                    )))
                }
            };
            Ok((name, value))
        })
        .collect()
}

#[async_trait]
impl ProvisioningTool for Terraform {
    async fn init(&self, workspace: &Workspace) -> Result<(), ProviderError> {
        self.run(workspace, "init", &common_args("init")).await?;
        Ok(())
    }

    async fn apply(&self, workspace: &Workspace, targets: &[String]) -> Result<(), ProviderError> {
        let mut args = common_args("apply");
        args.push("-auto-approve".to_owned());
        args.extend(targets.iter().map(|t| format!("-target={t}")));
        self.run(workspace, "apply", &args).await?;
        Ok(())
    }

    async fn outputs(
        &self,
        workspace: &Workspace,
    ) -> Result<BTreeMap<String, String>, ProviderError> {
        let args = vec!["output".to_owned(), "-json".to_owned(), "-no-color".to_owned()];
        let stdout = self.run(workspace, "output", &args).await?;
        parse_outputs(&stdout)
    }

    async fn destroy(&self, workspace: &Workspace) -> Result<(), ProviderError> {
        let mut args = common_args("destroy");
        args.push("-auto-approve".to_owned());
        self.run(workspace, "destroy", &args).await?;
        Ok(())
    }

    async fn has_state(&self, workspace: &Workspace) -> Result<bool, ProviderError> {
        if workspace.remote_state().is_some() {
            return Ok(true);
        }
        let path = workspace.dir().join(LOCAL_STATE);
        tokio::fs::try_exists(&path).await.map_err(|e| {
            ProviderError::Workspace(format!("failed to inspect {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{DeploymentId, ProjectId};

    #[test]
    fn parses_output_json() {
        let stdout = r#"{
            "opensearch_endpoint": {"sensitive": false, "type": "string", "value": "search-x.es.amazonaws.com"},
            "count": {"sensitive": false, "type": "number", "value": 3}
        }"#;
        let outputs = parse_outputs(stdout).unwrap();
        assert_eq!(outputs["opensearch_endpoint"], "search-x.es.amazonaws.com");
        assert_eq!(outputs["count"], "3");
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(matches!(
            parse_outputs("not json"),
            Err(ProviderError::MalformedOutput(_))
        ));
        assert!(parse_outputs(r#"{"x": {"type": "string"}}"#).is_err());
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "a".repeat(10) + "END";
        assert_eq!(tail(&long, 3), "...END");
        assert_eq!(tail("  short \n", 100), "short");
    }

    #[tokio::test]
    async fn local_state_is_the_state_file() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::open(
            root.path(),
            &ProjectId::new("p1"),
            &DeploymentId::new("d1"),
            Vec::new(),
        )
        .await
        .unwrap();
        let tf = Terraform::new(PathBuf::from("terraform"), Duration::from_secs(5));

        assert!(!tf.has_state(&ws).await.unwrap());
        ws.write(LOCAL_STATE, "{}").await.unwrap();
        assert!(tf.has_state(&ws).await.unwrap());

        let remote = Workspace::open(
            root.path(),
            &ProjectId::new("p1"),
            &DeploymentId::new("d2"),
            Vec::new(),
        )
        .await
        .unwrap()
        .with_remote_state("lake/p1/d2");
        assert!(tf.has_state(&remote).await.unwrap());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::open(
            root.path(),
            &ProjectId::new("p1"),
            &DeploymentId::new("d1"),
            Vec::new(),
        )
        .await
        .unwrap();

        let tf = Terraform::new(
            PathBuf::from("/nonexistent/terraform-binary"),
            Duration::from_secs(5),
        );
        let err = tf.init(&ws).await.unwrap_err();
        assert!(matches!(err, ProviderError::Spawn { .. }));
    }
}
