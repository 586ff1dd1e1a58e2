//! Infrastructure-as-code tool seam.
//!
//! Strategies render configuration into a [`Workspace`] and drive a
//! [`ProvisioningTool`] through init, apply, output and destroy. The real
//! implementation shells out to Terraform; [`MockTool`] keeps everything in
//! memory for tests and local runs.

mod terraform;

pub use terraform::Terraform;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{debug, warn};

use crate::config::{ProvisioningConfig, ToolKind};
use crate::error::ProviderError;
use crate::types::{DeploymentId, ProjectId};

/// Working directory for one deployment plus the credentials the tool
/// process receives through its environment.
pub struct Workspace {
    dir: PathBuf,
    env: Vec<(&'static str, SecretString)>,
    remote_state: Option<String>,
}

impl Workspace {
    /// Create (or reuse) the workspace for a deployment under `root`.
    pub async fn open(
        root: &Path,
        project: &ProjectId,
        deployment: &DeploymentId,
        env: Vec<(&'static str, SecretString)>,
    ) -> Result<Self, ProviderError> {
        let dir = root
            .join(path_segment(project.as_str()))
            .join(path_segment(deployment.as_str()));

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ProviderError::Workspace(format!("failed to create {}: {e}", dir.display()))
        })?;

        Ok(Self {
            dir,
            env,
            remote_state: None,
        })
    }

    /// Mark the workspace as keeping its state remotely under `key`.
    #[must_use]
    pub fn with_remote_state(mut self, key: impl Into<String>) -> Self {
        self.remote_state = Some(key.into());
        self
    }

    /// Remote state key, if state is not kept in the directory.
    #[must_use]
    pub fn remote_state(&self) -> Option<&str> {
        self.remote_state.as_deref()
    }

    /// Identity of the state the tool reads and writes.
    #[must_use]
    pub fn state_id(&self) -> String {
        self.remote_state
            .clone()
            .unwrap_or_else(|| self.dir.display().to_string())
    }

    /// Directory the tool runs in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Environment passed to the tool process.
    #[must_use]
    pub fn env(&self) -> &[(&'static str, SecretString)] {
        &self.env
    }

    /// Write a configuration file into the workspace.
    pub async fn write(&self, file: &str, contents: &str) -> Result<(), ProviderError> {
        let path = self.dir.join(file);
        tokio::fs::write(&path, contents).await.map_err(|e| {
            ProviderError::Workspace(format!("failed to write {}: {e}", path.display()))
        })
    }

    /// Remove the workspace and everything in it.
    pub async fn remove(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove workspace");
        }
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.env.iter().map(|(name, _)| *name).collect();
        f.debug_struct("Workspace")
            .field("dir", &self.dir)
            .field("env", &names)
            .field("remote_state", &self.remote_state)
            .finish()
    }
}

fn path_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// An infrastructure-as-code tool.
#[async_trait]
pub trait ProvisioningTool: Send + Sync + std::fmt::Debug {
    /// Prepare the workspace (providers, backend).
    async fn init(&self, workspace: &Workspace) -> Result<(), ProviderError>;

    /// Create or update the resources at `targets`.
    async fn apply(&self, workspace: &Workspace, targets: &[String]) -> Result<(), ProviderError>;

    /// Read the workspace's outputs as strings.
    async fn outputs(
        &self,
        workspace: &Workspace,
    ) -> Result<BTreeMap<String, String>, ProviderError>;

    /// Remove every resource the workspace manages.
    async fn destroy(&self, workspace: &Workspace) -> Result<(), ProviderError>;

    /// Whether the workspace sees state for its deployment.
    ///
    /// Remote state always counts. Local state only exists in the directory
    /// of the host that applied it, so a fresh directory reports `false`.
    async fn has_state(&self, workspace: &Workspace) -> Result<bool, ProviderError>;
}

/// Create a provisioning tool from configuration.
#[must_use]
pub fn create_tool(config: &ProvisioningConfig) -> Arc<dyn ProvisioningTool> {
    match config.tool {
        ToolKind::Terraform => Arc::new(Terraform::new(
            config.binary.clone(),
            Duration::from_secs(config.timeout_secs),
        )),
        ToolKind::Mock => Arc::new(MockTool::new()),
    }
}

/// A call recorded by [`MockTool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    /// `init`.
    Init,
    /// `apply` with its targets.
    Apply(Vec<String>),
    /// `outputs`.
    Outputs,
    /// `destroy`.
    Destroy,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<ToolCall>,
    env_seen: BTreeSet<&'static str>,
    live: HashMap<String, BTreeSet<String>>,
    outputs: BTreeMap<String, String>,
    failing_targets: HashMap<String, String>,
    destroy_failure: Option<ProviderError>,
    delay: Option<Duration>,
}

/// In-memory provisioning tool for tests and local runs.
///
/// Tracks which targets are live per state (the workspace directory, or its
/// remote state key) and can be told to fail specific targets or teardown.
#[derive(Debug, Default)]
pub struct MockTool {
    state: Mutex<MockState>,
}

impl MockTool {
    /// Create a mock tool that succeeds at everything.
    #[must_use]
    pub fn new() -> Self {
        let tool = Self::default();
        tool.set_output(
            "opensearch_endpoint",
            "search-datalake.us-east-1.es.amazonaws.com",
        );
        tool
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Set an output value returned after apply.
    pub fn set_output(&self, name: impl Into<String>, value: impl Into<String>) {
        self.with_state(|s| s.outputs.insert(name.into(), value.into()));
    }

    /// Remove an output so it is reported missing.
    pub fn remove_output(&self, name: &str) {
        self.with_state(|s| s.outputs.remove(name));
    }

    /// Make `apply` fail whenever `target` is included.
    pub fn fail_target(&self, target: impl Into<String>, stderr: impl Into<String>) {
        self.with_state(|s| s.failing_targets.insert(target.into(), stderr.into()));
    }

    /// Stop failing every target.
    pub fn clear_failures(&self) {
        self.with_state(|s| {
            s.failing_targets.clear();
            s.destroy_failure = None;
        });
    }

    /// Make `destroy` fail with `error`.
    pub fn fail_destroy(&self, error: ProviderError) {
        self.with_state(|s| s.destroy_failure = Some(error));
    }

    /// Make `destroy` report that the resources no longer exist.
    pub fn destroy_reports_not_found(&self) {
        self.fail_destroy(ProviderError::CommandFailed {
            operation: "destroy",
            exit_code: Some(1),
            stderr: "Error: 404 Not Found".to_owned(),
        });
    }

    /// Delay every call, to keep jobs in flight.
    pub fn set_delay(&self, delay: Duration) {
        self.with_state(|s| s.delay = Some(delay));
    }

    /// Calls made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ToolCall> {
        self.with_state(|s| s.calls.clone())
    }

    /// Environment variable names the tool has been handed.
    #[must_use]
    pub fn env_seen(&self) -> BTreeSet<&'static str> {
        self.with_state(|s| s.env_seen.clone())
    }

    /// Targets currently live across all workspaces.
    #[must_use]
    pub fn live_targets(&self) -> BTreeSet<String> {
        self.with_state(|s| s.live.values().flatten().cloned().collect())
    }

    async fn enter(&self, workspace: &Workspace, call: ToolCall) {
        let delay = self.with_state(|s| {
            s.calls.push(call);
            s.env_seen.extend(workspace.env().iter().map(|(name, _)| *name));
            s.delay
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ProvisioningTool for MockTool {
    async fn init(&self, workspace: &Workspace) -> Result<(), ProviderError> {
        self.enter(workspace, ToolCall::Init).await;
        Ok(())
    }

    async fn apply(&self, workspace: &Workspace, targets: &[String]) -> Result<(), ProviderError> {
        self.enter(workspace, ToolCall::Apply(targets.to_vec())).await;
        self.with_state(|s| {
            if let Some(stderr) = targets.iter().find_map(|t| s.failing_targets.get(t)) {
                return Err(ProviderError::CommandFailed {
                    operation: "apply",
                    exit_code: Some(1),
                    stderr: stderr.clone(),
                });
            }
            debug!(?targets, "mock apply");
            s.live
                .entry(workspace.state_id())
                .or_default()
                .extend(targets.iter().cloned());
            Ok(())
        })
    }

    async fn outputs(
        &self,
        workspace: &Workspace,
    ) -> Result<BTreeMap<String, String>, ProviderError> {
        self.enter(workspace, ToolCall::Outputs).await;
        Ok(self.with_state(|s| s.outputs.clone()))
    }

    async fn destroy(&self, workspace: &Workspace) -> Result<(), ProviderError> {
        self.enter(workspace, ToolCall::Destroy).await;
        self.with_state(|s| {
            if let Some(error) = s.destroy_failure.clone() {
                return Err(error);
            }
            if let Some(targets) = s.live.get_mut(&workspace.state_id()) {
                targets.clear();
            }
            Ok(())
        })
    }

    async fn has_state(&self, workspace: &Workspace) -> Result<bool, ProviderError> {
        if workspace.remote_state().is_some() {
            return Ok(true);
        }
        Ok(self.with_state(|s| s.live.contains_key(&workspace.state_id())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn workspace(root: &Path) -> Workspace {
        Workspace::open(
            root,
            &ProjectId::new("../escape/attempt"),
            &DeploymentId::new("dep-1"),
            vec![("AWS_ACCESS_KEY_ID", SecretString::from("AKIA".to_owned()))],
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn workspace_stays_under_root() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace(root.path()).await;

        assert!(ws.dir().starts_with(root.path()));
        assert!(ws.dir().ends_with("___escape_attempt/dep-1"));

        ws.write("main.tf", "terraform {}").await.unwrap();
        assert!(ws.dir().join("main.tf").exists());

        let dir = ws.dir().to_path_buf();
        ws.remove().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn workspace_debug_hides_secrets() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace(root.path()).await;
        let debug = format!("{ws:?}");
        assert!(debug.contains("AWS_ACCESS_KEY_ID"));
        assert!(!debug.contains("AKIA"));
    }

    #[tokio::test]
    async fn mock_tracks_live_targets() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace(root.path()).await;
        let tool = MockTool::new();

        tool.init(&ws).await.unwrap();
        tool.apply(&ws, &["aws_s3_bucket.datalake".to_owned()])
            .await
            .unwrap();
        assert_eq!(tool.live_targets().len(), 1);
        assert!(tool.env_seen().contains("AWS_ACCESS_KEY_ID"));

        tool.destroy(&ws).await.unwrap();
        assert!(tool.live_targets().is_empty());
        assert_eq!(
            tool.calls(),
            vec![
                ToolCall::Init,
                ToolCall::Apply(vec!["aws_s3_bucket.datalake".to_owned()]),
                ToolCall::Destroy
            ]
        );
    }

    #[tokio::test]
    async fn mock_state_belongs_to_one_directory() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let here = workspace(first.path()).await;
        let elsewhere = workspace(second.path()).await;
        let tool = MockTool::new();

        assert!(!tool.has_state(&here).await.unwrap());
        tool.apply(&here, &["aws_s3_bucket.datalake".to_owned()])
            .await
            .unwrap();
        assert!(tool.has_state(&here).await.unwrap());
        assert!(!tool.has_state(&elsewhere).await.unwrap());

        // Emptied state is still state.
        tool.destroy(&here).await.unwrap();
        assert!(tool.has_state(&here).await.unwrap());
    }

    #[tokio::test]
    async fn mock_remote_state_is_shared_between_directories() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let here = workspace(first.path()).await.with_remote_state("lake/p1/d1");
        let elsewhere = workspace(second.path())
            .await
            .with_remote_state("lake/p1/d1");
        let tool = MockTool::new();

        tool.apply(&here, &["aws_s3_bucket.datalake".to_owned()])
            .await
            .unwrap();
        assert!(tool.has_state(&elsewhere).await.unwrap());

        tool.destroy(&elsewhere).await.unwrap();
        assert!(tool.live_targets().is_empty());
    }

    #[tokio::test]
    async fn mock_fails_configured_targets() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace(root.path()).await;
        let tool = MockTool::new();
        tool.fail_target("aws_dynamodb_table.datalake", "LimitExceededException");

        let err = tool
            .apply(&ws, &["aws_dynamodb_table.datalake".to_owned()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("LimitExceededException"));
        assert!(tool.live_targets().is_empty());
    }
}
