//! Common test utilities for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

pub mod fixtures;

use std::sync::Arc;

use datalake_control::config::{ProvisioningConfig, StateBackendConfig, StateBackendKind};
use datalake_control::queue::MemoryQueue;
use datalake_control::store::{DeploymentStore, MemoryCredentials, MemoryProjects, MemoryStore};
use datalake_control::strategy::MockTool;
use datalake_control::types::{DeploymentId, DeploymentRecord, ProjectId, ServiceProvider, UserId};
use datalake_control::{StrategyRegistry, Submitter, Worker, WorkerSettings};
use tempfile::TempDir;

use fixtures::{credentials, ProjectBuilder};

/// Memory-backed control plane with a mock provisioning tool.
pub struct TestControlPlane {
    pub tool: Arc<MockTool>,
    pub projects: Arc<MemoryProjects>,
    pub credentials: Arc<MemoryCredentials>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub submitter: Submitter,
    pub worker: Arc<Worker>,
    pub user: UserId,
    settings: WorkerSettings,
    state_backend: Option<StateBackendConfig>,
    work_dir: TempDir,
}

impl TestControlPlane {
    /// Creates a control plane with default worker settings.
    pub fn new() -> Self {
        Self::with_settings(WorkerSettings::default())
    }

    /// Creates a control plane with custom worker settings.
    pub fn with_settings(settings: WorkerSettings) -> Self {
        Self::build(settings, None)
    }

    /// Creates a control plane whose workers keep state in a shared bucket.
    pub fn with_shared_state() -> Self {
        let backend = StateBackendConfig {
            kind: StateBackendKind::Gcs,
            bucket: "datalake-state".to_owned(),
            prefix: "terraform".to_owned(),
            region: None,
        };
        Self::build(WorkerSettings::default(), Some(backend))
    }

    fn build(settings: WorkerSettings, state_backend: Option<StateBackendConfig>) -> Self {
        let work_dir = tempfile::tempdir().expect("failed to create work dir");
        let tool = Arc::new(MockTool::new());
        let projects = Arc::new(MemoryProjects::new());
        let credentials = Arc::new(MemoryCredentials::new());
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());

        let submitter = Submitter::new(
            projects.clone(),
            credentials.clone(),
            store.clone(),
            queue.clone(),
        );
        let worker = Arc::new(worker_in(
            &work_dir,
            &tool,
            &store,
            &queue,
            &settings,
            state_backend.clone(),
        ));

        Self {
            tool,
            projects,
            credentials,
            store,
            queue,
            submitter,
            worker,
            user: UserId::new("user-1"),
            settings,
            state_backend,
            work_dir,
        }
    }

    /// A second worker sharing the store, queue and tool but with its own
    /// working directory, as on another host.
    pub fn peer_worker(&self) -> (Arc<Worker>, TempDir) {
        let work_dir = tempfile::tempdir().expect("failed to create work dir");
        let worker = worker_in(
            &work_dir,
            &self.tool,
            &self.store,
            &self.queue,
            &self.settings,
            self.state_backend.clone(),
        );
        (Arc::new(worker), work_dir)
    }

    /// Registers a verified project with matching credentials.
    pub fn add_project(&self, id: &str, provider: ServiceProvider) -> ProjectId {
        self.add(ProjectBuilder::new(id, provider))
    }

    /// Registers a project that has not been verified yet.
    pub fn add_unverified_project(&self, id: &str, provider: ServiceProvider) -> ProjectId {
        self.add(ProjectBuilder::new(id, provider).unverified())
    }

    fn add(&self, builder: ProjectBuilder) -> ProjectId {
        let project = builder.build();
        let id = project.id.clone();
        self.credentials
            .insert(id.clone(), credentials(project.service_provider))
            .expect("failed to store credentials");
        self.projects.insert(project).expect("failed to store project");
        id
    }

    /// Processes queued jobs until the queue has nothing visible.
    pub async fn drain(&self) -> usize {
        drain_with(&self.worker).await
    }

    /// Fetches a record that must exist.
    pub async fn record(&self, id: &DeploymentId) -> DeploymentRecord {
        self.store
            .get(id)
            .await
            .expect("failed to read record")
            .expect("record not found")
    }
}

fn worker_in(
    work_dir: &TempDir,
    tool: &Arc<MockTool>,
    store: &Arc<MemoryStore>,
    queue: &Arc<MemoryQueue>,
    settings: &WorkerSettings,
    state_backend: Option<StateBackendConfig>,
) -> Worker {
    let config = ProvisioningConfig {
        work_dir: work_dir.path().to_path_buf(),
        state_backend,
        ..ProvisioningConfig::default()
    };
    let registry = StrategyRegistry::new(tool.clone(), config);
    Worker::new(store.clone(), registry, queue.clone(), settings.clone())
}

/// Processes queued jobs on `worker` until the queue has nothing visible.
pub async fn drain_with(worker: &Worker) -> usize {
    let mut processed = 0;
    while worker.process_next().await.expect("failed to process job") {
        processed += 1;
    }
    processed
}

impl Default for TestControlPlane {
    fn default() -> Self {
        Self::new()
    }
}
