//! Configuration for datalake-control.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};
use crate::types::DeployType;

/// Top-level configuration shared by the submission side and the worker.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Job queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Provisioning tool configuration.
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Deployment lifecycle configuration.
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `datalake.toml` in the current directory (if present)
    /// 3. Environment variables with `DATALAKE_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("datalake.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DATALAKE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the worker misbehave.
    pub fn validate(&self) -> ControlResult<()> {
        if self.worker.concurrency == 0 {
            return Err(ControlError::Config(
                "worker.concurrency must be at least 1".to_owned(),
            ));
        }
        if self.queue.max_deliveries == 0 {
            return Err(ControlError::Config(
                "queue.max_deliveries must be at least 1".to_owned(),
            ));
        }
        let job_limit = self.provisioning.job_time_limit_secs();
        if self.queue.visibility_timeout_secs <= job_limit {
            return Err(ControlError::Config(format!(
                "queue.visibility_timeout_secs ({}) must exceed the longest job ({job_limit}s)",
                self.queue.visibility_timeout_secs
            )));
        }
        if self.worker.reconcile_interval_secs == Some(0) {
            return Err(ControlError::Config(
                "worker.reconcile_interval_secs must be at least 1".to_owned(),
            ));
        }
        if self.deployment.stale_after_secs <= job_limit {
            return Err(ControlError::Config(format!(
                "deployment.stale_after_secs ({}) must exceed the longest job ({job_limit}s)",
                self.deployment.stale_after_secs
            )));
        }
        Ok(())
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/datalake".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Where jobs and deployment records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// PostgreSQL, shared between processes.
    #[default]
    Postgres,

    /// In-process memory, for tests and single-process runs.
    Memory,
}

/// Job queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Storage backend for jobs and deployment records.
    #[serde(default)]
    pub backend: BackendKind,

    /// Logical queue name.
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Table holding queued messages.
    #[serde(default = "default_queue_table")]
    pub table: String,

    /// How long a received job stays invisible to other workers.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Idle wait between polls of an empty queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deliveries after which a job is abandoned.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

fn default_queue_name() -> String {
    "deployments".to_owned()
}

fn default_queue_table() -> String {
    "datalake_jobs".to_owned()
}

const fn default_visibility_timeout_secs() -> u64 {
    14_400
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_max_deliveries() -> u32 {
    3
}

impl QueueConfig {
    /// Visibility timeout as a duration.
    #[must_use]
    pub const fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            name: default_queue_name(),
            table: default_queue_table(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Jobs processed concurrently by one worker process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How long in-flight jobs may run after a shutdown signal.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Run the stale-record sweep this often. Disabled when unset.
    #[serde(default)]
    pub reconcile_interval_secs: Option<u64>,
}

const fn default_concurrency() -> usize {
    4
}

const fn default_drain_timeout_secs() -> u64 {
    60
}

impl WorkerConfig {
    /// Drain timeout as a duration.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            drain_timeout_secs: default_drain_timeout_secs(),
            reconcile_interval_secs: None,
        }
    }
}

/// Infrastructure-as-code tool in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// The Terraform CLI.
    #[default]
    Terraform,

    /// In-memory mock for testing.
    Mock,
}

/// Remote state backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    /// Google Cloud Storage.
    Gcs,
    /// Amazon S3.
    S3,
}

/// Remote state storage for the provisioning tool.
#[derive(Debug, Clone, Deserialize)]
pub struct StateBackendConfig {
    /// Backend kind.
    pub kind: StateBackendKind,

    /// Bucket holding state files.
    pub bucket: String,

    /// Key prefix; state lives under `{prefix}/{project_id}/{deployment_id}`.
    #[serde(default = "default_state_prefix")]
    pub prefix: String,

    /// Bucket region, required for S3.
    #[serde(default)]
    pub region: Option<String>,
}

fn default_state_prefix() -> String {
    "terraform".to_owned()
}

/// Provisioning tool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    /// Tool implementation.
    #[serde(default)]
    pub tool: ToolKind,

    /// Path to the tool binary.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Root directory for per-deployment workspaces.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Time limit for a single tool operation.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,

    /// Remote state backend. Without one, state stays in the workspace.
    #[serde(default)]
    pub state_backend: Option<StateBackendConfig>,

    /// AWS region when the request does not name one.
    #[serde(default = "default_aws_region")]
    pub aws_region: String,

    /// GCP region when the request does not name one.
    #[serde(default = "default_gcp_region")]
    pub gcp_region: String,

    /// GCP multi-region or region for datasets and buckets.
    #[serde(default = "default_gcp_location")]
    pub gcp_location: String,

    /// Azure location when the request does not name one.
    #[serde(default = "default_azure_location")]
    pub azure_location: String,
}

fn default_binary() -> PathBuf {
    PathBuf::from("terraform")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/datalake/workspaces")
}

const fn default_tool_timeout_secs() -> u64 {
    1800
}

fn default_aws_region() -> String {
    "us-east-1".to_owned()
}

fn default_gcp_region() -> String {
    "us-central1".to_owned()
}

fn default_gcp_location() -> String {
    "US".to_owned()
}

fn default_azure_location() -> String {
    "westeurope".to_owned()
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            tool: ToolKind::default(),
            binary: default_binary(),
            work_dir: default_work_dir(),
            timeout_secs: default_tool_timeout_secs(),
            state_backend: None,
            aws_region: default_aws_region(),
            gcp_region: default_gcp_region(),
            gcp_location: default_gcp_location(),
            azure_location: default_azure_location(),
        }
    }
}

impl ProvisioningConfig {
    /// Upper bound on one job's wall time, in seconds.
    ///
    /// A deploy runs `init`, then `apply` and `output` for every stage, each
    /// bounded by `timeout_secs`.
    #[must_use]
    pub fn job_time_limit_secs(&self) -> u64 {
        let operations = 1 + 2 * u64::from(DeployType::MAX_STAGES);
        self.timeout_secs.saturating_mul(operations)
    }
}

/// What happens to a record after a successful teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep the record as `destroyed` for auditing.
    #[default]
    Retain,

    /// Delete the record.
    Delete,
}

/// Deployment lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    /// Fate of destroyed records.
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// In-flight records untouched for this long are considered abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

const fn default_stale_after_secs() -> u64 {
    14_400
}

impl DeploymentConfig {
    /// Age after which an in-flight record is abandoned.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}
