//! Orchestration job queue.
//!
//! Submission publishes a [`Job`] and returns; workers receive it later. The
//! queue is at-least-once: a received message stays invisible for the
//! visibility timeout and reappears unless it is acknowledged, so a crashed
//! worker's job is delivered again. Every delivery carries its attempt count.

mod memory;
mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ControlResult;
use crate::types::{
    Credentials, DeployParameters, DeployType, DeploymentId, DeploymentRecord, Project, UserId,
};

/// Identifier assigned to a published message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap a backend-assigned identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Message identifier, used to ack or nack.
    pub id: MessageId,
    /// Encoded job.
    pub payload: Vec<u8>,
    /// How many times this message has been received, including this time.
    pub attempt: u32,
    /// When the message was first published.
    pub enqueued_at: DateTime<Utc>,
}

impl Delivery {
    /// Decode the job carried by this delivery.
    pub fn job(&self) -> ControlResult<Job> {
        Job::decode(&self.payload)
    }
}

/// Provision a new data lake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployJob {
    /// User that requested the deploy.
    pub user_id: UserId,
    /// Record created at submission.
    pub deployment_id: DeploymentId,
    /// Topology to provision.
    pub deploy_type: DeployType,
    /// Request parameters.
    #[serde(default, rename = "deploy_parameters")]
    pub parameters: DeployParameters,
    /// Project snapshot taken at submission.
    pub project: Project,
    /// Credential snapshot taken at submission.
    pub credentials: Credentials,
}

/// Tear down a deployed data lake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyJob {
    /// Project snapshot taken at submission.
    pub project: Project,
    /// Credential snapshot taken at submission.
    pub credentials: Credentials,
    /// Record snapshot, including its resource descriptor.
    #[serde(rename = "deployment_record")]
    pub deployment: DeploymentRecord,
}

/// Remove resources a failed deployment left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupJob {
    /// Project snapshot taken at submission.
    pub project: Project,
    /// Credential snapshot taken at submission.
    pub credentials: Credentials,
    /// Failed record snapshot.
    #[serde(rename = "deployment_record")]
    pub deployment: DeploymentRecord,
}

/// Work item carried on the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Provision resources.
    Deploy(DeployJob),
    /// Tear down resources.
    Destroy(DestroyJob),
    /// Tear down orphaned resources.
    Cleanup(CleanupJob),
}

impl Job {
    /// Record this job acts on.
    #[must_use]
    pub fn deployment_id(&self) -> &DeploymentId {
        match self {
            Self::Deploy(job) => &job.deployment_id,
            Self::Destroy(job) => job.deployment.id(),
            Self::Cleanup(job) => job.deployment.id(),
        }
    }

    /// Short name of the job kind, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Deploy(_) => "deploy",
            Self::Destroy(_) => "destroy",
            Self::Cleanup(_) => "cleanup",
        }
    }

    /// Project the job was submitted for.
    #[must_use]
    pub const fn project(&self) -> &Project {
        match self {
            Self::Deploy(job) => &job.project,
            Self::Destroy(job) => &job.project,
            Self::Cleanup(job) => &job.project,
        }
    }

    /// Encode the job as a queue payload.
    pub fn encode(&self) -> ControlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a queue payload.
    pub fn decode(payload: &[u8]) -> ControlResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Durable at-least-once queue of encoded jobs.
#[async_trait]
pub trait JobQueue: Send + Sync + fmt::Debug {
    /// Publish a message.
    async fn publish(&self, payload: &[u8]) -> ControlResult<MessageId>;

    /// Receive the next visible message, hiding it for `visibility_timeout`.
    async fn receive(&self, visibility_timeout: Duration) -> ControlResult<Option<Delivery>>;

    /// Acknowledge a message, removing it from the queue.
    async fn ack(&self, message_id: &MessageId) -> ControlResult<()>;

    /// Return a message to the queue for immediate redelivery.
    async fn nack(&self, message_id: &MessageId) -> ControlResult<()>;
}
