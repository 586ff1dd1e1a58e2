//! Deployment storage backends.
//!
//! [`DeploymentStore`] persists deployment records. PostgreSQL is the
//! production backend; [`MemoryStore`] serves tests and single-process runs.
//!
//! Both backends enforce the two rules the lifecycle depends on:
//!
//! - at most one record per project is in an active status (`deploying`,
//!   `deployed`, `destroying`); a second insert is a [`ControlError::Conflict`]
//! - updates are compare-and-set on the status the caller last observed, and
//!   only follow edges of the lifecycle graph
//!
//! [`ProjectStore`] and [`CredentialStore`] are read-only views onto data
//! owned by the request layer.

mod memory;
mod postgres;
mod projects;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use projects::{CredentialStore, MemoryCredentials, MemoryProjects, ProjectStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus, ProjectId};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by project ID.
    pub project_id: Option<ProjectId>,
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Only records last updated before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            project_id: None,
            status: None,
            updated_before: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by project ID.
    #[must_use]
    pub fn with_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only records not updated since `instant`.
    #[must_use]
    pub const fn updated_before(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_before = Some(instant);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether a record passes the filter (ignoring pagination).
    #[must_use]
    pub fn matches(&self, record: &DeploymentRecord) -> bool {
        self.project_id
            .as_ref()
            .map_or(true, |p| &record.data.project_id == p)
            && self.status.map_or(true, |s| record.status == s)
            && self
                .updated_before
                .map_or(true, |t| record.data.updated_at < t)
    }
}

/// Reject updates that do not follow the lifecycle graph.
pub(crate) fn check_transition(
    expected: DeploymentStatus,
    next: DeploymentStatus,
) -> ControlResult<()> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(ControlError::InvalidStateTransition {
            from: expected.as_str(),
            to: next.as_str(),
        })
    }
}

pub(crate) fn active_conflict(project_id: &ProjectId) -> ControlError {
    ControlError::conflict(format!("project {project_id} already has an active deployment"))
}

/// Backend for storing deployment records.
#[async_trait]
pub trait DeploymentStore: Send + Sync + std::fmt::Debug {
    /// Insert a new deployment record.
    ///
    /// Fails with [`ControlError::Conflict`] if the record is active and the
    /// project already has an active record.
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// Get a deployment by ID.
    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// Get the project's active deployment, if any.
    async fn get_active(&self, project_id: &ProjectId) -> ControlResult<Option<DeploymentRecord>>;

    /// Get the project's most recently created deployment, in any status.
    async fn get_by_project(
        &self,
        project_id: &ProjectId,
    ) -> ControlResult<Option<DeploymentRecord>>;

    /// Persist `record` if the stored record is still in `expected`.
    ///
    /// Writes the status, descriptors and error from `record`. Fails with
    /// [`ControlError::InvalidStateTransition`] when the stored status has
    /// moved on or the edge is not part of the lifecycle, and with
    /// [`ControlError::NotFound`] when the record is gone.
    async fn update(
        &self,
        record: &DeploymentRecord,
        expected: DeploymentStatus,
    ) -> ControlResult<()>;

    /// List deployments matching the filter, newest first.
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>>;

    /// Delete a deployment record.
    async fn delete(&self, id: &DeploymentId) -> ControlResult<()>;
}
