//! In-memory deployment store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus, ProjectId};

use super::{active_conflict, check_transition, DeploymentFilter, DeploymentStore};

/// In-memory deployment store.
///
/// Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, DeploymentRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(records: &mut [DeploymentRecord]) {
    records.sort_by(|a, b| {
        b.data
            .created_at
            .cmp(&a.data.created_at)
            .then_with(|| b.data.id.cmp(&a.data.id))
    });
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let key = record.data.id.as_str().to_owned();
        if deployments.contains_key(&key) {
            return Err(ControlError::internal(format!(
                "deployment {key} already exists"
            )));
        }

        if record.status.is_active()
            && deployments
                .values()
                .any(|r| r.data.project_id == record.data.project_id && r.status.is_active())
        {
            return Err(active_conflict(&record.data.project_id));
        }

        deployments.insert(key, record.clone());
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(deployments.get(id.as_str()).cloned())
    }

    async fn get_active(&self, project_id: &ProjectId) -> ControlResult<Option<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(deployments
            .values()
            .find(|r| &r.data.project_id == project_id && r.status.is_active())
            .cloned())
    }

    async fn get_by_project(
        &self,
        project_id: &ProjectId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        let filter = DeploymentFilter::new()
            .with_project(project_id.clone())
            .with_limit(1);
        Ok(self.list(&filter).await?.into_iter().next())
    }

    async fn update(
        &self,
        record: &DeploymentRecord,
        expected: DeploymentStatus,
    ) -> ControlResult<()> {
        check_transition(expected, record.status)?;

        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let stored = deployments
            .get_mut(record.data.id.as_str())
            .ok_or_else(|| ControlError::not_found("deployment", record.data.id.as_str()))?;

        if stored.status != expected {
            return Err(ControlError::InvalidStateTransition {
                from: stored.status.as_str(),
                to: record.status.as_str(),
            });
        }

        stored.status = record.status;
        stored.data.resource_descriptor = record.data.resource_descriptor.clone();
        stored.data.partial_resources = record.data.partial_resources.clone();
        stored.data.error = record.data.error.clone();
        stored.data.teardown_message = record.data.teardown_message.clone();
        stored.data.updated_at = record.data.updated_at;

        Ok(())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut results: Vec<_> = deployments
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        drop(deployments);

        newest_first(&mut results);

        let offset = filter
            .offset
            .map_or(0, |o| usize::try_from(o).unwrap_or(usize::MAX));
        let limit = filter
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));

        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        if deployments.remove(id.as_str()).is_none() {
            return Err(ControlError::not_found("deployment", id.as_str()));
        }

        Ok(())
    }
}
