//! Project and credential lookups.
//!
//! Projects and their credentials are owned by the request layer. The
//! orchestration core only reads them when a request is submitted.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::{Credentials, Project, ProjectId, UserId};

/// Read access to projects.
#[async_trait]
pub trait ProjectStore: Send + Sync + std::fmt::Debug {
    /// Get a project owned by `user`.
    ///
    /// A project owned by someone else is reported as not found.
    async fn get(&self, user: &UserId, project_id: &ProjectId) -> ControlResult<Project>;
}

/// Read access to provider credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
    /// Get the credentials stored for a project, if any.
    async fn get(&self, project_id: &ProjectId) -> ControlResult<Option<Credentials>>;
}

/// In-memory project table.
#[derive(Debug, Default)]
pub struct MemoryProjects {
    projects: RwLock<HashMap<ProjectId, Project>>,
}

impl MemoryProjects {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a project.
    pub fn insert(&self, project: Project) -> ControlResult<()> {
        self.projects
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .insert(project.id.clone(), project);
        Ok(())
    }

    /// Remove a project.
    pub fn remove(&self, project_id: &ProjectId) -> ControlResult<Option<Project>> {
        Ok(self
            .projects
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .remove(project_id))
    }
}

#[async_trait]
impl ProjectStore for MemoryProjects {
    async fn get(&self, user: &UserId, project_id: &ProjectId) -> ControlResult<Project> {
        let projects = self
            .projects
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        projects
            .get(project_id)
            .filter(|p| &p.owner == user)
            .cloned()
            .ok_or_else(|| ControlError::not_found("project", project_id.as_str()))
    }
}

/// In-memory credential table.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    credentials: RwLock<HashMap<ProjectId, Credentials>>,
}

impl MemoryCredentials {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store credentials for a project.
    pub fn insert(&self, project_id: ProjectId, credentials: Credentials) -> ControlResult<()> {
        self.credentials
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .insert(project_id, credentials);
        Ok(())
    }

    /// Forget a project's credentials.
    pub fn remove(&self, project_id: &ProjectId) -> ControlResult<Option<Credentials>> {
        Ok(self
            .credentials
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .remove(project_id))
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn get(&self, project_id: &ProjectId) -> ControlResult<Option<Credentials>> {
        let credentials = self
            .credentials
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(credentials.get(project_id).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::{credentials, project};
    use crate::types::ServiceProvider;

    #[tokio::test]
    async fn project_is_scoped_to_owner() {
        let projects = MemoryProjects::new();
        let project = project(ServiceProvider::Aws);
        projects.insert(project.clone()).unwrap();

        let found = projects.get(&project.owner, &project.id).await.unwrap();
        assert_eq!(found, project);

        let err = projects
            .get(&UserId::new("someone-else"), &project.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound { entity: "project", .. }));
    }

    #[tokio::test]
    async fn credentials_roundtrip() {
        let store = MemoryCredentials::new();
        let id = ProjectId::new("proj-1");
        assert!(store.get(&id).await.unwrap().is_none());

        store.insert(id.clone(), credentials(ServiceProvider::Gcp)).unwrap();
        let found = store.get(&id).await.unwrap().unwrap();
        assert_eq!(found.provider(), ServiceProvider::Gcp);

        store.remove(&id).unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }
}
