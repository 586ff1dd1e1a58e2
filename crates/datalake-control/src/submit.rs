//! Synchronous job submission.
//!
//! The request-handling layer calls [`Submitter`] to ask for a deploy,
//! destroy or cleanup. Submission validates the request against the
//! project, its credentials and the deployment store, then publishes a job
//! and returns. It never talks to a cloud provider; completion is observed
//! later through the deployment store.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::error::{ControlError, ControlResult};
use crate::queue::{CleanupJob, DeployJob, DestroyJob, Job, JobQueue, MessageId};
use crate::registry::StrategyRegistry;
use crate::state::{Deploying, Deployment};
use crate::store::{CredentialStore, DeploymentStore, ProjectStore};
use crate::types::{
    Credentials, DeployRequest, DeploymentData, DeploymentId, DeploymentStatus, Project, ProjectId,
    UserId,
};

/// Acknowledgement of an accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Record the job acts on.
    pub deployment_id: DeploymentId,
    /// Queue message carrying the job.
    pub message_id: MessageId,
}

/// Validates requests and hands them to the worker pool.
#[derive(Debug, Clone)]
pub struct Submitter {
    projects: Arc<dyn ProjectStore>,
    credentials: Arc<dyn CredentialStore>,
    store: Arc<dyn DeploymentStore>,
    queue: Arc<dyn JobQueue>,
}

impl Submitter {
    /// Create a submitter.
    pub fn new(
        projects: Arc<dyn ProjectStore>,
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn DeploymentStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            projects,
            credentials,
            store,
            queue,
        }
    }

    /// Request a deploy for a project.
    ///
    /// Creates the deployment record in `deploying` and enqueues the job.
    /// Nothing is created when validation fails.
    #[instrument(skip(self, request), fields(deploy_type = %request.deploy_type))]
    pub async fn submit_deploy(
        &self,
        user: &UserId,
        project_id: &ProjectId,
        request: DeployRequest,
    ) -> ControlResult<Accepted> {
        let project = self.projects.get(user, project_id).await?;
        if !project.verified {
            return Err(ControlError::validation(format!(
                "project {project_id} doesn't have valid credentials"
            )));
        }

        let deploy_type = StrategyRegistry::parse(&request.deploy_type)?;
        StrategyRegistry::validate(deploy_type, &project, &request.parameters)?;

        let credentials = self.credentials_for(&project).await?;

        if let Some(active) = self.store.get_active(&project.id).await? {
            return Err(ControlError::conflict(format!(
                "project {project_id} is already deployed (deployment {} is {})",
                active.id(),
                active.status
            )));
        }

        let deploying = Deployment::<Deploying>::create(DeploymentData::new(
            project.id.clone(),
            user.clone(),
            deploy_type,
            request.parameters,
        ));
        let record = deploying.to_record();
        // The store's uniqueness rule settles races between concurrent submissions.
        self.store.insert(&record).await?;

        let job = Job::Deploy(DeployJob {
            user_id: user.clone(),
            deployment_id: record.id().clone(),
            deploy_type,
            parameters: record.data.parameters.clone(),
            project,
            credentials,
        });

        match self.enqueue(&job).await {
            Ok(message_id) => {
                info!(
                    deployment_id = %record.id(),
                    %message_id,
                    "deploy accepted"
                );
                Ok(Accepted {
                    deployment_id: record.data.id,
                    message_id,
                })
            }
            Err(e) => {
                let failed = deploying
                    .fail(format!("failed to enqueue deploy job: {e}"), None)
                    .into_record();
                if let Err(update_err) =
                    self.store.update(&failed, DeploymentStatus::Deploying).await
                {
                    error!(
                        deployment_id = %failed.id(),
                        error = %update_err,
                        "failed to mark unqueued deployment as failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Request teardown of a project's deployment.
    ///
    /// The record stays `deployed` until a worker picks the job up.
    #[instrument(skip(self))]
    pub async fn submit_destroy(
        &self,
        user: &UserId,
        project_id: &ProjectId,
    ) -> ControlResult<Accepted> {
        let project = self.projects.get(user, project_id).await?;

        let record = self
            .store
            .get_active(&project.id)
            .await?
            .ok_or_else(|| {
                ControlError::conflict(format!("project {project_id} is not deployed"))
            })?;

        if record.status != DeploymentStatus::Deployed {
            return Err(ControlError::conflict(format!(
                "project {project_id} is not deployed (deployment {} is {})",
                record.id(),
                record.status
            )));
        }
        if record
            .data
            .resource_descriptor
            .as_ref()
            .map_or(true, |r| r.is_empty())
        {
            return Err(ControlError::conflict(format!(
                "project {project_id} is not deployed (deployment {} has no resources)",
                record.id()
            )));
        }

        let credentials = self.credentials_for(&project).await?;
        let deployment_id = record.id().clone();

        let message_id = self
            .enqueue(&Job::Destroy(DestroyJob {
                project,
                credentials,
                deployment: record,
            }))
            .await?;

        info!(%deployment_id, %message_id, "destroy accepted");
        Ok(Accepted {
            deployment_id,
            message_id,
        })
    }

    /// Request removal of resources a failed deployment left behind.
    #[instrument(skip(self))]
    pub async fn submit_cleanup(
        &self,
        user: &UserId,
        project_id: &ProjectId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<Accepted> {
        let project = self.projects.get(user, project_id).await?;

        let record = self
            .store
            .get(deployment_id)
            .await?
            .filter(|r| r.data.project_id == project.id)
            .ok_or_else(|| ControlError::not_found("deployment", deployment_id.as_str()))?;

        if record.status != DeploymentStatus::Failed {
            return Err(ControlError::conflict(format!(
                "deployment {deployment_id} is {}; only failed deployments can be cleaned up",
                record.status
            )));
        }
        if record.orphaned_resources().is_none() {
            return Err(ControlError::conflict(format!(
                "deployment {deployment_id} has no orphaned resources"
            )));
        }

        let credentials = self.credentials_for(&project).await?;

        let message_id = self
            .enqueue(&Job::Cleanup(CleanupJob {
                project,
                credentials,
                deployment: record,
            }))
            .await?;

        info!(%message_id, "cleanup accepted");
        Ok(Accepted {
            deployment_id: deployment_id.clone(),
            message_id,
        })
    }

    async fn credentials_for(&self, project: &Project) -> ControlResult<Credentials> {
        let credentials = self
            .credentials
            .get(&project.id)
            .await?
            .ok_or_else(|| ControlError::not_found("credentials", project.id.as_str()))?;

        if credentials.provider() != project.service_provider {
            return Err(ControlError::validation(format!(
                "project {} uses {} but its credentials are for {}",
                project.id,
                project.service_provider,
                credentials.provider()
            )));
        }

        Ok(credentials)
    }

    async fn enqueue(&self, job: &Job) -> ControlResult<MessageId> {
        let payload = job.encode()?;
        self.queue.publish(&payload).await
    }
}
