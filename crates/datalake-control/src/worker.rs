//! Job execution.
//!
//! A [`Worker`] takes jobs off the queue, runs the matching strategy and
//! persists the outcome into the deployment record before acknowledging the
//! message. Provider failures are outcomes, not errors: they end in a
//! `failed` record and an acknowledged message. Only infrastructure failures
//! (store or queue unavailable) return the message for redelivery.
//!
//! Every record write is compare-and-set on the status the worker read, so a
//! duplicate delivery racing the original cannot move a record backwards.
//! A teardown is claimed by the queue message that started it, and only a
//! redelivery of that message resumes it. A deploy that finishes after its
//! record was failed adds what it created to the record's orphans.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ControlConfig, RetentionPolicy};
use crate::error::{ControlError, ControlResult};
use crate::queue::{CleanupJob, DeployJob, Delivery, DestroyJob, Job, JobQueue};
use crate::reconcile::abandon;
use crate::registry::StrategyRegistry;
use crate::state::AnyDeployment;
use crate::store::DeploymentStore;
use crate::strategy::Invocation;
use crate::types::{DeploymentRecord, DeploymentStatus, ResourceDescriptor};

/// Failure cause for jobs that kept coming back.
pub const DELIVERY_LIMIT_EXCEEDED: &str = "exceeded delivery attempts";

/// What executing a job did to its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Resources provisioned; record is `deployed`.
    Deployed,
    /// Resources removed; record is `destroyed`.
    Destroyed,
    /// Resources removed; record deleted.
    Deleted,
    /// Orphaned resources removed from a failed record.
    Cleaned,
    /// The provider call failed; record is `failed` with this cause.
    Failed(String),
    /// Nothing to do, usually because the job was delivered twice.
    Skipped(String),
}

/// Tunables for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// How long a received job stays hidden from other workers.
    pub visibility_timeout: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Deliveries after which a job is given up on.
    pub max_deliveries: u32,
    /// Jobs run concurrently.
    pub concurrency: usize,
    /// Fate of destroyed records.
    pub retention: RetentionPolicy,
}

impl WorkerSettings {
    /// Settings from the process configuration.
    #[must_use]
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            visibility_timeout: config.queue.visibility_timeout(),
            poll_interval: config.queue.poll_interval(),
            max_deliveries: config.queue.max_deliveries,
            concurrency: config.worker.concurrency,
            retention: config.deployment.retention,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&ControlConfig::default())
    }
}

/// Executes orchestration jobs.
#[derive(Debug)]
pub struct Worker {
    store: Arc<dyn DeploymentStore>,
    registry: StrategyRegistry,
    queue: Arc<dyn JobQueue>,
    settings: WorkerSettings,
}

impl Worker {
    /// Create a worker.
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        registry: StrategyRegistry,
        queue: Arc<dyn JobQueue>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            settings,
        }
    }

    /// Worker settings.
    #[must_use]
    pub const fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Run `settings.concurrency` polling slots until `cancel` fires.
    ///
    /// A slot finishes the job it is running before it stops; cancellation
    /// only prevents new jobs from being received.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut slots = JoinSet::new();
        for slot in 0..self.settings.concurrency {
            let worker = Arc::clone(&self);
            let cancel = cancel.clone();
            slots.spawn(async move { worker.poll(slot, cancel).await });
        }

        info!(slots = self.settings.concurrency, "worker started");

        while let Some(result) = slots.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "worker slot panicked");
            }
        }

        info!("worker stopped");
    }

    async fn poll(&self, slot: usize, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => warn!(slot, error = %e, "failed to process queue"),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        debug!(slot, "worker slot stopped");
    }

    /// Receive and handle one job.
    ///
    /// Returns `false` when the queue had nothing visible.
    pub async fn process_next(&self) -> ControlResult<bool> {
        let Some(delivery) = self.queue.receive(self.settings.visibility_timeout).await? else {
            return Ok(false);
        };

        let span = info_span!(
            "job",
            message_id = %delivery.id,
            attempt = delivery.attempt,
        );
        self.handle(delivery).instrument(span).await?;
        Ok(true)
    }

    async fn handle(&self, delivery: Delivery) -> ControlResult<()> {
        let job = match delivery.job() {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "discarding undecodable job");
                return self.queue.ack(&delivery.id).await;
            }
        };

        let span = info_span!(
            "execute",
            kind = job.kind(),
            deployment_id = %job.deployment_id(),
            project_id = %job.project().id,
        );

        async {
            if delivery.attempt > self.settings.max_deliveries {
                warn!(
                    max_deliveries = self.settings.max_deliveries,
                    "giving up on job"
                );
                self.give_up(&job).await?;
                return self.queue.ack(&delivery.id).await;
            }

            match self.execute(&job, &delivery).await {
                Ok(outcome) => {
                    match &outcome {
                        Outcome::Failed(cause) => warn!(cause = %cause, "job failed"),
                        Outcome::Skipped(reason) => info!(reason = %reason, "job skipped"),
                        done => info!(outcome = ?done, "job complete"),
                    }
                    self.queue.ack(&delivery.id).await
                }
                Err(e) => {
                    error!(
                        error = %e,
                        transient = e.is_transient(),
                        "job execution failed, returning to queue"
                    );
                    self.queue.nack(&delivery.id).await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Execute one job and persist its outcome.
    ///
    /// `delivery` is the queue message that carried the job. Errors are
    /// infrastructure failures; the job should be retried.
    pub async fn execute(&self, job: &Job, delivery: &Delivery) -> ControlResult<Outcome> {
        match job {
            Job::Deploy(job) => self.deploy(job).await,
            Job::Destroy(job) => self.destroy(job, delivery).await,
            Job::Cleanup(job) => self.cleanup(job).await,
        }
    }

    async fn deploy(&self, job: &DeployJob) -> ControlResult<Outcome> {
        let Some(record) = self.store.get(&job.deployment_id).await? else {
            return Ok(Outcome::Skipped("deployment record no longer exists".to_owned()));
        };
        let deploying = match AnyDeployment::from_record(record).try_into_deploying() {
            Ok(deploying) => deploying,
            Err(e) => return Ok(Outcome::Skipped(e.to_string())),
        };

        let strategy = self.registry.resolve(job.deploy_type);
        let invocation = Invocation {
            deployment_id: &job.deployment_id,
            project: &job.project,
            credentials: &job.credentials,
            parameters: &deploying.data().parameters,
        };

        match strategy.deploy(&invocation).await {
            Ok(resources) if resources.is_empty() => {
                let cause = "provisioning reported no resources".to_owned();
                self.persist(
                    &deploying.fail(cause.clone(), None).into_record(),
                    DeploymentStatus::Deploying,
                    Outcome::Failed(cause),
                )
                .await
            }
            Ok(resources) => {
                info!(resources = resources.len(), "deployment provisioned");
                let record = deploying.complete(resources.clone()).into_record();
                self.persist_provisioned(&record, &resources, Outcome::Deployed)
                    .await
            }
            Err(failure) => {
                error!(
                    error = %failure.error,
                    orphans = failure.partial.len(),
                    "deployment failed"
                );
                let cause = failure.error.to_string();
                let record = deploying
                    .fail(cause.clone(), Some(failure.partial.clone()))
                    .into_record();
                self.persist_provisioned(&record, &failure.partial, Outcome::Failed(cause))
                    .await
            }
        }
    }

    /// Persist the result of a deploy that created `resources`.
    ///
    /// When the record was failed while the deploy ran, the resources are
    /// added to its orphans so cleanup can still find them.
    async fn persist_provisioned(
        &self,
        record: &DeploymentRecord,
        resources: &ResourceDescriptor,
        outcome: Outcome,
    ) -> ControlResult<Outcome> {
        let outcome = self
            .persist(record, DeploymentStatus::Deploying, outcome)
            .await?;
        if matches!(outcome, Outcome::Skipped(_)) && !resources.is_empty() {
            match self.adopt_orphans(record, resources).await {
                Ok(true) => warn!(
                    resources = ?resources.resources().collect::<Vec<_>>(),
                    "late resources recorded as orphans of the failed deployment"
                ),
                Ok(false) => error!(
                    resources = ?resources,
                    "provisioned resources could not be recorded, remove them by hand"
                ),
                Err(e) => error!(
                    error = %e,
                    resources = ?resources,
                    "failed to record provisioned resources, remove them by hand"
                ),
            }
        }
        Ok(outcome)
    }

    /// Add `resources` to the orphans of the record, if it is `failed`.
    ///
    /// Returns `false` when the record is gone or in any other state.
    async fn adopt_orphans(
        &self,
        record: &DeploymentRecord,
        resources: &ResourceDescriptor,
    ) -> ControlResult<bool> {
        let Some(current) = self.store.get(record.id()).await? else {
            return Ok(false);
        };
        let Ok(failed) = AnyDeployment::from_record(current).try_into_failed() else {
            return Ok(false);
        };
        let updated = failed.record_orphans(resources).into_record();
        match self.store.update(&updated, DeploymentStatus::Failed).await {
            Ok(()) => Ok(true),
            Err(ControlError::InvalidStateTransition { .. } | ControlError::NotFound { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy(&self, job: &DestroyJob, delivery: &Delivery) -> ControlResult<Outcome> {
        let id = job.deployment.id();
        let Some(record) = self.store.get(id).await? else {
            return Ok(Outcome::Skipped("deployment record no longer exists".to_owned()));
        };

        let destroying = match AnyDeployment::from_record(record) {
            AnyDeployment::Deployed(deployed) => {
                let destroying = deployed.start_destroying(delivery.id.as_str());
                match self
                    .store
                    .update(&destroying.to_record(), DeploymentStatus::Deployed)
                    .await
                {
                    Ok(()) => destroying,
                    Err(ControlError::InvalidStateTransition { from, .. }) => {
                        return Ok(Outcome::Skipped(format!("deployment moved to {from}")));
                    }
                    Err(e) => return Err(e),
                }
            }
            // Only the message that started a teardown may resume it.
            AnyDeployment::Destroying(destroying)
                if delivery.attempt > 1 && destroying.started_by(delivery.id.as_str()) =>
            {
                info!("resuming interrupted teardown");
                destroying
            }
            AnyDeployment::Destroying(_) => {
                return Ok(Outcome::Skipped(
                    "teardown already started by another request".to_owned(),
                ));
            }
            other => {
                return Ok(Outcome::Skipped(format!("deployment is {}", other.status())));
            }
        };

        let resources = destroying
            .resources()
            .cloned()
            .unwrap_or_else(ResourceDescriptor::new);
        let strategy = self.registry.resolve(destroying.data().deploy_type);
        let invocation = Invocation {
            deployment_id: id,
            project: &job.project,
            credentials: &job.credentials,
            parameters: &destroying.data().parameters,
        };

        match strategy.destroy(&invocation, &resources).await {
            Ok(()) => match self.settings.retention {
                RetentionPolicy::Retain => {
                    self.persist(
                        &destroying.finish().into_record(),
                        DeploymentStatus::Destroying,
                        Outcome::Destroyed,
                    )
                    .await
                }
                RetentionPolicy::Delete => match self.store.delete(id).await {
                    Ok(()) | Err(ControlError::NotFound { .. }) => Ok(Outcome::Deleted),
                    Err(e) => Err(e),
                },
            },
            Err(e) => {
                error!(error = %e, "teardown failed");
                let cause = e.to_string();
                self.persist(
                    &destroying.fail(cause.clone()).into_record(),
                    DeploymentStatus::Destroying,
                    Outcome::Failed(cause),
                )
                .await
            }
        }
    }

    async fn cleanup(&self, job: &CleanupJob) -> ControlResult<Outcome> {
        let id = job.deployment.id();
        let Some(record) = self.store.get(id).await? else {
            return Ok(Outcome::Skipped("deployment record no longer exists".to_owned()));
        };
        let failed = match AnyDeployment::from_record(record).try_into_failed() {
            Ok(failed) => failed,
            Err(e) => return Ok(Outcome::Skipped(e.to_string())),
        };
        let Some(orphans) = failed.orphans() else {
            return Ok(Outcome::Skipped("no orphaned resources".to_owned()));
        };

        let strategy = self.registry.resolve(failed.data().deploy_type);
        let invocation = Invocation {
            deployment_id: id,
            project: &job.project,
            credentials: &job.credentials,
            parameters: &failed.data().parameters,
        };

        match strategy.destroy(&invocation, &orphans).await {
            Ok(()) => {
                info!(resources = orphans.len(), "orphaned resources removed");
                self.persist(
                    &failed.clear_orphans().into_record(),
                    DeploymentStatus::Failed,
                    Outcome::Cleaned,
                )
                .await
            }
            Err(e) => {
                error!(error = %e, "cleanup failed");
                let cause = format!("cleanup failed: {e}");
                self.persist(
                    &failed.with_error(cause.clone()).into_record(),
                    DeploymentStatus::Failed,
                    Outcome::Failed(cause),
                )
                .await
            }
        }
    }

    /// Fail the record of a job that will not be run again.
    async fn give_up(&self, job: &Job) -> ControlResult<()> {
        let Some(record) = self.store.get(job.deployment_id()).await? else {
            return Ok(());
        };
        if abandon(self.store.as_ref(), record, DELIVERY_LIMIT_EXCEEDED).await? {
            warn!("deployment marked failed after repeated deliveries");
        }
        Ok(())
    }

    async fn persist(
        &self,
        record: &DeploymentRecord,
        expected: DeploymentStatus,
        outcome: Outcome,
    ) -> ControlResult<Outcome> {
        match self.store.update(record, expected).await {
            Ok(()) => Ok(outcome),
            Err(ControlError::InvalidStateTransition { from, .. }) => {
                warn!(from, to = %record.status, "record changed while the job ran");
                Ok(Outcome::Skipped(format!("deployment moved to {from}")))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::config::ProvisioningConfig;
    use crate::queue::{MemoryQueue, MessageId};
    use crate::state::{Deploying, Deployment};
    use crate::store::MemoryStore;
    use crate::strategy::{MockTool, ToolCall};
    use crate::testing::{credentials, project};
    use crate::types::{DeployParameters, DeployType, DeploymentData, UserId};

    struct Fixture {
        tool: Arc<MockTool>,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        worker: Worker,
        _dir: tempfile::TempDir,
    }

    fn fixture(settings: WorkerSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockTool::new());
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let config = ProvisioningConfig {
            work_dir: dir.path().to_path_buf(),
            ..ProvisioningConfig::default()
        };
        let registry = StrategyRegistry::new(tool.clone(), config);
        let worker = Worker::new(store.clone(), registry, queue.clone(), settings);
        Fixture {
            tool,
            store,
            queue,
            worker,
            _dir: dir,
        }
    }

    async fn deploy_job(f: &Fixture, deploy_type: DeployType) -> Job {
        let provider = deploy_type.provider();
        let project = project(provider);
        let record = Deployment::<Deploying>::create(DeploymentData::new(
            project.id.clone(),
            UserId::new("user-1"),
            deploy_type,
            DeployParameters::new(),
        ))
        .into_record();
        f.store.insert(&record).await.unwrap();

        Job::Deploy(DeployJob {
            user_id: UserId::new("user-1"),
            deployment_id: record.id().clone(),
            deploy_type,
            parameters: DeployParameters::new(),
            project,
            credentials: credentials(provider),
        })
    }

    fn delivery(message: &str, attempt: u32) -> Delivery {
        Delivery {
            id: MessageId::new(message),
            payload: Vec::new(),
            attempt,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn deploy_persists_resources() {
        let f = fixture(WorkerSettings::default());
        let job = deploy_job(&f, DeployType::Aws1).await;

        let outcome = f.worker.execute(&job, &delivery("m1", 1)).await.unwrap();
        assert_eq!(outcome, Outcome::Deployed);

        let record = f.store.get(job.deployment_id()).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Deployed);
        let resources = record.data.resource_descriptor.unwrap();
        assert!(resources.contains("s3"));
        assert!(resources.contains("opensearch"));
    }

    #[tokio::test]
    async fn provider_failure_is_recorded_with_partial_resources() {
        let f = fixture(WorkerSettings::default());
        f.tool
            .fail_target("aws_opensearch_domain.datalake", "LimitExceededException");
        let job = deploy_job(&f, DeployType::Aws1).await;

        let outcome = f.worker.execute(&job, &delivery("m1", 1)).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(ref cause) if cause.contains("LimitExceeded")));

        let record = f.store.get(job.deployment_id()).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert!(record.data.error.unwrap().contains("LimitExceeded"));
        let partial = record.data.partial_resources.unwrap();
        assert!(partial.contains("s3"));
        assert!(!partial.contains("opensearch"));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_skipped() {
        let f = fixture(WorkerSettings::default());
        let job = deploy_job(&f, DeployType::Gcp1).await;

        let first = delivery("m1", 1);
        assert_eq!(f.worker.execute(&job, &first).await.unwrap(), Outcome::Deployed);
        assert!(matches!(
            f.worker.execute(&job, &delivery("m1", 2)).await.unwrap(),
            Outcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn only_the_starting_message_resumes_a_teardown() {
        let f = fixture(WorkerSettings::default());
        let deploy = deploy_job(&f, DeployType::Gcp2).await;
        f.worker.execute(&deploy, &delivery("m0", 1)).await.unwrap();

        let Job::Deploy(deploy) = deploy else {
            unreachable!()
        };
        let deployed = f.store.get(&deploy.deployment_id).await.unwrap().unwrap();
        let destroy = Job::Destroy(DestroyJob {
            project: deploy.project,
            credentials: deploy.credentials,
            deployment: deployed.clone(),
        });

        let claimed = AnyDeployment::from_record(deployed)
            .try_into_deployed()
            .unwrap()
            .start_destroying("m1")
            .into_record();
        f.store
            .update(&claimed, DeploymentStatus::Deployed)
            .await
            .unwrap();

        // A second destroy request while the first one runs.
        let outcome = f.worker.execute(&destroy, &delivery("m2", 1)).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert!(!f.tool.calls().contains(&ToolCall::Destroy));

        let outcome = f.worker.execute(&destroy, &delivery("m1", 2)).await.unwrap();
        assert_eq!(outcome, Outcome::Destroyed);
        assert!(f.tool.live_targets().is_empty());
    }

    #[tokio::test]
    async fn poison_message_is_acknowledged() {
        let f = fixture(WorkerSettings::default());
        f.queue.publish(b"not a job").await.unwrap();

        assert!(f.worker.process_next().await.unwrap());
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn jobs_beyond_the_delivery_limit_fail_the_record() {
        let f = fixture(WorkerSettings {
            max_deliveries: 1,
            ..WorkerSettings::default()
        });
        let job = deploy_job(&f, DeployType::Aws2).await;
        let id = f.queue.publish(&job.encode().unwrap()).await.unwrap();

        // First delivery is lost, as if the worker crashed.
        f.queue.receive(Duration::from_secs(60)).await.unwrap().unwrap();
        f.queue.nack(&id).await.unwrap();

        assert!(f.worker.process_next().await.unwrap());
        assert!(f.queue.is_empty().await);
        assert!(f.tool.calls().is_empty());

        let record = f.store.get(job.deployment_id()).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert_eq!(record.data.error.as_deref(), Some(DELIVERY_LIMIT_EXCEEDED));
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let f = fixture(WorkerSettings {
            poll_interval: Duration::from_millis(10),
            concurrency: 2,
            ..WorkerSettings::default()
        });
        let job = deploy_job(&f, DeployType::Azure1).await;
        f.queue.publish(&job.encode().unwrap()).await.unwrap();

        let worker = Arc::new(f.worker);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&worker).run(cancel.clone()));

        for _ in 0..100 {
            if f.queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let record = f.store.get(job.deployment_id()).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Deployed);
    }
}
