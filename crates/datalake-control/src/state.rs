//! Typestate pattern for the deployment lifecycle.
//!
//! Each status is a zero-sized marker, so a worker holding a
//! `Deployment<Deployed>` can only start teardown, and a
//! `Deployment<Destroyed>` offers no transitions at all.
//!
//! ```text
//!   (none) ──▶ Deploying ──▶ Deployed ──▶ Destroying ──▶ Destroyed
//!                  │                          │
//!                  ▼                          ▼
//!                Failed ◀─────────────────────┘
//! ```
//!
//! Records loaded from the store come back as [`AnyDeployment`] and are
//! narrowed with the `try_into_*` methods before a transition is applied.

use std::marker::PhantomData;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus, ResourceDescriptor,
};

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the persisted status.
    fn status() -> DeploymentStatus;
}

mod private {
    pub trait Sealed {}
}

/// Provisioning accepted or running.
#[derive(Debug, Clone, Copy)]
pub struct Deploying;

/// All resources exist.
#[derive(Debug, Clone, Copy)]
pub struct Deployed;

/// Teardown running.
#[derive(Debug, Clone, Copy)]
pub struct Destroying;

/// All resources removed.
#[derive(Debug, Clone, Copy)]
pub struct Destroyed;

/// Provisioning or teardown failed.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

macro_rules! deployment_state {
    ($($marker:ident => $status:ident),* $(,)?) => {
        $(
            impl private::Sealed for $marker {}

            impl DeploymentState for $marker {
                fn status() -> DeploymentStatus {
                    DeploymentStatus::$status
                }
            }
        )*
    };
}

deployment_state! {
    Deploying => Deploying,
    Deployed => Deployed,
    Destroying => Destroying,
    Destroyed => Destroyed,
    Failed => Failed,
}

/// A deployment in a specific state.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    data: DeploymentData,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    const fn wrap(data: DeploymentData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::status()
    }

    /// Snapshot the deployment as a storable record.
    #[must_use]
    pub fn to_record(&self) -> DeploymentRecord {
        DeploymentRecord {
            data: self.data.clone(),
            status: S::status(),
        }
    }

    /// Convert into a storable record.
    #[must_use]
    pub fn into_record(self) -> DeploymentRecord {
        DeploymentRecord {
            data: self.data,
            status: S::status(),
        }
    }

    fn transition_with<T: DeploymentState>(
        mut self,
        f: impl FnOnce(&mut DeploymentData),
    ) -> Deployment<T> {
        f(&mut self.data);
        self.data.updated_at = chrono::Utc::now();
        Deployment::wrap(self.data)
    }
}

impl Deployment<Deploying> {
    /// Start a new deployment.
    #[must_use]
    pub const fn create(data: DeploymentData) -> Self {
        Self::wrap(data)
    }

    /// Record the resources a successful deploy produced.
    #[must_use]
    pub fn complete(self, resources: ResourceDescriptor) -> Deployment<Deployed> {
        self.transition_with(|data| {
            data.resource_descriptor = Some(resources);
            data.partial_resources = None;
            data.error = None;
        })
    }

    /// Mark the deploy as failed, keeping whatever it managed to create.
    #[must_use]
    pub fn fail(self, error: String, partial: Option<ResourceDescriptor>) -> Deployment<Failed> {
        self.transition_with(|data| {
            data.error = Some(error);
            data.partial_resources = partial.filter(|p| !p.is_empty());
        })
    }
}

impl Deployment<Deployed> {
    /// Resources to tear down.
    #[must_use]
    pub fn resources(&self) -> Option<&ResourceDescriptor> {
        self.data.resource_descriptor.as_ref()
    }

    /// Begin teardown on behalf of the queue message `message`.
    #[must_use]
    pub fn start_destroying(self, message: impl Into<String>) -> Deployment<Destroying> {
        self.transition_with(|data| data.teardown_message = Some(message.into()))
    }
}

impl Deployment<Destroying> {
    /// Resources being torn down.
    #[must_use]
    pub fn resources(&self) -> Option<&ResourceDescriptor> {
        self.data.resource_descriptor.as_ref()
    }

    /// Whether the teardown was started by the queue message `message`.
    #[must_use]
    pub fn started_by(&self, message: &str) -> bool {
        self.data.teardown_message.as_deref() == Some(message)
    }

    /// Teardown completed.
    #[must_use]
    pub fn finish(self) -> Deployment<Destroyed> {
        self.transition_with(|data| {
            data.error = None;
            data.teardown_message = None;
        })
    }

    /// Teardown failed; the descriptor is kept so the resources can be found.
    #[must_use]
    pub fn fail(self, error: String) -> Deployment<Failed> {
        self.transition_with(|data| {
            data.error = Some(error);
            data.teardown_message = None;
        })
    }
}

impl Deployment<Failed> {
    /// Resources the failure left behind.
    #[must_use]
    pub fn orphans(&self) -> Option<ResourceDescriptor> {
        self.to_record().orphaned_resources().cloned()
    }

    /// Forget the orphaned resources once they have been removed.
    #[must_use]
    pub fn clear_orphans(self) -> Self {
        self.transition_with(|data| {
            data.partial_resources = None;
            data.resource_descriptor = None;
        })
    }

    /// Add resources discovered after the failure was recorded.
    #[must_use]
    pub fn record_orphans(self, found: &ResourceDescriptor) -> Self {
        let mut orphans = self.orphans().unwrap_or_default();
        orphans.merge(found);
        self.transition_with(|data| data.partial_resources = Some(orphans))
    }

    /// Replace the failure cause.
    #[must_use]
    pub fn with_error(self, error: String) -> Self {
        self.transition_with(|data| data.error = Some(error))
    }
}

/// A type-erased deployment that can be in any state.
#[derive(Debug)]
pub enum AnyDeployment {
    /// Deployment being provisioned.
    Deploying(Deployment<Deploying>),
    /// Deployment fully provisioned.
    Deployed(Deployment<Deployed>),
    /// Deployment being torn down.
    Destroying(Deployment<Destroying>),
    /// Deployment torn down.
    Destroyed(Deployment<Destroyed>),
    /// Deployment failed.
    Failed(Deployment<Failed>),
}

impl AnyDeployment {
    /// Create an `AnyDeployment` from data and a persisted status.
    #[must_use]
    pub const fn from_persisted(data: DeploymentData, status: DeploymentStatus) -> Self {
        match status {
            DeploymentStatus::Deploying => Self::Deploying(Deployment::wrap(data)),
            DeploymentStatus::Deployed => Self::Deployed(Deployment::wrap(data)),
            DeploymentStatus::Destroying => Self::Destroying(Deployment::wrap(data)),
            DeploymentStatus::Destroyed => Self::Destroyed(Deployment::wrap(data)),
            DeploymentStatus::Failed => Self::Failed(Deployment::wrap(data)),
        }
    }

    /// Create an `AnyDeployment` from a stored record.
    #[must_use]
    pub fn from_record(record: DeploymentRecord) -> Self {
        Self::from_persisted(record.data, record.status)
    }

    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        match self {
            Self::Deploying(d) => d.data(),
            Self::Deployed(d) => d.data(),
            Self::Destroying(d) => d.data(),
            Self::Destroyed(d) => d.data(),
            Self::Failed(d) => d.data(),
        }
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> DeploymentStatus {
        match self {
            Self::Deploying(_) => DeploymentStatus::Deploying,
            Self::Deployed(_) => DeploymentStatus::Deployed,
            Self::Destroying(_) => DeploymentStatus::Destroying,
            Self::Destroyed(_) => DeploymentStatus::Destroyed,
            Self::Failed(_) => DeploymentStatus::Failed,
        }
    }

    fn mismatch(&self, wanted: DeploymentStatus) -> ControlError {
        ControlError::InvalidStateTransition {
            from: self.status().as_str(),
            to: wanted.as_str(),
        }
    }

    /// Try to extract a deploying deployment.
    pub fn try_into_deploying(self) -> ControlResult<Deployment<Deploying>> {
        match self {
            Self::Deploying(d) => Ok(d),
            other => Err(other.mismatch(DeploymentStatus::Deploying)),
        }
    }

    /// Try to extract a deployed deployment.
    pub fn try_into_deployed(self) -> ControlResult<Deployment<Deployed>> {
        match self {
            Self::Deployed(d) => Ok(d),
            other => Err(other.mismatch(DeploymentStatus::Deployed)),
        }
    }

    /// Try to extract a deployment that is being torn down.
    pub fn try_into_destroying(self) -> ControlResult<Deployment<Destroying>> {
        match self {
            Self::Destroying(d) => Ok(d),
            other => Err(other.mismatch(DeploymentStatus::Destroying)),
        }
    }

    /// Try to extract a failed deployment.
    pub fn try_into_failed(self) -> ControlResult<Deployment<Failed>> {
        match self {
            Self::Failed(d) => Ok(d),
            other => Err(other.mismatch(DeploymentStatus::Failed)),
        }
    }

    /// Fail whatever in-flight operation the deployment is in.
    ///
    /// Returns `None` when the deployment is not in flight.
    #[must_use]
    pub fn abandon(self, error: String) -> Option<Deployment<Failed>> {
        match self {
            Self::Deploying(d) => Some(d.fail(error, None)),
            Self::Destroying(d) => Some(d.fail(error)),
            _ => None,
        }
    }

    /// Check if the deployment is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed(_) | Self::Failed(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{DeployParameters, DeployType, ProjectId, UserId};

    fn test_data() -> DeploymentData {
        DeploymentData::new(
            ProjectId::new("test-project"),
            UserId::new("user-1"),
            DeployType::Aws1,
            DeployParameters::new(),
        )
    }

    fn resources() -> ResourceDescriptor {
        ResourceDescriptor::new().with("s3", [("bucket_name", "bucket-1")])
    }

    #[test]
    fn happy_path_transitions() {
        let deploying = Deployment::<Deploying>::create(test_data());
        assert_eq!(deploying.status(), DeploymentStatus::Deploying);

        let deployed = deploying.complete(resources());
        assert_eq!(deployed.status(), DeploymentStatus::Deployed);
        assert_eq!(deployed.resources(), Some(&resources()));

        let destroying = deployed.start_destroying("msg-1");
        assert_eq!(destroying.status(), DeploymentStatus::Destroying);
        assert!(destroying.started_by("msg-1"));
        assert!(!destroying.started_by("msg-2"));

        let destroyed = destroying.finish();
        assert_eq!(destroyed.status(), DeploymentStatus::Destroyed);
        assert!(destroyed.data().error.is_none());
        assert!(destroyed.data().teardown_message.is_none());
    }

    #[test]
    fn failed_deploy_keeps_partial_resources() {
        let deploying = Deployment::<Deploying>::create(test_data());
        let failed = deploying.fail("quota exceeded".to_owned(), Some(resources()));

        assert_eq!(failed.status(), DeploymentStatus::Failed);
        assert_eq!(failed.data().error.as_deref(), Some("quota exceeded"));
        assert_eq!(failed.orphans(), Some(resources()));

        let cleaned = failed.clear_orphans();
        assert_eq!(cleaned.orphans(), None);
        assert_eq!(cleaned.status(), DeploymentStatus::Failed);
    }

    #[test]
    fn empty_partial_is_not_an_orphan() {
        let failed = Deployment::<Deploying>::create(test_data())
            .fail("boom".to_owned(), Some(ResourceDescriptor::new()));
        assert!(failed.data().partial_resources.is_none());
        assert_eq!(failed.orphans(), None);
    }

    #[test]
    fn failed_destroy_keeps_descriptor() {
        let failed = Deployment::<Deploying>::create(test_data())
            .complete(resources())
            .start_destroying("msg-1")
            .fail("access denied".to_owned());
        assert_eq!(failed.orphans(), Some(resources()));
    }

    #[test]
    fn late_resources_join_the_orphans() {
        let late = ResourceDescriptor::new().with("dynamodb", [("table_name", "table-1")]);

        let abandoned = Deployment::<Deploying>::create(test_data())
            .fail("abandoned".to_owned(), None)
            .record_orphans(&late);
        assert_eq!(abandoned.orphans(), Some(late.clone()));
        assert_eq!(abandoned.data().error.as_deref(), Some("abandoned"));

        let partial = Deployment::<Deploying>::create(test_data())
            .fail("abandoned".to_owned(), Some(resources()))
            .record_orphans(&late);
        let orphans = partial.orphans().unwrap();
        assert!(orphans.contains("s3"));
        assert!(orphans.contains("dynamodb"));
    }

    #[test]
    fn any_deployment_roundtrip() {
        let record = Deployment::<Deploying>::create(test_data())
            .complete(resources())
            .into_record();
        let id = record.id().clone();

        let any = AnyDeployment::from_record(record);
        assert_eq!(any.status(), DeploymentStatus::Deployed);
        assert_eq!(any.data().id, id);

        let deployed = any.try_into_deployed().unwrap();
        assert_eq!(deployed.id(), &id);
    }

    #[test]
    fn any_deployment_wrong_state() {
        let any = AnyDeployment::from_persisted(test_data(), DeploymentStatus::Destroyed);
        let err = any.try_into_deployed().unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidStateTransition {
                from: "destroyed",
                to: "deployed"
            }
        ));
    }

    #[test]
    fn abandon_only_applies_in_flight() {
        let any = AnyDeployment::from_persisted(test_data(), DeploymentStatus::Destroying);
        let failed = any.abandon("worker lost".to_owned()).unwrap();
        assert_eq!(failed.data().error.as_deref(), Some("worker lost"));

        let any = AnyDeployment::from_persisted(test_data(), DeploymentStatus::Deployed);
        assert!(any.abandon("worker lost".to_owned()).is_none());
    }
}
