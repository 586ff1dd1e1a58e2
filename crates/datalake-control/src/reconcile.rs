//! Recovery of deployments a worker never finished.
//!
//! A worker that crashes mid-job leaves its record in `deploying` or
//! `destroying`. Redelivery usually picks the job up again; when it does not,
//! [`Reconciler::sweep`] fails records that have been in flight for too long
//! so the project can be deployed again, and [`Reconciler::orphans`] lists
//! failed records whose resources still need cleaning up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult};
use crate::state::AnyDeployment;
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus};

/// Failure cause recorded on swept records.
pub const ABANDONED: &str = "abandoned";

/// Fail an in-flight record, if it is still in the status it was read in.
///
/// Returns whether the record was changed.
pub(crate) async fn abandon(
    store: &dyn DeploymentStore,
    record: DeploymentRecord,
    cause: &str,
) -> ControlResult<bool> {
    let expected = record.status;
    let Some(failed) = AnyDeployment::from_record(record).abandon(cause.to_owned()) else {
        return Ok(false);
    };

    match store.update(&failed.into_record(), expected).await {
        Ok(()) => Ok(true),
        Err(ControlError::InvalidStateTransition { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Sweeps stale in-flight deployments.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: Arc<dyn DeploymentStore>,
    stale_after: Duration,
}

impl Reconciler {
    /// Create a reconciler that treats records untouched for `stale_after` as abandoned.
    pub fn new(store: Arc<dyn DeploymentStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// Mark stale `deploying` and `destroying` records as failed.
    ///
    /// Returns the IDs of the records that were failed.
    pub async fn sweep(&self) -> ControlResult<Vec<DeploymentId>> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| ControlError::internal(format!("invalid stale threshold: {e}")))?;
        let cutoff = Utc::now() - stale_after;

        let mut swept = Vec::new();
        for status in [DeploymentStatus::Deploying, DeploymentStatus::Destroying] {
            let filter = DeploymentFilter::new()
                .with_status(status)
                .updated_before(cutoff);

            for record in self.store.list(&filter).await? {
                let id = record.id().clone();
                let project_id = record.data.project_id.clone();
                if abandon(self.store.as_ref(), record, ABANDONED).await? {
                    warn!(
                        deployment_id = %id,
                        project_id = %project_id,
                        status = %status,
                        "abandoned in-flight deployment"
                    );
                    swept.push(id);
                }
            }
        }

        if !swept.is_empty() {
            info!(count = swept.len(), "reconciliation sweep complete");
        }
        Ok(swept)
    }

    /// Failed deployments that still own resources.
    pub async fn orphans(&self) -> ControlResult<Vec<DeploymentRecord>> {
        let failed = self
            .store
            .list(&DeploymentFilter::new().with_status(DeploymentStatus::Failed))
            .await?;

        Ok(failed
            .into_iter()
            .filter(|r| r.orphaned_resources().is_some())
            .collect())
    }
}
