//! Datalake Control
//!
//! This crate provides the deployment orchestration core for per-tenant data
//! lakes: small sets of storage and analytical resources provisioned in a
//! tenant's own AWS, GCP or Azure account.
//!
//! # Architecture
//!
//! The request-handling layer and the worker pool never call each other.
//! They share a deployment store and a job queue:
//!
//! - **Submission** ([`Submitter`]): validates a request against the project,
//!   its credentials and the store, creates the deployment record and
//!   publishes a job. It returns immediately and never calls a provider.
//! - **Execution** ([`Worker`]): receives jobs, resolves the strategy for the
//!   deploy type through the [`StrategyRegistry`], runs it and persists the
//!   outcome before acknowledging the message.
//! - **Strategies** ([`DeploymentStrategy`]): one per deploy type, each
//!   provisioning a fixed topology through a provisioning tool.
//! - **Reconciliation** ([`Reconciler`]): fails records a crashed worker left
//!   in flight and lists resources failed deployments left behind.
//!
//! # State Machine
//!
//! Deployment records follow a strict state machine enforced at compile time
//! using the typestate pattern:
//!
//! ```text
//! Deploying ──▶ Deployed ──▶ Destroying ──▶ Destroyed
//!     │                          │
//!     ▼                          ▼
//!   Failed ◀─────────────────────┘
//! ```
//!
//! At most one record per project is in `Deploying`, `Deployed` or
//! `Destroying`. `Destroyed` and `Failed` end a cycle; a new deploy starts a
//! fresh record.
//!
//! # Example
//!
//! ```
//! use datalake_control::{
//!     Deployment, Deploying,
//!     types::{
//!         DeployParameters, DeployType, DeploymentData, ProjectId, ResourceDescriptor, UserId,
//!     },
//! };
//!
//! let data = DeploymentData::new(
//!     ProjectId::new("my-project"),
//!     UserId::new("user-1"),
//!     DeployType::Gcp1,
//!     DeployParameters::new(),
//! );
//!
//! let deploying = Deployment::<Deploying>::create(data);
//!
//! // State transitions are type-safe
//! let deployed = deploying.complete(
//!     ResourceDescriptor::new()
//!         .with("bigquery", [("dataset", "dataset_1"), ("table", "table_1")]),
//! );
//! let destroying = deployed.start_destroying("msg-1");
//! let _destroyed = destroying.finish();
//!
//! // This would not compile:
//! // let invalid = _destroyed.start_destroying(); // Error!
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod service;
pub mod state;
pub mod store;
pub mod strategy;
pub mod submit;
pub mod types;
pub mod worker;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod testing;

// Re-export commonly used types at the crate root
pub use config::{ControlConfig, RetentionPolicy};
pub use error::{ControlError, ControlResult, ProviderError, ProvisionFailure};
pub use queue::{Job, JobQueue, MemoryQueue, PostgresQueue};
pub use reconcile::Reconciler;
pub use registry::StrategyRegistry;
pub use service::{Backends, WorkerService};
pub use state::{
    AnyDeployment, Deployed, Deploying, Deployment, DeploymentState, Destroyed, Destroying, Failed,
};
pub use store::{
    CredentialStore, DeploymentFilter, DeploymentStore, MemoryCredentials, MemoryProjects,
    MemoryStore, PostgresStore, ProjectStore,
};
pub use strategy::{DeploymentStrategy, MockTool, ProvisioningTool};
pub use submit::{Accepted, Submitter};
pub use types::{
    Credentials, DeployRequest, DeployType, DeploymentData, DeploymentId, DeploymentRecord,
    DeploymentStatus, Project, ProjectId, ResourceDescriptor, ServiceProvider, UserId,
};
pub use worker::{Outcome, Worker, WorkerSettings};
