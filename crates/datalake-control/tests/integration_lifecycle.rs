//! Integration tests for the deploy and destroy lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::fixtures::ProjectBuilder;
use common::TestControlPlane;
use std::time::Duration;

use datalake_control::store::DeploymentStore;
use datalake_control::strategy::ToolCall;
use datalake_control::types::{DeployRequest, DeployType, DeploymentStatus, ServiceProvider};
use datalake_control::{ControlError, RetentionPolicy, WorkerSettings};

#[tokio::test]
async fn deploy_then_destroy_keeps_an_audit_record() {
    let plane = TestControlPlane::new();
    let project = plane.add_project("acme", ServiceProvider::Aws);

    let accepted = plane
        .submitter
        .submit_deploy(
            &plane.user,
            &project,
            DeployRequest::new("AWS_1").with_parameter("region", "eu-west-1"),
        )
        .await
        .unwrap();

    // Nothing ran yet; completion is observed through the store.
    let record = plane.record(&accepted.deployment_id).await;
    assert_eq!(record.status, DeploymentStatus::Deploying);
    assert!(plane.tool.calls().is_empty());

    assert_eq!(plane.drain().await, 1);

    let record = plane.record(&accepted.deployment_id).await;
    assert_eq!(record.status, DeploymentStatus::Deployed);
    let resources = record.data.resource_descriptor.unwrap();
    let bucket = resources.get("s3", "bucket_name").unwrap();
    let domain = resources.get("opensearch", "domain_name").unwrap();
    assert!(!bucket.is_empty() && bucket.len() <= 63);
    assert!(!domain.is_empty() && domain.len() <= 28);
    assert_eq!(resources.get("s3", "region"), Some("eu-west-1"));
    assert!(resources.get("opensearch", "endpoint").is_some());
    assert!(!plane.tool.live_targets().is_empty());

    plane
        .submitter
        .submit_destroy(&plane.user, &project)
        .await
        .unwrap();
    assert_eq!(plane.drain().await, 1);

    let record = plane.record(&accepted.deployment_id).await;
    assert_eq!(record.status, DeploymentStatus::Destroyed);
    assert!(plane.tool.live_targets().is_empty());
}

#[tokio::test]
async fn gcp_dataset_deploy_records_dataset_and_table() {
    let plane = TestControlPlane::new();
    let project = plane.add_project("x", ServiceProvider::Gcp);

    let accepted = plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("GCP_1"))
        .await
        .unwrap();
    plane.drain().await;

    let record = plane.record(&accepted.deployment_id).await;
    assert_eq!(record.status, DeploymentStatus::Deployed);

    let resources = record.data.resource_descriptor.unwrap();
    let dataset = resources.get("bigquery", "dataset").unwrap();
    let table = resources.get("bigquery", "table").unwrap();
    assert!(!dataset.is_empty() && dataset.len() <= 63);
    assert!(!table.is_empty() && table.len() <= 63);
    assert_eq!(resources.get("bigquery", "project"), Some("tenant-analytics"));
}

#[tokio::test]
async fn every_deploy_type_round_trips() {
    let cases = [
        ("AWS_1", ServiceProvider::Aws),
        ("AWS_2", ServiceProvider::Aws),
        ("GCP_1", ServiceProvider::Gcp),
        ("GCP_2", ServiceProvider::Gcp),
        ("GCP_3", ServiceProvider::Gcp),
        ("AZURE_1", ServiceProvider::Azure),
    ];

    for (deploy_type, provider) in cases {
        let plane = TestControlPlane::new();
        let project = plane.add_project("tenant", provider);

        let accepted = plane
            .submitter
            .submit_deploy(&plane.user, &project, DeployRequest::new(deploy_type))
            .await
            .unwrap();
        plane.drain().await;
        assert_eq!(
            plane.record(&accepted.deployment_id).await.status,
            DeploymentStatus::Deployed,
            "{deploy_type} did not deploy"
        );
        let applies = plane
            .tool
            .calls()
            .iter()
            .filter(|c| matches!(c, ToolCall::Apply(_)))
            .count();
        let stages = deploy_type.parse::<DeployType>().unwrap().stage_count();
        assert_eq!(u32::try_from(applies).unwrap(), stages, "{deploy_type} stage count");

        plane
            .submitter
            .submit_destroy(&plane.user, &project)
            .await
            .unwrap();
        plane.drain().await;
        assert_eq!(
            plane.record(&accepted.deployment_id).await.status,
            DeploymentStatus::Destroyed,
            "{deploy_type} did not tear down"
        );
        assert!(plane.tool.live_targets().is_empty(), "{deploy_type} left resources");
    }
}

#[tokio::test]
async fn credentials_reach_the_tool_through_its_environment() {
    let plane = TestControlPlane::new();
    let project = plane.add_project("lake", ServiceProvider::Azure);

    plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("AZURE_1"))
        .await
        .unwrap();
    plane.drain().await;

    let env = plane.tool.env_seen();
    for name in [
        "ARM_TENANT_ID",
        "ARM_CLIENT_ID",
        "ARM_CLIENT_SECRET",
        "ARM_SUBSCRIPTION_ID",
    ] {
        assert!(env.contains(name), "missing {name}");
    }
}

#[tokio::test]
async fn second_deploy_conflicts_while_first_is_in_flight() {
    let plane = TestControlPlane::new();
    let project = plane.add_unverified_project("acme", ServiceProvider::Gcp);

    let err = plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("GCP_2"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Validation(_)));

    // Verification completes.
    plane
        .projects
        .insert(ProjectBuilder::new("acme", ServiceProvider::Gcp).build())
        .unwrap();

    plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("GCP_2"))
        .await
        .unwrap();

    let err = plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("GCP_2"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));

    // A deployed project still blocks new deploys.
    plane.drain().await;
    let err = plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("GCP_3"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));
}

#[tokio::test]
async fn concurrent_submissions_admit_exactly_one() {
    let plane = TestControlPlane::new();
    let project = plane.add_project("racy", ServiceProvider::Aws);

    let (a, b) = tokio::join!(
        plane
            .submitter
            .submit_deploy(&plane.user, &project, DeployRequest::new("AWS_1")),
        plane
            .submitter
            .submit_deploy(&plane.user, &project, DeployRequest::new("AWS_2")),
    );

    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let err = a.err().or(b.err()).unwrap();
    assert!(matches!(err, ControlError::Conflict(_)));
    assert_eq!(plane.queue.len().await, 1);
}

#[tokio::test]
async fn destroy_without_a_deployment_is_rejected() {
    let plane = TestControlPlane::new();
    let project = plane.add_project("idle", ServiceProvider::Aws);

    let err = plane
        .submitter
        .submit_destroy(&plane.user, &project)
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::Conflict(ref msg) if msg.contains("not deployed")));
    assert!(plane.queue.is_empty().await);
}

#[tokio::test]
async fn redeploy_after_destroy_starts_a_fresh_record() {
    let plane = TestControlPlane::new();
    let project = plane.add_project("cycle", ServiceProvider::Aws);

    let first = plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("AWS_2"))
        .await
        .unwrap();
    plane.drain().await;
    plane
        .submitter
        .submit_destroy(&plane.user, &project)
        .await
        .unwrap();
    plane.drain().await;

    let second = plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("AWS_1"))
        .await
        .unwrap();
    assert_ne!(first.deployment_id, second.deployment_id);
    plane.drain().await;

    assert_eq!(
        plane.record(&first.deployment_id).await.status,
        DeploymentStatus::Destroyed
    );
    assert_eq!(
        plane.record(&second.deployment_id).await.status,
        DeploymentStatus::Deployed
    );
    let latest = plane.store.get_by_project(&project).await.unwrap().unwrap();
    assert_eq!(latest.data.id, second.deployment_id);
}

#[tokio::test]
async fn delete_retention_removes_the_record() {
    let plane = TestControlPlane::with_settings(WorkerSettings {
        retention: RetentionPolicy::Delete,
        ..WorkerSettings::default()
    });
    let project = plane.add_project("ephemeral", ServiceProvider::Gcp);

    let accepted = plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("GCP_3"))
        .await
        .unwrap();
    plane.drain().await;
    plane
        .submitter
        .submit_destroy(&plane.user, &project)
        .await
        .unwrap();
    plane.drain().await;

    assert!(plane
        .store
        .get(&accepted.deployment_id)
        .await
        .unwrap()
        .is_none());
    assert!(plane.tool.live_targets().is_empty());
}

#[tokio::test]
async fn duplicate_destroy_submissions_run_once() {
    let plane = TestControlPlane::new();
    let project = plane.add_project("twice", ServiceProvider::Aws);

    let accepted = plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("AWS_1"))
        .await
        .unwrap();
    plane.drain().await;

    plane
        .submitter
        .submit_destroy(&plane.user, &project)
        .await
        .unwrap();
    plane
        .submitter
        .submit_destroy(&plane.user, &project)
        .await
        .unwrap();
    assert_eq!(plane.drain().await, 2);

    assert_eq!(
        plane.record(&accepted.deployment_id).await.status,
        DeploymentStatus::Destroyed
    );
    let destroys = plane
        .tool
        .calls()
        .into_iter()
        .filter(|c| *c == ToolCall::Destroy)
        .count();
    assert_eq!(destroys, 1);
}

#[tokio::test]
async fn concurrent_destroy_jobs_tear_down_once() {
    let plane = TestControlPlane::new();
    let project = plane.add_project("twice", ServiceProvider::Aws);

    let accepted = plane
        .submitter
        .submit_deploy(&plane.user, &project, DeployRequest::new("AWS_2"))
        .await
        .unwrap();
    plane.drain().await;

    for _ in 0..2 {
        plane
            .submitter
            .submit_destroy(&plane.user, &project)
            .await
            .unwrap();
    }
    plane.tool.set_delay(Duration::from_millis(200));

    let (first, second) = tokio::join!(plane.worker.process_next(), plane.worker.process_next());
    assert!(first.unwrap());
    assert!(second.unwrap());
    assert!(plane.queue.is_empty().await);

    let destroys = plane
        .tool
        .calls()
        .into_iter()
        .filter(|c| *c == ToolCall::Destroy)
        .count();
    assert_eq!(destroys, 1);

    let record = plane.record(&accepted.deployment_id).await;
    assert_eq!(record.status, DeploymentStatus::Destroyed);
    assert!(record.data.error.is_none());
    assert!(plane.tool.live_targets().is_empty());
}

#[tokio::test]
async fn other_tenants_cannot_touch_a_project() {
    let plane = TestControlPlane::new();
    plane
        .projects
        .insert(
            ProjectBuilder::new("theirs", ServiceProvider::Aws)
                .owned_by("user-2")
                .build(),
        )
        .unwrap();

    let err = plane
        .submitter
        .submit_deploy(
            &plane.user,
            &datalake_control::ProjectId::new("theirs"),
            DeployRequest::new("AWS_1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound { .. }));
}
