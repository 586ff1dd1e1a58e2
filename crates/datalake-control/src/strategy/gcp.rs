//! GCP topologies.

use crate::error::ProviderError;
use crate::types::{Credentials, DeployType, ResourceDescriptor};

use super::naming::NamePolicy;
use super::{hcl_string, required, Blueprint, PlanContext, ProviderBlock, Stage};

/// GCP project the service account deploys into.
fn gcp_project<'a>(ctx: &PlanContext<'a>) -> Result<&'a str, ProviderError> {
    match ctx.credentials {
        Credentials::Gcp(gcp) => Ok(&gcp.project_id),
        other => Err(ProviderError::CredentialMismatch {
            expected: "GCP",
            found: other.provider().as_str(),
        }),
    }
}

fn provider(ctx: &PlanContext<'_>) -> Result<ProviderBlock, ProviderError> {
    let project = gcp_project(ctx)?;
    Ok(ProviderBlock {
        name: "google",
        source: "hashicorp/google",
        version: "~> 5.0",
        config: format!(
            "provider \"google\" {{\n  project = {}\n  region  = {}\n}}\n",
            hcl_string(project),
            hcl_string(&ctx.placement.region)
        ),
    })
}

fn bigquery_stage(project: &str, dataset: &str, table: &str, location: &str) -> Stage {
    let config = format!(
        r#"resource "google_bigquery_dataset" "datalake" {{
  dataset_id                 = {dataset_hcl}
  location                   = {location_hcl}
  delete_contents_on_destroy = true
}}

resource "google_bigquery_table" "datalake" {{
  dataset_id          = google_bigquery_dataset.datalake.dataset_id
  table_id            = {table_hcl}
  deletion_protection = false
}}
"#,
        dataset_hcl = hcl_string(dataset),
        location_hcl = hcl_string(location),
        table_hcl = hcl_string(table),
    );

    Stage::new("bigquery", config)
        .target("google_bigquery_dataset.datalake")
        .target("google_bigquery_table.datalake")
        .attribute("project", project)
        .attribute("dataset", dataset)
        .attribute("table", table)
        .attribute("location", location)
}

fn bigtable_stage(project: &str, instance: &str, cluster: &str, table: &str, zone: &str) -> Stage {
    let config = format!(
        r#"resource "google_bigtable_instance" "datalake" {{
  name                = {instance_hcl}
  deletion_protection = false

  cluster {{
    cluster_id   = {cluster_hcl}
    zone         = {zone_hcl}
    num_nodes    = 1
    storage_type = "HDD"
  }}
}}

resource "google_bigtable_table" "datalake" {{
  name          = {table_hcl}
  instance_name = google_bigtable_instance.datalake.name
}}
"#,
        instance_hcl = hcl_string(instance),
        cluster_hcl = hcl_string(cluster),
        zone_hcl = hcl_string(zone),
        table_hcl = hcl_string(table),
    );

    Stage::new("bigtable", config)
        .target("google_bigtable_instance.datalake")
        .target("google_bigtable_table.datalake")
        .attribute("project", project)
        .attribute("instance", instance)
        .attribute("cluster", cluster)
        .attribute("table", table)
        .attribute("zone", zone)
}

fn storage_stage(bucket: &str, location: &str) -> Stage {
    let config = format!(
        r#"resource "google_storage_bucket" "datalake" {{
  name                        = {}
  location                    = {}
  force_destroy               = true
  uniform_bucket_level_access = true
}}
"#,
        hcl_string(bucket),
        hcl_string(location)
    );

    Stage::new("cloud_storage", config)
        .target("google_storage_bucket.datalake")
        .attribute("bucket", bucket)
        .attribute("location", location)
}

fn plan_bigquery(ctx: &PlanContext<'_>) -> Result<Stage, ProviderError> {
    let project = gcp_project(ctx)?;
    Ok(bigquery_stage(
        project,
        &NamePolicy::BIGQUERY_DATASET.generate(&ctx.project.id),
        &NamePolicy::BIGQUERY_TABLE.generate(&ctx.project.id),
        &ctx.placement.location,
    ))
}

fn plan_storage(ctx: &PlanContext<'_>) -> Stage {
    storage_stage(
        &NamePolicy::GCS_BUCKET.generate(&ctx.project.id),
        &ctx.placement.location,
    )
}

fn restore_bigquery(
    ctx: &PlanContext<'_>,
    resources: &ResourceDescriptor,
) -> Result<Option<Stage>, ProviderError> {
    if !resources.contains("bigquery") {
        return Ok(None);
    }
    let project = gcp_project(ctx)?;
    Ok(Some(bigquery_stage(
        project,
        required(resources, "bigquery", "dataset")?,
        required(resources, "bigquery", "table")?,
        resources
            .get("bigquery", "location")
            .unwrap_or(ctx.placement.location.as_str()),
    )))
}

fn restore_storage(
    ctx: &PlanContext<'_>,
    resources: &ResourceDescriptor,
) -> Result<Option<Stage>, ProviderError> {
    if !resources.contains("cloud_storage") {
        return Ok(None);
    }
    Ok(Some(storage_stage(
        required(resources, "cloud_storage", "bucket")?,
        resources
            .get("cloud_storage", "location")
            .unwrap_or(ctx.placement.location.as_str()),
    )))
}

/// `GCP_1`: a BigQuery dataset with one table.
///
/// Descriptor: `bigquery.{project, dataset, table}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BigQuery;

impl Blueprint for BigQuery {
    fn deploy_type(&self) -> DeployType {
        DeployType::Gcp1
    }

    fn provider(&self, ctx: &PlanContext<'_>) -> Result<ProviderBlock, ProviderError> {
        provider(ctx)
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<Stage>, ProviderError> {
        Ok(vec![plan_bigquery(ctx)?])
    }

    fn restore(
        &self,
        ctx: &PlanContext<'_>,
        resources: &ResourceDescriptor,
    ) -> Result<Vec<Stage>, ProviderError> {
        Ok(restore_bigquery(ctx, resources)?.into_iter().collect())
    }
}

/// `GCP_2`: a Bigtable instance, cluster and table, plus a Cloud Storage bucket.
///
/// Descriptor: `bigtable.{project, cluster, instance, table}`, `cloud_storage.bucket`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BigtableStorage;

impl Blueprint for BigtableStorage {
    fn deploy_type(&self) -> DeployType {
        DeployType::Gcp2
    }

    fn provider(&self, ctx: &PlanContext<'_>) -> Result<ProviderBlock, ProviderError> {
        provider(ctx)
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<Stage>, ProviderError> {
        let project = gcp_project(ctx)?;
        let owner = &ctx.project.id;
        let zone = format!("{}-a", ctx.placement.region);
        Ok(vec![
            bigtable_stage(
                project,
                &NamePolicy::BIGTABLE_INSTANCE.generate(owner),
                &NamePolicy::BIGTABLE_CLUSTER.generate(owner),
                &NamePolicy::BIGTABLE_TABLE.generate(owner),
                &zone,
            ),
            plan_storage(ctx),
        ])
    }

    fn restore(
        &self,
        ctx: &PlanContext<'_>,
        resources: &ResourceDescriptor,
    ) -> Result<Vec<Stage>, ProviderError> {
        let mut stages = Vec::new();
        if resources.contains("bigtable") {
            let zone = resources
                .get("bigtable", "zone")
                .map_or_else(|| format!("{}-a", ctx.placement.region), str::to_owned);
            stages.push(bigtable_stage(
                gcp_project(ctx)?,
                required(resources, "bigtable", "instance")?,
                required(resources, "bigtable", "cluster")?,
                required(resources, "bigtable", "table")?,
                &zone,
            ));
        }
        stages.extend(restore_storage(ctx, resources)?);
        Ok(stages)
    }
}

/// `GCP_3`: a BigQuery dataset and table, plus a Cloud Storage bucket.
///
/// Descriptor: `bigquery.{project, dataset, table}`, `cloud_storage.bucket`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BigQueryStorage;

impl Blueprint for BigQueryStorage {
    fn deploy_type(&self) -> DeployType {
        DeployType::Gcp3
    }

    fn provider(&self, ctx: &PlanContext<'_>) -> Result<ProviderBlock, ProviderError> {
        provider(ctx)
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<Stage>, ProviderError> {
        Ok(vec![plan_bigquery(ctx)?, plan_storage(ctx)])
    }

    fn restore(
        &self,
        ctx: &PlanContext<'_>,
        resources: &ResourceDescriptor,
    ) -> Result<Vec<Stage>, ProviderError> {
        let mut stages: Vec<Stage> = restore_bigquery(ctx, resources)?.into_iter().collect();
        stages.extend(restore_storage(ctx, resources)?);
        Ok(stages)
    }
}
