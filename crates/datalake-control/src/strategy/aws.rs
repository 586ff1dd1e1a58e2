//! AWS topologies.

use crate::error::ProviderError;
use crate::types::{DeployType, ResourceDescriptor};

use super::naming::NamePolicy;
use super::{hcl_string, required, Blueprint, PlanContext, ProviderBlock, Stage};

fn provider(ctx: &PlanContext<'_>) -> ProviderBlock {
    ProviderBlock {
        name: "aws",
        source: "hashicorp/aws",
        version: "~> 5.0",
        config: format!(
            "provider \"aws\" {{\n  region = {}\n}}\n",
            hcl_string(&ctx.placement.region)
        ),
    }
}

fn s3_stage(bucket: &str, region: &str) -> Stage {
    let config = format!(
        r#"resource "aws_s3_bucket" "datalake" {{
  bucket        = {}
  force_destroy = true
}}
"#,
        hcl_string(bucket)
    );

    Stage::new("s3", config)
        .target("aws_s3_bucket.datalake")
        .attribute("bucket_name", bucket)
        .attribute("region", region)
}

fn opensearch_stage(domain: &str, region: &str) -> Stage {
    let config = format!(
        r#"resource "aws_opensearch_domain" "datalake" {{
  domain_name    = {}
  engine_version = "OpenSearch_2.11"

  cluster_config {{
    instance_type  = "t3.small.search"
    instance_count = 1
  }}

  ebs_options {{
    ebs_enabled = true
    volume_size = 10
  }}
}}

output "opensearch_endpoint" {{
  value = aws_opensearch_domain.datalake.endpoint
}}
"#,
        hcl_string(domain)
    );

    Stage::new("opensearch", config)
        .target("aws_opensearch_domain.datalake")
        .attribute("domain_name", domain)
        .attribute("region", region)
        .output("endpoint", "opensearch_endpoint")
}

fn dynamodb_stage(table: &str, region: &str) -> Stage {
    let config = format!(
        r#"resource "aws_dynamodb_table" "datalake" {{
  name         = {}
  billing_mode = "PAY_PER_REQUEST"
  hash_key     = "id"

  attribute {{
    name = "id"
    type = "S"
  }}
}}
"#,
        hcl_string(table)
    );

    Stage::new("dynamodb", config)
        .target("aws_dynamodb_table.datalake")
        .attribute("dynamodb_name", table)
        .attribute("region", region)
}

fn restore_s3(
    resources: &ResourceDescriptor,
    ctx: &PlanContext<'_>,
) -> Result<Option<Stage>, ProviderError> {
    if !resources.contains("s3") {
        return Ok(None);
    }
    let bucket = required(resources, "s3", "bucket_name")?;
    Ok(Some(s3_stage(bucket, &ctx.placement.region)))
}

/// `AWS_1`: an S3 bucket and an OpenSearch domain.
///
/// Descriptor: `s3.bucket_name`, `opensearch.domain_name`, `opensearch.endpoint`.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3OpenSearch;

impl Blueprint for S3OpenSearch {
    fn deploy_type(&self) -> DeployType {
        DeployType::Aws1
    }

    fn provider(&self, ctx: &PlanContext<'_>) -> Result<ProviderBlock, ProviderError> {
        Ok(provider(ctx))
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<Stage>, ProviderError> {
        let project = &ctx.project.id;
        let region = &ctx.placement.region;
        Ok(vec![
            s3_stage(&NamePolicy::S3_BUCKET.generate(project), region),
            opensearch_stage(&NamePolicy::OPENSEARCH_DOMAIN.generate(project), region),
        ])
    }

    fn restore(
        &self,
        ctx: &PlanContext<'_>,
        resources: &ResourceDescriptor,
    ) -> Result<Vec<Stage>, ProviderError> {
        let mut stages: Vec<Stage> = restore_s3(resources, ctx)?.into_iter().collect();
        if resources.contains("opensearch") {
            let domain = required(resources, "opensearch", "domain_name")?;
            stages.push(opensearch_stage(domain, &ctx.placement.region));
        }
        Ok(stages)
    }
}

/// `AWS_2`: an S3 bucket and a DynamoDB table.
///
/// Descriptor: `s3.bucket_name`, `dynamodb.dynamodb_name`.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3DynamoDb;

impl Blueprint for S3DynamoDb {
    fn deploy_type(&self) -> DeployType {
        DeployType::Aws2
    }

    fn provider(&self, ctx: &PlanContext<'_>) -> Result<ProviderBlock, ProviderError> {
        Ok(provider(ctx))
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<Stage>, ProviderError> {
        let project = &ctx.project.id;
        let region = &ctx.placement.region;
        Ok(vec![
            s3_stage(&NamePolicy::S3_BUCKET.generate(project), region),
            dynamodb_stage(&NamePolicy::DYNAMODB_TABLE.generate(project), region),
        ])
    }

    fn restore(
        &self,
        ctx: &PlanContext<'_>,
        resources: &ResourceDescriptor,
    ) -> Result<Vec<Stage>, ProviderError> {
        let mut stages: Vec<Stage> = restore_s3(resources, ctx)?.into_iter().collect();
        if resources.contains("dynamodb") {
            let table = required(resources, "dynamodb", "dynamodb_name")?;
            stages.push(dynamodb_stage(table, &ctx.placement.region));
        }
        Ok(stages)
    }
}
