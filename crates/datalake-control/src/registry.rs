//! Deploy type registry.
//!
//! Maps each [`DeployType`] to the strategy that implements it. The mapping
//! is an exhaustive match, so adding a deploy type without a strategy does
//! not compile.

use std::sync::Arc;

use crate::config::ProvisioningConfig;
use crate::error::{ControlError, ControlResult};
use crate::strategy::aws::{S3DynamoDb, S3OpenSearch};
use crate::strategy::azure::AdlsGen2;
use crate::strategy::gcp::{BigQuery, BigQueryStorage, BigtableStorage};
use crate::strategy::{create_tool, DeploymentStrategy, ProvisioningTool, TopologyStrategy};
use crate::types::{DeployParameters, DeployType, Project};

/// Longest accepted deploy parameter value.
const MAX_PARAMETER_LEN: usize = 64;

/// Resolves deploy types to strategies sharing one provisioning tool.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    tool: Arc<dyn ProvisioningTool>,
    config: Arc<ProvisioningConfig>,
}

impl StrategyRegistry {
    /// Create a registry around an existing tool.
    #[must_use]
    pub fn new(tool: Arc<dyn ProvisioningTool>, config: ProvisioningConfig) -> Self {
        Self {
            tool,
            config: Arc::new(config),
        }
    }

    /// Create a registry with the tool named in configuration.
    #[must_use]
    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self::new(create_tool(config), config.clone())
    }

    /// The provisioning tool strategies run.
    #[must_use]
    pub fn tool(&self) -> &Arc<dyn ProvisioningTool> {
        &self.tool
    }

    /// Parse a requested deploy type.
    pub fn parse(raw: &str) -> ControlResult<DeployType> {
        raw.parse().map_err(ControlError::Configuration)
    }

    /// Strategy for a deploy type.
    #[must_use]
    pub fn resolve(&self, deploy_type: DeployType) -> Arc<dyn DeploymentStrategy> {
        let tool = Arc::clone(&self.tool);
        let config = Arc::clone(&self.config);
        match deploy_type {
            DeployType::Aws1 => Arc::new(TopologyStrategy::new(S3OpenSearch, tool, config)),
            DeployType::Aws2 => Arc::new(TopologyStrategy::new(S3DynamoDb, tool, config)),
            DeployType::Gcp1 => Arc::new(TopologyStrategy::new(BigQuery, tool, config)),
            DeployType::Gcp2 => Arc::new(TopologyStrategy::new(BigtableStorage, tool, config)),
            DeployType::Gcp3 => Arc::new(TopologyStrategy::new(BigQueryStorage, tool, config)),
            DeployType::Azure1 => Arc::new(TopologyStrategy::new(AdlsGen2, tool, config)),
        }
    }

    /// Strategy for a deploy type given by name.
    pub fn resolve_name(&self, raw: &str) -> ControlResult<Arc<dyn DeploymentStrategy>> {
        Ok(self.resolve(Self::parse(raw)?))
    }

    /// Check that a deploy type fits the project and its parameters are understood.
    pub fn validate(
        deploy_type: DeployType,
        project: &Project,
        parameters: &DeployParameters,
    ) -> ControlResult<()> {
        if deploy_type.provider() != project.service_provider {
            return Err(ControlError::validation(format!(
                "deploy type {deploy_type} targets {}, but project {} uses {}",
                deploy_type.provider(),
                project.id,
                project.service_provider
            )));
        }

        let allowed = deploy_type.parameter_keys();
        for (key, value) in parameters {
            if !allowed.contains(&key.as_str()) {
                return Err(ControlError::validation(format!(
                    "unknown deploy parameter {key:?} for {deploy_type} \
                     (expected one of {allowed:?})"
                )));
            }
            let well_formed = !value.is_empty()
                && value.len() <= MAX_PARAMETER_LEN
                && value
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !well_formed {
                return Err(ControlError::validation(format!(
                    "deploy parameter {key:?} has an invalid value"
                )));
            }
        }

        Ok(())
    }
}
