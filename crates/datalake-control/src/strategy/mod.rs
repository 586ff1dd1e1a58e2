//! Deployment strategies.
//!
//! A [`DeploymentStrategy`] provisions and tears down the resources of one
//! deploy type. Every strategy in this crate is a [`TopologyStrategy`]: a
//! provider-specific [`Blueprint`] renders the topology as a list of
//! [`Stage`]s, and a shared driver applies them one at a time through a
//! [`ProvisioningTool`]. Applying stage by stage is what lets a failed deploy
//! report exactly which resources it left behind.
//!
//! Teardown never depends on state kept by the strategy itself. The
//! blueprint re-renders the configuration from the stored
//! [`ResourceDescriptor`]. The tool's own state is another matter: with a
//! shared state backend any worker can destroy what another created, while
//! local state ties teardown to the host that provisioned the deployment.
//! Teardown from a workspace with no state fails with
//! [`ProviderError::StateUnavailable`] instead of reporting success.

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod naming;
pub mod tool;

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::config::{ProvisioningConfig, StateBackendConfig, StateBackendKind};
use crate::error::{ProviderError, ProvisionFailure};
use crate::types::{
    Credentials, DeployParameters, DeployType, DeploymentId, Project, ResourceDescriptor,
    ServiceProvider,
};

pub use tool::{create_tool, MockTool, ProvisioningTool, Terraform, ToolCall, Workspace};

/// Everything a strategy needs to act for one deployment.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Deployment being acted on.
    pub deployment_id: &'a DeploymentId,
    /// Owning project.
    pub project: &'a Project,
    /// Provider credentials.
    pub credentials: &'a Credentials,
    /// Deploy parameters recorded with the deployment.
    pub parameters: &'a DeployParameters,
}

/// Provisions and tears down the resources of one deploy type.
#[async_trait]
pub trait DeploymentStrategy: Send + Sync + fmt::Debug {
    /// Deploy type this strategy implements.
    fn deploy_type(&self) -> DeployType;

    /// Create every resource of the topology.
    ///
    /// On failure the returned [`ProvisionFailure`] carries whatever was
    /// confirmed created, so it can be recorded and cleaned up.
    async fn deploy(
        &self,
        invocation: &Invocation<'_>,
    ) -> Result<ResourceDescriptor, ProvisionFailure>;

    /// Remove the resources named in `resources`.
    ///
    /// Resources that no longer exist count as removed.
    async fn destroy(
        &self,
        invocation: &Invocation<'_>,
        resources: &ResourceDescriptor,
    ) -> Result<(), ProviderError>;
}

/// Region and location a deployment is placed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Provider region.
    pub region: String,
    /// Location for location-scoped resources (datasets, buckets, resource groups).
    pub location: String,
}

impl Placement {
    /// Resolve placement from deploy parameters, falling back to configured defaults.
    #[must_use]
    pub fn resolve(
        provider: ServiceProvider,
        parameters: &DeployParameters,
        config: &ProvisioningConfig,
    ) -> Self {
        let param = |key: &str, default: &str| {
            parameters
                .get(key)
                .map_or_else(|| default.to_owned(), Clone::clone)
        };

        match provider {
            ServiceProvider::Aws => {
                let region = param("region", &config.aws_region);
                Self {
                    location: region.clone(),
                    region,
                }
            }
            ServiceProvider::Gcp => Self {
                region: param("region", &config.gcp_region),
                location: param("location", &config.gcp_location),
            },
            ServiceProvider::Azure => {
                let location = param("location", &config.azure_location);
                Self {
                    region: location.clone(),
                    location,
                }
            }
        }
    }
}

/// Inputs a blueprint renders from.
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    /// Owning project; names are derived from its ID.
    pub project: &'a Project,
    /// Provider credentials.
    pub credentials: &'a Credentials,
    /// Resolved placement.
    pub placement: Placement,
}

/// Provider plugin requirement and configuration block.
#[derive(Debug, Clone)]
pub struct ProviderBlock {
    /// Local provider name (`aws`, `google`, `azurerm`).
    pub name: &'static str,
    /// Registry source.
    pub source: &'static str,
    /// Version constraint.
    pub version: &'static str,
    /// The `provider "..." { }` block.
    pub config: String,
}

/// One independently applied slice of a topology.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Logical resource name used in the descriptor.
    pub resource: &'static str,
    /// Tool addresses the stage creates.
    pub targets: Vec<String>,
    /// Configuration for the stage.
    pub config: String,
    /// Descriptor attributes known before apply.
    pub attributes: BTreeMap<String, String>,
    /// Descriptor attributes read from tool outputs, as `(attribute, output)`.
    pub outputs: Vec<(&'static str, String)>,
}

impl Stage {
    /// Create a stage.
    #[must_use]
    pub fn new(resource: &'static str, config: String) -> Self {
        Self {
            resource,
            targets: Vec::new(),
            config,
            attributes: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }

    /// Add a tool address the stage creates.
    #[must_use]
    pub fn target(mut self, address: impl Into<String>) -> Self {
        self.targets.push(address.into());
        self
    }

    /// Add a descriptor attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Read a descriptor attribute from a tool output after apply.
    #[must_use]
    pub fn output(mut self, attribute: &'static str, output: impl Into<String>) -> Self {
        self.outputs.push((attribute, output.into()));
        self
    }
}

/// Provider-specific rendering of a deploy type.
pub trait Blueprint: Send + Sync + fmt::Debug {
    /// Deploy type rendered.
    fn deploy_type(&self) -> DeployType;

    /// Provider requirement and configuration.
    fn provider(&self, ctx: &PlanContext<'_>) -> Result<ProviderBlock, ProviderError>;

    /// Stages for a fresh deployment, in apply order, with newly generated names.
    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<Stage>, ProviderError>;

    /// Stages matching the resources in a descriptor, for teardown.
    ///
    /// Resources absent from the descriptor are left out, so a partial
    /// descriptor yields a partial topology.
    fn restore(
        &self,
        ctx: &PlanContext<'_>,
        resources: &ResourceDescriptor,
    ) -> Result<Vec<Stage>, ProviderError>;
}

/// Read a required attribute from a descriptor.
pub(crate) fn required<'r>(
    resources: &'r ResourceDescriptor,
    resource: &str,
    attribute: &str,
) -> Result<&'r str, ProviderError> {
    resources
        .get(resource, attribute)
        .ok_or_else(|| ProviderError::IncompleteDescriptor {
            resource: resource.to_owned(),
            attribute: attribute.to_owned(),
        })
}

/// Quote a value as an HCL string literal.
#[must_use]
pub fn hcl_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Location of a deployment's state within the backend.
fn state_path(backend: &StateBackendConfig, invocation: &Invocation<'_>) -> String {
    format!(
        "{}/{}/{}",
        backend.prefix.trim_end_matches('/'),
        invocation.project.id,
        invocation.deployment_id
    )
}

/// Render the `terraform { }` settings block and provider configuration.
fn render_main(
    provider: &ProviderBlock,
    backend: Option<&StateBackendConfig>,
    invocation: &Invocation<'_>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "terraform {{");
    let _ = writeln!(out, "  required_providers {{");
    let _ = writeln!(out, "    {} = {{", provider.name);
    let _ = writeln!(out, "      source  = {}", hcl_string(provider.source));
    let _ = writeln!(out, "      version = {}", hcl_string(provider.version));
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "  }}");

    if let Some(backend) = backend {
        let path = state_path(backend, invocation);
        match backend.kind {
            StateBackendKind::Gcs => {
                let _ = writeln!(out, "  backend \"gcs\" {{");
                let _ = writeln!(out, "    bucket = {}", hcl_string(&backend.bucket));
                let _ = writeln!(out, "    prefix = {}", hcl_string(&path));
            }
            StateBackendKind::S3 => {
                let _ = writeln!(out, "  backend \"s3\" {{");
                let _ = writeln!(out, "    bucket = {}", hcl_string(&backend.bucket));
                let _ = writeln!(
                    out,
                    "    key    = {}",
                    hcl_string(&format!("{path}/terraform.tfstate"))
                );
                if let Some(region) = &backend.region {
                    let _ = writeln!(out, "    region = {}", hcl_string(region));
                }
            }
        }
        let _ = writeln!(out, "  }}");
    }

    let _ = writeln!(out, "}}");
    out.push('\n');
    out.push_str(&provider.config);
    out
}

/// Drives a [`Blueprint`] through a [`ProvisioningTool`].
#[derive(Debug)]
pub struct TopologyStrategy<B> {
    blueprint: B,
    tool: Arc<dyn ProvisioningTool>,
    config: Arc<ProvisioningConfig>,
}

impl<B: Blueprint> TopologyStrategy<B> {
    /// Create a strategy for `blueprint`.
    #[must_use]
    pub fn new(
        blueprint: B,
        tool: Arc<dyn ProvisioningTool>,
        config: Arc<ProvisioningConfig>,
    ) -> Self {
        Self {
            blueprint,
            tool,
            config,
        }
    }

    fn context<'a>(&self, invocation: &Invocation<'a>) -> Result<PlanContext<'a>, ProviderError> {
        let expected = self.blueprint.deploy_type().provider();
        let found = invocation.credentials.provider();
        if expected != found {
            return Err(ProviderError::CredentialMismatch {
                expected: expected.as_str(),
                found: found.as_str(),
            });
        }

        Ok(PlanContext {
            project: invocation.project,
            credentials: invocation.credentials,
            placement: Placement::resolve(expected, invocation.parameters, &self.config),
        })
    }

    /// Write the configuration for `stages` into the deployment's workspace.
    async fn prepare(
        &self,
        invocation: &Invocation<'_>,
        ctx: &PlanContext<'_>,
        stages: &[Stage],
    ) -> Result<Workspace, ProviderError> {
        let env = invocation
            .credentials
            .environment()
            .map_err(|e| ProviderError::Workspace(format!("failed to encode credentials: {e}")))?;

        let mut workspace = Workspace::open(
            &self.config.work_dir,
            &invocation.project.id,
            invocation.deployment_id,
            env,
        )
        .await?;
        if let Some(backend) = &self.config.state_backend {
            workspace = workspace.with_remote_state(state_path(backend, invocation));
        }

        let provider = self.blueprint.provider(ctx)?;
        workspace
            .write(
                "main.tf",
                &render_main(&provider, self.config.state_backend.as_ref(), invocation),
            )
            .await?;
        for stage in stages {
            workspace
                .write(&format!("{}.tf", stage.resource), &stage.config)
                .await?;
        }

        Ok(workspace)
    }

    async fn apply_stages(
        &self,
        workspace: &Workspace,
        stages: Vec<Stage>,
    ) -> Result<ResourceDescriptor, ProvisionFailure> {
        let mut created = ResourceDescriptor::new();

        if let Err(e) = self.tool.init(workspace).await {
            return Err(ProvisionFailure::new(e, created));
        }

        for stage in stages {
            debug!(resource = stage.resource, targets = ?stage.targets, "applying stage");
            if let Err(e) = self.tool.apply(workspace, &stage.targets).await {
                return Err(ProvisionFailure::new(e, created));
            }

            let mut attributes = stage.attributes;
            if !stage.outputs.is_empty() {
                let outputs = match self.tool.outputs(workspace).await {
                    Ok(outputs) => outputs,
                    Err(e) => {
                        created.insert(stage.resource, attributes);
                        return Err(ProvisionFailure::new(e, created));
                    }
                };
                for (attribute, output) in stage.outputs {
                    let Some(value) = outputs.get(&output) else {
                        created.insert(stage.resource, attributes);
                        return Err(ProvisionFailure::new(
                            ProviderError::MissingOutput(output),
                            created,
                        ));
                    };
                    attributes.insert(attribute.to_owned(), value.clone());
                }
            }

            created.insert(stage.resource, attributes);
        }

        Ok(created)
    }
}

#[async_trait]
impl<B: Blueprint> DeploymentStrategy for TopologyStrategy<B> {
    fn deploy_type(&self) -> DeployType {
        self.blueprint.deploy_type()
    }

    #[instrument(
        skip_all,
        fields(
            deployment_id = %invocation.deployment_id,
            project_id = %invocation.project.id,
            deploy_type = %self.blueprint.deploy_type(),
        )
    )]
    async fn deploy(
        &self,
        invocation: &Invocation<'_>,
    ) -> Result<ResourceDescriptor, ProvisionFailure> {
        let ctx = self
            .context(invocation)
            .map_err(|e| ProvisionFailure::new(e, ResourceDescriptor::new()))?;
        let stages = self
            .blueprint
            .plan(&ctx)
            .map_err(|e| ProvisionFailure::new(e, ResourceDescriptor::new()))?;
        let workspace = self
            .prepare(invocation, &ctx, &stages)
            .await
            .map_err(|e| ProvisionFailure::new(e, ResourceDescriptor::new()))?;

        let result = self.apply_stages(&workspace, stages).await;

        if self.config.state_backend.is_some() {
            workspace.remove().await;
        }

        match &result {
            Ok(resources) => info!(resources = resources.len(), "topology provisioned"),
            Err(failure) => warn!(
                error = %failure.error,
                created = failure.partial.len(),
                "topology provisioning failed"
            ),
        }
        result
    }

    #[instrument(
        skip_all,
        fields(
            deployment_id = %invocation.deployment_id,
            project_id = %invocation.project.id,
            deploy_type = %self.blueprint.deploy_type(),
        )
    )]
    async fn destroy(
        &self,
        invocation: &Invocation<'_>,
        resources: &ResourceDescriptor,
    ) -> Result<(), ProviderError> {
        if resources.is_empty() {
            debug!("nothing to destroy");
            return Ok(());
        }

        let ctx = self.context(invocation)?;
        let stages = self.blueprint.restore(&ctx, resources)?;
        if stages.is_empty() {
            warn!(
                resources = ?resources.resources().collect::<Vec<_>>(),
                "descriptor names no resources this deploy type manages"
            );
            return Ok(());
        }

        let workspace = self.prepare(invocation, &ctx, &stages).await?;
        self.tool.init(&workspace).await?;

        if !self.tool.has_state(&workspace).await? {
            let dir = workspace.dir().display().to_string();
            warn!(
                dir = %dir,
                resources = ?resources.resources().collect::<Vec<_>>(),
                "no provisioning state for recorded resources"
            );
            workspace.remove().await;
            return Err(ProviderError::StateUnavailable { dir });
        }

        match self.tool.destroy(&workspace).await {
            Ok(()) => info!("topology destroyed"),
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "resources already absent, treating as destroyed");
            }
            Err(e) => return Err(e),
        }

        // Local state stays so a redelivered teardown finds it emptied.
        if self.config.state_backend.is_some() {
            workspace.remove().await;
        }
        Ok(())
    }
}
