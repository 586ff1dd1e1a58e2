//! Azure topologies.

use crate::error::ProviderError;
use crate::types::{DeployType, ResourceDescriptor};

use super::naming::NamePolicy;
use super::{hcl_string, required, Blueprint, PlanContext, ProviderBlock, Stage};

fn resource_group_stage(name: &str, location: &str) -> Stage {
    let config = format!(
        "resource \"azurerm_resource_group\" \"datalake\" {{\n  name     = {}\n  location = {}\n}}\n",
        hcl_string(name),
        hcl_string(location)
    );

    Stage::new("resource_group", config)
        .target("azurerm_resource_group.datalake")
        .attribute("name", name)
        .attribute("location", location)
}

fn storage_account_stage(name: &str) -> Stage {
    let config = format!(
        r#"resource "azurerm_storage_account" "datalake" {{
  name                     = {}
  resource_group_name      = azurerm_resource_group.datalake.name
  location                 = azurerm_resource_group.datalake.location
  account_tier             = "Standard"
  account_replication_type = "LRS"
  is_hns_enabled           = true
}}
"#,
        hcl_string(name)
    );

    Stage::new("storage_account", config)
        .target("azurerm_storage_account.datalake")
        .attribute("name", name)
}

fn filesystem_stage(name: &str) -> Stage {
    let config = format!(
        r#"resource "azurerm_storage_data_lake_gen2_filesystem" "datalake" {{
  name               = {}
  storage_account_id = azurerm_storage_account.datalake.id
}}
"#,
        hcl_string(name)
    );

    Stage::new("filesystem", config)
        .target("azurerm_storage_data_lake_gen2_filesystem.datalake")
        .attribute("name", name)
}

/// `AZURE_1`: a resource group holding an ADLS Gen2 storage account and filesystem.
///
/// Descriptor: `resource_group.name`, `storage_account.name`, `filesystem.name`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdlsGen2;

impl Blueprint for AdlsGen2 {
    fn deploy_type(&self) -> DeployType {
        DeployType::Azure1
    }

    fn provider(&self, _ctx: &PlanContext<'_>) -> Result<ProviderBlock, ProviderError> {
        Ok(ProviderBlock {
            name: "azurerm",
            source: "hashicorp/azurerm",
            version: "~> 3.0",
            config: "provider \"azurerm\" {\n  features {}\n}\n".to_owned(),
        })
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<Stage>, ProviderError> {
        let project = &ctx.project.id;
        Ok(vec![
            resource_group_stage(
                &NamePolicy::RESOURCE_GROUP.generate(project),
                &ctx.placement.location,
            ),
            storage_account_stage(&NamePolicy::STORAGE_ACCOUNT.generate(project)),
            filesystem_stage(&NamePolicy::FILESYSTEM.generate(project)),
        ])
    }

    fn restore(
        &self,
        ctx: &PlanContext<'_>,
        resources: &ResourceDescriptor,
    ) -> Result<Vec<Stage>, ProviderError> {
        // Later stages reference the resource group, so without it there is
        // nothing the configuration can address.
        if !resources.contains("resource_group") {
            return Ok(Vec::new());
        }

        let location = resources
            .get("resource_group", "location")
            .unwrap_or(ctx.placement.location.as_str());
        let mut stages = vec![resource_group_stage(
            required(resources, "resource_group", "name")?,
            location,
        )];
        if resources.contains("storage_account") {
            stages.push(storage_account_stage(required(
                resources,
                "storage_account",
                "name",
            )?));
            if resources.contains("filesystem") {
                stages.push(filesystem_stage(required(resources, "filesystem", "name")?));
            }
        }
        Ok(stages)
    }
}
