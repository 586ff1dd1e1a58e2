//! Core types for datalake-control.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Unique identifier for a deployment record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Create a deployment ID from an existing value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique deployment ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DeploymentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    /// Create a new project ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of the user that owns a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a new user ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cloud provider a project targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceProvider {
    /// Amazon Web Services.
    Aws,
    /// Google Cloud Platform.
    Gcp,
    /// Microsoft Azure.
    Azure,
}

impl ServiceProvider {
    /// Get the provider name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "AWS",
            Self::Gcp => "GCP",
            Self::Azure => "AZURE",
        }
    }
}

impl fmt::Display for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tenant-owned project as seen by the orchestration core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Project identifier.
    pub id: ProjectId,
    /// Owning user.
    pub owner: UserId,
    /// Display name.
    pub name: String,
    /// Whether the project's credentials have been verified.
    pub verified: bool,
    /// Provider the project deploys to.
    pub service_provider: ServiceProvider,
}

/// Serde adapter for secret strings carried in job payloads.
///
/// Secrets are exposed only when serialised into a payload the worker
/// must read back. `Debug` output stays redacted.
mod secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &SecretString,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<SecretString, D::Error> {
        String::deserialize(deserializer).map(SecretString::from)
    }
}

/// AWS access key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsCredentials {
    /// Access key ID.
    pub access_key_id: String,
    /// Secret access key.
    #[serde(with = "secret_string")]
    pub secret_access_key: SecretString,
}

/// GCP service account key, in the layout of a downloaded key file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpCredentials {
    /// Key type, normally `service_account`.
    #[serde(rename = "type")]
    pub account_type: String,
    /// GCP project the account belongs to.
    pub project_id: String,
    /// Private key identifier.
    pub private_key_id: String,
    /// PEM-encoded private key.
    #[serde(with = "secret_string")]
    pub private_key: SecretString,
    /// Service account email.
    pub client_email: String,
    /// Service account client ID.
    pub client_id: String,
    /// OAuth authorisation URI.
    pub auth_uri: String,
    /// OAuth token URI.
    pub token_uri: String,
    /// Provider certificate URL.
    pub auth_provider_x509_cert_url: String,
    /// Client certificate URL.
    pub client_x509_cert_url: String,
}

/// Azure service principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureCredentials {
    /// Directory (tenant) ID.
    pub tenant_id: String,
    /// Application (client) ID.
    pub client_id: String,
    /// Client secret.
    #[serde(with = "secret_string")]
    pub client_secret: SecretString,
    /// Subscription resources are created in.
    pub subscription_id: String,
}

/// Provider credentials for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum Credentials {
    /// AWS credentials.
    #[serde(rename = "AWS")]
    Aws(AwsCredentials),
    /// GCP credentials.
    #[serde(rename = "GCP")]
    Gcp(GcpCredentials),
    /// Azure credentials.
    #[serde(rename = "AZURE")]
    Azure(AzureCredentials),
}

impl Credentials {
    /// Provider these credentials authenticate against.
    #[must_use]
    pub const fn provider(&self) -> ServiceProvider {
        match self {
            Self::Aws(_) => ServiceProvider::Aws,
            Self::Gcp(_) => ServiceProvider::Gcp,
            Self::Azure(_) => ServiceProvider::Azure,
        }
    }

    /// Environment variables that hand these credentials to the provisioning tool.
    ///
    /// Credentials never touch disk; the tool process reads them from here.
    pub fn environment(&self) -> Result<Vec<(&'static str, SecretString)>, serde_json::Error> {
        let vars = match self {
            Self::Aws(aws) => vec![
                ("AWS_ACCESS_KEY_ID", SecretString::from(aws.access_key_id.clone())),
                (
                    "AWS_SECRET_ACCESS_KEY",
                    SecretString::from(aws.secret_access_key.expose_secret().to_owned()),
                ),
            ],
            Self::Gcp(gcp) => vec![(
                "GOOGLE_CREDENTIALS",
                SecretString::from(serde_json::to_string(gcp)?),
            )],
            Self::Azure(azure) => vec![
                ("ARM_TENANT_ID", SecretString::from(azure.tenant_id.clone())),
                ("ARM_CLIENT_ID", SecretString::from(azure.client_id.clone())),
                (
                    "ARM_CLIENT_SECRET",
                    SecretString::from(azure.client_secret.expose_secret().to_owned()),
                ),
                (
                    "ARM_SUBSCRIPTION_ID",
                    SecretString::from(azure.subscription_id.clone()),
                ),
            ],
        };
        Ok(vars)
    }
}

/// One of the fixed infrastructure topologies a project can be deployed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeployType {
    /// S3 bucket with an OpenSearch domain.
    #[serde(rename = "AWS_1")]
    Aws1,
    /// S3 bucket with a DynamoDB table.
    #[serde(rename = "AWS_2")]
    Aws2,
    /// BigQuery dataset with a table.
    #[serde(rename = "GCP_1")]
    Gcp1,
    /// Bigtable instance and table with a Cloud Storage bucket.
    #[serde(rename = "GCP_2")]
    Gcp2,
    /// BigQuery dataset and table with a Cloud Storage bucket.
    #[serde(rename = "GCP_3")]
    Gcp3,
    /// ADLS Gen2 storage account with a filesystem.
    #[serde(rename = "AZURE_1")]
    Azure1,
}

impl DeployType {
    /// Every supported deploy type.
    pub const ALL: [Self; 6] = [
        Self::Aws1,
        Self::Aws2,
        Self::Gcp1,
        Self::Gcp2,
        Self::Gcp3,
        Self::Azure1,
    ];

    /// Most stages any deploy type is applied in.
    pub const MAX_STAGES: u32 = 3;

    /// Get the deploy type as its wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aws1 => "AWS_1",
            Self::Aws2 => "AWS_2",
            Self::Gcp1 => "GCP_1",
            Self::Gcp2 => "GCP_2",
            Self::Gcp3 => "GCP_3",
            Self::Azure1 => "AZURE_1",
        }
    }

    /// Provider the deploy type provisions on.
    #[must_use]
    pub const fn provider(&self) -> ServiceProvider {
        match self {
            Self::Aws1 | Self::Aws2 => ServiceProvider::Aws,
            Self::Gcp1 | Self::Gcp2 | Self::Gcp3 => ServiceProvider::Gcp,
            Self::Azure1 => ServiceProvider::Azure,
        }
    }

    /// Number of stages the topology is applied in, one tool apply each.
    #[must_use]
    pub const fn stage_count(&self) -> u32 {
        match self {
            Self::Gcp1 => 1,
            Self::Aws1 | Self::Aws2 | Self::Gcp2 | Self::Gcp3 => 2,
            Self::Azure1 => 3,
        }
    }

    /// Deploy parameters the deploy type understands.
    #[must_use]
    pub const fn parameter_keys(&self) -> &'static [&'static str] {
        match self.provider() {
            ServiceProvider::Aws => &["region"],
            ServiceProvider::Gcp => &["region", "location"],
            ServiceProvider::Azure => &["location"],
        }
    }
}

impl fmt::Display for DeployType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeployType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|deploy_type| deploy_type.as_str() == s)
            .ok_or_else(|| format!("unknown deploy type: {s}"))
    }
}

/// Free-form deploy parameters.
pub type DeployParameters = BTreeMap<String, String>;

/// A deploy request as received from the request layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Requested deploy type, validated against the registry.
    pub deploy_type: String,
    /// Optional deploy parameters.
    #[serde(default)]
    pub parameters: DeployParameters,
}

impl DeployRequest {
    /// Create a request without parameters.
    #[must_use]
    pub fn new(deploy_type: impl Into<String>) -> Self {
        Self {
            deploy_type: deploy_type.into(),
            parameters: DeployParameters::new(),
        }
    }

    /// Add a deploy parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Names and identifiers of provisioned resources, keyed by logical resource
/// name and then by attribute.
///
/// ```text
/// { "s3": { "bucket_name": "..." }, "opensearch": { "domain_name": "...", "endpoint": "..." } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceDescriptor(BTreeMap<String, BTreeMap<String, String>>);

impl ResourceDescriptor {
    /// Create an empty descriptor.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Record a resource and its attributes, replacing any previous entry.
    pub fn insert<K, V>(
        &mut self,
        resource: impl Into<String>,
        attributes: impl IntoIterator<Item = (K, V)>,
    ) where
        K: Into<String>,
        V: Into<String>,
    {
        let attributes = attributes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.0.insert(resource.into(), attributes);
    }

    /// Builder form of [`Self::insert`].
    #[must_use]
    pub fn with<K, V>(
        mut self,
        resource: impl Into<String>,
        attributes: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.insert(resource, attributes);
        self
    }

    /// Add every resource of `other`, its attributes winning over ours.
    pub fn merge(&mut self, other: &Self) {
        for (resource, attributes) in &other.0 {
            self.0.insert(resource.clone(), attributes.clone());
        }
    }

    /// Attributes of a resource.
    #[must_use]
    pub fn resource(&self, resource: &str) -> Option<&BTreeMap<String, String>> {
        self.0.get(resource)
    }

    /// A single attribute of a resource.
    #[must_use]
    pub fn get(&self, resource: &str, attribute: &str) -> Option<&str> {
        self.0
            .get(resource)
            .and_then(|attrs| attrs.get(attribute))
            .map(String::as_str)
    }

    /// Whether a resource is present.
    #[must_use]
    pub fn contains(&self, resource: &str) -> bool {
        self.0.contains_key(resource)
    }

    /// Logical resource names, in sorted order.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Lifecycle status of a deployment record.
///
/// `NONE` from the lifecycle has no representation: it is the absence of an
/// active record for the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Provisioning has been accepted or is running.
    Deploying,
    /// All resources exist.
    Deployed,
    /// Teardown is running.
    Destroying,
    /// All resources were removed.
    Destroyed,
    /// Provisioning or teardown failed.
    Failed,
}

impl DeploymentStatus {
    /// Statuses that block new deploy requests for a project.
    pub const ACTIVE: [Self; 3] = [Self::Deploying, Self::Deployed, Self::Destroying];

    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        }
    }

    /// Whether a record in this status counts as the project's active deployment.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Deploying | Self::Deployed | Self::Destroying)
    }

    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }

    /// Whether a persisted record may move from this status to `next`.
    ///
    /// `Failed -> Failed` covers bookkeeping on failed records, such as
    /// clearing orphaned resources after cleanup.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Deploying, Self::Deployed | Self::Failed)
                | (Self::Deployed, Self::Destroying)
                | (Self::Destroying, Self::Destroyed | Self::Failed)
                | (Self::Failed, Self::Failed)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploying" => Ok(Self::Deploying),
            "deployed" => Ok(Self::Deployed),
            "destroying" => Ok(Self::Destroying),
            "destroyed" => Ok(Self::Destroyed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Data shared across all deployment states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentData {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Project this deployment belongs to.
    pub project_id: ProjectId,
    /// User that requested the deployment.
    pub user_id: UserId,
    /// Topology being deployed.
    pub deploy_type: DeployType,
    /// Parameters supplied with the deploy request.
    #[serde(default)]
    pub parameters: DeployParameters,
    /// Resources created by a completed deploy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_descriptor: Option<ResourceDescriptor>,
    /// Resources created before a deploy failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_resources: Option<ResourceDescriptor>,
    /// Error cause if the deployment failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Queue message that started the teardown, if one is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_message: Option<String>,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the deployment was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentData {
    /// Create data for a freshly accepted deploy request.
    #[must_use]
    pub fn new(
        project_id: ProjectId,
        user_id: UserId,
        deploy_type: DeployType,
        parameters: DeployParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            project_id,
            user_id,
            deploy_type,
            parameters,
            resource_descriptor: None,
            partial_resources: None,
            error: None,
            teardown_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A deployment record as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// The deployment data.
    #[serde(flatten)]
    pub data: DeploymentData,
    /// Current status.
    pub status: DeploymentStatus,
}

impl DeploymentRecord {
    /// Create a new record in the deploying state.
    #[must_use]
    pub const fn new(data: DeploymentData) -> Self {
        Self {
            data,
            status: DeploymentStatus::Deploying,
        }
    }

    /// Deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Resources a failed record may have left behind.
    ///
    /// A failed deploy leaves its partial resources; a failed teardown leaves
    /// the full descriptor it was trying to remove.
    #[must_use]
    pub fn orphaned_resources(&self) -> Option<&ResourceDescriptor> {
        if self.status != DeploymentStatus::Failed {
            return None;
        }
        self.data
            .partial_resources
            .as_ref()
            .filter(|r| !r.is_empty())
            .or_else(|| self.data.resource_descriptor.as_ref().filter(|r| !r.is_empty()))
    }
}
