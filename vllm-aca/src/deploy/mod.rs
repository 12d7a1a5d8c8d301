pub mod azure_cli;
pub mod controller;

pub use azure_cli::AzCli;
pub use controller::{AppStatus, DeploymentController};

use anyhow::Result;
use common::{DeploymentHandle, OpError, RegistryCredentials, ScaleSettings};
use serde::Serialize;

pub const DEFAULT_RESOURCE_GROUP: &str = "vllm-rg";
pub const DEFAULT_LOCATION: &str = "eastus";
pub const DEFAULT_ENVIRONMENT: &str = "vllm-env";
pub const DEFAULT_APP_NAME: &str = "vllm-camel-api";
pub const DEFAULT_WORKLOAD_PROFILE_NAME: &str = "gpu";
pub const DEFAULT_WORKLOAD_PROFILE_TYPE: &str = "Consumption-GPU-NC24-A100";
pub const DEFAULT_IMAGE_NAME: &str = "vllm-openai-server";
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Login server for a registry given by short name or full host.
pub fn login_server(registry: &str) -> String {
    if registry.contains('.') {
        registry.to_string()
    } else {
        format!("{}.azurecr.io", registry)
    }
}

/// Where the application lives: resource group, environment, registry and
/// the GPU workload profile it is pinned to.
#[derive(Debug, Clone, PartialEq)]
pub struct AzureTarget {
    pub resource_group: String,
    pub location: String,
    pub environment: String,
    pub app_name: String,
    pub registry: Option<String>,
    pub workload_profile_name: String,
    pub workload_profile_type: String,
    pub image_name: String,
    pub image_tag: String,
}

impl Default for AzureTarget {
    fn default() -> Self {
        Self {
            resource_group: DEFAULT_RESOURCE_GROUP.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            app_name: DEFAULT_APP_NAME.to_string(),
            registry: None,
            workload_profile_name: DEFAULT_WORKLOAD_PROFILE_NAME.to_string(),
            workload_profile_type: DEFAULT_WORKLOAD_PROFILE_TYPE.to_string(),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
        }
    }
}

impl AzureTarget {
    pub fn registry(&self) -> Result<&str, OpError> {
        self.registry
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| OpError::Config("a container registry name is required (--registry)".into()))
    }

    /// Login server of the registry, e.g. `myacr.azurecr.io`.
    pub fn registry_host(&self) -> Result<String, OpError> {
        Ok(login_server(self.registry()?))
    }

    /// `<name>:<tag>` as pushed inside the registry.
    pub fn image_repository_tag(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }

    pub fn image_ref(&self) -> Result<String, OpError> {
        Ok(format!("{}/{}", self.registry_host()?, self.image_repository_tag()))
    }

    pub fn handle(&self) -> DeploymentHandle {
        DeploymentHandle::new(&self.resource_group, &self.environment, &self.app_name)
    }
}

/// Everything a create-or-update of the managed application carries.
#[derive(Debug, Clone)]
pub struct AppSpec {
    pub name: String,
    pub resource_group: String,
    pub environment: String,
    pub image: String,
    pub credentials: RegistryCredentials,
    pub target_port: u16,
    pub workload_profile: String,
    pub scale: ScaleSettings,
    pub cpu_cores: f32,
    pub memory: String,
    pub env: Vec<(String, String)>,
}

/// What the provisioning API reports about an existing application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppState {
    pub fqdn: Option<String>,
    pub scale: ScaleSettings,
    pub provisioning_state: Option<String>,
    pub running_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaInfo {
    pub name: String,
    pub running_state: Option<String>,
    pub created: Option<String>,
}

/// The slice of the cloud provisioning API needed to run one application.
pub trait Provisioner: Send + Sync {
    fn resource_group_exists(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn create_resource_group(
        &self,
        name: &str,
        location: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn environment_exists(
        &self,
        resource_group: &str,
        environment: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Creates an environment with workload-profile support enabled.
    fn create_environment(
        &self,
        resource_group: &str,
        environment: &str,
        location: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn list_workload_profile_types(
        &self,
        location: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;

    /// Names of the profiles already attached to the environment.
    fn workload_profiles(
        &self,
        resource_group: &str,
        environment: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;

    fn add_workload_profile(
        &self,
        resource_group: &str,
        environment: &str,
        name: &str,
        profile_type: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn registry_credentials(
        &self,
        registry: &str,
    ) -> impl std::future::Future<Output = Result<RegistryCredentials>> + Send;

    fn app_exists(
        &self,
        resource_group: &str,
        app: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn create_app(&self, spec: &AppSpec)
        -> impl std::future::Future<Output = Result<AppState>> + Send;

    fn update_app(&self, spec: &AppSpec)
        -> impl std::future::Future<Output = Result<AppState>> + Send;

    fn show_app(
        &self,
        resource_group: &str,
        app: &str,
    ) -> impl std::future::Future<Output = Result<AppState>> + Send;

    /// Writes both replica bounds; callers pass the current ceiling through
    /// when only the floor changes.
    fn update_scale(
        &self,
        resource_group: &str,
        app: &str,
        scale: ScaleSettings,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn list_replicas(
        &self,
        resource_group: &str,
        app: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ReplicaInfo>>> + Send;

    fn fetch_logs(
        &self,
        resource_group: &str,
        app: &str,
        tail: u32,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}
