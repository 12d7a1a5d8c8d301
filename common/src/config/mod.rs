use serde::{Deserialize, Serialize};
use std::fmt;
use validator::{Validate, ValidationError};

use crate::error::OpError;

pub const DEFAULT_MODEL: &str = "LangAGI-Lab/camel";
pub const DEFAULT_GPU_UTIL: f32 = 0.80;
pub const DEFAULT_PORT: u16 = 8000;

/// Everything needed to run one instance of the inference server, locally or
/// as a managed application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_replica_bounds"))]
pub struct DeploymentConfig {
    #[validate(length(min = 1))]
    pub model: String,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub gpu_memory_utilization: f32,
    #[validate(range(min = 1))]
    pub port: u16,
    pub cuda_device: Option<u32>,
    pub replica_min: u32,
    pub replica_max: u32,
    #[validate(range(exclusive_min = 0.0))]
    pub cpu_cores: f32,
    #[validate(range(exclusive_min = 0.0))]
    pub memory_gib: f32,
}

fn validate_replica_bounds(config: &DeploymentConfig) -> Result<(), ValidationError> {
    if config.replica_max < config.replica_min {
        return Err(ValidationError::new("replica_bounds").with_message(
            format!(
                "replica_max ({}) must be >= replica_min ({})",
                config.replica_max, config.replica_min
            )
            .into(),
        ));
    }
    Ok(())
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            gpu_memory_utilization: DEFAULT_GPU_UTIL,
            port: DEFAULT_PORT,
            cuda_device: None,
            replica_min: 0,
            replica_max: 1,
            cpu_cores: 4.0,
            memory_gib: 16.0,
        }
    }
}

impl DeploymentConfig {
    /// Runs every field and cross-field rule, folding failures into a
    /// configuration error.
    pub fn checked(self) -> Result<Self, OpError> {
        self.validate()
            .map_err(|e| OpError::Config(e.to_string()))?;
        Ok(self)
    }

    /// Device index exposed to the server process. Device 0 when unset.
    pub fn visible_device(&self) -> u32 {
        self.cuda_device.unwrap_or(0)
    }

    /// Memory sizing in the form the provisioning API expects, e.g. `16Gi`.
    pub fn memory_quantity(&self) -> String {
        format!("{}Gi", self.memory_gib)
    }
}

/// Pull credentials for the container registry. Fetched per deployment and
/// only ever held in memory.
#[derive(Clone, PartialEq, Deserialize)]
pub struct RegistryCredentials {
    pub registry_host: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("registry_host", &self.registry_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub resource_group: String,
    pub environment_name: String,
    pub application_name: String,
    /// Set once the application exists and has public ingress.
    pub fqdn: Option<String>,
}

impl DeploymentHandle {
    pub fn new(resource_group: &str, environment_name: &str, application_name: &str) -> Self {
        Self {
            resource_group: resource_group.to_string(),
            environment_name: environment_name.to_string(),
            application_name: application_name.to_string(),
            fqdn: None,
        }
    }

    pub fn endpoint(&self) -> Result<String, OpError> {
        match self.fqdn.as_deref() {
            Some(fqdn) if !fqdn.is_empty() => Ok(format!("https://{}", fqdn)),
            _ => Err(OpError::Provision(format!(
                "application {} has no public endpoint yet",
                self.application_name
            ))),
        }
    }
}

/// The replica window of the managed application. `min_replicas` is the
/// desired replica floor, the only field operators move directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSettings {
    pub min_replicas: u32,
    pub max_replicas: u32,
}

impl ScaleSettings {
    pub fn with_floor(self, min_replicas: u32) -> Self {
        Self {
            min_replicas,
            max_replicas: self.max_replicas.max(min_replicas),
        }
    }
}
