use anyhow::Result;
use common::{DeploymentConfig, DeploymentHandle, OpError, ScaleSettings};
use serde::Serialize;
use tracing::{info, warn};

use super::{AppSpec, AppState, AzureTarget, Provisioner, ReplicaInfo};
use crate::image::{ENV_GPU_UTIL, ENV_MODEL_NAME, ENV_PORT};

/// Point-in-time view of the deployed application.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub handle: DeploymentHandle,
    pub scale: ScaleSettings,
    pub provisioning_state: Option<String>,
    pub running_status: Option<String>,
    pub replicas: Vec<ReplicaInfo>,
}

/// Drives one managed application through the provisioning API. Each
/// operation is a straight sequence of calls; a failing call ends it.
pub struct DeploymentController<P: Provisioner> {
    provisioner: P,
    target: AzureTarget,
}

impl<P: Provisioner> DeploymentController<P> {
    pub fn new(provisioner: P, target: AzureTarget) -> Self {
        Self { provisioner, target }
    }

    pub fn target(&self) -> &AzureTarget {
        &self.target
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Ensures resource group, environment and GPU workload profile exist.
    pub async fn provision(&self) -> Result<DeploymentHandle> {
        let t = &self.target;

        if self.provisioner.resource_group_exists(&t.resource_group).await? {
            info!("Resource group {} already exists", t.resource_group);
        } else {
            self.provisioner
                .create_resource_group(&t.resource_group, &t.location)
                .await?;
        }

        if self
            .provisioner
            .environment_exists(&t.resource_group, &t.environment)
            .await?
        {
            info!("Environment {} already exists", t.environment);
        } else {
            self.provisioner
                .create_environment(&t.resource_group, &t.environment, &t.location)
                .await?;
        }

        let attached = self
            .provisioner
            .workload_profiles(&t.resource_group, &t.environment)
            .await?;
        if attached.iter().any(|p| p == &t.workload_profile_name) {
            info!("Workload profile {} already attached", t.workload_profile_name);
        } else {
            let supported = self
                .provisioner
                .list_workload_profile_types(&t.location)
                .await?;
            if !supported.iter().any(|s| s == &t.workload_profile_type) {
                return Err(OpError::Provision(format!(
                    "workload profile type {} is not offered in {} (available: {})",
                    t.workload_profile_type,
                    t.location,
                    supported.join(", ")
                ))
                .into());
            }
            self.provisioner
                .add_workload_profile(
                    &t.resource_group,
                    &t.environment,
                    &t.workload_profile_name,
                    &t.workload_profile_type,
                )
                .await?;
        }

        Ok(t.handle())
    }

    /// Creates the application, or updates it in place when it exists.
    pub async fn deploy(&self, config: &DeploymentConfig) -> Result<DeploymentHandle> {
        let config = config.clone().checked()?;
        let t = &self.target;
        let image = t.image_ref()?;
        let registry = t.registry()?;

        let credentials = self.provisioner.registry_credentials(registry).await?;
        let spec = AppSpec {
            name: t.app_name.clone(),
            resource_group: t.resource_group.clone(),
            environment: t.environment.clone(),
            image,
            credentials,
            target_port: config.port,
            workload_profile: t.workload_profile_name.clone(),
            scale: ScaleSettings {
                min_replicas: config.replica_min,
                max_replicas: config.replica_max,
            },
            cpu_cores: config.cpu_cores,
            memory: config.memory_quantity(),
            env: vec![
                (ENV_MODEL_NAME.to_string(), config.model.clone()),
                (ENV_GPU_UTIL.to_string(), config.gpu_memory_utilization.to_string()),
                (ENV_PORT.to_string(), config.port.to_string()),
            ],
        };

        let state = if self.provisioner.app_exists(&t.resource_group, &t.app_name).await? {
            self.provisioner.update_app(&spec).await?
        } else {
            self.provisioner.create_app(&spec).await?
        };

        let handle = self.handle_from(state);
        match &handle.fqdn {
            Some(fqdn) => info!("Application {} available at https://{}", t.app_name, fqdn),
            None => warn!("Application {} has no ingress FQDN yet", t.app_name),
        }
        Ok(handle)
    }

    /// Sets the replica floor to 1.
    pub async fn scale_up(&self) -> Result<ScaleSettings> {
        self.set_floor(1).await
    }

    /// Sets the replica floor to 0 so the app can idle at no GPU cost.
    pub async fn scale_down(&self) -> Result<ScaleSettings> {
        self.set_floor(0).await
    }

    async fn set_floor(&self, floor: u32) -> Result<ScaleSettings> {
        let t = &self.target;
        let current = self.provisioner.show_app(&t.resource_group, &t.app_name).await?.scale;
        if current.min_replicas == floor {
            info!("Replica floor of {} is already {}", t.app_name, floor);
            return Ok(current);
        }
        let next = current.with_floor(floor);
        info!(
            "Scaling {}: min replicas {} -> {}, max {}",
            t.app_name, current.min_replicas, next.min_replicas, next.max_replicas
        );
        self.provisioner
            .update_scale(&t.resource_group, &t.app_name, next)
            .await?;
        Ok(next)
    }

    pub async fn status(&self) -> Result<AppStatus> {
        let t = &self.target;
        let state = self.provisioner.show_app(&t.resource_group, &t.app_name).await?;
        let replicas = self
            .provisioner
            .list_replicas(&t.resource_group, &t.app_name)
            .await?;
        Ok(AppStatus {
            scale: state.scale,
            provisioning_state: state.provisioning_state.clone(),
            running_status: state.running_status.clone(),
            handle: self.handle_from(state),
            replicas,
        })
    }

    pub async fn logs(&self, tail: u32) -> Result<String> {
        let t = &self.target;
        self.provisioner
            .fetch_logs(&t.resource_group, &t.app_name, tail)
            .await
    }

    /// Handle with the public FQDN resolved from the live application.
    pub async fn handle(&self) -> Result<DeploymentHandle> {
        let t = &self.target;
        let state = self.provisioner.show_app(&t.resource_group, &t.app_name).await?;
        Ok(self.handle_from(state))
    }

    fn handle_from(&self, state: AppState) -> DeploymentHandle {
        let mut handle = self.target.handle();
        handle.fqdn = state.fqdn;
        handle
    }
}
