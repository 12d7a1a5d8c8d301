//! [`Provisioner`] backed by the `az` command line.
//!
//! Every call is a single `az` invocation with JSON output. A nonzero exit is
//! surfaced as a provisioning error carrying az's own stderr; nothing is
//! retried.

use anyhow::{anyhow, Context, Result};
use common::{OpError, RegistryCredentials, ScaleSettings};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use super::{login_server, AppSpec, AppState, Provisioner, ReplicaInfo};
use crate::util::process::{CommandOutput, CommandRunner, CommandSpec};

const AZ: &str = "az";

pub struct AzCli<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> AzCli<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    async fn exec(&self, args: Vec<String>) -> Result<CommandOutput> {
        let spec = CommandSpec::new(AZ).args(args);
        debug!("{}", spec);
        self.runner.output(&spec).await
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        let output = self.exec(args).await?;
        if !output.success() {
            return Err(provision_error(&output).into());
        }
        Ok(output.stdout)
    }

    async fn run_json<T: DeserializeOwned>(&self, mut args: Vec<String>) -> Result<T> {
        args.extend(["-o".to_string(), "json".to_string()]);
        let stdout = self.run(args).await?;
        serde_json::from_str(&stdout).with_context(|| "Failed to parse az output")
    }

    /// `Ok(None)` when az reports the resource as missing.
    async fn run_json_optional<T: DeserializeOwned>(&self, mut args: Vec<String>) -> Result<Option<T>> {
        args.extend(["-o".to_string(), "json".to_string()]);
        let output = self.exec(args).await?;
        if !output.success() {
            if is_not_found(&output.stderr) {
                return Ok(None);
            }
            return Err(provision_error(&output).into());
        }
        let value = serde_json::from_str(&output.stdout).with_context(|| "Failed to parse az output")?;
        Ok(Some(value))
    }
}

fn provision_error(output: &CommandOutput) -> OpError {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        OpError::Provision(format!("az exited with status {:?}", output.code))
    } else {
        OpError::Provision(stderr.to_string())
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("ResourceNotFound")
        || stderr.contains("ResourceGroupNotFound")
        || stderr.contains("could not be found")
        || stderr.contains("was not found")
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize)]
struct AcrCredentials {
    username: String,
    passwords: Vec<AcrPassword>,
}

#[derive(Debug, Deserialize)]
struct AcrPassword {
    value: String,
}

#[derive(Debug, Deserialize)]
struct NamedResource {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerApp {
    #[serde(default)]
    properties: ContainerAppProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerAppProperties {
    provisioning_state: Option<String>,
    running_status: Option<String>,
    configuration: Option<Configuration>,
    template: Option<Template>,
}

#[derive(Debug, Deserialize)]
struct Configuration {
    ingress: Option<Ingress>,
}

#[derive(Debug, Deserialize)]
struct Ingress {
    fqdn: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Template {
    scale: Option<Scale>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Scale {
    min_replicas: Option<u32>,
    max_replicas: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Replica {
    name: String,
    #[serde(default)]
    properties: ReplicaProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicaProperties {
    running_state: Option<String>,
    created_time: Option<String>,
}

impl From<ContainerApp> for AppState {
    fn from(app: ContainerApp) -> Self {
        let props = app.properties;
        let scale = props.template.and_then(|t| t.scale);
        AppState {
            fqdn: props
                .configuration
                .and_then(|c| c.ingress)
                .and_then(|i| i.fqdn),
            scale: ScaleSettings {
                min_replicas: scale.as_ref().and_then(|s| s.min_replicas).unwrap_or(0),
                // The platform default ceiling when none was ever set.
                max_replicas: scale.as_ref().and_then(|s| s.max_replicas).unwrap_or(10),
            },
            provisioning_state: props.provisioning_state,
            running_status: props.running_status,
        }
    }
}

fn env_pairs(env: &[(String, String)]) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

impl<R: CommandRunner> Provisioner for AzCli<R> {
    fn resource_group_exists(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send {
        async move {
            let stdout = self.run(args(["group", "exists", "--name", name])).await?;
            match stdout.trim() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(anyhow!("Unexpected output from az group exists: {}", other)),
            }
        }
    }

    fn create_resource_group(
        &self,
        name: &str,
        location: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            info!("Creating resource group {} in {}", name, location);
            let _: serde_json::Value = self
                .run_json(args(["group", "create", "--name", name, "--location", location]))
                .await?;
            Ok(())
        }
    }

    fn environment_exists(
        &self,
        resource_group: &str,
        environment: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send {
        async move {
            let env: Option<serde_json::Value> = self
                .run_json_optional(args([
                    "containerapp", "env", "show",
                    "--name", environment,
                    "--resource-group", resource_group,
                ]))
                .await?;
            Ok(env.is_some())
        }
    }

    fn create_environment(
        &self,
        resource_group: &str,
        environment: &str,
        location: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            info!("Creating container apps environment {}", environment);
            let _: serde_json::Value = self
                .run_json(args([
                    "containerapp", "env", "create",
                    "--name", environment,
                    "--resource-group", resource_group,
                    "--location", location,
                    "--enable-workload-profiles",
                ]))
                .await?;
            Ok(())
        }
    }

    fn list_workload_profile_types(
        &self,
        location: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send {
        async move {
            let types: Vec<NamedResource> = self
                .run_json(args([
                    "containerapp", "env", "workload-profile", "list-supported",
                    "--location", location,
                ]))
                .await?;
            Ok(types.into_iter().map(|t| t.name).collect())
        }
    }

    fn workload_profiles(
        &self,
        resource_group: &str,
        environment: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send {
        async move {
            let profiles: Vec<NamedResource> = self
                .run_json(args([
                    "containerapp", "env", "workload-profile", "list",
                    "--name", environment,
                    "--resource-group", resource_group,
                ]))
                .await?;
            Ok(profiles.into_iter().map(|p| p.name).collect())
        }
    }

    fn add_workload_profile(
        &self,
        resource_group: &str,
        environment: &str,
        name: &str,
        profile_type: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            info!("Adding workload profile {} ({})", name, profile_type);
            self.run(args([
                "containerapp", "env", "workload-profile", "add",
                "--name", environment,
                "--resource-group", resource_group,
                "--workload-profile-name", name,
                "--workload-profile-type", profile_type,
            ]))
            .await?;
            Ok(())
        }
    }

    fn registry_credentials(
        &self,
        registry: &str,
    ) -> impl std::future::Future<Output = Result<RegistryCredentials>> + Send {
        async move {
            let creds: AcrCredentials = self
                .run_json(args(["acr", "credential", "show", "--name", registry]))
                .await?;
            let password = creds
                .passwords
                .into_iter()
                .next()
                .map(|p| p.value)
                .ok_or_else(|| {
                    OpError::Provision(format!("registry {} returned no passwords; is the admin user enabled?", registry))
                })?;
            Ok(RegistryCredentials {
                registry_host: login_server(registry),
                username: creds.username,
                password,
            })
        }
    }

    fn app_exists(
        &self,
        resource_group: &str,
        app: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send {
        async move {
            let found: Option<serde_json::Value> = self
                .run_json_optional(args([
                    "containerapp", "show",
                    "--name", app,
                    "--resource-group", resource_group,
                ]))
                .await?;
            Ok(found.is_some())
        }
    }

    fn create_app(
        &self,
        spec: &AppSpec,
    ) -> impl std::future::Future<Output = Result<AppState>> + Send {
        async move {
            info!("Creating container app {} from {}", spec.name, spec.image);
            let mut cmd = args([
                "containerapp", "create",
                "--name", &spec.name,
                "--resource-group", &spec.resource_group,
                "--environment", &spec.environment,
                "--image", &spec.image,
                "--registry-server", &spec.credentials.registry_host,
                "--registry-username", &spec.credentials.username,
                "--registry-password", &spec.credentials.password,
                "--ingress", "external",
                "--target-port", &spec.target_port.to_string(),
                "--workload-profile-name", &spec.workload_profile,
                "--min-replicas", &spec.scale.min_replicas.to_string(),
                "--max-replicas", &spec.scale.max_replicas.to_string(),
                "--cpu", &spec.cpu_cores.to_string(),
                "--memory", &spec.memory,
            ]);
            if !spec.env.is_empty() {
                cmd.push("--env-vars".to_string());
                cmd.extend(env_pairs(&spec.env));
            }
            let app: ContainerApp = self.run_json(cmd).await?;
            Ok(app.into())
        }
    }

    fn update_app(
        &self,
        spec: &AppSpec,
    ) -> impl std::future::Future<Output = Result<AppState>> + Send {
        async move {
            info!("Updating container app {} to {}", spec.name, spec.image);
            self.run(args([
                "containerapp", "registry", "set",
                "--name", &spec.name,
                "--resource-group", &spec.resource_group,
                "--server", &spec.credentials.registry_host,
                "--username", &spec.credentials.username,
                "--password", &spec.credentials.password,
            ]))
            .await?;

            let mut cmd = args([
                "containerapp", "update",
                "--name", &spec.name,
                "--resource-group", &spec.resource_group,
                "--image", &spec.image,
                "--workload-profile-name", &spec.workload_profile,
                "--min-replicas", &spec.scale.min_replicas.to_string(),
                "--max-replicas", &spec.scale.max_replicas.to_string(),
                "--cpu", &spec.cpu_cores.to_string(),
                "--memory", &spec.memory,
            ]);
            if !spec.env.is_empty() {
                cmd.push("--set-env-vars".to_string());
                cmd.extend(env_pairs(&spec.env));
            }
            let _: serde_json::Value = self.run_json(cmd).await?;

            let _: serde_json::Value = self
                .run_json(args([
                    "containerapp", "ingress", "enable",
                    "--name", &spec.name,
                    "--resource-group", &spec.resource_group,
                    "--type", "external",
                    "--target-port", &spec.target_port.to_string(),
                ]))
                .await?;

            self.show_app(&spec.resource_group, &spec.name).await
        }
    }

    fn show_app(
        &self,
        resource_group: &str,
        app: &str,
    ) -> impl std::future::Future<Output = Result<AppState>> + Send {
        async move {
            let app: ContainerApp = self
                .run_json(args([
                    "containerapp", "show",
                    "--name", app,
                    "--resource-group", resource_group,
                ]))
                .await?;
            Ok(app.into())
        }
    }

    fn update_scale(
        &self,
        resource_group: &str,
        app: &str,
        scale: ScaleSettings,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            let _: serde_json::Value = self
                .run_json(args([
                    "containerapp", "update",
                    "--name", app,
                    "--resource-group", resource_group,
                    "--min-replicas", &scale.min_replicas.to_string(),
                    "--max-replicas", &scale.max_replicas.to_string(),
                ]))
                .await?;
            Ok(())
        }
    }

    fn list_replicas(
        &self,
        resource_group: &str,
        app: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ReplicaInfo>>> + Send {
        async move {
            let replicas: Vec<Replica> = self
                .run_json(args([
                    "containerapp", "replica", "list",
                    "--name", app,
                    "--resource-group", resource_group,
                ]))
                .await?;
            Ok(replicas
                .into_iter()
                .map(|r| ReplicaInfo {
                    name: r.name,
                    running_state: r.properties.running_state,
                    created: r.properties.created_time,
                })
                .collect())
        }
    }

    fn fetch_logs(
        &self,
        resource_group: &str,
        app: &str,
        tail: u32,
    ) -> impl std::future::Future<Output = Result<String>> + Send {
        async move {
            self.run(args([
                "containerapp", "logs", "show",
                "--name", app,
                "--resource-group", resource_group,
                "--type", "console",
                "--format", "text",
                "--tail", &tail.to_string(),
            ]))
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::process::testing::RecordingRunner;

    const APP_JSON: &str = r#"{
        "name": "vllm-camel-api",
        "properties": {
            "provisioningState": "Succeeded",
            "runningStatus": "Running",
            "configuration": {"ingress": {"fqdn": "vllm-camel-api.politestone.eastus.azurecontainerapps.io", "targetPort": 8000}},
            "template": {"scale": {"minReplicas": 0, "maxReplicas": 3}}
        }
    }"#;

    fn app_spec() -> AppSpec {
        AppSpec {
            name: "vllm-camel-api".to_string(),
            resource_group: "vllm-rg".to_string(),
            environment: "vllm-env".to_string(),
            image: "myacr.azurecr.io/vllm-openai-server:latest".to_string(),
            credentials: RegistryCredentials {
                registry_host: "myacr.azurecr.io".to_string(),
                username: "myacr".to_string(),
                password: "pw".to_string(),
            },
            target_port: 8000,
            workload_profile: "gpu".to_string(),
            scale: ScaleSettings { min_replicas: 0, max_replicas: 3 },
            cpu_cores: 24.0,
            memory: "220Gi".to_string(),
            env: vec![("MODEL_NAME".to_string(), "LangAGI-Lab/camel".to_string())],
        }
    }

    #[tokio::test]
    async fn test_group_exists_parses_boolean() {
        let az = AzCli::with_runner(RecordingRunner::new(|_| CommandOutput::ok("false\n")));
        assert!(!az.resource_group_exists("vllm-rg").await.unwrap());
        assert_eq!(az.runner().lines(), vec!["az group exists --name vllm-rg"]);
    }

    #[tokio::test]
    async fn test_missing_environment_is_not_an_error() {
        let az = AzCli::with_runner(RecordingRunner::new(|_| {
            CommandOutput::failed(3, "(ResourceNotFound) The Resource 'vllm-env' was not found.")
        }));
        assert!(!az.environment_exists("vllm-rg", "vllm-env").await.unwrap());
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces_raw_stderr() {
        let az = AzCli::with_runner(RecordingRunner::new(|_| {
            CommandOutput::failed(1, "ERROR: Please run 'az login' to setup account.\n")
        }));
        let err = az.environment_exists("vllm-rg", "vllm-env").await.unwrap_err();
        match err.downcast_ref::<OpError>() {
            Some(OpError::Provision(msg)) => assert!(msg.contains("az login")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registry_credentials() {
        let az = AzCli::with_runner(RecordingRunner::new(|_| {
            CommandOutput::ok(r#"{"username":"myacr","passwords":[{"name":"password","value":"abc"},{"name":"password2","value":"def"}]}"#)
        }));
        let creds = az.registry_credentials("myacr").await.unwrap();
        assert_eq!(creds.registry_host, "myacr.azurecr.io");
        assert_eq!(creds.username, "myacr");
        assert_eq!(creds.password, "abc");
    }

    #[tokio::test]
    async fn test_create_app_arguments() {
        let az = AzCli::with_runner(RecordingRunner::new(|_| CommandOutput::ok(APP_JSON)));
        let state = az.create_app(&app_spec()).await.unwrap();
        assert_eq!(
            state.fqdn.as_deref(),
            Some("vllm-camel-api.politestone.eastus.azurecontainerapps.io")
        );

        let calls = az.runner().calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.flag_value("--ingress"), Some("external"));
        assert_eq!(call.flag_value("--target-port"), Some("8000"));
        assert_eq!(call.flag_value("--workload-profile-name"), Some("gpu"));
        assert_eq!(call.flag_value("--min-replicas"), Some("0"));
        assert_eq!(call.flag_value("--max-replicas"), Some("3"));
        assert_eq!(call.flag_value("--memory"), Some("220Gi"));
        assert_eq!(call.flag_value("--env-vars"), Some("MODEL_NAME=LangAGI-Lab/camel"));
        assert!(!call.to_string().contains(" pw"));
    }

    #[tokio::test]
    async fn test_update_app_sets_registry_then_updates_then_ingress() {
        let az = AzCli::with_runner(RecordingRunner::new(|_| CommandOutput::ok(APP_JSON)));
        let state = az.update_app(&app_spec()).await.unwrap();
        assert_eq!(state.scale, ScaleSettings { min_replicas: 0, max_replicas: 3 });

        let lines = az.runner().lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("az containerapp registry set"));
        assert!(lines[1].starts_with("az containerapp update"));
        assert!(lines[2].starts_with("az containerapp ingress enable"));
        assert!(lines[3].starts_with("az containerapp show"));
    }

    #[tokio::test]
    async fn test_show_app_defaults_missing_scale() {
        let az = AzCli::with_runner(RecordingRunner::new(|_| {
            CommandOutput::ok(r#"{"properties": {"provisioningState": "InProgress"}}"#)
        }));
        let state = az.show_app("vllm-rg", "vllm-camel-api").await.unwrap();
        assert_eq!(state.fqdn, None);
        assert_eq!(state.scale.min_replicas, 0);
        assert_eq!(state.provisioning_state.as_deref(), Some("InProgress"));
    }

    #[tokio::test]
    async fn test_list_replicas() {
        let az = AzCli::with_runner(RecordingRunner::new(|_| {
            CommandOutput::ok(r#"[{"name":"vllm-camel-api--abc-1","properties":{"runningState":"Running","createdTime":"2026-10-19T10:00:00Z"}}]"#)
        }));
        let replicas = az.list_replicas("vllm-rg", "vllm-camel-api").await.unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].running_state.as_deref(), Some("Running"));
    }

    #[tokio::test]
    async fn test_list_supported_profiles() {
        let az = AzCli::with_runner(RecordingRunner::new(|_| {
            CommandOutput::ok(r#"[{"name":"Consumption","properties":{}},{"name":"Consumption-GPU-NC24-A100","properties":{"gpus":1}}]"#)
        }));
        let types = az.list_workload_profile_types("eastus").await.unwrap();
        assert_eq!(types, vec!["Consumption", "Consumption-GPU-NC24-A100"]);
    }
}
