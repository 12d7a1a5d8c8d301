//! Container image for the inference server.
//!
//! The image bakes configuration defaults into `ENV` and starts the server
//! through a shell entrypoint so the values can be overridden per container
//! at start time.

use anyhow::{Context, Result};
use common::{DeploymentConfig, OpError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::deploy::AzureTarget;
use crate::util::process::{CommandRunner, CommandSpec};

pub const ENV_MODEL_NAME: &str = "MODEL_NAME";
pub const ENV_GPU_UTIL: &str = "VLLM_GPU_UTIL";
pub const ENV_PORT: &str = "PORT";

pub const BASE_IMAGE: &str = "vllm/vllm-openai";
pub const DEFAULT_BASE_TAG: &str = "latest";
pub const DEFAULT_CACHE_DIR: &str = "/mnt/cache";
pub const SERVER_MODULE: &str = "vllm.entrypoints.openai.api_server";

const DOCKERFILE: &str = "Dockerfile";

/// Cache variables and their location relative to the cache root.
pub const CACHE_VARS: &[(&str, &str)] = &[
    ("HF_HOME", "huggingface"),
    ("HUGGINGFACE_HUB_CACHE", "huggingface/hub"),
    ("TRANSFORMERS_CACHE", "huggingface/transformers"),
    ("VLLM_CACHE_ROOT", "vllm"),
];

#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub config: DeploymentConfig,
    pub base_tag: String,
    pub cache_dir: String,
}

impl ImageSpec {
    pub fn new(config: DeploymentConfig) -> Self {
        Self {
            config,
            base_tag: DEFAULT_BASE_TAG.to_string(),
            cache_dir: DEFAULT_CACHE_DIR.to_string(),
        }
    }
}

/// `(variable, path)` pairs for the cache variables under `cache_dir`.
pub fn cache_env(cache_dir: &str) -> Vec<(String, String)> {
    let root = cache_dir.trim_end_matches('/');
    CACHE_VARS
        .iter()
        .map(|(var, sub)| (var.to_string(), format!("{}/{}", root, sub)))
        .collect()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn render_dockerfile(spec: &ImageSpec) -> String {
    let config = &spec.config;
    let mut env = vec![
        (ENV_MODEL_NAME.to_string(), config.model.clone()),
        (ENV_GPU_UTIL.to_string(), config.gpu_memory_utilization.to_string()),
        (ENV_PORT.to_string(), config.port.to_string()),
    ];
    env.extend(cache_env(&spec.cache_dir));

    let env_lines = env
        .iter()
        .map(|(k, v)| format!("{}={}", k, quote(v)))
        .collect::<Vec<_>>()
        .join(" \\\n    ");
    let cache_dirs = cache_env(&spec.cache_dir)
        .into_iter()
        .map(|(_, path)| path)
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        r#"FROM {base}:{tag}

ENV {env_lines}

RUN mkdir -p {cache_dirs}

EXPOSE {port}

ENTRYPOINT ["/bin/sh", "-c", "exec python3 -m {module} --host 0.0.0.0 --port \"${{{port_var}}}\" --model \"${{{model_var}}}\" --gpu-memory-utilization \"${{{util_var}}}\""]
"#,
        base = BASE_IMAGE,
        tag = spec.base_tag,
        env_lines = env_lines,
        cache_dirs = cache_dirs,
        port = config.port,
        module = SERVER_MODULE,
        port_var = ENV_PORT,
        model_var = ENV_MODEL_NAME,
        util_var = ENV_GPU_UTIL,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// `docker build` on this machine, then `docker push`.
    Local,
    /// Build inside the registry with `az acr build`.
    Registry,
}

pub struct ImageBuilder<R: CommandRunner> {
    runner: R,
    context_dir: PathBuf,
}

impl<R: CommandRunner> ImageBuilder<R> {
    pub fn new(runner: R, context_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            context_dir: context_dir.into(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Writes (or overwrites) the Dockerfile in the build context.
    pub fn write_context(&self, spec: &ImageSpec) -> Result<PathBuf> {
        fs::create_dir_all(&self.context_dir).with_context(|| {
            format!("Failed to create build context {:?}", self.context_dir)
        })?;
        let path = self.context_dir.join(DOCKERFILE);
        fs::write(&path, render_dockerfile(spec))
            .with_context(|| format!("Failed to write {:?}", path))?;
        info!("Wrote {:?}", path);
        Ok(path)
    }

    /// Builds and publishes the image, returning its full reference.
    pub async fn build(&self, spec: &ImageSpec, target: &AzureTarget, mode: BuildMode) -> Result<String> {
        let config = spec.config.clone().checked()?;
        let image_ref = target.image_ref()?;
        let registry = target.registry()?.to_string();
        self.write_context(&ImageSpec { config, ..spec.clone() })?;
        let context = path_arg(&self.context_dir);

        match mode {
            BuildMode::Local => {
                info!("Building {} locally", image_ref);
                self.step(
                    CommandSpec::new("docker").args(["build", "-t", image_ref.as_str(), context.as_str()]),
                )
                .await?;
                self.step(CommandSpec::new("az").args(["acr", "login", "--name", registry.as_str()]))
                    .await?;
                self.step(CommandSpec::new("docker").args(["push", image_ref.as_str()]))
                    .await?;
            }
            BuildMode::Registry => {
                info!("Building {} in registry {}", image_ref, registry);
                let repository_tag = target.image_repository_tag();
                self.step(CommandSpec::new("az").args([
                    "acr",
                    "build",
                    "--registry",
                    registry.as_str(),
                    "--image",
                    repository_tag.as_str(),
                    context.as_str(),
                ]))
                .await?;
            }
        }

        info!("Image {} published", image_ref);
        Ok(image_ref)
    }

    async fn step(&self, spec: CommandSpec) -> Result<()> {
        let code = self
            .runner
            .status(&spec)
            .await
            .map_err(|e| OpError::Build(format!("{}: {}", spec.program, e)))?;
        if code != Some(0) {
            return Err(OpError::Build(format!("`{}` exited with status {:?}", spec, code)).into());
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::process::testing::RecordingRunner;
    use crate::util::process::CommandOutput;
    use tempfile::tempdir;

    fn target() -> AzureTarget {
        AzureTarget {
            registry: Some("myacr".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_dockerfile_defaults() {
        let dockerfile = render_dockerfile(&ImageSpec::new(DeploymentConfig::default()));
        assert!(dockerfile.starts_with("FROM vllm/vllm-openai:latest\n"));
        assert!(dockerfile.contains(r#"MODEL_NAME="LangAGI-Lab/camel""#));
        assert!(dockerfile.contains(r#"VLLM_GPU_UTIL="0.8""#));
        assert!(dockerfile.contains(r#"PORT="8000""#));
        assert!(dockerfile.contains(r#"HUGGINGFACE_HUB_CACHE="/mnt/cache/huggingface/hub""#));
        assert!(dockerfile.contains("EXPOSE 8000"));
        assert!(dockerfile.contains(
            r#"--host 0.0.0.0 --port \"${PORT}\" --model \"${MODEL_NAME}\" --gpu-memory-utilization \"${VLLM_GPU_UTIL}\""#
        ));
    }

    #[test]
    fn test_dockerfile_quotes_values() {
        let spec = ImageSpec {
            config: DeploymentConfig {
                model: r#"org/we"ird"#.to_string(),
                ..Default::default()
            },
            base_tag: "v0.6.3".to_string(),
            cache_dir: "/data/".to_string(),
        };
        let dockerfile = render_dockerfile(&spec);
        assert!(dockerfile.starts_with("FROM vllm/vllm-openai:v0.6.3"));
        assert!(dockerfile.contains(r#"MODEL_NAME="org/we\"ird""#));
        assert!(dockerfile.contains(r#"VLLM_CACHE_ROOT="/data/vllm""#));
    }

    #[test]
    fn test_write_context_overwrites() -> Result<()> {
        let dir = tempdir()?;
        let builder = ImageBuilder::new(RecordingRunner::succeeding(), dir.path().join("ctx"));
        fs::create_dir_all(dir.path().join("ctx"))?;
        fs::write(dir.path().join("ctx/Dockerfile"), "stale")?;

        let path = builder.write_context(&ImageSpec::new(DeploymentConfig::default()))?;
        let written = fs::read_to_string(path)?;
        assert!(written.starts_with("FROM "));
        Ok(())
    }

    #[tokio::test]
    async fn test_local_build_pushes_after_build() {
        let dir = tempdir().unwrap();
        let builder = ImageBuilder::new(RecordingRunner::succeeding(), dir.path());
        let image = builder
            .build(&ImageSpec::new(DeploymentConfig::default()), &target(), BuildMode::Local)
            .await
            .unwrap();
        assert_eq!(image, "myacr.azurecr.io/vllm-openai-server:latest");

        let lines = builder.runner().lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("docker build -t myacr.azurecr.io/vllm-openai-server:latest"));
        assert_eq!(lines[1], "az acr login --name myacr");
        assert_eq!(lines[2], "docker push myacr.azurecr.io/vllm-openai-server:latest");
    }

    #[tokio::test]
    async fn test_registry_build() {
        let dir = tempdir().unwrap();
        let builder = ImageBuilder::new(RecordingRunner::succeeding(), dir.path());
        builder
            .build(&ImageSpec::new(DeploymentConfig::default()), &target(), BuildMode::Registry)
            .await
            .unwrap();
        let lines = builder.runner().lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("az acr build --registry myacr --image vllm-openai-server:latest"));
    }

    #[tokio::test]
    async fn test_failed_build_does_not_push() {
        let dir = tempdir().unwrap();
        let runner = RecordingRunner::new(|spec| {
            if spec.args.first().map(String::as_str) == Some("build") {
                CommandOutput::failed(1, "")
            } else {
                CommandOutput::ok("")
            }
        });
        let builder = ImageBuilder::new(runner, dir.path());
        let err = builder
            .build(&ImageSpec::new(DeploymentConfig::default()), &target(), BuildMode::Local)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<OpError>(), Some(OpError::Build(_))));
        assert_eq!(builder.runner().calls().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_never_builds() {
        let dir = tempdir().unwrap();
        let builder = ImageBuilder::new(RecordingRunner::succeeding(), dir.path());
        let spec = ImageSpec::new(DeploymentConfig {
            gpu_memory_utilization: 0.0,
            ..Default::default()
        });
        let err = builder.build(&spec, &target(), BuildMode::Local).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<OpError>(), Some(OpError::Config(_))));
        assert!(builder.runner().calls().is_empty());
    }
}
