use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use common::DeploymentConfig;
use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::AzureTarget;
use crate::image::ImageSpec;
use crate::util::config::Config;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Build, deploy, scale and smoke-test a vLLM OpenAI-compatible server",
    long_about = None
)]
pub struct Args {
    /// TOML file with deployment defaults (default: ~/.vllm-aca/config.toml)
    #[arg(short('f'), long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Inference server settings. The environment variables are the ones the
/// container entrypoint reads, so the same binary works inside the image.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Model identifier to serve
    #[arg(long, env = "MODEL_NAME")]
    pub model: Option<String>,

    /// Fraction of GPU memory the server may use, in (0, 1]
    #[arg(long = "gpu-util", env = "VLLM_GPU_UTIL")]
    pub gpu_util: Option<f32>,

    /// Port the server listens on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ResourceArgs {
    /// Replica floor
    #[arg(long)]
    pub min_replicas: Option<u32>,

    /// Replica ceiling
    #[arg(long)]
    pub max_replicas: Option<u32>,

    /// CPU cores per replica
    #[arg(long)]
    pub cpu: Option<f32>,

    /// Memory per replica, in GiB
    #[arg(long = "memory-gib")]
    pub memory: Option<f32>,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct AzureArgs {
    #[arg(long, env = "AZ_RESOURCE_GROUP")]
    pub resource_group: Option<String>,

    #[arg(long, env = "AZ_LOCATION")]
    pub location: Option<String>,

    /// Container apps environment name
    #[arg(long)]
    pub environment: Option<String>,

    /// Container app name
    #[arg(long)]
    pub app_name: Option<String>,

    /// Container registry name or login server
    #[arg(long, env = "ACR_NAME")]
    pub registry: Option<String>,

    #[arg(long)]
    pub workload_profile_name: Option<String>,

    #[arg(long)]
    pub workload_profile_type: Option<String>,

    #[arg(long)]
    pub image_name: Option<String>,

    #[arg(long)]
    pub image_tag: Option<String>,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ImageArgs {
    /// Tag of the vllm/vllm-openai base image
    #[arg(long)]
    pub base_tag: Option<String>,

    /// Mountable directory for model and compilation caches
    #[arg(long)]
    pub cache_dir: Option<String>,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct EndpointArgs {
    /// Base URL of the server; resolved from the deployed app when omitted
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Per-request timeout; the HTTP client default applies when omitted
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

impl EndpointArgs {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print the server image's Dockerfile, or write it with --output
    Dockerfile {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        image: ImageArgs,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build the server image and push it to the registry
    Build {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        image: ImageArgs,
        #[command(flatten)]
        azure: AzureArgs,
        /// Build context directory; the Dockerfile is written here
        #[arg(long, default_value = ".")]
        context: PathBuf,
        /// Build inside the registry instead of with the local docker daemon
        #[arg(long)]
        remote: bool,
    },

    /// Ensure resource group, environment and GPU workload profile exist
    Provision {
        #[command(flatten)]
        azure: AzureArgs,
    },

    /// Create or update the container app from the pushed image
    Deploy {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        resources: ResourceArgs,
        #[command(flatten)]
        azure: AzureArgs,
    },

    /// Build, provision, deploy and verify in one go
    Up {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        resources: ResourceArgs,
        #[command(flatten)]
        image: ImageArgs,
        #[command(flatten)]
        azure: AzureArgs,
        #[arg(long, default_value = ".")]
        context: PathBuf,
        #[arg(long)]
        remote: bool,
        #[arg(long)]
        skip_verify: bool,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Move the replica floor (up: 1, down: 0)
    Scale {
        #[arg(value_enum)]
        action: ScaleAction,
        #[command(flatten)]
        azure: AzureArgs,
    },

    /// Show replica bounds, running replicas and the public endpoint
    Status {
        #[command(flatten)]
        azure: AzureArgs,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print recent console logs of the app
    Logs {
        #[command(flatten)]
        azure: AzureArgs,
        #[arg(long, default_value_t = 100)]
        tail: u32,
    },

    /// Smoke-test the models and chat-completions routes
    Verify {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        azure: AzureArgs,
        #[command(flatten)]
        endpoint: EndpointArgs,
    },

    /// Send one chat message to the deployed server
    Chat {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        azure: AzureArgs,
        #[command(flatten)]
        endpoint: EndpointArgs,
        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long, default_value_t = 256)]
        max_tokens: u32,
        message: String,
    },

    /// Run the server on this machine
    Launch {
        #[command(flatten)]
        server: ServerArgs,
        /// GPU device index made visible to the server
        #[arg(long)]
        gpu: Option<u32>,
        #[arg(long)]
        cache_dir: Option<String>,
        /// Print the command instead of running it
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    /// Keep one replica warm
    Up,
    /// Allow scaling to zero
    Down,
}

impl Args {
    pub fn load_config(&self) -> Result<Config> {
        Config::load(self.config.as_deref())
    }
}

/// Layers defaults, the config file and flags (in that order) into a
/// validated configuration.
pub fn resolve_deployment(
    file: &Config,
    server: &ServerArgs,
    resources: Option<&ResourceArgs>,
    gpu: Option<u32>,
) -> Result<DeploymentConfig> {
    let d = &file.deployment;
    let mut config = DeploymentConfig::default();

    if let Some(model) = server.model.clone().or_else(|| d.model.clone()) {
        config.model = model;
    }
    if let Some(util) = server.gpu_util.or(d.gpu_util) {
        config.gpu_memory_utilization = util;
    }
    if let Some(port) = server.port.or(d.port) {
        config.port = port;
    }
    config.cuda_device = gpu.or(d.cuda_device);

    let resources = resources.cloned().unwrap_or_default();
    if let Some(min) = resources.min_replicas.or(d.min_replicas) {
        config.replica_min = min;
    }
    if let Some(max) = resources.max_replicas.or(d.max_replicas) {
        config.replica_max = max;
    }
    if let Some(cpu) = resources.cpu.or(d.cpu) {
        config.cpu_cores = cpu;
    }
    if let Some(memory) = resources.memory.or(d.memory) {
        config.memory_gib = memory;
    }

    Ok(config.checked()?)
}

impl AzureArgs {
    pub fn resolve(&self, file: &Config) -> AzureTarget {
        let a = &file.azure;
        let i = &file.image;
        let defaults = AzureTarget::default();
        let pick = |flag: &Option<String>, from_file: &Option<String>, default: String| {
            flag.clone().or_else(|| from_file.clone()).unwrap_or(default)
        };

        AzureTarget {
            resource_group: pick(&self.resource_group, &a.resource_group, defaults.resource_group),
            location: pick(&self.location, &a.location, defaults.location),
            environment: pick(&self.environment, &a.environment, defaults.environment),
            app_name: pick(&self.app_name, &a.app_name, defaults.app_name),
            registry: self.registry.clone().or_else(|| a.registry.clone()),
            workload_profile_name: pick(
                &self.workload_profile_name,
                &a.workload_profile_name,
                defaults.workload_profile_name,
            ),
            workload_profile_type: pick(
                &self.workload_profile_type,
                &a.workload_profile_type,
                defaults.workload_profile_type,
            ),
            image_name: pick(&self.image_name, &i.name, defaults.image_name),
            image_tag: pick(&self.image_tag, &i.tag, defaults.image_tag),
        }
    }
}

impl ImageArgs {
    pub fn resolve(&self, file: &Config, config: DeploymentConfig) -> ImageSpec {
        let mut spec = ImageSpec::new(config);
        if let Some(tag) = self.base_tag.clone().or_else(|| file.image.base_tag.clone()) {
            spec.base_tag = tag;
        }
        if let Some(dir) = self.cache_dir.clone().or_else(|| file.image.cache_dir.clone()) {
            spec.cache_dir = dir;
        }
        spec
    }
}
