use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".vllm-aca";

/// Optional on-disk defaults. Every value can be overridden by a flag or its
/// environment variable; anything left unset falls back to built-in defaults.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub deployment: DeploymentSection,
    #[serde(default)]
    pub azure: AzureSection,
    #[serde(default)]
    pub image: ImageSection,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeploymentSection {
    pub model: Option<String>,
    #[serde(rename = "gpu_memory_utilization")]
    pub gpu_util: Option<f32>,
    pub port: Option<u16>,
    pub cuda_device: Option<u32>,
    pub min_replicas: Option<u32>,
    pub max_replicas: Option<u32>,
    pub cpu: Option<f32>,
    #[serde(rename = "memory_gib")]
    pub memory: Option<f32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AzureSection {
    pub resource_group: Option<String>,
    pub location: Option<String>,
    pub environment: Option<String>,
    pub app_name: Option<String>,
    pub registry: Option<String>,
    pub workload_profile_name: Option<String>,
    pub workload_profile_type: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ImageSection {
    pub name: Option<String>,
    pub tag: Option<String>,
    pub base_tag: Option<String>,
    pub cache_dir: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        toml::from_str(&config_str).with_context(|| "Failed to parse config file")
    }

    /// Loads `path` when given, otherwise the per-user file if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match get_config_path() {
                Some(default) if default.exists() => Self::from_file(default),
                _ => Ok(Self::default()),
            },
        }
    }
}

pub fn get_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILENAME))
}
