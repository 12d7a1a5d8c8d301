use anyhow::Result;
use common::DeploymentConfig;
use tracing::{info, warn};

use crate::image::{cache_env, SERVER_MODULE};
use crate::util::process::{CommandRunner, CommandSpec};

pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
const PYTHON: &str = "python3";

/// The server process a local launch would spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub command: CommandSpec,
}

impl LaunchPlan {
    pub fn new(config: &DeploymentConfig, cache_dir: Option<&str>) -> Result<Self> {
        let config = config.clone().checked()?;

        let mut command = CommandSpec::new(PYTHON)
            .args(["-m", SERVER_MODULE, "--host", "0.0.0.0"])
            .arg("--port")
            .arg(config.port.to_string())
            .arg("--model")
            .arg(config.model.clone())
            .arg("--gpu-memory-utilization")
            .arg(config.gpu_memory_utilization.to_string())
            .env(CUDA_VISIBLE_DEVICES, config.visible_device().to_string());

        if let Some(dir) = cache_dir {
            for (key, value) in cache_env(dir) {
                command = command.env(&key, value);
            }
        }

        Ok(Self { command })
    }

    /// Spawns the server in the foreground and waits for it to exit.
    pub async fn run<R: CommandRunner>(&self, runner: &R) -> Result<()> {
        info!(
            "Launching vLLM on GPU {}: {}",
            self.command.env_value(CUDA_VISIBLE_DEVICES).unwrap_or("0"),
            self.command
        );
        match runner.status(&self.command).await? {
            Some(0) => Ok(()),
            Some(code) => Err(anyhow::anyhow!("vLLM server exited with status {}", code)),
            None => {
                warn!("vLLM server terminated by signal");
                Err(anyhow::anyhow!("vLLM server was terminated by a signal"))
            }
        }
    }
}
