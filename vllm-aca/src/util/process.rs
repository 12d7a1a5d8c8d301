use anyhow::{Context, Result};
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Flags whose following argument must never reach a log line.
const SECRET_FLAGS: &[&str] = &["--registry-password", "--password", "--secrets"];

/// One external program invocation, described as data so it can be logged,
/// inspected in tests and executed by any [`CommandRunner`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    /// Value of an environment variable set on this command, if any.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value following `flag` in the argument list.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.envs {
            write!(f, "{}={} ", k, v)?;
        }
        write!(f, "{}", self.program)?;
        let mut hide_next = false;
        for arg in &self.args {
            if hide_next {
                write!(f, " ***")?;
                hide_next = false;
                continue;
            }
            hide_next = SECRET_FLAGS.contains(&arg.as_str());
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes external programs. `output` captures stdout/stderr; `status`
/// inherits the terminal so long-running tools stream their own progress.
pub trait CommandRunner: Send + Sync {
    fn output(
        &self,
        spec: &CommandSpec,
    ) -> impl std::future::Future<Output = Result<CommandOutput>> + Send;

    fn status(
        &self,
        spec: &CommandSpec,
    ) -> impl std::future::Future<Output = Result<Option<i32>>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn output(
        &self,
        spec: &CommandSpec,
    ) -> impl std::future::Future<Output = Result<CommandOutput>> + Send {
        async move {
            debug!("exec: {}", spec);
            let output = spec
                .to_command()
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .with_context(|| format!("Failed to spawn {}", spec.program))?
                .wait_with_output()
                .await?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    fn status(
        &self,
        spec: &CommandSpec,
    ) -> impl std::future::Future<Output = Result<Option<i32>>> + Send {
        async move {
            debug!("exec (inherit stdio): {}", spec);
            let status = spec
                .to_command()
                .status()
                .await
                .with_context(|| format!("Failed to spawn {}", spec.program))?;
            Ok(status.code())
        }
    }
}

impl<R: CommandRunner> CommandRunner for &R {
    fn output(
        &self,
        spec: &CommandSpec,
    ) -> impl std::future::Future<Output = Result<CommandOutput>> + Send {
        (**self).output(spec)
    }

    fn status(
        &self,
        spec: &CommandSpec,
    ) -> impl std::future::Future<Output = Result<Option<i32>>> + Send {
        (**self).status(spec)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_redacts_secrets() {
        let spec = CommandSpec::new("az")
            .args(["containerapp", "create", "--registry-password", "hunter2", "--name", "app"]);
        let line = spec.to_string();
        assert!(!line.contains("hunter2"));
        assert!(line.contains("--registry-password ***"));
        assert!(line.ends_with("--name app"));
    }

    #[test]
    fn test_flag_and_env_lookup() {
        let spec = CommandSpec::new("python3")
            .args(["--port", "8000"])
            .env("CUDA_VISIBLE_DEVICES", "1")
            .env("CUDA_VISIBLE_DEVICES", "2");
        assert_eq!(spec.flag_value("--port"), Some("8000"));
        assert_eq!(spec.flag_value("--model"), None);
        assert_eq!(spec.env_value("CUDA_VISIBLE_DEVICES"), Some("2"));
    }

    #[tokio::test]
    async fn test_system_runner_reports_missing_program() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-vllm-aca");
        assert!(SystemRunner.output(&spec).await.is_err());
    }
}
