//! External command execution.
//!
//! Provisioning shells out to the runtime and its helper. Everything goes
//! through [`CommandRunner`] so tests can script the outcomes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

/// One command to run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Kill the process when it runs longer than this.
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Look up an environment variable set on this invocation.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// What a finished command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The timeout elapsed and the process was killed.
    pub timed_out: bool,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// A failed run with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }
}

/// Runs external commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Run `invocation` and collect its output.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the process could not be spawned. A process
    /// that runs and fails is reported through [`CommandOutput::success`].
    async fn run(&self, invocation: Invocation) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: Invocation) -> std::io::Result<CommandOutput> {
        tracing::debug!(
            program = %invocation.program.display(),
            args = ?invocation.args,
            "running command"
        );
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;
        let output = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    tracing::warn!(
                        program = %invocation.program.display(),
                        timeout = ?limit,
                        "command timed out"
                    );
                    return Ok(CommandOutput::timed_out());
                }
            },
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            timed_out: false,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn later_env_values_win() {
        let inv = Invocation::new("wine")
            .env("WINEDEBUG", "+all")
            .env("WINEDEBUG", "-all");
        assert_eq!(inv.env_value("WINEDEBUG"), Some("-all"));
        assert_eq!(inv.env_value("MISSING"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_captures_stdout() {
        let out = ProcessRunner
            .run(Invocation::new("sh").args(["-c", "echo wine-10.5"]))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "wine-10.5");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_reports_timeout() {
        let out = ProcessRunner
            .run(
                Invocation::new("sh")
                    .args(["-c", "sleep 5"])
                    .timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let result = ProcessRunner
            .run(Invocation::new("/definitely/not/a/program"))
            .await;
        assert!(result.is_err());
    }
}
