//! Starting the game client.
//!
//! [`GameLauncher`] turns an accepted launch into a running process. The
//! returned [`GameProcess`] handle is owned by the session monitor, which is
//! the only component allowed to terminate it.

use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::config::{EnvironmentConfig, SessionConfig};
use crate::environment::RuntimePaths;
use crate::error::{LaunchError, Result};
use crate::platform::PlatformKind;
use crate::relay::RelayDescriptor;

/// Everything needed to start the client for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub server_name: String,
    pub relay: RelayDescriptor,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
}

/// Handle to a running game client.
#[async_trait]
pub trait GameProcess: Send + Sync {
    /// OS process id, when known.
    fn pid(&self) -> Option<u32>;

    /// A future that resolves with the exit code once the process ends.
    /// May be called more than once.
    fn on_exit(&self) -> BoxFuture<'static, Option<i32>>;

    /// Ask the process to stop and wait for it to go away.
    async fn terminate(&mut self) -> io::Result<()>;
}

/// Starts the game client.
#[async_trait]
pub trait GameLauncher: Send + Sync + 'static {
    async fn start(&self, request: &LaunchRequest) -> Result<Box<dyn GameProcess>>;
}

/// Substitute `{host}`, `{server}` and `{token}` in a connect URL template.
pub fn render_connect_url(template: &str, request: &LaunchRequest) -> String {
    template
        .replace("{host}", &request.relay.endpoint)
        .replace("{server}", &request.server_name)
        .replace("{token}", request.auth_token.as_deref().unwrap_or_default())
}

/// Launches the configured client executable, through the compatibility
/// runtime where the platform needs it.
#[derive(Debug, Clone)]
pub struct ClientLauncher {
    session: SessionConfig,
    environment: EnvironmentConfig,
    platform: PlatformKind,
}

impl ClientLauncher {
    pub fn new(session: SessionConfig, environment: EnvironmentConfig, platform: PlatformKind) -> Self {
        Self {
            session,
            environment,
            platform,
        }
    }

    fn command(&self, client: &Path, url: &str) -> Result<tokio::process::Command> {
        if !self.platform.needs_compat_runtime() {
            let mut command = tokio::process::Command::new(client);
            command.arg(url);
            return Ok(command);
        }
        let paths = RuntimePaths::resolve(&self.environment)
            .ok_or_else(|| LaunchError::ProcessStart("compatibility runtime not found".into()))?;
        let mut command = tokio::process::Command::new(&paths.runtime);
        command
            .arg(client)
            .arg(url)
            .envs(paths.env_vars())
            .env("WINEPREFIX", self.environment.prefix_dir());
        tracing::debug!(bundled = paths.bundled, runtime = %paths.runtime.display(), "launching through runtime");
        Ok(command)
    }
}

#[async_trait]
impl GameLauncher for ClientLauncher {
    async fn start(&self, request: &LaunchRequest) -> Result<Box<dyn GameProcess>> {
        let client = self
            .session
            .client_executable
            .as_ref()
            .ok_or_else(|| LaunchError::ProcessStart("no client executable configured".into()))?;
        let url = render_connect_url(&self.session.connect_url_template, request);

        let mut command = self.command(client, &url)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = command
            .spawn()
            .map_err(|e| LaunchError::ProcessStart(e.to_string()))?;
        tracing::info!(
            server = %request.server_name,
            relay = %request.relay.id,
            pid = ?child.id(),
            "game client started"
        );
        Ok(Box::new(ChildProcess::watch(child)))
    }
}

/// A spawned child process with a background exit watcher.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<Option<i32>>>,
}

impl ChildProcess {
    /// Take ownership of `child` and watch it until it exits.
    pub fn watch(mut child: tokio::process::Child) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // A dropped handle leaves the client running.
                Ok(()) = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(pid = ?pid, error = %e, "failed to kill game client");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "failed to wait for game client");
                    None
                }
            };
            tracing::debug!(pid = ?pid, code = ?code, "game client exited");
            exit_tx.send_replace(Some(code));
        });

        Self {
            pid,
            kill: Some(kill_tx),
            exit: exit_rx,
        }
    }
}

#[async_trait]
impl GameProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn on_exit(&self) -> BoxFuture<'static, Option<i32>> {
        wait_exit(self.exit.clone()).boxed()
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if let Some(kill) = self.kill.take() {
            // The watcher may already have finished.
            let _ = kill.send(());
        }
        wait_exit(self.exit.clone()).await;
        Ok(())
    }
}

async fn wait_exit(mut exit: watch::Receiver<Option<Option<i32>>>) -> Option<i32> {
    match exit.wait_for(Option::is_some).await {
        Ok(code) => (*code).flatten(),
        // Watcher gone without reporting; treat as exited.
        Err(_) => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn request(token: Option<&str>) -> LaunchRequest {
        LaunchRequest {
            server_name: "main".into(),
            relay: RelayDescriptor::new("nyc", "NYC", "nyc.cm-ss13.com"),
            auth_token: token.map(str::to_string),
        }
    }

    #[test]
    fn connect_url_substitutes_placeholders() {
        let url = render_connect_url("byond://{host}?server={server}&token={token}", &request(Some("abc")));
        assert_eq!(url, "byond://nyc.cm-ss13.com?server=main&token=abc");
        let url = render_connect_url("{host}/{token}", &request(None));
        assert_eq!(url, "nyc.cm-ss13.com/");
    }

    #[tokio::test]
    async fn missing_client_is_a_start_error() {
        let launcher = ClientLauncher::new(
            SessionConfig::default(),
            EnvironmentConfig::default(),
            PlatformKind::Windows,
        );
        let err = launcher.start(&request(None)).await.err().unwrap();
        assert!(matches!(err, LaunchError::ProcessStart(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_exit_is_observed() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let process = ChildProcess::watch(child);
        assert_eq!(process.on_exit().await, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_kills_the_child() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .unwrap();
        let mut process = ChildProcess::watch(child);
        let exited = process.on_exit();
        process.terminate().await.unwrap();
        assert_eq!(exited.await, None);
    }
}
