//! Phase work for installing the compatibility runtime into a prefix.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EnvironmentConfig;
use crate::environment::{EnvironmentProbe, RuntimePaths, RuntimeVersion};
use crate::error::StageFailure;
use crate::error_codes::ErrorCode;
use crate::fetch::{IntegrityCheck, Sha256Integrity};
use crate::provision::{ProvisioningPhase, ProvisioningTools, StageDriver, StageReporter};
use crate::runner::Invocation;

type StageResult = std::result::Result<(), StageFailure>;

/// Registry key that makes the web component run under a compatible OS version.
const WEB_COMPONENT_APP_KEY: &str =
    r"HKEY_CURRENT_USER\Software\Wine\AppDefaults\msedgewebview2.exe";

/// Installer processes that linger after a silent install.
const LEFTOVER_INSTALLER_PROCESSES: [&str; 3] = [
    "MicrosoftEdgeUpdate.exe",
    "MicrosoftEdgeWebView2Setup.exe",
    "setup.exe",
];

const WEB_INSTALLER_FILE: &str = "web_component_installer.exe";

/// Installs the runtime, prefix and components.
pub struct RuntimeInstallDriver {
    config: EnvironmentConfig,
    tools: ProvisioningTools,
    probe: Arc<EnvironmentProbe>,
    archive: Option<Vec<u8>>,
}

impl RuntimeInstallDriver {
    pub fn new(
        config: EnvironmentConfig,
        tools: ProvisioningTools,
        probe: Arc<EnvironmentProbe>,
    ) -> Self {
        Self {
            config,
            tools,
            probe,
            archive: None,
        }
    }

    fn paths(&self) -> std::result::Result<RuntimePaths, StageFailure> {
        RuntimePaths::resolve(&self.config).ok_or_else(|| {
            StageFailure::new(ErrorCode::RuntimeNotFound, "compatibility runtime not found")
        })
    }

    /// Version of an already-present runtime, if it runs.
    async fn present_version(&self) -> Option<RuntimeVersion> {
        let paths = RuntimePaths::resolve(&self.config)?;
        let inv = paths
            .runtime_invocation(&self.config.prefix_dir())
            .arg("--version");
        let out = self.tools.runner.run(inv).await.ok()?;
        if !out.success {
            return None;
        }
        RuntimeVersion::parse(&out.stdout)
    }

    async fn fetch(&mut self, reporter: &StageReporter<'_>) -> StageResult {
        let present = self.present_version().await;
        if present.is_some_and(|v| v >= self.config.min_runtime_version) {
            reporter.progress(100, "Runtime already installed");
            return Ok(());
        }

        let Some(location) = self.config.runtime_archive.clone() else {
            return Err(match present {
                Some(v) => StageFailure::new(
                    ErrorCode::RuntimeVersionTooOld,
                    format!(
                        "runtime {v} is older than {} and no runtime archive is configured",
                        self.config.min_runtime_version
                    ),
                ),
                None => StageFailure::new(
                    ErrorCode::RuntimeNotFound,
                    "no runtime found and no runtime archive is configured",
                ),
            });
        };

        let on_progress = |done: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|t| *t > 0) {
                let percent = (done.saturating_mul(100) / total).min(100) as u8;
                reporter.progress_if_changed(percent, format!("Downloaded {done} of {total} bytes"));
            }
        };
        let bytes = self
            .tools
            .source
            .fetch(&location.url, &on_progress)
            .await
            .map_err(|e| StageFailure::new(ErrorCode::FetchFailed, e.to_string()))?;

        if let Some(expected) = &location.sha256 {
            if !Sha256Integrity::new(expected.as_str()).verify(&bytes) {
                return Err(StageFailure::new(
                    ErrorCode::IntegrityMismatch,
                    "runtime archive checksum mismatch",
                ));
            }
        }

        reporter.progress(100, "Runtime downloaded");
        self.archive = Some(bytes);
        Ok(())
    }

    async fn unpack(&mut self, reporter: &StageReporter<'_>) -> StageResult {
        let Some(bytes) = self.archive.take() else {
            reporter.progress(100, "Nothing to unpack");
            return Ok(());
        };
        let target = self.config.runtime_dir();
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => tracing::debug!(dir = %target.display(), "removed stale runtime"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.tools
            .extractor
            .extract(bytes, &target)
            .await
            .map_err(|e| StageFailure::new(ErrorCode::ExtractionFailed, e.to_string()))?;

        if RuntimePaths::bundled(&self.config).is_none() {
            return Err(StageFailure::new(
                ErrorCode::ExtractionFailed,
                "archive did not contain a runtime binary",
            ));
        }
        reporter.progress(100, "Runtime unpacked");
        Ok(())
    }

    async fn init_prefix(&self, reporter: &StageReporter<'_>) -> StageResult {
        let paths = self.paths()?;
        let prefix = self.config.prefix_dir();
        tokio::fs::create_dir_all(&prefix).await?;

        let inv = paths
            .runtime_invocation(&prefix)
            .env("WINEDLLOVERRIDES", "mscoree=d;mshtml=d")
            .args(["wineboot", "--init"])
            .timeout(self.config.step_timeout());
        let out = self
            .tools
            .runner
            .run(inv)
            .await
            .map_err(|e| StageFailure::new(ErrorCode::PrefixInitFailed, e.to_string()))?;
        if !out.success {
            let reason = if out.timed_out {
                "timed out".to_string()
            } else {
                out.stderr
            };
            return Err(StageFailure::new(
                ErrorCode::PrefixInitFailed,
                format!("prefix initialization failed: {reason}"),
            ));
        }
        reporter.progress(100, "Environment created");
        Ok(())
    }

    async fn install_components(&self, reporter: &StageReporter<'_>) -> StageResult {
        let paths = self.paths()?;
        let prefix = self.config.prefix_dir();
        let helper = paths.helper.clone().ok_or_else(|| {
            StageFailure::new(
                ErrorCode::AuxComponentMissing,
                format!("{} not found", self.config.helper_name),
            )
        })?;

        // Verbs take the first 60%, the web component the rest.
        let verbs = &self.config.helper_verbs;
        for (i, verb) in verbs.iter().enumerate() {
            reporter.checkpoint()?;
            let percent = (i * 60 / verbs.len().max(1)) as u8;
            reporter.progress(percent, format!("Installing {verb}"));
            let inv = Invocation::new(&helper)
                .envs(paths.helper_env_vars())
                .env("WINEPREFIX", prefix.to_string_lossy())
                .args(["-q", verb.as_str()])
                .timeout(self.config.step_timeout());
            let out = self
                .tools
                .runner
                .run(inv)
                .await
                .map_err(|e| StageFailure::new(ErrorCode::AuxInstallFailed, e.to_string()))?;
            if !out.success {
                return Err(StageFailure::new(
                    ErrorCode::AuxInstallFailed,
                    format!("{} {verb} failed: {}", self.config.helper_name, out.stderr),
                ));
            }
        }

        reporter.checkpoint()?;
        reporter.progress(60, "Applying compatibility settings");
        let inv = paths.runtime_invocation(&prefix).args([
            "reg",
            "add",
            WEB_COMPONENT_APP_KEY,
            "/v",
            "version",
            "/t",
            "REG_SZ",
            "/d",
            "win7",
            "/f",
        ]);
        let out = self
            .tools
            .runner
            .run(inv)
            .await
            .map_err(|e| StageFailure::new(ErrorCode::RegistryFailed, e.to_string()))?;
        if !out.success {
            return Err(StageFailure::new(ErrorCode::RegistryFailed, out.stderr));
        }

        if self.config.web_component_path().is_dir() {
            reporter.progress(95, "Web component already installed");
        } else {
            reporter.checkpoint()?;
            self.install_web_component(&paths, reporter).await?;
        }

        tokio::fs::write(
            self.config.marker_path(),
            self.config.init_version.to_string(),
        )
        .await?;
        reporter.progress(100, "Components installed");
        Ok(())
    }

    async fn install_web_component(
        &self,
        paths: &RuntimePaths,
        reporter: &StageReporter<'_>,
    ) -> StageResult {
        let prefix = self.config.prefix_dir();
        reporter.progress(65, "Downloading web component");
        let bytes = self
            .tools
            .source
            .fetch(&self.config.web_component_url, &|_, _| {})
            .await
            .map_err(|e| StageFailure::new(ErrorCode::WebComponentFetchFailed, e.to_string()))?;

        let cache = self.config.cache_dir();
        tokio::fs::create_dir_all(&cache).await?;
        let installer = cache.join(WEB_INSTALLER_FILE);
        tokio::fs::write(&installer, &bytes).await?;

        reporter.progress(75, "Installing web component");
        let inv = paths
            .runtime_invocation(&prefix)
            .arg(installer.to_string_lossy())
            .args(["/silent", "/install"])
            .timeout(self.config.web_component_timeout());
        let out = self.tools.runner.run(inv).await.map_err(|e| {
            StageFailure::new(ErrorCode::WebComponentInstallFailed, e.to_string())
        })?;
        if out.timed_out {
            tracing::warn!("web component installer timed out, verification will decide");
        } else if !out.success {
            tracing::warn!(code = ?out.code, stderr = %out.stderr, "web component installer exited with failure");
        }

        for process in LEFTOVER_INSTALLER_PROCESSES {
            let inv = paths
                .runtime_invocation(&prefix)
                .args(["taskkill", "/f", "/im", process]);
            if let Err(e) = self.tools.runner.run(inv).await {
                tracing::debug!(process, error = %e, "taskkill failed");
            }
        }
        if let Err(e) = tokio::fs::remove_file(&installer).await {
            tracing::debug!(error = %e, "could not remove web component installer");
        }
        reporter.progress(95, "Web component installed");
        Ok(())
    }

    async fn verify(&self, reporter: &StageReporter<'_>) -> StageResult {
        let status = self.probe.inspect().await;
        let mut missing = Vec::new();
        if !status.installed {
            missing.push("a launchable runtime");
        }
        if !status.prefix_initialized {
            missing.push("an initialized prefix");
        }
        if !status.web_component_installed {
            missing.push("the web component");
        }
        if !missing.is_empty() {
            let detail = status
                .last_error
                .map(|e| format!(" ({e})"))
                .unwrap_or_default();
            return Err(StageFailure::new(
                ErrorCode::VerificationFailed,
                format!("environment is missing {}{detail}", missing.join(", ")),
            ));
        }
        reporter.progress(100, "Environment verified");
        Ok(())
    }
}

#[async_trait]
impl StageDriver for RuntimeInstallDriver {
    async fn run_phase(
        &mut self,
        phase: ProvisioningPhase,
        reporter: &StageReporter<'_>,
    ) -> StageResult {
        match phase {
            ProvisioningPhase::Fetching => self.fetch(reporter).await,
            ProvisioningPhase::Unpacking => self.unpack(reporter).await,
            ProvisioningPhase::InitializingPrefix => self.init_prefix(reporter).await,
            ProvisioningPhase::InstallingAuxComponent => self.install_components(reporter).await,
            ProvisioningPhase::Verifying => self.verify(reporter).await,
            ProvisioningPhase::NotStarted | ProvisioningPhase::Complete => Ok(()),
        }
    }
}
