//! Compatibility environment inspection.
//!
//! [`EnvironmentProbe`] answers "can the game client run here?" without
//! changing anything on disk. It locates the runtime (bundled under the data
//! directory first, then on `PATH`), asks it for its version, and looks for
//! the helper, the prefix marker and the web rendering component.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::config::EnvironmentConfig;
use crate::platform::PlatformKind;
use crate::runner::{CommandRunner, Invocation};

/// Shared guard over the prefix directory.
///
/// Provisioning holds the write half for a whole run; inspection only ever
/// tries the read half.
pub type PrefixLock = Arc<RwLock<()>>;

// ── Runtime version ─────────────────────────────────────────────────

/// A `MAJOR.MINOR` runtime version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
}

impl RuntimeVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse `wine-10.5`, `wine-10.5-rc1`, `wine-10.5-staging` or a bare `10.5`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text.strip_prefix("wine-").unwrap_or(text);
        let numeric = text.split(['-', ' ']).next()?;
        let mut parts = numeric.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Self { major, minor })
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ── Status ──────────────────────────────────────────────────────────

/// One complete inspection of the environment. Replaced wholesale on every
/// check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    /// `false` on platforms that run the client natively.
    pub applicable: bool,
    pub installed: bool,
    /// Raw version string reported by the runtime.
    pub version: Option<String>,
    pub meets_minimum_version: bool,
    pub aux_component_installed: bool,
    pub prefix_initialized: bool,
    pub web_component_installed: bool,
    pub last_error: Option<String>,
}

impl EnvironmentStatus {
    /// Status reported where no compatibility runtime is needed.
    pub fn not_applicable() -> Self {
        Self::default()
    }

    /// Placeholder published before the first check finished.
    pub fn unchecked() -> Self {
        Self {
            applicable: true,
            ..Self::default()
        }
    }

    pub fn parsed_version(&self) -> Option<RuntimeVersion> {
        self.version.as_deref().and_then(RuntimeVersion::parse)
    }
}

// ── Runtime paths ───────────────────────────────────────────────────

/// Resolved runtime binaries and the environment they need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Preferred launcher binary.
    pub runtime: PathBuf,
    /// 64-bit launcher binary, same as `runtime` on most installs.
    pub runtime64: PathBuf,
    pub server: PathBuf,
    /// Installation root, used for library search paths.
    pub install_dir: PathBuf,
    /// Auxiliary installer helper, when one was found.
    pub helper: Option<PathBuf>,
    /// Whether this is the launcher-managed runtime rather than the system one.
    pub bundled: bool,
}

impl RuntimePaths {
    /// Locate a runtime. The bundled copy wins over the system install.
    pub fn resolve(config: &EnvironmentConfig) -> Option<Self> {
        Self::bundled(config).or_else(|| Self::system(config))
    }

    /// The launcher-managed runtime under the data directory.
    pub fn bundled(config: &EnvironmentConfig) -> Option<Self> {
        let install_dir = config.runtime_dir();
        let bin = install_dir.join("bin");
        let wine = bin.join("wine");
        let wine64 = bin.join("wine64");
        let (runtime, runtime64) = match (wine.is_file(), wine64.is_file()) {
            (true, true) => (wine, wine64),
            (true, false) => (wine.clone(), wine),
            (false, true) => (wine64.clone(), wine64),
            (false, false) => return None,
        };
        let helper = Some(bin.join(&config.helper_name))
            .filter(|p| p.is_file())
            .or_else(|| which::which(&config.helper_name).ok());
        Some(Self {
            runtime,
            runtime64,
            server: bin.join("wineserver"),
            install_dir,
            helper,
            bundled: true,
        })
    }

    /// A runtime found on `PATH`.
    pub fn system(config: &EnvironmentConfig) -> Option<Self> {
        let runtime64 = which::which("wine64")
            .or_else(|_| which::which("wine"))
            .ok()?;
        let runtime = which::which("wine").unwrap_or_else(|_| runtime64.clone());
        let install_dir = runtime64
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/usr"));
        let server =
            which::which("wineserver").unwrap_or_else(|_| install_dir.join("bin/wineserver"));
        Some(Self {
            runtime,
            runtime64,
            server,
            install_dir,
            helper: which::which(&config.helper_name).ok(),
            bundled: false,
        })
    }

    /// Variables every runtime invocation needs.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if self.bundled {
            let libs = format!(
                "{}:{}",
                self.install_dir.join("lib64").display(),
                self.install_dir.join("lib").display()
            );
            let ld_path = match std::env::var("LD_LIBRARY_PATH") {
                Ok(existing) if !existing.is_empty() => format!("{libs}:{existing}"),
                _ => libs,
            };
            vars.push(("LD_LIBRARY_PATH".to_string(), ld_path));
            vars.push((
                "WINEDLLPATH".to_string(),
                format!(
                    "{}:{}",
                    self.install_dir.join("lib64/wine").display(),
                    self.install_dir.join("lib/wine").display()
                ),
            ));
            vars.push((
                "WINESERVER".to_string(),
                self.server.to_string_lossy().into_owned(),
            ));
        }
        vars.push(("WINEDEBUG".to_string(), "-all".to_string()));
        vars
    }

    /// Variables for the helper, which also needs to find the runtime.
    pub fn helper_env_vars(&self) -> Vec<(String, String)> {
        let mut vars = self.env_vars();
        vars.push(("WINE".to_string(), self.runtime.to_string_lossy().into_owned()));
        vars.push((
            "WINE64".to_string(),
            self.runtime64.to_string_lossy().into_owned(),
        ));
        vars
    }

    /// An invocation of the runtime inside `prefix`.
    pub fn runtime_invocation(&self, prefix: &Path) -> Invocation {
        Invocation::new(&self.runtime)
            .envs(self.env_vars())
            .env("WINEPREFIX", prefix.to_string_lossy())
    }
}

/// Whether `prefix` carries a marker at `init_version` or later.
pub fn prefix_initialized(marker: &Path, init_version: u32) -> bool {
    std::fs::read_to_string(marker)
        .ok()
        .and_then(|text| text.trim().parse::<u32>().ok())
        .is_some_and(|v| v >= init_version)
}

// ── Probe ───────────────────────────────────────────────────────────

/// Inspects the compatibility environment.
pub struct EnvironmentProbe {
    config: EnvironmentConfig,
    platform: PlatformKind,
    runner: Arc<dyn CommandRunner>,
    lock: PrefixLock,
    state: watch::Sender<EnvironmentStatus>,
}

impl EnvironmentProbe {
    pub fn new(
        config: EnvironmentConfig,
        platform: PlatformKind,
        runner: Arc<dyn CommandRunner>,
        lock: PrefixLock,
    ) -> Self {
        let initial = if platform.needs_compat_runtime() {
            EnvironmentStatus::unchecked()
        } else {
            EnvironmentStatus::not_applicable()
        };
        let (state, _) = watch::channel(initial);
        Self {
            config,
            platform,
            runner,
            lock,
            state,
        }
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn platform(&self) -> PlatformKind {
        self.platform
    }

    /// Watch the latest status. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<EnvironmentStatus> {
        self.state.subscribe()
    }

    /// The last published status.
    pub fn snapshot(&self) -> EnvironmentStatus {
        self.state.borrow().clone()
    }

    /// Inspect the environment and publish the result.
    ///
    /// While provisioning holds the prefix this returns the last published
    /// status instead of reading a half-written prefix.
    pub async fn check(&self) -> EnvironmentStatus {
        if !self.platform.needs_compat_runtime() {
            let status = EnvironmentStatus::not_applicable();
            self.state.send_replace(status.clone());
            return status;
        }
        let Ok(_guard) = self.lock.try_read() else {
            tracing::debug!("prefix busy, returning cached environment status");
            return self.snapshot();
        };
        let status = self.inspect().await;
        self.state.send_replace(status.clone());
        status
    }

    /// Inspect without taking the prefix lock or publishing.
    ///
    /// Used by a provisioning run that already holds the prefix.
    pub async fn inspect(&self) -> EnvironmentStatus {
        let mut status = EnvironmentStatus::unchecked();
        let prefix = self.config.prefix_dir();
        status.prefix_initialized =
            prefix_initialized(&self.config.marker_path(), self.config.init_version);
        status.web_component_installed = self.config.web_component_path().is_dir();

        let Some(paths) = RuntimePaths::resolve(&self.config) else {
            status.last_error = Some("compatibility runtime not found".to_string());
            self.log_status(&status);
            return status;
        };
        status.aux_component_installed = paths.helper.as_ref().is_some_and(|p| p.exists());

        let invocation = paths.runtime_invocation(&prefix).arg("--version");
        match self.runner.run(invocation).await {
            Ok(out) if out.success => {
                let reported = out.stdout.trim().to_string();
                match RuntimeVersion::parse(&reported) {
                    Some(v) => {
                        status.installed = true;
                        status.meets_minimum_version = v >= self.config.min_runtime_version;
                        if !status.meets_minimum_version {
                            status.last_error = Some(format!(
                                "runtime {v} is older than {}",
                                self.config.min_runtime_version
                            ));
                        }
                    }
                    None => {
                        status.last_error =
                            Some(format!("unrecognised runtime version: {reported}"));
                    }
                }
                status.version = Some(reported);
            }
            Ok(out) => {
                status.last_error = Some(format!("runtime --version failed: {}", out.stderr));
            }
            Err(e) => {
                status.last_error = Some(format!("runtime could not be started: {e}"));
            }
        }
        if status.installed && !status.aux_component_installed && status.last_error.is_none() {
            status.last_error = Some(format!("{} not found", self.config.helper_name));
        }

        self.log_status(&status);
        status
    }

    fn log_status(&self, status: &EnvironmentStatus) {
        tracing::debug!(
            installed = status.installed,
            version = ?status.version,
            meets_minimum = status.meets_minimum_version,
            helper = status.aux_component_installed,
            prefix = status.prefix_initialized,
            web_component = status.web_component_installed,
            error = ?status.last_error,
            "environment inspected"
        );
    }
}

impl fmt::Debug for EnvironmentProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentProbe")
            .field("platform", &self.platform)
            .field("prefix", &self.config.prefix_dir())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use async_trait::async_trait;

    struct VersionRunner(&'static str);

    #[async_trait]
    impl CommandRunner for VersionRunner {
        async fn run(&self, _invocation: Invocation) -> std::io::Result<CommandOutput> {
            Ok(CommandOutput::ok(self.0))
        }
    }

    fn bundled_config(dir: &Path) -> EnvironmentConfig {
        let config = EnvironmentConfig {
            data_dir: dir.to_path_buf(),
            ..EnvironmentConfig::default()
        };
        let bin = config.runtime_dir().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("wine"), "").unwrap();
        std::fs::write(bin.join("winetricks"), "").unwrap();
        config
    }

    fn probe(config: EnvironmentConfig, version: &'static str) -> EnvironmentProbe {
        EnvironmentProbe::new(
            config,
            PlatformKind::Linux,
            Arc::new(VersionRunner(version)),
            PrefixLock::default(),
        )
    }

    #[test]
    fn parses_release_candidates_and_staging() {
        assert_eq!(RuntimeVersion::parse("wine-10.5"), Some(RuntimeVersion::new(10, 5)));
        assert_eq!(
            RuntimeVersion::parse("wine-10.12-rc1"),
            Some(RuntimeVersion::new(10, 12))
        );
        assert_eq!(
            RuntimeVersion::parse("wine-9.0 (Staging)"),
            Some(RuntimeVersion::new(9, 0))
        );
        assert_eq!(RuntimeVersion::parse("wine-ten"), None);
        assert_eq!(RuntimeVersion::parse("10"), None);
    }

    #[test]
    fn versions_compare_numerically() {
        assert!(RuntimeVersion::new(10, 12) > RuntimeVersion::new(10, 5));
        assert!(RuntimeVersion::new(9, 20) < RuntimeVersion::new(10, 0));
    }

    #[test]
    fn marker_needs_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join(".marker");
        assert!(!prefix_initialized(&marker, 1));
        std::fs::write(&marker, "0").unwrap();
        assert!(!prefix_initialized(&marker, 1));
        std::fs::write(&marker, "2\n").unwrap();
        assert!(prefix_initialized(&marker, 1));
        std::fs::write(&marker, "garbage").unwrap();
        assert!(!prefix_initialized(&marker, 1));
    }

    #[test]
    fn bundled_runtime_sets_library_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = bundled_config(dir.path());
        let paths = RuntimePaths::bundled(&config).unwrap();
        let vars = paths.helper_env_vars();
        let keys: Vec<&str> = vars.iter().map(|(k, _)| k.as_str()).collect();
        for key in ["LD_LIBRARY_PATH", "WINEDLLPATH", "WINESERVER", "WINEDEBUG", "WINE", "WINE64"] {
            assert!(keys.contains(&key), "missing {key}");
        }
    }

    #[tokio::test]
    async fn empty_prefix_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let config = bundled_config(dir.path());
        std::fs::create_dir_all(config.prefix_dir()).unwrap();
        let status = probe(config, "wine-10.5").check().await;
        assert!(status.installed);
        assert!(status.meets_minimum_version);
        assert!(status.aux_component_installed);
        assert!(!status.prefix_initialized);
        assert!(!status.web_component_installed);
    }

    #[tokio::test]
    async fn old_runtime_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let status = probe(bundled_config(dir.path()), "wine-9.0").check().await;
        assert!(status.installed);
        assert!(!status.meets_minimum_version);
        assert!(status.last_error.unwrap().contains("older"));
    }

    #[tokio::test]
    async fn busy_prefix_returns_cached_status() {
        let dir = tempfile::tempdir().unwrap();
        let lock = PrefixLock::default();
        let probe = EnvironmentProbe::new(
            bundled_config(dir.path()),
            PlatformKind::Linux,
            Arc::new(VersionRunner("wine-10.5")),
            Arc::clone(&lock),
        );
        let _writer = lock.write().await;
        let status = probe.check().await;
        assert_eq!(status, EnvironmentStatus::unchecked());
    }

    #[tokio::test]
    async fn other_platforms_are_not_applicable() {
        let probe = EnvironmentProbe::new(
            EnvironmentConfig::default(),
            PlatformKind::Windows,
            Arc::new(VersionRunner("")),
            PrefixLock::default(),
        );
        let status = probe.check().await;
        assert!(!status.applicable);
    }
}
