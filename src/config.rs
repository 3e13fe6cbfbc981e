//! Launcher configuration.
//!
//! Every field has a default, so a JSON file only needs to name what it
//! overrides. Builders follow the `with_*` convention and clamp values that
//! must stay positive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::environment::RuntimeVersion;
use crate::error::{LaunchError, Result};
use crate::gate::ReadinessPolicy;
use crate::relay::{default_relays, RelayDescriptor};

/// Default capacity for the bounded event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default time allowed for background tasks to stop during shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "LAUNCHER_DATA_DIR";

const DATA_DIR_NAME: &str = "launch-readiness";

// ── Probe configuration ─────────────────────────────────────────────

/// How relays are probed for latency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Connect timeout handed to each probe.
    pub timeout_ms: u64,
    /// Port of the echo endpoint on each relay host.
    pub port: u16,
    /// Number of echo round trips averaged per probe.
    pub ping_count: u32,
    /// Wait for each individual echo.
    pub ping_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            port: 4000,
            ping_count: 10,
            ping_timeout_ms: 2_000,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Hard bound for one whole probe: connect plus every echo.
    ///
    /// Saturates at [`Duration::MAX`] for absurdly large settings.
    pub fn overall_timeout(&self) -> Duration {
        self.ping_timeout()
            .checked_mul(self.ping_count)
            .and_then(|pings| self.timeout().checked_add(pings))
            .unwrap_or(Duration::MAX)
    }
}

// ── Environment configuration ───────────────────────────────────────

/// Where a remote archive lives and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveLocation {
    /// `http(s)://` or `file://` URL.
    pub url: String,
    /// Expected lowercase hex SHA-256 of the archive bytes. Skipped when absent.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Layout and setup recipe for the compatibility environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Root directory for everything the launcher writes.
    pub data_dir: PathBuf,
    /// Name of the isolated prefix directory under `data_dir`.
    pub prefix_dir_name: String,
    /// Name of the bundled runtime directory under `data_dir`.
    pub runtime_dir_name: String,
    /// Marker file written inside the prefix once setup completed.
    pub marker_file: String,
    /// Setup revision stored in the marker. Raising it forces a re-run.
    pub init_version: u32,
    /// Lowest acceptable runtime version.
    pub min_runtime_version: RuntimeVersion,
    /// Executable name of the auxiliary installer helper.
    pub helper_name: String,
    /// Dependencies the helper installs into the prefix, in order.
    pub helper_verbs: Vec<String>,
    /// Runtime archive to fetch when no usable runtime is present.
    pub runtime_archive: Option<ArchiveLocation>,
    /// Installer for the embedded web rendering component.
    pub web_component_url: String,
    /// Path of the installed web component, relative to the prefix.
    pub web_component_dir: PathBuf,
    /// Upper bound for the web component installer.
    pub web_component_timeout_ms: u64,
    /// Upper bound for the prefix init and each helper verb.
    pub step_timeout_ms: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            prefix_dir_name: "wine_prefix".to_string(),
            runtime_dir_name: "wine".to_string(),
            marker_file: ".launcher_initialized".to_string(),
            init_version: 1,
            min_runtime_version: RuntimeVersion::new(10, 5),
            helper_name: "winetricks".to_string(),
            helper_verbs: ["vcrun2022", "dxtrans", "corefonts", "dxvk"]
                .iter()
                .map(|v| (*v).to_string())
                .collect(),
            runtime_archive: None,
            web_component_url: "https://github.com/aedancullen/webview2-evergreen-standalone-installer-archive/releases/download/109.0.1518.78/MicrosoftEdgeWebView2RuntimeInstallerX64.exe".to_string(),
            web_component_dir: ["drive_c", "Program Files (x86)", "Microsoft", "EdgeWebView"]
                .iter()
                .collect(),
            web_component_timeout_ms: 300_000,
            step_timeout_ms: 600_000,
        }
    }
}

impl EnvironmentConfig {
    pub fn prefix_dir(&self) -> PathBuf {
        self.data_dir.join(&self.prefix_dir_name)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.data_dir.join(&self.runtime_dir_name)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.prefix_dir().join(&self.marker_file)
    }

    pub fn web_component_path(&self) -> PathBuf {
        self.prefix_dir().join(&self.web_component_dir)
    }

    /// Scratch space for downloads.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn web_component_timeout(&self) -> Duration {
        Duration::from_millis(self.web_component_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// `$LAUNCHER_DATA_DIR`, else the platform data directory, else the temp dir.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATA_DIR_NAME)
}

// ── Session configuration ───────────────────────────────────────────

/// Game session tracking settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a session may stay `connecting` before a slow notice fires.
    pub slow_after_ms: u64,
    /// Game client executable. Launching is refused when unset.
    pub client_executable: Option<PathBuf>,
    /// Connect URL handed to the client. `{host}`, `{server}` and `{token}`
    /// are substituted.
    pub connect_url_template: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slow_after_ms: 30_000,
            client_executable: None,
            connect_url_template: "byond://{host}?server={server}&token={token}".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn slow_after(&self) -> Duration {
        Duration::from_millis(self.slow_after_ms)
    }
}

// ── Top-level configuration ─────────────────────────────────────────

/// Configuration for a [`Launcher`](crate::Launcher).
///
/// # Example
///
/// ```
/// use launch_readiness::LauncherConfig;
///
/// let config = LauncherConfig::new()
///     .with_event_channel_capacity(64)
///     .with_data_dir("/tmp/launcher");
/// assert_eq!(config.event_channel_capacity, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Relays to probe, in display order.
    pub relays: Vec<RelayDescriptor>,
    pub probe: ProbeConfig,
    pub readiness: ReadinessPolicy,
    pub environment: EnvironmentConfig,
    pub session: SessionConfig,
    /// Capacity of the bounded event channel. Clamped to at least 1.
    pub event_channel_capacity: usize,
    /// Time allowed for background tasks to stop. Defaults to 1 second.
    pub shutdown_timeout_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            probe: ProbeConfig::default(),
            readiness: ReadinessPolicy::default(),
            environment: EnvironmentConfig::default(),
            session: SessionConfig::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl LauncherConfig {
    /// Defaults for everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.event_channel_capacity = config.event_channel_capacity.max(1);
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loading launcher config");
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for relay in &self.relays {
            if !seen.insert(relay.id.as_str()) {
                return Err(LaunchError::Config(format!(
                    "duplicate relay id: {}",
                    relay.id
                )));
            }
        }
        if self.probe.ping_count == 0 {
            return Err(LaunchError::Config("probe.ping_count must be > 0".into()));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Replace the relay list.
    #[must_use]
    pub fn with_relays(mut self, relays: Vec<RelayDescriptor>) -> Self {
        self.relays = relays;
        self
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.environment.data_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.readiness = policy;
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: EnvironmentConfig) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Set the event channel capacity. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
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

    #[test]
    fn defaults_cover_nine_relays() {
        let config = LauncherConfig::new();
        assert_eq!(config.relays.len(), 9);
        assert_eq!(config.probe.ping_count, 10);
        assert_eq!(config.environment.init_version, 1);
        assert_eq!(config.environment.min_runtime_version, RuntimeVersion::new(10, 5));
        assert_eq!(config.event_channel_capacity, DEFAULT_EVENT_CHANNEL_CAPACITY);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = LauncherConfig::from_json_str(
            r#"{ "probe": { "timeout_ms": 1500 }, "event_channel_capacity": 0 }"#,
        )
        .unwrap();
        assert_eq!(config.probe.timeout_ms, 1500);
        assert_eq!(config.probe.port, 4000);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.relays.len(), 9);
    }

    #[test]
    fn duplicate_relay_ids_are_rejected() {
        let json = r#"{ "relays": [
            { "id": "a", "display_name": "A", "endpoint": "a.example" },
            { "id": "a", "display_name": "A2", "endpoint": "b.example" }
        ] }"#;
        let err = LauncherConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, LaunchError::Config(_)));
    }

    #[test]
    fn default_probe_bound_is_connect_plus_every_echo() {
        assert_eq!(
            ProbeConfig::default().overall_timeout(),
            Duration::from_secs(25)
        );
    }

    #[test]
    fn huge_probe_settings_saturate_instead_of_overflowing() {
        let config = LauncherConfig::from_json_str(
            r#"{ "probe": {
                "timeout_ms": 18446744073709551615,
                "ping_timeout_ms": 18446744073709551615,
                "ping_count": 4000000000
            } }"#,
        )
        .unwrap();
        assert_eq!(config.probe.overall_timeout(), Duration::MAX);
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let err = LauncherConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, LaunchError::Serialization(_)));
    }

    #[test]
    fn capacity_builder_clamps() {
        let config = LauncherConfig::new().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn prefix_paths_derive_from_data_dir() {
        let config = LauncherConfig::new().with_data_dir("/data");
        let env = &config.environment;
        assert_eq!(env.prefix_dir(), PathBuf::from("/data/wine_prefix"));
        assert_eq!(
            env.marker_path(),
            PathBuf::from("/data/wine_prefix/.launcher_initialized")
        );
        assert!(env
            .web_component_path()
            .ends_with("drive_c/Program Files (x86)/Microsoft/EdgeWebView"));
    }
}
