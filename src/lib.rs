//! # Launch Readiness
//!
//! Decides whether a game client can be launched right now, and fixes what it
//! can when the answer is no.
//!
//! Three concerns run side by side under one [`Launcher`]:
//!
//! - **Relay selection**: probe every relay concurrently, rank by latency and
//!   auto-select the fastest unless the player pinned one ([`RelaySelector`]).
//! - **Compatibility environment**: inspect the runtime and its isolated
//!   prefix ([`EnvironmentProbe`]) and provision or reset it through a fixed
//!   phase sequence with progress events ([`EnvironmentProvisioner`]).
//! - **Game session**: track `Idle -> Connecting -> Connected -> Restarting`
//!   for the running client ([`SessionMonitor`]).
//!
//! A launch request passes through a stateless gate ([`gate::evaluate`]) that
//! combines environment readiness, relay readiness and the configured
//! [`ReadinessPolicy`].
//!
//! ## Features
//!
//! | Feature           | Default | Provides                               |
//! |-------------------|---------|----------------------------------------|
//! | `probe-websocket` | yes     | [`probes::WebSocketProbe`]             |
//! | `fetch-http`      | yes     | `http(s)://` support in archive fetch  |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "probe-websocket")]
//! # async fn example() -> Result<(), launch_readiness::LaunchError> {
//! use launch_readiness::{Collaborators, Launcher, LauncherConfig, LauncherEvent};
//!
//! let config = LauncherConfig::new();
//! let collaborators = Collaborators::system(&config);
//! let (mut launcher, mut events) = Launcher::start(config, collaborators);
//!
//! while let Some(event) = events.recv().await {
//!     if let LauncherEvent::RelaySelected(relay) = event {
//!         println!("best relay: {}", relay.display_name);
//!         break;
//!     }
//! }
//!
//! launcher.provision_and_launch("main", None).await?;
//! launcher.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod config;
pub mod environment;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod extract;
pub mod fetch;
pub mod game;
pub mod gate;
pub mod install;
pub mod launcher;
pub mod platform;
pub mod probe;
pub mod probes;
pub mod provision;
pub mod relay;
pub mod runner;
pub mod session;

pub use config::LauncherConfig;
pub use environment::{EnvironmentProbe, EnvironmentStatus, RuntimeVersion};
pub use error::{DenyReason, LaunchError, Result, StageFailure};
pub use error_codes::{ErrorCode, Remedy};
pub use event::LauncherEvent;
pub use gate::ReadinessPolicy;
pub use launcher::{Collaborators, Launcher, SignalSender};
pub use platform::PlatformKind;
pub use probe::LatencyProbe;
pub use provision::{
    EnvironmentProvisioner, ProgressStage, ProvisioningPhase, ProvisioningProgress,
};
pub use relay::{RelayDescriptor, RelayProbeResult, RelaySelector, RelaySnapshot};
pub use session::{SessionMonitor, SessionSignal, SessionState};

#[cfg(feature = "probe-websocket")]
pub use probes::WebSocketProbe;
