//! The launcher: composition root for relay selection, environment
//! provisioning and session tracking.
//!
//! [`Launcher::start`] wires the components together, kicks off the initial
//! relay probe and environment check, and spawns a background loop that turns
//! state changes into [`LauncherEvent`]s and feeds backend signals into the
//! session monitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::LauncherConfig;
use crate::environment::{EnvironmentProbe, EnvironmentStatus, PrefixLock};
use crate::error::{DenyReason, LaunchError, Result};
use crate::event::LauncherEvent;
use crate::extract::ArchiveExtractor;
use crate::fetch::ArchiveSource;
use crate::game::{GameLauncher, LaunchRequest};
use crate::gate;
use crate::platform::PlatformKind;
use crate::probe::LatencyProbe;
use crate::provision::{EnvironmentProvisioner, ProvisioningProgress, ProvisioningTools};
use crate::relay::{RelayProbeResult, RelaySelector, RelaySnapshot};
use crate::runner::CommandRunner;
use crate::session::{SessionMonitor, SessionSignal, SessionState};

// ── Collaborators ───────────────────────────────────────────────────

/// The external systems the launcher talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn LatencyProbe>,
    pub source: Arc<dyn ArchiveSource>,
    pub extractor: Arc<dyn ArchiveExtractor>,
    pub runner: Arc<dyn CommandRunner>,
    pub game: Arc<dyn GameLauncher>,
    pub platform: PlatformKind,
}

impl Collaborators {
    /// Real network probes, archive handling, processes and game client.
    #[cfg(feature = "probe-websocket")]
    pub fn system(config: &LauncherConfig) -> Self {
        let platform = PlatformKind::current();
        Self {
            probe: Arc::new(crate::probes::WebSocketProbe::new(&config.probe)),
            source: Arc::new(crate::fetch::DefaultArchiveSource::new()),
            extractor: Arc::new(crate::extract::TarExtractor),
            runner: Arc::new(crate::runner::ProcessRunner),
            game: Arc::new(crate::game::ClientLauncher::new(
                config.session.clone(),
                config.environment.clone(),
                platform,
            )),
            platform,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

// ── Signal sender ───────────────────────────────────────────────────

/// Cloneable handle the game backend uses to report session signals.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<SessionSignal>,
}

impl SignalSender {
    /// Queue a signal for the session monitor.
    ///
    /// # Errors
    ///
    /// [`LaunchError::Io`] with `BrokenPipe` once the launcher has stopped.
    pub fn send(&self, signal: SessionSignal) -> Result<()> {
        self.tx.send(signal).map_err(|_| {
            LaunchError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "launcher stopped",
            ))
        })
    }
}

// ── Launcher handle ─────────────────────────────────────────────────

struct Shared {
    config: LauncherConfig,
    platform: PlatformKind,
    relays: RelaySelector,
    environment: Arc<EnvironmentProbe>,
    provisioner: EnvironmentProvisioner,
    session: SessionMonitor,
    game: Arc<dyn GameLauncher>,
}

/// Owns every launch-readiness component for the life of the process.
pub struct Launcher {
    shared: Arc<Shared>,
    signal_tx: mpsc::UnboundedSender<SessionSignal>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl Launcher {
    /// Build the components, start the initial relay probe and environment
    /// check, and return the handle with its event receiver.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        config: LauncherConfig,
        collaborators: Collaborators,
    ) -> (Self, mpsc::Receiver<LauncherEvent>) {
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let lock = PrefixLock::default();
        let environment = Arc::new(EnvironmentProbe::new(
            config.environment.clone(),
            collaborators.platform,
            Arc::clone(&collaborators.runner),
            Arc::clone(&lock),
        ));
        let provisioner = EnvironmentProvisioner::new(
            Arc::clone(&environment),
            ProvisioningTools {
                source: collaborators.source,
                extractor: collaborators.extractor,
                runner: collaborators.runner,
            },
            lock,
        );
        let shared = Arc::new(Shared {
            relays: RelaySelector::new(
                config.relays.clone(),
                collaborators.probe,
                config.probe.clone(),
            ),
            environment,
            provisioner,
            session: SessionMonitor::new(config.session.slow_after()),
            game: collaborators.game,
            platform: collaborators.platform,
            config,
        });

        let shutdown_timeout = shared.config.shutdown_timeout();
        let task = tokio::spawn(event_loop(
            Arc::clone(&shared),
            signal_rx,
            event_tx,
            shutdown_rx,
        ));

        let launcher = Self {
            shared,
            signal_tx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (launcher, event_rx)
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.shared.config
    }

    pub fn platform(&self) -> PlatformKind {
        self.shared.platform
    }

    // ── Relays ──────────────────────────────────────────────────────

    /// Probe all relays again and return the ranking.
    pub async fn probe_relays(&self) -> Vec<RelayProbeResult> {
        self.shared.relays.probe_all().await
    }

    /// Pin a relay.
    ///
    /// # Errors
    ///
    /// [`LaunchError::UnknownRelay`] for an id that is not configured.
    pub fn select_relay(&self, relay_id: &str) -> Result<()> {
        self.shared.relays.select(relay_id)
    }

    pub fn relays(&self) -> RelaySnapshot {
        self.shared.relays.snapshot()
    }

    pub fn subscribe_relays(&self) -> watch::Receiver<RelaySnapshot> {
        self.shared.relays.subscribe()
    }

    // ── Environment ─────────────────────────────────────────────────

    /// Re-inspect the environment.
    pub async fn check_status(&self) -> EnvironmentStatus {
        self.shared.environment.check().await
    }

    pub fn environment(&self) -> EnvironmentStatus {
        self.shared.environment.snapshot()
    }

    pub fn subscribe_environment(&self) -> watch::Receiver<EnvironmentStatus> {
        self.shared.environment.subscribe()
    }

    /// Run provisioning to completion.
    ///
    /// # Errors
    ///
    /// See [`EnvironmentProvisioner::provision`].
    pub async fn provision(&self) -> Result<ProvisioningProgress> {
        self.shared.provisioner.provision().await
    }

    /// Destroy the prefix and provision again.
    pub async fn reset(&self) -> Result<ProvisioningProgress> {
        self.shared.provisioner.reset().await
    }

    /// Ask the active provisioning run to stop. Returns `false` when idle.
    pub fn abandon_provisioning(&self) -> bool {
        self.shared.provisioner.abandon()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProvisioningProgress> {
        self.shared.provisioner.subscribe_progress()
    }

    /// Latest event of the active run, `None` when no run is in flight.
    pub fn watch_provisioning(&self) -> watch::Receiver<Option<ProvisioningProgress>> {
        self.shared.provisioner.watch_current()
    }

    // ── Session ─────────────────────────────────────────────────────

    /// Start the game for `server_name` if every precondition holds.
    ///
    /// # Errors
    ///
    /// - [`LaunchError::SessionActive`] while a session is underway
    /// - [`LaunchError::LaunchDenied`] when the environment or relay is not ready
    /// - [`LaunchError::ProcessStart`] when the client failed to start
    pub async fn request_launch(&self, server_name: &str, auth_token: Option<String>) -> Result<()> {
        let shared = &self.shared;
        if !shared.session.state().is_idle() {
            return Err(LaunchError::SessionActive);
        }

        let status = shared.environment.check().await;
        let relays = shared.relays.snapshot();
        let selected = relays.selected_relay().cloned();
        gate::evaluate(
            shared.platform,
            &status,
            shared.provisioner.is_running(),
            relays.ready,
            selected.is_some(),
            &shared.config.readiness,
        )
        .map_err(|reason| {
            tracing::info!(server = %server_name, reason = %reason, "launch denied");
            LaunchError::LaunchDenied(reason)
        })?;
        let relay = selected.ok_or(LaunchError::LaunchDenied(DenyReason::NoRelaySelected))?;

        let session_id = shared.session.begin(server_name)?;
        let request = LaunchRequest {
            server_name: server_name.to_string(),
            relay,
            auth_token,
        };
        match shared.game.start(&request).await {
            Ok(process) => {
                shared.session.attach(session_id, process).await;
                Ok(())
            }
            Err(e) => {
                warn!(server = %server_name, error = %e, "game client failed to start");
                shared.session.abort(session_id);
                Err(e)
            }
        }
    }

    /// Provision first when only the environment is missing, then launch.
    ///
    /// # Errors
    ///
    /// Everything [`request_launch`](Self::request_launch) returns, plus
    /// [`LaunchError::AlreadyProvisioning`]. A failed provisioning run yields
    /// `LaunchDenied(EnvironmentNotReady)`.
    pub async fn provision_and_launch(
        &self,
        server_name: &str,
        auth_token: Option<String>,
    ) -> Result<()> {
        let shared = &self.shared;
        if shared.platform.needs_compat_runtime() {
            let status = shared.environment.check().await;
            if shared.provisioner.is_running() || !shared.config.readiness.environment_ready(&status)
            {
                let outcome = shared.provisioner.provision().await?;
                if !outcome.succeeded() {
                    return Err(LaunchError::LaunchDenied(DenyReason::EnvironmentNotReady));
                }
            }
        }
        self.request_launch(server_name, auth_token).await
    }

    /// Terminate the game and return the session to `Idle`.
    pub async fn force_close(&self) {
        self.shared.session.force_close().await;
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.session.state()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<SessionState> {
        self.shared.session.subscribe()
    }

    /// Handle for the backend to report session signals.
    pub fn signal_sender(&self) -> SignalSender {
        SignalSender {
            tx: self.signal_tx.clone(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Stop the background loop and any probe or check it started.
    ///
    /// The event receiver yields `None` once the loop has exited.
    pub async fn shutdown(&mut self) {
        debug!("launcher shutdown requested");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!("launcher loop terminated with join error: {join_err}"),
                Err(_) => {
                    warn!("launcher loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("launcher loop aborted: {join_err}");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("platform", &self.shared.platform)
            .field("session", &self.shared.session.state())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        // Aborting drops the loop future and its JoinSet, which aborts any
        // probe or check still running.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Event loop ──────────────────────────────────────────────────────

/// Forwards component state to the event channel and session signals to the
/// monitor until shutdown.
async fn event_loop(
    shared: Arc<Shared>,
    mut signal_rx: mpsc::UnboundedReceiver<SessionSignal>,
    event_tx: mpsc::Sender<LauncherEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("launcher loop started");

    let mut relay_rx = shared.relays.subscribe();
    let mut env_rx = shared.environment.subscribe();
    let mut session_rx = shared.session.subscribe();
    let mut progress_rx = shared.provisioner.subscribe_progress();
    let mut slow_rx = shared.session.subscribe_slow();
    let mut selected = relay_rx.borrow_and_update().selected.clone();
    env_rx.borrow_and_update();
    session_rx.borrow_and_update();

    let mut tasks = JoinSet::new();
    {
        let shared = Arc::clone(&shared);
        tasks.spawn(async move {
            shared.relays.probe_all().await;
        });
    }
    {
        let shared = Arc::clone(&shared);
        tasks.spawn(async move {
            shared.environment.check().await;
        });
    }

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break;
            }

            Some(signal) = signal_rx.recv() => {
                let restarting = matches!(signal, SessionSignal::Restarting { .. });
                if shared.session.apply(&signal) && restarting {
                    // A restart re-validates environment health.
                    let shared = Arc::clone(&shared);
                    tasks.spawn(async move {
                        shared.environment.check().await;
                    });
                }
            }

            Ok(()) = relay_rx.changed() => {
                let snapshot = relay_rx.borrow_and_update().clone();
                if snapshot.selected != selected {
                    selected = snapshot.selected.clone();
                    if let Some(relay) = snapshot.selected_relay() {
                        emit_event(&event_tx, LauncherEvent::RelaySelected(relay.clone()));
                    }
                }
                emit_event(&event_tx, LauncherEvent::RelaysUpdated(snapshot));
            }

            Ok(()) = env_rx.changed() => {
                let status = env_rx.borrow_and_update().clone();
                emit_event(&event_tx, LauncherEvent::EnvironmentChecked(status));
            }

            Ok(()) = session_rx.changed() => {
                let state = session_rx.borrow_and_update().clone();
                emit_event(&event_tx, LauncherEvent::SessionChanged(state));
            }

            progress = progress_rx.recv() => match progress {
                Ok(event) => emit_event(&event_tx, LauncherEvent::Provisioning(event)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "provisioning progress lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },

            Ok(notice) = slow_rx.recv() => {
                emit_event(&event_tx, LauncherEvent::SessionSlow(notice));
            }

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    warn!("launcher background task failed: {e}");
                }
            }
        }
    }

    tasks.shutdown().await;
    debug!("launcher loop exited");
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event to avoid blocking the loop.
fn emit_event(event_tx: &mpsc::Sender<LauncherEvent>, event: LauncherEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}
