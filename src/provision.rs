//! Multi-stage environment provisioning.
//!
//! A run walks a fixed phase sequence:
//!
//! ```text
//! NotStarted -> Fetching -> Unpacking -> InitializingPrefix -> InstallingAuxComponent -> Verifying -> Complete
//! ```
//!
//! A run opens with a `NotStarted` event. Every phase emits an entry event, even when it has nothing to do, so
//! observers always see the full ordering. Any phase may end the run with an
//! `Error` event carrying an [`ErrorCode`]. The phase engine ([`run_stages`])
//! is shared with the offline bundle builder; what each phase does is up to
//! the [`StageDriver`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::environment::{EnvironmentProbe, PrefixLock};
use crate::error::{LaunchError, Result, StageFailure};
use crate::error_codes::ErrorCode;
use crate::extract::ArchiveExtractor;
use crate::fetch::ArchiveSource;
use crate::install::RuntimeInstallDriver;
use crate::runner::CommandRunner;

/// Capacity of the progress broadcast channel.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 64;

// ── Progress model ──────────────────────────────────────────────────

/// Coarse state of a run, as shown to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    InProgress,
    Complete,
    Error,
}

/// The phase that produced a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningPhase {
    NotStarted,
    Fetching,
    Unpacking,
    InitializingPrefix,
    InstallingAuxComponent,
    Verifying,
    Complete,
}

impl ProvisioningPhase {
    /// Phases a run executes, in order.
    pub const SEQUENCE: [Self; 5] = [
        Self::Fetching,
        Self::Unpacking,
        Self::InitializingPrefix,
        Self::InstallingAuxComponent,
        Self::Verifying,
    ];

    fn entry_message(self) -> &'static str {
        match self {
            Self::NotStarted => "Waiting to start",
            Self::Fetching => "Fetching runtime",
            Self::Unpacking => "Unpacking runtime",
            Self::InitializingPrefix => "Creating environment",
            Self::InstallingAuxComponent => "Installing components",
            Self::Verifying => "Verifying environment",
            Self::Complete => "Environment ready",
        }
    }
}

/// One progress event of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningProgress {
    /// Shared by every event of one run.
    pub run_id: Uuid,
    pub stage: ProgressStage,
    pub phase: ProvisioningPhase,
    /// Completion within the current phase, 0 to 100.
    pub percent: u8,
    pub message: String,
    pub error_code: Option<ErrorCode>,
}

impl ProvisioningProgress {
    pub fn in_progress(
        run_id: Uuid,
        phase: ProvisioningPhase,
        percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            stage: ProgressStage::InProgress,
            phase,
            percent: percent.min(100),
            message: message.into(),
            error_code: None,
        }
    }

    pub fn complete(run_id: Uuid) -> Self {
        Self {
            run_id,
            stage: ProgressStage::Complete,
            phase: ProvisioningPhase::Complete,
            percent: 100,
            message: ProvisioningPhase::Complete.entry_message().to_string(),
            error_code: None,
        }
    }

    pub fn failed(run_id: Uuid, phase: ProvisioningPhase, failure: &StageFailure) -> Self {
        Self {
            run_id,
            stage: ProgressStage::Error,
            phase,
            percent: 0,
            message: failure.message.clone(),
            error_code: Some(failure.code),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage != ProgressStage::InProgress
    }

    pub fn succeeded(&self) -> bool {
        self.stage == ProgressStage::Complete
    }
}

// ── Phase engine ────────────────────────────────────────────────────

/// Sink for progress events.
pub type ProgressEmitter<'a> = &'a (dyn Fn(ProvisioningProgress) + Send + Sync);

/// Handed to a [`StageDriver`] so it can report sub-step progress.
pub struct StageReporter<'a> {
    run_id: Uuid,
    phase: ProvisioningPhase,
    emit: ProgressEmitter<'a>,
    abandon: &'a AtomicBool,
    last_percent: AtomicU8,
}

impl<'a> StageReporter<'a> {
    fn new(
        run_id: Uuid,
        phase: ProvisioningPhase,
        emit: ProgressEmitter<'a>,
        abandon: &'a AtomicBool,
    ) -> Self {
        Self {
            run_id,
            phase,
            emit,
            abandon,
            last_percent: AtomicU8::new(0),
        }
    }

    pub fn phase(&self) -> ProvisioningPhase {
        self.phase
    }

    /// Report progress within the current phase. Percent never goes backwards.
    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        let percent = percent.min(100).max(self.last_percent.load(Ordering::Relaxed));
        self.last_percent.store(percent, Ordering::Relaxed);
        (self.emit)(ProvisioningProgress::in_progress(
            self.run_id,
            self.phase,
            percent,
            message,
        ));
    }

    /// Report progress only when the percentage moved.
    pub fn progress_if_changed(&self, percent: u8, message: impl Into<String>) {
        if percent.min(100) > self.last_percent.load(Ordering::Relaxed) {
            self.progress(percent, message);
        }
    }

    /// Whether the run was asked to stop. Drivers check this between sub-steps.
    pub fn abandon_requested(&self) -> bool {
        self.abandon.load(Ordering::SeqCst)
    }

    /// Fail with [`ErrorCode::Abandoned`] when the run was asked to stop.
    pub fn checkpoint(&self) -> std::result::Result<(), StageFailure> {
        if self.abandon_requested() {
            return Err(abandoned());
        }
        Ok(())
    }
}

fn abandoned() -> StageFailure {
    StageFailure::new(ErrorCode::Abandoned, "abandoned")
}

/// Does the work of each phase.
#[async_trait]
pub trait StageDriver: Send {
    /// Run one phase to completion.
    async fn run_phase(
        &mut self,
        phase: ProvisioningPhase,
        reporter: &StageReporter<'_>,
    ) -> std::result::Result<(), StageFailure>;
}

/// Drive `driver` through every phase and return the terminal event.
///
/// Abandonment is honored only between phases; a driver may also stop at its
/// own sub-step boundaries through [`StageReporter::checkpoint`].
pub async fn run_stages(
    driver: &mut dyn StageDriver,
    run_id: Uuid,
    abandon: &AtomicBool,
    emit: ProgressEmitter<'_>,
) -> ProvisioningProgress {
    emit(ProvisioningProgress::in_progress(
        run_id,
        ProvisioningPhase::NotStarted,
        0,
        ProvisioningPhase::NotStarted.entry_message(),
    ));

    for phase in ProvisioningPhase::SEQUENCE {
        if abandon.load(Ordering::SeqCst) {
            let terminal = ProvisioningProgress::failed(run_id, phase, &abandoned());
            tracing::info!(run = %run_id, phase = ?phase, "provisioning abandoned");
            emit(terminal.clone());
            return terminal;
        }

        tracing::debug!(run = %run_id, phase = ?phase, "entering phase");
        emit(ProvisioningProgress::in_progress(
            run_id,
            phase,
            0,
            phase.entry_message(),
        ));

        let reporter = StageReporter::new(run_id, phase, emit, abandon);
        if let Err(failure) = driver.run_phase(phase, &reporter).await {
            tracing::warn!(
                run = %run_id,
                phase = ?phase,
                code = ?failure.code,
                error = %failure.message,
                "provisioning failed"
            );
            let terminal = ProvisioningProgress::failed(run_id, phase, &failure);
            emit(terminal.clone());
            return terminal;
        }
    }

    tracing::info!(run = %run_id, "provisioning complete");
    let terminal = ProvisioningProgress::complete(run_id);
    emit(terminal.clone());
    terminal
}

// ── Provisioner ─────────────────────────────────────────────────────

/// External collaborators a provisioning run uses.
#[derive(Clone)]
pub struct ProvisioningTools {
    pub source: Arc<dyn ArchiveSource>,
    pub extractor: Arc<dyn ArchiveExtractor>,
    pub runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for ProvisioningTools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningTools").finish_non_exhaustive()
    }
}

/// Clears the in-flight flag and the current-progress view when a run ends.
struct RunGuard<'a> {
    running: &'a AtomicBool,
    current: &'a watch::Sender<Option<ProvisioningProgress>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.current.send_replace(None);
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Sets up and repairs the compatibility environment. At most one run is
/// active at a time.
pub struct EnvironmentProvisioner {
    probe: Arc<EnvironmentProbe>,
    tools: ProvisioningTools,
    lock: PrefixLock,
    running: AtomicBool,
    abandon: AtomicBool,
    progress: broadcast::Sender<ProvisioningProgress>,
    current: watch::Sender<Option<ProvisioningProgress>>,
}

impl EnvironmentProvisioner {
    pub fn new(probe: Arc<EnvironmentProbe>, tools: ProvisioningTools, lock: PrefixLock) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let (current, _) = watch::channel(None);
        Self {
            probe,
            tools,
            lock,
            running: AtomicBool::new(false),
            abandon: AtomicBool::new(false),
            progress,
            current,
        }
    }

    /// Every progress event of every run.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProvisioningProgress> {
        self.progress.subscribe()
    }

    /// Latest event of the active run, `None` when idle.
    pub fn watch_current(&self) -> watch::Receiver<Option<ProvisioningProgress>> {
        self.current.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the active run to stop at its next safe point.
    ///
    /// Returns `false` when nothing is running.
    pub fn abandon(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        tracing::info!("provisioning abandon requested");
        self.abandon.store(true, Ordering::SeqCst);
        true
    }

    /// Bring the environment up to a launchable state.
    ///
    /// # Errors
    ///
    /// [`LaunchError::AlreadyProvisioning`] while another run is active and
    /// [`LaunchError::UnsupportedPlatform`] where no runtime is used. Phase
    /// failures are reported in the returned terminal event, not as errors.
    pub async fn provision(&self) -> Result<ProvisioningProgress> {
        self.start(false).await
    }

    /// Destroy the prefix, then provision from scratch.
    pub async fn reset(&self) -> Result<ProvisioningProgress> {
        self.start(true).await
    }

    async fn start(&self, reset: bool) -> Result<ProvisioningProgress> {
        let platform = self.probe.platform();
        if !platform.needs_compat_runtime() {
            return Err(LaunchError::UnsupportedPlatform(platform.to_string()));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LaunchError::AlreadyProvisioning);
        }
        let _run = RunGuard {
            running: &self.running,
            current: &self.current,
        };
        self.abandon.store(false, Ordering::SeqCst);

        let run_id = Uuid::new_v4();
        let emit = |event: ProvisioningProgress| {
            self.current.send_replace(Some(event.clone()));
            // No subscribers is fine.
            let _ = self.progress.send(event);
        };
        tracing::info!(run = %run_id, reset, "provisioning started");

        let outcome = {
            let _prefix = self.lock.write().await;
            match self.prepare(reset).await {
                Ok(()) => {
                    let mut driver = RuntimeInstallDriver::new(
                        self.probe.config().clone(),
                        self.tools.clone(),
                        Arc::clone(&self.probe),
                    );
                    run_stages(&mut driver, run_id, &self.abandon, &emit).await
                }
                Err(failure) => {
                    let terminal =
                        ProvisioningProgress::failed(run_id, ProvisioningPhase::NotStarted, &failure);
                    emit(terminal.clone());
                    terminal
                }
            }
        };

        self.probe.check().await;
        Ok(outcome)
    }

    async fn prepare(&self, reset: bool) -> std::result::Result<(), StageFailure> {
        if !reset {
            return Ok(());
        }
        let prefix = self.probe.config().prefix_dir();
        tracing::info!(prefix = %prefix.display(), "removing prefix for reset");
        match tokio::fs::remove_dir_all(&prefix).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StageFailure::new(
                ErrorCode::Io,
                format!("failed to remove {}: {e}", prefix.display()),
            )),
        }
    }
}

impl std::fmt::Debug for EnvironmentProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentProvisioner")
            .field("running", &self.is_running())
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
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedDriver {
        fail_at: Option<ProvisioningPhase>,
        abandon_after: Option<(ProvisioningPhase, Arc<AtomicBool>)>,
        ran: Vec<ProvisioningPhase>,
    }

    #[async_trait]
    impl StageDriver for ScriptedDriver {
        async fn run_phase(
            &mut self,
            phase: ProvisioningPhase,
            reporter: &StageReporter<'_>,
        ) -> std::result::Result<(), StageFailure> {
            self.ran.push(phase);
            reporter.progress(50, "halfway");
            reporter.progress(20, "not backwards");
            if let Some((at, flag)) = &self.abandon_after {
                if *at == phase {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            if self.fail_at == Some(phase) {
                return Err(StageFailure::new(ErrorCode::PrefixInitFailed, "boom"));
            }
            Ok(())
        }
    }

    fn collect() -> (Arc<Mutex<Vec<ProvisioningProgress>>>, impl Fn(ProvisioningProgress) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |e| sink.lock().unwrap().push(e))
    }

    #[tokio::test]
    async fn every_phase_emits_entry_then_complete() {
        let (events, emit) = collect();
        let mut driver = ScriptedDriver::default();
        let terminal = run_stages(&mut driver, Uuid::new_v4(), &AtomicBool::new(false), &emit).await;

        assert!(terminal.succeeded());
        assert_eq!(driver.ran, ProvisioningPhase::SEQUENCE.to_vec());
        let events = events.lock().unwrap();
        let entries: Vec<_> = events
            .iter()
            .filter(|e| e.percent == 0 && e.stage == ProgressStage::InProgress)
            .map(|e| e.phase)
            .collect();
        let mut expected = vec![ProvisioningPhase::NotStarted];
        expected.extend(ProvisioningPhase::SEQUENCE);
        assert_eq!(entries, expected);
        assert_eq!(events.first().unwrap().phase, ProvisioningPhase::NotStarted);
        assert_eq!(events.last().unwrap().phase, ProvisioningPhase::Complete);
        assert!(events.iter().all(|e| e.run_id == terminal.run_id));
    }

    #[tokio::test]
    async fn percent_never_regresses_within_a_phase() {
        let (events, emit) = collect();
        run_stages(&mut ScriptedDriver::default(), Uuid::new_v4(), &AtomicBool::new(false), &emit)
            .await;
        let events = events.lock().unwrap();
        let fetching: Vec<u8> = events
            .iter()
            .filter(|e| e.phase == ProvisioningPhase::Fetching)
            .map(|e| e.percent)
            .collect();
        assert_eq!(fetching, vec![0, 50, 50]);
    }

    #[tokio::test]
    async fn failure_stops_the_sequence() {
        let (events, emit) = collect();
        let mut driver = ScriptedDriver {
            fail_at: Some(ProvisioningPhase::InitializingPrefix),
            ..ScriptedDriver::default()
        };
        let terminal = run_stages(&mut driver, Uuid::new_v4(), &AtomicBool::new(false), &emit).await;

        assert_eq!(terminal.stage, ProgressStage::Error);
        assert_eq!(terminal.phase, ProvisioningPhase::InitializingPrefix);
        assert_eq!(terminal.error_code, Some(ErrorCode::PrefixInitFailed));
        assert_eq!(driver.ran.len(), 3);
        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.stage == ProgressStage::Complete));
    }

    #[tokio::test]
    async fn abandon_takes_effect_at_the_next_boundary() {
        let (_events, emit) = collect();
        let flag = Arc::new(AtomicBool::new(false));
        let mut driver = ScriptedDriver {
            abandon_after: Some((ProvisioningPhase::Unpacking, Arc::clone(&flag))),
            ..ScriptedDriver::default()
        };
        let terminal = run_stages(&mut driver, Uuid::new_v4(), &flag, &emit).await;

        assert_eq!(driver.ran.last(), Some(&ProvisioningPhase::Unpacking));
        assert_eq!(terminal.phase, ProvisioningPhase::InitializingPrefix);
        assert_eq!(terminal.error_code, Some(ErrorCode::Abandoned));
        assert_eq!(terminal.message, "abandoned");
    }

    #[test]
    fn progress_serializes_snake_case() {
        let event = ProvisioningProgress::in_progress(
            Uuid::nil(),
            ProvisioningPhase::InstallingAuxComponent,
            140,
            "x",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "in_progress");
        assert_eq!(json["phase"], "installing_aux_component");
        assert_eq!(json["percent"], 100);
    }
}
