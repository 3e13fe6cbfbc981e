#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared fakes for launch-readiness integration tests.
//!
//! Every collaborator the launcher talks to has a scripted stand-in here:
//! latency probes, archive sources, the extractor, the command runner and the
//! game client.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{watch, Notify};

use launch_readiness::config::{ArchiveLocation, EnvironmentConfig, ProbeConfig};
use launch_readiness::extract::ArchiveExtractor;
use launch_readiness::fetch::{sha256_hex, ArchiveSource, FetchError, FetchProgress};
use launch_readiness::game::{GameLauncher, GameProcess, LaunchRequest};
use launch_readiness::runner::{CommandOutput, CommandRunner, Invocation};
use launch_readiness::{
    Collaborators, LaunchError, LatencyProbe, LauncherConfig, PlatformKind, RelayDescriptor,
};

pub const RUNTIME_URL: &str = "https://downloads.test/wine-10.5.tar.zst";
pub const RUNTIME_BYTES: &[u8] = b"fake runtime archive";
pub const WEB_INSTALLER_BYTES: &[u8] = b"fake web installer";

// ── Config ──────────────────────────────────────────────────────────

/// Three relays: `slow` never answers, `mid` at 80 ms, `fast` at 30 ms.
pub fn test_relays() -> Vec<RelayDescriptor> {
    vec![
        RelayDescriptor::new("slow", "Slow", "slow.relay.test"),
        RelayDescriptor::new("mid", "Mid", "mid.relay.test"),
        RelayDescriptor::new("fast", "Fast", "fast.relay.test"),
    ]
}

/// A config rooted at `dir` with a fetchable runtime archive and short
/// probe timeouts.
pub fn test_config(dir: &Path) -> LauncherConfig {
    let environment = EnvironmentConfig {
        data_dir: dir.to_path_buf(),
        runtime_archive: Some(ArchiveLocation {
            url: RUNTIME_URL.to_string(),
            sha256: Some(sha256_hex(RUNTIME_BYTES)),
        }),
        helper_verbs: vec!["vcrun2022".into(), "corefonts".into()],
        ..EnvironmentConfig::default()
    };
    LauncherConfig::new()
        .with_relays(test_relays())
        .with_probe(ProbeConfig {
            timeout_ms: 1_000,
            port: 4000,
            ping_count: 2,
            ping_timeout_ms: 500,
        })
        .with_environment(environment)
}

/// Lay out a fully provisioned environment on disk.
pub fn seed_ready_environment(config: &EnvironmentConfig) {
    write_runtime_binaries(&config.runtime_dir(), &config.helper_name);
    std::fs::create_dir_all(config.web_component_path()).unwrap();
    std::fs::write(config.marker_path(), config.init_version.to_string()).unwrap();
}

fn write_runtime_binaries(runtime_dir: &Path, helper_name: &str) {
    let bin = runtime_dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    std::fs::write(bin.join("wine"), b"#!/bin/sh\n").unwrap();
    std::fs::write(bin.join("wineserver"), b"#!/bin/sh\n").unwrap();
    std::fs::write(bin.join(helper_name), b"#!/bin/sh\n").unwrap();
}

/// Fakes wired for `config`, reporting `platform`.
pub struct Fakes {
    pub probe: Arc<FakeProbe>,
    pub source: Arc<FakeArchiveSource>,
    pub extractor: Arc<FakeExtractor>,
    pub runner: Arc<FakeRunner>,
    pub game: Arc<FakeGame>,
}

impl Fakes {
    pub fn new(config: &LauncherConfig) -> Self {
        Self {
            probe: Arc::new(FakeProbe::standard()),
            source: Arc::new(FakeArchiveSource::standard(&config.environment)),
            extractor: Arc::new(FakeExtractor::new(&config.environment.helper_name)),
            runner: Arc::new(FakeRunner::new(&config.environment)),
            game: Arc::new(FakeGame::default()),
        }
    }

    pub fn collaborators(&self, platform: PlatformKind) -> Collaborators {
        Collaborators {
            probe: self.probe.clone(),
            source: self.source.clone(),
            extractor: self.extractor.clone(),
            runner: self.runner.clone(),
            game: self.game.clone(),
            platform,
        }
    }
}

// ── FakeProbe ───────────────────────────────────────────────────────

/// Answers each endpoint after a fixed delay. Unknown endpoints hang.
pub struct FakeProbe {
    answers: HashMap<String, (Duration, Option<u32>)>,
    pub calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new(answers: impl IntoIterator<Item = (&'static str, Duration, Option<u32>)>) -> Self {
        Self {
            answers: answers
                .into_iter()
                .map(|(endpoint, delay, latency)| (endpoint.to_string(), (delay, latency)))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// `mid` answers 80 ms after 80 ms, `fast` 30 ms after 30 ms, `slow` hangs.
    pub fn standard() -> Self {
        Self::new([
            ("mid.relay.test", Duration::from_millis(80), Some(80)),
            ("fast.relay.test", Duration::from_millis(30), Some(30)),
        ])
    }
}

#[async_trait]
impl LatencyProbe for FakeProbe {
    async fn probe(&self, endpoint: &str, _timeout: Duration) -> Option<u32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answers.get(endpoint) {
            Some((delay, latency)) => {
                tokio::time::sleep(*delay).await;
                *latency
            }
            None => std::future::pending().await,
        }
    }
}

// ── FakeArchiveSource ───────────────────────────────────────────────

/// Serves fixed bytes per URL and records every request.
pub struct FakeArchiveSource {
    files: HashMap<String, Vec<u8>>,
    pub requested: StdMutex<Vec<String>>,
}

impl FakeArchiveSource {
    pub fn new(files: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        Self {
            files: files.into_iter().collect(),
            requested: StdMutex::new(Vec::new()),
        }
    }

    /// The runtime archive and the web component installer.
    pub fn standard(config: &EnvironmentConfig) -> Self {
        Self::new([
            (RUNTIME_URL.to_string(), RUNTIME_BYTES.to_vec()),
            (config.web_component_url.clone(), WEB_INSTALLER_BYTES.to_vec()),
        ])
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveSource for FakeArchiveSource {
    async fn fetch(&self, url: &str, on_progress: FetchProgress<'_>) -> Result<Vec<u8>, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        let bytes = self
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Http(format!("404 for {url}")))?;
        let total = bytes.len() as u64;
        on_progress(total / 2, Some(total));
        on_progress(total, Some(total));
        Ok(bytes)
    }
}

// ── FakeExtractor ───────────────────────────────────────────────────

/// Writes runtime binaries instead of unpacking anything.
pub struct FakeExtractor {
    helper_name: String,
    pub extracted: StdMutex<Vec<PathBuf>>,
}

impl FakeExtractor {
    pub fn new(helper_name: &str) -> Self {
        Self {
            helper_name: helper_name.to_string(),
            extracted: StdMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ArchiveExtractor for FakeExtractor {
    async fn extract(&self, bytes: Vec<u8>, target: &Path) -> io::Result<()> {
        assert_eq!(bytes, RUNTIME_BYTES, "extractor received the wrong archive");
        write_runtime_binaries(target, &self.helper_name);
        self.extracted.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }
}

// ── FakeRunner ──────────────────────────────────────────────────────

/// Pretends to be the runtime and its helper.
///
/// - `--version` succeeds only for binaries under the managed runtime dir,
///   so a system install on the test machine is never picked up.
/// - `wineboot` creates the prefix.
/// - the web installer creates the web component directory.
///
/// Any invocation whose arguments contain a scripted failure tag fails.
pub struct FakeRunner {
    runtime_dir: PathBuf,
    web_component_path: PathBuf,
    version: StdMutex<String>,
    failures: StdMutex<HashSet<String>>,
    pub invocations: StdMutex<Vec<Invocation>>,
    hold_init: AtomicBool,
    pub init_entered: Notify,
    init_release: Notify,
}

impl FakeRunner {
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            runtime_dir: config.runtime_dir(),
            web_component_path: config.web_component_path(),
            version: StdMutex::new("wine-10.5".to_string()),
            failures: StdMutex::new(HashSet::new()),
            invocations: StdMutex::new(Vec::new()),
            hold_init: AtomicBool::new(false),
            init_entered: Notify::new(),
            init_release: Notify::new(),
        }
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock().unwrap() = version.to_string();
    }

    /// Make every invocation mentioning `tag` fail.
    pub fn fail_on(&self, tag: &str) {
        self.failures.lock().unwrap().insert(tag.to_string());
    }

    /// Park prefix initialization until [`release_init`](Self::release_init).
    pub fn hold_init(&self) {
        self.hold_init.store(true, Ordering::SeqCst);
    }

    pub fn release_init(&self) {
        self.hold_init.store(false, Ordering::SeqCst);
        self.init_release.notify_one();
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Arguments of every invocation, joined by spaces.
    pub fn command_lines(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(|inv| inv.args.join(" "))
            .collect()
    }

    fn scripted_failure(&self, invocation: &Invocation) -> bool {
        let failures = self.failures.lock().unwrap();
        invocation.args.iter().any(|a| failures.contains(a))
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: Invocation) -> io::Result<CommandOutput> {
        self.invocations.lock().unwrap().push(invocation.clone());
        let has = |arg: &str| invocation.args.iter().any(|a| a == arg);

        if self.scripted_failure(&invocation) {
            return Ok(CommandOutput::failed(1, "scripted failure"));
        }
        if has("--version") {
            if invocation.program.starts_with(&self.runtime_dir) {
                return Ok(CommandOutput::ok(format!(
                    "{}\n",
                    self.version.lock().unwrap()
                )));
            }
            return Ok(CommandOutput::failed(127, "not found"));
        }
        if has("wineboot") {
            if self.hold_init.load(Ordering::SeqCst) {
                self.init_entered.notify_one();
                self.init_release.notified().await;
            }
            if let Some(prefix) = invocation.env_value("WINEPREFIX") {
                std::fs::create_dir_all(Path::new(prefix).join("drive_c"))?;
            }
            return Ok(CommandOutput::ok(""));
        }
        if has("/silent") {
            std::fs::create_dir_all(&self.web_component_path)?;
            return Ok(CommandOutput::ok(""));
        }
        Ok(CommandOutput::ok(""))
    }
}

// ── FakeGame ────────────────────────────────────────────────────────

/// Records launch requests and hands out controllable processes.
#[derive(Default)]
pub struct FakeGame {
    pub requests: StdMutex<Vec<LaunchRequest>>,
    exits: StdMutex<Vec<watch::Sender<Option<Option<i32>>>>>,
    pub terminated: Arc<AtomicUsize>,
    fail: AtomicBool,
}

impl FakeGame {
    pub fn fail_next_start(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Make the most recently started process exit with `code`.
    pub fn exit_last(&self, code: Option<i32>) {
        let exits = self.exits.lock().unwrap();
        exits
            .last()
            .expect("no process started")
            .send_replace(Some(code));
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GameLauncher for FakeGame {
    async fn start(&self, request: &LaunchRequest) -> launch_readiness::Result<Box<dyn GameProcess>> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(LaunchError::ProcessStart("scripted start failure".into()));
        }
        self.requests.lock().unwrap().push(request.clone());
        let (tx, rx) = watch::channel(None);
        let mut exits = self.exits.lock().unwrap();
        exits.push(tx.clone());
        let pid = exits.len() as u32;
        Ok(Box::new(FakeProcess {
            pid,
            exit_tx: tx,
            exit_rx: rx,
            terminated: Arc::clone(&self.terminated),
        }))
    }
}

pub struct FakeProcess {
    pid: u32,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    terminated: Arc<AtomicUsize>,
}

#[async_trait]
impl GameProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn on_exit(&self) -> BoxFuture<'static, Option<i32>> {
        let mut rx = self.exit_rx.clone();
        async move {
            match rx.wait_for(Option::is_some).await {
                Ok(code) => (*code).flatten(),
                Err(_) => None,
            }
        }
        .boxed()
    }

    async fn terminate(&mut self) -> io::Result<()> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        self.exit_tx.send_replace(Some(None));
        Ok(())
    }
}
