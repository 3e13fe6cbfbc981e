#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! End-to-end behavior of the launcher handle.

mod common;

use std::path::Path;
use std::time::Duration;

use common::{seed_ready_environment, test_config, Fakes};
use launch_readiness::{
    DenyReason, ErrorCode, LaunchError, Launcher, LauncherConfig, LauncherEvent, PlatformKind,
    SessionSignal, SessionState,
};
use tokio::sync::{mpsc, watch};
use tokio_test::assert_ok;

struct Harness {
    launcher: Launcher,
    events: mpsc::Receiver<LauncherEvent>,
    fakes: Fakes,
    config: LauncherConfig,
}

fn start(dir: &Path, platform: PlatformKind) -> Harness {
    let config = test_config(dir);
    let fakes = Fakes::new(&config);
    let (launcher, events) = Launcher::start(config.clone(), fakes.collaborators(platform));
    Harness {
        launcher,
        events,
        fakes,
        config,
    }
}

/// Wait until the initial probe cycle picked a relay.
async fn wait_for_relay(launcher: &Launcher) {
    let mut rx = launcher.subscribe_relays();
    rx.wait_for(|s| s.ready && s.selected.is_some())
        .await
        .unwrap();
}

async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for session state")
        .unwrap();
}

/// Receive events until one matches `pred`.
async fn next_matching(
    events: &mut mpsc::Receiver<LauncherEvent>,
    pred: impl Fn(&LauncherEvent) -> bool,
) -> LauncherEvent {
    loop {
        let event = events.recv().await.expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

fn connected(server: &str) -> SessionSignal {
    SessionSignal::Connected {
        server: server.into(),
    }
}

// ── Gate ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn launch_is_denied_until_the_prefix_is_initialized() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Linux);
    wait_for_relay(&h.launcher).await;

    let err = h.launcher.request_launch("main", None).await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::LaunchDenied(DenyReason::EnvironmentNotReady)
    ));
    assert_eq!(err.code(), Some(ErrorCode::EnvironmentNotReady));
    assert_eq!(h.launcher.session_state(), SessionState::Idle);
    assert!(h.fakes.game.requests().is_empty());

    h.launcher.shutdown().await;
}

#[tokio::test]
async fn launch_is_denied_without_a_relay() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut fakes = Fakes::new(&config);
    // No relay ever answers.
    fakes.probe = std::sync::Arc::new(common::FakeProbe::new([
        ("slow.relay.test", Duration::ZERO, None),
        ("mid.relay.test", Duration::ZERO, None),
        ("fast.relay.test", Duration::ZERO, None),
    ]));
    let (mut launcher, _events) =
        Launcher::start(config, fakes.collaborators(PlatformKind::Windows));
    launcher.probe_relays().await;

    let err = launcher.request_launch("main", None).await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::LaunchDenied(DenyReason::NoRelaySelected)
    ));
    assert_eq!(launcher.session_state(), SessionState::Idle);

    launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ready_environment_and_relay_allow_launch() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Linux);
    seed_ready_environment(&h.config.environment);
    wait_for_relay(&h.launcher).await;

    assert_ok!(h.launcher.request_launch("main", Some("tok".into())).await);
    assert_eq!(
        h.launcher.session_state(),
        SessionState::Connecting {
            server: "main".into()
        }
    );

    let requests = h.fakes.game.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].server_name, "main");
    assert_eq!(requests[0].relay.id, "fast");
    assert_eq!(requests[0].auth_token.as_deref(), Some("tok"));

    h.launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pinned_relay_is_used_for_launch() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Windows);
    wait_for_relay(&h.launcher).await;
    h.launcher.select_relay("mid").unwrap();

    assert_ok!(h.launcher.request_launch("main", None).await);
    assert_eq!(h.fakes.game.requests()[0].relay.id, "mid");

    h.launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn launch_is_denied_while_a_reset_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Linux);
    seed_ready_environment(&h.config.environment);
    wait_for_relay(&h.launcher).await;
    assert!(h.launcher.check_status().await.prefix_initialized);
    h.fakes.runner.hold_init();

    {
        let reset = h.launcher.reset();
        tokio::pin!(reset);
        tokio::select! {
            _ = &mut reset => panic!("reset finished while prefix init was held"),
            () = h.fakes.runner.init_entered.notified() => {}
        }

        // The prefix is gone but the last published status still says ready.
        assert!(!h.config.environment.marker_path().exists());
        let err = h.launcher.request_launch("main", None).await.unwrap_err();
        assert!(matches!(
            err,
            LaunchError::LaunchDenied(DenyReason::EnvironmentNotReady)
        ));
        assert!(h.fakes.game.requests().is_empty());

        h.fakes.runner.release_init();
        assert!(assert_ok!(reset.await).succeeded());
    }

    assert_ok!(h.launcher.request_launch("main", None).await);
    assert_eq!(h.fakes.game.requests().len(), 1);

    h.launcher.shutdown().await;
}

// ── Session ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn backend_signals_drive_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Windows);
    wait_for_relay(&h.launcher).await;
    let mut state = h.launcher.subscribe_session();
    let signals = h.launcher.signal_sender();

    assert_ok!(h.launcher.request_launch("main", None).await);

    // A signal for another server is ignored.
    signals.send(connected("other")).unwrap();
    signals.send(connected("main")).unwrap();
    wait_for_state(
        &mut state,
        SessionState::Connected {
            server: "main".into(),
        },
    )
    .await;

    let err = h.launcher.request_launch("main", None).await.unwrap_err();
    assert!(matches!(err, LaunchError::SessionActive));
    assert_eq!(h.fakes.game.requests().len(), 1);

    signals
        .send(SessionSignal::Restarting {
            server: "main".into(),
            reason: Some("round end".into()),
        })
        .unwrap();
    wait_for_state(
        &mut state,
        SessionState::Restarting {
            server: "main".into(),
            reason: Some("round end".into()),
        },
    )
    .await;

    signals.send(connected("main")).unwrap();
    signals.send(SessionSignal::Closed { reason: None }).unwrap();
    wait_for_state(&mut state, SessionState::Idle).await;

    h.launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_signals_emit_one_event() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Windows);
    wait_for_relay(&h.launcher).await;
    let signals = h.launcher.signal_sender();
    let is_session = |e: &LauncherEvent| matches!(e, LauncherEvent::SessionChanged(_));

    assert_ok!(h.launcher.request_launch("main", None).await);
    let event = next_matching(&mut h.events, is_session).await;
    assert!(matches!(
        event,
        LauncherEvent::SessionChanged(SessionState::Connecting { .. })
    ));

    signals.send(connected("main")).unwrap();
    let event = next_matching(&mut h.events, is_session).await;
    assert!(matches!(
        event,
        LauncherEvent::SessionChanged(SessionState::Connected { .. })
    ));

    // The repeat changes nothing, so the next session event is the close.
    signals.send(connected("main")).unwrap();
    signals.send(SessionSignal::Closed { reason: None }).unwrap();
    let event = next_matching(&mut h.events, is_session).await;
    assert!(matches!(
        event,
        LauncherEvent::SessionChanged(SessionState::Idle)
    ));

    h.launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restart_rechecks_the_environment() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Linux);
    seed_ready_environment(&h.config.environment);
    wait_for_relay(&h.launcher).await;
    let signals = h.launcher.signal_sender();

    assert_ok!(h.launcher.request_launch("main", None).await);
    signals.send(connected("main")).unwrap();
    let mut state = h.launcher.subscribe_session();
    wait_for_state(
        &mut state,
        SessionState::Connected {
            server: "main".into(),
        },
    )
    .await;

    let mut env = h.launcher.subscribe_environment();
    env.borrow_and_update();
    signals
        .send(SessionSignal::Restarting {
            server: "main".into(),
            reason: None,
        })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), env.changed())
        .await
        .expect("restart did not trigger an environment check")
        .unwrap();
    assert!(env.borrow().prefix_initialized);

    h.launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn process_exit_returns_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Windows);
    wait_for_relay(&h.launcher).await;
    let mut state = h.launcher.subscribe_session();

    assert_ok!(h.launcher.request_launch("main", None).await);
    h.fakes.game.exit_last(Some(0));
    wait_for_state(&mut state, SessionState::Idle).await;

    // A new session can start right away.
    assert_ok!(h.launcher.request_launch("main", None).await);
    assert_eq!(h.fakes.game.requests().len(), 2);

    h.launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_close_terminates_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Windows);
    wait_for_relay(&h.launcher).await;
    let signals = h.launcher.signal_sender();

    assert_ok!(h.launcher.request_launch("main", None).await);
    signals.send(connected("main")).unwrap();
    h.launcher.force_close().await;

    assert_eq!(h.launcher.session_state(), SessionState::Idle);
    assert_eq!(h.fakes.game.terminated(), 1);

    h.launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_client_start_leaves_session_idle() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Windows);
    wait_for_relay(&h.launcher).await;
    h.fakes.game.fail_next_start();

    let err = h.launcher.request_launch("main", None).await.unwrap_err();
    assert!(matches!(err, LaunchError::ProcessStart(_)));
    assert_eq!(h.launcher.session_state(), SessionState::Idle);

    h.launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_connect_emits_one_notice() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Windows);
    wait_for_relay(&h.launcher).await;

    assert_ok!(h.launcher.request_launch("main", None).await);
    let event = next_matching(&mut h.events, |e| {
        matches!(e, LauncherEvent::SessionSlow(_))
    })
    .await;
    let LauncherEvent::SessionSlow(notice) = event else {
        unreachable!()
    };
    assert_eq!(notice.server, "main");
    assert_eq!(notice.waited, h.config.session.slow_after());
    // Slowness never changes state.
    assert_eq!(
        h.launcher.session_state(),
        SessionState::Connecting {
            server: "main".into()
        }
    );

    h.launcher.shutdown().await;
}

// ── Provision then launch ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn provision_and_launch_repairs_then_starts() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Linux);
    wait_for_relay(&h.launcher).await;

    assert_ok!(h.launcher.provision_and_launch("main", None).await);
    assert!(h.launcher.environment().prefix_initialized);
    assert_eq!(h.fakes.game.requests().len(), 1);

    let terminal = next_matching(&mut h.events, |e| {
        matches!(e, LauncherEvent::Provisioning(p) if p.is_terminal())
    })
    .await;
    let LauncherEvent::Provisioning(progress) = terminal else {
        unreachable!()
    };
    assert!(progress.succeeded());

    h.launcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_provisioning_denies_the_launch() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Linux);
    wait_for_relay(&h.launcher).await;
    h.fakes.runner.fail_on("wineboot");

    let err = h
        .launcher
        .provision_and_launch("main", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LaunchError::LaunchDenied(DenyReason::EnvironmentNotReady)
    ));
    assert!(h.fakes.game.requests().is_empty());

    h.launcher.shutdown().await;
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_event_channel() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = start(dir.path(), PlatformKind::Windows);
    h.launcher.shutdown().await;

    while h.events.recv().await.is_some() {}
    let err = h
        .launcher
        .signal_sender()
        .send(connected("main"))
        .unwrap_err();
    assert!(matches!(err, LaunchError::Io(_)));
}
