//! Game session connection state machine.
//!
//! ```text
//! Idle --launch--> Connecting(s) --connected(s)--> Connected(s)
//! Connected(s) --restarting(s)--> Restarting(s) --connected(s)--> Connected(s)
//! Connecting | Connected | Restarting --closed--> Idle
//! any --force close--> Idle
//! ```
//!
//! Signals that do not match the current state, including ones naming a
//! different server, are ignored. Identical repeats change nothing and emit
//! nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::{LaunchError, Result};
use crate::game::GameProcess;

/// Where the current game session stands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting {
        server: String,
    },
    Connected {
        server: String,
    },
    Restarting {
        server: String,
        reason: Option<String>,
    },
}

impl SessionState {
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Connecting { server }
            | Self::Connected { server }
            | Self::Restarting { server, .. } => Some(server),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// States that should resolve on their own and are timed.
    fn is_pending(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Restarting { .. })
    }
}

/// Lifecycle reports from the game backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SessionSignal {
    Connecting { server: String },
    Connected { server: String },
    Restarting { server: String, reason: Option<String> },
    Closed { reason: Option<String> },
}

/// The state `signal` moves `current` to, or `None` when it is ignored.
pub fn next_state(current: &SessionState, signal: &SessionSignal) -> Option<SessionState> {
    use SessionSignal as Sig;
    use SessionState as St;

    match (current, signal) {
        (St::Connecting { server }, Sig::Connected { server: s })
        | (St::Restarting { server, .. }, Sig::Connected { server: s })
            if server == s =>
        {
            Some(St::Connected { server: s.clone() })
        }
        (St::Connected { server }, Sig::Restarting { server: s, reason }) if server == s => {
            Some(St::Restarting {
                server: s.clone(),
                reason: reason.clone(),
            })
        }
        (St::Connecting { .. } | St::Connected { .. } | St::Restarting { .. }, Sig::Closed { .. }) => {
            Some(St::Idle)
        }
        _ => None,
    }
}

/// Emitted once per connecting or restarting episode that outlives the
/// configured timeout. Never changes state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowSession {
    pub server: String,
    pub state: SessionState,
    pub waited: Duration,
}

struct ActiveProcess {
    session_id: u64,
    process: Box<dyn GameProcess>,
}

struct Inner {
    state: watch::Sender<SessionState>,
    slow: broadcast::Sender<SlowSession>,
    slow_after: Duration,
    episode: AtomicU64,
    next_session: AtomicU64,
    current_session: AtomicU64,
    process: Mutex<Option<ActiveProcess>>,
}

/// Owns the session state and the game process handle.
#[derive(Clone)]
pub struct SessionMonitor {
    inner: Arc<Inner>,
}

impl SessionMonitor {
    pub fn new(slow_after: Duration) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (slow, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                state,
                slow,
                slow_after,
                episode: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
                current_session: AtomicU64::new(0),
                process: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_slow(&self) -> broadcast::Receiver<SlowSession> {
        self.inner.slow.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Move `Idle -> Connecting(server)` for an accepted launch.
    ///
    /// Returns the new session id.
    ///
    /// # Errors
    ///
    /// [`LaunchError::SessionActive`] when a session is already underway.
    pub fn begin(&self, server: &str) -> Result<u64> {
        let next = SessionState::Connecting {
            server: server.to_string(),
        };
        let accepted = self.inner.state.send_if_modified(|state| {
            if state.is_idle() {
                *state = next.clone();
                true
            } else {
                false
            }
        });
        if !accepted {
            return Err(LaunchError::SessionActive);
        }
        let session_id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner.current_session.store(session_id, Ordering::SeqCst);
        tracing::info!(server = %server, session = session_id, "session connecting");
        self.entered(&next);
        Ok(session_id)
    }

    /// Hand over the process started for `session_id` and watch for its exit.
    ///
    /// If the session already ended the process is terminated right away.
    pub async fn attach(&self, session_id: u64, mut process: Box<dyn GameProcess>) {
        if self.inner.current_session.load(Ordering::SeqCst) != session_id || self.state().is_idle() {
            tracing::debug!(session = session_id, "session ended before its process attached");
            if let Err(e) = process.terminate().await {
                tracing::warn!(error = %e, "failed to terminate orphaned game process");
            }
            return;
        }

        let exited = process.on_exit();
        if let Ok(mut slot) = self.inner.process.lock() {
            *slot = Some(ActiveProcess {
                session_id,
                process,
            });
        }

        let monitor = self.clone();
        tokio::spawn(async move {
            let code = exited.await;
            monitor.process_exited(session_id, code);
        });
    }

    /// Abort a session whose process never started.
    pub fn abort(&self, session_id: u64) {
        if self.inner.current_session.load(Ordering::SeqCst) == session_id {
            self.apply(&SessionSignal::Closed {
                reason: Some("process failed to start".into()),
            });
        }
    }

    /// The process-lifecycle watcher saw `session_id`'s process exit.
    pub fn process_exited(&self, session_id: u64, code: Option<i32>) {
        if self.inner.current_session.load(Ordering::SeqCst) != session_id {
            tracing::debug!(session = session_id, "ignoring exit of a stale session process");
            return;
        }
        tracing::info!(session = session_id, code = ?code, "game process exited");
        self.apply(&SessionSignal::Closed {
            reason: Some(format!("process exited ({code:?})")),
        });
    }

    /// Apply a backend signal. Returns whether the state changed.
    pub fn apply(&self, signal: &SessionSignal) -> bool {
        let mut entered = None;
        let changed = self.inner.state.send_if_modified(|state| {
            match next_state(state, signal) {
                Some(next) if next != *state => {
                    entered = Some(next.clone());
                    *state = next;
                    true
                }
                _ => false,
            }
        });
        match entered {
            Some(next) => {
                tracing::info!(signal = ?signal, state = ?next, "session transition");
                self.entered(&next);
            }
            None => tracing::debug!(signal = ?signal, "session signal ignored"),
        }
        changed
    }

    /// Terminate the game process, if any, and return to `Idle`.
    pub async fn force_close(&self) {
        let active = self.inner.process.lock().ok().and_then(|mut slot| slot.take());
        if let Some(mut active) = active {
            tracing::info!(session = active.session_id, pid = ?active.process.pid(), "terminating game process");
            if let Err(e) = active.process.terminate().await {
                tracing::warn!(error = %e, "failed to terminate game process");
            }
        }
        self.inner.current_session.store(0, Ordering::SeqCst);
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_idle() {
                false
            } else {
                *state = SessionState::Idle;
                true
            }
        });
        if changed {
            tracing::info!("session force closed");
        }
        self.entered(&SessionState::Idle);
    }

    /// Start a new episode for `state`, arming the slow timer when it is pending.
    fn entered(&self, state: &SessionState) {
        let episode = self.inner.episode.fetch_add(1, Ordering::SeqCst) + 1;
        if state.is_idle() {
            if let Ok(mut slot) = self.inner.process.lock() {
                slot.take();
            }
            return;
        }
        if !state.is_pending() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.slow_after).await;
            if inner.episode.load(Ordering::SeqCst) != episode {
                return;
            }
            let state = inner.state.borrow().clone();
            if let (true, Some(server)) = (state.is_pending(), state.server()) {
                tracing::warn!(server = %server, waited = ?inner.slow_after, "session is taking longer than expected");
                let _ = inner.slow.send(SlowSession {
                    server: server.to_string(),
                    state: state.clone(),
                    waited: inner.slow_after,
                });
            }
        });
    }
}

impl std::fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("state", &*self.inner.state.borrow())
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

    fn connected(s: &str) -> SessionSignal {
        SessionSignal::Connected { server: s.into() }
    }

    #[test]
    fn transition_table() {
        let connecting = SessionState::Connecting { server: "a".into() };
        let connected_a = SessionState::Connected { server: "a".into() };
        let restarting = SessionState::Restarting {
            server: "a".into(),
            reason: Some("update".into()),
        };

        assert_eq!(next_state(&connecting, &connected("a")), Some(connected_a.clone()));
        assert_eq!(
            next_state(
                &connected_a,
                &SessionSignal::Restarting {
                    server: "a".into(),
                    reason: Some("update".into())
                }
            ),
            Some(restarting.clone())
        );
        assert_eq!(next_state(&restarting, &connected("a")), Some(connected_a.clone()));
        for state in [&connecting, &connected_a, &restarting] {
            assert_eq!(
                next_state(state, &SessionSignal::Closed { reason: None }),
                Some(SessionState::Idle)
            );
        }
    }

    #[test]
    fn unlisted_and_mismatched_signals_are_ignored() {
        let idle = SessionState::Idle;
        assert_eq!(next_state(&idle, &connected("a")), None);
        assert_eq!(next_state(&idle, &SessionSignal::Closed { reason: None }), None);

        let connecting = SessionState::Connecting { server: "a".into() };
        assert_eq!(next_state(&connecting, &connected("b")), None);
        assert_eq!(
            next_state(
                &connecting,
                &SessionSignal::Restarting {
                    server: "a".into(),
                    reason: None
                }
            ),
            None
        );
        assert_eq!(
            next_state(&connecting, &SessionSignal::Connecting { server: "a".into() }),
            None
        );
    }

    #[tokio::test]
    async fn duplicate_connected_emits_nothing() {
        let monitor = SessionMonitor::new(Duration::from_secs(30));
        monitor.begin("a").unwrap();
        assert!(monitor.apply(&connected("a")));

        let mut rx = monitor.subscribe();
        rx.borrow_and_update();
        assert!(!monitor.apply(&connected("a")));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(monitor.state(), SessionState::Connected { server: "a".into() });
    }

    #[tokio::test]
    async fn second_launch_is_rejected() {
        let monitor = SessionMonitor::new(Duration::from_secs(30));
        monitor.begin("a").unwrap();
        assert!(matches!(monitor.begin("b"), Err(LaunchError::SessionActive)));
    }

    #[tokio::test]
    async fn force_close_returns_to_idle() {
        let monitor = SessionMonitor::new(Duration::from_secs(30));
        monitor.begin("a").unwrap();
        monitor.force_close().await;
        assert!(monitor.state().is_idle());
        monitor.begin("b").unwrap();
    }

    #[tokio::test]
    async fn stale_process_exit_is_ignored() {
        let monitor = SessionMonitor::new(Duration::from_secs(30));
        let first = monitor.begin("a").unwrap();
        monitor.force_close().await;
        let second = monitor.begin("b").unwrap();
        assert_ne!(first, second);

        monitor.process_exited(first, Some(0));
        assert_eq!(monitor.state(), SessionState::Connecting { server: "b".into() });
        monitor.process_exited(second, Some(0));
        assert!(monitor.state().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_notice_fires_once_per_episode() {
        let monitor = SessionMonitor::new(Duration::from_secs(30));
        let mut slow = monitor.subscribe_slow();
        monitor.begin("a").unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        let notice = slow.recv().await.unwrap();
        assert_eq!(notice.server, "a");
        assert_eq!(monitor.state(), SessionState::Connecting { server: "a".into() });

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(matches!(
            slow.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_connecting_cancels_the_slow_notice() {
        let monitor = SessionMonitor::new(Duration::from_secs(30));
        let mut slow = monitor.subscribe_slow();
        monitor.begin("a").unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        monitor.apply(&connected("a"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(matches!(
            slow.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
