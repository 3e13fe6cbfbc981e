//! Relay latency probing, ranking and selection.
//!
//! [`RelaySelector`] fans one probe out per configured relay and publishes
//! partial results as they land. The fastest answer so far is selected as
//! soon as it arrives, so a ready snapshot always carries a selection; the
//! final ranking settles it when the cycle completes. A user selection made
//! with [`RelaySelector::select`] is sticky and survives later probe cycles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::config::ProbeConfig;
use crate::error::{LaunchError, Result};
use crate::probe::LatencyProbe;

/// A relay the client can connect through. Configured once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub id: String,
    pub display_name: String,
    /// Host name of the relay.
    pub endpoint: String,
}

impl RelayDescriptor {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// The built-in relay set.
pub fn default_relays() -> Vec<RelayDescriptor> {
    [
        ("direct", "Direct", "direct.cm-ss13.com"),
        ("nyc", "NYC", "nyc.cm-ss13.com"),
        ("uk", "UK", "uk.cm-ss13.com"),
        ("eu-e", "EU East", "eu-e.cm-ss13.com"),
        ("eu-w", "EU West", "eu-w.cm-ss13.com"),
        ("aus", "Australia", "aus.cm-ss13.com"),
        ("us-e", "US East", "us-e.cm-ss13.com"),
        ("us-w", "US West", "us-w.cm-ss13.com"),
        ("asia-se", "SE Asia", "asia-se.cm-ss13.com"),
    ]
    .into_iter()
    .map(|(id, name, host)| RelayDescriptor::new(id, name, host))
    .collect()
}

/// Outcome of probing one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProbeResult {
    pub relay_id: String,
    /// Mean round trip. `None` while pending or after a failure.
    pub latency_millis: Option<u32>,
    /// Whether the probe for this relay is still outstanding.
    pub probing: bool,
}

impl RelayProbeResult {
    pub fn pending(relay_id: impl Into<String>) -> Self {
        Self {
            relay_id: relay_id.into(),
            latency_millis: None,
            probing: true,
        }
    }

    pub fn resolved(relay_id: impl Into<String>, latency_millis: Option<u32>) -> Self {
        Self {
            relay_id: relay_id.into(),
            latency_millis,
            probing: false,
        }
    }

    /// A measured, settled latency.
    pub fn measured(&self) -> Option<u32> {
        if self.probing {
            None
        } else {
            self.latency_millis
        }
    }
}

/// A probe result joined with its relay, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntry {
    pub relay: RelayDescriptor,
    pub result: RelayProbeResult,
}

/// Everything the UI needs to render the relay picker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySnapshot {
    /// Ranked entries, fastest first.
    pub entries: Vec<RelayEntry>,
    /// Set once any relay answered; never cleared.
    pub ready: bool,
    /// Id of the selected relay.
    pub selected: Option<String>,
}

impl RelaySnapshot {
    pub fn selected_relay(&self) -> Option<&RelayDescriptor> {
        let id = self.selected.as_deref()?;
        self.entries
            .iter()
            .map(|e| &e.relay)
            .find(|r| r.id == id)
    }
}

/// Rank results fastest first.
///
/// Input is expected in configuration order. Pending and failed entries sort
/// after every measured one; ties keep their input order.
pub fn rank(results: &[RelayProbeResult]) -> Vec<RelayProbeResult> {
    let mut ranked = results.to_vec();
    ranked.sort_by_key(|r| match r.measured() {
        Some(ms) => (0u8, ms),
        None => (1u8, 0),
    });
    ranked
}

/// Probes relays and tracks the current selection.
pub struct RelaySelector {
    relays: Vec<RelayDescriptor>,
    probe: Arc<dyn LatencyProbe>,
    probe_config: ProbeConfig,
    state: watch::Sender<RelaySnapshot>,
    user_selected: AtomicBool,
    cycle: Mutex<()>,
}

impl RelaySelector {
    pub fn new(
        relays: Vec<RelayDescriptor>,
        probe: Arc<dyn LatencyProbe>,
        probe_config: ProbeConfig,
    ) -> Self {
        let entries = relays
            .iter()
            .map(|relay| RelayEntry {
                relay: relay.clone(),
                result: RelayProbeResult::resolved(relay.id.clone(), None),
            })
            .collect();
        let (state, _) = watch::channel(RelaySnapshot {
            entries,
            ready: false,
            selected: None,
        });
        Self {
            relays,
            probe,
            probe_config,
            state,
            user_selected: AtomicBool::new(false),
            cycle: Mutex::new(()),
        }
    }

    pub fn relays(&self) -> &[RelayDescriptor] {
        &self.relays
    }

    /// Watch the relay snapshot. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<RelaySnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().ready
    }

    /// The selected relay, if any.
    pub fn current_best(&self) -> Option<RelayDescriptor> {
        self.state.borrow().selected_relay().cloned()
    }

    /// Pin a relay. Later probe cycles no longer change the selection.
    pub fn select(&self, relay_id: &str) -> Result<()> {
        if !self.relays.iter().any(|r| r.id == relay_id) {
            return Err(LaunchError::UnknownRelay(relay_id.to_string()));
        }
        // The flag flips under the watch lock so a concurrent auto-selection
        // cannot overwrite the pin.
        self.state.send_modify(|s| {
            self.user_selected.store(true, Ordering::SeqCst);
            s.selected = Some(relay_id.to_string());
        });
        tracing::info!(relay = %relay_id, "relay selected by user");
        Ok(())
    }

    /// Probe every relay concurrently and return the final ranking.
    ///
    /// A second caller waits for the running cycle and then runs its own.
    pub async fn probe_all(&self) -> Vec<RelayProbeResult> {
        let _cycle = self.cycle.lock().await;

        let mut results: Vec<RelayProbeResult> = self
            .relays
            .iter()
            .map(|r| RelayProbeResult::pending(r.id.clone()))
            .collect();
        self.publish(&results);

        let bound = self.probe_config.overall_timeout();
        let connect = self.probe_config.timeout();
        let mut pending: FuturesUnordered<_> = self
            .relays
            .iter()
            .enumerate()
            .map(|(idx, relay)| {
                let probe = Arc::clone(&self.probe);
                let endpoint = relay.endpoint.clone();
                async move {
                    let latency = tokio::time::timeout(bound, probe.probe(&endpoint, connect))
                        .await
                        .unwrap_or_default();
                    (idx, latency)
                }
            })
            .collect();

        while let Some((idx, latency)) = pending.next().await {
            if let Some(slot) = results.get_mut(idx) {
                tracing::debug!(relay = %slot.relay_id, latency = ?latency, "relay probed");
                slot.latency_millis = latency;
                slot.probing = false;
            }
            self.publish(&results);
        }

        let ranked = rank(&results);
        self.auto_select(&ranked);
        ranked
    }

    fn publish(&self, results: &[RelayProbeResult]) {
        let entries: Vec<RelayEntry> = rank(results)
            .into_iter()
            .filter_map(|result| {
                self.relays
                    .iter()
                    .find(|r| r.id == result.relay_id)
                    .map(|relay| RelayEntry {
                        relay: relay.clone(),
                        result,
                    })
            })
            .collect();
        let best = entries
            .first()
            .filter(|e| e.result.measured().is_some())
            .map(|e| e.relay.id.clone());
        self.state.send_modify(|s| {
            s.entries = entries;
            if let Some(best) = best {
                s.ready = true;
                if !self.user_selected.load(Ordering::SeqCst) {
                    s.selected = Some(best);
                }
            }
        });
    }

    fn auto_select(&self, ranked: &[RelayProbeResult]) {
        let Some(best) = ranked.first().filter(|r| r.measured().is_some()) else {
            tracing::warn!("no relay answered a probe");
            return;
        };
        let id = best.relay_id.as_str();
        let mut applied = false;
        self.state.send_if_modified(|s| {
            if self.user_selected.load(Ordering::SeqCst) {
                return false;
            }
            applied = true;
            if s.selected.as_deref() == Some(id) {
                return false;
            }
            s.selected = Some(id.to_string());
            true
        });
        if applied {
            tracing::info!(relay = %id, latency = ?best.latency_millis, "relay auto-selected");
        }
    }
}

impl std::fmt::Debug for RelaySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySelector")
            .field("relays", &self.relays.len())
            .field("user_selected", &self.user_selected.load(Ordering::Relaxed))
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
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;

    struct TableProbe(HashMap<String, Option<u32>>);

    #[async_trait]
    impl LatencyProbe for TableProbe {
        async fn probe(&self, endpoint: &str, _timeout: Duration) -> Option<u32> {
            self.0.get(endpoint).copied().flatten()
        }
    }

    fn selector(table: &[(&str, Option<u32>)]) -> RelaySelector {
        let relays = table
            .iter()
            .map(|(id, _)| RelayDescriptor::new(*id, id.to_uppercase(), *id))
            .collect();
        let probe = TableProbe(table.iter().map(|(id, l)| ((*id).to_string(), *l)).collect());
        RelaySelector::new(relays, Arc::new(probe), ProbeConfig::default())
    }

    fn ids(results: &[RelayProbeResult]) -> Vec<&str> {
        results.iter().map(|r| r.relay_id.as_str()).collect()
    }

    #[test]
    fn rank_puts_failures_last_and_keeps_ties_stable() {
        let input = vec![
            RelayProbeResult::resolved("a", Some(50)),
            RelayProbeResult::resolved("b", None),
            RelayProbeResult::resolved("c", Some(20)),
            RelayProbeResult::resolved("d", Some(20)),
        ];
        assert_eq!(ids(&rank(&input)), vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn rank_treats_probing_as_unmeasured() {
        let mut pending = RelayProbeResult::pending("a");
        pending.latency_millis = Some(1);
        let input = vec![pending, RelayProbeResult::resolved("b", Some(90))];
        assert_eq!(ids(&rank(&input)), vec!["b", "a"]);
    }

    #[test]
    fn default_relays_are_unique() {
        let relays = default_relays();
        let mut ids: Vec<_> = relays.iter().map(|r| r.id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 9);
        assert_eq!(relays[0].endpoint, "direct.cm-ss13.com");
    }

    #[tokio::test]
    async fn probe_all_selects_fastest() {
        let selector = selector(&[("a", Some(80)), ("b", None), ("c", Some(30))]);
        let ranked = selector.probe_all().await;
        assert_eq!(ids(&ranked), vec!["c", "a", "b"]);
        assert!(selector.is_ready());
        assert_eq!(selector.current_best().unwrap().id, "c");
    }

    #[tokio::test]
    async fn all_failures_leave_selector_not_ready() {
        let selector = selector(&[("a", None), ("b", None)]);
        selector.probe_all().await;
        assert!(!selector.is_ready());
        assert!(selector.current_best().is_none());
    }

    #[tokio::test]
    async fn user_selection_is_sticky() {
        let selector = selector(&[("a", Some(80)), ("c", Some(30))]);
        selector.select("a").unwrap();
        selector.probe_all().await;
        assert_eq!(selector.current_best().unwrap().id, "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pin_is_never_overwritten() {
        for _ in 0..200 {
            let selector = Arc::new(selector(&[("a", Some(80)), ("b", Some(50)), ("c", Some(30))]));
            let cycle = {
                let selector = Arc::clone(&selector);
                tokio::spawn(async move { selector.probe_all().await })
            };
            let pin = {
                let selector = Arc::clone(&selector);
                tokio::spawn(async move { selector.select("a") })
            };
            pin.await.unwrap().unwrap();
            cycle.await.unwrap();
            assert_eq!(selector.current_best().unwrap().id, "a");
        }
    }

    #[test]
    fn unknown_relay_is_rejected() {
        let selector = selector(&[("a", Some(1))]);
        let err = selector.select("zz").unwrap_err();
        assert!(matches!(err, LaunchError::UnknownRelay(id) if id == "zz"));
    }
}
