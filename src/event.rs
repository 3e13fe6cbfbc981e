//! Events delivered to the UI layer.

use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentStatus;
use crate::provision::ProvisioningProgress;
use crate::relay::{RelayDescriptor, RelaySnapshot};
use crate::session::{SessionState, SlowSession};

/// Everything the [`Launcher`](crate::Launcher) reports on its event channel.
///
/// The channel is bounded. When the UI falls behind, events are dropped with
/// a warning rather than stalling the launcher; the `watch` subscriptions
/// always hold the latest state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LauncherEvent {
    /// Probe results changed.
    RelaysUpdated(RelaySnapshot),
    /// A different relay is now selected.
    RelaySelected(RelayDescriptor),
    /// A fresh environment status was published.
    EnvironmentChecked(EnvironmentStatus),
    /// A provisioning run made progress or finished.
    Provisioning(ProvisioningProgress),
    /// The game session moved to a new state.
    SessionChanged(SessionState),
    /// A connect or restart is taking longer than expected.
    SessionSlow(SlowSession),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let event = LauncherEvent::SessionChanged(SessionState::Connected {
            server: "main".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_changed");
        assert_eq!(json["data"]["state"], "connected");
        assert_eq!(json["data"]["server"], "main");
    }
}
