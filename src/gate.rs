//! Launch permission.
//!
//! The gate holds no state: [`evaluate`] is a pure function of the platform,
//! the latest environment status, whether a provisioning run owns the
//! environment, relay readiness and the configured policy.

use serde::{Deserialize, Serialize};

use crate::environment::{EnvironmentStatus, RuntimeVersion};
use crate::error::DenyReason;
use crate::platform::PlatformKind;

/// Which environment checks must pass before a launch is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    pub require_prefix_initialized: bool,
    pub require_web_component: bool,
    /// Also require the helper to be present.
    pub require_aux_component: bool,
    /// Require the runtime to meet the environment's configured minimum.
    pub require_minimum_version: bool,
    /// A stricter floor on top of the environment's minimum, when set.
    pub min_runtime_version: Option<RuntimeVersion>,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            require_prefix_initialized: true,
            require_web_component: true,
            require_aux_component: false,
            require_minimum_version: true,
            min_runtime_version: None,
        }
    }
}

impl ReadinessPolicy {
    /// Whether `status` satisfies this policy.
    pub fn environment_ready(&self, status: &EnvironmentStatus) -> bool {
        if self.require_prefix_initialized && !status.prefix_initialized {
            return false;
        }
        if self.require_web_component && !status.web_component_installed {
            return false;
        }
        if self.require_aux_component && !status.aux_component_installed {
            return false;
        }
        if self.require_minimum_version && !status.meets_minimum_version {
            return false;
        }
        if let Some(min) = self.min_runtime_version {
            if !status.parsed_version().is_some_and(|v| v >= min) {
                return false;
            }
        }
        true
    }
}

/// Decide whether a launch may proceed.
///
/// The environment is checked first, so a player with neither a ready
/// environment nor a relay is told about the environment. An environment
/// being provisioned is never ready, whatever its last status said.
pub fn evaluate(
    platform: PlatformKind,
    status: &EnvironmentStatus,
    provisioning: bool,
    relay_ready: bool,
    relay_selected: bool,
    policy: &ReadinessPolicy,
) -> Result<(), DenyReason> {
    if platform.needs_compat_runtime() && (provisioning || !policy.environment_ready(status)) {
        return Err(DenyReason::EnvironmentNotReady);
    }
    if !relay_ready || !relay_selected {
        return Err(DenyReason::NoRelaySelected);
    }
    Ok(())
}
