//! Error codes for structured error handling across the launch readiness core.
//!
//! Codes serialize as `SCREAMING_SNAKE_CASE` strings so a UI layer can match on
//! them without parsing messages. Each code maps to a [`Remedy`] the UI can
//! offer the player.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The action a player can take to recover from a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remedy {
    /// Running the same operation again may succeed.
    Retry,
    /// The isolated environment should be destroyed and rebuilt.
    Reset,
    /// Nothing the player can do locally; escalate.
    ContactSupport,
}

/// Structured error codes attached to provisioning failures and launch denials.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation
/// and [`remedy()`](ErrorCode::remedy) to pick the recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Runtime detection
    RuntimeNotFound,
    RuntimeVersionTooOld,
    AuxComponentMissing,
    UnsupportedPlatform,

    // Fetching
    FetchFailed,
    IntegrityMismatch,

    // Unpacking
    ExtractionFailed,

    // Prefix and components
    PrefixInitFailed,
    AuxInstallFailed,
    RegistryFailed,
    WebComponentFetchFailed,
    WebComponentInstallFailed,

    // Verification
    VerificationFailed,

    // Run control
    AlreadyProvisioning,
    Abandoned,
    Io,

    // Launch gate
    EnvironmentNotReady,
    NoRelaySelected,
    SessionActive,
    ProcessStartFailed,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::RuntimeNotFound => {
                "The compatibility runtime could not be found. Setup will install it."
            }
            Self::RuntimeVersionTooOld => {
                "The installed compatibility runtime is older than the minimum supported version."
            }
            Self::AuxComponentMissing => {
                "The helper used to install runtime dependencies is not available."
            }
            Self::UnsupportedPlatform => {
                "The compatibility runtime is only used on Linux."
            }
            Self::FetchFailed => {
                "Downloading a setup archive failed. Check your connection and try again."
            }
            Self::IntegrityMismatch => {
                "A downloaded archive did not match its expected checksum. Try again."
            }
            Self::ExtractionFailed => {
                "The runtime archive could not be unpacked."
            }
            Self::PrefixInitFailed => {
                "The isolated environment could not be created. Resetting it usually helps."
            }
            Self::AuxInstallFailed => {
                "A runtime dependency failed to install inside the isolated environment."
            }
            Self::RegistryFailed => {
                "A compatibility setting could not be written to the isolated environment."
            }
            Self::WebComponentFetchFailed => {
                "The web rendering component installer could not be downloaded."
            }
            Self::WebComponentInstallFailed => {
                "The web rendering component could not be installed."
            }
            Self::VerificationFailed => {
                "Setup finished but the environment did not pass verification. Resetting it usually helps."
            }
            Self::AlreadyProvisioning => {
                "Environment setup is already running."
            }
            Self::Abandoned => {
                "Environment setup was stopped before it finished."
            }
            Self::Io => {
                "A file system operation failed during setup."
            }
            Self::EnvironmentNotReady => {
                "The game environment is not set up yet. Complete setup first."
            }
            Self::NoRelaySelected => {
                "No relay is available yet. Wait for relay checks to finish or pick one."
            }
            Self::SessionActive => {
                "A game session is already starting or running."
            }
            Self::ProcessStartFailed => {
                "The game client could not be started."
            }
        }
    }

    /// Returns the recovery action the UI should offer for this code.
    pub fn remedy(&self) -> Remedy {
        match self {
            Self::FetchFailed
            | Self::IntegrityMismatch
            | Self::WebComponentFetchFailed
            | Self::AlreadyProvisioning
            | Self::Abandoned
            | Self::EnvironmentNotReady
            | Self::NoRelaySelected
            | Self::SessionActive
            | Self::AuxComponentMissing => Remedy::Retry,
            Self::ExtractionFailed
            | Self::PrefixInitFailed
            | Self::AuxInstallFailed
            | Self::RegistryFailed
            | Self::WebComponentInstallFailed
            | Self::VerificationFailed
            | Self::Io => Remedy::Reset,
            Self::RuntimeNotFound
            | Self::RuntimeVersionTooOld
            | Self::UnsupportedPlatform
            | Self::ProcessStartFailed => Remedy::ContactSupport,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::VerificationFailed).unwrap();
        assert_eq!(json, "\"VERIFICATION_FAILED\"");
        let back: ErrorCode = serde_json::from_str("\"NO_RELAY_SELECTED\"").unwrap();
        assert_eq!(back, ErrorCode::NoRelaySelected);
    }

    #[test]
    fn setup_corruption_suggests_reset() {
        assert_eq!(ErrorCode::PrefixInitFailed.remedy(), Remedy::Reset);
        assert_eq!(ErrorCode::VerificationFailed.remedy(), Remedy::Reset);
        assert_eq!(ErrorCode::FetchFailed.remedy(), Remedy::Retry);
        assert_eq!(ErrorCode::UnsupportedPlatform.remedy(), Remedy::ContactSupport);
    }

    #[test]
    fn display_uses_description() {
        assert_eq!(
            ErrorCode::SessionActive.to_string(),
            ErrorCode::SessionActive.description()
        );
    }
}
