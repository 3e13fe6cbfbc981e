//! Error types for the launch readiness core.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error_codes::ErrorCode;

/// Why the launch gate refused a launch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The compatibility environment does not satisfy the readiness policy.
    EnvironmentNotReady,
    /// No relay has answered a probe, or none is selected.
    NoRelaySelected,
}

impl DenyReason {
    /// The structured code for this denial.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EnvironmentNotReady => ErrorCode::EnvironmentNotReady,
            Self::NoRelaySelected => ErrorCode::NoRelaySelected,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnvironmentNotReady => f.write_str("environment not ready"),
            Self::NoRelaySelected => f.write_str("no relay selected"),
        }
    }
}

/// Errors returned by launcher commands.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A provisioning run is already in flight; observe its progress instead.
    #[error("already provisioning")]
    AlreadyProvisioning,

    /// The operation only applies on a platform that needs the compatibility runtime.
    #[error("operation not supported on {0}")]
    UnsupportedPlatform(String),

    /// The launch gate refused the request.
    #[error("launch denied: {0}")]
    LaunchDenied(DenyReason),

    /// A session is already connecting, connected, or restarting.
    #[error("connection already in progress")]
    SessionActive,

    /// `select` named a relay that is not configured.
    #[error("unknown relay: {0}")]
    UnknownRelay(String),

    /// The game client process could not be started.
    #[error("failed to start game process: {0}")]
    ProcessStart(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to serialize or deserialize persisted data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    /// The structured code for this error, when one applies.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::AlreadyProvisioning => Some(ErrorCode::AlreadyProvisioning),
            Self::UnsupportedPlatform(_) => Some(ErrorCode::UnsupportedPlatform),
            Self::LaunchDenied(reason) => Some(reason.code()),
            Self::SessionActive => Some(ErrorCode::SessionActive),
            Self::ProcessStart(_) => Some(ErrorCode::ProcessStartFailed),
            Self::Io(_) => Some(ErrorCode::Io),
            Self::UnknownRelay(_) | Self::Config(_) | Self::Serialization(_) | Self::Timeout => {
                None
            }
        }
    }
}

/// A failed provisioning step, carrying the code the UI uses to pick a remedy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StageFailure {
    /// Structured classification of the failure.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl StageFailure {
    /// Create a failure with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StageFailure {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorCode::Io, e.to_string())
    }
}

/// A specialized [`Result`] type for launcher operations.
pub type Result<T> = std::result::Result<T, LaunchError>;
