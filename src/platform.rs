//! Host platform detection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The operating system family the launcher is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Windows,
    Linux,
    Macos,
    Unknown,
}

impl PlatformKind {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "macos") {
            Self::Macos
        } else {
            Self::Unknown
        }
    }

    /// Whether the game client must run inside the compatibility runtime.
    pub fn needs_compat_runtime(&self) -> bool {
        matches!(self, Self::Linux)
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Macos => "macos",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_linux_needs_the_runtime() {
        assert!(PlatformKind::Linux.needs_compat_runtime());
        assert!(!PlatformKind::Windows.needs_compat_runtime());
        assert!(!PlatformKind::Macos.needs_compat_runtime());
        assert!(!PlatformKind::Unknown.needs_compat_runtime());
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(PlatformKind::Macos.to_string(), "macos");
    }
}
