//! Latency probe abstraction for relay selection.
//!
//! A [`LatencyProbe`] measures the round trip to one relay endpoint. It holds
//! no shared state and never fails loudly: any error becomes `None`, which the
//! selector ranks after every measured relay.
//!
//! # Implementing a Custom Probe
//!
//! ```rust
//! use std::time::Duration;
//! use async_trait::async_trait;
//! use launch_readiness::probe::LatencyProbe;
//!
//! struct FixedProbe(u32);
//!
//! #[async_trait]
//! impl LatencyProbe for FixedProbe {
//!     async fn probe(&self, _endpoint: &str, _timeout: Duration) -> Option<u32> {
//!         Some(self.0)
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;

/// Measures latency to a relay endpoint.
///
/// # Object Safety
///
/// This trait is object-safe; the selector stores it as `Arc<dyn LatencyProbe>`.
///
/// # Cancellation
///
/// The selector wraps every call in its own hard timeout and drops the future
/// when it elapses, so implementations must not leave shared state behind when
/// cancelled mid-probe.
#[async_trait]
pub trait LatencyProbe: Send + Sync + 'static {
    /// Probe `endpoint` (a host name) and return the mean round trip in
    /// milliseconds, or `None` when the relay could not be measured.
    ///
    /// `timeout` bounds connection establishment.
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Option<u32>;
}
