//! Latency probe implementations.
//!
//! | Feature           | Probe              |
//! |-------------------|--------------------|
//! | `probe-websocket` | [`WebSocketProbe`] |

#[cfg(feature = "probe-websocket")]
pub mod websocket;

#[cfg(feature = "probe-websocket")]
pub use websocket::WebSocketProbe;
