//! WebSocket echo probe using `tokio-tungstenite`.
//!
//! Each relay runs an echo endpoint on a fixed port. The probe connects over
//! `wss://`, sends numbered text frames one at a time and averages the time
//! until each echo returns. A missing or out-of-order echo ends the probe
//! with whatever was measured so far.
//!
//! # Feature gate
//!
//! Only available with the `probe-websocket` feature (enabled by default).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::config::ProbeConfig;
use crate::probe::LatencyProbe;

/// A [`LatencyProbe`] that measures WebSocket echo round trips.
#[derive(Debug, Clone)]
pub struct WebSocketProbe {
    port: u16,
    ping_count: u32,
    ping_timeout: Duration,
}

impl WebSocketProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            port: config.port,
            ping_count: config.ping_count.max(1),
            ping_timeout: config.ping_timeout(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("wss://{}:{}", endpoint, self.port)
    }
}

#[async_trait]
impl LatencyProbe for WebSocketProbe {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Option<u32> {
        let url = self.url(endpoint);
        let connect = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(&url)).await;
        let mut stream = match connect {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "relay probe connect failed");
                return None;
            }
            Err(_) => {
                tracing::debug!(url = %url, "relay probe connect timed out");
                return None;
            }
        };

        let mut total_ms: u64 = 0;
        let mut answered: u32 = 0;

        'pings: for seq in 0..self.ping_count {
            let expected = seq.to_string();
            let started = Instant::now();
            if let Err(e) = stream.send(Message::Text(expected.clone().into())).await {
                tracing::debug!(url = %url, error = %e, "relay probe send failed");
                break;
            }
            loop {
                let remaining = self.ping_timeout.saturating_sub(started.elapsed());
                let frame = match tokio::time::timeout(remaining, stream.next()).await {
                    Ok(Some(Ok(frame))) => frame,
                    Ok(Some(Err(_))) | Ok(None) => break 'pings,
                    Err(_) => {
                        tracing::debug!(url = %url, seq, "relay echo timed out");
                        break 'pings;
                    }
                };
                match classify_echo(&frame, &expected) {
                    EchoFrame::Match => {
                        total_ms += started.elapsed().as_millis() as u64;
                        answered += 1;
                        break;
                    }
                    EchoFrame::Control => {}
                    EchoFrame::Mismatch => {
                        tracing::debug!(url = %url, seq, "relay echo out of order");
                        break 'pings;
                    }
                }
            }
        }

        let _ = stream.close(None).await;

        if answered == 0 {
            return None;
        }
        u32::try_from(total_ms / u64::from(answered)).ok()
    }
}

/// How a frame received while waiting for an echo is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EchoFrame {
    /// The echo of the frame just sent.
    Match,
    /// Ping or pong; keep waiting.
    Control,
    /// Anything else, including a late echo of an earlier frame.
    Mismatch,
}

fn classify_echo(frame: &Message, expected: &str) -> EchoFrame {
    match frame {
        Message::Text(text) if text.as_str() == expected => EchoFrame::Match,
        Message::Ping(_) | Message::Pong(_) => EchoFrame::Control,
        _ => EchoFrame::Mismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_current_sequence_number_counts_as_echo() {
        assert_eq!(classify_echo(&Message::Text("3".into()), "3"), EchoFrame::Match);
        // A late echo of the previous frame must not be timed as this one.
        assert_eq!(classify_echo(&Message::Text("2".into()), "3"), EchoFrame::Mismatch);
        assert_eq!(
            classify_echo(&Message::Binary(b"3".to_vec().into()), "3"),
            EchoFrame::Mismatch
        );
        assert_eq!(classify_echo(&Message::Close(None), "3"), EchoFrame::Mismatch);
        assert_eq!(
            classify_echo(&Message::Ping(Vec::<u8>::new().into()), "3"),
            EchoFrame::Control
        );
    }

    #[test]
    fn url_uses_configured_port() {
        let probe = WebSocketProbe::new(&ProbeConfig::default());
        assert_eq!(probe.url("nyc.cm-ss13.com"), "wss://nyc.cm-ss13.com:4000");
    }

    #[test]
    fn zero_ping_count_is_clamped() {
        let config = ProbeConfig {
            ping_count: 0,
            ..ProbeConfig::default()
        };
        assert_eq!(WebSocketProbe::new(&config).ping_count, 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_yields_none() {
        let probe = WebSocketProbe::new(&ProbeConfig {
            port: 1,
            ..ProbeConfig::default()
        });
        assert_eq!(probe.probe("127.0.0.1", Duration::from_millis(500)).await, None);
    }
}
