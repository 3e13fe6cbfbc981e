//! # Probe Relays Example
//!
//! Starts a launcher against the real relay list, prints each ranking update
//! as results arrive, and exits once the fastest relay has been selected.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example probe_relays
//!
//! # Load a config file instead of the built-in defaults:
//! LAUNCHER_CONFIG=launcher.json cargo run --example probe_relays
//! ```

use std::time::Duration;

use launch_readiness::{Collaborators, Launcher, LauncherConfig, LauncherEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for per-relay probe output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let config = match std::env::var("LAUNCHER_CONFIG") {
        Ok(path) => LauncherConfig::from_json_file(path)?,
        Err(_) => LauncherConfig::new(),
    };
    let deadline = config.probe.overall_timeout() + Duration::from_secs(5);
    tracing::info!("Probing {} relays", config.relays.len());

    let collaborators = Collaborators::system(&config);
    let (mut launcher, mut events) = Launcher::start(config, collaborators);

    // ── Event loop ──────────────────────────────────────────────────
    let outcome = tokio::time::timeout(deadline, async {
        while let Some(event) = events.recv().await {
            match event {
                LauncherEvent::RelaysUpdated(snapshot) => {
                    for entry in &snapshot.entries {
                        let latency = match (entry.result.probing, entry.result.latency_millis) {
                            (true, _) => "probing".to_string(),
                            (false, Some(ms)) => format!("{ms} ms"),
                            (false, None) => "unreachable".to_string(),
                        };
                        println!("  {:<24} {latency}", entry.relay.display_name);
                    }
                    println!();
                }
                LauncherEvent::RelaySelected(relay) => return Some(relay),
                _ => {}
            }
        }
        None
    })
    .await;

    match outcome {
        Ok(Some(relay)) => println!("Selected {} ({})", relay.display_name, relay.endpoint),
        Ok(None) => println!("Launcher stopped before a relay was selected"),
        Err(_) => println!("No relay answered within {deadline:?}"),
    }

    launcher.shutdown().await;
    Ok(())
}
