//! # Bundle Runtime Example
//!
//! Repackages an upstream runtime build, plus the component helper, into the
//! `.tar.zst` archive the launcher provisions from, and writes its SHA-256
//! digest next to it.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example bundle_runtime -- \
//!     https://example.com/wine-10.5-amd64.tar.xz.tar \
//!     dist/wine.tar.zst
//! ```
//!
//! Pass `BUNDLE_SHA256=<hex>` to verify the upstream archive.

use std::path::PathBuf;
use std::sync::Arc;

use launch_readiness::bundle::{build_bundle, BundleSpec};
use launch_readiness::config::ArchiveLocation;
use launch_readiness::extract::TarExtractor;
use launch_readiness::fetch::DefaultArchiveSource;
use launch_readiness::ProvisioningProgress;

/// Helper script shipped inside every bundle.
const HELPER_URL: &str =
    "https://raw.githubusercontent.com/Winetricks/winetricks/master/src/winetricks";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(url), Some(output)) = (args.next(), args.next()) else {
        eprintln!("usage: bundle_runtime <upstream-url> <output.tar.zst>");
        std::process::exit(2);
    };
    let staging = tempfile::tempdir()?;

    let upstream = ArchiveLocation {
        url,
        sha256: std::env::var("BUNDLE_SHA256").ok(),
    };
    let spec = BundleSpec::new(upstream, staging.path().join("wine"), PathBuf::from(output))
        .with_helper(HELPER_URL, "winetricks");
    let digest_path = spec.digest_path();

    let print = |event: ProvisioningProgress| {
        println!("[{:?} {:>3}%] {}", event.phase, event.percent, event.message);
    };
    let (terminal, digest) = build_bundle(
        spec,
        Arc::new(DefaultArchiveSource::new()),
        Arc::new(TarExtractor),
        &print,
    )
    .await;

    if !terminal.succeeded() {
        eprintln!(
            "bundle failed during {:?}: {} ({:?})",
            terminal.phase, terminal.message, terminal.error_code
        );
        std::process::exit(1);
    }
    println!(
        "sha256 {} written to {}",
        digest.unwrap_or_default(),
        digest_path.display()
    );
    Ok(())
}
