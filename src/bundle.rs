//! Offline runtime bundling.
//!
//! Produces the archive the launcher later fetches during provisioning:
//! fetch an upstream runtime build, unpack it into a staging directory, add
//! the helper script, then repack as `.tar.zst` next to a `.sha256` file.
//! Runs on the same phase engine as provisioning.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ArchiveLocation;
use crate::error::StageFailure;
use crate::error_codes::ErrorCode;
use crate::extract::{pack_tar_zst, ArchiveExtractor};
use crate::fetch::{sha256_hex, ArchiveSource, IntegrityCheck, Sha256Integrity};
use crate::provision::{
    run_stages, ProgressEmitter, ProvisioningPhase, ProvisioningProgress, StageDriver,
    StageReporter,
};

type StageResult = std::result::Result<(), StageFailure>;

/// What to bundle and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSpec {
    /// Upstream runtime build (tar or tar.zst).
    pub upstream: ArchiveLocation,
    /// Helper script to place in `bin/`, if any.
    pub helper_url: Option<String>,
    pub helper_name: String,
    /// Scratch directory; emptied before use.
    pub staging_dir: PathBuf,
    /// Output archive path. The digest lands at `<output>.sha256`.
    pub output: PathBuf,
    pub compression_level: i32,
}

impl BundleSpec {
    pub fn new(upstream: ArchiveLocation, staging_dir: PathBuf, output: PathBuf) -> Self {
        Self {
            upstream,
            helper_url: None,
            helper_name: "winetricks".to_string(),
            staging_dir,
            output,
            compression_level: 19,
        }
    }

    #[must_use]
    pub fn with_helper(mut self, url: impl Into<String>, name: impl Into<String>) -> Self {
        self.helper_url = Some(url.into());
        self.helper_name = name.into();
        self
    }

    #[must_use]
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn digest_path(&self) -> PathBuf {
        let mut name = self.output.clone().into_os_string();
        name.push(".sha256");
        PathBuf::from(name)
    }
}

/// [`StageDriver`] that builds a runtime bundle.
pub struct BundleDriver {
    spec: BundleSpec,
    source: Arc<dyn ArchiveSource>,
    extractor: Arc<dyn ArchiveExtractor>,
    upstream: Option<Vec<u8>>,
    digest: Option<String>,
}

impl BundleDriver {
    pub fn new(
        spec: BundleSpec,
        source: Arc<dyn ArchiveSource>,
        extractor: Arc<dyn ArchiveExtractor>,
    ) -> Self {
        Self {
            spec,
            source,
            extractor,
            upstream: None,
            digest: None,
        }
    }

    /// Hex SHA-256 of the written bundle, once verification passed.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    async fn fetch(&mut self, reporter: &StageReporter<'_>) -> StageResult {
        let on_progress = |done: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|t| *t > 0) {
                let percent = (done.saturating_mul(100) / total).min(100) as u8;
                reporter.progress_if_changed(percent, "Downloading upstream runtime");
            }
        };
        let bytes = self
            .source
            .fetch(&self.spec.upstream.url, &on_progress)
            .await
            .map_err(|e| StageFailure::new(ErrorCode::FetchFailed, e.to_string()))?;
        if let Some(expected) = &self.spec.upstream.sha256 {
            if !Sha256Integrity::new(expected.as_str()).verify(&bytes) {
                return Err(StageFailure::new(
                    ErrorCode::IntegrityMismatch,
                    "upstream archive checksum mismatch",
                ));
            }
        }
        self.upstream = Some(bytes);
        Ok(())
    }

    async fn unpack(&mut self, reporter: &StageReporter<'_>) -> StageResult {
        let bytes = self.upstream.take().ok_or_else(|| {
            StageFailure::new(ErrorCode::ExtractionFailed, "nothing was fetched")
        })?;
        match tokio::fs::remove_dir_all(&self.spec.staging_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.extractor
            .extract(bytes, &self.spec.staging_dir)
            .await
            .map_err(|e| StageFailure::new(ErrorCode::ExtractionFailed, e.to_string()))?;
        reporter.progress(100, "Upstream runtime unpacked");
        Ok(())
    }

    async fn add_helper(&self, reporter: &StageReporter<'_>) -> StageResult {
        let Some(url) = &self.spec.helper_url else {
            reporter.progress(100, "No helper to bundle");
            return Ok(());
        };
        let script = self
            .source
            .fetch(url, &|_, _| {})
            .await
            .map_err(|e| StageFailure::new(ErrorCode::FetchFailed, e.to_string()))?;
        let bin = self.spec.staging_dir.join("bin");
        tokio::fs::create_dir_all(&bin).await?;
        let path = bin.join(&self.spec.helper_name);
        tokio::fs::write(&path, script).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        }
        reporter.progress(100, "Helper bundled");
        Ok(())
    }

    async fn pack_and_verify(&mut self, reporter: &StageReporter<'_>) -> StageResult {
        let bin = self.spec.staging_dir.join("bin");
        if !bin.join("wine").is_file() && !bin.join("wine64").is_file() {
            return Err(StageFailure::new(
                ErrorCode::VerificationFailed,
                "staged runtime has no bin/wine or bin/wine64",
            ));
        }

        reporter.progress(10, "Compressing bundle");
        let staging = self.spec.staging_dir.clone();
        let level = self.spec.compression_level;
        let packed = tokio::task::spawn_blocking(move || pack_tar_zst(&staging, level))
            .await
            .map_err(|e| StageFailure::new(ErrorCode::Io, e.to_string()))??;

        if let Some(parent) = self.spec.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let digest = sha256_hex(&packed);
        tokio::fs::write(&self.spec.output, &packed).await?;
        tokio::fs::write(self.spec.digest_path(), format!("{digest}\n")).await?;

        let written = tokio::fs::read(&self.spec.output).await?;
        if !Sha256Integrity::new(digest.as_str()).verify(&written) {
            return Err(StageFailure::new(
                ErrorCode::VerificationFailed,
                "written bundle does not match its digest",
            ));
        }
        tracing::info!(
            output = %self.spec.output.display(),
            bytes = packed.len(),
            sha256 = %digest,
            "runtime bundle written"
        );
        self.digest = Some(digest);
        reporter.progress(100, "Bundle verified");
        Ok(())
    }
}

#[async_trait]
impl StageDriver for BundleDriver {
    async fn run_phase(
        &mut self,
        phase: ProvisioningPhase,
        reporter: &StageReporter<'_>,
    ) -> StageResult {
        match phase {
            ProvisioningPhase::Fetching => self.fetch(reporter).await,
            ProvisioningPhase::Unpacking => self.unpack(reporter).await,
            ProvisioningPhase::InitializingPrefix => {
                reporter.progress(100, "No prefix for bundles");
                Ok(())
            }
            ProvisioningPhase::InstallingAuxComponent => self.add_helper(reporter).await,
            ProvisioningPhase::Verifying => self.pack_and_verify(reporter).await,
            ProvisioningPhase::NotStarted | ProvisioningPhase::Complete => Ok(()),
        }
    }
}

/// Build a bundle and return the terminal progress event with the digest.
pub async fn build_bundle(
    spec: BundleSpec,
    source: Arc<dyn ArchiveSource>,
    extractor: Arc<dyn ArchiveExtractor>,
    emit: ProgressEmitter<'_>,
) -> (ProvisioningProgress, Option<String>) {
    let mut driver = BundleDriver::new(spec, source, extractor);
    let abandon = AtomicBool::new(false);
    let terminal = run_stages(&mut driver, Uuid::new_v4(), &abandon, emit).await;
    (terminal, driver.digest)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::extract::{unpack, TarExtractor};
    use crate::fetch::DefaultArchiveSource;
    use crate::provision::ProgressStage;

    fn upstream_tar(dir: &std::path::Path) -> PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"#!/bin/sh\necho wine-10.5\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "bin/wine", &data[..]).unwrap();
        let path = dir.join("upstream.tar");
        std::fs::write(&path, builder.into_inner().unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn bundles_upstream_and_writes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = upstream_tar(dir.path());
        let helper = dir.path().join("helper.sh");
        std::fs::write(&helper, "#!/bin/sh\n").unwrap();

        let spec = BundleSpec::new(
            ArchiveLocation {
                url: format!("file://{}", upstream.display()),
                sha256: Some(sha256_hex(&std::fs::read(&upstream).unwrap())),
            },
            dir.path().join("staging"),
            dir.path().join("out/wine.tar.zst"),
        )
        .with_helper(format!("file://{}", helper.display()), "winetricks")
        .with_compression_level(3);
        let digest_path = spec.digest_path();
        let output = spec.output.clone();

        let (terminal, digest) = build_bundle(
            spec,
            Arc::new(DefaultArchiveSource::new()),
            Arc::new(TarExtractor),
            &|_| {},
        )
        .await;

        assert_eq!(terminal.stage, ProgressStage::Complete, "{}", terminal.message);
        let digest = digest.unwrap();
        assert_eq!(
            std::fs::read_to_string(digest_path).unwrap().trim(),
            digest
        );

        let unpacked = dir.path().join("check");
        unpack(&std::fs::read(output).unwrap(), &unpacked).unwrap();
        assert!(unpacked.join("bin/wine").is_file());
        assert!(unpacked.join("bin/winetricks").is_file());
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = upstream_tar(dir.path());
        let spec = BundleSpec::new(
            ArchiveLocation {
                url: format!("file://{}", upstream.display()),
                sha256: Some("00".repeat(32)),
            },
            dir.path().join("staging"),
            dir.path().join("wine.tar.zst"),
        );
        let (terminal, digest) = build_bundle(
            spec,
            Arc::new(DefaultArchiveSource::new()),
            Arc::new(TarExtractor),
            &|_| {},
        )
        .await;
        assert_eq!(terminal.phase, ProvisioningPhase::Fetching);
        assert_eq!(terminal.error_code, Some(ErrorCode::IntegrityMismatch));
        assert!(digest.is_none());
    }
}
