//! Archive unpacking and packing.
//!
//! Runtime archives are tar streams, optionally zstd-compressed. Entries that
//! would escape the target directory are skipped.

use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path};

use async_trait::async_trait;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Unpacks archive bytes into a directory.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync + 'static {
    async fn extract(&self, bytes: Vec<u8>, target: &Path) -> io::Result<()>;
}

/// Extracts `.tar` and `.tar.zst` archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarExtractor;

#[async_trait]
impl ArchiveExtractor for TarExtractor {
    async fn extract(&self, bytes: Vec<u8>, target: &Path) -> io::Result<()> {
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || unpack(&bytes, &target))
            .await
            .map_err(io::Error::other)?
    }
}

/// Unpack `bytes` into `target`, detecting zstd compression by magic number.
pub fn unpack(bytes: &[u8], target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    if bytes.starts_with(&ZSTD_MAGIC) {
        let decoder = zstd::stream::Decoder::new(Cursor::new(bytes))?;
        unpack_tar(decoder, target)
    } else {
        unpack_tar(Cursor::new(bytes), target)
    }
}

fn unpack_tar<R: Read>(reader: R, target: &Path) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let mut written = 0usize;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            tracing::warn!(path = %path.display(), "skipping archive entry outside target");
            continue;
        }
        // `unpack_in` re-checks containment and applies the entry's mode.
        if entry.unpack_in(target)? {
            written += 1;
        }
    }

    tracing::debug!(target = %target.display(), entries = written, "archive unpacked");
    Ok(())
}

/// Pack `source` into a zstd-compressed tar archive.
pub fn pack_tar_zst(source: &Path, level: i32) -> io::Result<Vec<u8>> {
    let encoder = zstd::stream::Encoder::new(Vec::new(), level)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", source)?;
    builder.into_inner()?.finish()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn plain_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn unpacks_plain_tar() {
        let dir = tempfile::tempdir().unwrap();
        unpack(&plain_tar(&[("bin/wine", b"#!/bin/sh\n")]), dir.path()).unwrap();
        assert_eq!(
            fs::read(dir.path().join("bin/wine")).unwrap(),
            b"#!/bin/sh\n"
        );
    }

    #[test]
    fn pack_then_unpack_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("bin")).unwrap();
        fs::write(src.path().join("bin/wine64"), b"elf").unwrap();

        let packed = pack_tar_zst(src.path(), 3).unwrap();
        assert!(packed.starts_with(&ZSTD_MAGIC));

        let dst = tempfile::tempdir().unwrap();
        unpack(&packed, dst.path()).unwrap();
        assert_eq!(fs::read(dst.path().join("bin/wine64")).unwrap(), b"elf");
    }

    #[test]
    fn garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = ZSTD_MAGIC.to_vec();
        bytes.extend_from_slice(b"not really zstd");
        assert!(unpack(&bytes, dir.path()).is_err());
    }

    #[tokio::test]
    async fn extractor_runs_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        TarExtractor
            .extract(plain_tar(&[("README", b"hi")]), dir.path())
            .await
            .unwrap();
        assert!(dir.path().join("README").is_file());
    }
}
