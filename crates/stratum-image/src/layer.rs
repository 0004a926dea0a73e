//! Content-addressed layer packaging.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use stratum_common::{StratumError, StratumResult};

use crate::manifest::DOCKER_LAYER_GZIP;

/// One file to pack into a layer.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    /// Path of the file on the local filesystem.
    pub source: PathBuf,
    /// Absolute path the file takes inside the image filesystem.
    pub destination: String,
    /// File mode inside the image.
    pub mode: u32,
}

impl BuildArtifact {
    /// An executable artifact (mode 0755).
    #[must_use]
    pub fn executable(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            mode: 0o755,
        }
    }

    /// Check the artifact can be packaged.
    ///
    /// The source must be an existing regular file and the destination an
    /// absolute path. Runs before any network activity so a bad invocation
    /// fails fast.
    pub fn validate(&self) -> StratumResult<()> {
        let meta = std::fs::metadata(&self.source).map_err(|_| StratumError::Input {
            message: format!("artifact does not exist: {}", self.source.display()),
        })?;
        if !meta.is_file() {
            return Err(StratumError::Input {
                message: format!("artifact is not a regular file: {}", self.source.display()),
            });
        }
        if !self.destination.starts_with('/') || self.destination.ends_with('/') {
            return Err(StratumError::Input {
                message: format!(
                    "artifact destination must be an absolute file path: {}",
                    self.destination
                ),
            });
        }
        Ok(())
    }
}

/// A built filesystem layer: a gzipped tar stream addressed by its digest.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Media type of the compressed stream.
    pub media_type: String,
    /// Digest of the compressed bytes.
    pub digest: String,
    /// Digest of the uncompressed tar stream (the config rootfs diff ID).
    pub diff_id: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// The compressed bytes.
    pub data: Bytes,
}

impl Layer {
    /// Recompute the content digest and check it matches.
    pub fn verify(&self) -> StratumResult<()> {
        let actual = sha256_hex(&self.data);
        if actual != self.digest {
            return Err(StratumError::Integrity {
                expected: self.digest.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Packs artifacts into a deterministic, content-addressed layer.
pub struct LayerBuilder;

impl LayerBuilder {
    /// Build a layer holding the given artifacts at their destination paths.
    ///
    /// Each artifact lands at its destination with its required mode, with
    /// ancestor directories materialized. Timestamps, ownership, and gzip
    /// header metadata are pinned to zero so identical artifact content
    /// yields an identical digest across builds.
    pub fn build(artifacts: &[BuildArtifact]) -> StratumResult<Layer> {
        if artifacts.is_empty() {
            return Err(StratumError::Input {
                message: "no artifacts to package".to_string(),
            });
        }
        for artifact in artifacts {
            artifact.validate()?;
        }

        let mut builder = tar::Builder::new(Vec::new());
        let mut seen_dirs: BTreeSet<String> = BTreeSet::new();

        for artifact in artifacts {
            let path = artifact.destination.trim_start_matches('/');
            for dir in ancestor_dirs(path) {
                if seen_dirs.insert(dir.clone()) {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_mtime(0);
                    header.set_uid(0);
                    header.set_gid(0);
                    builder.append_data(&mut header, format!("{dir}/"), std::io::empty())?;
                }
            }

            let data = std::fs::read(&artifact.source)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(artifact.mode);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            builder.append_data(&mut header, path, data.as_slice())?;

            tracing::debug!(
                source = %artifact.source.display(),
                destination = %artifact.destination,
                mode = format_args!("{:o}", artifact.mode),
                "Packed artifact"
            );
        }

        let uncompressed = builder.into_inner()?;
        let diff_id = sha256_hex(&uncompressed);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&uncompressed)?;
        let compressed = encoder.finish()?;
        let digest = sha256_hex(&compressed);

        tracing::debug!(
            digest = %digest,
            size = compressed.len(),
            files = artifacts.len(),
            "Layer built"
        );

        Ok(Layer {
            media_type: DOCKER_LAYER_GZIP.to_string(),
            digest,
            diff_id,
            size: compressed.len() as u64,
            data: Bytes::from(compressed),
        })
    }
}

/// Proper ancestor directories of a relative path, parents first.
fn ancestor_dirs(path: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut prefix = String::new();
    let Some((parents, _file)) = path.rsplit_once('/') else {
        return dirs;
    };
    for part in parents.split('/') {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(part);
        dirs.push(prefix.clone());
    }
    dirs
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}
