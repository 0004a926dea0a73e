//! Base-image cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use stratum_common::StratumResult;

use crate::image::Image;

/// Concurrency-safe memoization of pulled images, keyed by reference string.
///
/// Owned by the composition root and shared by `Arc` across invocations;
/// the only mutable state build invocations share. Keys are the literal
/// reference strings callers pass in, not normalized references, so two
/// differently formatted strings naming the same image are distinct entries.
/// Entries are never invalidated or evicted.
#[derive(Debug, Default)]
pub struct ImageCache {
    entries: RwLock<HashMap<String, Arc<Image>>>,
}

impl ImageCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached image without pulling.
    #[must_use]
    pub fn lookup(&self, reference: &str) -> Option<Arc<Image>> {
        self.entries.read().get(reference).cloned()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Return the cached image for `reference`, pulling on a miss.
    ///
    /// A hit takes the read lock only. On a miss the lock is released before
    /// `pull` runs, so misses for different references never block one
    /// another; misses racing on the same reference may each pull, and the
    /// last insert overwrites with an equivalent value (images are
    /// immutable, so this is safe, just redundant network work).
    pub async fn get_or_pull<F, Fut>(
        &self,
        reference: &str,
        pull: F,
    ) -> StratumResult<Arc<Image>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StratumResult<Image>>,
    {
        if let Some(hit) = self.lookup(reference) {
            tracing::debug!(reference, "Base image cache hit");
            return Ok(hit);
        }

        tracing::info!(reference, "Base image cache miss, pulling");
        let image = Arc::new(pull().await?);

        let mut entries = self.entries.write();
        entries.insert(reference.to_string(), Arc::clone(&image));
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::layer::{BuildArtifact, LayerBuilder};
    use crate::manifest::{
        ConfigFile, DOCKER_CONFIG, DOCKER_MANIFEST, Descriptor, ImageManifest, Rootfs,
        RuntimeConfig,
    };

    fn pulled_image() -> Image {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        std::fs::write(&path, b"base").unwrap();
        let layer =
            LayerBuilder::build(&[BuildArtifact::executable(path, "/bin/app")]).unwrap();

        let config = ConfigFile {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: Some(RuntimeConfig::default()),
            rootfs: Rootfs {
                fs_type: "layers".to_string(),
                diff_ids: vec![layer.diff_id.clone()],
            },
            extra: serde_json::Map::new(),
        };
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(DOCKER_MANIFEST.to_string()),
            config: Descriptor {
                media_type: DOCKER_CONFIG.to_string(),
                digest: crate::layer::sha256_hex(&config_bytes),
                size: config_bytes.len() as u64,
            },
            layers: vec![Descriptor {
                media_type: layer.media_type.clone(),
                digest: layer.digest.clone(),
                size: layer.size,
            }],
            extra: serde_json::Map::new(),
        };
        Image::new(manifest, config, vec![layer]).unwrap()
    }

    #[tokio::test]
    async fn hit_skips_the_pull() {
        let cache = ImageCache::new();
        let pulls = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .get_or_pull("example.com/base:v1", || {
                    pulls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(pulled_image()) }
                })
                .await
                .unwrap();
        }

        assert_eq!(pulls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn failed_pull_caches_nothing() {
        let cache = ImageCache::new();
        let result = cache
            .get_or_pull("example.com/base:v1", || async {
                Err(stratum_common::StratumError::Network {
                    message: "connection refused".to_string(),
                })
            })
            .await;

        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn concurrent_misses_pull_at_most_once_each() {
        const TASKS: usize = 8;

        let cache = Arc::new(ImageCache::new());
        let pulls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let pulls = Arc::clone(&pulls);
                tokio::spawn(async move {
                    cache
                        .get_or_pull("example.com/base:v1", || {
                            pulls.fetch_add(1, Ordering::SeqCst);
                            async {
                                tokio::task::yield_now().await;
                                Ok(pulled_image())
                            }
                        })
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let pulled = pulls.load(Ordering::SeqCst);
        assert!(pulled >= 1 && pulled <= TASKS, "pulled {pulled} times");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn keys_are_literal_strings() {
        let cache = ImageCache::new();
        for reference in ["alpine", "docker.io/library/alpine:latest"] {
            cache
                .get_or_pull(reference, || async { Ok(pulled_image()) })
                .await
                .unwrap();
        }
        // Same image, two spellings, two entries: keys are not normalized.
        assert_eq!(cache.len(), 2);
    }
}
