//! Policy-gated image publishing.

use std::sync::Arc;

use stratum_common::StratumResult;

use crate::image::Image;
use crate::policy::AcceptancePolicy;
use crate::reference::ImageReference;
use crate::registry::RegistryTransport;

/// Pushes composed images after policy evaluation and integrity checks.
pub struct Publisher {
    transport: Arc<dyn RegistryTransport>,
    policy: Box<dyn AcceptancePolicy>,
}

impl Publisher {
    /// Create a publisher over the given transport and policy.
    pub fn new(transport: Arc<dyn RegistryTransport>, policy: Box<dyn AcceptancePolicy>) -> Self {
        Self { transport, policy }
    }

    /// Publish `image` to `destination`.
    ///
    /// The acceptance policy runs first, then every layer is re-verified
    /// against its digest; only then does transport start. Fails with
    /// `PolicyViolation`, `Integrity`, or a transport/registry error.
    pub async fn push(&self, image: &Image, destination: &ImageReference) -> StratumResult<()> {
        tracing::debug!(policy = self.policy.name(), "Evaluating acceptance policy");
        self.policy.evaluate(image)?;
        image.verify_layers()?;

        self.transport.push(image, destination).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stratum_common::StratumError;

    use super::*;
    use crate::layer::{Layer, sha256_hex};
    use crate::manifest::{
        ConfigFile, DOCKER_CONFIG, DOCKER_LAYER_GZIP, DOCKER_MANIFEST, Descriptor, ImageManifest,
        Rootfs, RuntimeConfig,
    };
    use crate::policy::{AllowUnsigned, DenyUnsigned};

    #[derive(Default)]
    struct RecordingTransport {
        pushes: AtomicUsize,
    }

    #[async_trait]
    impl RegistryTransport for RecordingTransport {
        async fn pull(&self, reference: &ImageReference) -> StratumResult<Image> {
            Err(StratumError::NotFound {
                reference: reference.canonical(),
            })
        }

        async fn push(&self, _image: &Image, _reference: &ImageReference) -> StratumResult<()> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn unsigned_image() -> Image {
        let content: &[u8] = b"layer bytes";
        let layer = Layer {
            media_type: DOCKER_LAYER_GZIP.to_string(),
            digest: sha256_hex(content),
            diff_id: sha256_hex(content),
            size: content.len() as u64,
            data: Bytes::from_static(content),
        };
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
                digest: sha256_hex(&config_bytes),
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
    async fn strict_policy_blocks_before_transport() {
        let transport = Arc::new(RecordingTransport::default());
        let publisher = Publisher::new(Arc::clone(&transport) as _, Box::new(DenyUnsigned));
        let destination = ImageReference::parse("example.com/out:latest").unwrap();

        let err = publisher.push(&unsigned_image(), &destination).await;
        assert!(matches!(err, Err(StratumError::PolicyViolation { .. })));
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn allow_unsigned_pushes() {
        let transport = Arc::new(RecordingTransport::default());
        let publisher = Publisher::new(Arc::clone(&transport) as _, Box::new(AllowUnsigned));
        let destination = ImageReference::parse("example.com/out:latest").unwrap();

        publisher.push(&unsigned_image(), &destination).await.unwrap();
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupted_layer_is_an_integrity_error() {
        let transport = Arc::new(RecordingTransport::default());
        let publisher = Publisher::new(Arc::clone(&transport) as _, Box::new(AllowUnsigned));
        let destination = ImageReference::parse("example.com/out:latest").unwrap();

        let image = unsigned_image();
        let mut corrupted_layer = image.layers()[0].clone();
        corrupted_layer.data = Bytes::from_static(b"tampered");
        let corrupted = Image::new(
            image.manifest().clone(),
            image.config_file().clone(),
            vec![corrupted_layer],
        )
        .unwrap();

        let err = publisher.push(&corrupted, &destination).await;
        assert!(matches!(err, Err(StratumError::Integrity { .. })));
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 0);
    }
}
