//! End-to-end pipeline tests against an in-memory registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use stratum::pipeline::{BuildRequest, Pipeline, RetryPolicy};
use stratum_common::{Stage, StratumError, StratumResult};
use stratum_image::manifest::{
    ConfigFile, DOCKER_CONFIG, DOCKER_MANIFEST, Descriptor, ImageManifest, Rootfs, RuntimeConfig,
};
use stratum_image::policy::AcceptancePolicy;
use stratum_image::{
    AllowUnsigned, BuildArtifact, DenyUnsigned, Image, ImageCache, ImageReference, LayerBuilder,
    RegistryTransport,
};

/// In-memory registry recording pulls and pushes.
#[derive(Default)]
struct FakeRegistry {
    images: Mutex<HashMap<String, Image>>,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
    transient_failures: AtomicUsize,
}

impl FakeRegistry {
    fn with_base(reference: &str, image: Image) -> Self {
        let registry = Self::default();
        let key = ImageReference::parse(reference).unwrap().canonical();
        registry.images.lock().unwrap().insert(key, image);
        registry
    }

    fn pushed(&self, reference: &str) -> Option<Image> {
        let key = ImageReference::parse(reference).unwrap().canonical();
        self.images.lock().unwrap().get(&key).cloned()
    }
}

#[async_trait]
impl RegistryTransport for FakeRegistry {
    async fn pull(&self, reference: &ImageReference) -> StratumResult<Image> {
        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StratumError::Network {
                message: "connection reset".to_string(),
            });
        }
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.images
            .lock()
            .unwrap()
            .get(&reference.canonical())
            .cloned()
            .ok_or_else(|| StratumError::NotFound {
                reference: reference.canonical(),
            })
    }

    async fn push(&self, image: &Image, reference: &ImageReference) -> StratumResult<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.images
            .lock()
            .unwrap()
            .insert(reference.canonical(), image.clone());
        Ok(())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// A one-layer base image, the shape a pull produces.
fn base_image() -> Image {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("base-bin");
    std::fs::write(&path, b"base contents").unwrap();
    let layer = LayerBuilder::build(&[BuildArtifact::executable(path, "/bin/base")]).unwrap();

    let config = ConfigFile {
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        config: Some(RuntimeConfig {
            env: Some(vec!["PATH=/usr/bin".to_string()]),
            ..RuntimeConfig::default()
        }),
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

fn write_artifact(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("app-bin");
    std::fs::write(&path, b"0123456789").unwrap();
    path
}

fn request(artifact: PathBuf) -> BuildRequest {
    BuildRequest {
        base: "example.com/base:v1".to_string(),
        artifact,
        destination: "example.com/out:latest".to_string(),
        app_name: "main".to_string(),
    }
}

fn pipeline(registry: &Arc<FakeRegistry>, policy: Box<dyn AcceptancePolicy>) -> Pipeline {
    Pipeline::new(
        Arc::new(ImageCache::new()),
        Arc::clone(registry) as Arc<dyn RegistryTransport>,
        policy,
    )
    .with_retry_policy(RetryPolicy {
        attempts: 3,
        initial_backoff: Duration::from_millis(1),
    })
}

#[tokio::test]
async fn composes_and_publishes() {
    let registry = Arc::new(FakeRegistry::with_base("example.com/base:v1", base_image()));
    let dir = tempfile::tempdir().unwrap();

    let outcome = pipeline(&registry, Box::new(AllowUnsigned))
        .run(&request(write_artifact(&dir)))
        .await
        .unwrap();

    assert_eq!(outcome.layers, 2);
    assert_eq!(outcome.destination, "example.com/out:latest");
    assert_eq!(registry.pulls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.pushes.load(Ordering::SeqCst), 1);

    let pushed = registry.pushed("example.com/out:latest").unwrap();
    assert_eq!(pushed.layers().len(), 2);
    assert_eq!(pushed.digest().unwrap(), outcome.digest);

    let runtime = pushed.config_file().config.as_ref().unwrap();
    assert_eq!(runtime.working_dir.as_deref(), Some("/usr/local/app"));
    assert_eq!(
        runtime.entrypoint.as_deref(),
        Some(["/usr/local/app/main".to_string()].as_slice())
    );
    // Untouched fields pass through from the base
    assert_eq!(runtime.env.as_deref(), Some(["PATH=/usr/bin".to_string()].as_slice()));
}

#[tokio::test]
async fn missing_artifact_fails_before_any_network_activity() {
    let registry = Arc::new(FakeRegistry::with_base("example.com/base:v1", base_image()));

    let err = pipeline(&registry, Box::new(AllowUnsigned))
        .run(&request(PathBuf::from("/nonexistent/app-bin")))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Validate));
    assert_eq!(registry.pulls.load(Ordering::SeqCst), 0);
    assert_eq!(registry.pushes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_base_reference_fails_fast() {
    let registry = Arc::new(FakeRegistry::default());
    let dir = tempfile::tempdir().unwrap();

    let mut bad = request(write_artifact(&dir));
    bad.base = "not a reference".to_string();

    let err = pipeline(&registry, Box::new(AllowUnsigned))
        .run(&bad)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Validate));
    assert_eq!(registry.pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn default_policy_blocks_unsigned_publish() {
    let registry = Arc::new(FakeRegistry::with_base("example.com/base:v1", base_image()));
    let dir = tempfile::tempdir().unwrap();

    let err = pipeline(&registry, Box::new(DenyUnsigned))
        .run(&request(write_artifact(&dir)))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Publish));
    match err {
        StratumError::Staged { source, .. } => {
            assert!(matches!(*source, StratumError::PolicyViolation { .. }));
        }
        other => panic!("expected staged error, got {other}"),
    }
    assert_eq!(registry.pushes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cache_amortizes_base_pulls_across_invocations() {
    let registry = Arc::new(FakeRegistry::with_base("example.com/base:v1", base_image()));
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&registry, Box::new(AllowUnsigned));

    for _ in 0..3 {
        pipeline.run(&request(write_artifact(&dir))).await.unwrap();
    }

    assert_eq!(registry.pulls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.pushes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transient_pull_failures_are_retried() {
    let registry = Arc::new(FakeRegistry::with_base("example.com/base:v1", base_image()));
    registry.transient_failures.store(2, Ordering::SeqCst);
    let dir = tempfile::tempdir().unwrap();

    let outcome = pipeline(&registry, Box::new(AllowUnsigned))
        .run(&request(write_artifact(&dir)))
        .await
        .unwrap();

    assert_eq!(outcome.layers, 2);
    assert_eq!(registry.pulls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_base_is_not_retried() {
    let registry = Arc::new(FakeRegistry::default());
    let dir = tempfile::tempdir().unwrap();

    let err = pipeline(&registry, Box::new(AllowUnsigned))
        .run(&request(write_artifact(&dir)))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Resolve));
    // NotFound is permanent, so exactly one pull attempt
    assert_eq!(registry.pulls.load(Ordering::SeqCst), 1);
}
