//! The per-invocation compose pipeline.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stratum_common::{Stage, StratumError, StratumResult};
use stratum_image::policy::AcceptancePolicy;
use stratum_image::{
    BuildArtifact, ImageCache, ImageReference, LayerBuilder, Publisher, RegistryTransport,
};

/// Directory the artifact lands in inside the image.
pub const APP_DIR: &str = "/usr/local/app";

/// Bounded exponential backoff for transport-class failures.
///
/// Pull and push are idempotent at the reference level, so transport errors
/// are retried; input and integrity errors never are.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per operation.
    pub attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// One build invocation's inputs.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Base image reference string. Used verbatim as the cache key.
    pub base: String,
    /// Path to the artifact binary.
    pub artifact: PathBuf,
    /// Destination reference string.
    pub destination: String,
    /// Name the artifact takes under [`APP_DIR`].
    pub app_name: String,
}

/// Summary of a successful invocation.
#[derive(Debug, Clone)]
pub struct ComposedImage {
    /// Manifest digest of the published image.
    pub digest: String,
    /// Canonical destination reference.
    pub destination: String,
    /// Layer count of the published image.
    pub layers: usize,
}

/// Drives one build invocation through its stages.
///
/// Stages run strictly in order: validate → resolve → package → compose →
/// publish. A failure in any stage aborts the invocation, annotated with
/// the stage it surfaced in. The cache is shared across invocations; all
/// other state is per-invocation.
pub struct Pipeline {
    cache: Arc<ImageCache>,
    transport: Arc<dyn RegistryTransport>,
    publisher: Publisher,
    retry: RetryPolicy,
}

impl Pipeline {
    /// Create a pipeline over a shared cache, transport, and policy.
    pub fn new(
        cache: Arc<ImageCache>,
        transport: Arc<dyn RegistryTransport>,
        policy: Box<dyn AcceptancePolicy>,
    ) -> Self {
        let publisher = Publisher::new(Arc::clone(&transport), policy);
        Self {
            cache,
            transport,
            publisher,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run one invocation to completion.
    pub async fn run(&self, request: &BuildRequest) -> StratumResult<ComposedImage> {
        // Validate: fail fast before any network activity
        let artifact = BuildArtifact::executable(
            &request.artifact,
            format!("{APP_DIR}/{}", request.app_name),
        );
        artifact.validate().map_err(|e| e.at(Stage::Validate))?;
        let base_ref =
            ImageReference::parse(&request.base).map_err(|e| e.at(Stage::Validate))?;
        let destination =
            ImageReference::parse(&request.destination).map_err(|e| e.at(Stage::Validate))?;
        tracing::info!(base = %base_ref, destination = %destination, "Starting compose");

        // Resolve the base image through the shared cache
        let base = self
            .cache
            .get_or_pull(&request.base, || {
                let transport = Arc::clone(&self.transport);
                let reference = base_ref.clone();
                let retry = self.retry.clone();
                async move { with_retry(&retry, "pull", || transport.pull(&reference)).await }
            })
            .await
            .map_err(|e| e.at(Stage::Resolve))?;

        // Package the artifact into a layer, staged in a directory that is
        // removed on every exit path
        let staging = tempfile::tempdir().map_err(|e| StratumError::Io(e).at(Stage::Package))?;
        let staged =
            stage_artifact(&artifact, staging.path()).map_err(|e| e.at(Stage::Package))?;
        let layer =
            LayerBuilder::build(std::slice::from_ref(&staged)).map_err(|e| e.at(Stage::Package))?;

        // Compose: append the layer, rewrite the runtime config
        let entrypoint = vec![format!("{APP_DIR}/{}", request.app_name)];
        let composed = base
            .append_layer(layer)
            .and_then(|image| image.set_runtime(APP_DIR, &entrypoint))
            .map_err(|e| e.at(Stage::Compose))?;

        // Publish
        with_retry(&self.retry, "push", || {
            self.publisher.push(&composed, &destination)
        })
        .await
        .map_err(|e| e.at(Stage::Publish))?;

        let digest = composed.digest().map_err(|e| e.at(Stage::Publish))?;
        tracing::info!(digest = %digest, destination = %destination, "Compose complete");
        Ok(ComposedImage {
            digest,
            destination: destination.canonical(),
            layers: composed.layers().len(),
        })
    }
}

/// Copy the artifact into the staging tree with its required mode.
fn stage_artifact(artifact: &BuildArtifact, staging: &Path) -> StratumResult<BuildArtifact> {
    let relative = artifact.destination.trim_start_matches('/');
    let staged_path = staging.join(relative);
    if let Some(parent) = staged_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&artifact.source, &staged_path)?;

    let mut permissions = std::fs::metadata(&staged_path)?.permissions();
    permissions.set_mode(artifact.mode);
    std::fs::set_permissions(&staged_path, permissions)?;

    tracing::debug!(
        source = %artifact.source.display(),
        staged = %staged_path.display(),
        "Artifact staged"
    );
    Ok(BuildArtifact {
        source: staged_path,
        destination: artifact.destination.clone(),
        mode: artifact.mode,
    })
}

/// Run `operation`, retrying transport-class failures with exponential
/// backoff up to the policy's attempt budget.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut run: F,
) -> StratumResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StratumResult<T>>,
{
    let mut delay = policy.initial_backoff;
    let mut attempt = 1u32;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transport() && attempt < policy.attempts => {
                tracing::warn!(operation, attempt, error = %err, "Transport error, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
