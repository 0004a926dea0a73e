//! Registry transport: pull and push over the standard v2 HTTP surface.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode, header};
use serde::Deserialize;
use stratum_common::{StratumError, StratumResult};

use crate::image::Image;
use crate::layer::{Layer, sha256_hex};
use crate::manifest::{
    self, ConfigFile, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, ImageManifest, ManifestIndex,
    OCI_INDEX, OCI_MANIFEST,
};
use crate::reference::ImageReference;

/// Transport-level pull and push of images against a registry endpoint.
///
/// [`HttpRegistry`] is the production implementation; alternate backends
/// (and test doubles) plug in behind the same trait.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Pull the image `reference` names: manifest, config, and layer blobs.
    async fn pull(&self, reference: &ImageReference) -> StratumResult<Image>;

    /// Push an image to `reference`, uploading missing blobs first.
    async fn push(&self, image: &Image, reference: &ImageReference) -> StratumResult<()>;
}

/// Registry credentials.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl RegistryAuth {
    fn basic_header(&self) -> String {
        let encoded = BASE64.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

/// Transport options.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Skip TLS certificate verification.
    ///
    /// A documented tradeoff for private registries with self-signed
    /// certificates; never enabled silently.
    pub insecure_tls: bool,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Credentials, if the registry needs them.
    pub auth: Option<RegistryAuth>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            insecure_tls: false,
            timeout: Duration::from_secs(30),
            auth: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

/// Registry client speaking the v2 HTTP protocol.
pub struct HttpRegistry {
    http: Client,
    auth: Option<RegistryAuth>,
    tokens: Mutex<HashMap<String, String>>,
}

impl HttpRegistry {
    /// Build a client from the given options.
    pub fn new(options: RegistryOptions) -> StratumResult<Self> {
        if options.insecure_tls {
            tracing::warn!("TLS certificate verification disabled");
        }
        let http = Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.insecure_tls)
            .build()
            .map_err(|e| StratumError::Network {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            auth: options.auth,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn v2_url(reference: &ImageReference, tail: &str) -> String {
        format!(
            "https://{}/v2/{}/{}",
            reference.registry, reference.repository, tail
        )
    }

    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        reference: &ImageReference,
    ) -> reqwest::RequestBuilder {
        let token = self.tokens.lock().get(&scope_key(reference)).cloned();
        if let Some(token) = token {
            request.bearer_auth(token)
        } else if let Some(auth) = &self.auth {
            request.header(header::AUTHORIZATION, auth.basic_header())
        } else {
            request
        }
    }

    /// Send a request, negotiating a bearer token on 401 and retrying once.
    async fn execute<B>(
        &self,
        reference: &ImageReference,
        actions: &str,
        build: B,
    ) -> StratumResult<Response>
    where
        B: Fn() -> reqwest::RequestBuilder,
    {
        let response = self
            .apply_auth(build(), reference)
            .send()
            .await
            .map_err(|e| transport_error(&reference.registry, &e))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.authenticate(reference, actions, &response).await?;

        let retried = self
            .apply_auth(build(), reference)
            .send()
            .await
            .map_err(|e| transport_error(&reference.registry, &e))?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(StratumError::AuthFailed {
                registry: reference.registry.clone(),
            });
        }
        Ok(retried)
    }

    /// Resolve the `Www-Authenticate` challenge into a bearer token.
    async fn authenticate(
        &self,
        reference: &ImageReference,
        actions: &str,
        response: &Response,
    ) -> StratumResult<()> {
        let auth_failed = || StratumError::AuthFailed {
            registry: reference.registry.clone(),
        };

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(auth_failed)?;
        tracing::debug!(challenge, "Authenticating");

        let (realm, service, scope) =
            parse_bearer_challenge(challenge).ok_or_else(auth_failed)?;
        let scope =
            scope.unwrap_or_else(|| format!("repository:{}:{}", reference.repository, actions));

        let url = format!("{realm}?service={service}&scope={scope}");
        tracing::debug!(url = %url, "Requesting token");

        let mut request = self.http.get(&url);
        if let Some(auth) = &self.auth {
            request = request.header(header::AUTHORIZATION, auth.basic_header());
        }
        let token_response = request
            .send()
            .await
            .map_err(|e| transport_error(&reference.registry, &e))?;
        if !token_response.status().is_success() {
            return Err(auth_failed());
        }

        let token: TokenResponse = token_response.json().await.map_err(|_| auth_failed())?;
        let token = token.token.or(token.access_token).ok_or_else(auth_failed)?;
        self.tokens.lock().insert(scope_key(reference), token);
        Ok(())
    }

    /// Fetch a manifest by tag or digest. Returns the bytes and media type.
    async fn get_manifest(
        &self,
        reference: &ImageReference,
        target: &str,
    ) -> StratumResult<(Bytes, String)> {
        let url = Self::v2_url(reference, &format!("manifests/{target}"));
        let accept = [DOCKER_MANIFEST, OCI_MANIFEST, DOCKER_MANIFEST_LIST, OCI_INDEX].join(", ");
        tracing::debug!(url = %url, "Getting manifest");

        let response = self
            .execute(reference, "pull", || {
                self.http.get(&url).header(header::ACCEPT, accept.clone())
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StratumError::NotFound {
                reference: reference.canonical(),
            });
        }
        if !status.is_success() {
            return Err(StratumError::Registry {
                message: format!("manifest GET {url} returned {status}"),
            });
        }

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DOCKER_MANIFEST)
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(&reference.registry, &e))?;
        Ok((bytes, media_type))
    }

    /// Fetch a blob and verify it against its digest.
    async fn get_blob(&self, reference: &ImageReference, digest: &str) -> StratumResult<Bytes> {
        let url = Self::v2_url(reference, &format!("blobs/{digest}"));
        tracing::debug!(url = %url, "Getting blob");

        let response = self.execute(reference, "pull", || self.http.get(&url)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratumError::Registry {
                message: format!("blob GET {digest} returned {status}"),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(&reference.registry, &e))?;
        let actual = sha256_hex(&bytes);
        if actual != digest {
            return Err(StratumError::Integrity {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    async fn blob_exists(&self, reference: &ImageReference, digest: &str) -> StratumResult<bool> {
        let url = Self::v2_url(reference, &format!("blobs/{digest}"));
        let response = self
            .execute(reference, "pull,push", || self.http.head(&url))
            .await?;
        Ok(response.status().is_success())
    }

    /// Upload a blob unless the registry already has it.
    async fn upload_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        data: Bytes,
    ) -> StratumResult<()> {
        if self.blob_exists(reference, digest).await? {
            tracing::debug!(digest, "Blob already present, skipping upload");
            return Ok(());
        }

        let start_url = Self::v2_url(reference, "blobs/uploads/");
        let response = self
            .execute(reference, "pull,push", || self.http.post(&start_url))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratumError::Registry {
                message: format!("blob upload start returned {status}"),
            });
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StratumError::Registry {
                message: "blob upload start returned no Location header".to_string(),
            })?;
        let upload_url = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("https://{}{}", reference.registry, location)
        };

        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{upload_url}{separator}digest={digest}");
        let response = self
            .execute(reference, "pull,push", || {
                self.http
                    .put(&put_url)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratumError::Registry {
                message: format!("blob upload for {digest} returned {status}"),
            });
        }

        tracing::debug!(digest, size = data.len(), "Blob uploaded");
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &ImageReference,
        media_type: &str,
        bytes: Bytes,
    ) -> StratumResult<()> {
        let url = Self::v2_url(reference, &format!("manifests/{}", reference.target_str()));
        tracing::debug!(url = %url, "Putting manifest");

        let response = self
            .execute(reference, "pull,push", || {
                self.http
                    .put(&url)
                    .header(header::CONTENT_TYPE, media_type.to_string())
                    .body(bytes.clone())
            })
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(StratumError::ManifestRejected {
                reference: reference.canonical(),
                message: format!("{status}: {}", detail.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryTransport for HttpRegistry {
    async fn pull(&self, reference: &ImageReference) -> StratumResult<Image> {
        tracing::info!(reference = %reference, "Pulling image");

        let (mut manifest_bytes, mut media_type) =
            self.get_manifest(reference, reference.target_str()).await?;

        // A multi-platform index points at one manifest per platform
        if manifest::is_index(&media_type) {
            let index: ManifestIndex = serde_json::from_slice(&manifest_bytes)?;
            let entry = select_platform(&index).ok_or_else(|| StratumError::Registry {
                message: format!("manifest index for {reference} lists no manifests"),
            })?;
            let digest = entry.digest.clone();
            tracing::debug!(digest = %digest, "Resolved platform manifest from index");
            (manifest_bytes, media_type) = self.get_manifest(reference, &digest).await?;
        }

        let mut manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
        if manifest.media_type.is_none() {
            manifest.media_type = Some(media_type);
        }

        let config_bytes = self.get_blob(reference, &manifest.config.digest).await?;
        let config: ConfigFile = serde_json::from_slice(&config_bytes)?;
        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(StratumError::Registry {
                message: format!(
                    "config lists {} diff ids for {} manifest layers",
                    config.rootfs.diff_ids.len(),
                    manifest.layers.len()
                ),
            });
        }

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for (descriptor, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
            let data = self.get_blob(reference, &descriptor.digest).await?;
            layers.push(Layer {
                media_type: descriptor.media_type.clone(),
                digest: descriptor.digest.clone(),
                diff_id: diff_id.clone(),
                size: descriptor.size,
                data,
            });
        }

        tracing::info!(reference = %reference, layers = layers.len(), "Pulled image");
        Image::new(manifest, config, layers)
    }

    async fn push(&self, image: &Image, reference: &ImageReference) -> StratumResult<()> {
        tracing::info!(
            reference = %reference,
            layers = image.layers().len(),
            "Pushing image"
        );

        for layer in image.layers() {
            self.upload_blob(reference, &layer.digest, layer.data.clone())
                .await?;
        }

        let config_bytes = Bytes::from(image.config_bytes()?);
        let config_digest = sha256_hex(&config_bytes);
        self.upload_blob(reference, &config_digest, config_bytes)
            .await?;

        let media_type = image
            .manifest()
            .media_type
            .clone()
            .unwrap_or_else(|| DOCKER_MANIFEST.to_string());
        self.put_manifest(reference, &media_type, Bytes::from(image.manifest_bytes()?))
            .await?;

        tracing::info!(reference = %reference, "Pushed image");
        Ok(())
    }
}

fn scope_key(reference: &ImageReference) -> String {
    format!("{}/{}", reference.registry, reference.repository)
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_bearer_challenge(challenge: &str) -> Option<(String, String, Option<String>)> {
    let rest = challenge.trim_start().strip_prefix("Bearer")?;

    let mut params = HashMap::new();
    for part in rest.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            params.insert(key.trim(), value.trim().trim_matches('"'));
        }
    }

    let realm = (*params.get("realm")?).to_string();
    let service = (*params.get("service")?).to_string();
    let scope = params.get("scope").map(|s| (*s).to_string());
    Some((realm, service, scope))
}

/// The image-config spelling of the current CPU architecture.
fn oci_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn select_platform(index: &ManifestIndex) -> Option<&crate::manifest::IndexEntry> {
    index
        .manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == oci_arch())
        })
        .or_else(|| index.manifests.first())
}

fn transport_error(registry: &str, err: &reqwest::Error) -> StratumError {
    if err.is_timeout() {
        return StratumError::Network {
            message: format!("request to {registry} timed out"),
        };
    }

    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }

    let lowered = message.to_lowercase();
    if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("handshake") {
        StratumError::Tls {
            registry: registry.to_string(),
            message,
        }
    } else {
        StratumError::Network { message }
    }
}
