//! The immutable image value and its pure transforms.

use stratum_common::{StratumError, StratumResult};

use crate::layer::{Layer, sha256_hex};
use crate::manifest::{ConfigFile, Descriptor, ImageManifest};

/// An immutable container image: manifest, config file, and ordered layers.
///
/// Pulling creates one; composition never mutates an existing value.
/// [`Image::append_layer`] and [`Image::set_runtime`] return new images that
/// share the base's unmodified layers, so a cached base stays valid for
/// concurrent invocations.
#[derive(Debug, Clone)]
pub struct Image {
    manifest: ImageManifest,
    config: ConfigFile,
    layers: Vec<Layer>,
}

impl Image {
    /// Assemble an image from its parts.
    ///
    /// The manifest layer descriptors, config diff IDs, and layer blobs must
    /// line up one to one.
    pub fn new(
        manifest: ImageManifest,
        config: ConfigFile,
        layers: Vec<Layer>,
    ) -> StratumResult<Self> {
        if manifest.layers.len() != layers.len()
            || config.rootfs.diff_ids.len() != layers.len()
        {
            return Err(StratumError::Internal {
                message: format!(
                    "manifest lists {} layers, config lists {} diff ids, {} blobs supplied",
                    manifest.layers.len(),
                    config.rootfs.diff_ids.len(),
                    layers.len()
                ),
            });
        }
        Ok(Self {
            manifest,
            config,
            layers,
        })
    }

    /// The image manifest.
    #[must_use]
    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// The image config file.
    #[must_use]
    pub fn config_file(&self) -> &ConfigFile {
        &self.config
    }

    /// Ordered layers, base first.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Serialized manifest bytes.
    pub fn manifest_bytes(&self) -> StratumResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.manifest)?)
    }

    /// Serialized config blob bytes.
    pub fn config_bytes(&self) -> StratumResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config)?)
    }

    /// Manifest digest of the image.
    pub fn digest(&self) -> StratumResult<String> {
        Ok(sha256_hex(&self.manifest_bytes()?))
    }

    /// Return a new image with `layer` appended to this image's layers.
    ///
    /// The manifest gains the layer's descriptor, the config gains its diff
    /// ID, and the manifest's config descriptor is recomputed. `self` is
    /// untouched.
    pub fn append_layer(&self, layer: Layer) -> StratumResult<Self> {
        let mut config = self.config.clone();
        config.rootfs.diff_ids.push(layer.diff_id.clone());

        let mut manifest = self.manifest.clone();
        manifest.layers.push(Descriptor {
            media_type: layer.media_type.clone(),
            digest: layer.digest.clone(),
            size: layer.size,
        });

        let mut layers = self.layers.clone();
        layers.push(layer);

        Self::with_synced_config(manifest, config, layers)
    }

    /// Return a new image with the working directory and entrypoint replaced.
    ///
    /// Every other runtime config field passes through unchanged. Fails with
    /// [`StratumError::ConfigMissing`] if the image has no runtime config
    /// section.
    pub fn set_runtime(&self, working_dir: &str, entrypoint: &[String]) -> StratumResult<Self> {
        let mut config = self.config.clone();
        let runtime = config.config.as_mut().ok_or(StratumError::ConfigMissing)?;
        runtime.working_dir = Some(working_dir.to_string());
        runtime.entrypoint = Some(entrypoint.to_vec());

        Self::with_synced_config(self.manifest.clone(), config, self.layers.clone())
    }

    /// Re-verify every layer blob against its digest.
    pub fn verify_layers(&self) -> StratumResult<()> {
        for layer in &self.layers {
            layer.verify()?;
        }
        Ok(())
    }

    /// Rebuild the manifest's config descriptor from the (possibly edited)
    /// config file, then assemble the image.
    fn with_synced_config(
        mut manifest: ImageManifest,
        config: ConfigFile,
        layers: Vec<Layer>,
    ) -> StratumResult<Self> {
        let config_bytes = serde_json::to_vec(&config)?;
        manifest.config.digest = sha256_hex(&config_bytes);
        manifest.config.size = config_bytes.len() as u64;
        Self::new(manifest, config, layers)
    }
}
