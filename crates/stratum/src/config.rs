//! Build configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use stratum_common::{StratumError, StratumResult};
use stratum_image::{ImageReference, PolicyMode, RegistryAuth, RegistryOptions};

use crate::pipeline::BuildRequest;

/// Validated inputs for one build invocation.
///
/// Loaded from a TOML file, overridden by CLI flags, and checked with
/// [`BuildConfig::validate`] before the pipeline starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Base image to overlay onto.
    pub base: String,
    /// Path to the compiled artifact.
    pub artifact: PathBuf,
    /// Destination reference for the composed image.
    pub destination: String,
    /// Name the artifact takes inside the image. Defaults to the artifact's
    /// file name.
    pub app_name: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// Acceptance policy evaluated before push.
    pub policy: PolicyMode,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Attempts per network operation (transport failures only).
    pub retries: u32,
    /// Registry credentials.
    pub auth: Option<AuthConfig>,
}

/// Registry credentials section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base: String::new(),
            artifact: PathBuf::new(),
            destination: String::new(),
            app_name: None,
            insecure: false,
            policy: PolicyMode::default(),
            timeout_secs: 30,
            retries: 3,
            auth: None,
        }
    }
}

impl BuildConfig {
    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> StratumResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| StratumError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Check the config is complete and well-formed.
    pub fn validate(&self) -> StratumResult<()> {
        for (field, value) in [("base", &self.base), ("destination", &self.destination)] {
            if value.is_empty() {
                return Err(StratumError::Config {
                    message: format!("missing required field '{field}'"),
                });
            }
            ImageReference::parse(value)?;
        }
        if self.artifact.as_os_str().is_empty() {
            return Err(StratumError::Config {
                message: "missing required field 'artifact'".to_string(),
            });
        }
        self.app_name()?;
        Ok(())
    }

    /// The name the artifact takes under the image's app directory.
    pub fn app_name(&self) -> StratumResult<String> {
        let name = match &self.app_name {
            Some(name) => name.clone(),
            None => self
                .artifact
                .file_name()
                .and_then(|n| n.to_str())
                .map(ToString::to_string)
                .ok_or_else(|| StratumError::Config {
                    message: format!(
                        "cannot derive app name from artifact path {}",
                        self.artifact.display()
                    ),
                })?,
        };
        if name.is_empty() || name.contains('/') {
            return Err(StratumError::Config {
                message: format!("invalid app name '{name}'"),
            });
        }
        Ok(name)
    }

    /// Transport options for this invocation.
    #[must_use]
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            insecure_tls: self.insecure,
            timeout: Duration::from_secs(self.timeout_secs),
            auth: self.auth.as_ref().map(|auth| RegistryAuth {
                username: auth.username.clone(),
                password: auth.password.clone(),
            }),
        }
    }

    /// The pipeline request this config describes.
    pub fn request(&self) -> StratumResult<BuildRequest> {
        Ok(BuildRequest {
            base: self.base.clone(),
            artifact: self.artifact.clone(),
            destination: self.destination.clone(),
            app_name: self.app_name()?,
        })
    }
}
