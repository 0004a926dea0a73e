//! Image reference parsing.

use std::str::FromStr;

use stratum_common::{StratumError, StratumResult};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (may include a port).
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub target: RefTarget,
}

/// Tag or digest part of a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    /// A tag (e.g. "latest").
    Tag(String),
    /// A digest (e.g. "sha256:abc123...").
    Digest(String),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `alpine:3.19` -> docker.io/library/alpine:3.19
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `registry.local:5000/org/app:v1` -> registry.local:5000/org/app:v1
    ///
    /// The canonical form produced by [`ImageReference::canonical`]
    /// round-trips through this parser.
    pub fn parse(reference: &str) -> StratumResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(StratumError::Reference {
                reference: reference.to_string(),
            });
        }

        // Split off digest or tag
        let (name, target) = if let Some(idx) = reference.find('@') {
            let (name, digest) = reference.split_at(idx);
            let digest = &digest[1..];
            if !digest.contains(':') {
                return Err(StratumError::Reference {
                    reference: reference.to_string(),
                });
            }
            (name, RefTarget::Digest(digest.to_string()))
        } else if let Some(idx) = reference.rfind(':') {
            // A colon followed by a slash is a registry port, not a tag
            let candidate = &reference[idx + 1..];
            if candidate.contains('/') {
                (reference, RefTarget::Tag(Self::DEFAULT_TAG.to_string()))
            } else {
                let (name, tag) = reference.split_at(idx);
                (name, RefTarget::Tag(tag[1..].to_string()))
            }
        } else {
            (reference, RefTarget::Tag(Self::DEFAULT_TAG.to_string()))
        };

        if name.is_empty() {
            return Err(StratumError::Reference {
                reference: reference.to_string(),
            });
        }

        // Split registry and repository
        let (registry, repository) = match name.find('/') {
            Some(first_slash) => {
                let head = &name[..first_slash];
                // Hostnames carry a dot, a port, or are localhost; anything
                // else is a Docker Hub namespace
                if head.contains('.') || head.contains(':') || head == "localhost" {
                    (head.to_string(), name[first_slash + 1..].to_string())
                } else {
                    (Self::DEFAULT_REGISTRY.to_string(), name.to_string())
                }
            }
            // Official image (e.g. "alpine" -> "library/alpine")
            None => (
                Self::DEFAULT_REGISTRY.to_string(),
                format!("library/{name}"),
            ),
        };

        if repository.is_empty() {
            return Err(StratumError::Reference {
                reference: reference.to_string(),
            });
        }

        Ok(Self {
            registry,
            repository,
            target,
        })
    }

    /// The canonical string form of this reference.
    #[must_use]
    pub fn canonical(&self) -> String {
        match &self.target {
            RefTarget::Tag(t) => format!("{}/{}:{}", self.registry, self.repository, t),
            RefTarget::Digest(d) => format!("{}/{}@{}", self.registry, self.repository, d),
        }
    }

    /// The tag or digest as it appears in registry URLs.
    #[must_use]
    pub fn target_str(&self) -> &str {
        match &self.target {
            RefTarget::Tag(t) | RefTarget::Digest(t) => t,
        }
    }
}

impl FromStr for ImageReference {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}
