//! Common error types for the Stratum toolkit.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StratumError`].
pub type StratumResult<T> = Result<T, StratumError>;

/// Pipeline stage in which a failure surfaced.
///
/// Every invocation moves through these stages in order; a failure in any
/// stage aborts the invocation and is reported with its stage attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Input validation (artifact exists, references parse).
    Validate,
    /// Base image lookup or pull.
    Resolve,
    /// Artifact staging and layer packaging.
    Package,
    /// Layer append and runtime config rewrite.
    Compose,
    /// Policy evaluation and registry push.
    Publish,
}

impl Stage {
    /// Stable lowercase name, used in logs and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Resolve => "resolve",
            Self::Package => "package",
            Self::Compose => "compose",
            Self::Publish => "publish",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common errors across the Stratum toolkit.
#[derive(Error, Diagnostic, Debug)]
pub enum StratumError {
    /// Invalid build input (e.g. missing artifact file).
    #[error("Invalid input: {message}")]
    #[diagnostic(code(stratum::input))]
    Input {
        /// What was wrong with the input.
        message: String,
    },

    /// Malformed image reference.
    #[error("Invalid image reference: {reference}")]
    #[diagnostic(
        code(stratum::reference),
        help("References look like registry.example.com/repo/name:tag")
    )]
    Reference {
        /// The reference string that failed to parse.
        reference: String,
    },

    /// Image not found in the registry.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(stratum::registry::not_found))]
    NotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Registry authentication failed.
    #[error("Registry authentication failed: {registry}")]
    #[diagnostic(
        code(stratum::registry::auth),
        help("Check the [auth] section of the config or the registry credentials")
    )]
    AuthFailed {
        /// Registry host that rejected the credentials.
        registry: String,
    },

    /// TLS handshake or certificate verification failure.
    #[error("TLS error talking to {registry}: {message}")]
    #[diagnostic(
        code(stratum::transport::tls),
        help("For internal registries with self-signed certificates, pass --insecure to skip verification")
    )]
    Tls {
        /// Registry host.
        registry: String,
        /// The underlying TLS failure.
        message: String,
    },

    /// Network-level failure (DNS, TCP, timeout).
    #[error("Network error: {message}")]
    #[diagnostic(code(stratum::transport::network))]
    Network {
        /// The underlying transport failure.
        message: String,
    },

    /// Registry returned a non-success response.
    #[error("Registry error: {message}")]
    #[diagnostic(code(stratum::registry))]
    Registry {
        /// The error message.
        message: String,
    },

    /// Registry rejected a pushed manifest.
    #[error("Registry rejected manifest for {reference}: {message}")]
    #[diagnostic(code(stratum::registry::manifest_rejected))]
    ManifestRejected {
        /// Destination reference.
        reference: String,
        /// Registry response detail.
        message: String,
    },

    /// Content digest did not match the blob it addresses.
    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    #[diagnostic(code(stratum::integrity))]
    Integrity {
        /// The digest the content was addressed by.
        expected: String,
        /// The digest computed over the actual bytes.
        actual: String,
    },

    /// Acceptance policy rejected the image before push.
    #[error("Acceptance policy '{policy}' rejected the image: {message}")]
    #[diagnostic(
        code(stratum::policy),
        help("Pass --allow-unsigned only when publishing to a trusted internal registry")
    )]
    PolicyViolation {
        /// Name of the policy that rejected the image.
        policy: String,
        /// Why the image was rejected.
        message: String,
    },

    /// Image carries no runtime config section.
    #[error("Image has no runtime config section")]
    #[diagnostic(code(stratum::config_missing))]
    ConfigMissing,

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(stratum::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(stratum::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(stratum::serialization))]
    Serialization(String),

    /// Internal invariant violation (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(stratum::internal),
        help("This is a bug, please report it at https://github.com/stratum-build/stratum/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },

    /// A failure annotated with the pipeline stage that produced it.
    #[error("{stage} stage failed: {source}")]
    #[diagnostic(code(stratum::stage))]
    Staged {
        /// Stage in which the failure surfaced.
        stage: Stage,
        /// The underlying failure.
        #[source]
        source: Box<StratumError>,
    },
}

impl StratumError {
    /// Annotate this error with the pipeline stage it surfaced in.
    ///
    /// Already-annotated errors keep their original stage.
    #[must_use]
    pub fn at(self, stage: Stage) -> Self {
        match self {
            staged @ Self::Staged { .. } => staged,
            other => Self::Staged {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage annotation, if any.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Staged { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether this is a transport-class failure worth retrying.
    ///
    /// Pull and push are idempotent at the reference level, so network, TLS,
    /// and auth failures may be retried. Input and integrity failures never
    /// are.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Tls { .. } | Self::AuthFailed { .. } => true,
            Self::Staged { source, .. } => source.is_transport(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StratumError {
    fn from(err: serde_json::Error) -> Self {
        StratumError::Serialization(err.to_string())
    }
}
