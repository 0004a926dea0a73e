//! Acceptance policies evaluated before publishing.

use serde::Deserialize;
use stratum_common::{StratumError, StratumResult};

use crate::image::Image;

/// Rule deciding whether an image may be published.
///
/// Evaluated by the [`Publisher`](crate::Publisher) before any transport
/// activity. Implementations must be cheap; they run on every push.
pub trait AcceptancePolicy: Send + Sync {
    /// Short policy name, used in logs and rejection messages.
    fn name(&self) -> &'static str;

    /// Accept or reject the image.
    fn evaluate(&self, image: &Image) -> StratumResult<()>;
}

/// Rejects images that carry no verifiable signature.
///
/// Composed images are never signed, so under this policy every push is
/// refused. This is the default: publishing unsigned images must be an
/// explicit choice, valid only for trusted internal registries.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyUnsigned;

impl AcceptancePolicy for DenyUnsigned {
    fn name(&self) -> &'static str {
        "deny-unsigned"
    }

    fn evaluate(&self, image: &Image) -> StratumResult<()> {
        let _ = image;
        Err(StratumError::PolicyViolation {
            policy: self.name().to_string(),
            message: "image carries no signature".to_string(),
        })
    }
}

/// Accepts any image, signed or not.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowUnsigned;

impl AcceptancePolicy for AllowUnsigned {
    fn name(&self) -> &'static str {
        "allow-unsigned"
    }

    fn evaluate(&self, image: &Image) -> StratumResult<()> {
        tracing::debug!(layers = image.layers().len(), "Accepting unsigned image");
        Ok(())
    }
}

/// Policy selector for configuration surfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
    /// Reject unsigned images (the default).
    #[default]
    DenyUnsigned,
    /// Accept unsigned images; for trusted internal registries only.
    AllowUnsigned,
}

impl PolicyMode {
    /// Instantiate the selected policy.
    #[must_use]
    pub fn policy(self) -> Box<dyn AcceptancePolicy> {
        match self {
            Self::DenyUnsigned => Box::new(DenyUnsigned),
            Self::AllowUnsigned => Box::new(AllowUnsigned),
        }
    }
}
