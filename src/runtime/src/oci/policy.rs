//! Trust policy evaluation.

use sandbox_forge_core::error::{Result, SandboxError};
use sandbox_forge_core::policy::{PolicyRequirement, TrustPolicy};

use super::transport::ImageName;

/// A trust policy prepared for evaluating images.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    requirements: Vec<PolicyRequirement>,
}

impl PolicyContext {
    /// Prepare `policy` for evaluation.
    ///
    /// A policy without requirements would accept nothing meaningful and is
    /// refused.
    pub fn new(policy: &TrustPolicy) -> Result<Self> {
        if policy.default.is_empty() {
            return Err(SandboxError::fetch_failed(
                "trust policy",
                "policy has no default requirements",
            ));
        }
        Ok(Self {
            requirements: policy.default.clone(),
        })
    }

    /// Check whether `image` may be used. Every requirement must accept it.
    pub fn is_image_allowed(&self, image: &ImageName) -> Result<()> {
        for requirement in &self.requirements {
            match requirement {
                PolicyRequirement::InsecureAcceptAnything => {}
                PolicyRequirement::Reject => {
                    tracing::warn!(image = %image, "Image rejected by trust policy");
                    return Err(SandboxError::fetch_failed(
                        image.to_string(),
                        "image rejected by trust policy",
                    ));
                }
            }
        }
        Ok(())
    }
}
