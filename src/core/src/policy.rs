//! Image trust policy.
//!
//! Serialized in the same shape as a containers `policy.json`:
//!
//! ```json
//! { "default": [ { "type": "insecureAcceptAnything" } ] }
//! ```

use serde::{Deserialize, Serialize};

/// A single acceptance rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PolicyRequirement {
    /// Accept the image without any verification
    InsecureAcceptAnything,
    /// Refuse the image
    Reject,
}

/// Rule set deciding whether a fetched image may be used.
///
/// All requirements in `default` must accept the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
    pub default: Vec<PolicyRequirement>,
}

impl TrustPolicy {
    /// Policy that accepts every image unconditionally.
    pub fn accept_all() -> Self {
        Self {
            default: vec![PolicyRequirement::InsecureAcceptAnything],
        }
    }

    /// Policy that refuses every image.
    pub fn reject_all() -> Self {
        Self {
            default: vec![PolicyRequirement::Reject],
        }
    }
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self::accept_all()
    }
}
