//! Sandbox Forge Core - Foundational Types
//!
//! Error taxonomy, configuration and the fixed sandbox layout shared by the
//! runtime and the command line.

pub mod config;
pub mod error;
pub mod policy;

// Re-export commonly used types
pub use config::{ForgeConfig, LogLevel, DEFAULT_ARCH, DEFAULT_INTERNAL_TAG};
pub use error::{Result, SandboxError};
pub use policy::{PolicyRequirement, TrustPolicy};

/// Sandbox Forge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reserved control directory inside a sandbox.
pub const CONTROL_DIR: &str = ".singularity.d";

/// Generated run-script, relative to the sandbox root.
pub const RUNSCRIPT_PATH: &str = ".singularity.d/runscript";

/// Generated environment export script, relative to the sandbox root.
///
/// The `10-` prefix sorts it before the base environment's later scripts.
pub const ENV_SCRIPT_PATH: &str = ".singularity.d/env/10-docker2singularity.sh";
