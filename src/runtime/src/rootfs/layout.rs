//! Sandbox filesystem layout.
//!
//! Reserved paths inside a provisioned sandbox.

use std::path::{Path, PathBuf};

use sandbox_forge_core::{CONTROL_DIR, ENV_SCRIPT_PATH, RUNSCRIPT_PATH};

/// Environment script directory, relative to the sandbox root.
pub const ENV_DIR: &str = ".singularity.d/env";

/// Paths of the control files of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    root: PathBuf,
}

impl SandboxLayout {
    /// Layout of the sandbox rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Sandbox root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserved control directory.
    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    /// Environment script directory.
    pub fn env_dir(&self) -> PathBuf {
        self.root.join(ENV_DIR)
    }

    /// Generated run-script.
    pub fn runscript(&self) -> PathBuf {
        self.root.join(RUNSCRIPT_PATH)
    }

    /// Generated environment export script.
    pub fn env_script(&self) -> PathBuf {
        self.root.join(ENV_SCRIPT_PATH)
    }
}
