//! Runtime scaffolding of a sandbox.
//!
//! Makes an unpacked root filesystem runnable on its own: the base
//! environment hooks, a run-script built from the image entrypoint and
//! command, and an environment export script.

use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use sandbox_forge_core::error::{Result, SandboxError};

use super::layout::SandboxLayout;
use crate::archive::untar;
use crate::fs::{create_dir_within, unlink_symlink};
use crate::oci::ImageRuntimeConfiguration;

/// Base environment archive compiled into the runtime.
static BUNDLED_BASE_ENV: &[u8] = include_bytes!("../../assets/environment.tar.gz");

/// Mode of generated scripts.
const SCRIPT_MODE: u32 = 0o755;

/// Source of the base environment archive (gzip-tar).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BaseEnvironment {
    /// The archive bundled with the runtime
    #[default]
    Bundled,
    /// An archive on disk
    File(PathBuf),
}

impl BaseEnvironment {
    /// The configured archive, or the bundled one.
    pub fn from_config(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::File(path.to_path_buf()),
            None => Self::Bundled,
        }
    }

    fn open(&self) -> Result<Box<dyn Read>> {
        match self {
            Self::Bundled => Ok(Box::new(Cursor::new(BUNDLED_BASE_ENV))),
            Self::File(path) => {
                if !path.is_file() {
                    return Err(SandboxError::BaseEnvMissing(path.clone()));
                }
                let file = File::open(path).map_err(|e| {
                    SandboxError::ExtractFailed(format!("{}: {}", path.display(), e))
                })?;
                Ok(Box::new(file))
            }
        }
    }
}

/// Run-script body: shebang, then the entrypoint and command space-joined.
///
/// Tokens are not shell-quoted, so arguments containing spaces split when
/// the script runs. With no entrypoint and no command the script body is a
/// single space.
pub fn runscript_content(entrypoint: &[String], cmd: &[String]) -> String {
    format!("#!/bin/sh\n{} {}\n", entrypoint.join(" "), cmd.join(" "))
}

/// Environment script body: shebang, then one `export` line per entry in
/// image order.
pub fn env_script_content(env: &[String]) -> String {
    let mut content = String::from("#!/bin/sh\n");
    for entry in env {
        content.push_str("export ");
        content.push_str(entry);
        content.push('\n');
    }
    content
}

/// Writes the runtime scaffolding into a sandbox.
///
/// Every operation overwrites what it produced before, so each can be
/// retried on its own.
#[derive(Debug, Clone)]
pub struct RuntimeScaffolder {
    layout: SandboxLayout,
    base_env: BaseEnvironment,
}

impl RuntimeScaffolder {
    /// Scaffolder for the sandbox at `root`, using the bundled base environment.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: SandboxLayout::new(root),
            base_env: BaseEnvironment::Bundled,
        }
    }

    /// Use a different base environment archive.
    pub fn with_base_env(mut self, base_env: BaseEnvironment) -> Self {
        self.base_env = base_env;
        self
    }

    /// Sandbox layout.
    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    /// Extract the base environment archive into the sandbox.
    ///
    /// # Errors
    ///
    /// `BaseEnvMissing` when a configured archive does not exist,
    /// `ExtractFailed` when it cannot be decoded or written out.
    pub fn insert_base_env(&self) -> Result<()> {
        tracing::debug!(
            sandbox = %self.layout.root().display(),
            base_env = ?self.base_env,
            "Inserting base environment"
        );
        let reader = self.base_env.open()?;
        untar(self.layout.root(), reader)
    }

    /// Write the run-script from the image entrypoint and command.
    pub fn write_runscript(&self, config: &ImageRuntimeConfiguration) -> Result<PathBuf> {
        let path = self.layout.runscript();
        write_script(self.layout.root(), &path, &runscript_content(&config.entrypoint, &config.cmd))?;
        tracing::debug!(path = %path.display(), "Wrote runscript");
        Ok(path)
    }

    /// Write the environment export script from the image environment.
    pub fn write_env_script(&self, config: &ImageRuntimeConfiguration) -> Result<PathBuf> {
        let path = self.layout.env_script();
        write_script(self.layout.root(), &path, &env_script_content(&config.env))?;
        tracing::debug!(path = %path.display(), vars = config.env.len(), "Wrote environment script");
        Ok(path)
    }
}

/// Create or truncate an executable script below `root`.
///
/// Directories on the way must resolve inside `root`, and a symlink left at
/// `path` by the image is replaced rather than followed.
fn write_script(root: &Path, path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_within(root, parent, path).map_err(|e| match e {
            SandboxError::ExtractFailed(message) => SandboxError::write_failed(parent, message),
            other => other,
        })?;
    }
    unlink_symlink(path).map_err(|e| SandboxError::write_failed(path, e))?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(SCRIPT_MODE);
    }

    let mut file = options
        .open(path)
        .map_err(|e| SandboxError::write_failed(path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| SandboxError::write_failed(path, e))?;

    // Existing files keep their old mode on open; umask also applies.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(SCRIPT_MODE))
            .map_err(|e| SandboxError::write_failed(path, e))?;
    }
    Ok(())
}
