//! Gzip-tar extraction for the base environment.
//!
//! Only directories and regular files are materialized; every other entry
//! type (symlinks, hard links, devices, fifos) is skipped. Extraction is not
//! atomic: entries written before a failure stay on disk.

use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use sandbox_forge_core::error::{Result, SandboxError};
use tar::{Archive, EntryType};

use crate::fs::{contained_path, create_dir_within, unlink_symlink};

/// Extract a gzip-compressed tar stream into `dst`.
///
/// Directories are created (with missing parents) only when absent, so
/// existing directories keep their permissions. Regular files are created or
/// truncated with the entry's mode and receive the entry's bytes verbatim.
///
/// # Errors
///
/// Returns `ExtractFailed` on gzip or tar decode errors and filesystem write
/// failures, and `UnsafeArchiveEntry` when an entry would land outside `dst`.
pub fn untar<R: Read>(dst: &Path, reader: R) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| write_error(dst, e))?;

    let mut archive = Archive::new(GzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|e| SandboxError::ExtractFailed(format!("failed to read archive: {}", e)))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| SandboxError::ExtractFailed(format!("failed to read entry: {}", e)))?;

        let entry_path = entry
            .path()
            .map_err(|e| SandboxError::ExtractFailed(format!("invalid entry path: {}", e)))?
            .into_owned();
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        let target = contained_path(dst, &entry_path)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                if fs::symlink_metadata(&target).is_err() {
                    create_dir(dst, &target, mode, &entry_path)?;
                }
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    create_dir_within(dst, parent, &entry_path)?;
                }
                write_file(&target, mode, &mut entry)?;
            }
            other => {
                tracing::debug!(
                    entry = %entry_path.display(),
                    kind = ?other,
                    "Skipping unsupported archive entry"
                );
            }
        }
    }

    Ok(())
}

fn create_dir(root: &Path, target: &Path, mode: u32, entry_path: &Path) -> Result<()> {
    create_dir_within(root, target, entry_path)?;
    set_mode(target, mode)?;
    tracing::debug!(dir = %target.display(), "Created directory");
    Ok(())
}

fn write_file(target: &Path, mode: u32, contents: &mut impl Read) -> Result<()> {
    // A symlink is replaced, never written through.
    unlink_symlink(target).map_err(|e| write_error(target, e))?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(target).map_err(|e| write_error(target, e))?;
    io::copy(contents, &mut file).map_err(|e| write_error(target, e))?;
    set_mode(target, mode)?;

    tracing::debug!(path = %target.display(), mode = format_args!("{:o}", mode), "Extracted file");
    Ok(())
}

/// Apply the archive mode exactly, independent of the process umask.
fn set_mode(target: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(mode))
            .map_err(|e| write_error(target, e))?;
    }
    #[cfg(not(unix))]
    let _ = (target, mode);
    Ok(())
}

fn write_error(path: &Path, err: io::Error) -> SandboxError {
    SandboxError::ExtractFailed(format!("{}: {}", path.display(), err))
}
