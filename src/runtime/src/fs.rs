//! Path containment helpers for writing archive content beneath a root.

use sandbox_forge_core::error::{Result, SandboxError};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Join an archive entry path onto `root`, refusing paths that climb out.
///
/// Leading `/` and `.` components are dropped so absolute entry names land
/// inside `root`. Any `..` component is rejected, even when it would cancel
/// out lexically.
pub fn contained_path(root: &Path, entry: &Path) -> Result<PathBuf> {
    let mut target = root.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(SandboxError::UnsafeArchiveEntry {
                    entry: entry.display().to_string(),
                    root: root.to_path_buf(),
                })
            }
        }
    }
    Ok(target)
}

/// Verify that an existing directory inside `root` does not resolve outside
/// of it through a symlink.
///
/// `dir` must already exist; `root` is compared after canonicalization.
pub fn ensure_within(root: &Path, dir: &Path, entry: &Path) -> Result<()> {
    let canonical_root = root.canonicalize().map_err(|e| {
        SandboxError::ExtractFailed(format!("failed to resolve {}: {}", root.display(), e))
    })?;
    let canonical_dir = dir.canonicalize().map_err(|e| {
        SandboxError::ExtractFailed(format!("failed to resolve {}: {}", dir.display(), e))
    })?;

    if canonical_dir.starts_with(&canonical_root) {
        Ok(())
    } else {
        Err(SandboxError::UnsafeArchiveEntry {
            entry: entry.display().to_string(),
            root: root.to_path_buf(),
        })
    }
}

/// Verify that the part of `path` already on disk resolves inside `root`.
///
/// The deepest existing ancestor of `path` (itself included) is checked, so
/// any component still to be created lands beneath `root`.
pub fn ensure_existing_within(root: &Path, path: &Path, entry: &Path) -> Result<()> {
    match path
        .ancestors()
        .find(|ancestor| fs::symlink_metadata(ancestor).is_ok())
    {
        Some(existing) => ensure_within(root, existing, entry),
        None => Ok(()),
    }
}

/// Create `dir` and its missing ancestors below `root` one component at a
/// time. Every existing component is checked before anything is created
/// beneath it.
///
/// `dir` must be `root` or lie lexically beneath it.
pub fn create_dir_within(root: &Path, dir: &Path, entry: &Path) -> Result<()> {
    let relative = dir.strip_prefix(root).map_err(|_| SandboxError::UnsafeArchiveEntry {
        entry: entry.display().to_string(),
        root: root.to_path_buf(),
    })?;

    let mut current = root.to_path_buf();
    ensure_within(root, &current, entry)?;
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(_) => ensure_within(root, &current, entry)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&current).map_err(|e| {
                    SandboxError::ExtractFailed(format!("{}: {}", current.display(), e))
                })?;
            }
            Err(e) => {
                return Err(SandboxError::ExtractFailed(format!(
                    "{}: {}",
                    current.display(),
                    e
                )))
            }
        }
    }
    Ok(())
}

/// Remove a symlink sitting at `path` so a following write creates a new
/// file instead of writing through the link.
pub fn unlink_symlink(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_symlink() => fs::remove_file(path),
        _ => Ok(()),
    }
}
