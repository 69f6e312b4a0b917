//! OCI layer application.
//!
//! Applies one filesystem changeset (a possibly compressed tar blob) on top
//! of a root filesystem directory, honoring whiteout markers.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::MultiGzDecoder;
use sandbox_forge_core::error::{Result, SandboxError};
use tar::{Archive, EntryType};
use xz2::read::XzDecoder;

use crate::fs::{contained_path, ensure_existing_within, ensure_within};

/// Prefix marking a whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Whiteout marking its directory as opaque.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Compression of a layer blob, detected from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

impl LayerCompression {
    /// Detect the compression from the first bytes of a blob.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if magic.starts_with(b"BZh") {
            Self::Bzip2
        } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Self::Xz
        } else {
            Self::None
        }
    }
}

/// Apply a single layer blob to `target_dir`.
///
/// Whiteouts are processed first so they only affect content from earlier
/// layers: `.wh.<name>` removes `<name>`, `.wh..wh..opq` empties its
/// directory. All remaining entries are then unpacked with their
/// permissions; regular files, directories, symlinks and hard links keep
/// their type.
///
/// # Errors
///
/// Returns `UnpackFailed` if the blob cannot be read or decoded or the
/// filesystem write fails, and `UnsafeArchiveEntry` if an entry resolves
/// outside of `target_dir`.
pub fn apply_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.exists() {
        return Err(SandboxError::UnpackFailed(format!(
            "layer file not found: {}",
            layer_path.display()
        )));
    }

    fs::create_dir_all(target_dir).map_err(|e| {
        SandboxError::UnpackFailed(format!(
            "failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let removed = apply_whiteouts(layer_path, target_dir)?;
    let unpacked = unpack_entries(layer_path, target_dir)?;

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        whiteouts = removed,
        entries = unpacked,
        "Applied OCI layer"
    );

    Ok(())
}

/// Open a layer blob as a decompressed tar archive.
fn open_layer(layer_path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(layer_path).map_err(|e| {
        SandboxError::UnpackFailed(format!(
            "failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;

    let mut reader = BufReader::new(file);
    let compression =
        LayerCompression::detect(reader.fill_buf().map_err(|e| layer_error(layer_path, e))?);

    let stream: Box<dyn Read> = match compression {
        LayerCompression::Gzip => Box::new(MultiGzDecoder::new(reader)),
        LayerCompression::Bzip2 => Box::new(BzDecoder::new(reader)),
        LayerCompression::Xz => Box::new(XzDecoder::new(reader)),
        LayerCompression::None => Box::new(reader),
    };

    let mut archive = Archive::new(stream);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);
    Ok(archive)
}

/// First pass: delete whatever the layer's whiteouts hide.
fn apply_whiteouts(layer_path: &Path, target_dir: &Path) -> Result<usize> {
    let mut archive = open_layer(layer_path)?;
    let entries = archive.entries().map_err(|e| layer_error(layer_path, e))?;
    let mut removed = 0;

    for entry in entries {
        let entry = entry.map_err(|e| layer_error(layer_path, e))?;
        let entry_path = entry
            .path()
            .map_err(|e| layer_error(layer_path, e))?
            .into_owned();

        let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(WHITEOUT_PREFIX) {
            continue;
        }

        let parent = entry_path.parent().unwrap_or_else(|| Path::new(""));
        let dir = contained_path(target_dir, parent)?;
        if fs::symlink_metadata(&dir).is_err() {
            // Nothing below a missing directory can be hidden.
            continue;
        }
        ensure_within(target_dir, &dir, &entry_path).map_err(as_unpack_error)?;

        if name == OPAQUE_WHITEOUT {
            clear_dir(&dir)?;
        } else if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            if hidden.starts_with(WHITEOUT_PREFIX) {
                // Other AUFS metadata (e.g. `.wh..wh.plnk`)
                continue;
            }
            let victim = contained_path(&dir, Path::new(hidden))?;
            remove_path(&victim)?;
        }

        tracing::debug!(whiteout = %entry_path.display(), "Applied whiteout");
        removed += 1;
    }

    Ok(removed)
}

/// Second pass: unpack every non-whiteout entry.
fn unpack_entries(layer_path: &Path, target_dir: &Path) -> Result<usize> {
    let mut archive = open_layer(layer_path)?;
    let entries = archive.entries().map_err(|e| layer_error(layer_path, e))?;
    let mut unpacked = 0;

    for entry in entries {
        let mut entry = entry.map_err(|e| layer_error(layer_path, e))?;
        let entry_path = entry
            .path()
            .map_err(|e| layer_error(layer_path, e))?
            .into_owned();

        let is_whiteout = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(WHITEOUT_PREFIX));
        if is_whiteout {
            continue;
        }

        let target = contained_path(target_dir, &entry_path)?;
        if target != target_dir {
            // Lower layers may have left a symlink anywhere above the entry.
            if let Some(parent) = target.parent() {
                ensure_existing_within(target_dir, parent, &entry_path)
                    .map_err(as_unpack_error)?;
            }
            replace_mismatched_type(&target, entry.header().entry_type())?;
        }

        // `..` components never reach tar; `contained_path` refused them.
        entry.unpack_in(target_dir).map_err(|e| {
            SandboxError::UnpackFailed(format!(
                "failed to unpack {} from {}: {}",
                entry_path.display(),
                layer_path.display(),
                e
            ))
        })?;
        unpacked += 1;
    }

    Ok(unpacked)
}

/// A directory replacing a non-directory (or the reverse) must first remove
/// what the lower layer left at that path.
fn replace_mismatched_type(target: &Path, entry_type: EntryType) -> Result<()> {
    let Ok(existing) = fs::symlink_metadata(target) else {
        return Ok(());
    };

    let existing_is_dir = existing.is_dir();
    let entry_is_dir = entry_type == EntryType::Directory;
    if existing_is_dir != entry_is_dir {
        remove_path(target)?;
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    let read_dir = fs::read_dir(dir).map_err(|e| {
        SandboxError::UnpackFailed(format!("failed to read {}: {}", dir.display(), e))
    })?;
    for child in read_dir {
        let child = child.map_err(|e| {
            SandboxError::UnpackFailed(format!("failed to read {}: {}", dir.display(), e))
        })?;
        remove_path(&child.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(SandboxError::UnpackFailed(format!(
                "failed to stat {}: {}",
                path.display(),
                e
            )))
        }
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| {
        SandboxError::UnpackFailed(format!("failed to remove {}: {}", path.display(), e))
    })
}

/// Containment checks report I/O trouble as extraction failures; during
/// layer application they are unpack failures.
fn as_unpack_error(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::ExtractFailed(message) => SandboxError::UnpackFailed(message),
        other => other,
    }
}

fn layer_error(layer_path: &Path, err: std::io::Error) -> SandboxError {
    SandboxError::UnpackFailed(format!(
        "failed to read layer {}: {}",
        layer_path.display(),
        err
    ))
}
