//! Flattening of an OCI layout image into a root filesystem directory.

use std::path::Path;

use sandbox_forge_core::error::{Result, SandboxError};

use super::layers::apply_layer;
use super::layout::OciLayout;

/// Outcome of unpacking an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackReport {
    /// Digest of the unpacked image manifest
    pub manifest_digest: String,

    /// Number of layers applied
    pub layers: usize,
}

/// Select the image to unpack from a `name=<tag>` reference filter.
fn tag_from_refs(refs: &[&str]) -> Result<Option<String>> {
    let mut tag = None;
    for filter in refs {
        match filter.split_once('=') {
            Some(("name", value)) if !value.is_empty() => tag = Some(value.to_string()),
            _ => {
                return Err(SandboxError::UnpackFailed(format!(
                    "unsupported reference filter '{}'",
                    filter
                )))
            }
        }
    }
    Ok(tag)
}

/// Unpack the image selected by `refs` from the layout at `layout_dir` into
/// `dest_dir`, applying layers bottom to top.
///
/// `refs` holds `name=<tag>` filters; with none, the layout must contain a
/// single image. Content already in `dest_dir` is left in place unless a
/// layer overwrites or whiteouts it.
pub fn unpack_layout(
    layout_dir: &Path,
    dest_dir: &Path,
    arch: &str,
    refs: &[&str],
) -> Result<UnpackReport> {
    let tag = tag_from_refs(refs)?;

    let layout =
        OciLayout::open(layout_dir).map_err(|e| SandboxError::UnpackFailed(e.to_string()))?;
    let image = layout
        .resolve(tag.as_deref(), arch)
        .map_err(|e| SandboxError::UnpackFailed(e.to_string()))?;

    std::fs::create_dir_all(dest_dir).map_err(|e| {
        SandboxError::UnpackFailed(format!(
            "failed to create {}: {}",
            dest_dir.display(),
            e
        ))
    })?;

    tracing::info!(
        layout = %layout_dir.display(),
        dest = %dest_dir.display(),
        manifest = %image.manifest_digest,
        layers = image.layer_paths.len(),
        "Unpacking image"
    );

    for (i, layer_path) in image.layer_paths.iter().enumerate() {
        tracing::debug!(
            layer = i + 1,
            total = image.layer_paths.len(),
            path = %layer_path.display(),
            "Applying layer"
        );
        apply_layer(layer_path, dest_dir)?;
    }

    Ok(UnpackReport {
        manifest_digest: image.manifest_digest,
        layers: image.layer_paths.len(),
    })
}
