//! OCI image layout reading.
//!
//! Resolves a tagged image inside a local layout to its manifest, runtime
//! configuration and layer blobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType};
use sandbox_forge_core::error::{Result, SandboxError};
use thiserror::Error;

/// Annotation carrying the tag of a manifest in `index.json`.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Errors raised while reading an OCI layout.
///
/// Stages map these into their own failure kind.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("not a valid OCI layout: missing {what} in {}", .dir.display())]
    Invalid { dir: PathBuf, what: &'static str },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {message}")]
    Parse { what: &'static str, message: String },

    #[error("no manifest tagged '{0}' in index.json")]
    TagNotFound(String),

    #[error("index.json lists {0} manifests; select one by tag")]
    AmbiguousManifest(usize),

    #[error("no manifest for architecture '{0}'")]
    ArchitectureNotFound(String),
}

/// Runtime metadata of an image: what to run and with which environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRuntimeConfiguration {
    /// Entrypoint command
    pub entrypoint: Vec<String>,

    /// Default command arguments
    pub cmd: Vec<String>,

    /// Environment variables as `NAME=VALUE`, in image order
    pub env: Vec<String>,

    /// Working directory
    pub working_dir: Option<String>,

    /// User to run as
    pub user: Option<String>,
}

impl ImageRuntimeConfiguration {
    fn from_oci_config(oci_config: &ImageConfiguration) -> Self {
        let config = oci_config.config();

        Self {
            entrypoint: config
                .as_ref()
                .and_then(|c| c.entrypoint().clone())
                .unwrap_or_default(),
            cmd: config
                .as_ref()
                .and_then(|c| c.cmd().clone())
                .unwrap_or_default(),
            env: config
                .as_ref()
                .and_then(|c| c.env().clone())
                .unwrap_or_default(),
            working_dir: config.as_ref().and_then(|c| c.working_dir().clone()),
            user: config.as_ref().and_then(|c| c.user().clone()),
        }
    }
}

/// A tagged image resolved inside a layout.
#[derive(Debug)]
pub struct ResolvedImage {
    /// Digest of the image manifest
    pub manifest_digest: String,

    /// Image manifest
    pub manifest: ImageManifest,

    /// Raw image configuration
    pub config: ImageConfiguration,

    /// Paths to layer blobs (in order, bottom to top)
    pub layer_paths: Vec<PathBuf>,
}

impl ResolvedImage {
    /// Runtime configuration of the image.
    pub fn runtime_config(&self) -> ImageRuntimeConfiguration {
        ImageRuntimeConfiguration::from_oci_config(&self.config)
    }
}

/// An OCI image layout on disk.
#[derive(Debug)]
pub struct OciLayout {
    root_dir: PathBuf,
    index: ImageIndex,
}

impl OciLayout {
    /// Open an OCI image layout.
    ///
    /// The directory must contain an `oci-layout` file, `index.json` and a
    /// `blobs/` directory.
    pub fn open(path: impl AsRef<Path>) -> std::result::Result<Self, LayoutError> {
        let root_dir = path.as_ref().to_path_buf();

        for what in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(what).exists() {
                return Err(LayoutError::Invalid {
                    dir: root_dir,
                    what,
                });
            }
        }

        let index = read_json(&root_dir.join("index.json"), "index.json")?;
        Ok(Self { root_dir, index })
    }

    /// Root directory of the layout.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Image index of the layout.
    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    /// Path to a blob by digest (`sha256:abc...` → `blobs/sha256/abc...`).
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        blob_path(&self.root_dir, digest)
    }

    /// Resolve the image tagged `tag` for architecture `arch`.
    ///
    /// Without a tag the index must hold a single image. Nested image
    /// indexes are descended by platform architecture.
    pub fn resolve(
        &self,
        tag: Option<&str>,
        arch: &str,
    ) -> std::result::Result<ResolvedImage, LayoutError> {
        let candidates: Vec<&Descriptor> = match tag {
            Some(tag) => self
                .index
                .manifests()
                .iter()
                .filter(|d| ref_name(d) == Some(tag))
                .collect(),
            None => self.index.manifests().iter().collect(),
        };

        let descriptor = match candidates.as_slice() {
            [] => {
                return Err(match tag {
                    Some(tag) => LayoutError::TagNotFound(tag.to_string()),
                    None => LayoutError::AmbiguousManifest(0),
                })
            }
            [single] => *single,
            many => match select_platform(many, arch) {
                Some(d) => d,
                None if tag.is_none() => return Err(LayoutError::AmbiguousManifest(many.len())),
                None => return Err(LayoutError::ArchitectureNotFound(arch.to_string())),
            },
        };

        let manifest_descriptor = self.descend(descriptor, arch)?;
        let manifest_digest = manifest_descriptor.digest().to_string();
        let manifest: ImageManifest =
            read_json(&self.blob_path(&manifest_digest), "image manifest")?;

        let config_digest = manifest.config().digest().to_string();
        let config: ImageConfiguration =
            read_json(&self.blob_path(&config_digest), "image config")?;

        let layer_paths = manifest
            .layers()
            .iter()
            .map(|layer| self.blob_path(layer.digest()))
            .collect();

        tracing::debug!(
            layout = %self.root_dir.display(),
            manifest = %manifest_digest,
            "Resolved image in OCI layout"
        );

        Ok(ResolvedImage {
            manifest_digest,
            manifest,
            config,
            layer_paths,
        })
    }

    /// Follow nested image indexes down to a single image manifest.
    fn descend(
        &self,
        descriptor: &Descriptor,
        arch: &str,
    ) -> std::result::Result<Descriptor, LayoutError> {
        let mut current = descriptor.clone();
        while is_index(current.media_type()) {
            let nested: ImageIndex =
                read_json(&self.blob_path(current.digest()), "nested image index")?;
            let entries: Vec<&Descriptor> = nested.manifests().iter().collect();
            current = select_platform(&entries, arch)
                .cloned()
                .ok_or_else(|| LayoutError::ArchitectureNotFound(arch.to_string()))?;
        }
        Ok(current)
    }
}

/// Read the runtime configuration of the image tagged `tag`.
///
/// Fails with `ReadFailed` when the layout is invalid or the tag is missing.
pub fn read_config(
    layout_dir: &Path,
    tag: &str,
    arch: &str,
) -> Result<ImageRuntimeConfiguration> {
    let layout = OciLayout::open(layout_dir)
        .map_err(|e| SandboxError::ReadFailed(e.to_string()))?;
    let image = layout
        .resolve(Some(tag), arch)
        .map_err(|e| SandboxError::ReadFailed(e.to_string()))?;
    Ok(image.runtime_config())
}

/// Path of a blob by digest below `root_dir`.
pub(crate) fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
    let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
    root_dir.join("blobs").join(algorithm).join(hash)
}

fn ref_name(descriptor: &Descriptor) -> Option<&str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a: &HashMap<String, String>| a.get(REF_NAME_ANNOTATION))
        .map(|s| s.as_str())
}

pub(crate) fn is_index(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageIndex => true,
        MediaType::Other(other) => other == DOCKER_MANIFEST_LIST,
        _ => false,
    }
}

fn select_platform<'a>(descriptors: &[&'a Descriptor], arch: &str) -> Option<&'a Descriptor> {
    descriptors.iter().copied().find(|d| {
        d.platform()
            .as_ref()
            .map_or(false, |p| p.architecture().to_string() == arch)
    })
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    what: &'static str,
) -> std::result::Result<T, LayoutError> {
    let content = std::fs::read_to_string(path).map_err(|source| LayoutError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|e| LayoutError::Parse {
        what,
        message: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for synthesizing OCI layouts in tests.

    use std::fs;
    use std::path::Path;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use sha2::{Digest, Sha256};

    /// Entry of a synthetic layer.
    pub enum LayerEntry<'a> {
        Dir(&'a str),
        File(&'a str, &'a [u8]),
        Symlink(&'a str, &'a str),
    }

    /// Gzip-compressed tar layer built from `entries`.
    pub fn gzip_layer(entries: &[LayerEntry<'_>]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for entry in entries {
            let mut header = tar::Header::new_gnu();
            match entry {
                LayerEntry::Dir(path) => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, path, std::io::empty())
                        .unwrap();
                }
                LayerEntry::File(path, content) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append_data(&mut header, path, *content).unwrap();
                }
                LayerEntry::Symlink(path, target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    builder.append_link(&mut header, path, target).unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Store `data` as a blob and return its digest.
    pub fn write_blob(root: &Path, data: &[u8]) -> String {
        let hex = hex::encode(Sha256::digest(data));
        let dir = root.join("blobs/sha256");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(&hex), data).unwrap();
        format!("sha256:{}", hex)
    }

    /// Write a single-platform image into the layout at `root`, tagged `tag`.
    pub fn write_image(root: &Path, tag: &str, config: &str, layers: &[Vec<u8>]) -> String {
        fs::create_dir_all(root.join("blobs/sha256")).unwrap();
        fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

        let config_digest = write_blob(root, config.as_bytes());
        let layer_descriptors: Vec<serde_json::Value> = layers
            .iter()
            .map(|layer| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": write_blob(root, layer),
                    "size": layer.len(),
                })
            })
            .collect();

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": layer_descriptors,
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = write_blob(root, &manifest_bytes);

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest_bytes.len(),
                "annotations": ref_name_annotations(tag),
            }],
        });
        fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
        manifest_digest
    }

    /// `annotations` object tagging a manifest descriptor.
    pub fn ref_name_annotations(tag: &str) -> serde_json::Value {
        let mut annotations = serde_json::Map::new();
        annotations.insert(super::REF_NAME_ANNOTATION.to_string(), tag.into());
        serde_json::Value::Object(annotations)
    }

    /// Image config with the given entrypoint, command and environment.
    pub fn image_config(entrypoint: &[&str], cmd: &[&str], env: &[&str]) -> String {
        serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Entrypoint": entrypoint,
                "Cmd": cmd,
                "Env": env,
                "WorkingDir": "/",
            },
            "rootfs": { "type": "layers", "diff_ids": [] },
        })
        .to_string()
    }
}
