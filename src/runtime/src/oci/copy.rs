//! Image copy into a tagged OCI layout.
//!
//! Copies an image from any supported transport into a local OCI layout,
//! checking every blob against its digest and recording the image under a
//! tag in `index.json`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sandbox_forge_core::config::DEFAULT_ARCH;
use sandbox_forge_core::error::{Result, SandboxError};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::credentials::CredentialStore;
use super::layout::{LayoutError, OciLayout, REF_NAME_ANNOTATION};
use super::policy::PolicyContext;
use super::registry::{RegistryAuth, RegistryPuller};
use super::transport::{ImageName, OciLayoutReference};

/// Media type of an OCI image manifest.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Errors raised while copying an image. Surfaced as `FetchFailed`.
#[derive(Debug, Error)]
pub(crate) enum CopyError {
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("digest mismatch for {expected}: content hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("unsupported digest '{0}'")]
    UnsupportedDigest(String),

    #[error("destination {0} has no tag")]
    MissingTag(String),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("{0}")]
    Registry(String),
}

/// Descriptor of the manifest recorded in `index.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ManifestRef {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// Options of a copy.
pub struct CopyOptions {
    /// Receives human-readable progress lines; `None` copies silently
    pub report_writer: Option<Box<dyn Write + Send>>,

    /// Architecture selected from multi-arch images
    pub arch: String,

    /// Registry credentials (`~/.docker/config.json` when unset)
    pub credentials: Option<CredentialStore>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            report_writer: Some(Box::new(io::stderr())),
            arch: DEFAULT_ARCH.to_string(),
            credentials: None,
        }
    }
}

/// Result of a successful copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedImage {
    /// Digest of the manifest in the destination layout
    pub manifest_digest: String,

    /// Tag the image was recorded under
    pub tag: String,
}

/// Copy `src` into the layout named by `dest`, if `policy` allows it.
///
/// The destination directory is created when missing. Any failure is
/// reported as `FetchFailed` naming the source image.
pub async fn copy_image(
    policy: &PolicyContext,
    dest: &OciLayoutReference,
    src: &ImageName,
    options: CopyOptions,
) -> Result<CopiedImage> {
    policy.is_image_allowed(src)?;

    let CopyOptions {
        report_writer,
        arch,
        credentials,
    } = options;
    let mut report = report_writer.unwrap_or_else(|| Box::new(io::sink()));

    tracing::info!(source = %src, dest = %dest, arch = %arch, "Copying image");

    let copied = copy_inner(dest, src, &arch, credentials, report.as_mut())
        .await
        .map_err(|e| SandboxError::fetch_failed(src.to_string(), e.to_string()))?;
    let _ = report.flush();

    tracing::info!(
        source = %src,
        digest = %copied.manifest_digest,
        tag = %copied.tag,
        "Image copied"
    );
    Ok(copied)
}

async fn copy_inner(
    dest: &OciLayoutReference,
    src: &ImageName,
    arch: &str,
    credentials: Option<CredentialStore>,
    report: &mut (dyn Write + Send),
) -> std::result::Result<CopiedImage, CopyError> {
    let tag = dest
        .tag
        .clone()
        .ok_or_else(|| CopyError::MissingTag(dest.to_string()))?;
    let writer = LayoutWriter::create(dest.dir())?;

    let manifest = match src {
        ImageName::Docker(reference) => {
            let store = match credentials {
                Some(store) => Some(store),
                None => CredentialStore::default_path().ok(),
            };
            let auth = RegistryAuth::resolve(reference.registry(), store.as_ref());
            RegistryPuller::with_auth(auth, arch)
                .pull_into(reference, &writer, report)
                .await?
        }
        ImageName::Oci(layout) => copy_from_layout(layout, arch, &writer, report)?,
    };

    writer.tag_manifest(&manifest, &tag)?;

    Ok(CopiedImage {
        manifest_digest: manifest.digest,
        tag,
    })
}

/// Copy one image between local layouts.
fn copy_from_layout(
    src: &OciLayoutReference,
    arch: &str,
    writer: &LayoutWriter,
    report: &mut (dyn Write + Send),
) -> std::result::Result<ManifestRef, CopyError> {
    let layout = OciLayout::open(src.dir())?;
    let image = layout.resolve(src.tag.as_deref(), arch)?;

    let _ = writeln!(report, "Getting image source signatures");
    for layer in image.manifest.layers() {
        let _ = writeln!(report, "Copying blob {}", layer.digest());
        writer.copy_blob(&layout.blob_path(layer.digest()), layer.digest())?;
    }
    let config_digest = image.manifest.config().digest();
    let _ = writeln!(report, "Copying config {}", config_digest);
    writer.copy_blob(&layout.blob_path(config_digest), config_digest)?;

    let manifest_path = layout.blob_path(&image.manifest_digest);
    writer.copy_blob(&manifest_path, &image.manifest_digest)?;
    let size = fs::metadata(&manifest_path)
        .map_err(|source| CopyError::Io {
            path: manifest_path.clone(),
            source,
        })?
        .len();
    let _ = writeln!(report, "Writing manifest to image destination");

    Ok(ManifestRef {
        media_type: image
            .manifest
            .media_type()
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string()),
        digest: image.manifest_digest,
        size,
    })
}

/// Writes blobs and the tagged index of an OCI layout.
#[derive(Debug)]
pub(crate) struct LayoutWriter {
    root: PathBuf,
}

impl LayoutWriter {
    /// Prepare `root` as an OCI layout.
    pub fn create(root: &Path) -> std::result::Result<Self, CopyError> {
        let blobs = root.join("blobs").join("sha256");
        fs::create_dir_all(&blobs).map_err(|source| CopyError::Io {
            path: blobs.clone(),
            source,
        })?;
        let marker = root.join("oci-layout");
        fs::write(&marker, OCI_LAYOUT_CONTENT).map_err(|source| CopyError::Io {
            path: marker.clone(),
            source,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Path of the blob `digest`. Only sha256 digests are accepted.
    pub fn blob_path(&self, digest: &str) -> std::result::Result<PathBuf, CopyError> {
        let hex = sha256_hex(digest)?;
        Ok(self.root.join("blobs").join("sha256").join(hex))
    }

    /// Whether the blob exists and matches its digest.
    pub fn has_verified_blob(&self, digest: &str) -> bool {
        matches!(self.blob_path(digest), Ok(path) if path.is_file())
            && self.verify_blob(digest).is_ok()
    }

    /// Hash the stored blob and compare it with `digest`. A mismatching blob
    /// is removed.
    pub fn verify_blob(&self, digest: &str) -> std::result::Result<(), CopyError> {
        let path = self.blob_path(digest)?;
        let mut file = fs::File::open(&path).map_err(|source| CopyError::Io {
            path: path.clone(),
            source,
        })?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher).map_err(|source| CopyError::Io {
            path: path.clone(),
            source,
        })?;
        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));

        if actual != digest {
            let _ = fs::remove_file(&path);
            return Err(CopyError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Copy a blob file into the layout and verify it.
    pub fn copy_blob(&self, src: &Path, digest: &str) -> std::result::Result<(), CopyError> {
        let dest = self.blob_path(digest)?;
        if dest != src {
            fs::copy(src, &dest).map_err(|source| CopyError::Io {
                path: dest.clone(),
                source,
            })?;
        }
        self.verify_blob(digest)
    }

    /// Store `data` as a blob and return its digest.
    pub fn add_blob(&self, data: &[u8]) -> std::result::Result<String, CopyError> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        let path = self.blob_path(&digest)?;
        fs::write(&path, data).map_err(|source| CopyError::Io { path, source })?;
        Ok(digest)
    }

    /// Record `manifest` under `tag` in `index.json`, replacing any manifest
    /// previously carrying that tag.
    pub fn tag_manifest(
        &self,
        manifest: &ManifestRef,
        tag: &str,
    ) -> std::result::Result<(), CopyError> {
        let index_path = self.root.join("index.json");
        let mut manifests: Vec<serde_json::Value> = match fs::read_to_string(&index_path) {
            Ok(content) => serde_json::from_str::<serde_json::Value>(&content)
                .ok()
                .and_then(|index| index.get("manifests").and_then(|m| m.as_array()).cloned())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        manifests.retain(|entry| {
            entry
                .pointer("/annotations")
                .and_then(|a| a.get(REF_NAME_ANNOTATION))
                .and_then(|v| v.as_str())
                != Some(tag)
        });

        let mut annotations = serde_json::Map::new();
        annotations.insert(REF_NAME_ANNOTATION.to_string(), tag.into());
        manifests.push(serde_json::json!({
            "mediaType": manifest.media_type,
            "digest": manifest.digest,
            "size": manifest.size,
            "annotations": annotations,
        }));

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": manifests,
        });
        let content = serde_json::to_string_pretty(&index)
            .map_err(|e| CopyError::Registry(format!("failed to encode index.json: {}", e)))?;
        fs::write(&index_path, content).map_err(|source| CopyError::Io {
            path: index_path.clone(),
            source,
        })
    }
}

fn sha256_hex(digest: &str) -> std::result::Result<&str, CopyError> {
    match digest.split_once(':') {
        Some(("sha256", hex))
            if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) =>
        {
            Ok(hex)
        }
        _ => Err(CopyError::UnsupportedDigest(digest.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layout::testing::{gzip_layer, image_config, write_image, LayerEntry};
    use crate::oci::transport::parse_image_name;
    use sandbox_forge_core::policy::TrustPolicy;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Report writer that can be inspected after the copy.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn quiet() -> CopyOptions {
        CopyOptions {
            report_writer: None,
            ..Default::default()
        }
    }

    fn source_layout() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        let layer = gzip_layer(&[LayerEntry::File("hello.txt", b"hi")]);
        let digest = write_image(
            dir.path(),
            "v1",
            &image_config(&["/bin/sh"], &[], &[]),
            &[layer],
        );
        (dir, digest)
    }

    fn accept_all() -> PolicyContext {
        PolicyContext::new(&TrustPolicy::accept_all()).unwrap()
    }

    #[tokio::test]
    async fn test_copy_between_layouts() {
        let (src_dir, digest) = source_layout();
        let dest_dir = TempDir::new().unwrap();
        let src = parse_image_name(&format!("oci:{}:v1", src_dir.path().display())).unwrap();
        let dest = OciLayoutReference::new(dest_dir.path(), "internal");

        let copied = copy_image(&accept_all(), &dest, &src, quiet()).await.unwrap();

        assert_eq!(copied.manifest_digest, digest);
        assert_eq!(copied.tag, "internal");
        let layout = OciLayout::open(dest_dir.path()).unwrap();
        let image = layout.resolve(Some("internal"), "amd64").unwrap();
        assert_eq!(image.manifest_digest, digest);
        assert!(image.layer_paths.iter().all(|p| p.is_file()));
    }

    #[tokio::test]
    async fn test_copy_reports_progress() {
        let (src_dir, _) = source_layout();
        let dest_dir = TempDir::new().unwrap();
        let src = parse_image_name(&format!("oci:{}", src_dir.path().display())).unwrap();
        let dest = OciLayoutReference::new(dest_dir.path(), "internal");
        let buffer = SharedBuffer::default();

        let options = CopyOptions {
            report_writer: Some(Box::new(buffer.clone())),
            ..Default::default()
        };
        copy_image(&accept_all(), &dest, &src, options).await.unwrap();

        let report = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(report.contains("Copying blob sha256:"));
        assert!(report.contains("Copying config sha256:"));
        assert!(report.ends_with("Writing manifest to image destination\n"));
    }

    #[tokio::test]
    async fn test_copy_rejected_by_policy_writes_nothing() {
        let (src_dir, _) = source_layout();
        let dest_dir = TempDir::new().unwrap();
        let src = parse_image_name(&format!("oci:{}:v1", src_dir.path().display())).unwrap();
        let dest = OciLayoutReference::new(dest_dir.path().join("out"), "internal");
        let policy = PolicyContext::new(&TrustPolicy::reject_all()).unwrap();

        let result = copy_image(&policy, &dest, &src, quiet()).await;

        assert!(matches!(result, Err(SandboxError::FetchFailed { .. })));
        assert!(!dest_dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_copy_detects_corrupt_blob() {
        let (src_dir, _) = source_layout();
        let blobs = src_dir.path().join("blobs/sha256");
        for entry in fs::read_dir(&blobs).unwrap() {
            let path = entry.unwrap().path();
            if fs::read(&path).unwrap().starts_with(&[0x1f, 0x8b]) {
                fs::write(&path, b"tampered").unwrap();
            }
        }
        let dest_dir = TempDir::new().unwrap();
        let src = parse_image_name(&format!("oci:{}:v1", src_dir.path().display())).unwrap();
        let dest = OciLayoutReference::new(dest_dir.path(), "internal");

        let err = copy_image(&accept_all(), &dest, &src, quiet())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("digest mismatch"));
    }

    #[tokio::test]
    async fn test_copy_unknown_source_tag() {
        let (src_dir, _) = source_layout();
        let dest_dir = TempDir::new().unwrap();
        let src = parse_image_name(&format!("oci:{}:v2", src_dir.path().display())).unwrap();
        let dest = OciLayoutReference::new(dest_dir.path(), "internal");

        let err = copy_image(&accept_all(), &dest, &src, quiet())
            .await
            .unwrap_err();

        match err {
            SandboxError::FetchFailed { source_ref, message } => {
                assert!(source_ref.ends_with(":v2"));
                assert!(message.contains("v2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_copy_requires_destination_tag() {
        let (src_dir, _) = source_layout();
        let dest_dir = TempDir::new().unwrap();
        let src = parse_image_name(&format!("oci:{}:v1", src_dir.path().display())).unwrap();
        let dest = OciLayoutReference {
            dir: dest_dir.path().to_path_buf(),
            tag: None,
        };

        let result = copy_image(&accept_all(), &dest, &src, quiet()).await;

        assert!(matches!(result, Err(SandboxError::FetchFailed { message, .. }) if message.contains("no tag")));
    }

    #[test]
    fn test_tag_manifest_replaces_same_tag() {
        let dir = TempDir::new().unwrap();
        let writer = LayoutWriter::create(dir.path()).unwrap();
        let first = ManifestRef {
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            digest: writer.add_blob(b"one").unwrap(),
            size: 3,
        };
        let second = ManifestRef {
            digest: writer.add_blob(b"two").unwrap(),
            ..first.clone()
        };

        writer.tag_manifest(&first, "a").unwrap();
        writer.tag_manifest(&first, "b").unwrap();
        writer.tag_manifest(&second, "a").unwrap();

        let index: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("index.json")).unwrap())
                .unwrap();
        let manifests = index["manifests"].as_array().unwrap();
        assert_eq!(manifests.len(), 2);
        let tagged_a = manifests
            .iter()
            .find(|m| m["annotations"][REF_NAME_ANNOTATION] == "a")
            .unwrap();
        assert_eq!(tagged_a["digest"], second.digest.as_str());
    }

    #[test]
    fn test_blob_path_rejects_unsupported_digests() {
        let dir = TempDir::new().unwrap();
        let writer = LayoutWriter::create(dir.path()).unwrap();

        assert!(writer.blob_path("sha512:abcd").is_err());
        assert!(writer.blob_path("sha256:../../etc/passwd").is_err());
        assert!(writer.blob_path(&format!("sha256:{}", "a".repeat(64))).is_ok());
    }
}
