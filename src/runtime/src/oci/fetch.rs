//! Fetching images into a temporary OCI layout.
//!
//! The layout lives in a uniquely named temporary directory owned by a
//! [`TemporaryLayout`] guard, so it is removed on every exit path.

use std::io::Write;
use std::path::{Path, PathBuf};

use sandbox_forge_core::config::ForgeConfig;
use sandbox_forge_core::error::{Result, SandboxError};
use sandbox_forge_core::policy::TrustPolicy;
use tempfile::TempDir;

use super::copy::{copy_image, CopyOptions};
use super::credentials::CredentialStore;
use super::policy::PolicyContext;
use super::transport::{parse_image_name, ImageName, OciLayoutReference};

/// A temporary OCI layout, deleted when dropped.
///
/// Deletion failures are logged and never propagated.
#[derive(Debug)]
pub struct TemporaryLayout {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl TemporaryLayout {
    fn new(dir: TempDir) -> Self {
        let path = dir.path().to_path_buf();
        Self {
            dir: Some(dir),
            path,
        }
    }

    /// Layout directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the layout now, reporting any failure.
    pub fn close(mut self) -> std::io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl Drop for TemporaryLayout {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed temporary layout")
            }
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove temporary layout"
            ),
        }
    }
}

/// An image fetched into a temporary layout.
#[derive(Debug)]
pub struct FetchedImage {
    /// The layout holding the image
    pub layout: TemporaryLayout,

    /// Tag of the image inside the layout
    pub tag: String,

    /// Source the image was fetched from
    pub source: ImageName,

    /// Manifest digest in the layout
    pub manifest_digest: String,
}

/// Resolves image names into temporary OCI layouts.
pub struct FetchOrchestrator {
    policy: TrustPolicy,
    arch: String,
    internal_tag: String,
    temp_dir: Option<PathBuf>,
    temp_prefix: String,
    credentials: Option<CredentialStore>,
}

impl FetchOrchestrator {
    /// Create an orchestrator from the build configuration.
    pub fn new(config: &ForgeConfig) -> Self {
        Self {
            policy: config.trust_policy.clone(),
            arch: config.arch.clone(),
            internal_tag: config.internal_tag.clone(),
            temp_dir: config.temp_dir.clone(),
            temp_prefix: config.temp_prefix.clone(),
            credentials: config.docker_config.clone().map(CredentialStore::new),
        }
    }

    /// Fetch `uri` into a fresh temporary layout.
    ///
    /// The trust policy and the reference are checked before any temporary
    /// storage is allocated. When the copy fails the layout is removed
    /// before returning.
    pub async fn fetch(
        &self,
        uri: &str,
        report_writer: Option<Box<dyn Write + Send>>,
    ) -> Result<FetchedImage> {
        let policy = PolicyContext::new(&self.policy)?;
        let source = parse_image_name(uri)?;

        let layout = self.allocate(uri)?;
        let dest = OciLayoutReference::new(layout.path(), self.internal_tag.clone());

        tracing::info!(
            source = %source,
            layout = %layout.path().display(),
            "Fetching image"
        );

        let options = CopyOptions {
            report_writer,
            arch: self.arch.clone(),
            credentials: self.credentials.clone(),
        };
        let copied = copy_image(&policy, &dest, &source, options).await?;

        Ok(FetchedImage {
            layout,
            tag: copied.tag,
            source,
            manifest_digest: copied.manifest_digest,
        })
    }

    fn allocate(&self, uri: &str) -> Result<TemporaryLayout> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(&self.temp_prefix);
        let dir = match &self.temp_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| {
            SandboxError::fetch_failed(uri, format!("failed to create temporary layout: {}", e))
        })?;

        tracing::debug!(path = %dir.path().display(), "Allocated temporary layout");
        Ok(TemporaryLayout::new(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layout::testing::{gzip_layer, image_config, write_image, LayerEntry};
    use crate::oci::layout::OciLayout;
    use tempfile::TempDir;

    fn config_in(tmp: &TempDir) -> ForgeConfig {
        ForgeConfig {
            temp_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        }
    }

    fn residue(tmp: &TempDir) -> usize {
        std::fs::read_dir(tmp.path()).unwrap().count()
    }

    #[test]
    fn test_temporary_layout_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let layout = TemporaryLayout::new(dir);
        let path = layout.path().to_path_buf();
        assert!(path.exists());

        drop(layout);
        assert!(!path.exists());
    }

    #[test]
    fn test_temporary_layout_close() {
        let layout = TemporaryLayout::new(TempDir::new().unwrap());
        let path = layout.path().to_path_buf();

        layout.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_tolerates_already_removed_directory() {
        let layout = TemporaryLayout::new(TempDir::new().unwrap());
        std::fs::remove_dir_all(layout.path()).unwrap();

        drop(layout);
    }

    #[tokio::test]
    async fn test_fetch_invalid_reference_allocates_nothing() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = FetchOrchestrator::new(&config_in(&tmp));

        let result = orchestrator.fetch("not-a-uri", None).await;

        assert!(matches!(result, Err(SandboxError::InvalidReference { .. })));
        assert_eq!(residue(&tmp), 0);
    }

    #[tokio::test]
    async fn test_fetch_empty_policy_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = ForgeConfig {
            trust_policy: TrustPolicy { default: vec![] },
            ..config_in(&tmp)
        };

        let result = FetchOrchestrator::new(&config)
            .fetch("oci:/nonexistent", None)
            .await;

        assert!(matches!(result, Err(SandboxError::FetchFailed { .. })));
        assert_eq!(residue(&tmp), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_removes_layout() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = FetchOrchestrator::new(&config_in(&tmp));

        let result = orchestrator.fetch("oci:/nonexistent/layout:tag", None).await;

        assert!(matches!(result, Err(SandboxError::FetchFailed { .. })));
        assert_eq!(residue(&tmp), 0);
    }

    #[tokio::test]
    async fn test_fetch_local_layout() {
        let tmp = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let layer = gzip_layer(&[LayerEntry::File("etc/motd", b"welcome\n")]);
        let digest = write_image(
            source.path(),
            "stable",
            &image_config(&[], &["/bin/true"], &[]),
            &[layer],
        );
        let orchestrator = FetchOrchestrator::new(&config_in(&tmp));
        let uri = format!("oci:{}:stable", source.path().display());

        let fetched = orchestrator.fetch(&uri, None).await.unwrap();

        assert_eq!(fetched.tag, "singularity2docker");
        assert_eq!(fetched.manifest_digest, digest);
        let name = fetched.layout.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("docker2singularity_"));
        let layout = OciLayout::open(fetched.layout.path()).unwrap();
        assert!(layout.resolve(Some("singularity2docker"), "amd64").is_ok());

        drop(fetched);
        assert_eq!(residue(&tmp), 0);
    }
}
