//! OCI registry client for pulling images into a local layout.
//!
//! Uses the `oci-distribution` crate to interact with container registries
//! (Docker Hub, GHCR, etc.).

use std::io::Write;

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::io::AsyncWriteExt;

use super::copy::{CopyError, LayoutWriter, ManifestRef, OCI_MANIFEST_MEDIA_TYPE};
use super::credentials::CredentialStore;

/// Environment variable holding a fallback registry user.
pub const ENV_REGISTRY_USERNAME: &str = "REGISTRY_USERNAME";

/// Environment variable holding a fallback registry password.
pub const ENV_REGISTRY_PASSWORD: &str = "REGISTRY_PASSWORD";

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match (lookup(ENV_REGISTRY_USERNAME), lookup(ENV_REGISTRY_PASSWORD)) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Credentials for `registry` from the credential store, falling back to
    /// environment variables, then anonymous.
    ///
    /// An unreadable credential file is logged and skipped.
    pub fn resolve(registry: &str, store: Option<&CredentialStore>) -> Self {
        if let Some(store) = store {
            match store.get(registry) {
                Ok(Some((username, password))) => {
                    tracing::debug!(registry, "Using stored registry credentials");
                    return Self::basic(username, password);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(registry, error = %e, "Ignoring registry credential file");
                }
            }
        }
        Self::from_env()
    }

    /// Whether credentials are present.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulls OCI images from container registries.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
    arch: String,
}

impl RegistryPuller {
    /// Create a registry puller selecting `arch` from multi-arch images.
    pub fn with_auth(auth: RegistryAuth, arch: &str) -> Self {
        let target = arch.to_string();
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(move |manifests: &[ImageIndexEntry]| {
                resolve_platform(manifests, &target)
            })),
            ..Default::default()
        };
        let client = Client::new(config);

        Self {
            client,
            auth,
            arch: arch.to_string(),
        }
    }

    /// Pull `reference` into the layout behind `writer`.
    ///
    /// Config and layer blobs are streamed to disk and checked against their
    /// digests. Returns the descriptor of the manifest stored in the layout.
    pub(crate) async fn pull_into(
        &self,
        reference: &Reference,
        writer: &LayoutWriter,
        report: &mut (dyn Write + Send),
    ) -> Result<ManifestRef, CopyError> {
        tracing::info!(
            reference = %reference,
            arch = %self.arch,
            anonymous = self.auth.is_anonymous(),
            "Pulling image from registry"
        );

        // Resolves multi-arch image indexes through the platform resolver
        let auth = self.auth.to_oci_auth();
        let (manifest, registry_digest) = self
            .client
            .pull_image_manifest(reference, &auth)
            .await
            .map_err(|e| CopyError::Registry(format!("failed to pull manifest: {}", e)))?;

        let _ = writeln!(report, "Getting image source signatures");
        for layer in &manifest.layers {
            let _ = writeln!(report, "Copying blob {}", layer.digest);
            self.pull_blob(reference, layer, writer).await?;
        }
        let _ = writeln!(report, "Copying config {}", manifest.config.digest);
        self.pull_blob(reference, &manifest.config, writer).await?;

        // Stored as re-serialized, so the layout addresses it by its own digest
        let manifest_json = serde_json::to_vec(&manifest)
            .map_err(|e| CopyError::Registry(format!("failed to encode manifest: {}", e)))?;
        let digest = writer.add_blob(&manifest_json)?;
        let _ = writeln!(report, "Writing manifest to image destination");

        tracing::info!(
            reference = %reference,
            registry_digest = %registry_digest,
            digest = %digest,
            layers = manifest.layers.len(),
            "Image pulled successfully"
        );

        Ok(ManifestRef {
            media_type: manifest
                .media_type
                .clone()
                .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string()),
            digest,
            size: manifest_json.len() as u64,
        })
    }

    /// Stream one blob into the layout and verify it.
    async fn pull_blob(
        &self,
        reference: &Reference,
        descriptor: &OciDescriptor,
        writer: &LayoutWriter,
    ) -> Result<(), CopyError> {
        if writer.has_verified_blob(&descriptor.digest) {
            tracing::debug!(digest = %descriptor.digest, "Blob already present");
            return Ok(());
        }

        let path = writer.blob_path(&descriptor.digest)?;
        tracing::debug!(
            digest = %descriptor.digest,
            size = descriptor.size,
            "Pulling blob"
        );

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|source| CopyError::Io {
                path: path.clone(),
                source,
            })?;
        self.client
            .pull_blob(reference, descriptor, &mut file)
            .await
            .map_err(|e| {
                CopyError::Registry(format!("failed to pull blob {}: {}", descriptor.digest, e))
            })?;
        file.flush().await.map_err(|source| CopyError::Io {
            path: path.clone(),
            source,
        })?;
        drop(file);

        writer.verify_blob(&descriptor.digest)
    }
}

/// Pick the linux manifest for `arch` from a multi-arch index.
fn resolve_platform(manifests: &[ImageIndexEntry], arch: &str) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn index_entry(digest: &str, os: &str, arch: &str) -> ImageIndexEntry {
        serde_json::from_value(serde_json::json!({
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "digest": digest,
            "size": 100,
            "platform": { "architecture": arch, "os": os },
        }))
        .unwrap()
    }

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(auth.username.is_none());
        assert!(auth.password.is_none());
        assert!(auth.is_anonymous());
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        assert_eq!(auth.username, Some("user".to_string()));
        assert_eq!(auth.password, Some("pass".to_string()));
    }

    #[test]
    fn test_registry_auth_to_oci() {
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            RegistryAuth::basic("user", "pass").to_oci_auth(),
            OciRegistryAuth::Basic(_, _)
        ));
    }

    #[test]
    fn test_registry_auth_from_lookup() {
        let env: HashMap<&str, &str> = [
            (ENV_REGISTRY_USERNAME, "robot"),
            (ENV_REGISTRY_PASSWORD, "token"),
        ]
        .into_iter()
        .collect();
        let auth = RegistryAuth::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(auth.username.as_deref(), Some("robot"));

        let partial = RegistryAuth::from_lookup(|key| {
            (key == ENV_REGISTRY_USERNAME).then(|| "robot".to_string())
        });
        assert!(partial.is_anonymous());
    }

    #[test]
    fn test_registry_auth_resolve_prefers_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auths": {"ghcr.io": {"username": "stored", "password": "pw"}}}"#,
        )
        .unwrap();
        let store = CredentialStore::new(path);

        let auth = RegistryAuth::resolve("ghcr.io", Some(&store));
        assert_eq!(auth.username.as_deref(), Some("stored"));
    }

    #[test]
    fn test_resolve_platform_matches_arch() {
        let manifests = vec![
            index_entry("sha256:amd", "linux", "amd64"),
            index_entry("sha256:arm", "linux", "arm64"),
            index_entry("sha256:win", "windows", "amd64"),
        ];

        assert_eq!(
            resolve_platform(&manifests, "arm64"),
            Some("sha256:arm".to_string())
        );
        assert_eq!(
            resolve_platform(&manifests, "amd64"),
            Some("sha256:amd".to_string())
        );
        assert_eq!(resolve_platform(&manifests, "s390x"), None);
    }
}
