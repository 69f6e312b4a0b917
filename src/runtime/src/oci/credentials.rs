//! Registry credentials from a Docker client configuration file.
//!
//! Reads `~/.docker/config.json`:
//!
//! ```json
//! { "auths": { "ghcr.io": { "auth": "<base64 user:password>" } } }
//! ```
//!
//! Entries may also carry explicit `username` and `password` fields.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sandbox_forge_core::error::{Result, SandboxError};
use serde::Deserialize;

/// Canonical name of Docker Hub.
const DOCKER_HUB: &str = "docker.io";

/// A single `auths` entry.
#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Docker client configuration file format (only the parts read here).
#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Read-only view of a Docker client credential file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Credential store at `~/.docker/config.json`.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            SandboxError::ConfigError(
                "cannot determine home directory for registry credentials".to_string(),
            )
        })?;
        Ok(Self {
            path: home.join(".docker").join("config.json"),
        })
    }

    /// Credential store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the credential file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Credentials for `registry` as `(username, password)`.
    ///
    /// A missing file yields `None`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        let wanted = normalize_registry(registry);

        let Some(entry) = file
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .map(|(_, entry)| entry)
        else {
            return Ok(None);
        };

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Some((username.clone(), password.clone())));
        }

        match entry.auth.as_deref().filter(|a| !a.is_empty()) {
            Some(auth) => decode_auth(auth).map(Some).map_err(|message| {
                SandboxError::ConfigError(format!(
                    "invalid auth for {} in {}: {}",
                    registry,
                    self.path.display(),
                    message
                ))
            }),
            None => Ok(None),
        }
    }

    fn load(&self) -> Result<DockerConfigFile> {
        if !self.path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            SandboxError::ConfigError(format!(
                "failed to read credential file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            SandboxError::ConfigError(format!(
                "failed to parse credential file {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Decode a base64 `user:password` pair.
fn decode_auth(auth: &str) -> std::result::Result<(String, String), String> {
    let decoded = STANDARD.decode(auth.trim()).map_err(|e| e.to_string())?;
    let text = String::from_utf8(decoded).map_err(|e| e.to_string())?;
    let (username, password) = text
        .split_once(':')
        .ok_or_else(|| "expected user:password".to_string())?;
    Ok((username.to_string(), password.to_string()))
}

/// Normalize a registry key: drop the URL scheme and path, lowercase, and
/// fold the Docker Hub aliases into one name.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(&r);
    let host = r.split('/').next().unwrap_or(r);

    match host {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB.to_string(),
        other => other.to_string(),
    }
}
