use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};
use crate::policy::TrustPolicy;

/// Target architecture used when none is configured.
pub const DEFAULT_ARCH: &str = "amd64";

/// Tag given to the image inside the temporary OCI layout.
pub const DEFAULT_INTERNAL_TAG: &str = "singularity2docker";

/// Name prefix of temporary OCI layout directories.
pub const DEFAULT_TEMP_PREFIX: &str = "docker2singularity_";

/// Environment variable overriding [`ForgeConfig::arch`].
pub const ENV_ARCH: &str = "SANDBOX_FORGE_ARCH";

/// Environment variable overriding [`ForgeConfig::base_env`].
pub const ENV_BASE_ENV: &str = "SANDBOX_FORGE_BASE_ENV";

/// Environment variable overriding [`ForgeConfig::temp_dir`].
pub const ENV_TMPDIR: &str = "SANDBOX_FORGE_TMPDIR";

/// Sandbox build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Architecture selected from multi-arch images
    pub arch: String,

    /// Tag of the image in the temporary OCI layout
    pub internal_tag: String,

    /// Parent directory for temporary layouts (system temp dir when unset)
    pub temp_dir: Option<PathBuf>,

    /// Name prefix of temporary layout directories
    pub temp_prefix: String,

    /// Base environment archive on disk (bundled archive when unset)
    pub base_env: Option<PathBuf>,

    /// Trust policy applied to fetched images
    pub trust_policy: TrustPolicy,

    /// Registry credential file (`~/.docker/config.json` when unset)
    pub docker_config: Option<PathBuf>,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            arch: DEFAULT_ARCH.to_string(),
            internal_tag: DEFAULT_INTERNAL_TAG.to_string(),
            temp_dir: None,
            temp_prefix: DEFAULT_TEMP_PREFIX.to_string(),
            base_env: None,
            trust_policy: TrustPolicy::accept_all(),
            docker_config: None,
            log_level: LogLevel::Info,
        }
    }
}

impl ForgeConfig {
    /// Load a configuration file. `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        Ok(config)
    }

    /// Apply `SANDBOX_FORGE_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(arch) = lookup(ENV_ARCH).filter(|v| !v.is_empty()) {
            self.arch = arch;
        }
        if let Some(base_env) = lookup(ENV_BASE_ENV).filter(|v| !v.is_empty()) {
            self.base_env = Some(PathBuf::from(base_env));
        }
        if let Some(tmp) = lookup(ENV_TMPDIR).filter(|v| !v.is_empty()) {
            self.temp_dir = Some(PathBuf::from(tmp));
        }
    }

    /// Check the configuration for values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.arch.trim().is_empty() {
            return Err(SandboxError::ConfigError(
                "arch must not be empty".to_string(),
            ));
        }
        if self.internal_tag.is_empty() || self.internal_tag.contains(&['/', ':'][..]) {
            return Err(SandboxError::ConfigError(format!(
                "invalid internal tag '{}'",
                self.internal_tag
            )));
        }
        if self.trust_policy.default.is_empty() {
            return Err(SandboxError::ConfigError(
                "trust policy has no default requirements".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRequirement;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ForgeConfig::default();
        assert_eq!(config.arch, "amd64");
        assert_eq!(config.internal_tag, "singularity2docker");
        assert_eq!(config.temp_prefix, "docker2singularity_");
        assert!(config.base_env.is_none());
        assert_eq!(
            config.trust_policy.default,
            vec![PolicyRequirement::InsecureAcceptAnything]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_file_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("forge.yaml");
        std::fs::write(&path, "arch: arm64\nbase_env: /opt/env.tar.gz\n").unwrap();

        let config = ForgeConfig::from_file(&path).unwrap();
        assert_eq!(config.arch, "arm64");
        assert_eq!(config.base_env, Some(PathBuf::from("/opt/env.tar.gz")));
        assert_eq!(config.internal_tag, DEFAULT_INTERNAL_TAG);
    }

    #[test]
    fn test_from_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("forge.json");
        std::fs::write(
            &path,
            r#"{"trust_policy": {"default": [{"type": "reject"}]}, "log_level": "debug"}"#,
        )
        .unwrap();

        let config = ForgeConfig::from_file(&path).unwrap();
        assert_eq!(config.trust_policy.default, vec![PolicyRequirement::Reject]);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_from_file_missing() {
        let result = ForgeConfig::from_file(Path::new("/nonexistent/forge.yaml"));
        assert!(matches!(result, Err(SandboxError::ConfigError(_))));
    }

    #[test]
    fn test_from_file_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("forge.json");
        std::fs::write(&path, "{ broken").unwrap();

        let result = ForgeConfig::from_file(&path);
        assert!(matches!(result, Err(SandboxError::SerializationError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_ARCH, "arm64"),
            (ENV_BASE_ENV, "/srv/env.tar.gz"),
            (ENV_TMPDIR, ""),
        ]
        .into_iter()
        .collect();

        let mut config = ForgeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.arch, "arm64");
        assert_eq!(config.base_env, Some(PathBuf::from("/srv/env.tar.gz")));
        assert!(config.temp_dir.is_none());
    }

    #[test]
    fn test_validate_rejects_empty_arch() {
        let config = ForgeConfig {
            arch: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_tag() {
        let config = ForgeConfig {
            internal_tag: "a:b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_policy() {
        let config = ForgeConfig {
            trust_policy: TrustPolicy { default: vec![] },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }
}
