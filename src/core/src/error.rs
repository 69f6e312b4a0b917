use std::path::PathBuf;

use thiserror::Error;

/// Sandbox Forge error types.
///
/// Every variant names the pipeline stage that produced it, so the message
/// printed for a failed run identifies both the stage and the cause.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The image name could not be parsed or names an unknown transport
    #[error("invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Retrieving the image into the temporary layout failed
    #[error("fetch failed: {source_ref} - {message}")]
    FetchFailed { source_ref: String, message: String },

    /// The image runtime configuration could not be read from the layout
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Flattening the image layers into the sandbox failed
    #[error("unpack failed: {0}")]
    UnpackFailed(String),

    /// A gzip-tar archive could not be decoded or written out
    #[error("extract failed: {0}")]
    ExtractFailed(String),

    /// The base environment archive does not exist
    #[error("base environment archive not found: {}", .0.display())]
    BaseEnvMissing(PathBuf),

    /// A generated scaffolding file could not be written
    #[error("write failed: {path}: {message}")]
    WriteFailed { path: PathBuf, message: String },

    /// An archive entry resolves outside of the extraction root
    #[error("unsafe archive entry '{entry}': resolves outside {}", .root.display())]
    UnsafeArchiveEntry { entry: String, root: PathBuf },

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl SandboxError {
    /// Build an `InvalidReference` error.
    pub fn invalid_reference(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Build a `FetchFailed` error.
    pub fn fetch_failed(source_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FetchFailed {
            source_ref: source_ref.into(),
            message: message.into(),
        }
    }

    /// Build a `WriteFailed` error.
    pub fn write_failed(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::WriteFailed {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for SandboxError {
    fn from(err: serde_yaml::Error) -> Self {
        SandboxError::SerializationError(err.to_string())
    }
}

/// Result type alias for Sandbox Forge operations
pub type Result<T> = std::result::Result<T, SandboxError>;
