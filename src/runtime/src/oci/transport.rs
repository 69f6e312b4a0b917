//! Transport-qualified image names.
//!
//! An image name is `<transport>:<reference>`. Supported transports:
//!
//! - `docker://<image>` - an image in a container registry
//! - `oci:<dir>[:<tag>]` - an image in a local OCI layout

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use oci_distribution::Reference;
use sandbox_forge_core::error::{Result, SandboxError};

/// Registry transport name.
pub const DOCKER_TRANSPORT: &str = "docker";

/// OCI layout transport name.
pub const OCI_TRANSPORT: &str = "oci";

/// Names of the supported transports.
pub fn transport_names() -> &'static [&'static str] {
    &[DOCKER_TRANSPORT, OCI_TRANSPORT]
}

/// An image in a local OCI layout, optionally selected by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciLayoutReference {
    /// Layout directory
    pub dir: PathBuf,

    /// Tag recorded in the `org.opencontainers.image.ref.name` annotation
    pub tag: Option<String>,
}

impl OciLayoutReference {
    /// Reference to the image tagged `tag` in the layout at `dir`.
    pub fn new(dir: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            tag: Some(tag.into()),
        }
    }

    fn parse(within: &str, input: &str) -> Result<Self> {
        let (dir, tag) = match within.split_once(':') {
            Some((dir, tag)) => (dir, Some(tag)),
            None => (within, None),
        };

        if dir.is_empty() {
            return Err(SandboxError::invalid_reference(
                input,
                "missing OCI layout directory",
            ));
        }
        if let Some(tag) = tag {
            if tag.is_empty() || tag.contains('/') {
                return Err(SandboxError::invalid_reference(
                    input,
                    format!("invalid tag '{}'", tag),
                ));
            }
        }

        Ok(Self {
            dir: PathBuf::from(dir),
            tag: tag.map(str::to_string),
        })
    }

    /// Layout directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl fmt::Display for OciLayoutReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}:{}", OCI_TRANSPORT, self.dir.display(), tag),
            None => write!(f, "{}:{}", OCI_TRANSPORT, self.dir.display()),
        }
    }
}

/// A parsed, transport-qualified image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageName {
    /// Image in a container registry
    Docker(Reference),

    /// Image in a local OCI layout
    Oci(OciLayoutReference),
}

impl ImageName {
    /// Transport of this image name.
    pub fn transport(&self) -> &'static str {
        match self {
            Self::Docker(_) => DOCKER_TRANSPORT,
            Self::Oci(_) => OCI_TRANSPORT,
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker(reference) => write!(f, "{}://{}", DOCKER_TRANSPORT, reference),
            Self::Oci(layout) => fmt::Display::fmt(layout, f),
        }
    }
}

impl FromStr for ImageName {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        parse_image_name(s)
    }
}

/// Parse a `<transport>:<reference>` image name.
///
/// Fails with `InvalidReference` when the transport is missing or unknown,
/// or the transport rejects the reference.
pub fn parse_image_name(input: &str) -> Result<ImageName> {
    let (transport, within) = input.split_once(':').ok_or_else(|| {
        SandboxError::invalid_reference(
            input,
            format!(
                "expected <transport>:<reference>, transports: {}",
                transport_names().join(", ")
            ),
        )
    })?;

    match transport {
        DOCKER_TRANSPORT => {
            let image = within.strip_prefix("//").ok_or_else(|| {
                SandboxError::invalid_reference(input, "docker references must start with //")
            })?;
            let reference = image
                .parse::<Reference>()
                .map_err(|e| SandboxError::invalid_reference(input, e.to_string()))?;
            Ok(ImageName::Docker(reference))
        }
        OCI_TRANSPORT => Ok(ImageName::Oci(OciLayoutReference::parse(within, input)?)),
        other => Err(SandboxError::invalid_reference(
            input,
            format!("unsupported transport '{}'", other),
        )),
    }
}
