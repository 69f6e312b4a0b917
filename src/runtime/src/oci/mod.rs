//! OCI image support for Sandbox Forge.
//!
//! Fetches images from any supported transport into a local OCI layout and
//! flattens them into a root filesystem:
//!
//! - Transport-qualified image names (`docker://`, `oci:`)
//! - Trust policy evaluation and image copy with digest verification
//! - OCI image layout reading (index, manifest, config)
//! - Layer application with whiteouts (gzip, bzip2, xz or plain tar)
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    OCI Image Layout                          │
//! │                                                              │
//! │  image/                                                      │
//! │  ├── oci-layout           (OCI layout marker)               │
//! │  ├── index.json           (Image index, tagged manifests)   │
//! │  └── blobs/                                                 │
//! │      └── sha256/                                            │
//! │          ├── <manifest>   (Image manifest)                  │
//! │          ├── <config>     (Image configuration)             │
//! │          └── <layers>     (Filesystem layers)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod copy;
pub mod credentials;
mod fetch;
mod layers;
pub(crate) mod layout;
mod policy;
pub mod registry;
pub mod transport;
mod unpack;

pub use copy::{copy_image, CopiedImage, CopyOptions};
pub use credentials::CredentialStore;
pub use fetch::{FetchOrchestrator, FetchedImage, TemporaryLayout};
pub use layers::{apply_layer, LayerCompression, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
pub use layout::{
    read_config, ImageRuntimeConfiguration, LayoutError, OciLayout, ResolvedImage,
    REF_NAME_ANNOTATION,
};
pub use policy::PolicyContext;
pub use registry::{RegistryAuth, RegistryPuller};
pub use transport::{parse_image_name, transport_names, ImageName, OciLayoutReference};
pub use unpack::{unpack_layout, UnpackReport};
