//! Sandbox Forge Runtime - image-to-sandbox provisioning.
//!
//! This crate provides the provisioning pipeline: fetching an image into a
//! temporary OCI layout, flattening its layers into a sandbox directory, and
//! writing the runtime scaffolding that makes the directory runnable.

pub mod archive;
pub mod fs;
pub mod oci;
pub mod rootfs;

// Re-export common types
pub use archive::untar;
pub use oci::{
    copy_image, parse_image_name, read_config, transport_names, unpack_layout, CopyOptions,
    FetchOrchestrator, ImageName, ImageRuntimeConfiguration, OciLayout, PolicyContext,
};
pub use rootfs::{BaseEnvironment, ProvisionedSandbox, RuntimeScaffolder, SandboxBuilder, Stage};

/// Sandbox Forge Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
