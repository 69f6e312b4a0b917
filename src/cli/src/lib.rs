//! Sandbox Forge CLI - provision sandbox directories from container images.

pub mod commands;
