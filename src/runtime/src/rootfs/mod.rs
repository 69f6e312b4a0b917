//! Sandbox provisioning.
//!
//! Turns an image into a runnable sandbox directory: the pipeline driver,
//! the runtime scaffolding and the reserved sandbox paths.

mod builder;
mod layout;
mod scaffold;

pub use builder::{ProvisionedSandbox, SandboxBuilder, Stage};
pub use layout::{SandboxLayout, ENV_DIR};
pub use scaffold::{env_script_content, runscript_content, BaseEnvironment, RuntimeScaffolder};
