//! CLI definition, configuration layering and dispatch.

mod build;

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};
use sandbox_forge_core::config::ForgeConfig;
use sandbox_forge_core::error::Result;
use sandbox_forge_runtime::transport_names;

pub use build::BuildArgs;

/// Sandbox Forge - provision a runnable sandbox directory from a container image.
#[derive(Parser, Debug)]
#[command(name = "sandbox-forge", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub build: BuildArgs,

    /// Configuration file (YAML, or JSON by `.json` extension)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Show debug logs
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Parse the process arguments. The long help lists the supported
    /// transports.
    pub fn parse_args() -> Self {
        let matches = Self::command()
            .after_long_help(transports_help())
            .get_matches();
        match Self::from_arg_matches(&matches) {
            Ok(cli) => cli,
            Err(e) => e.exit(),
        }
    }

    /// Build the effective configuration: file, then `SANDBOX_FORGE_*`
    /// environment variables, then command-line flags.
    pub fn load_config(&self) -> Result<ForgeConfig> {
        let mut config = match &self.config {
            Some(path) => ForgeConfig::from_file(path)?,
            None => ForgeConfig::default(),
        };
        config.apply_env();
        self.build.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Log filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self, config: &ForgeConfig) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            config.log_level.to_string()
        }
    }
}

/// Help section naming the supported transports.
fn transports_help() -> String {
    let mut help = String::from("Supported transports:\n");
    for name in transport_names() {
        help.push_str("  ");
        help.push_str(name);
        help.push('\n');
    }
    help.push_str("\nExamples:\n");
    help.push_str("  sandbox-forge docker://alpine:latest ./alpine\n");
    help.push_str("  sandbox-forge oci:/srv/layouts/app:v1 ./app\n");
    help
}

/// Run the command.
pub async fn dispatch(
    cli: Cli,
    config: ForgeConfig,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    build::execute(cli.build, config).await
}
