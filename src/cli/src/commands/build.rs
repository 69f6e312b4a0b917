//! Sandbox build command.

use std::path::PathBuf;

use clap::Args;
use sandbox_forge_core::config::ForgeConfig;
use sandbox_forge_runtime::SandboxBuilder;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Image to provision, as <transport>:<reference> (e.g. "docker://alpine:latest")
    pub image: String,

    /// Sandbox directory to create or fill
    pub sandbox: PathBuf,

    /// Architecture to select from multi-arch images (e.g. "amd64", "arm64")
    #[arg(long)]
    pub arch: Option<String>,

    /// Base environment archive (gzip-tar) replacing the bundled one
    #[arg(long, value_name = "FILE")]
    pub base_env: Option<PathBuf>,

    /// Suppress copy progress and the summary
    #[arg(short, long)]
    pub quiet: bool,
}

impl BuildArgs {
    /// Apply command-line overrides to `config`.
    pub fn apply_to(&self, config: &mut ForgeConfig) {
        if let Some(arch) = &self.arch {
            config.arch = arch.clone();
        }
        if let Some(base_env) = &self.base_env {
            config.base_env = Some(base_env.clone());
        }
    }
}

pub async fn execute(
    args: BuildArgs,
    config: ForgeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::debug!(config = ?config, "Effective configuration");
    let mut builder = SandboxBuilder::new(config)?;
    if !args.quiet {
        builder = builder.with_report_writer(Box::new(std::io::stderr()));
    }

    let provisioned = builder.build(&args.image, &args.sandbox).await?;

    if !args.quiet {
        println!("{}", provisioned);
    }
    Ok(())
}
