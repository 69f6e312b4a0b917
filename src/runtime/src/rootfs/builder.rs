//! Sandbox builder.
//!
//! Runs the provisioning pipeline for one image:
//!
//! ```text
//! Fetching -> ReadingConfig -> Unpacking -> Scaffolding(base)
//!          -> Scaffolding(script) -> Scaffolding(env) -> Done
//! ```
//!
//! Any stage may move the build to `Failed`, which aborts the remaining
//! stages and returns the first error unchanged. The temporary layout is
//! removed on every exit path; the sandbox directory is never rolled back.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sandbox_forge_core::config::ForgeConfig;
use sandbox_forge_core::error::Result;

use super::scaffold::{BaseEnvironment, RuntimeScaffolder};
use crate::oci::{read_config, unpack_layout, FetchOrchestrator, ImageRuntimeConfiguration};

/// Pipeline stage of a sandbox build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing has run yet
    Pending,
    /// Copying the image into a temporary layout
    Fetching,
    /// Reading the image runtime configuration
    ReadingConfig,
    /// Flattening the image layers into the sandbox
    Unpacking,
    /// Extracting the base environment
    ScaffoldingBase,
    /// Writing the run-script
    ScaffoldingScript,
    /// Writing the environment script
    ScaffoldingEnv,
    /// The sandbox is provisioned
    Done,
    /// A stage failed
    Failed,
}

impl Stage {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fetching => write!(f, "fetching"),
            Self::ReadingConfig => write!(f, "reading config"),
            Self::Unpacking => write!(f, "unpacking"),
            Self::ScaffoldingBase => write!(f, "scaffolding(base)"),
            Self::ScaffoldingScript => write!(f, "scaffolding(script)"),
            Self::ScaffoldingEnv => write!(f, "scaffolding(env)"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedSandbox {
    /// Sandbox root directory
    pub root: PathBuf,

    /// Generated run-script
    pub runscript: PathBuf,

    /// Generated environment script
    pub env_script: PathBuf,

    /// Number of image layers applied
    pub layers: usize,

    /// Manifest digest of the provisioned image
    pub manifest_digest: String,

    /// Runtime configuration baked into the sandbox
    pub runtime_config: ImageRuntimeConfiguration,
}

impl fmt::Display for ProvisionedSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sandbox:     {}", self.root.display())?;
        writeln!(f, "Image:       {}", self.manifest_digest)?;
        writeln!(f, "Layers:      {}", self.layers)?;
        writeln!(f, "Runscript:   {}", self.runscript.display())?;
        write!(f, "Environment: {}", self.env_script.display())
    }
}

/// Copy progress sink kept across builds.
#[derive(Clone)]
struct SharedReport(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedReport {
    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut (dyn Write + Send)) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut writer = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "report writer poisoned"))?;
        f(writer.as_mut())
    }
}

impl Write for SharedReport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_writer(|w| w.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_writer(|w| w.flush())
    }
}

/// Provisions a sandbox directory from an image.
///
/// A builder may run any number of builds; each one reports copy progress
/// to the writer given with [`SandboxBuilder::with_report_writer`].
pub struct SandboxBuilder {
    config: ForgeConfig,
    fetcher: FetchOrchestrator,
    report_writer: Option<SharedReport>,
    stage: Stage,
    failed_at: Option<Stage>,
}

impl SandboxBuilder {
    /// Create a builder. The configuration is validated first.
    pub fn new(config: ForgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fetcher: FetchOrchestrator::new(&config),
            config,
            report_writer: None,
            stage: Stage::Pending,
            failed_at: None,
        })
    }

    /// Send copy progress lines to `writer`.
    pub fn with_report_writer(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.report_writer = Some(SharedReport(Arc::new(Mutex::new(writer))));
        self
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Stage that failed, if the build failed.
    pub fn failed_at(&self) -> Option<Stage> {
        self.failed_at
    }

    /// Provision `sandbox` from the image named `image`.
    ///
    /// `sandbox` may be missing or empty. On failure it is left as the
    /// failing stage left it.
    pub async fn build(&mut self, image: &str, sandbox: &Path) -> Result<ProvisionedSandbox> {
        tracing::info!(
            image,
            sandbox = %sandbox.display(),
            arch = %self.config.arch,
            "Building sandbox"
        );
        self.failed_at = None;

        match self.run(image, sandbox).await {
            Ok(provisioned) => {
                self.enter(Stage::Done);
                tracing::info!(
                    sandbox = %provisioned.root.display(),
                    layers = provisioned.layers,
                    "Sandbox built successfully"
                );
                Ok(provisioned)
            }
            Err(e) => {
                tracing::error!(stage = %self.stage, error = %e, "Sandbox build failed");
                self.failed_at = Some(self.stage);
                self.stage = Stage::Failed;
                Err(e)
            }
        }
    }

    async fn run(&mut self, image: &str, sandbox: &Path) -> Result<ProvisionedSandbox> {
        self.enter(Stage::Fetching);
        let report = self
            .report_writer
            .clone()
            .map(|shared| Box::new(shared) as Box<dyn Write + Send>);
        // The temporary layout is removed when `fetched` goes out of scope.
        let fetched = self.fetcher.fetch(image, report).await?;
        let layout_dir = fetched.layout.path();

        self.enter(Stage::ReadingConfig);
        let runtime_config = read_config(layout_dir, &fetched.tag, &self.config.arch)?;

        self.enter(Stage::Unpacking);
        let selector = format!("name={}", fetched.tag);
        let unpacked = unpack_layout(
            layout_dir,
            sandbox,
            &self.config.arch,
            &[selector.as_str()],
        )?;

        let scaffolder = RuntimeScaffolder::new(sandbox)
            .with_base_env(BaseEnvironment::from_config(self.config.base_env.as_deref()));

        self.enter(Stage::ScaffoldingBase);
        scaffolder.insert_base_env()?;

        self.enter(Stage::ScaffoldingScript);
        let runscript = scaffolder.write_runscript(&runtime_config)?;

        self.enter(Stage::ScaffoldingEnv);
        let env_script = scaffolder.write_env_script(&runtime_config)?;

        Ok(ProvisionedSandbox {
            root: sandbox.to_path_buf(),
            runscript,
            env_script,
            layers: unpacked.layers,
            manifest_digest: unpacked.manifest_digest,
            runtime_config,
        })
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!(from = %self.stage, to = %stage, "Sandbox build stage");
        self.stage = stage;
    }
}
