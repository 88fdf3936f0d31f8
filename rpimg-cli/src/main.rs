//! CLI for building Raspberry Pi SD card images.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use rpimg::{BuildConfig, Confirm, Pipeline, REQUIRED_TOOLS, Step, StepSet, SystemHost};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rpimg", version, about = "Build Raspberry Pi SD card images")]
struct Cli {
    /// Log debug output (RUST_LOG takes precedence).
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a disk image.
    Build(Box<BuildArgs>),
    /// List the surgery placeholders found in a raw disk image.
    Scan {
        /// Disk image to scan.
        image: PathBuf,
        /// Placeholder signature.
        #[arg(long, default_value = "DT_PLACEHOLDER::")]
        signature: String,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// List the build steps in execution order.
    Steps,
    /// Generate shell completion scripts.
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for list commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Comma-separated steps to run (default: all).
    #[arg(long)]
    steps: Option<String>,

    /// Comma-separated steps to skip.
    #[arg(long = "no-steps", default_value = "")]
    no_steps: String,

    /// Directory receiving the image, metadata and bundle.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Directory for the downloaded base image.
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Disk template directory.
    #[arg(long)]
    template: Option<PathBuf>,

    /// JSON build configuration (default: <config dir>/rpimg/config.json if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Discard cached downloads first.
    #[arg(long)]
    no_cache: bool,

    /// Overwrite an existing output image without asking.
    #[arg(long, short = 'y')]
    yes: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(e) = cli.dispatch() {
        eprintln!("rpimg: {e:#}");
        std::process::exit(1);
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default level.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Build(args) => args.run(),
            Command::Scan {
                image,
                signature,
                format,
            } => scan(&image, &signature, format),
            Command::Steps => {
                for step in Step::ALL {
                    println!("{:<10} requires {:?}", step.name(), step.requires());
                }
                Ok(())
            }
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "rpimg", &mut io::stdout());
                Ok(())
            }
        }
    }
}

impl BuildArgs {
    fn run(self) -> Result<()> {
        let all = Step::ALL.map(Step::name).join(",");
        let steps = StepSet::parse(self.steps.as_deref().unwrap_or(&all), &self.no_steps)
            .context("invalid step selection")?;

        let config = self.config()?;
        SystemHost::check_tools(REQUIRED_TOOLS).context("host is missing a required tool")?;
        rpimg::interrupt::install().context("failed to install the Ctrl-C handler")?;

        let host = SystemHost::new();
        let prompt = Prompt { assume_yes: self.yes };
        let mut pipeline = Pipeline::new(config, &host, &prompt).context("invalid configuration")?;
        pipeline.run(&steps)?;
        Ok(())
    }

    /// Defaults, then the config file, then command-line overrides.
    fn config(&self) -> Result<BuildConfig> {
        let path = self.config.clone().or_else(|| {
            dirs::config_dir()
                .map(|dir| dir.join("rpimg").join("config.json"))
                .filter(|p| p.exists())
        });
        let mut config = match path {
            Some(path) => {
                tracing::info!("loading configuration from {}", path.display());
                BuildConfig::load(&path)?
            }
            None => BuildConfig::default(),
        };
        if let Some(dir) = &self.output {
            config.output_dir.clone_from(dir);
        }
        if let Some(dir) = &self.workdir {
            config.workdir.clone_from(dir);
        }
        if let Some(dir) = &self.template {
            config.template_dir.clone_from(dir);
        }
        config.no_cache |= self.no_cache;
        Ok(config)
    }
}

/// Asks on the terminal unless `--yes` was given.
struct Prompt {
    assume_yes: bool,
}

impl Confirm for Prompt {
    fn confirm(&self, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        eprint!("{question} [y/N] ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn scan(image: &Path, signature: &str, format: OutputFormat) -> Result<()> {
    rpimg::interrupt::install().context("failed to install the Ctrl-C handler")?;
    let found = rpimg::scan::find_all(image, signature, rpimg::interrupt::flag())
        .with_context(|| format!("failed to scan {}", image.display()))?;
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }
    if found.is_empty() {
        eprintln!("No placeholders found.");
        return Ok(());
    }
    println!("{:<16}  PLACEHOLDER", "OFFSET");
    for (placeholder, offset) in &found {
        println!("{offset:<16}  {placeholder}");
    }
    Ok(())
}
