//! hilrun: build firmware, put it on a board or an emulator, and judge its serial output.

mod commands;
mod config;
mod logging;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use config::Project;

#[derive(Parser)]
#[command(name = "hilrun", version, about = "Hardware-in-the-loop build, flash, and test runner")]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile, deploy, and monitor firmware on one or more platforms
    Run {
        /// Platform ids (default: run.default-platforms from hilrun.toml)
        platforms: Vec<String>,
        /// Firmware source file or directory
        #[arg(long, short)]
        source: Option<PathBuf>,
        /// Print reports as JSON instead of text
        #[arg(long)]
        json: bool,
        /// Archive each report as JSON in this directory
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
    /// Inspect and validate platform profiles
    Platform {
        #[command(subcommand)]
        action: PlatformAction,
    },
    /// Check that the tools every profile needs are installed
    Doctor {
        /// Only check this platform
        #[arg(long)]
        platform: Option<String>,
    },
    /// List candidate serial devices
    Ports,
}

#[derive(Subcommand)]
enum PlatformAction {
    /// List registered platforms
    List,
    /// Show details of a platform
    Describe {
        /// Platform id
        id: String,
        /// Output format (default: human-readable, "toml" for TOML)
        #[arg(long)]
        format: Option<String>,
    },
    /// Validate one platform, or all of them
    Validate {
        /// Platform id
        id: Option<String>,
    },
    /// Print a starting `.profile.toml` for a new platform
    Template {
        /// Id for the new platform
        id: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = run(cli);
    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let cwd = std::env::current_dir()?;
    let project = Project::discover(&cwd)?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&project.config.logging.level);
    logging::init(level, cli.log_json || project.config.logging.json)?;

    match cli.command {
        Commands::Run {
            platforms,
            source,
            json,
            report_dir,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let options = commands::run::RunOptions {
                platforms,
                source,
                json,
                report_dir,
            };
            runtime.block_on(commands::run::run(&project, options))
        }

        Commands::Platform { action } => {
            match action {
                PlatformAction::List => commands::platform::list(&project)?,
                PlatformAction::Describe { id, format } => {
                    commands::platform::describe(&project, &id, format.as_deref())?
                }
                PlatformAction::Validate { id } => {
                    return commands::platform::validate(&project, id.as_deref())
                }
                PlatformAction::Template { id } => commands::platform::template(&id)?,
            }
            Ok(0)
        }

        Commands::Doctor { platform } => {
            commands::doctor::run(&project, platform.as_deref())?;
            Ok(0)
        }

        Commands::Ports => {
            commands::ports::run()?;
            Ok(0)
        }
    }
}
