//! # burstsift CLI (`bsift`)
//!
//! Thin glue around the sift engine. The real front end (windowed
//! display, keybindings) is a separate program that drives
//! [`SiftController`](burstsift::controller::SiftController) directly;
//! this binary exists to initialize the ledger, run a line-oriented
//! session for smoke-testing a source, and export the deletion artifact.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bsift init` | Create the ledger database and schema |
//! | `bsift sift` | Sift the configured source interactively |
//! | `bsift export` | Print the deletion ledger as JSON |
//! | `bsift guide` | Show the session command reference |
//!
//! ## Usage
//!
//! ```bash
//! bsift --config ./config/bsift.toml sift
//! bsift export --output deleted.json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use burstsift::config::{load_config, Config};
use burstsift::controller::{Command as SiftCommand, DisplayState, Readiness, SiftController};
use burstsift::ledger::DeletionLedger;
use burstsift::progress::ProgressMode;
use burstsift::source::source_from_config;

/// burstsift — sift burst photographs and export deletion decisions.
#[derive(Parser)]
#[command(
    name = "bsift",
    about = "Sift burst photographs: navigate, score, mark, export deletions",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/bsift.toml")]
    config: PathBuf,

    /// Progress output on stderr: off, human, or json.
    /// Defaults to human when stderr is a terminal.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the ledger database.
    ///
    /// Creates the SQLite file and schema. Idempotent — safe to run
    /// repeatedly.
    Init,

    /// Sift the configured source.
    ///
    /// Builds the catalog snapshot, starts the prefetch workers, and
    /// reads session commands from stdin (see `bsift guide`).
    Sift,

    /// Export current marks as the deletion artifact.
    ///
    /// Prints a JSON array consumed by the external deletion executor.
    Export {
        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show the session command reference.
    Guide,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let progress = match cli.progress.as_deref() {
        None => ProgressMode::default_for_tty(),
        Some("off") => ProgressMode::Off,
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some(other) => anyhow::bail!("unknown progress mode '{other}' (off|human|json)"),
    };

    match cli.command {
        Commands::Init => {
            let config = load_config(&cli.config)?;
            let ledger = DeletionLedger::open(&config.ledger.path)
                .await
                .context("Failed to initialize ledger")?;
            ledger.close().await;
            println!("ledger initialized at {}", config.ledger.path.display());
            Ok(())
        }
        Commands::Sift => run_sift(&load_config(&cli.config)?, progress).await,
        Commands::Export { output } => run_export(&load_config(&cli.config)?, output).await,
        Commands::Guide => {
            print_guide();
            Ok(())
        }
    }
}

async fn run_sift(config: &Config, progress: ProgressMode) -> Result<()> {
    let source = source_from_config(config).context("Cannot build image source")?;
    eprintln!("sifting {}", source.describe());

    let mut controller = SiftController::new(source, config, progress.reporter())
        .await
        .context("Cannot start sift session")?;

    println!("{} images in catalog", controller.catalog().len());
    print_state(&controller.display_state());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            None => continue,
            Some("n") | Some("next") => SiftCommand::Advance,
            Some("p") | Some("prev") => SiftCommand::Back,
            Some("m") | Some("mark") => SiftCommand::Mark,
            Some("u") | Some("unmark") => SiftCommand::Unmark,
            Some("w") | Some("worse") => SiftCommand::MarkWorse,
            Some("z") | Some("undo") => SiftCommand::Undo,
            Some("j") | Some("jump") => match parts.next().and_then(|n| n.parse().ok()) {
                Some(index) => SiftCommand::JumpTo(index),
                None => {
                    eprintln!("usage: jump <index>");
                    continue;
                }
            },
            Some("s") | Some("status") => {
                print_state(&controller.display_state());
                continue;
            }
            Some("q") | Some("quit") => break,
            Some(other) => {
                eprintln!("unknown command '{other}' (see 'bsift guide')");
                continue;
            }
        };

        // Ledger failures are surfaced but do not end the session.
        if let Err(err) = controller.apply(command).await {
            eprintln!("error: {err}");
        }
        print_state(&controller.display_state());
    }

    println!("{} images marked for deletion", controller.mark_count());
    println!("run 'bsift export' to hand them to the deletion executor");
    controller.close().await;
    Ok(())
}

async fn run_export(config: &Config, output: Option<PathBuf>) -> Result<()> {
    let ledger = DeletionLedger::open(&config.ledger.path)
        .await
        .context("Cannot open ledger")?;
    let marks = ledger.export().await.context("Cannot export ledger")?;
    let json = serde_json::to_string_pretty(&marks)?;

    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("exported {} marks to {}", marks.len(), path.display());
        }
        None => println!("{json}"),
    }
    ledger.close().await;
    Ok(())
}

fn print_state(state: &DisplayState) {
    let identifier = state.identifier.as_deref().unwrap_or("<end of catalog>");
    let readiness = match &state.readiness {
        Readiness::Ready => "ready",
        Readiness::NotReady => "loading...",
        Readiness::Unavailable(_) => "unavailable",
    };
    let focus = state
        .focus
        .map(|f| format!("{f:.1}"))
        .unwrap_or_else(|| "-".to_string());
    let marked = if state.marked { " [MARKED]" } else { "" };

    println!(
        "[{}/{}] {identifier}  {readiness}  focus {focus}  {:?}{marked}",
        state.cursor + 1,
        state.total,
        state.state,
    );
}

fn print_guide() {
    println!(
        "\
session commands (one per line on stdin):
    n, next      move to the next image
    p, prev      move to the previous image
    m, mark      mark the current image for deletion
    u, unmark    remove the current image's mark
    w, worse     in a burst pair, mark the lower-focus image
    z, undo      revert the last move or mark
    j, jump N    jump to catalog index N (0-based)
    s, status    reprint the current display state
    q, quit      end the session

marks are durable immediately; 'bsift export' emits the JSON
artifact for the external deletion executor."
    );
}
