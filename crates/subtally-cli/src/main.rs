#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{CommandFactory, Parser, Subcommand};
use output::{CliError, OutputMode, render_error};
use std::env;
use std::path::PathBuf;
use subtally_core::error::ErrorCode;
use subtally_core::pipeline::Workspace;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "subtally: subscription transaction store and daily counters",
    long_about = None
)]
struct Cli {
    /// Project root holding subtally.toml and the data directories.
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging (overridden by SUBTALLY_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        output::resolve_output_mode(self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Store",
        about = "Normalize raw files into the store",
        long_about = "Read raw transaction files, normalize them and merge them into the \
                      month-partitioned store, deduplicating by natural key.",
        after_help = "EXAMPLES:\n    # Ingest yesterday's daily drop\n    subtally ingest\n\n    # Ingest one day, activations only\n    subtally ingest --date 2024-03-05 --kind act\n\n    # Convert the whole historical archive\n    subtally ingest --archive"
    )]
    Ingest(cmd::ingest::IngestArgs),

    #[command(
        next_help_heading = "Store",
        about = "Find and repair date gaps in the store",
        long_about = "Compare store dates against the raw archive and re-ingest the rows \
                      of missing dates.",
        after_help = "EXAMPLES:\n    # Show gaps without writing\n    subtally backfill --dry-run\n\n    # Repair refunds from another archive copy\n    subtally backfill --kind rfnd --source /mnt/archive"
    )]
    Backfill(cmd::backfill::BackfillArgs),

    #[command(
        next_help_heading = "Counters",
        about = "Build daily counters",
        long_about = "Build per-code counters for one date, a range or every missing date, \
                      then republish the per-service table.",
        after_help = "EXAMPLES:\n    # Yesterday\n    subtally counters\n\n    # One date, recomputing if present\n    subtally counters 2024-03-05 --force\n\n    # Every store date not yet counted\n    subtally counters --backfill"
    )]
    Counters(cmd::counters::CountersArgs),

    #[command(
        next_help_heading = "Store",
        about = "Check the store for duplicates and schema drift",
        after_help = "EXAMPLES:\n    # All kinds\n    subtally validate\n\n    # Machine-readable\n    subtally validate --json"
    )]
    Validate(cmd::validate::ValidateArgs),

    #[command(
        next_help_heading = "Shell",
        about = "Print a shell completion script",
        after_help = "EXAMPLES:\n    subtally completions bash > /etc/bash_completion.d/subtally"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("SUBTALLY_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "subtally=debug,subtally_core=debug,info"
        } else {
            "subtally=info,subtally_core=info,warn"
        })
    });

    let format = env::var("SUBTALLY_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn open_workspace(root: Option<PathBuf>, output: OutputMode) -> anyhow::Result<Workspace> {
    let root = match root {
        Some(root) => root,
        None => env::current_dir()?,
    };
    debug!(root = %root.display(), "opening project");
    Workspace::open(&root).inspect_err(|err| {
        let _ = render_error(
            output,
            &CliError::with_code(format!("{err:#}"), ErrorCode::ConfigParseError),
        );
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let output = cli.output_mode();

    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        return cmd::completions::run_completions(args, &mut command);
    }

    let ws = open_workspace(cli.root.clone(), output)?;
    match cli.command {
        Commands::Ingest(ref args) => cmd::ingest::run_ingest(args, output, &ws),
        Commands::Backfill(ref args) => cmd::backfill::run_backfill(args, output, ws),
        Commands::Counters(ref args) => cmd::counters::run_counters(args, output, &ws),
        Commands::Validate(ref args) => cmd::validate::run_validate(args, output, &ws),
        Commands::Completions(_) => Ok(()),
    }
}
