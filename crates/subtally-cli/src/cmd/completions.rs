use std::io::{self, Write};

use anyhow::Result;
use clap::Args;
use clap_complete::{Shell, generate};

/// Arguments for `subtally completions`.
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell for completion script generation.
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Write the completion script for `shell` to stdout.
///
/// # Errors
///
/// Returns an error if stdout cannot be flushed.
pub fn run_completions(args: &CompletionsArgs, command: &mut clap::Command) -> Result<()> {
    let mut out = io::stdout().lock();
    generate(args.shell, command, "subtally", &mut out);
    out.flush()?;
    Ok(())
}
