//! varload main executable

pub mod annos;
pub mod common;
pub mod err;
pub mod index;
pub mod load;
pub mod store;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Annotate VCF files and load them into SQLite",
    long_about = "This tool splits a bgzip compressed VCF file into chunks, annotates \
                  them in parallel and loads the result into a single SQLite file"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Annotate and load a VCF file.
    Load(load::Args),
    /// Build the tabix index of a VCF file.
    Index(index::Args),
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    // Install collector and go into sub commands.
    let term = Term::stderr();
    let exit_code = tracing::subscriber::with_default(collector, || {
        match &cli.command {
            Commands::Load(args) => {
                let report = load::run(&cli.common, args)?;
                if !report.failed.is_empty() {
                    term.write_line(&format!(
                        "{} of {} chunks failed{}",
                        report.failed.len(),
                        report.chunks,
                        Emoji(" ⚠️", "")
                    ))?;
                    for failed in &report.failed {
                        term.write_line(&format!(
                            "  lines {}: {}",
                            failed.line_range(),
                            &failed.message
                        ))?;
                    }
                    return Ok(ExitCode::from(err::EXIT_PARTIAL));
                }
            }
            Commands::Index(args) => index::run(&cli.common, args)?,
        }

        Ok::<ExitCode, anyhow::Error>(ExitCode::SUCCESS)
    })?;
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;

    Ok(exit_code)
}
