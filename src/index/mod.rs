//! Implementation of the `index` sub command.

use crate::common;

/// Command line arguments for `index` sub command.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "build tabix index for VCF file", long_about = None)]
pub struct Args {
    /// Path to the bgzip compressed input VCF file.
    #[clap(long)]
    pub path_in: String,
    /// Path to the output index, defaults to `<path-in>.tbi`.
    #[clap(long)]
    pub path_out: Option<String>,
}

/// Main entry point for `index` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = std::time::Instant::now();
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let path_out = args
        .path_out
        .clone()
        .unwrap_or_else(|| format!("{}.tbi", &args.path_in));
    tracing::info!("writing index to {}", &path_out);
    common::noodles::build_tbi(&args.path_in, &path_out)?;

    tracing::info!(
        "All of `index` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}
