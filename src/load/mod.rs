//! Implementation of the `load` sub command.
//!
//! The input is split into chunks that are parsed and annotated in parallel,
//! then merged in input order into a single SQLite store.

use std::sync::Arc;

use thousands::Separable;

use crate::{
    annos::Annotator,
    common::{self, ChromOrder},
    err::LoadError,
    store::{LoadStatus, Store},
};

pub mod chunks;
pub mod conf;
pub mod csq;
pub mod header;
pub mod merge;
pub mod ped;
pub mod record;
pub mod worker;

use self::{
    conf::{FailurePolicy, LoadConfig},
    csq::{AnnotationStyle, ConsequenceParser},
    merge::{Coordinator, LoadReport},
    record::RecordParser,
    worker::{ChunkProcessor, WorkerPool},
};

/// Command line arguments for `load` sub command.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "annotate VCF and load into SQLite", long_about = None)]
pub struct Args {
    /// Path to the bgzip compressed input VCF file.
    #[clap(long)]
    pub path_in: String,
    /// Path to the tabix index, defaults to `<path-in>.tbi`.
    #[clap(long)]
    pub path_index: Option<String>,
    /// Path to the output SQLite file.
    #[clap(long)]
    pub path_out: String,
    /// Path to the pedigree file; optional.
    #[clap(long)]
    pub path_ped: Option<String>,
    /// Path to the JSON file describing the annotation sources; optional.
    #[clap(long)]
    pub path_annos: Option<String>,
    /// How functional consequences are embedded in the input.
    #[clap(long, value_enum, default_value_t = AnnotationStyle::Vep)]
    pub anno_style: AnnotationStyle,
    /// Number of worker threads.
    #[clap(long, default_value_t = 1)]
    pub num_workers: usize,
    /// Number of chunks per worker thread.
    #[clap(long, default_value_t = 1)]
    pub chunks_per_worker: usize,
    /// Maximal number of records a worker hands to the merge at once.
    #[clap(long, default_value_t = 1000)]
    pub batch_size: usize,
    /// Behaviour on chunks that fail to process.
    #[clap(long, value_enum, default_value_t = FailurePolicy::FailFast)]
    pub on_failure: FailurePolicy,
    /// Do not load any samples or genotype calls.
    #[clap(long)]
    pub no_genotypes: bool,
    /// Overwrite an existing output file.
    #[clap(long)]
    pub force: bool,
}

/// Receive messages from the workers until all chunks are merged.
fn drain(
    pool: &WorkerPool,
    mut coordinator: Coordinator,
    num_chunks: usize,
) -> Result<LoadReport, LoadError> {
    for message in pool.messages() {
        coordinator.accept(message)?;
    }
    coordinator.finish(num_chunks)
}

/// Run the whole load for the resolved `config`.
fn load(config: &LoadConfig) -> Result<LoadReport, anyhow::Error> {
    tracing::info!("reading header of {:?}", &config.path_in);
    let header = header::read_input_header(&config.path_in)?;
    let pedigree = config.path_ped.as_deref().map(ped::load_ped).transpose()?;
    let samples = ped::build_samples(&header.sample_names, pedigree.as_deref())?;
    let samples = if config.genotypes {
        samples
    } else {
        tracing::info!("genotype-free mode, ignoring {} samples", samples.len());
        Vec::new()
    };

    let annotator = Arc::new(Annotator::load(&config.sources)?);

    let store = Store::create(&config.path_out, config.force, annotator.resources())?;
    store.insert_samples(&samples)?;
    store.set_info("input", &config.path_in.display().to_string())?;
    store.set_info("anno_style", &config.anno_style.to_string())?;
    store.set_info("num_workers", &config.num_workers.to_string())?;
    store.set_info("on_failure", &config.on_failure.to_string())?;

    let chunks = chunks::compute_chunks(
        &config.path_in,
        &config.path_index,
        header.data_start,
        config.target_chunks(),
    )?;
    let num_chunks = chunks.len();
    tracing::info!(
        "processing {} chunks with {} workers",
        num_chunks,
        config.num_workers
    );

    let parser = RecordParser::new(
        &header.header,
        config.genotypes,
        ConsequenceParser::new(config.anno_style, header.vep_format.as_deref()),
    );
    let processor = Arc::new(ChunkProcessor::new(
        config.path_in.clone(),
        parser,
        annotator,
        config.batch_size,
    ));
    let pool = WorkerPool::spawn(processor, chunks, config.num_workers, config.on_failure)?;
    let coordinator = Coordinator::new(
        &store,
        ChromOrder::new(&header.contigs),
        samples.len(),
        config.on_failure,
        header.header_lines,
    );
    let report = match drain(&pool, coordinator, num_chunks) {
        Ok(report) => {
            pool.join()?;
            report
        }
        Err(e) => {
            pool.cancel();
            pool.join()?;
            return Err(e.into());
        }
    };

    let status = if report.failed.is_empty() {
        LoadStatus::Complete
    } else {
        LoadStatus::Partial
    };
    store.set_info("num_variants", &report.variants.to_string())?;
    store.set_info("num_samples", &report.samples.to_string())?;
    store.finalize(status)?;

    Ok(report)
}

/// Main entry point for `load` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<LoadReport, anyhow::Error> {
    let before_anything = std::time::Instant::now();
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    common::trace_rss_now();

    let config = LoadConfig::from_args(args)?;
    let report = load(&config)?;

    tracing::info!(
        "loaded {} variants, {} samples and {} genotype calls into {:?}",
        report.variants.separate_with_commas(),
        report.samples.separate_with_commas(),
        report.genotypes.separate_with_commas(),
        &config.path_out
    );
    for failed in &report.failed {
        tracing::warn!(
            "chunk {} (lines {}, offsets {}..{:?}) failed: {}",
            failed.chunk_id,
            failed.line_range(),
            failed.start_offset,
            failed.end_offset,
            &failed.message
        );
    }
    common::trace_rss_now();
    tracing::info!(
        "All of `load` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(report)
}
