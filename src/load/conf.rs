//! Resolved load configuration and the annotation source description file.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    annos::{Mode, Naming},
    err::ConfigError,
    store::VARIANT_COLUMNS,
};

use super::csq::AnnotationStyle;

/// Behaviour when processing a chunk fails.
#[derive(
    clap::ValueEnum,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the load on the first failed chunk.
    #[default]
    FailFast,
    /// Skip failed chunks and record them in the store.
    BestEffort,
}

fn default_value_column() -> usize {
    4
}

/// Description of one annotation source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceConf {
    /// Name of the source, also the name of its column in the store.
    pub name: String,
    /// Path to the BED-like file, optionally gzip compressed.
    pub path: String,
    /// How overlapping intervals are turned into a value.
    pub mode: Mode,
    /// 1-based column holding the value.
    #[serde(default = "default_value_column")]
    pub value_column: usize,
    /// 1-based column holding the score used for tie-breaking and aggregation.
    #[serde(default)]
    pub score_column: Option<usize>,
    /// Chromosome naming convention of the file.
    #[serde(default)]
    pub naming: Naming,
    /// Whether a failure to load the source is tolerated.
    #[serde(default)]
    pub optional: bool,
}

/// The annotation source description file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesFile {
    pub sources: Vec<SourceConf>,
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

impl SourcesFile {
    /// Check that all source names are usable and distinct column names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            let lower = source.name.to_ascii_lowercase();
            if !identifier_re().is_match(&source.name) || VARIANT_COLUMNS.contains(&lower.as_str())
            {
                return Err(ConfigError::SourceName(source.name.clone()));
            }
            if !seen.insert(lower) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            if source.value_column < 1 || source.score_column == Some(0) {
                return Err(ConfigError::NotPositive("annotation source column"));
            }
        }
        Ok(())
    }

    /// Load from JSON file at `path`, expanding `~` and variables in source paths.
    #[tracing::instrument]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let read_err = |reason: String| ConfigError::Read {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| read_err(e.to_string()))?;
        let mut result: SourcesFile =
            serde_json::from_str(&text).map_err(|e| read_err(e.to_string()))?;
        for source in result.sources.iter_mut() {
            source.path = shellexpand::full(&source.path)
                .map_err(|e| read_err(e.to_string()))?
                .into_owned();
        }
        result.validate()?;
        tracing::debug!("read {} annotation source descriptions", result.sources.len());
        Ok(result)
    }
}

/// The validated configuration of one load.
#[derive(Clone, Debug)]
pub struct LoadConfig {
    pub path_in: PathBuf,
    pub path_index: PathBuf,
    pub path_out: PathBuf,
    pub path_ped: Option<PathBuf>,
    pub sources: Vec<SourceConf>,
    pub anno_style: AnnotationStyle,
    pub num_workers: usize,
    pub chunks_per_worker: usize,
    /// Maximal number of records a worker sends at once.
    pub batch_size: usize,
    pub on_failure: FailurePolicy,
    /// `false` in genotype-free mode.
    pub genotypes: bool,
    pub force: bool,
}

impl LoadConfig {
    /// Resolve from the command line arguments.
    pub fn from_args(args: &super::Args) -> Result<Self, ConfigError> {
        if args.num_workers == 0 {
            return Err(ConfigError::NotPositive("--num-workers"));
        }
        if args.chunks_per_worker == 0 {
            return Err(ConfigError::NotPositive("--chunks-per-worker"));
        }
        if args.batch_size == 0 {
            return Err(ConfigError::NotPositive("--batch-size"));
        }
        let sources = match &args.path_annos {
            Some(path) => SourcesFile::load(Path::new(path))?.sources,
            None => Vec::new(),
        };

        Ok(Self {
            path_in: PathBuf::from(&args.path_in),
            path_index: match &args.path_index {
                Some(path) => PathBuf::from(path),
                None => PathBuf::from(format!("{}.tbi", &args.path_in)),
            },
            path_out: PathBuf::from(&args.path_out),
            path_ped: args.path_ped.as_ref().map(PathBuf::from),
            sources,
            anno_style: args.anno_style,
            num_workers: args.num_workers,
            chunks_per_worker: args.chunks_per_worker,
            batch_size: args.batch_size,
            on_failure: args.on_failure,
            genotypes: !args.no_genotypes,
            force: args.force,
        })
    }

    /// Number of chunks to split the input into.
    pub fn target_chunks(&self) -> usize {
        self.num_workers * self.chunks_per_worker
    }
}
