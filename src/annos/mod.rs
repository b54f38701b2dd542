//! Annotation of variants with overlapping intervals from BED-like sources.
//!
//! Each source is loaded once into per-chromosome interval trees and shared
//! read-only between all workers.  When more than one interval of a source
//! overlaps a variant, the intervals are ranked by
//!
//! 1. larger overlap with the variant interval,
//! 2. higher score (intervals without score rank lowest),
//! 3. smaller start,
//! 4. smaller end,
//! 5. lexicographically smaller value.
//!
//! This is a total order on distinct intervals, so the result does not
//! depend on the order of the intervals in the source file.

use std::{cmp::Ordering, path::Path, sync::Arc, time::Instant};

use bio::data_structures::interval_tree::ArrayBackedIntervalTree;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    common::{canonicalize, io::open_read_maybe_gz, trace_rss_now},
    err::{AnnotationSourceError, LoadError},
    load::{conf::SourceConf, record::Variant},
};

/// Alias for the interval tree that we use.
type IntervalTree = ArrayBackedIntervalTree<i64, u32>;

/// How the overlapping intervals of one source become one value.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// `1` if any interval overlaps, else `0`.
    Flag,
    /// Value of the best ranked interval.
    Best,
    /// Distinct values of all overlapping intervals in rank order, comma separated.
    List,
    /// Minimum of the numeric values.
    Min,
    /// Maximum of the numeric values.
    Max,
    /// Mean of the numeric values.
    Mean,
}

impl Mode {
    /// Whether the mode aggregates numbers.
    pub fn is_numeric(self) -> bool {
        matches!(self, Mode::Min | Mode::Max | Mode::Mean)
    }

    /// SQL column type for values of this mode.
    pub fn sql_type(self) -> &'static str {
        match self {
            Mode::Flag => "INTEGER",
            Mode::Best | Mode::List => "TEXT",
            Mode::Min | Mode::Max | Mode::Mean => "REAL",
        }
    }
}

/// Chromosome naming convention of a source file.
///
/// Names are canonicalised on load and on query, so both conventions can be
/// mixed with any input.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Naming {
    /// `chr1`, ..., `chrM`
    #[default]
    Ucsc,
    /// `1`, ..., `MT`
    Grch37,
}

impl Naming {
    /// Whether `chrom` is written in this convention.
    pub fn matches(self, chrom: &str) -> bool {
        match self {
            Naming::Ucsc => chrom.starts_with("chr"),
            Naming::Grch37 => !chrom.starts_with("chr"),
        }
    }
}

/// An annotation value as written to the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AnnoValue {
    Int(i64),
    Real(f64),
    Text(String),
}

/// One interval of a source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// 0-based begin position.
    pub begin: i64,
    /// End position.
    pub end: i64,
    pub value: Option<String>,
    /// Score, the numeric value for numeric modes.
    pub score: Option<f64>,
}

impl SourceRecord {
    fn overlap(&self, query: &std::ops::Range<i64>) -> i64 {
        self.end.min(query.end) - self.begin.max(query.start)
    }
}

/// Compare two overlapping records; the better ranked one is `Less`.
fn rank(lhs: &SourceRecord, rhs: &SourceRecord, query: &std::ops::Range<i64>) -> Ordering {
    rhs.overlap(query)
        .cmp(&lhs.overlap(query))
        .then_with(|| match (lhs.score, rhs.score) {
            (Some(l), Some(r)) => r.total_cmp(&l),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| lhs.begin.cmp(&rhs.begin))
        .then_with(|| lhs.end.cmp(&rhs.end))
        .then_with(|| lhs.value.cmp(&rhs.value))
}

/// A loaded, immutable annotation source.
#[derive(Debug)]
pub struct IntervalSource {
    pub name: String,
    pub mode: Mode,
    /// Mapping from canonical chromosome name to index into `records` and `trees`.
    chrom_map: IndexMap<String, usize>,
    /// Records, stored by chromosome.
    records: Vec<Vec<SourceRecord>>,
    /// Interval trees, stored by chromosome.
    trees: Vec<IntervalTree>,
}

impl IntervalSource {
    /// Build from records given as `(chrom, record)` pairs.
    pub fn from_records<I>(name: &str, mode: Mode, records: I) -> Self
    where
        I: IntoIterator<Item = (String, SourceRecord)>,
    {
        let mut result = Self {
            name: name.to_string(),
            mode,
            chrom_map: IndexMap::new(),
            records: Vec::new(),
            trees: Vec::new(),
        };
        for (chrom, record) in records {
            result.insert(&chrom, record);
        }
        result.trees.iter_mut().for_each(|tree| tree.index());
        result
    }

    fn insert(&mut self, chrom: &str, record: SourceRecord) {
        let chrom = canonicalize(chrom);
        let chrom_no = match self.chrom_map.get(&chrom) {
            Some(chrom_no) => *chrom_no,
            None => {
                self.chrom_map.insert(chrom, self.records.len());
                self.records.push(Vec::new());
                self.trees.push(IntervalTree::new());
                self.records.len() - 1
            }
        };
        // Zero-length intervals would never be found.
        let key = record.begin..record.end.max(record.begin.saturating_add(1));
        self.trees[chrom_no].insert(key, self.records[chrom_no].len() as u32);
        self.records[chrom_no].push(record);
    }

    /// Number of intervals in the source.
    pub fn len(&self) -> usize {
        self.records.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records overlapping `[begin, end)` on `chrom`, best ranked first.
    pub fn fetch_records(&self, chrom: &str, begin: i64, end: i64) -> Vec<&SourceRecord> {
        let query = begin..end.max(begin.saturating_add(1));
        let Some(chrom_no) = self.chrom_map.get(&canonicalize(chrom)) else {
            return Vec::new();
        };
        let mut result = self.trees[*chrom_no]
            .find(query.clone())
            .iter()
            .map(|e| &self.records[*chrom_no][*e.data() as usize])
            .collect::<Vec<_>>();
        result.sort_by(|lhs, rhs| rank(lhs, rhs, &query));
        result
    }

    /// Compute the value for the interval `[begin, end)` on `chrom`.
    ///
    /// No overlap yields `None`, except for flags, which yield `0`.
    pub fn annotate(&self, chrom: &str, begin: i64, end: i64) -> Option<AnnoValue> {
        let records = self.fetch_records(chrom, begin, end);
        match self.mode {
            Mode::Flag => Some(AnnoValue::Int(i64::from(!records.is_empty()))),
            Mode::Best => records.first().and_then(|record| {
                record
                    .value
                    .clone()
                    .map(AnnoValue::Text)
                    .or(record.score.map(AnnoValue::Real))
            }),
            Mode::List => {
                let values = records
                    .iter()
                    .filter_map(|record| record.value.as_deref())
                    .unique()
                    .join(",");
                if values.is_empty() {
                    None
                } else {
                    Some(AnnoValue::Text(values))
                }
            }
            Mode::Min | Mode::Max | Mode::Mean => {
                let scores = records
                    .iter()
                    .filter_map(|record| record.score)
                    .collect::<Vec<_>>();
                if scores.is_empty() {
                    return None;
                }
                let value = match self.mode {
                    Mode::Min => scores.iter().copied().fold(f64::INFINITY, f64::min),
                    Mode::Max => scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    _ => scores.iter().sum::<f64>() / scores.len() as f64,
                };
                Some(AnnoValue::Real(value))
            }
        }
    }
}

/// Parse one field as number, for error reporting `what` names the field.
fn parse_number<T: std::str::FromStr>(
    conf: &SourceConf,
    line: usize,
    what: &str,
    value: &str,
) -> Result<T, AnnotationSourceError> {
    value.parse::<T>().map_err(|_| AnnotationSourceError::Record {
        name: conf.name.clone(),
        line,
        reason: format!("invalid {} {:?}", what, value),
    })
}

/// Parse a score, which must be finite.
fn parse_score(
    conf: &SourceConf,
    line: usize,
    what: &str,
    value: &str,
) -> Result<f64, AnnotationSourceError> {
    parse_number::<f64>(conf, line, what, value)
        .ok()
        .filter(|score| score.is_finite())
        .ok_or_else(|| AnnotationSourceError::Record {
            name: conf.name.clone(),
            line,
            reason: format!("invalid {} {:?}", what, value),
        })
}

/// Load the source described by `conf`.
#[tracing::instrument(skip(conf), fields(name = %conf.name))]
pub fn load_source(conf: &SourceConf) -> Result<IntervalSource, AnnotationSourceError> {
    tracing::debug!("loading annotation source from {}", &conf.path);
    let before_loading = Instant::now();

    let load_err = |reason: String| AnnotationSourceError::Load {
        name: conf.name.clone(),
        path: conf.path.clone(),
        reason,
    };
    let reader = open_read_maybe_gz(Path::new(&conf.path)).map_err(|e| load_err(e.to_string()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .flexible(true)
        .from_reader(reader);

    let mut records = Vec::new();
    // First chromosome name not following the declared naming, and the count.
    let mut mismatched: Option<String> = None;
    let mut mismatched_count = 0;
    for result in reader.records() {
        let record = result.map_err(|e| load_err(e.to_string()))?;
        let line = record.position().map(|pos| pos.line() as usize).unwrap_or(0);
        if record.len() == 0
            || (record.len() == 1 && record[0].is_empty())
            || record[0].starts_with("track")
            || record[0].starts_with("browser")
        {
            continue;
        }
        if record.len() < 3 {
            return Err(AnnotationSourceError::Record {
                name: conf.name.clone(),
                line,
                reason: format!("expected at least 3 columns but found {}", record.len()),
            });
        }

        let begin: i64 = parse_number(conf, line, "start", &record[1])?;
        let end: i64 = parse_number(conf, line, "end", &record[2])?;
        if begin < 0 {
            return Err(AnnotationSourceError::Record {
                name: conf.name.clone(),
                line,
                reason: format!("negative start {}", begin),
            });
        }
        if end < begin {
            return Err(AnnotationSourceError::Record {
                name: conf.name.clone(),
                line,
                reason: format!("end {} before start {}", end, begin),
            });
        }
        let value = record
            .get(conf.value_column - 1)
            .filter(|value| !value.is_empty() && *value != ".")
            .map(String::from);
        let score = match conf.score_column {
            Some(column) => match record.get(column - 1) {
                Some(".") | Some("") | None => None,
                Some(score) => Some(parse_score(conf, line, "score", score)?),
            },
            None if conf.mode.is_numeric() => match value.as_deref() {
                Some(value) => Some(parse_score(conf, line, "value", value)?),
                None => None,
            },
            None => None,
        };

        if !conf.naming.matches(&record[0]) {
            mismatched.get_or_insert_with(|| record[0].to_string());
            mismatched_count += 1;
        }
        records.push((
            record[0].to_string(),
            SourceRecord {
                begin,
                end,
                value,
                score,
            },
        ));
    }

    if let Some(chrom) = mismatched {
        tracing::warn!(
            "{} of {} intervals do not use {} chromosome names (first: {:?})",
            mismatched_count,
            records.len(),
            conf.naming,
            chrom
        );
    }
    let result = IntervalSource::from_records(&conf.name, conf.mode, records);
    tracing::debug!(
        "done loading {} intervals on {} chromosomes in {:?}",
        result.len(),
        result.chrom_map.len(),
        before_loading.elapsed()
    );
    Ok(result)
}

/// Outcome of loading one configured source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub name: String,
    pub path: String,
    pub mode: Mode,
    pub naming: Naming,
    pub loaded: bool,
}

/// The set of configured sources, queried for every variant.
#[derive(Debug, Default)]
pub struct Annotator {
    /// One slot per configured source, `None` if an optional source failed to load.
    sources: Vec<Option<Arc<IntervalSource>>>,
    resources: Vec<ResourceInfo>,
}

impl Annotator {
    /// Create from already loaded sources.
    pub fn new(sources: Vec<IntervalSource>) -> Self {
        let resources = sources
            .iter()
            .map(|source| ResourceInfo {
                name: source.name.clone(),
                path: String::new(),
                mode: source.mode,
                naming: Naming::default(),
                loaded: true,
            })
            .collect();
        Self {
            sources: sources.into_iter().map(|s| Some(Arc::new(s))).collect(),
            resources,
        }
    }

    /// Load all configured sources.
    ///
    /// Optional sources that fail to load are logged and left empty; any
    /// other failure is returned.
    #[tracing::instrument(skip(confs))]
    pub fn load(confs: &[SourceConf]) -> Result<Self, LoadError> {
        tracing::info!("Loading {} annotation sources", confs.len());
        let mut result = Self::default();
        for conf in confs {
            let source = match load_source(conf) {
                Ok(source) => Some(Arc::new(source)),
                Err(e) if conf.optional => {
                    tracing::warn!("{}, column {} stays empty", e, &conf.name);
                    None
                }
                Err(e) => return Err(e.into()),
            };
            result.resources.push(ResourceInfo {
                name: conf.name.clone(),
                path: conf.path.clone(),
                mode: conf.mode,
                naming: conf.naming,
                loaded: source.is_some(),
            });
            result.sources.push(source);
        }
        trace_rss_now();
        Ok(result)
    }

    /// Information on the configured sources, in configuration order.
    pub fn resources(&self) -> &[ResourceInfo] {
        &self.resources
    }

    /// Annotate `variant`, one value per configured source in configuration order.
    pub fn annotate(&self, variant: &Variant) -> Vec<Option<AnnoValue>> {
        let begin = i64::try_from(variant.start).unwrap_or(i64::MAX);
        let end = i64::try_from(variant.end).unwrap_or(i64::MAX);
        self.sources
            .iter()
            .map(|source| {
                source
                    .as_ref()
                    .and_then(|source| source.annotate(&variant.chrom, begin, end))
            })
            .collect()
    }
}
