//! Parsing of VCF record lines.

use noodles_vcf::{
    self as vcf,
    record::genotypes::{
        keys::{key, Key},
        sample::Value,
        Sample,
    },
};
use serde::{Deserialize, Serialize};

use crate::{common::Genotype, err::ParseError};

use super::csq::{Consequence, ConsequenceParser};

/// Number of fixed columns before FORMAT.
const FIXED_COLUMNS: usize = 8;

/// Coarse classification of a variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum VarType {
    Snp,
    Indel,
    Mnp,
    Sv,
    /// No alternative allele.
    Ref,
}

/// One variant record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    /// Chromosome name as in the input.
    pub chrom: String,
    /// 1-based position.
    pub pos: usize,
    /// 0-based begin position.
    pub start: usize,
    /// 0-based exclusive end position, `INFO/END` for structural variants.
    pub end: usize,
    pub vcf_id: Option<String>,
    pub reference: String,
    pub alternatives: Vec<String>,
    pub qual: Option<f32>,
    pub filter: Option<String>,
    /// Raw INFO column.
    pub info: String,
    pub var_type: VarType,
    pub sub_type: Option<String>,
    /// Consequence embedded by the upstream annotator.
    pub consequence: Option<Consequence>,
}

/// A parsed record with its per-sample values.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedRecord {
    pub variant: Variant,
    /// The record as parsed by noodles, without samples in genotype-free mode.
    pub record: vcf::Record,
}

/// One genotype call of one sample at one variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenotypeCall {
    /// Raw `GT` value, `None` if absent.
    pub gt: Option<String>,
    /// Called allele indices, `None` for no-call alleles.
    pub alleles: Vec<Option<u32>>,
    pub phased: bool,
    pub genotype: Genotype,
    /// Read depth `DP`.
    pub depth: Option<i64>,
    /// Genotype quality `GQ`.
    pub gq: Option<i64>,
}

impl GenotypeCall {
    /// A call where nothing is known.
    pub fn missing() -> Self {
        Self {
            gt: None,
            alleles: Vec::new(),
            phased: false,
            genotype: Genotype::Unknown,
            depth: None,
            gq: None,
        }
    }

    /// Build from the values of one sample.
    pub fn from_sample(sample: &Sample<'_>) -> Result<Self, String> {
        let mut result = Self::missing();
        if let Some(Some(gt)) = sample.get(&key::GENOTYPE) {
            match gt {
                Value::String(gt) => {
                    let (alleles, phased) = parse_gt(gt)?;
                    result.genotype = Genotype::from_alleles(&alleles);
                    result.alleles = alleles;
                    result.phased = phased;
                    result.gt = Some(gt.clone());
                }
                _ => return Err(format!("invalid GT value {:?}", gt.to_string())),
            }
        }
        result.depth = integer_value(sample, &key::READ_DEPTH)?;
        result.gq = integer_value(sample, &key::CONDITIONAL_GENOTYPE_QUALITY)?;
        Ok(result)
    }

    pub fn is_het(&self) -> bool {
        self.genotype == Genotype::Het
    }

    pub fn is_hom_alt(&self) -> bool {
        self.genotype == Genotype::HomAlt
    }

    pub fn is_missing(&self) -> bool {
        self.genotype == Genotype::Unknown
    }
}

/// Parse a `GT` value into allele indices and phasing.
fn parse_gt(value: &str) -> Result<(Vec<Option<u32>>, bool), String> {
    let phased = value.contains('|');
    let alleles = value
        .split(['/', '|'])
        .map(|allele| match allele {
            "." => Ok(None),
            _ => allele
                .parse::<u32>()
                .map(Some)
                .map_err(|_| format!("invalid GT value {:?}", value)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((alleles, phased))
}

fn integer_value(sample: &Sample<'_>, key: &Key) -> Result<Option<i64>, String> {
    match sample.get(key) {
        Some(Some(Value::Integer(value))) => Ok(Some(i64::from(*value))),
        Some(Some(value)) => Err(format!("invalid {} value {:?}", key, value.to_string())),
        Some(None) | None => Ok(None),
    }
}

/// Render an error with its chain of causes.
fn describe(err: &dyn std::error::Error) -> String {
    let mut result = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        result.push_str(": ");
        result.push_str(&cause.to_string());
        source = cause.source();
    }
    result
}

/// The first `FIXED_COLUMNS` columns of `line`.
fn fixed_columns(line: &str) -> &str {
    match line.match_indices('\t').nth(FIXED_COLUMNS - 1) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Classify the variant by its alleles.
pub fn classify(reference: &str, alternatives: &[String]) -> (VarType, Option<String>) {
    if alternatives.is_empty() {
        return (VarType::Ref, None);
    }
    let is_symbolic = |alt: &str| {
        alt.starts_with('<') || alt.contains('[') || alt.contains(']') || alt == "*"
    };
    if let Some(alt) = alternatives.iter().find(|alt| is_symbolic(alt)) {
        let sub_type = alt
            .strip_prefix('<')
            .and_then(|alt| alt.strip_suffix('>'))
            .map(|name| name.split(':').next().unwrap_or(name).to_string())
            .unwrap_or_else(|| String::from("complex"));
        return (VarType::Sv, Some(sub_type));
    }

    if reference.len() == 1 && alternatives.iter().all(|alt| alt.len() == 1) {
        let sub_type = if alternatives.len() > 1 {
            String::from("unknown")
        } else if is_transition(reference, &alternatives[0]) {
            String::from("ts")
        } else {
            String::from("tv")
        };
        (VarType::Snp, Some(sub_type))
    } else if alternatives.iter().all(|alt| alt.len() == reference.len()) {
        (VarType::Mnp, None)
    } else {
        let sub_type = if alternatives.iter().all(|alt| alt.len() > reference.len()) {
            "ins"
        } else if alternatives.iter().all(|alt| alt.len() < reference.len()) {
            "del"
        } else {
            "unknown"
        };
        (VarType::Indel, Some(sub_type.to_string()))
    }
}

fn is_transition(reference: &str, alternative: &str) -> bool {
    matches!(
        (
            reference.to_ascii_uppercase().as_str(),
            alternative.to_ascii_uppercase().as_str()
        ),
        ("A", "G") | ("G", "A") | ("C", "T") | ("T", "C")
    )
}

/// Parser for record lines of one input file.
///
/// All configuration-dependent choices are resolved on construction.
#[derive(Clone, Debug)]
pub struct RecordParser {
    /// Header used for parsing, without samples in genotype-free mode.
    header: vcf::Header,
    /// Number of declared samples, `None` in genotype-free mode.
    sample_count: Option<usize>,
    csq: ConsequenceParser,
}

impl RecordParser {
    /// Create a parser for records of a file with `header`.
    ///
    /// Without `genotypes`, sample columns are neither checked nor parsed.
    pub fn new(header: &vcf::Header, genotypes: bool, csq: ConsequenceParser) -> Self {
        let mut header = header.clone();
        let sample_count = if genotypes {
            Some(header.sample_names().len())
        } else {
            header.sample_names_mut().clear();
            None
        };
        Self {
            header,
            sample_count,
            csq,
        }
    }

    /// Parse one record line; `line_no` is only used for error reporting.
    pub fn parse(&self, line: &str, line_no: usize) -> Result<ParsedRecord, ParseError> {
        let num_columns = line.split('\t').count();
        match self.sample_count {
            Some(0) if num_columns == FIXED_COLUMNS || num_columns == FIXED_COLUMNS + 1 => (),
            Some(n) if num_columns == FIXED_COLUMNS + 1 + n => (),
            None if num_columns >= FIXED_COLUMNS => (),
            Some(n) => {
                return Err(ParseError::new(
                    line_no,
                    format!(
                        "expected {} columns but found {}",
                        if n == 0 {
                            FIXED_COLUMNS
                        } else {
                            FIXED_COLUMNS + 1 + n
                        },
                        num_columns
                    ),
                    line,
                ))
            }
            None => {
                return Err(ParseError::new(
                    line_no,
                    format!(
                        "expected at least {} columns but found {}",
                        FIXED_COLUMNS, num_columns
                    ),
                    line,
                ))
            }
        }

        let text = match self.sample_count {
            Some(n) if n > 0 => line,
            _ => fixed_columns(line),
        };
        let record = vcf::Record::try_from((&self.header, text))
            .map_err(|e| ParseError::new(line_no, describe(&e), line))?;

        let pos = usize::from(record.position());
        if pos == 0 {
            return Err(ParseError::new(
                line_no,
                "POS must be a positive integer",
                line,
            ));
        }
        let end = record
            .end()
            .map(usize::from)
            .map_err(|e| ParseError::new(line_no, format!("invalid END: {}", describe(&e)), line))?;
        if end < pos {
            return Err(ParseError::new(line_no, "INFO/END before POS", line));
        }

        let reference = record.reference_bases().to_string();
        let alternatives = record
            .alternate_bases()
            .iter()
            .map(|allele| allele.to_string())
            .collect::<Vec<_>>();
        let (var_type, sub_type) = classify(&reference, &alternatives);

        Ok(ParsedRecord {
            variant: Variant {
                chrom: record.chromosome().to_string(),
                pos,
                start: pos - 1,
                end,
                vcf_id: Some(record.ids())
                    .filter(|ids| !ids.is_empty())
                    .map(|ids| ids.to_string()),
                reference,
                alternatives,
                qual: record.quality_score().map(f32::from),
                filter: record.filters().map(|filters| filters.to_string()),
                info: text.split('\t').nth(FIXED_COLUMNS - 1).unwrap_or(".").to_string(),
                var_type,
                sub_type,
                consequence: self.csq.from_info(record.info()),
            },
            record,
        })
    }
}

impl ParsedRecord {
    /// Convert the per-sample values into genotype calls.
    pub fn genotype_calls(&self, line_no: usize) -> Result<Vec<GenotypeCall>, ParseError> {
        self.record
            .genotypes()
            .values()
            .map(|sample| {
                GenotypeCall::from_sample(&sample).map_err(|reason| {
                    ParseError::new(
                        line_no,
                        reason,
                        &format!("{}:{}", self.variant.chrom, self.variant.pos),
                    )
                })
            })
            .collect()
    }
}
