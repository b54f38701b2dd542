//! Functional consequence fields embedded by an upstream annotator.
//!
//! Two embedding conventions are supported: VEP writes a `CSQ` INFO field
//! whose sub-field layout is declared in the header, snpEff writes an `ANN`
//! INFO field with a fixed layout.

use itertools::Itertools;
use noodles_vcf as vcf;
use serde::{Deserialize, Serialize};

/// The consequence embedding style of the input file.
#[derive(
    clap::ValueEnum,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AnnotationStyle {
    /// Ensembl VEP, `INFO/CSQ`
    Vep,
    /// snpEff, `INFO/ANN`
    #[value(name = "snpeff")]
    SnpEff,
}

/// Putative impact of a consequence, ordered from least to most severe.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Severity {
    Modifier,
    Low,
    Moderate,
    High,
}

impl Severity {
    /// Severity of a single Sequence Ontology consequence term.
    pub fn of_term(term: &str) -> Self {
        match term {
            "transcript_ablation"
            | "splice_acceptor_variant"
            | "splice_donor_variant"
            | "stop_gained"
            | "frameshift_variant"
            | "stop_lost"
            | "start_lost"
            | "transcript_amplification"
            | "exon_loss_variant"
            | "rare_amino_acid_variant"
            | "chromosome_number_variation" => Severity::High,
            "inframe_insertion"
            | "inframe_deletion"
            | "disruptive_inframe_insertion"
            | "disruptive_inframe_deletion"
            | "conservative_inframe_insertion"
            | "conservative_inframe_deletion"
            | "missense_variant"
            | "protein_altering_variant"
            | "5_prime_UTR_truncation"
            | "3_prime_UTR_truncation" => Severity::Moderate,
            "splice_region_variant"
            | "incomplete_terminal_codon_variant"
            | "start_retained_variant"
            | "stop_retained_variant"
            | "synonymous_variant"
            | "initiator_codon_variant"
            | "5_prime_UTR_premature_start_codon_gain_variant" => Severity::Low,
            _ => Severity::Modifier,
        }
    }

    /// Severity of an `&`-joined list of terms, the most severe one wins.
    pub fn of_terms(terms: &str) -> Self {
        terms
            .split('&')
            .map(Severity::of_term)
            .max()
            .unwrap_or(Severity::Modifier)
    }
}

/// The consequence of the most severely affected transcript.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Consequence {
    pub gene: Option<String>,
    pub transcript: Option<String>,
    pub consequence: Option<String>,
    pub impact: Option<Severity>,
    pub hgvs_c: Option<String>,
    pub hgvs_p: Option<String>,
    /// Number of transcript effects listed for the record.
    pub effect_count: usize,
}

/// Positions of the sub-fields within one consequence entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldLayout {
    pub consequence: Option<usize>,
    pub impact: Option<usize>,
    pub gene: Option<usize>,
    pub transcript: Option<usize>,
    pub hgvs_c: Option<usize>,
    pub hgvs_p: Option<usize>,
}

impl FieldLayout {
    /// Fixed layout of snpEff's `ANN` field.
    pub fn snpeff() -> Self {
        Self {
            consequence: Some(1),
            impact: Some(2),
            gene: Some(3),
            transcript: Some(6),
            hgvs_c: Some(9),
            hgvs_p: Some(10),
        }
    }

    /// Layout from the sub-field names declared in the VEP `CSQ` header.
    pub fn vep<S: AsRef<str>>(names: &[S]) -> Self {
        let find = |wanted: &str| {
            names
                .iter()
                .position(|name| name.as_ref().eq_ignore_ascii_case(wanted))
        };
        Self {
            consequence: find("Consequence"),
            impact: find("IMPACT"),
            gene: find("SYMBOL").or_else(|| find("Gene")),
            transcript: find("Feature"),
            hgvs_c: find("HGVSc"),
            hgvs_p: find("HGVSp"),
        }
    }
}

/// Strategy for extracting consequences, resolved once per load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsequenceParser {
    /// The INFO key holding the entries.
    key: &'static str,
    layout: FieldLayout,
}

impl ConsequenceParser {
    /// Resolve the strategy for `style`.
    ///
    /// `vep_format` is the list of sub-field names declared in the header's
    /// `CSQ` description and is ignored for snpEff.
    pub fn new(style: AnnotationStyle, vep_format: Option<&[String]>) -> Self {
        match style {
            AnnotationStyle::Vep => {
                let layout = match vep_format {
                    Some(names) => FieldLayout::vep(names),
                    None => {
                        tracing::warn!(
                            "no CSQ format declared in header, consequence columns stay empty"
                        );
                        FieldLayout::default()
                    }
                };
                Self { key: "CSQ", layout }
            }
            AnnotationStyle::SnpEff => Self {
                key: "ANN",
                layout: FieldLayout::snpeff(),
            },
        }
    }

    /// The INFO key holding the entries.
    pub fn key(&self) -> &str {
        self.key
    }

    /// Extract the consequence from the INFO field of a parsed record.
    ///
    /// The field is a single string when undeclared and a list of strings
    /// when declared with `Number=.`.
    pub fn from_info(&self, info: &vcf::record::Info) -> Option<Consequence> {
        use vcf::record::info::field::{value::Array, Value};

        let value = info
            .keys()
            .zip(info.values())
            .find(|(key, _)| key.as_ref() == self.key)
            .and_then(|(_, value)| value)?;
        match value {
            Value::String(value) => self.parse(value),
            Value::Array(Array::String(values)) => {
                self.parse(&values.iter().flatten().join(","))
            }
            _ => None,
        }
    }

    /// Pick the most severe of the comma-separated entries in `value`.
    ///
    /// Returns `None` if there are no entries.
    pub fn parse(&self, value: &str) -> Option<Consequence> {
        let mut best: Option<(Severity, Vec<&str>)> = None;
        let mut effect_count = 0;
        for entry in value.split(',').filter(|entry| !entry.is_empty()) {
            effect_count += 1;
            let fields = entry.split('|').collect::<Vec<_>>();
            let severity = self.severity(&fields);
            match &best {
                Some((best_severity, _)) if *best_severity >= severity => (),
                _ => best = Some((severity, fields)),
            }
        }

        let (severity, fields) = best?;
        let get = |idx: Option<usize>| {
            idx.and_then(|idx| fields.get(idx))
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string())
        };

        Some(Consequence {
            gene: get(self.layout.gene),
            transcript: get(self.layout.transcript),
            consequence: get(self.layout.consequence),
            impact: if self.layout.impact.is_some() || self.layout.consequence.is_some() {
                Some(severity)
            } else {
                None
            },
            hgvs_c: get(self.layout.hgvs_c),
            hgvs_p: get(self.layout.hgvs_p),
            effect_count,
        })
    }

    /// Severity of one entry, from the impact field if present else from the terms.
    fn severity(&self, fields: &[&str]) -> Severity {
        let from_impact = self
            .layout
            .impact
            .and_then(|idx| fields.get(idx))
            .and_then(|impact| impact.parse::<Severity>().ok());
        from_impact.unwrap_or_else(|| {
            self.layout
                .consequence
                .and_then(|idx| fields.get(idx))
                .map(|terms| Severity::of_terms(terms))
                .unwrap_or(Severity::Modifier)
        })
    }
}
