//! Common functionality.

use bytesize::ByteSize;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use indexmap::IndexMap;

pub mod io;
pub mod noodles;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Helper to print the current memory resident set size via `tracing`.
pub fn trace_rss_now() {
    let rss = procfs::process::Process::myself()
        .and_then(|me| me.stat())
        .map(|stat| stat.rss * procfs::page_size());
    match rss {
        Ok(rss) => tracing::debug!("RSS now: {}", ByteSize::b(rss)),
        Err(e) => tracing::trace!("could not determine RSS: {}", e),
    }
}

/// Definition of canonical chromosome names.
pub const CHROMS: &[&str] = &[
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "MT",
];

/// Build mapping of chromosome names to chromosome counts.
pub fn build_chrom_map() -> IndexMap<String, usize> {
    let mut result = IndexMap::new();
    for (i, &chrom_name) in CHROMS.iter().enumerate() {
        result.insert(chrom_name.to_owned(), i);
        result.insert(format!("chr{chrom_name}").to_owned(), i);
    }
    result.insert("x".to_owned(), 22);
    result.insert("y".to_owned(), 23);
    result.insert("chrx".to_owned(), 22);
    result.insert("chry".to_owned(), 23);
    result.insert("mt".to_owned(), 24);
    result.insert("m".to_owned(), 24);
    result.insert("M".to_owned(), 24);
    result.insert("chrmt".to_owned(), 24);
    result.insert("chrm".to_owned(), 24);
    result.insert("chrM".to_owned(), 24);
    result
}

/// Canonicalize a chromosome name for lookups.
///
/// The `"chr"` prefix is stripped and the mitochondrial genome is always
/// called `"MT"`, so UCSC and GRCh37 style names compare equal.
pub fn canonicalize(chrom: &str) -> String {
    let chrom = chrom.strip_prefix("chr").unwrap_or(chrom);
    if chrom == "M" {
        String::from("MT")
    } else {
        chrom.to_string()
    }
}

/// Mapping from chromosome name to sort key for one input file.
///
/// Canonical chromosomes sort first in karyotypic order; other contigs
/// follow in the order they are declared in the input header.
#[derive(Debug, Clone, Default)]
pub struct ChromOrder {
    canonical: IndexMap<String, usize>,
    contigs: IndexMap<String, usize>,
}

impl ChromOrder {
    /// Construct from the contig names declared in a VCF header.
    pub fn new<I, S>(contigs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let canonical = build_chrom_map();
        let contigs = contigs
            .into_iter()
            .filter(|name| !canonical.contains_key(name.as_ref()))
            .enumerate()
            .map(|(i, name)| (name.as_ref().to_string(), CHROMS.len() + i))
            .collect();
        Self { canonical, contigs }
    }

    /// Return sort key of `chrom`, `None` for undeclared non-canonical contigs.
    pub fn key(&self, chrom: &str) -> Option<usize> {
        self.canonical
            .get(chrom)
            .or_else(|| self.contigs.get(chrom))
            .copied()
    }
}

/// Classification of one genotype call.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum Genotype {
    /// hom. ref.
    HomRef,
    /// het.
    Het,
    /// hom. alt.
    HomAlt,
    /// no-call, partial no-call or empty
    Unknown,
}

impl Genotype {
    /// Classify from called allele indices, `None` marks a no-call allele.
    pub fn from_alleles(alleles: &[Option<u32>]) -> Self {
        if alleles.is_empty() || alleles.iter().any(Option::is_none) {
            return Genotype::Unknown;
        }
        let alt = alleles.iter().filter(|a| **a != Some(0)).count();
        if alt == 0 {
            Genotype::HomRef
        } else if alt == alleles.len() && alleles.iter().all(|a| *a == alleles[0]) {
            Genotype::HomAlt
        } else {
            Genotype::Het
        }
    }

    /// Integer code as stored in the `gt_type` column.
    ///
    /// The codes are the ones used by established variant databases:
    /// hom. ref. = 0, het. = 1, unknown = 2, hom. alt. = 3.
    pub fn code(self) -> i64 {
        match self {
            Genotype::HomRef => 0,
            Genotype::Het => 1,
            Genotype::Unknown => 2,
            Genotype::HomAlt => 3,
        }
    }
}

/// Return the version of the `varload` crate and `x.y.z` in tests.
pub fn worker_version() -> &'static str {
    if cfg!(test) {
        "x.y.z"
    } else {
        env!("CARGO_PKG_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest::rstest]
    #[case("chr1", "1")]
    #[case("1", "1")]
    #[case("chrM", "MT")]
    #[case("M", "MT")]
    #[case("MT", "MT")]
    #[case("chrX", "X")]
    #[case("GL000220.1", "GL000220.1")]
    fn canonicalize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(super::canonicalize(input), expected);
    }

    #[test]
    fn chrom_order() {
        let order = ChromOrder::new(["1", "2", "GL000220.1", "X", "HLA-A"]);

        assert_eq!(order.key("1"), Some(0));
        assert_eq!(order.key("chr2"), Some(1));
        assert_eq!(order.key("X"), Some(22));
        assert_eq!(order.key("chrM"), Some(24));
        assert_eq!(order.key("GL000220.1"), Some(25));
        assert_eq!(order.key("HLA-A"), Some(26));
        assert_eq!(order.key("unplaced"), None);
    }

    #[rstest::rstest]
    #[case(&[Some(0), Some(0)], Genotype::HomRef)]
    #[case(&[Some(0), Some(1)], Genotype::Het)]
    #[case(&[Some(1), Some(2)], Genotype::Het)]
    #[case(&[Some(1), Some(1)], Genotype::HomAlt)]
    #[case(&[Some(2), Some(2)], Genotype::HomAlt)]
    #[case(&[Some(1)], Genotype::HomAlt)]
    #[case(&[Some(0)], Genotype::HomRef)]
    #[case(&[None, Some(1)], Genotype::Unknown)]
    #[case(&[None, None], Genotype::Unknown)]
    #[case(&[], Genotype::Unknown)]
    fn genotype_from_alleles(#[case] alleles: &[Option<u32>], #[case] expected: Genotype) {
        assert_eq!(Genotype::from_alleles(alleles), expected);
    }

    #[test]
    fn genotype_codes() {
        assert_eq!(Genotype::HomRef.code(), 0);
        assert_eq!(Genotype::Het.code(), 1);
        assert_eq!(Genotype::Unknown.code(), 2);
        assert_eq!(Genotype::HomAlt.code(), 3);
    }
}
