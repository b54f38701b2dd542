//! Reading of the input VCF header.

use std::path::Path;

use noodles_bgzf as bgzf;
use noodles_vcf as vcf;

use crate::{common::noodles, err::IndexingError};

/// Information from the input header needed by the load.
#[derive(Debug, Clone)]
pub struct InputHeader {
    /// Sample names in column order.
    pub sample_names: Vec<String>,
    /// Declared contig names in header order.
    pub contigs: Vec<String>,
    /// Sub-field names of the VEP `CSQ` field, if declared.
    pub vep_format: Option<Vec<String>>,
    /// Virtual position of the first data record.
    pub data_start: bgzf::VirtualPosition,
    /// Number of header lines, the first record is on the following line.
    pub header_lines: usize,
    /// The parsed header, used for parsing records.
    pub header: vcf::Header,
}

/// Extract the sub-field names from the `##INFO=<ID=CSQ,...>` header line.
///
/// VEP declares them in the description as `"... Format: Allele|Consequence|..."`.
pub fn parse_vep_format(header_text: &str) -> Option<Vec<String>> {
    let line = header_text
        .lines()
        .find(|line| line.starts_with("##INFO=<ID=CSQ,"))?;
    let (_, format) = line.split_once("Format: ")?;
    let format = format.split('"').next()?.trim();
    if format.is_empty() {
        None
    } else {
        Some(format.split('|').map(|s| s.trim().to_string()).collect())
    }
}

/// Parse the raw header text.
pub fn parse_header(
    text: &str,
    data_start: bgzf::VirtualPosition,
) -> Result<InputHeader, IndexingError> {
    let header: vcf::Header = text
        .parse()
        .map_err(|e| IndexingError::Header(format!("{}", e)))?;

    let sample_names = header
        .sample_names()
        .iter()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    let declared = text
        .lines()
        .find(|line| line.starts_with("#CHROM"))
        .map(|line| line.split('\t').skip(9).count())
        .ok_or_else(|| IndexingError::Header(String::from("missing #CHROM line")))?;
    if declared != sample_names.len() {
        return Err(IndexingError::Header(String::from(
            "sample names in #CHROM line are not unique",
        )));
    }

    Ok(InputHeader {
        sample_names,
        contigs: header.contigs().keys().map(|name| name.to_string()).collect(),
        vep_format: parse_vep_format(text),
        data_start,
        header_lines: text.lines().count(),
        header,
    })
}

/// Read the header of the BGZF compressed VCF file at `path`.
#[tracing::instrument]
pub fn read_input_header(path: &Path) -> Result<InputHeader, IndexingError> {
    let mut reader = noodles::open_bgzf(path).map_err(|source| IndexingError::Input {
        path: path.display().to_string(),
        source,
    })?;
    let raw = noodles::read_raw_header(&mut reader)?;
    let header = parse_header(&raw.text, raw.data_start)?;
    tracing::debug!(
        "header declares {} samples and {} contigs",
        header.sample_names.len(),
        header.contigs.len()
    );
    Ok(header)
}
