//! Splitting of the BGZF compressed input into record-aligned chunks.
//!
//! Record starts are taken from the tabix index: every chunk stored in the
//! index bins starts at a record.  Split points are chosen at quantiles of
//! the compressed file size and snapped to the next record start.  If all
//! records share few BGZF blocks, split points fall back to quantiles of the
//! list of record starts.

use std::{fs::File, io::BufRead, path::Path};

use noodles_bgzf::{self as bgzf, VirtualPosition};

use crate::{common::noodles, err::IndexingError};

/// A record-aligned slice of the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based rank in file order.
    pub id: usize,
    /// Virtual position of the first record.
    pub start: VirtualPosition,
    /// Virtual position of the first record of the next chunk, `None` for the last chunk.
    pub end: Option<VirtualPosition>,
}

/// Collect the record start positions stored in the tabix index at `path`.
fn index_record_starts(path: &Path) -> Result<Vec<VirtualPosition>, IndexingError> {
    let index = noodles_tabix::read(path).map_err(|source| IndexingError::Index {
        path: path.display().to_string(),
        source,
    })?;

    let mut result = index
        .reference_sequences()
        .iter()
        .flat_map(|reference_sequence| reference_sequence.bins().values())
        .flat_map(|bin| bin.chunks().iter().map(|chunk| chunk.start()))
        .collect::<Vec<_>>();
    result.sort();
    result.dedup();
    Ok(result)
}

/// Check that the line at `pos` is the start of a data record.
pub fn check_boundary(
    reader: &mut bgzf::Reader<File>,
    pos: VirtualPosition,
) -> Result<(), IndexingError> {
    let misaligned = |reason: &str| IndexingError::Misaligned {
        offset: pos,
        reason: reason.to_string(),
    };

    noodles::seek_normalized(reader, pos)?;
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(misaligned("position is at end of file"));
    }
    if line.starts_with('#') {
        return Err(misaligned("position is inside the header"));
    }
    let columns = line.trim_end().split('\t').collect::<Vec<_>>();
    if columns.len() < 8 {
        return Err(misaligned("line has fewer than 8 columns"));
    }
    if !columns[1].parse::<usize>().is_ok_and(|pos| pos > 0) {
        return Err(misaligned("line has no valid POS column"));
    }
    Ok(())
}

/// Choose up to `target - 1` split points from the sorted, distinct `candidates`.
///
/// `begin` is the compressed offset of the first record, `len` the file size.
fn split_points(
    candidates: &[VirtualPosition],
    begin: u64,
    len: u64,
    target: usize,
) -> Vec<VirtualPosition> {
    let mut result: Vec<VirtualPosition> = Vec::new();
    let n = candidates.len();
    if n == 0 {
        return result;
    }
    let span = len.saturating_sub(begin);
    for i in 1..target {
        let prev = result.last().copied();
        let is_after_prev = |pos: &VirtualPosition| prev.map_or(true, |prev| *pos > prev);

        let byte_target = begin + span * i as u64 / target as u64;
        let by_bytes = candidates
            .iter()
            .copied()
            .find(|pos| pos.compressed() >= byte_target && is_after_prev(pos));
        let by_rank = Some(candidates[(n * i / target).min(n - 1)]).filter(is_after_prev);

        if let Some(pos) = by_bytes.or(by_rank) {
            result.push(pos);
        }
    }
    result
}

/// Compute the chunks for the input at `path_in` using the tabix index at `path_index`.
///
/// `data_start` is the virtual position directly after the header.  At most
/// `target` chunks are returned and never more chunks than records.
#[tracing::instrument]
pub fn compute_chunks(
    path_in: &Path,
    path_index: &Path,
    data_start: VirtualPosition,
    target: usize,
) -> Result<Vec<Chunk>, IndexingError> {
    let starts = index_record_starts(path_index)?;
    let input_err = |source: std::io::Error| IndexingError::Input {
        path: path_in.display().to_string(),
        source,
    };
    let mut reader = noodles::open_bgzf(path_in).map_err(input_err)?;
    let file_len = std::fs::metadata(path_in).map_err(input_err)?.len();

    noodles::seek_normalized(&mut reader, data_start)?;
    let has_data = !noodles::at_eof(&mut reader)?;
    if starts.is_empty() && has_data {
        return Err(IndexingError::IndexOutOfDate);
    }

    let candidates = starts
        .into_iter()
        .filter(|pos| *pos > data_start)
        .collect::<Vec<_>>();
    let points = split_points(
        &candidates,
        data_start.compressed(),
        file_len,
        target.max(1),
    );
    for pos in &points {
        check_boundary(&mut reader, *pos)?;
    }

    let mut bounds = vec![data_start];
    bounds.extend(points);
    let chunks = bounds
        .iter()
        .enumerate()
        .map(|(id, start)| Chunk {
            id,
            start: *start,
            end: bounds.get(id + 1).copied(),
        })
        .collect::<Vec<_>>();

    tracing::debug!(
        "split input into {} chunks ({} requested, {} record starts in index)",
        chunks.len(),
        target,
        candidates.len() + 1
    );
    Ok(chunks)
}

/// Reads the record lines of one chunk.
pub struct ChunkReader {
    reader: bgzf::Reader<File>,
    end: Option<VirtualPosition>,
    /// Number of lines read so far.
    line_no: usize,
}

impl ChunkReader {
    /// Open a fresh reader on `path` positioned at the start of `chunk`.
    pub fn open(path: &Path, chunk: &Chunk) -> Result<Self, std::io::Error> {
        let mut reader = noodles::open_bgzf(path)?;
        noodles::seek_normalized(&mut reader, chunk.start)?;
        Ok(Self {
            reader,
            end: chunk.end,
            line_no: 0,
        })
    }

    /// Read the next non-empty line into `buf`, without line terminator.
    ///
    /// Returns `false` at the end of the chunk.
    pub fn read_line(&mut self, buf: &mut String) -> Result<bool, std::io::Error> {
        loop {
            if let Some(end) = self.end {
                if self.reader.virtual_position() >= end {
                    return Ok(false);
                }
            }
            buf.clear();
            if self.reader.read_line(buf)? == 0 {
                return Ok(false);
            }
            // Move to the next block so positions compare equal to chunk bounds.
            noodles::at_eof(&mut self.reader)?;
            self.line_no += 1;

            while buf.ends_with(['\n', '\r']) {
                buf.pop();
            }
            if !buf.is_empty() {
                return Ok(true);
            }
        }
    }

    /// 1-based number of the line last read, counted within the chunk.
    pub fn line_no(&self) -> usize {
        self.line_no
    }

    /// Skip the remaining lines and return the number of lines in the chunk.
    pub fn count_lines(&mut self) -> Result<usize, std::io::Error> {
        let mut buf = String::new();
        while self.read_line(&mut buf)? {}
        Ok(self.line_no)
    }
}

#[cfg(test)]
pub mod testing {
    //! Synthetic inputs for chunking and loading tests.

    /// VCF text with `n` records on chromosome 1 spaced 20 kbp apart.
    ///
    /// The spacing puts every record into its own tabix bin.  Records carry
    /// a snpEff `ANN` entry naming gene `GENE{i % 7}`.
    pub fn vcf_text(n: usize, samples: &[&str]) -> String {
        records_text(n, samples, "", |i| {
            format!(
                "ANN=G|missense_variant|MODERATE|GENE{}|G|transcript|T{}|protein_coding|1/1|c.1A>G|p.M1V",
                i % 7,
                i
            )
        })
    }

    /// Like `vcf_text` but annotated by VEP, with a declared `CSQ` layout.
    ///
    /// Every record lists a modifier entry before the moderate one for
    /// gene `GENE{i % 7}`.
    pub fn vcf_text_vep(n: usize, samples: &[&str]) -> String {
        records_text(
            n,
            samples,
            "##INFO=<ID=CSQ,Number=.,Type=String,Description=\"Consequence annotations from \
             Ensembl VEP. Format: Allele|Consequence|IMPACT|SYMBOL|Gene|Feature_type|Feature|\
             BIOTYPE|HGVSc|HGVSp\">\n",
            |i| {
                format!(
                    "CSQ=G|upstream_gene_variant|MODIFIER|OTHER{}|ENSG{}|Transcript|U{}|protein_coding||,\
                     G|missense_variant|MODERATE|GENE{}|ENSG{}|Transcript|T{}|protein_coding|c.1A>G|p.Met1Val",
                    i, i, i, i % 7, i % 7, i
                )
            },
        )
    }

    fn records_text<F>(n: usize, samples: &[&str], extra_header: &str, info: F) -> String
    where
        F: Fn(usize) -> String,
    {
        let mut text = String::from(
            "##fileformat=VCFv4.2\n\
             ##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
             ##FORMAT=<ID=DP,Number=1,Type=Integer,Description=\"Read depth\">\n",
        );
        text.push_str(extra_header);
        text.push_str(
            "##contig=<ID=1,length=249250621>\n\
             #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO",
        );
        if !samples.is_empty() {
            text.push_str("\tFORMAT");
            for sample in samples {
                text.push('\t');
                text.push_str(sample);
            }
        }
        text.push('\n');

        let gts = ["0/1", "1/1", "0/0", "./."];
        for i in 0..n {
            text.push_str(&format!(
                "1\t{}\t.\tA\tG\t50\tPASS\t{}",
                (i + 1) * 20_000,
                info(i)
            ));
            if !samples.is_empty() {
                text.push_str("\tGT:DP");
                for j in 0..samples.len() {
                    text.push_str(&format!("\t{}:{}", gts[(i + j) % gts.len()], 10 + j));
                }
            }
            text.push('\n');
        }
        text
    }
}
