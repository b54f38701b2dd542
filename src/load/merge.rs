//! Ordered merge of the chunk results into the store.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom, Write},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use thousands::Separable;

use crate::{
    common::{ChromOrder, Genotype},
    err::{LoadError, MergeError, WorkerError},
    store::Store,
};

use super::{
    chunks::Chunk,
    conf::FailurePolicy,
    record::GenotypeCall,
    worker::{AnnotatedVariant, ChunkDone, WorkerMessage},
};

/// Per-variant summary of the genotype calls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenotypeSummary {
    pub num_hom_ref: usize,
    pub num_het: usize,
    pub num_hom_alt: usize,
    pub num_unknown: usize,
    /// Fraction of samples with a known genotype, `None` without samples.
    pub call_rate: Option<f64>,
    /// Alternate allele frequency among the called alleles.
    pub aaf: Option<f64>,
}

impl GenotypeSummary {
    pub fn from_calls(calls: &[GenotypeCall]) -> Self {
        let mut result = Self::default();
        let mut called_alleles = 0usize;
        let mut alt_alleles = 0usize;
        for call in calls {
            match call.genotype {
                Genotype::HomRef => result.num_hom_ref += 1,
                Genotype::Het => result.num_het += 1,
                Genotype::HomAlt => result.num_hom_alt += 1,
                Genotype::Unknown => result.num_unknown += 1,
            }
            for allele in call.alleles.iter().flatten() {
                called_alleles += 1;
                if *allele > 0 {
                    alt_alleles += 1;
                }
            }
        }
        if !calls.is_empty() {
            result.call_rate = Some((calls.len() - result.num_unknown) as f64 / calls.len() as f64);
        }
        if called_alleles > 0 {
            result.aaf = Some(alt_alleles as f64 / called_alleles as f64);
        }
        result
    }
}

/// A chunk skipped in best-effort mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChunk {
    pub chunk_id: usize,
    /// Virtual offset of the chunk start.
    pub start_offset: u64,
    /// Virtual offset of the chunk end, `None` for the last chunk.
    pub end_offset: Option<u64>,
    /// First line of the chunk in the input file, if known.
    pub first_line: Option<usize>,
    /// Last line of the chunk in the input file, if known.
    pub last_line: Option<usize>,
    /// Offending line in the input file, if known.
    pub line: Option<usize>,
    pub message: String,
}

impl FailedChunk {
    /// `offset` is the number of input lines before the chunk, `lines` the
    /// number of lines in the chunk.
    fn new(chunk: &Chunk, err: WorkerError, offset: Option<usize>, lines: Option<usize>) -> Self {
        let line = offset.zip(err.line()).map(|(offset, line)| offset + line);
        let message = match line {
            Some(line) => LoadError::InputLine { line, source: err }.to_string(),
            None => err.to_string(),
        };
        Self {
            chunk_id: chunk.id,
            start_offset: u64::from(chunk.start),
            end_offset: chunk.end.map(u64::from),
            first_line: offset.map(|offset| offset + 1),
            last_line: offset
                .zip(lines.filter(|lines| *lines > 0))
                .map(|(offset, lines)| offset + lines),
            line,
            message,
        }
    }

    /// Input lines of the chunk for display, `?` where unknown.
    pub fn line_range(&self) -> String {
        let show = |line: Option<usize>| line.map_or_else(|| String::from("?"), |l| l.to_string());
        format!("{}-{}", show(self.first_line), show(self.last_line))
    }
}

/// Summary of a finished load.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub chunks: usize,
    pub variants: usize,
    pub samples: usize,
    pub genotypes: usize,
    pub failed: Vec<FailedChunk>,
}

/// Batches of a chunk that arrived before the chunk could be committed.
///
/// They are kept as JSON lines in an anonymous file next to the store.
struct Spill {
    writer: BufWriter<File>,
    records: usize,
}

/// State at the start of the chunk being committed, restored if it fails.
#[derive(Clone, Copy, Debug)]
struct HeadStart {
    next_variant_id: i64,
    variants: usize,
    genotypes: usize,
}

/// Commits chunk results to the store strictly in chunk order.
///
/// Batches of the next chunk in order are written as they arrive, inside a
/// savepoint so that a failing chunk leaves no rows behind.  Batches of
/// later chunks go to spill files and are replayed once their turn comes.
pub struct Coordinator<'a> {
    store: &'a Store,
    chrom_order: ChromOrder,
    /// Number of calls expected per variant.
    sample_count: usize,
    policy: FailurePolicy,
    /// Identifier of the next chunk to commit.
    next_chunk: usize,
    /// Set while a savepoint for `next_chunk` is open.
    head: Option<HeadStart>,
    /// Input lines before `next_chunk`, `None` once a chunk's size is unknown.
    line_offset: Option<usize>,
    /// Spilled batches by chunk.
    spills: BTreeMap<usize, Spill>,
    /// Chunks that are done but wait for their predecessors.
    done: BTreeMap<usize, ChunkDone>,
    /// First cancellation seen, reported if no other failure explains it.
    cancelled: Option<WorkerError>,
    next_variant_id: i64,
    report: LoadReport,
    last_progress: Instant,
}

impl<'a> Coordinator<'a> {
    /// `header_lines` is the number of header lines before the first chunk.
    pub fn new(
        store: &'a Store,
        chrom_order: ChromOrder,
        sample_count: usize,
        policy: FailurePolicy,
        header_lines: usize,
    ) -> Self {
        Self {
            store,
            chrom_order,
            sample_count,
            policy,
            next_chunk: 0,
            head: None,
            line_offset: Some(header_lines),
            spills: BTreeMap::new(),
            done: BTreeMap::new(),
            cancelled: None,
            next_variant_id: 1,
            report: LoadReport {
                samples: sample_count,
                ..Default::default()
            },
            last_progress: Instant::now(),
        }
    }

    /// Accept one worker message, committing everything that is now in order.
    pub fn accept(&mut self, message: WorkerMessage) -> Result<(), LoadError> {
        match message {
            WorkerMessage::Batch { chunk_id, variants } => self.accept_batch(chunk_id, variants),
            WorkerMessage::Done(done) => self.accept_done(done),
        }
    }

    fn accept_batch(
        &mut self,
        chunk_id: usize,
        variants: Vec<AnnotatedVariant>,
    ) -> Result<(), LoadError> {
        if chunk_id < self.next_chunk || self.done.contains_key(&chunk_id) {
            return Err(MergeError::DuplicateChunk(chunk_id).into());
        }
        if chunk_id == self.next_chunk {
            self.open_head()?;
            for record in &variants {
                self.commit(chunk_id, record)?;
            }
            self.log_progress(chunk_id);
            return Ok(());
        }

        let spill_err = |e: std::io::Error| MergeError::Spill {
            chunk_id,
            reason: e.to_string(),
        };
        let spill = match self.spills.entry(chunk_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let file = tempfile::tempfile_in(self.store.spill_dir()).map_err(spill_err)?;
                tracing::trace!("spilling chunk {}", chunk_id);
                entry.insert(Spill {
                    writer: BufWriter::new(file),
                    records: 0,
                })
            }
        };
        for record in &variants {
            serde_json::to_writer(&mut spill.writer, record).map_err(|e| MergeError::Spill {
                chunk_id,
                reason: e.to_string(),
            })?;
            spill.writer.write_all(b"\n").map_err(spill_err)?;
        }
        spill.records += variants.len();
        Ok(())
    }

    fn accept_done(&mut self, done: ChunkDone) -> Result<(), LoadError> {
        let chunk_id = done.chunk.id;
        if chunk_id < self.next_chunk || self.done.contains_key(&chunk_id) {
            return Err(MergeError::DuplicateChunk(chunk_id).into());
        }
        if self.policy == FailurePolicy::FailFast {
            match done.result {
                Err(e @ WorkerError::Cancelled { .. }) => {
                    // The failure that caused the cancellation arrives separately.
                    self.cancelled.get_or_insert(e);
                    return Ok(());
                }
                Err(e) => {
                    let line = self
                        .line_offset
                        .filter(|_| chunk_id == self.next_chunk)
                        .zip(e.line())
                        .map(|(offset, line)| offset + line);
                    return Err(match line {
                        Some(line) => LoadError::InputLine { line, source: e },
                        None => e.into(),
                    });
                }
                Ok(_) => (),
            }
        }
        self.done.insert(chunk_id, done);
        self.advance()
    }

    /// Commit the done chunks at the head of the order.
    fn advance(&mut self) -> Result<(), LoadError> {
        while let Some(done) = self.done.remove(&self.next_chunk) {
            let chunk_id = self.next_chunk;
            match done.result {
                Ok(records) => {
                    if self.head.take().is_some() {
                        self.store.release_chunk()?;
                    }
                    tracing::trace!("committed chunk {} with {} records", chunk_id, records);
                }
                Err(e) => {
                    tracing::warn!("skipping chunk: {}", &e);
                    if let Some(start) = self.head.take() {
                        self.store.rollback_chunk()?;
                        self.next_variant_id = start.next_variant_id;
                        self.report.variants = start.variants;
                        self.report.genotypes = start.genotypes;
                    }
                    self.spills.remove(&chunk_id);
                    let failed = FailedChunk::new(&done.chunk, e, self.line_offset, done.lines);
                    self.store.insert_failed_chunk(&failed)?;
                    self.report.failed.push(failed);
                }
            }
            self.line_offset = self.line_offset.zip(done.lines).map(|(offset, lines)| offset + lines);
            self.next_chunk += 1;
            self.report.chunks += 1;

            let next_failed = self
                .done
                .get(&self.next_chunk)
                .map_or(false, |done| done.result.is_err());
            if let Some(spill) = self.spills.remove(&self.next_chunk) {
                if !next_failed {
                    self.replay(self.next_chunk, spill)?;
                }
            }
        }
        Ok(())
    }

    fn open_head(&mut self) -> Result<(), LoadError> {
        if self.head.is_none() {
            self.store.begin_chunk()?;
            self.head = Some(HeadStart {
                next_variant_id: self.next_variant_id,
                variants: self.report.variants,
                genotypes: self.report.genotypes,
            });
        }
        Ok(())
    }

    /// Commit the spilled batches of the chunk that just became the head.
    fn replay(&mut self, chunk_id: usize, spill: Spill) -> Result<(), LoadError> {
        let spill_err = |reason: String| MergeError::Spill { chunk_id, reason };
        let mut file = spill
            .writer
            .into_inner()
            .map_err(|e| spill_err(e.error().to_string()))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| spill_err(e.to_string()))?;
        tracing::trace!("replaying {} spilled records of chunk {}", spill.records, chunk_id);

        self.open_head()?;
        let records = serde_json::Deserializer::from_reader(BufReader::new(file))
            .into_iter::<AnnotatedVariant>();
        for record in records {
            let record = record.map_err(|e| spill_err(e.to_string()))?;
            self.commit(chunk_id, &record)?;
        }
        self.log_progress(chunk_id);
        Ok(())
    }

    fn commit(&mut self, chunk_id: usize, record: &AnnotatedVariant) -> Result<(), LoadError> {
        if record.calls.len() != self.sample_count {
            return Err(MergeError::SampleCountMismatch {
                chunk_id,
                chrom: record.variant.chrom.clone(),
                pos: record.variant.pos,
                expected: self.sample_count,
                actual: record.calls.len(),
            }
            .into());
        }

        let variant_id = self.next_variant_id;
        let summary = GenotypeSummary::from_calls(&record.calls);
        let chrom_key = self.chrom_order.key(&record.variant.chrom);
        self.store
            .insert_variant(variant_id, chrom_key, record, &summary)?;
        self.store.insert_genotypes(variant_id, &record.calls)?;

        self.next_variant_id += 1;
        self.report.variants += 1;
        self.report.genotypes += record.calls.len();
        Ok(())
    }

    fn log_progress(&mut self, chunk_id: usize) {
        if self.last_progress.elapsed().as_secs() >= 60 {
            tracing::info!(
                "at chunk {}, {} variants loaded",
                chunk_id,
                self.report.variants.separate_with_commas()
            );
            self.last_progress = Instant::now();
        }
    }

    /// Check that all `num_chunks` chunks were seen and return the report.
    pub fn finish(self, num_chunks: usize) -> Result<LoadReport, LoadError> {
        if self.next_chunk < num_chunks {
            return Err(match self.cancelled {
                Some(e) => e.into(),
                None => MergeError::MissingChunk(self.next_chunk).into(),
            });
        }
        Ok(self.report)
    }
}
