//! Parallel parsing and annotation of chunks.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use rayon::{
    iter::{IntoParallelIterator, ParallelIterator},
    ThreadPoolBuilder,
};

use crate::{
    annos::{AnnoValue, Annotator},
    err::WorkerError,
};

use super::{
    chunks::{Chunk, ChunkReader},
    conf::FailurePolicy,
    record::{GenotypeCall, RecordParser, Variant},
};

/// Number of lines between checks of the cancellation flag.
const CANCEL_CHECK_INTERVAL: usize = 1_000;

/// A parsed and annotated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedVariant {
    pub variant: Variant,
    /// One value per configured annotation source.
    pub annotations: Vec<Option<AnnoValue>>,
    /// One call per declared sample, empty in genotype-free mode.
    pub calls: Vec<GenotypeCall>,
    /// Line within the chunk.
    pub line: usize,
}

/// Outcome of processing one chunk.
#[derive(Debug)]
pub struct ChunkDone {
    pub chunk: Chunk,
    /// Number of lines in the chunk, `None` if reading stopped early.
    pub lines: Option<usize>,
    /// Number of records sent in batches, or the failure.
    pub result: Result<usize, WorkerError>,
}

/// Message from a worker to the coordinator.
///
/// The batches of a chunk arrive in input order, followed by its `Done`.
#[derive(Debug)]
pub enum WorkerMessage {
    Batch {
        chunk_id: usize,
        variants: Vec<AnnotatedVariant>,
    },
    Done(ChunkDone),
}

/// Processing of single chunks, shared by all workers.
#[derive(Debug)]
pub struct ChunkProcessor {
    path_in: PathBuf,
    parser: RecordParser,
    annotator: Arc<Annotator>,
    /// Maximal number of records per batch.
    batch_size: usize,
}

impl ChunkProcessor {
    pub fn new(
        path_in: PathBuf,
        parser: RecordParser,
        annotator: Arc<Annotator>,
        batch_size: usize,
    ) -> Self {
        Self {
            path_in,
            parser,
            annotator,
            batch_size: batch_size.max(1),
        }
    }

    /// Read, parse and annotate all records of `chunk`, passing them to `emit` in batches.
    ///
    /// Each call opens its own reader on the input file.  `emit` returns
    /// `false` if the batch cannot be delivered, which stops processing.
    pub fn process<F>(&self, chunk: &Chunk, cancel: &AtomicBool, mut emit: F) -> ChunkDone
    where
        F: FnMut(Vec<AnnotatedVariant>) -> bool,
    {
        let chunk_id = chunk.id;
        let mut done = ChunkDone {
            chunk: *chunk,
            lines: None,
            result: Err(WorkerError::Cancelled { chunk_id }),
        };
        if cancel.load(Ordering::Relaxed) {
            return done;
        }
        let mut reader = match ChunkReader::open(&self.path_in, chunk) {
            Ok(reader) => reader,
            Err(source) => {
                done.result = Err(WorkerError::Io { chunk_id, source });
                return done;
            }
        };

        done.result = self.read_records(&mut reader, chunk_id, cancel, &mut emit);
        done.lines = match &done.result {
            Ok(records) => {
                tracing::trace!("chunk {} yielded {} records", chunk_id, records);
                Some(reader.line_no())
            }
            // The line range of a skipped chunk is still reported.
            Err(WorkerError::Parse { .. }) => reader.count_lines().ok(),
            Err(_) => None,
        };
        done
    }

    fn read_records<F>(
        &self,
        reader: &mut ChunkReader,
        chunk_id: usize,
        cancel: &AtomicBool,
        emit: &mut F,
    ) -> Result<usize, WorkerError>
    where
        F: FnMut(Vec<AnnotatedVariant>) -> bool,
    {
        let io_err = |source| WorkerError::Io { chunk_id, source };
        let parse_err = |source| WorkerError::Parse { chunk_id, source };
        let cancelled = || WorkerError::Cancelled { chunk_id };

        let mut line = String::new();
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut records = 0;
        while reader.read_line(&mut line).map_err(io_err)? {
            let line_no = reader.line_no();
            if line_no % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return Err(cancelled());
            }

            let record = self.parser.parse(&line, line_no).map_err(parse_err)?;
            let calls = record.genotype_calls(line_no).map_err(parse_err)?;
            let annotations = self.annotator.annotate(&record.variant);
            batch.push(AnnotatedVariant {
                variant: record.variant,
                annotations,
                calls,
                line: line_no,
            });
            records += 1;

            if batch.len() >= self.batch_size && !emit(std::mem::take(&mut batch)) {
                return Err(cancelled());
            }
        }
        if !batch.is_empty() && !emit(batch) {
            return Err(cancelled());
        }
        Ok(records)
    }
}

/// Running workers and the channel their messages arrive on.
pub struct WorkerPool {
    receiver: Receiver<WorkerMessage>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Start processing `chunks` with `num_workers` threads.
    ///
    /// With `FailurePolicy::FailFast`, the first failing chunk cancels all
    /// chunks that have not completed yet.
    pub fn spawn(
        processor: Arc<ChunkProcessor>,
        chunks: Vec<Chunk>,
        num_workers: usize,
        policy: FailurePolicy,
    ) -> Result<Self, anyhow::Error> {
        tracing::debug!(
            "Initializing thread pool with {} threads for {} chunks",
            num_workers,
            chunks.len()
        );
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("varload-{}", i))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to initialize thread pool: {}", e))?;

        let (sender, receiver) = bounded(2 * num_workers);
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                pool.install(|| {
                    chunks.into_par_iter().for_each_with(sender, |s, chunk| {
                        process_chunk(&processor, chunk, &cancel, policy, s)
                    })
                })
            })
        };

        Ok(Self {
            receiver,
            cancel,
            handle,
        })
    }

    /// Messages in arrival order; iteration ends when all workers are done.
    pub fn messages(&self) -> &Receiver<WorkerMessage> {
        &self.receiver
    }

    /// Ask the workers to stop.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Wait for the workers to stop.
    pub fn join(self) -> Result<(), anyhow::Error> {
        // Unblock workers waiting on a full channel.
        drop(self.receiver);
        self.handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))
    }
}

fn process_chunk(
    processor: &ChunkProcessor,
    chunk: Chunk,
    cancel: &AtomicBool,
    policy: FailurePolicy,
    sender: &Sender<WorkerMessage>,
) {
    let done = processor.process(&chunk, cancel, |variants| {
        sender
            .send(WorkerMessage::Batch {
                chunk_id: chunk.id,
                variants,
            })
            .is_ok()
    });
    if let Err(e) = &done.result {
        if !matches!(e, WorkerError::Cancelled { .. }) {
            tracing::warn!("{}", e);
            if policy == FailurePolicy::FailFast {
                cancel.store(true, Ordering::Relaxed);
            }
        }
    }
    if sender.send(WorkerMessage::Done(done)).is_err() {
        tracing::trace!("coordinator is gone, dropping result of chunk {}", chunk.id);
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        annos::{IntervalSource, Mode, SourceRecord},
        common::noodles::testing::{write_bgzf, write_indexed_vcf},
        load::{
            chunks::{compute_chunks, testing::vcf_text},
            csq::{AnnotationStyle, ConsequenceParser},
            header::read_input_header,
        },
    };

    fn annotator() -> Arc<Annotator> {
        let source = IntervalSource::from_records(
            "every_other",
            Mode::Flag,
            (0..50).map(|i| {
                let begin = (2 * i + 1) * 20_000 - 1;
                (
                    String::from("chr1"),
                    SourceRecord {
                        begin,
                        end: begin + 1,
                        value: None,
                        score: None,
                    },
                )
            }),
        );
        Arc::new(Annotator::new(vec![source]))
    }

    fn processor(
        path: PathBuf,
        genotypes: bool,
        batch_size: usize,
    ) -> Result<Arc<ChunkProcessor>, anyhow::Error> {
        let header = read_input_header(&path)?;
        Ok(Arc::new(ChunkProcessor::new(
            path,
            RecordParser::new(
                &header.header,
                genotypes,
                ConsequenceParser::new(AnnotationStyle::SnpEff, None),
            ),
            annotator(),
            batch_size,
        )))
    }

    /// Process the whole file as one chunk, collecting the batches.
    fn process_single(
        processor: &ChunkProcessor,
        path: &std::path::Path,
        id: usize,
        cancel: bool,
    ) -> Result<(Vec<Vec<AnnotatedVariant>>, ChunkDone), anyhow::Error> {
        let chunk = Chunk {
            id,
            start: read_input_header(path)?.data_start,
            end: None,
        };
        let mut batches = Vec::new();
        let done = processor.process(&chunk, &AtomicBool::new(cancel), |batch| {
            batches.push(batch);
            true
        });
        Ok((batches, done))
    }

    /// Batches per chunk in arrival order and the `Done` messages.
    type Collected = (BTreeMap<usize, Vec<AnnotatedVariant>>, BTreeMap<usize, ChunkDone>);

    fn run(pool: WorkerPool) -> Result<Collected, anyhow::Error> {
        let mut variants: BTreeMap<usize, Vec<AnnotatedVariant>> = BTreeMap::new();
        let mut done = BTreeMap::new();
        for message in pool.messages() {
            match message {
                WorkerMessage::Batch { chunk_id, variants: batch } => {
                    assert!(!done.contains_key(&chunk_id), "batch after done");
                    variants.entry(chunk_id).or_default().extend(batch);
                }
                WorkerMessage::Done(chunk_done) => {
                    done.insert(chunk_done.chunk.id, chunk_done);
                }
            }
        }
        pool.join()?;
        Ok((variants, done))
    }

    #[rstest::rstest]
    #[case(1)]
    #[case(3)]
    fn process_all_chunks(#[case] num_workers: usize) -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        write_indexed_vcf(&path, &vcf_text(20, &["a", "b"]), 3)?;
        let header = read_input_header(&path)?;
        let chunks = compute_chunks(
            &path,
            &tmpdir.join("in.vcf.gz.tbi"),
            header.data_start,
            4,
        )?;

        let pool = WorkerPool::spawn(
            processor(path, true, 2)?,
            chunks.clone(),
            num_workers,
            FailurePolicy::FailFast,
        )?;
        let (variants, done) = run(pool)?;

        assert_eq!(done.len(), chunks.len());
        let mut lines = 0;
        for (id, chunk_done) in &done {
            let records = chunk_done.result.as_ref().map_err(|e| anyhow::anyhow!("{}", e))?;
            assert_eq!(variants.get(id).map_or(0, Vec::len), *records);
            lines += chunk_done.lines.unwrap_or_default();
        }
        assert_eq!(lines, 20);
        let variants = variants.into_values().flatten().collect::<Vec<_>>();
        assert_eq!(variants.len(), 20);
        for (i, variant) in variants.iter().enumerate() {
            assert_eq!(variant.variant.pos, (i + 1) * 20_000);
            assert_eq!(variant.calls.len(), 2);
            assert_eq!(
                variant.annotations,
                vec![Some(AnnoValue::Int(if i % 2 == 0 { 1 } else { 0 }))]
            );
        }

        Ok(())
    }

    #[rstest::rstest]
    #[case(1, 7)]
    #[case(3, 3)]
    #[case(7, 1)]
    #[case(100, 1)]
    fn batches_are_bounded(
        #[case] batch_size: usize,
        #[case] num_batches: usize,
    ) -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        write_bgzf(&path, &vcf_text(7, &["a"]), 0)?;

        let (batches, done) =
            process_single(&*processor(path.clone(), true, batch_size)?, &path, 0, false)?;

        assert_eq!(batches.len(), num_batches);
        assert!(batches.iter().all(|batch| batch.len() <= batch_size));
        assert_eq!(done.result.ok(), Some(7));
        assert_eq!(done.lines, Some(7));

        Ok(())
    }

    #[test]
    fn genotype_free_mode() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        write_indexed_vcf(&path, &vcf_text(5, &["a", "b"]), 0)?;

        let (batches, done) = process_single(&*processor(path.clone(), false, 10)?, &path, 0, false)?;

        assert_eq!(done.result.ok(), Some(5));
        let variants = batches.concat();
        assert_eq!(variants.len(), 5);
        assert!(variants.iter().all(|v| v.calls.is_empty()));

        Ok(())
    }

    #[test]
    fn parse_failure_is_attributed() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        let text = vcf_text(5, &[]).replace("1\t60000\t", "1\tsixty\t");
        write_bgzf(&path, &text, 0)?;

        let (batches, done) = process_single(&*processor(path.clone(), true, 1)?, &path, 7, false)?;

        let err = done.result.expect_err("must fail");
        assert_eq!(err.chunk_id(), 7);
        assert_eq!(err.line(), Some(3));
        // the records before the failing line were already sent
        assert_eq!(batches.len(), 2);
        // lines after the failing one are still counted
        assert_eq!(done.lines, Some(5));

        Ok(())
    }

    #[test]
    fn cancelled_before_start() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        write_indexed_vcf(&path, &vcf_text(5, &[]), 0)?;

        let (batches, done) = process_single(&*processor(path.clone(), true, 10)?, &path, 2, true)?;

        assert!(batches.is_empty());
        assert_eq!(done.lines, None);
        assert!(matches!(
            done.result,
            Err(WorkerError::Cancelled { chunk_id: 2 })
        ));

        Ok(())
    }

    #[test]
    fn undeliverable_batch_stops_processing() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        write_bgzf(&path, &vcf_text(5, &[]), 0)?;
        let chunk = Chunk {
            id: 0,
            start: read_input_header(&path)?.data_start,
            end: None,
        };

        let mut calls = 0;
        let done = processor(path, true, 2)?.process(&chunk, &AtomicBool::new(false), |_| {
            calls += 1;
            false
        });

        assert_eq!(calls, 1);
        assert!(matches!(
            done.result,
            Err(WorkerError::Cancelled { chunk_id: 0 })
        ));

        Ok(())
    }
}
