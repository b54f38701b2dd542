//! Error types of the annotate-and-load pipeline.

use noodles_bgzf::VirtualPosition;

/// Cannot derive valid record-aligned chunk boundaries.
#[derive(thiserror::Error, Debug)]
pub enum IndexingError {
    #[error("cannot open input file {path}: {source}")]
    Input {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot read index {path}: {source}")]
    Index {
        path: String,
        source: std::io::Error,
    },
    #[error("problem reading VCF header: {0}")]
    Header(String),
    #[error("index lists no records but input has data after the header")]
    IndexOutOfDate,
    #[error("boundary at {offset:?} is not the start of a record: {reason}")]
    Misaligned {
        offset: VirtualPosition,
        reason: String,
    },
    #[error("I/O error while checking record boundaries: {0}")]
    Io(#[from] std::io::Error),
}

/// A record violates the expected structure.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("line {line}: {reason} ({text:?})")]
pub struct ParseError {
    /// 1-based line number, within the chunk while it is processed and
    /// within the file once the chunk's position is known.
    pub line: usize,
    /// Human readable reason.
    pub reason: String,
    /// Offending text, truncated.
    pub text: String,
}

impl ParseError {
    /// Maximal number of characters of the offending text to keep.
    const MAX_TEXT: usize = 80;

    pub fn new(line: usize, reason: impl Into<String>, text: &str) -> Self {
        Self {
            line,
            reason: reason.into(),
            text: text.chars().take(Self::MAX_TEXT).collect(),
        }
    }
}

/// An annotation dataset cannot be loaded.
#[derive(thiserror::Error, Debug)]
pub enum AnnotationSourceError {
    #[error("cannot read annotation source {name} from {path}: {reason}")]
    Load {
        name: String,
        path: String,
        reason: String,
    },
    #[error("annotation source {name}, line {line}: {reason}")]
    Record {
        name: String,
        line: usize,
        reason: String,
    },
}

/// Chunk level failure.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("chunk {chunk_id}: {source}")]
    Parse {
        chunk_id: usize,
        #[source]
        source: ParseError,
    },
    #[error("chunk {chunk_id}: cannot read input: {source}")]
    Io {
        chunk_id: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("chunk {chunk_id}: cancelled after failure of another chunk")]
    Cancelled { chunk_id: usize },
}

impl WorkerError {
    /// Identifier of the failed chunk.
    pub fn chunk_id(&self) -> usize {
        match self {
            WorkerError::Parse { chunk_id, .. }
            | WorkerError::Io { chunk_id, .. }
            | WorkerError::Cancelled { chunk_id } => *chunk_id,
        }
    }

    /// Line within the chunk that failed, if known.
    pub fn line(&self) -> Option<usize> {
        match self {
            WorkerError::Parse { source, .. } => Some(source.line),
            _ => None,
        }
    }
}

/// Commit-time inconsistency.
#[derive(thiserror::Error, Debug)]
pub enum MergeError {
    #[error("variant {chrom}:{pos} in chunk {chunk_id} has {actual} genotype calls but {expected} samples are declared")]
    SampleCountMismatch {
        chunk_id: usize,
        chrom: String,
        pos: usize,
        expected: usize,
        actual: usize,
    },
    #[error("result for chunk {0} was delivered twice")]
    DuplicateChunk(usize),
    #[error("workers terminated before delivering chunk {0}")]
    MissingChunk(usize),
    #[error("cannot spill results of chunk {chunk_id}: {reason}")]
    Spill { chunk_id: usize, reason: String },
}

/// Schema creation or write failure.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error on store: {0}")]
    Io(#[from] std::io::Error),
    #[error("output {0} exists, use --force to overwrite")]
    Exists(String),
    #[error("output {path} is locked by process {owner} through {lock}, remove the lock file if that process is gone")]
    Locked {
        path: String,
        lock: String,
        owner: String,
    },
    #[error("cannot persist store to {path}: {reason}")]
    Persist { path: String, reason: String },
}

/// Invalid configuration, including the pedigree file.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("pedigree file {path}, line {line}: {reason}")]
    Pedigree {
        path: String,
        line: usize,
        reason: String,
    },
    #[error("pedigree file names sample {0} that is not in the VCF header")]
    UnknownSample(String),
    #[error("invalid annotation source name {0:?}")]
    SourceName(String),
    #[error("duplicate annotation source name {0:?}")]
    DuplicateSource(String),
    #[error("{0} must be a positive integer")]
    NotPositive(&'static str),
}

/// Umbrella error of one load, fatal to the whole run.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Indexing(#[from] IndexingError),
    #[error(transparent)]
    AnnotationSource(#[from] AnnotationSourceError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("input line {line}: {source}")]
    InputLine {
        line: usize,
        #[source]
        source: WorkerError,
    },
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Process exit code when a best-effort load completed with failed chunks.
pub const EXIT_PARTIAL: u8 = 2;

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_error_truncates_text() {
        let text = "x".repeat(200);
        let err = ParseError::new(3, "too few columns", &text);

        assert_eq!(err.text.len(), 80);
        assert_eq!(err.line, 3);
    }

    #[test]
    fn worker_error_attribution() {
        let err = WorkerError::Parse {
            chunk_id: 4,
            source: ParseError::new(17, "invalid POS", "1\tx"),
        };

        assert_eq!(err.chunk_id(), 4);
        assert_eq!(err.line(), Some(17));
        assert_eq!(
            err.to_string(),
            "chunk 4: line 17: invalid POS (\"1\\tx\")"
        );
    }

    #[test]
    fn input_line_wraps_worker_error() {
        let err = LoadError::InputLine {
            line: 105,
            source: WorkerError::Parse {
                chunk_id: 4,
                source: ParseError::new(17, "invalid POS", "1\tx"),
            },
        };

        assert_eq!(
            err.to_string(),
            "input line 105: chunk 4: line 17: invalid POS (\"1\\tx\")"
        );
    }
}
