use std::collections::TryReserveError;
use std::path::PathBuf;

/// Custom Result type for gridseq operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the gridseq library, encompassing all possible error cases
/// that can occur while indexing, loading, and sharing sequences over the process grid.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub enum Error {
    /// Errors related to the shape of the process grid
    GridError(#[from] GridError),
    /// Errors raised by the collective communication layer
    CommError(#[from] CommError),
    /// Errors that occur while parsing or distributing the sequence index
    IndexError(#[from] IndexError),
    /// Errors that occur while reading and encoding the local sequence store
    StoreError(#[from] StoreError),
    /// Errors that occur during the row/column share
    ShareError(#[from] ShareError),
    /// Standard I/O errors from the Rust standard library
    IoError(#[from] std::io::Error),
    /// Generic errors that can occur in any part of the system
    AnyhowError(#[from] anyhow::Error),
}

/// Coarse classification of an [`Error`], used by callers to choose between
/// a graceful shutdown and a group-wide abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Program use error (non-square grid, too many workers)
    Configuration,
    /// Missing, unreadable, or truncated input
    Io,
    /// A buffer could not be allocated
    Allocation,
    /// Input data contradicts itself (spans beyond the file, bad symbols)
    Consistency,
    /// A collective failed or was aborted by a peer
    Communication,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GridError(_) => ErrorKind::Configuration,
            Self::CommError(_) => ErrorKind::Communication,
            Self::IndexError(e) => match e {
                IndexError::TooManyWorkers { .. } | IndexError::RoleMismatch { .. } => {
                    ErrorKind::Configuration
                }
                IndexError::Io { .. } => ErrorKind::Io,
                IndexError::MalformedLine { .. } | IndexError::EmptyIndex => {
                    ErrorKind::Consistency
                }
                IndexError::CoordinatorFailed => ErrorKind::Communication,
            },
            Self::StoreError(e) => match e {
                StoreError::Io { .. } => ErrorKind::Io,
                StoreError::Allocation(_) => ErrorKind::Allocation,
                _ => ErrorKind::Consistency,
            },
            Self::ShareError(e) => match e {
                ShareError::Allocation(_) => ErrorKind::Allocation,
                ShareError::CapacityMismatch { .. } | ShareError::InvalidStore(_) => {
                    ErrorKind::Consistency
                }
            },
            Self::IoError(_) => ErrorKind::Io,
            Self::AnyhowError(_) => ErrorKind::Communication,
        }
    }

    /// Whether the whole process group should terminate gracefully rather than abort
    #[must_use]
    pub fn is_graceful(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

/// Errors related to bootstrapping the square process grid
#[derive(thiserror::Error, Debug)]
pub enum GridError {
    /// The number of workers is not a perfect square
    ///
    /// # Arguments
    /// * `usize` - The number of workers that was provided
    #[error("Process grid was given {0} workers, which is not a perfect square")]
    NotSquare(usize),

    /// A cluster must contain at least one worker
    #[error("Process grid requires at least one worker")]
    Empty,
}

/// Errors raised by collective operations
#[derive(thiserror::Error, Debug)]
pub enum CommError {
    /// A peer aborted the process group while this member was participating
    #[error("Collective aborted by a peer")]
    Aborted,

    /// The designated root of a collective is outside of the group
    ///
    /// # Fields
    /// * `root` - The requested root rank
    /// * `size` - The size of the group
    #[error("Root rank {root} is out of range for a group of {size}")]
    InvalidRoot { root: usize, size: usize },

    /// The root supplied the wrong number of parts to a scatter
    #[error("Scatter root supplied {got} parts for a group of {expected}")]
    ScatterParts { expected: usize, got: usize },

    /// A received message does not hold a whole number of elements
    #[error("Received {len} bytes, which is not a multiple of the element size {elem}")]
    Misaligned { len: usize, elem: usize },

    /// A member contributed a different element count than announced
    #[error("Rank {rank} contributed {got} elements but {expected} were announced")]
    CountMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },

    /// A worker thread panicked
    #[error("Worker {0} panicked")]
    WorkerPanicked(usize),
}

/// Errors that occur while building the distributed index
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// The index file could not be read
    #[error("Unable to read index file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A terminated line does not hold the expected numeric fields
    ///
    /// # Fields
    /// * `line` - The 1-based line number
    /// * `content` - The offending line
    #[error("Malformed index line {line}: {content:?}")]
    MalformedLine { line: usize, content: String },

    /// The index holds no records
    #[error("Index file holds no records")]
    EmptyIndex,

    /// There are not enough records to give every worker at least one
    #[error("Using too many workers ({workers}) for {records} index records")]
    TooManyWorkers { records: u64, workers: usize },

    /// The coordinator role was claimed by a non-root rank, or not claimed by the root
    #[error("Rank {rank} was given the wrong index role (coordinator: {coordinator})")]
    RoleMismatch { rank: usize, coordinator: bool },

    /// The coordinator failed to parse the index and notified its peers
    #[error("The coordinating worker failed to build the index")]
    CoordinatorFailed,
}

/// Errors that occur while reading and encoding sequences
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The sequence file could not be opened or mapped
    #[error("Unable to read sequence file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A worker was asked to build a store from an empty partition
    #[error("Index partition holds no records")]
    EmptyPartition,

    /// A record points outside of the bytes available to this worker
    ///
    /// # Fields
    /// * `record` - The local record index
    /// * `end` - The computed (exclusive) end of the record's span
    /// * `available` - The end of the readable region
    #[error("Record {record} spans to byte {end}, beyond the readable end {available}")]
    SpanOutOfBounds {
        record: usize,
        end: u64,
        available: u64,
    },

    /// A non-empty record declares a zero line width
    #[error("Record {0} has a zero line width")]
    ZeroLineWidth(usize),

    /// The sequence contains a symbol outside of ACGT and the policy rejects it
    #[error("Invalid nucleotide {symbol:?} at position {position} of sequence {gid}")]
    InvalidNucleotide {
        gid: u64,
        position: usize,
        symbol: char,
    },

    /// A local id is outside of the store
    #[error("Requested sequence index ({0}) is out of range ({1})")]
    OutOfRange(usize, usize),

    /// Packed offsets are not contiguous
    #[error("Sequence {index} starts at byte {offset}, expected {expected}")]
    NonContiguous {
        index: usize,
        offset: u64,
        expected: u64,
    },

    /// Growing one of the store's buffers failed
    #[error("Unable to allocate sequence storage: {0}")]
    Allocation(#[from] TryReserveError),
}

/// Errors that occur while sharing stores along the grid axes
#[derive(thiserror::Error, Debug)]
pub enum ShareError {
    /// A gather would write outside the destination sized by the reduction
    #[error("Gather of {count} elements at {displ} exceeds destination capacity {capacity}")]
    CapacityMismatch {
        displ: usize,
        count: usize,
        capacity: usize,
    },

    /// The assembled store does not satisfy the packing invariants
    #[error("Shared store is inconsistent: {0}")]
    InvalidStore(#[source] StoreError),

    /// A destination buffer could not be allocated
    #[error("Unable to allocate shared storage: {0}")]
    Allocation(#[from] TryReserveError),
}
