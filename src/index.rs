//! Distributed sequence index
//!
//! The index file (`.fai`) holds one record per sequence of the source file:
//!
//! ```text
//! NAME    LENGTH  OFFSET  LINEWIDTH  <ignored...>
//! read_1  37      9       37         38
//! ```
//!
//! `LENGTH` is the number of symbols, `OFFSET` the byte position of the first symbol (just
//! after the header line), and `LINEWIDTH` the number of symbols per wrapped line. Every
//! wrapped line is followed by a single terminator byte.
//!
//! Only the coordinating worker reads the file. The record list is split with a linear block
//! partition over all workers: worker `k < P - 1` owns `floor(N / P)` consecutive records
//! starting at `k * floor(N / P)`, and the last worker absorbs the remainder.
//!
//! ## Limitations
//!
//! A final line without a terminator is not parsed and its record is dropped (a warning is
//! logged). Generated indices always end with a newline.

use std::ops::Range;
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::comm::{Collectives, Communicator};
use crate::error::{IndexError, Result};
use crate::grid::{ProcessGrid, COORDINATOR};
use crate::names::NameTable;

/// Minimum number of record slots allocated when parsing
const MIN_RECORD_SLOTS: usize = 256;

/// Outcome words broadcast by the coordinator before the records are scattered
const OUTCOME_OK: u64 = 0;
const OUTCOME_TOO_MANY_WORKERS: u64 = 1;
const OUTCOME_FAILED: u64 = 2;
const OUTCOME_EMPTY: u64 = 3;

/// Location and layout of one sequence within the source file
///
/// The struct is plain-old-data so that it can be scattered as a contiguous 24 byte block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct IndexRecord {
    /// Number of symbols in the sequence
    pub length: u64,
    /// Byte position of the first symbol in the source file
    pub byte_offset: u64,
    /// Number of symbols per wrapped line
    pub line_width: u64,
}
impl IndexRecord {
    #[must_use]
    pub fn new(length: u64, byte_offset: u64, line_width: u64) -> Self {
        Self {
            length,
            byte_offset,
            line_width,
        }
    }

    /// Exclusive end of the bytes that hold the sequence, when every wrapped line
    /// (including the last one) is followed by a terminator
    ///
    /// `None` if the end does not fit in a `u64`.
    #[must_use]
    pub fn end_offset(&self) -> Option<u64> {
        let terminators = self.length.checked_div(self.line_width).unwrap_or(0);
        self.byte_offset
            .checked_add(self.length)?
            .checked_add(terminators)
    }

    /// Exclusive end of the symbol bytes, not counting a terminator after the last line
    ///
    /// `None` if the end does not fit in a `u64`.
    #[must_use]
    pub fn last_symbol_end(&self) -> Option<u64> {
        if self.length == 0 {
            return Some(self.byte_offset);
        }
        let terminators = (self.length - 1).checked_div(self.line_width).unwrap_or(0);
        self.byte_offset
            .checked_add(self.length)?
            .checked_add(terminators)
    }

    /// Parses the numeric fields of one index line, returning the name and the record
    fn parse_line(line: &[u8]) -> Option<(&[u8], Self)> {
        let mut fields = line
            .split(u8::is_ascii_whitespace)
            .filter(|field| !field.is_empty());
        let name = fields.next()?;
        let mut number = || -> Option<u64> { std::str::from_utf8(fields.next()?).ok()?.parse().ok() };
        let record = Self::new(number()?, number()?, number()?);
        if record.length > 0 && record.line_width == 0 {
            return None;
        }
        record.end_offset()?;
        Some((name, record))
    }
}

/// Parses every terminated line of an index file
///
/// Names are appended to `names` when provided. Blank lines are skipped; a trailing fragment
/// without a terminator is ignored.
pub fn parse_index(
    buffer: &[u8],
    mut names: Option<&mut NameTable>,
) -> std::result::Result<Vec<IndexRecord>, IndexError> {
    let mut records: Vec<IndexRecord> = Vec::new();
    let mut lines = buffer.split_inclusive(|&b| b == b'\n').enumerate().peekable();

    while let Some((lineno, line)) = lines.next() {
        let Some(line) = line.strip_suffix(b"\n") else {
            log::warn!(
                "ignoring unterminated index line {}: {:?}",
                lineno + 1,
                String::from_utf8_lossy(line)
            );
            debug_assert!(lines.peek().is_none());
            break;
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let (name, record) =
            IndexRecord::parse_line(line).ok_or_else(|| IndexError::MalformedLine {
                line: lineno + 1,
                content: String::from_utf8_lossy(line).into_owned(),
            })?;

        if records.len() == records.capacity() {
            let target = (records.len() + 1).next_power_of_two().max(MIN_RECORD_SLOTS);
            records.reserve_exact(target - records.len());
        }
        records.push(record);

        if let Some(names) = names.as_deref_mut() {
            names.push(name);
        }
    }

    Ok(records)
}

/// Linear block partition of `n` items over `parts` workers
///
/// Every range but the last holds `n / parts` items; the last absorbs the remainder.
///
/// # Errors
///
/// Returns [`IndexError::EmptyIndex`] if there is no item, or
/// [`IndexError::TooManyWorkers`] if some worker would receive none.
pub fn partition(n: usize, parts: usize) -> std::result::Result<Vec<Range<usize>>, IndexError> {
    if n == 0 {
        return Err(IndexError::EmptyIndex);
    }
    let chunk = n.checked_div(parts).unwrap_or(0);
    if chunk == 0 {
        return Err(IndexError::TooManyWorkers {
            records: n as u64,
            workers: parts,
        });
    }
    Ok((0..parts)
        .map(|k| {
            let start = k * chunk;
            let end = if k + 1 == parts { n } else { start + chunk };
            start..end
        })
        .collect())
}

/// Which side of the index build a worker plays
///
/// Exactly one worker (the grid coordinator) reads the index file; every other worker only
/// participates in the collectives that distribute it.
#[derive(Debug)]
pub enum Role<'a> {
    Coordinator {
        path: &'a Path,
        names: Option<&'a mut NameTable>,
    },
    Participant,
}
impl<'a> Role<'a> {
    /// Chooses the role from the worker's grid rank
    pub fn for_grid<C: Communicator>(
        grid: &ProcessGrid<C>,
        path: &'a Path,
        names: Option<&'a mut NameTable>,
    ) -> Self {
        if grid.is_coordinator() {
            Self::Coordinator { path, names }
        } else {
            Self::Participant
        }
    }

    fn is_coordinator(&self) -> bool {
        matches!(self, Self::Coordinator { .. })
    }
}

/// One worker's slice of the global index
#[derive(Debug, Clone)]
pub struct DistributedIndex {
    records: Vec<IndexRecord>,
    first_gid: u64,
    global_len: u64,
    rank: usize,
    dims: usize,
}
impl DistributedIndex {
    /// Builds the index from an explicit role
    ///
    /// The coordinator parses and partitions the records, then every worker takes part in:
    /// 1. a broadcast of the outcome and the global record count,
    /// 2. a scatter of per-worker record counts,
    /// 3. a variable-length scatter of the records themselves.
    ///
    /// When the coordinator fails, every worker returns an error after step 1 so that no
    /// worker is left waiting on a collective.
    pub fn build<C: Communicator>(role: Role<'_>, grid: &ProcessGrid<C>) -> Result<Self> {
        if role.is_coordinator() != grid.is_coordinator() {
            return Err(IndexError::RoleMismatch {
                rank: grid.rank(),
                coordinator: role.is_coordinator(),
            }
            .into());
        }
        let world = grid.world();
        let nprocs = grid.nprocs();

        let prepared = match role {
            Role::Coordinator { path, names } => Some(Self::prepare(path, names, nprocs)),
            Role::Participant => None,
        };

        let header = match &prepared {
            Some(Ok((records, _))) => [OUTCOME_OK, records.len() as u64],
            Some(Err(IndexError::TooManyWorkers { records, .. })) => {
                [OUTCOME_TOO_MANY_WORKERS, *records]
            }
            Some(Err(IndexError::EmptyIndex)) => [OUTCOME_EMPTY, 0],
            Some(Err(_)) => [OUTCOME_FAILED, 0],
            None => [0, 0],
        };
        let header = world.broadcast_words(COORDINATOR, &header)?;

        let (records, counts) = match prepared {
            Some(Err(e)) => return Err(e.into()),
            Some(Ok((records, counts))) => (records, counts),
            None => (Vec::new(), Vec::new()),
        };
        let global_len = match header[..] {
            [OUTCOME_OK, n] => n,
            [OUTCOME_TOO_MANY_WORKERS, n] => {
                return Err(IndexError::TooManyWorkers {
                    records: n,
                    workers: nprocs,
                }
                .into())
            }
            [OUTCOME_EMPTY, _] => return Err(IndexError::EmptyIndex.into()),
            _ => return Err(IndexError::CoordinatorFailed.into()),
        };

        let words: Vec<u64> = counts.iter().map(|&c| c as u64).collect();
        let count = world.scatter_word(COORDINATOR, &words)? as usize;
        let first_gid = world.exclusive_scan_sum(count as u64)?;
        let records = world.scatterv(COORDINATOR, &records, &counts, count)?;

        log::debug!(
            "[{}] owns index records {}..{} of {}",
            grid.tag(),
            first_gid,
            first_gid + records.len() as u64,
            global_len
        );

        Ok(Self {
            records,
            first_gid,
            global_len,
            rank: grid.rank(),
            dims: grid.dims(),
        })
    }

    /// Builds the index, taking the coordinator role on rank 0
    pub fn read<C: Communicator, P: AsRef<Path>>(
        path: P,
        names: Option<&mut NameTable>,
        grid: &ProcessGrid<C>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let index = Self::build(Role::for_grid(grid, path, names), grid)?;
        log::info!(
            "[{}] read {} index records from {:?}",
            grid.tag(),
            index.len(),
            path
        );
        Ok(index)
    }

    /// Coordinator side: parse the file and compute the per-worker record counts
    fn prepare(
        path: &Path,
        names: Option<&mut NameTable>,
        nprocs: usize,
    ) -> std::result::Result<(Vec<IndexRecord>, Vec<usize>), IndexError> {
        let buffer = std::fs::read(path).map_err(|source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut records = parse_index(&buffer, names)?;
        drop(buffer);
        let counts = partition(records.len(), nprocs)?
            .into_iter()
            .map(|range| range.len())
            .collect();
        records.shrink_to_fit();
        Ok((records, counts))
    }

    /// Records owned by this worker, in global order
    #[must_use]
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// Number of records owned by this worker
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Global position of this worker's first record
    #[must_use]
    pub fn first_global_id(&self) -> u64 {
        self.first_gid
    }

    /// Number of records over the whole grid
    #[must_use]
    pub fn global_len(&self) -> u64 {
        self.global_len
    }

    /// Grid rank this partition was assigned to
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Side length of the grid this partition was computed for
    #[must_use]
    pub fn dims(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
mod testing {
    use std::io::Write;

    use super::*;
    use crate::comm::local::LocalCluster;
    use crate::Error;

    fn write_index(dir: &Path, content: &str) -> anyhow::Result<std::path::PathBuf> {
        let path = dir.join("seqs.fa.fai");
        let mut file = std::fs::File::create(&path)?;
        file.write_all(content.as_bytes())?;
        Ok(path)
    }

    fn synthetic_index(n: usize) -> (String, Vec<IndexRecord>) {
        let mut content = String::new();
        let mut records = Vec::new();
        let mut offset = 0;
        for i in 0..n {
            let length = 10 + (i as u64 * 7) % 23;
            offset += 9;
            let record = IndexRecord::new(length, offset, 10);
            content.push_str(&format!(
                "read_{i}\t{length}\t{offset}\t10\t11\n"
            ));
            offset = record.end_offset().unwrap() + u64::from(length % 10 != 0);
            records.push(record);
        }
        (content, records)
    }

    #[test]
    fn test_parse_index() -> anyhow::Result<()> {
        let content = b"chr1\t44\t6\t28\t29\nchr2 16 81 16 17\n\nchr3\t0\t100\t0\t1\n";
        let mut names = NameTable::new();
        let records = parse_index(content, Some(&mut names))?;
        assert_eq!(
            records,
            vec![
                IndexRecord::new(44, 6, 28),
                IndexRecord::new(16, 81, 16),
                IndexRecord::new(0, 100, 0),
            ]
        );
        assert_eq!(names.get(1), Some("chr2"));
        assert_eq!(names.len(), 3);
        Ok(())
    }

    #[test]
    fn test_parse_drops_unterminated_line() -> anyhow::Result<()> {
        let records = parse_index(b"a\t4\t3\t4\t5\nb\t4\t11\t4\t5", None)?;
        assert_eq!(records, vec![IndexRecord::new(4, 3, 4)]);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        let err = parse_index(b"a\t4\t3\t4\t5\nb\tfour\t11\t4\t5\n", None).unwrap_err();
        assert!(matches!(err, IndexError::MalformedLine { line: 2, .. }));

        let err = parse_index(b"a\t4\t3\n", None).unwrap_err();
        assert!(matches!(err, IndexError::MalformedLine { line: 1, .. }));

        // a non-empty sequence needs a positive line width
        let err = parse_index(b"a\t4\t3\t0\t1\n", None).unwrap_err();
        assert!(matches!(err, IndexError::MalformedLine { line: 1, .. }));

        // the span of every record must fit in a u64
        let line = format!("a\t4\t3\t4\t5\nhuge\t{}\t3\t5\t6\n", u64::MAX - 1);
        let err = parse_index(line.as_bytes(), None).unwrap_err();
        assert!(matches!(err, IndexError::MalformedLine { line: 2, .. }));
    }

    #[test]
    fn test_record_spans() {
        let record = IndexRecord::new(20, 100, 10);
        assert_eq!(record.end_offset(), Some(122));
        assert_eq!(record.last_symbol_end(), Some(121));

        let record = IndexRecord::new(7, 0, 10);
        assert_eq!(record.end_offset(), Some(7));
        assert_eq!(record.last_symbol_end(), Some(7));

        let record = IndexRecord::new(u64::MAX - 1, 3, 5);
        assert_eq!(record.end_offset(), None);
        assert_eq!(record.last_symbol_end(), None);
    }

    #[test]
    fn test_partition() -> anyhow::Result<()> {
        assert_eq!(partition(10, 4)?, vec![0..2, 2..4, 4..6, 6..10]);
        assert_eq!(partition(4, 4)?, vec![0..1, 1..2, 2..3, 3..4]);
        assert_eq!(partition(3, 1)?, vec![0..3]);
        assert!(matches!(
            partition(3, 4),
            Err(IndexError::TooManyWorkers { records: 3, workers: 4 })
        ));
        assert!(matches!(partition(0, 1), Err(IndexError::EmptyIndex)));
        assert!(matches!(partition(0, 4), Err(IndexError::EmptyIndex)));
        Ok(())
    }

    #[test]
    fn test_partition_completeness() -> anyhow::Result<()> {
        for n in 1..60 {
            for p in [1, 4, 9, 16] {
                let Ok(ranges) = partition(n, p) else {
                    assert!(n < p);
                    continue;
                };
                let flat: Vec<usize> = ranges.iter().cloned().flatten().collect();
                assert_eq!(flat, (0..n).collect::<Vec<_>>());
                assert!(ranges[..p - 1].iter().all(|r| r.len() == n / p));
            }
        }
        Ok(())
    }

    #[test]
    fn test_distributed_build() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (content, expected) = synthetic_index(23);
        let path = write_index(dir.path(), &content)?;

        let results = LocalCluster::new(4)?.run(|grid| {
            let mut names = NameTable::new();
            let names = grid.is_coordinator().then_some(&mut names);
            let index = DistributedIndex::read(&path, names, &grid)?;
            Ok(index)
        })?;

        let mut gathered = Vec::new();
        for (rank, index) in results.iter().enumerate() {
            assert_eq!(index.rank(), rank);
            assert_eq!(index.global_len(), 23);
            assert_eq!(index.first_global_id(), gathered.len() as u64);
            if rank < 3 {
                assert_eq!(index.len(), 5);
            }
            gathered.extend_from_slice(index.records());
        }
        assert_eq!(results[3].len(), 8);
        assert_eq!(gathered, expected);
        Ok(())
    }

    #[test]
    fn test_too_many_workers_fails_everywhere() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (content, _) = synthetic_index(3);
        let path = write_index(dir.path(), &content)?;

        let outcomes = LocalCluster::new(4)?.run_all(|grid| {
            DistributedIndex::read(&path, None, &grid)
        })?;
        for outcome in outcomes {
            let err = outcome.unwrap_err();
            assert!(err.is_graceful());
            assert!(matches!(
                err,
                Error::IndexError(IndexError::TooManyWorkers { records: 3, workers: 4 })
            ));
        }
        Ok(())
    }

    #[test]
    fn test_empty_index_is_fatal_everywhere() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_index(dir.path(), "\n  \n")?;

        for workers in [1, 4] {
            let outcomes = LocalCluster::new(workers)?.run_all(|grid| {
                DistributedIndex::read(&path, None, &grid)
            })?;
            assert_eq!(outcomes.len(), workers);
            for outcome in outcomes {
                let err = outcome.unwrap_err();
                assert!(matches!(err, Error::IndexError(IndexError::EmptyIndex)));
                assert_eq!(err.kind(), crate::ErrorKind::Consistency);
                assert!(!err.is_graceful());
            }
        }
        Ok(())
    }

    #[test]
    fn test_missing_index_fails_everywhere() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("missing.fai");

        let outcomes = LocalCluster::new(4)?.run_all(|grid| {
            DistributedIndex::read(&path, None, &grid)
        })?;
        assert!(matches!(
            outcomes[0],
            Err(Error::IndexError(IndexError::Io { .. }))
        ));
        for outcome in &outcomes[1..] {
            assert!(matches!(
                outcome,
                Err(Error::IndexError(IndexError::CoordinatorFailed))
                    | Err(Error::CommError(crate::CommError::Aborted))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_role_mismatch() -> anyhow::Result<()> {
        let outcomes = LocalCluster::new(1)?.run_all(|grid| {
            DistributedIndex::build(Role::Participant, &grid)
        })?;
        assert!(matches!(
            outcomes[0],
            Err(Error::IndexError(IndexError::RoleMismatch { rank: 0, coordinator: false }))
        ));
        Ok(())
    }
}
