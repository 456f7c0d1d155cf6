use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::{encode, ReadOptions, SequenceStore};
use crate::comm::{Collectives, Communicator};
use crate::error::{Result, StoreError};
use crate::grid::ProcessGrid;
use crate::index::{DistributedIndex, IndexRecord};

impl SequenceStore {
    /// Builds this worker's store from the sequences its index partition points to
    ///
    /// Every worker first enters an exclusive prefix sum over its record count to learn the
    /// global id of its first sequence, so a local failure afterwards never leaves a peer
    /// blocked in that collective. Each worker then maps the source file and reads only the
    /// bytes spanned by its own records.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The partition is empty
    /// * The source file cannot be opened or mapped
    /// * A record lies outside of the file or declares a zero line width
    /// * A sequence holds an invalid symbol rejected by the configured [`Policy`](crate::Policy)
    /// * The packed buffer cannot be allocated
    pub fn read<C: Communicator, P: AsRef<Path>>(
        path: P,
        index: &DistributedIndex,
        grid: &ProcessGrid<C>,
        options: &ReadOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let first_gid = grid.world().exclusive_scan_sum(index.len() as u64)?;
        debug_assert_eq!(first_gid, index.first_global_id());

        let store = Self::read_records(path, index.records(), first_gid, options)?;
        log::info!(
            "[{}] encoded {} sequences ({} bases) into {} bytes",
            grid.tag(),
            store.num_seqs(),
            store.total_bases(),
            store.total_bytes()
        );
        Ok(store)
    }

    /// Reads and encodes `records` from the file at `path`, numbering them from `first_gid`
    pub fn read_records(
        path: &Path,
        records: &[IndexRecord],
        first_gid: u64,
        options: &ReadOptions,
    ) -> std::result::Result<Self, StoreError> {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Err(StoreError::EmptyPartition);
        };
        let io_error = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_error)?;

        // Safety: the file is open and won't be modified while mapped
        let mmap = unsafe { Mmap::map(&file) }.map_err(io_error)?;

        let start = first.byte_offset;
        let available = mmap.len() as u64;
        let end = last.end_offset().map_or(available, |end| end.min(available));
        if start > end {
            return Err(StoreError::SpanOutOfBounds {
                record: 0,
                end: start,
                available: end,
            });
        }
        let chunk = &mmap[start as usize..end as usize];
        log::debug!(
            "mapped bytes {start}..{end} of {path:?} for {} records",
            records.len()
        );

        // every record is checked before any storage is sized from the index lengths
        let mut relatives = Vec::new();
        relatives.try_reserve_exact(records.len())?;
        for (lid, record) in records.iter().enumerate() {
            relatives.push(locate(lid, record, start, end)?);
        }

        let packed_total: u64 = records
            .iter()
            .map(|record| encode::packed_len(record.length))
            .sum();
        let mut store = Self::try_with_capacity(records.len(), packed_total as usize)?;
        let mut rng = SmallRng::seed_from_u64(options.seed().wrapping_add(first_gid));
        let mut sbuf = Vec::new();

        for (lid, (record, relative)) in records.iter().zip(relatives).enumerate() {
            unwrap_lines(chunk, relative, record, &mut sbuf)?;
            store.push(&sbuf, first_gid + lid as u64, options.policy(), &mut rng)?;
        }
        Ok(store)
    }
}

/// Checks that the symbols of `record` lie within `start..end` and returns the record's
/// offset relative to `start`
fn locate(
    lid: usize,
    record: &IndexRecord,
    start: u64,
    end: u64,
) -> std::result::Result<u64, StoreError> {
    if record.length > 0 && record.line_width == 0 {
        return Err(StoreError::ZeroLineWidth(lid));
    }
    let last = record.last_symbol_end();
    if record.byte_offset < start || last.is_none_or(|last| last > end) {
        return Err(StoreError::SpanOutOfBounds {
            record: lid,
            end: last.unwrap_or(u64::MAX),
            available: end,
        });
    }
    Ok(record.byte_offset - start)
}

/// Copies the symbols of `record` out of `chunk` into `sbuf`, skipping one terminator byte
/// after every wrapped line
fn unwrap_lines(
    chunk: &[u8],
    relative: u64,
    record: &IndexRecord,
    sbuf: &mut Vec<u8>,
) -> std::result::Result<(), StoreError> {
    sbuf.clear();
    sbuf.try_reserve(record.length as usize)?;

    let mut pos = relative as usize;
    let mut remaining = record.length as usize;
    let width = record.line_width as usize;
    while remaining > 0 {
        let take = width.min(remaining);
        sbuf.extend_from_slice(&chunk[pos..pos + take]);
        pos += take + 1;
        remaining -= take;
    }
    Ok(())
}
