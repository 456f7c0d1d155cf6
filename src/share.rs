//! Row and column share
//!
//! After the file build every worker holds the sequences of its own index partition. The
//! share replicates them along both grid axes: every worker ends up with one store holding
//! all sequences of its grid row and one holding all sequences of its grid column, each in
//! rank order of the contributing workers.
//!
//! For one axis the exchange is:
//! 1. an all-reduce of `[total_bytes, num_seqs, total_bases]` sizing the destination,
//! 2. an exclusive prefix sum of `total_bytes` giving this worker's insertion offset,
//! 3. gathers of the lengths, global ids and insertion-adjusted offsets,
//! 4. a gather of the packed bytes.

use bytemuck::Pod;

use crate::comm::{displacements, Collectives, Communicator};
use crate::error::{CommError, Result, ShareError};
use crate::grid::ProcessGrid;
use crate::store::SequenceStore;

/// Sizes of one axis' destination store and this worker's place in it
#[derive(Debug, Clone, Copy)]
struct AxisPlan {
    total_bytes: u64,
    num_seqs: u64,
    total_bases: u64,
    insertion: u64,
}
impl AxisPlan {
    fn new<C: Communicator>(local: &SequenceStore, comm: &C) -> Result<Self> {
        let info = [
            local.total_bytes() as u64,
            local.num_seqs() as u64,
            local.total_bases(),
        ];
        let totals = comm.all_reduce_sum(&info)?;
        let [total_bytes, num_seqs, total_bases] = totals[..] else {
            return Err(CommError::CountMismatch {
                rank: comm.rank(),
                expected: info.len(),
                got: totals.len(),
            }
            .into());
        };
        let insertion = comm.exclusive_scan_sum(info[0])?;
        Ok(Self {
            total_bytes,
            num_seqs,
            total_bases,
            insertion,
        })
    }

    fn gather<C: Communicator>(&self, local: &SequenceStore, comm: &C) -> Result<SequenceStore> {
        let num_seqs = self.num_seqs as usize;
        let mut offsets = zeroed::<u64>(local.num_seqs())?;
        for (adjusted, &offset) in offsets.iter_mut().zip(local.offsets()) {
            *adjusted = offset + self.insertion;
        }

        let counts = as_counts(&comm.all_gather_words(local.num_seqs() as u64)?);
        let displs = displacements(&counts);
        let mut lengths = zeroed::<u64>(num_seqs)?;
        let mut gids = zeroed::<u64>(num_seqs)?;
        let mut shared_offsets = zeroed::<u64>(num_seqs)?;
        comm.all_gatherv_into(local.lengths(), &mut lengths, &counts, &displs)?;
        comm.all_gatherv_into(local.gids(), &mut gids, &counts, &displs)?;
        comm.all_gatherv_into(&offsets, &mut shared_offsets, &counts, &displs)?;

        let counts = as_counts(&comm.all_gather_words(local.total_bytes() as u64)?);
        let displs = displacements(&counts);
        let mut buffer = zeroed::<u8>(self.total_bytes as usize)?;
        comm.all_gatherv_into(local.buffer(), &mut buffer, &counts, &displs)?;

        let store = SequenceStore::from_parts(buffer, lengths, shared_offsets, gids)
            .map_err(ShareError::InvalidStore)?;
        debug_assert_eq!(store.total_bases(), self.total_bases);
        Ok(store)
    }
}

fn as_counts(words: &[u64]) -> Vec<usize> {
    words.iter().map(|&w| w as usize).collect()
}

/// A zero-filled vector of exactly `len` elements, allocated fallibly
fn zeroed<T: Pod>(len: usize) -> std::result::Result<Vec<T>, ShareError> {
    let mut values = Vec::new();
    values.try_reserve_exact(len)?;
    values.resize(len, T::zeroed());
    Ok(values)
}

/// Replicates `local` over the members of `comm`
///
/// Every member receives the same store: the concatenation of all members' sequences in
/// rank order, with offsets rebased onto the shared buffer.
pub fn share_axis<C: Communicator>(local: &SequenceStore, comm: &C) -> Result<SequenceStore> {
    AxisPlan::new(local, comm)?.gather(local, comm)
}

/// Builds the row and column stores of this worker
///
/// Returns `(row_store, col_store)`. Both are independent copies; `local` is left untouched.
pub fn share<C: Communicator>(
    local: &SequenceStore,
    grid: &ProcessGrid<C>,
) -> Result<(SequenceStore, SequenceStore)> {
    let row_plan = AxisPlan::new(local, grid.row_comm())?;
    let col_plan = AxisPlan::new(local, grid.col_comm())?;
    log::debug!(
        "[{}] inserting at byte {} of row, byte {} of column",
        grid.tag(),
        row_plan.insertion,
        col_plan.insertion
    );

    let row_store = row_plan.gather(local, grid.row_comm())?;
    let col_store = col_plan.gather(local, grid.col_comm())?;
    log::info!(
        "[{}] row store holds {} sequences ({} bytes), column store {} sequences ({} bytes)",
        grid.tag(),
        row_store.num_seqs(),
        row_store.total_bytes(),
        col_store.num_seqs(),
        col_store.total_bytes()
    );
    Ok((row_store, col_store))
}
