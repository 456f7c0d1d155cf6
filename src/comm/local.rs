//! Thread-backed process set
//!
//! [`LocalCluster`] runs every worker as a thread of the current process. Workers talk through
//! [`LocalComm`] handles which implement [`Communicator`] on top of a shared rendezvous per
//! group. A worker that returns an error (or panics) aborts the whole set, so no peer is left
//! blocked in a collective.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::Communicator;
use crate::error::{CommError, Error, GridError, Result};
use crate::grid::{square_side, ProcessGrid};

/// Messages deposited by every member in one round, indexed by member rank
type Round = Arc<Vec<Vec<Vec<u8>>>>;

#[derive(Debug, Default)]
struct RoundState {
    /// Contributions of the round in progress
    pending: Vec<Option<Vec<Vec<u8>>>>,
    /// Number of members that have contributed to the round in progress
    arrived: usize,
    /// Number of completed rounds
    generation: u64,
    /// Contributions of the last completed round
    published: Round,
}

/// Rendezvous point shared by the members of one group
#[derive(Debug)]
struct Group {
    size: usize,
    state: Mutex<RoundState>,
    cvar: Condvar,
    aborted: Arc<AtomicBool>,
}
impl Group {
    fn new(size: usize, aborted: Arc<AtomicBool>) -> Self {
        Self {
            size,
            state: Mutex::new(RoundState {
                pending: vec![None; size],
                ..RoundState::default()
            }),
            cvar: Condvar::new(),
            aborted,
        }
    }

    /// Deposits `parts` for `rank` and blocks until every member has deposited.
    ///
    /// The last member to arrive publishes the round and wakes the others. A round can only
    /// be replaced once every member has entered the next one, so readers never observe a
    /// later round than their own.
    fn exchange(&self, rank: usize, parts: Vec<Vec<u8>>) -> Result<Round> {
        let mut state = self.state.lock();
        if self.aborted.load(Ordering::Acquire) {
            return Err(CommError::Aborted.into());
        }
        state.pending[rank] = Some(parts);
        state.arrived += 1;

        if state.arrived == self.size {
            let contributions = state
                .pending
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            state.published = Arc::new(contributions);
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(state.published.clone());
        }

        let generation = state.generation;
        while state.generation == generation {
            if self.aborted.load(Ordering::Acquire) {
                return Err(CommError::Aborted.into());
            }
            self.cvar.wait(&mut state);
        }
        Ok(state.published.clone())
    }

    fn wake(&self) {
        let _state = self.state.lock();
        self.cvar.notify_all();
    }
}

/// State shared by every worker of one run
#[derive(Debug)]
struct Shared {
    aborted: Arc<AtomicBool>,
    groups: Vec<Arc<Group>>,
}
impl Shared {
    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.groups.iter().for_each(|group| group.wake());
    }
}

/// A member's handle on one group of a [`LocalCluster`]
#[derive(Debug, Clone)]
pub struct LocalComm {
    rank: usize,
    group: Arc<Group>,
    shared: Arc<Shared>,
}
impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn all_gather_bytes(&self, send: &[u8]) -> Result<Vec<Vec<u8>>> {
        let round = self.group.exchange(self.rank, vec![send.to_vec()])?;
        Ok(round
            .iter()
            .map(|parts| parts.first().cloned().unwrap_or_default())
            .collect())
    }

    fn broadcast_bytes(&self, root: usize, send: &[u8]) -> Result<Vec<u8>> {
        let parts = if self.rank == root {
            vec![send.to_vec()]
        } else {
            Vec::new()
        };
        let round = self.group.exchange(self.rank, parts)?;
        round
            .get(root)
            .and_then(|parts| parts.first().cloned())
            .ok_or_else(|| {
                CommError::InvalidRoot {
                    root,
                    size: self.size(),
                }
                .into()
            })
    }

    fn scatter_bytes(&self, root: usize, parts: &[Vec<u8>]) -> Result<Vec<u8>> {
        let deposit = if self.rank == root {
            if parts.len() != self.size() {
                return Err(CommError::ScatterParts {
                    expected: self.size(),
                    got: parts.len(),
                }
                .into());
            }
            parts.to_vec()
        } else {
            Vec::new()
        };
        let round = self.group.exchange(self.rank, deposit)?;
        round
            .get(root)
            .and_then(|parts| parts.get(self.rank).cloned())
            .ok_or_else(|| {
                CommError::ScatterParts {
                    expected: self.size(),
                    got: round.get(root).map_or(0, Vec::len),
                }
                .into()
            })
    }

    fn abort(&self) {
        log::debug!("rank {} aborting the process set", self.rank);
        self.shared.abort();
    }
}

/// All communicators of one run, indexed by world rank
struct Layout {
    shared: Arc<Shared>,
    world: Arc<Group>,
    rows: Vec<Arc<Group>>,
    cols: Vec<Arc<Group>>,
}
impl Layout {
    fn new(workers: usize, dims: usize) -> Self {
        let aborted = Arc::new(AtomicBool::new(false));
        let world = Arc::new(Group::new(workers, aborted.clone()));
        let rows: Vec<_> = (0..dims)
            .map(|_| Arc::new(Group::new(dims, aborted.clone())))
            .collect();
        let cols: Vec<_> = (0..dims)
            .map(|_| Arc::new(Group::new(dims, aborted.clone())))
            .collect();
        let groups = std::iter::once(world.clone())
            .chain(rows.iter().cloned())
            .chain(cols.iter().cloned())
            .collect();
        Self {
            shared: Arc::new(Shared { aborted, groups }),
            world,
            rows,
            cols,
        }
    }

    fn comm(&self, rank: usize, group: &Arc<Group>) -> LocalComm {
        LocalComm {
            rank,
            group: group.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// A set of workers running as threads of the current process
///
/// Each call to [`LocalCluster::run`] or [`LocalCluster::run_groups`] starts a fresh set of
/// groups, so an aborted run does not poison the next one.
#[derive(Debug, Clone, Copy)]
pub struct LocalCluster {
    workers: usize,
}
impl LocalCluster {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(GridError::Empty.into());
        }
        Ok(Self { workers })
    }

    /// A cluster with the largest square number of workers not exceeding the number of CPUs
    #[must_use]
    pub fn with_available_cpus() -> Self {
        let cpus = num_cpus::get().max(1);
        let side = (1..=cpus).take_while(|d| d * d <= cpus).last().unwrap_or(1);
        Self {
            workers: side * side,
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `f` on every worker of a square grid and returns each worker's outcome in rank order
    ///
    /// Fails up front with [`GridError::NotSquare`] if the worker count is not a perfect square.
    pub fn run_all<T, F>(&self, f: F) -> Result<Vec<Result<T>>>
    where
        T: Send,
        F: Fn(ProcessGrid<LocalComm>) -> Result<T> + Sync,
    {
        let dims = square_side(self.workers).ok_or(GridError::NotSquare(self.workers))?;
        let layout = Layout::new(self.workers, dims);
        Ok(self.spawn(&layout, |rank| {
            let (row, col) = (rank / dims, rank % dims);
            let grid = ProcessGrid::new(
                layout.comm(rank, &layout.world),
                layout.comm(col, &layout.rows[row]),
                layout.comm(row, &layout.cols[col]),
            )?;
            f(grid)
        }))
    }

    /// Runs `f` on every worker of a square grid, failing if any worker fails
    ///
    /// When several workers fail, the error reported is the first one (in rank order) that
    /// is not a consequence of another worker's abort.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(ProcessGrid<LocalComm>) -> Result<T> + Sync,
    {
        collect_outcomes(self.run_all(f)?)
    }

    /// Runs `f` on every worker with only the world communicator (any worker count)
    pub fn run_groups<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(LocalComm) -> Result<T> + Sync,
    {
        let layout = Layout::new(self.workers, 0);
        collect_outcomes(self.spawn(&layout, |rank| f(layout.comm(rank, &layout.world))))
    }

    fn spawn<T, F>(&self, layout: &Layout, f: F) -> Vec<Result<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync,
    {
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.workers)
                .map(|rank| {
                    let f = &f;
                    let shared = &layout.shared;
                    scope.spawn(move || {
                        let outcome = catch_unwind(AssertUnwindSafe(|| f(rank)))
                            .unwrap_or_else(|_| Err(CommError::WorkerPanicked(rank).into()));
                        if let Err(e) = &outcome {
                            if !is_abort(e) {
                                log::debug!("worker {rank} failed: {e}");
                            }
                            shared.abort();
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(CommError::WorkerPanicked(rank).into()))
                })
                .collect()
        })
    }
}

fn is_abort(e: &Error) -> bool {
    matches!(e, Error::CommError(CommError::Aborted))
}

fn collect_outcomes<T>(outcomes: Vec<Result<T>>) -> Result<Vec<T>> {
    if outcomes.iter().all(Result::is_ok) {
        return outcomes.into_iter().collect();
    }
    let mut first = None;
    for outcome in outcomes {
        match outcome {
            Err(e) if !is_abort(&e) => return Err(e),
            Err(e) => {
                first.get_or_insert(e);
            }
            Ok(_) => {}
        }
    }
    Err(first.unwrap_or_else(|| CommError::Aborted.into()))
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::comm::Collectives;

    #[test]
    fn test_all_gather_in_rank_order() -> anyhow::Result<()> {
        let results = LocalCluster::new(5)?.run_groups(|comm| {
            let gathered = comm.all_gather_bytes(&[comm.rank() as u8; 2])?;
            Ok(gathered)
        })?;
        for gathered in results {
            let expected: Vec<Vec<u8>> = (0..5u8).map(|r| vec![r; 2]).collect();
            assert_eq!(gathered, expected);
        }
        Ok(())
    }

    #[test]
    fn test_repeated_rounds() -> anyhow::Result<()> {
        let results = LocalCluster::new(4)?.run_groups(|comm| {
            let mut total = 0;
            for round in 0..50u64 {
                total += comm.all_reduce_sum(&[round + comm.rank() as u64])?[0];
            }
            Ok(total)
        })?;
        // sum over rounds of (4 * round + 6)
        let expected: u64 = (0..50u64).map(|r| 4 * r + 6).sum();
        assert!(results.into_iter().all(|t| t == expected));
        Ok(())
    }

    #[test]
    fn test_failure_aborts_peers() -> anyhow::Result<()> {
        let cluster = LocalCluster::new(4)?;
        let outcomes = cluster.run_all(|grid| {
            if grid.rank() == 2 {
                return Err(crate::StoreError::EmptyPartition.into());
            }
            grid.world().all_reduce_sum(&[1])?;
            Ok(())
        })?;
        assert!(matches!(
            outcomes[2],
            Err(Error::StoreError(crate::StoreError::EmptyPartition))
        ));
        for rank in [0, 1, 3] {
            assert!(matches!(
                outcomes[rank],
                Err(Error::CommError(CommError::Aborted))
            ));
        }

        // the reported error is the root cause, not a peer's abort
        let err = cluster
            .run(|grid| {
                if grid.rank() == 3 {
                    return Err(crate::StoreError::EmptyPartition.into());
                }
                grid.world().all_reduce_sum(&[1])?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StoreError(crate::StoreError::EmptyPartition)
        ));
        Ok(())
    }

    #[test]
    fn test_panic_is_reported() -> anyhow::Result<()> {
        let outcomes = LocalCluster::new(1)?.run_all(|_grid| -> Result<()> {
            panic!("worker failure");
        })?;
        assert!(matches!(
            outcomes[0],
            Err(Error::CommError(CommError::WorkerPanicked(0)))
        ));
        Ok(())
    }

    #[test]
    fn test_non_square_cluster() -> anyhow::Result<()> {
        let err = LocalCluster::new(3)?.run(|_grid| Ok(())).unwrap_err();
        assert!(matches!(err, Error::GridError(GridError::NotSquare(3))));
        assert!(matches!(
            LocalCluster::new(0),
            Err(Error::GridError(GridError::Empty))
        ));
        Ok(())
    }

    #[test]
    fn test_available_cpus_is_square() {
        let workers = LocalCluster::with_available_cpus().workers();
        assert!(square_side(workers).is_some());
    }
}
