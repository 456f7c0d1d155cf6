//! Square process grid
//!
//! `P = d * d` workers are laid out row-major on a `d x d` grid. Worker `rank` sits at
//! `(rank / d, rank % d)` and owns three communicators: the whole grid, its grid row (where its
//! rank is its column), and its grid column (where its rank is its row).

use std::fmt;

use crate::comm::Communicator;
use crate::error::{CommError, GridError, Result};

/// Rank of the worker that parses shared inputs on behalf of the grid
pub const COORDINATOR: usize = 0;

/// Side length of a square with `n` cells, if `n` is a perfect square
#[must_use]
pub fn square_side(n: usize) -> Option<usize> {
    let side = (0..=n).find(|d| d * d >= n)?;
    (side * side == n).then_some(side)
}

/// A worker's position on the grid together with its three communicators
#[derive(Debug, Clone)]
pub struct ProcessGrid<C: Communicator> {
    world: C,
    row_comm: C,
    col_comm: C,
    dims: usize,
    row: usize,
    col: usize,
}
impl<C: Communicator> ProcessGrid<C> {
    /// Assembles a grid from already split communicators
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The world size is not a perfect square
    /// * The row or column communicator does not span one full grid axis
    /// * The member ranks within the row/column do not match the grid coordinates
    pub fn new(world: C, row_comm: C, col_comm: C) -> Result<Self> {
        let nprocs = world.size();
        let dims = square_side(nprocs).ok_or(GridError::NotSquare(nprocs))?;
        if dims == 0 {
            return Err(GridError::Empty.into());
        }
        let (row, col) = (world.rank() / dims, world.rank() % dims);

        for (comm, expected_rank) in [(&row_comm, col), (&col_comm, row)] {
            if comm.size() != dims || comm.rank() != expected_rank {
                return Err(CommError::CountMismatch {
                    rank: world.rank(),
                    expected: dims,
                    got: comm.size(),
                }
                .into());
            }
        }

        Ok(Self {
            world,
            row_comm,
            col_comm,
            dims,
            row,
            col,
        })
    }

    /// Side length of the grid
    #[must_use]
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Total number of workers
    #[must_use]
    pub fn nprocs(&self) -> usize {
        self.dims * self.dims
    }

    /// Linear rank in the whole grid
    #[must_use]
    pub fn rank(&self) -> usize {
        self.world.rank()
    }

    #[must_use]
    pub fn row(&self) -> usize {
        self.row
    }

    #[must_use]
    pub fn col(&self) -> usize {
        self.col
    }

    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }

    /// Communicator spanning the whole grid
    pub fn world(&self) -> &C {
        &self.world
    }

    /// Communicator spanning this worker's grid row, ranked by column
    pub fn row_comm(&self) -> &C {
        &self.row_comm
    }

    /// Communicator spanning this worker's grid column, ranked by row
    pub fn col_comm(&self) -> &C {
        &self.col_comm
    }

    /// Short label used to prefix log lines, e.g. `P(5)==P(1,2)`
    #[must_use]
    pub fn tag(&self) -> GridTag {
        GridTag {
            rank: self.rank(),
            row: self.row,
            col: self.col,
        }
    }
}

/// Display helper identifying a worker by rank and coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridTag {
    pub rank: usize,
    pub row: usize,
    pub col: usize,
}
impl fmt::Display for GridTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P({})==P({},{})", self.rank, self.row, self.col)
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::comm::local::LocalCluster;

    #[test]
    fn test_square_side() {
        assert_eq!(square_side(0), Some(0));
        assert_eq!(square_side(1), Some(1));
        assert_eq!(square_side(4), Some(2));
        assert_eq!(square_side(9), Some(3));
        assert_eq!(square_side(2), None);
        assert_eq!(square_side(8), None);
        assert_eq!(square_side(10), None);
    }

    #[test]
    fn test_grid_coordinates() -> anyhow::Result<()> {
        let tags = LocalCluster::new(9)?.run(|grid| {
            assert_eq!(grid.dims(), 3);
            assert_eq!(grid.nprocs(), 9);
            assert_eq!(grid.row_comm().rank(), grid.col());
            assert_eq!(grid.col_comm().rank(), grid.row());
            assert_eq!(grid.row_comm().size(), 3);
            Ok(grid.tag())
        })?;
        assert_eq!(tags[5], GridTag { rank: 5, row: 1, col: 2 });
        assert_eq!(tags[5].to_string(), "P(5)==P(1,2)");
        assert!(tags.iter().enumerate().all(|(r, t)| t.rank == r));
        Ok(())
    }
}
