//! # gridseq
//!
//! A distributed store of 2-bit packed nucleotide sequences for workers laid out on a square
//! process grid.
//!
//! Building the store takes three collective steps:
//!
//! 1. [`DistributedIndex`]: the coordinating worker parses the `.fai` index of the source
//!    FASTA file and scatters a contiguous block of records to every worker.
//! 2. [`SequenceStore::read`]: every worker reads only the bytes spanned by its records,
//!    strips the line terminators, and packs the symbols at 2 bits each.
//! 3. [`share`]: the local stores are replicated along both grid axes, so that every worker
//!    holds all sequences of its grid row and all sequences of its grid column.
//!
//! Workers communicate through the [`Communicator`] trait. [`LocalCluster`] runs a grid of
//! workers as threads of the current process.
//!
//! ## Example
//!
//! ```no_run
//! use gridseq::{share, DistributedIndex, LocalCluster, ReadOptions, SequenceStore};
//!
//! let cluster = LocalCluster::new(4).unwrap();
//! let stores = cluster
//!     .run(|grid| {
//!         let index = DistributedIndex::read("reads.fa.fai", None, &grid)?;
//!         let local = SequenceStore::read("reads.fa", &index, &grid, &ReadOptions::default())?;
//!         share(&local, &grid)
//!     })
//!     .unwrap();
//!
//! for (rank, (row, col)) in stores.iter().enumerate() {
//!     println!("{rank}: {} row sequences, {} column sequences", row.num_seqs(), col.num_seqs());
//! }
//! ```

pub mod comm;
pub mod dump;
mod error;
pub mod grid;
pub mod index;
pub mod names;
mod policy;
pub mod share;
pub mod store;

pub use comm::local::{LocalCluster, LocalComm};
pub use comm::{Collectives, Communicator};
pub use error::{
    CommError, Error, ErrorKind, GridError, IndexError, Result, ShareError, StoreError,
};
pub use grid::{GridTag, ProcessGrid};
pub use index::{DistributedIndex, IndexRecord, Role};
pub use names::NameTable;
pub use policy::Policy;
pub use share::{share, share_axis};
pub use store::{ReadOptions, ReadOptionsBuilder, SequenceStore, StoreRecord};

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs::File;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    /// A deterministic mixed-case `ACGT` sequence
    pub fn mixed_case(seed: usize, len: usize) -> Vec<u8> {
        (0..len).map(|j| b"ACGTacgt"[(seed * 3 + j * 5) % 8]).collect()
    }

    /// Writes a FASTA file wrapped at `width` symbols per line and its matching index
    pub fn write_fixture(
        dir: &Path,
        sequences: &[(&str, &[u8])],
        width: usize,
    ) -> anyhow::Result<(PathBuf, PathBuf)> {
        let fasta = dir.join("seqs.fa");
        let fai = dir.join("seqs.fa.fai");
        let mut fasta_file = File::create(&fasta)?;
        let mut fai_file = File::create(&fai)?;
        let mut offset = 0;
        for (name, sequence) in sequences {
            let header = format!(">{name}\n");
            fasta_file.write_all(header.as_bytes())?;
            offset += header.len();
            writeln!(
                fai_file,
                "{name}\t{}\t{offset}\t{width}\t{}",
                sequence.len(),
                width + 1
            )?;
            for line in sequence.chunks(width) {
                fasta_file.write_all(line)?;
                fasta_file.write_all(b"\n")?;
                offset += line.len() + 1;
            }
        }
        Ok((fasta, fai))
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::fixtures::{mixed_case, write_fixture};

    #[test]
    fn test_end_to_end_with_names() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let seqs: Vec<Vec<u8>> = (0..20).map(|i| mixed_case(i, 3 + (i * 11) % 40)).collect();
        let names: Vec<String> = (0..20).map(|i| format!("contig_{i}")).collect();
        let named: Vec<(&str, &[u8])> = names
            .iter()
            .map(String::as_str)
            .zip(seqs.iter().map(Vec::as_slice))
            .collect();
        let (fasta, fai) = write_fixture(dir.path(), &named, 12)?;
        let prefix = dir.path().join("dump");

        let results = LocalCluster::new(9)?.run(|grid| {
            let mut table = NameTable::new();
            let index = DistributedIndex::read(
                &fai,
                grid.is_coordinator().then_some(&mut table),
                &grid,
            )?;
            table.broadcast(crate::grid::COORDINATOR, grid.world())?;
            let local = SequenceStore::read(&fasta, &index, &grid, &ReadOptions::default())?;
            let (row, col) = share(&local, &grid)?;
            let path = dump::write_log(&local, &prefix, Some(&table), grid.rank())?;
            Ok((row, col, path))
        })?;

        let mut lines = Vec::new();
        for (_, _, path) in &results {
            lines.extend(std::fs::read_to_string(path)?.lines().map(str::to_owned));
        }
        assert_eq!(lines.len(), 20);
        for (i, line) in lines.iter().enumerate() {
            let expected = format!(
                "contig_{i}\t{}",
                String::from_utf8(seqs[i].to_ascii_uppercase())?
            );
            assert_eq!(line, &expected);
        }

        // every sequence is replicated once per grid row and once per grid column
        let mut row_count = vec![0; 20];
        let mut col_count = vec![0; 20];
        for (row, col, _) in &results {
            row.gids().iter().for_each(|&g| row_count[g as usize] += 1);
            col.gids().iter().for_each(|&g| col_count[g as usize] += 1);
        }
        assert!(row_count.iter().all(|&c| c == 3));
        assert!(col_count.iter().all(|&c| c == 3));
        Ok(())
    }

    #[test]
    fn test_non_square_grid_is_graceful() {
        let err = LocalCluster::new(6)
            .and_then(|cluster| cluster.run(|grid| Ok(grid.rank())))
            .unwrap_err();
        assert!(matches!(err, Error::GridError(GridError::NotSquare(6))));
        assert!(err.is_graceful());
    }
}
