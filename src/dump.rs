//! Plain-text dumps of sequence stores
//!
//! [`write_log`] writes one file per worker with a tab-separated line per sequence:
//!
//! ```text
//! read_1	ACGTTGCA...
//! ```
//!
//! The first column is the sequence name when a [`NameTable`] is available, otherwise its
//! global id. [`write_index_log`] writes the index records a worker owns as
//! `gid,length,offset,line_width` lines. [`write_summary`] collects one line of counts per
//! worker into a single file written by the coordinator.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::comm::Communicator;
use crate::error::Result;
use crate::grid::ProcessGrid;
use crate::index::DistributedIndex;
use crate::names::NameTable;
use crate::store::SequenceStore;

/// Path of the per-worker log for `prefix` and `rank`
#[must_use]
pub fn log_path(prefix: &Path, rank: usize) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(format!(".rank{rank}.log"));
    PathBuf::from(path)
}

/// Path of the per-worker index log for `prefix` and `rank`
#[must_use]
pub fn index_log_path(prefix: &Path, rank: usize) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(format!(".rank{rank}.index.log"));
    PathBuf::from(path)
}

/// Writes the records owned by this worker to `<prefix>.rank<rank>.index.log` and returns
/// the path
pub fn write_index_log(index: &DistributedIndex, prefix: &Path) -> Result<PathBuf> {
    let path = index_log_path(prefix, index.rank());
    let mut writer = BufWriter::new(File::create(&path)?);
    let mut translater = itoa::Buffer::new();

    for (gid, record) in (index.first_global_id()..).zip(index.records()) {
        for (i, field) in [gid, record.length, record.byte_offset, record.line_width]
            .into_iter()
            .enumerate()
        {
            if i > 0 {
                writer.write_all(b",")?;
            }
            writer.write_all(translater.format(field).as_bytes())?;
        }
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(path)
}

/// Writes every sequence of `store` to `<prefix>.rank<rank>.log` and returns the path
pub fn write_log(
    store: &SequenceStore,
    prefix: &Path,
    names: Option<&NameTable>,
    rank: usize,
) -> Result<PathBuf> {
    let path = log_path(prefix, rank);
    let mut writer = BufWriter::new(File::create(&path)?);
    let mut translater = itoa::Buffer::new();
    let mut dbuf = Vec::new();

    for record in store.iter() {
        let name = names.and_then(|names| names.get_bytes(record.gid as usize));
        match name {
            Some(name) => writer.write_all(name)?,
            None => writer.write_all(translater.format(record.gid).as_bytes())?,
        }
        writer.write_all(b"\t")?;

        dbuf.clear();
        record.decode(&mut dbuf);
        writer.write_all(&dbuf)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(path)
}

/// One tab-separated line of counts for `store` on this worker
fn summary_line<C: Communicator>(store: &SequenceStore, grid: &ProcessGrid<C>) -> String {
    format!(
        "rank={}\trow={}\tcol={}\tbytes={}\tseqs={}\tbases={}\n",
        grid.rank(),
        grid.row(),
        grid.col(),
        store.total_bytes(),
        store.num_seqs(),
        store.total_bases()
    )
}

/// Gathers a summary line from every worker and writes them to `path` in rank order
///
/// Only the coordinator touches the file; every worker takes part in the gather.
pub fn write_summary<C: Communicator>(
    store: &SequenceStore,
    path: &Path,
    grid: &ProcessGrid<C>,
) -> Result<()> {
    let lines = grid
        .world()
        .all_gather_bytes(summary_line(store, grid).as_bytes())?;
    if !grid.is_coordinator() {
        return Ok(());
    }

    let mut writer = BufWriter::new(File::create(path)?);
    for line in &lines {
        writer.write_all(line)?;
    }
    writer.flush()?;
    log::info!("[{}] wrote summary of {} workers to {:?}", grid.tag(), lines.len(), path);
    Ok(())
}

#[cfg(test)]
mod testing {
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use super::*;
    use crate::comm::local::LocalCluster;
    use crate::policy::Policy;

    fn store() -> anyhow::Result<SequenceStore> {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut store = SequenceStore::new();
        store.push(b"acgtac", 1, Policy::default(), &mut rng)?;
        store.push(b"TTGA", 0, Policy::default(), &mut rng)?;
        Ok(store)
    }

    #[test]
    fn test_log_path() {
        assert_eq!(
            log_path(Path::new("out/run"), 3),
            PathBuf::from("out/run.rank3.log")
        );
    }

    #[test]
    fn test_write_index_log() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fai = dir.path().join("seqs.fa.fai");
        std::fs::write(
            &fai,
            "a\t10\t3\t10\t11\nb\t7\t18\t10\t11\nc\t20\t29\t10\t11\nd\t3\t55\t10\t11\n",
        )?;
        let prefix = dir.path().join("dump");

        let paths = LocalCluster::new(4)?.run(|grid| {
            let index = DistributedIndex::read(&fai, None, &grid)?;
            write_index_log(&index, &prefix)
        })?;
        assert!(paths[2].ends_with("dump.rank2.index.log"));
        assert_eq!(std::fs::read_to_string(&paths[0])?, "0,10,3,10\n");
        assert_eq!(std::fs::read_to_string(&paths[2])?, "2,20,29,10\n");
        assert_eq!(std::fs::read_to_string(&paths[3])?, "3,3,55,10\n");
        Ok(())
    }

    #[test]
    fn test_write_log_with_ids() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_log(&store()?, &dir.path().join("dump"), None, 0)?;
        assert_eq!(std::fs::read_to_string(path)?, "1\tACGTAC\n0\tTTGA\n");
        Ok(())
    }

    #[test]
    fn test_write_log_with_names() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut names = NameTable::new();
        names.push(b"first");
        names.push(b"second");
        let path = write_log(&store()?, &dir.path().join("dump"), Some(&names), 2)?;
        assert!(path.ends_with("dump.rank2.log"));
        assert_eq!(
            std::fs::read_to_string(path)?,
            "second\tACGTAC\nfirst\tTTGA\n"
        );
        Ok(())
    }

    #[test]
    fn test_write_summary() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("summary.tsv");
        LocalCluster::new(4)?.run(|grid| {
            let mut rng = SmallRng::seed_from_u64(0);
            let mut local = SequenceStore::new();
            let sequence = vec![b'A'; 4 * (grid.rank() + 1)];
            local.push(&sequence, grid.rank() as u64, Policy::default(), &mut rng)?;
            write_summary(&local, &path, &grid)
        })?;

        let summary = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "rank=0\trow=0\tcol=0\tbytes=1\tseqs=1\tbases=4");
        assert_eq!(lines[3], "rank=3\trow=1\tcol=1\tbytes=4\tseqs=1\tbases=16");
        Ok(())
    }
}
