//! Compact table of sequence names
//!
//! Names are concatenated into one byte buffer; `displs[i]..displs[i + 1]` delimits name `i`.

use byteorder::{ByteOrder, LittleEndian};

use crate::comm::{Collectives, Communicator};
use crate::error::{CommError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameTable {
    data: Vec<u8>,
    displs: Vec<usize>,
}
impl NameTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a name and returns its id
    pub fn push(&mut self, name: &[u8]) -> usize {
        if self.displs.is_empty() {
            self.displs.push(0);
        }
        self.data.extend_from_slice(name);
        self.displs.push(self.data.len());
        self.displs.len() - 2
    }

    /// Number of names stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.displs.len().saturating_sub(1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of name `id`
    #[must_use]
    pub fn get_bytes(&self, id: usize) -> Option<&[u8]> {
        if id >= self.len() {
            return None;
        }
        Some(&self.data[self.displs[id]..self.displs[id + 1]])
    }

    /// Name `id`, if present and valid UTF-8
    #[must_use]
    pub fn get(&self, id: usize) -> Option<&str> {
        self.get_bytes(id)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Length in bytes of name `id`
    #[must_use]
    pub fn len_of(&self, id: usize) -> Option<usize> {
        self.get_bytes(id).map(<[u8]>::len)
    }

    /// Length of the longest name (0 when empty)
    #[must_use]
    pub fn max_len(&self) -> usize {
        self.displs
            .windows(2)
            .map(|w| w[1] - w[0])
            .max()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.displs
            .windows(2)
            .map(move |w| &self.data[w[0]..w[1]])
    }

    /// Replaces the table on every member with the one held by `root`
    ///
    /// The root releases spare capacity before sending; receivers size their buffers
    /// exactly from the broadcast lengths.
    pub fn broadcast<C: Communicator>(&mut self, root: usize, comm: &C) -> Result<()> {
        if comm.rank() == root {
            self.data.shrink_to_fit();
            self.displs.shrink_to_fit();
        }
        let info = comm.broadcast_words(
            root,
            &[self.len() as u64, self.data.len() as u64],
        )?;
        let [count, nbytes] = info[..] else {
            return Err(CommError::Misaligned {
                len: info.len() * 8,
                elem: 16,
            }
            .into());
        };

        let data = comm.broadcast_bytes(root, &self.data)?;
        let mut encoded = vec![0u8; self.displs.len() * 8];
        LittleEndian::write_u64_into(
            &self.displs.iter().map(|&d| d as u64).collect::<Vec<_>>(),
            &mut encoded,
        );
        let encoded = comm.broadcast_bytes(root, &encoded)?;

        let expected_displs = if count == 0 { 0 } else { count as usize + 1 };
        if data.len() as u64 != nbytes || encoded.len() != expected_displs * 8 {
            return Err(CommError::CountMismatch {
                rank: comm.rank(),
                expected: expected_displs,
                got: encoded.len() / 8,
            }
            .into());
        }
        if comm.rank() != root {
            let mut displs = vec![0u64; expected_displs];
            LittleEndian::read_u64_into(&encoded, &mut displs);
            self.data = data;
            self.displs = displs.into_iter().map(|d| d as usize).collect();
        }
        Ok(())
    }
}
