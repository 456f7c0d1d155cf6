//! # store
//!
//! Packed 2-bit storage for the sequences owned by one worker.
//!
//! A [`SequenceStore`] keeps every sequence back to back in a single byte buffer, with
//! parallel arrays holding the length, byte offset and global id of each one. Local ids are
//! positions in these arrays; global ids are positions in the index file.
//!
//! ```text
//! buffer:  |  seq 0 (ceil(l0/4) bytes) | seq 1 (ceil(l1/4) bytes) | ...
//! offsets:    0                          ceil(l0/4)                 ...
//! ```
//!
//! Stores are built from the source file with [`SequenceStore::read`] and expanded along the
//! grid axes by [`share`](crate::share).
//!
//! ## Example
//!
//! ```
//! use gridseq::{Policy, SequenceStore};
//! use rand::{rngs::SmallRng, SeedableRng};
//!
//! let mut rng = SmallRng::seed_from_u64(0);
//! let mut store = SequenceStore::new();
//! store.push(b"ACGTACGTAC", 0, Policy::default(), &mut rng).unwrap();
//! store.push(b"nnga", 1, Policy::SetToT, &mut rng).unwrap();
//!
//! assert_eq!(store.total_bytes(), 4);
//! assert_eq!(store.decode_alloc(1).unwrap(), b"TTGA");
//! ```

pub mod encode;
mod read;

use rand::Rng;

use crate::error::StoreError;
use crate::policy::Policy;

/// Seed of the substitution RNG when none is configured
pub const RNG_SEED: u64 = 42;

/// Options controlling how a store is built from the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    policy: Policy,
    seed: u64,
}
impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            seed: RNG_SEED,
        }
    }
}
impl ReadOptions {
    #[must_use]
    pub fn builder() -> ReadOptionsBuilder {
        ReadOptionsBuilder::default()
    }

    #[must_use]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

/// Builder for [`ReadOptions`]
///
/// ```
/// use gridseq::{Policy, ReadOptions};
///
/// let options = ReadOptions::builder().policy(Policy::RandomDraw).seed(7).build();
/// assert_eq!(options.policy(), Policy::RandomDraw);
/// ```
#[derive(Debug, Default)]
pub struct ReadOptionsBuilder {
    policy: Option<Policy>,
    seed: Option<u64>,
}
impl ReadOptionsBuilder {
    #[must_use]
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Seed for [`Policy::RandomDraw`]; each worker offsets it by its first global id
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn build(self) -> ReadOptions {
        ReadOptions {
            policy: self.policy.unwrap_or_default(),
            seed: self.seed.unwrap_or(RNG_SEED),
        }
    }
}

/// A view of one sequence inside a [`SequenceStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRecord<'a> {
    /// Position of the sequence in the index file
    pub gid: u64,
    /// Number of symbols
    pub length: u64,
    /// Byte offset of the packed sequence in the store buffer
    pub offset: u64,
    /// The `ceil(length / 4)` packed bytes
    pub packed: &'a [u8],
}
impl StoreRecord<'_> {
    /// Appends the uppercase symbols of the sequence to `buffer`
    pub fn decode(&self, buffer: &mut Vec<u8>) {
        encode::decode(self.packed, self.length as usize, buffer);
    }
}

/// Packed sequences with their lengths, offsets and global ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceStore {
    buffer: Vec<u8>,
    lengths: Vec<u64>,
    offsets: Vec<u64>,
    gids: Vec<u64>,
    total_bases: u64,
}
impl SequenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store with room for `num_seqs` sequences and `total_bytes` packed bytes
    pub fn try_with_capacity(num_seqs: usize, total_bytes: usize) -> Result<Self, StoreError> {
        let mut store = Self::new();
        store.buffer.try_reserve_exact(total_bytes)?;
        store.lengths.try_reserve_exact(num_seqs)?;
        store.offsets.try_reserve_exact(num_seqs)?;
        store.gids.try_reserve_exact(num_seqs)?;
        Ok(store)
    }

    /// Assembles a store from its parallel arrays, checking the packing invariants
    pub fn from_parts(
        buffer: Vec<u8>,
        lengths: Vec<u64>,
        offsets: Vec<u64>,
        gids: Vec<u64>,
    ) -> Result<Self, StoreError> {
        let total_bases = lengths.iter().sum();
        let store = Self {
            buffer,
            lengths,
            offsets,
            gids,
            total_bases,
        };
        store.validate()?;
        Ok(store)
    }

    /// Encodes `sequence` and appends it with global id `gid`
    ///
    /// Symbols outside of `ACGT` are handled by `policy`. On error the store is unchanged.
    pub fn push<R: Rng>(
        &mut self,
        sequence: &[u8],
        gid: u64,
        policy: Policy,
        rng: &mut R,
    ) -> Result<(), StoreError> {
        let packed = encode::packed_len(sequence.len() as u64) as usize;
        self.buffer.try_reserve(packed)?;
        self.lengths.try_reserve(1)?;
        self.offsets.try_reserve(1)?;
        self.gids.try_reserve(1)?;

        let offset = self.buffer.len() as u64;
        if encode::encode(sequence, &mut self.buffer).is_err() {
            let mut ibuf = Vec::new();
            ibuf.try_reserve_exact(sequence.len())?;
            policy.handle(gid, sequence, &mut ibuf, rng)?;
            if let Err(position) = encode::encode(&ibuf, &mut self.buffer) {
                return Err(StoreError::InvalidNucleotide {
                    gid,
                    position,
                    symbol: char::from(ibuf[position]),
                });
            }
        }

        self.lengths.push(sequence.len() as u64);
        self.offsets.push(offset);
        self.gids.push(gid);
        self.total_bases += sequence.len() as u64;
        Ok(())
    }

    /// The sequence with local id `lid`
    #[must_use]
    pub fn get(&self, lid: usize) -> Option<StoreRecord<'_>> {
        let length = *self.lengths.get(lid)?;
        let offset = self.offsets[lid];
        let start = offset as usize;
        let end = start + encode::packed_len(length) as usize;
        Some(StoreRecord {
            gid: self.gids[lid],
            length,
            offset,
            packed: self.buffer.get(start..end)?,
        })
    }

    /// Appends the uppercase symbols of sequence `lid` to `buffer`
    pub fn decode(&self, lid: usize, buffer: &mut Vec<u8>) -> Result<(), StoreError> {
        let record = self
            .get(lid)
            .ok_or(StoreError::OutOfRange(lid, self.num_seqs()))?;
        record.decode(buffer);
        Ok(())
    }

    /// Decodes sequence `lid` into a new buffer
    pub fn decode_alloc(&self, lid: usize) -> Result<Vec<u8>, StoreError> {
        let mut buffer = Vec::new();
        self.decode(lid, &mut buffer)?;
        Ok(buffer)
    }

    /// Iterates over the sequences in local id order
    pub fn iter(&self) -> impl Iterator<Item = StoreRecord<'_>> + '_ {
        (0..self.num_seqs()).filter_map(move |lid| self.get(lid))
    }

    /// Checks that the sequences are packed back to back and fill the buffer exactly
    pub fn validate(&self) -> Result<(), StoreError> {
        let n = self.lengths.len();
        if self.offsets.len() != n || self.gids.len() != n {
            return Err(StoreError::OutOfRange(
                self.offsets.len().max(self.gids.len()),
                n,
            ));
        }
        let mut expected = 0;
        for (index, (&offset, &length)) in self.offsets.iter().zip(&self.lengths).enumerate() {
            if offset != expected {
                return Err(StoreError::NonContiguous {
                    index,
                    offset,
                    expected,
                });
            }
            expected += encode::packed_len(length);
        }
        if expected != self.buffer.len() as u64 {
            return Err(StoreError::NonContiguous {
                index: n,
                offset: self.buffer.len() as u64,
                expected,
            });
        }
        Ok(())
    }

    /// Number of sequences
    #[must_use]
    pub fn num_seqs(&self) -> usize {
        self.lengths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Size of the packed buffer in bytes
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Number of symbols over all sequences
    #[must_use]
    pub fn total_bases(&self) -> u64 {
        self.total_bases
    }

    #[must_use]
    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }

    #[must_use]
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    #[must_use]
    pub fn gids(&self) -> &[u64] {
        &self.gids
    }

    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}
