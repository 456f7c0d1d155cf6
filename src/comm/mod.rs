//! # comm
//!
//! Collective communication over a group of cooperating workers.
//!
//! A [`Communicator`] is one member's handle on a group of `size()` members. The trait only
//! exposes byte-level primitives; the typed collectives used by the rest of the crate
//! (broadcast, scatter, reduce-sum, exclusive prefix sum, variable-length gather) are provided
//! by the [`Collectives`] extension trait, which is implemented for every communicator.
//!
//! Every collective is a synchronization point: all members of the group must enter the same
//! collectives in the same order. A member that cannot continue calls [`Communicator::abort`],
//! after which every blocked or future collective in the process set fails with
//! [`CommError::Aborted`](crate::CommError::Aborted) instead of hanging.
//!
//! [`local`] provides a thread-backed implementation where every worker is a thread of the
//! current process.

pub mod local;

use auto_impl::auto_impl;
use byteorder::{ByteOrder, LittleEndian};
use bytemuck::Pod;

use crate::error::{CommError, Result};

/// One member's view of a communication group
#[auto_impl(&, Box, Arc)]
pub trait Communicator {
    /// Rank of this member within the group
    fn rank(&self) -> usize;

    /// Number of members in the group
    fn size(&self) -> usize;

    /// Every member contributes a message and receives all messages in rank order.
    fn all_gather_bytes(&self, send: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// The root's message is returned on every member. Non-root payloads are ignored.
    fn broadcast_bytes(&self, root: usize, send: &[u8]) -> Result<Vec<u8>>;

    /// The root provides one message per member; each member receives its own.
    ///
    /// `parts` is only read on the root.
    fn scatter_bytes(&self, root: usize, parts: &[Vec<u8>]) -> Result<Vec<u8>>;

    /// Tears down the whole process set. Every pending and future collective fails.
    fn abort(&self);
}

/// Exclusive prefix sums of `counts`: `displs[0] == 0`, `displs[i+1] = displs[i] + counts[i]`.
#[must_use]
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut acc = 0;
    for &count in counts {
        displs.push(acc);
        acc += count;
    }
    displs
}

fn check_root<C: Communicator + ?Sized>(comm: &C, root: usize) -> Result<()> {
    if root >= comm.size() {
        return Err(CommError::InvalidRoot {
            root,
            size: comm.size(),
        }
        .into());
    }
    Ok(())
}

fn to_pod_vec<T: Pod>(bytes: &[u8]) -> Result<Vec<T>> {
    let elem = std::mem::size_of::<T>();
    if elem == 0 || bytes.len() % elem != 0 {
        return Err(CommError::Misaligned {
            len: bytes.len(),
            elem,
        }
        .into());
    }
    Ok(bytemuck::pod_collect_to_vec(bytes))
}

fn encode_words(words: &[u64]) -> Vec<u8> {
    let mut bytes = vec![0; words.len() * 8];
    LittleEndian::write_u64_into(words, &mut bytes);
    bytes
}

fn decode_words(bytes: &[u8]) -> Result<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return Err(CommError::Misaligned {
            len: bytes.len(),
            elem: 8,
        }
        .into());
    }
    let mut words = vec![0; bytes.len() / 8];
    LittleEndian::read_u64_into(bytes, &mut words);
    Ok(words)
}

/// Typed collectives built on top of the byte-level [`Communicator`] primitives
pub trait Collectives: Communicator {
    /// Broadcasts a slice of plain-old-data from `root`
    fn broadcast<T: Pod>(&self, root: usize, values: &[T]) -> Result<Vec<T>> {
        check_root(self, root)?;
        let bytes = self.broadcast_bytes(root, bytemuck::cast_slice(values))?;
        to_pod_vec(&bytes)
    }

    /// Broadcasts u64 words from `root` in little-endian wire order
    fn broadcast_words(&self, root: usize, words: &[u64]) -> Result<Vec<u64>> {
        check_root(self, root)?;
        let bytes = self.broadcast_bytes(root, &encode_words(words))?;
        decode_words(&bytes)
    }

    /// Scatters one word per member from `root`
    fn scatter_word(&self, root: usize, words: &[u64]) -> Result<u64> {
        check_root(self, root)?;
        let parts: Vec<Vec<u8>> = if self.rank() == root {
            if words.len() != self.size() {
                return Err(CommError::ScatterParts {
                    expected: self.size(),
                    got: words.len(),
                }
                .into());
            }
            words.iter().map(|w| w.to_le_bytes().to_vec()).collect()
        } else {
            Vec::new()
        };
        let bytes = self.scatter_bytes(root, &parts)?;
        let word = decode_words(&bytes)?;
        match word.as_slice() {
            [w] => Ok(*w),
            _ => Err(CommError::Misaligned {
                len: bytes.len(),
                elem: 8,
            }
            .into()),
        }
    }

    /// Scatters consecutive runs of `send` from `root`: member `i` receives `counts[i]`
    /// elements starting at the sum of the preceding counts.
    ///
    /// `send` and `counts` are only read on the root. Every member checks that it received
    /// `expected` elements.
    fn scatterv<T: Pod>(
        &self,
        root: usize,
        send: &[T],
        counts: &[usize],
        expected: usize,
    ) -> Result<Vec<T>> {
        check_root(self, root)?;
        let parts: Vec<Vec<u8>> = if self.rank() == root {
            if counts.len() != self.size() {
                return Err(CommError::ScatterParts {
                    expected: self.size(),
                    got: counts.len(),
                }
                .into());
            }
            let displs = displacements(counts);
            let total = displs.last().copied().unwrap_or(0) + counts.last().copied().unwrap_or(0);
            if total > send.len() {
                return Err(CommError::CountMismatch {
                    rank: root,
                    expected: total,
                    got: send.len(),
                }
                .into());
            }
            counts
                .iter()
                .zip(displs)
                .map(|(&count, displ)| bytemuck::cast_slice(&send[displ..displ + count]).to_vec())
                .collect()
        } else {
            Vec::new()
        };
        let bytes = self.scatter_bytes(root, &parts)?;
        let values = to_pod_vec::<T>(&bytes)?;
        if values.len() != expected {
            return Err(CommError::CountMismatch {
                rank: self.rank(),
                expected,
                got: values.len(),
            }
            .into());
        }
        Ok(values)
    }

    /// Element-wise sum of `values` over every member, returned on every member
    fn all_reduce_sum(&self, values: &[u64]) -> Result<Vec<u64>> {
        let messages = self.all_gather_bytes(&encode_words(values))?;
        let mut sums = vec![0u64; values.len()];
        for (rank, message) in messages.iter().enumerate() {
            let words = decode_words(message)?;
            if words.len() != sums.len() {
                return Err(CommError::CountMismatch {
                    rank,
                    expected: sums.len(),
                    got: words.len(),
                }
                .into());
            }
            sums.iter_mut().zip(words).for_each(|(s, w)| *s += w);
        }
        Ok(sums)
    }

    /// Sum of `value` over all members ranked below this one (0 on rank 0)
    fn exclusive_scan_sum(&self, value: u64) -> Result<u64> {
        let values = self.all_gather_words(value)?;
        Ok(values[..self.rank()].iter().sum())
    }

    /// Collects one word from every member, in rank order
    fn all_gather_words(&self, value: u64) -> Result<Vec<u64>> {
        let messages = self.all_gather_bytes(&value.to_le_bytes())?;
        let mut words = Vec::with_capacity(messages.len());
        for message in &messages {
            match decode_words(message)?.as_slice() {
                [w] => words.push(*w),
                _ => {
                    return Err(CommError::Misaligned {
                        len: message.len(),
                        elem: 8,
                    }
                    .into())
                }
            }
        }
        Ok(words)
    }

    /// Gathers variable-length contributions into `recv` on every member.
    ///
    /// Member `i` must contribute exactly `counts[i]` elements, which land at
    /// `recv[displs[i]..displs[i] + counts[i]]`. The table is validated against the
    /// capacity of `recv` before anything is written.
    fn all_gatherv_into<T: Pod>(
        &self,
        send: &[T],
        recv: &mut [T],
        counts: &[usize],
        displs: &[usize],
    ) -> Result<()> {
        if counts.len() != self.size() || displs.len() != self.size() {
            return Err(CommError::ScatterParts {
                expected: self.size(),
                got: counts.len().min(displs.len()),
            }
            .into());
        }
        if send.len() != counts[self.rank()] {
            return Err(CommError::CountMismatch {
                rank: self.rank(),
                expected: counts[self.rank()],
                got: send.len(),
            }
            .into());
        }
        let messages = self.all_gather_bytes(bytemuck::cast_slice(send))?;
        for (rank, message) in messages.iter().enumerate() {
            let values = to_pod_vec::<T>(message)?;
            if values.len() != counts[rank] {
                return Err(CommError::CountMismatch {
                    rank,
                    expected: counts[rank],
                    got: values.len(),
                }
                .into());
            }
            let Some(dest) = recv.get_mut(displs[rank]..displs[rank] + counts[rank]) else {
                return Err(crate::ShareError::CapacityMismatch {
                    displ: displs[rank],
                    count: counts[rank],
                    capacity: recv.len(),
                }
                .into());
            };
            dest.copy_from_slice(&values);
        }
        Ok(())
    }
}

impl<C: Communicator + ?Sized> Collectives for C {}
