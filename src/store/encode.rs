//! 2-bit nucleotide codec
//!
//! Four symbols are packed per byte, least significant pair first:
//!
//! | Symbol | Bits |
//! | ------ | ---- |
//! | A / a  | 00   |
//! | C / c  | 01   |
//! | G / g  | 10   |
//! | T / t  | 11   |
//!
//! Symbol `i` of a sequence lives in byte `i / 4` at bit `2 * (i % 4)`. Unused pairs in the
//! final byte are zero. Any other symbol is unencodable; see [`Policy`](crate::Policy).

/// Marks a byte with no 2-bit code
const INVALID: u8 = 0xFF;

/// 2-bit code of every byte value
const NT4: [u8; 256] = {
    let mut table = [INVALID; 256];
    table[b'A' as usize] = 0;
    table[b'C' as usize] = 1;
    table[b'G' as usize] = 2;
    table[b'T' as usize] = 3;
    table[b'a' as usize] = 0;
    table[b'c' as usize] = 1;
    table[b'g' as usize] = 2;
    table[b't' as usize] = 3;
    table
};

const BASES: [u8; 4] = *b"ACGT";

/// Whether `symbol` has a 2-bit code
#[inline]
#[must_use]
pub fn is_nucleotide(symbol: u8) -> bool {
    NT4[symbol as usize] != INVALID
}

/// Number of packed bytes needed for `len` symbols
#[inline]
#[must_use]
pub fn packed_len(len: u64) -> u64 {
    len.div_ceil(4)
}

/// Appends the packed form of `sequence` to `buffer`
///
/// On an unencodable symbol nothing is appended and its position is returned.
pub fn encode(sequence: &[u8], buffer: &mut Vec<u8>) -> Result<(), usize> {
    if let Some(position) = sequence.iter().position(|&n| !is_nucleotide(n)) {
        return Err(position);
    }
    buffer.extend(sequence.chunks(4).map(|chunk| {
        chunk
            .iter()
            .enumerate()
            .fold(0u8, |byte, (i, &n)| byte | (NT4[n as usize] << (2 * i)))
    }));
    Ok(())
}

/// Appends the `len` uppercase symbols packed in `packed` to `buffer`
///
/// `packed` must hold at least `packed_len(len)` bytes; extra bytes are ignored.
pub fn decode(packed: &[u8], len: usize, buffer: &mut Vec<u8>) {
    buffer.reserve(len);
    buffer.extend((0..len).map(|i| BASES[usize::from((packed[i / 4] >> (2 * (i % 4))) & 3)]));
}
