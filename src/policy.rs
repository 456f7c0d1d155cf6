use rand::Rng;

use crate::error::StoreError;
use crate::store::encode::is_nucleotide;

/// Policy for handling symbols outside of `ACGT` (in either case)
///
/// The packed store holds exactly 2 bits per symbol, so ambiguity codes such as `N` have no
/// slot of their own. Every policy either rejects the sequence or substitutes a valid base;
/// nothing is silently truncated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Policy {
    /// Fail the build, naming the sequence and position of the first invalid symbol
    #[default]
    BreakOnInvalid,
    /// Replace every invalid symbol with a uniformly drawn base
    RandomDraw,
    SetToA,
    SetToC,
    SetToG,
    SetToT,
}
impl Policy {
    /// Replacement base of the fixed substitution policies
    fn fixed_base(self) -> u8 {
        match self {
            Self::SetToC => b'C',
            Self::SetToG => b'G',
            Self::SetToT => b'T',
            _ => b'A',
        }
    }

    fn fill_with_known(sequence: &[u8], val: u8, ibuf: &mut Vec<u8>) {
        for &n in sequence {
            ibuf.push(if is_nucleotide(n) { n } else { val });
        }
    }

    fn fill_with_random<R: Rng>(sequence: &[u8], rng: &mut R, ibuf: &mut Vec<u8>) {
        for &n in sequence {
            ibuf.push(if is_nucleotide(n) {
                n
            } else {
                b"ACGT"[rng.random_range(0..4)]
            });
        }
    }

    /// Writes the substituted form of `sequence` into `ibuf` (cleared first)
    ///
    /// `gid` only identifies the sequence in the error returned by
    /// [`Policy::BreakOnInvalid`].
    pub fn handle<R: Rng>(
        &self,
        gid: u64,
        sequence: &[u8],
        ibuf: &mut Vec<u8>,
        rng: &mut R,
    ) -> Result<(), StoreError> {
        ibuf.clear();
        match self {
            Self::BreakOnInvalid => {
                let position = sequence
                    .iter()
                    .position(|&n| !is_nucleotide(n))
                    .unwrap_or(sequence.len());
                let symbol = sequence.get(position).map_or('?', |&n| char::from(n));
                Err(StoreError::InvalidNucleotide {
                    gid,
                    position,
                    symbol,
                })
            }
            Self::RandomDraw => {
                Self::fill_with_random(sequence, rng, ibuf);
                Ok(())
            }
            Self::SetToA | Self::SetToC | Self::SetToG | Self::SetToT => {
                Self::fill_with_known(sequence, self.fixed_base(), ibuf);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod testing {
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_break_on_invalid() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut ibuf = Vec::new();
        let err = Policy::default()
            .handle(7, b"ACgtNAC", &mut ibuf, &mut rng)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidNucleotide {
                gid: 7,
                position: 4,
                symbol: 'N'
            }
        ));
    }

    #[test]
    fn test_set_to_known() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut ibuf = b"stale".to_vec();
        Policy::SetToA.handle(0, b"ACgtNRY", &mut ibuf, &mut rng)?;
        assert_eq!(ibuf, b"ACgtAAA");
        Policy::SetToT.handle(0, b"n", &mut ibuf, &mut rng)?;
        assert_eq!(ibuf, b"T");
        Ok(())
    }

    #[test]
    fn test_random_draw() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut ibuf = Vec::new();
        Policy::RandomDraw.handle(0, b"NNNNNNNNacgt", &mut ibuf, &mut rng)?;
        assert_eq!(ibuf.len(), 12);
        assert!(ibuf[..8].iter().all(|n| b"ACGT".contains(n)));
        assert_eq!(&ibuf[8..], b"acgt");
        Ok(())
    }
}
