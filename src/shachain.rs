// channeld-core: payment channel daemon core library
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Compressed storage of revocation preimages.
//!
//! Revocations are produced in strictly descending order of a
//! complementary index `0xFFFF_FFFF_FFFF_FFFF - N`; each preimage lets us
//! derive every preimage with a larger index, so we never need to store
//! more than 65 of them to reconstruct any of up to 2^64 revocations.

use std::convert::TryInto;

use bitcoin_hashes::{sha256, Hash};

/// Number of bytes the linearized form always occupies: `8 (min_index) +
/// 4 (num_valid) + 65 * (8 (index) + 32 (hash))`.
pub const LINEARIZED_LEN: usize = 8 + 4 + 65 * (8 + 32);

const NUM_BUCKETS: usize = 65;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ShachainError {
    /// index {0:#x} is not older than the last inserted index {1:#x}
    NotDescending(u64, u64),

    /// hash for index {0:#x} does not derive the already-known hash at a
    /// less significant bucket
    InconsistentHash(u64),

    /// linearized shachain blob has wrong length: {0} (expected 2612)
    BadLength(usize),

    /// no known hash can derive index {0:#x}
    NotDerivable(u64),
}

/// One retained `(index, hash)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Bucket {
    index: u64,
    hash: [u8; 32],
}

/// Compressed tower of up to 65 revocation preimages, from which every
/// preimage at a larger complementary index can be re-derived.
#[derive(Clone, Debug)]
pub struct Shachain {
    min_index: u64,
    min_index_valid: bool,
    num_valid: u32,
    known: [Option<Bucket>; NUM_BUCKETS],
}

impl Default for Shachain {
    fn default() -> Self {
        Shachain { min_index: 0, min_index_valid: false, num_valid: 0, known: [None; NUM_BUCKETS] }
    }
}

/// Position of the lowest set bit of `index`, or 64 if `index == 0`.
fn trailing_zeros(index: u64) -> u32 {
    if index == 0 {
        64
    } else {
        index.trailing_zeros()
    }
}

/// Flips bit `bit` of `hash` and re-hashes with SHA-256.
fn flip_and_hash(hash: &mut [u8; 32], bit: u32) {
    hash[(bit / 8) as usize] ^= 1 << (bit % 8);
    *hash = sha256::Hash::hash(&hash[..]).into_inner();
}

/// Derives the preimage at `to_index` from the preimage `from_hash` known
/// at `from_index`, walking down from `from_index`'s trailing-zero bit.
fn derive(from_hash: &[u8; 32], from_index: u64, to_index: u64) -> [u8; 32] {
    let mut hash = *from_hash;
    let start = trailing_zeros(from_index);
    for bit in (0..start).rev() {
        if to_index & (1u64 << bit) != 0 {
            flip_and_hash(&mut hash, bit);
        }
    }
    hash
}

/// Derives the preimage for `index` directly from a 32-byte master seed,
/// flipping bits from the most significant down to the least significant
/// wherever they are set in `index`. This is the counterparty-side
/// generation function: holding only `seed`, they can produce any
/// revocation preimage on demand without storing a history of them.
pub fn generate_from_seed(seed: &[u8; 32], index: u64) -> [u8; 32] {
    let mut hash = *seed;
    for bit in (0..64).rev() {
        if index & (1u64 << bit) != 0 {
            flip_and_hash(&mut hash, bit);
        }
    }
    hash
}

impl Shachain {
    /// An empty shachain, holding no preimages yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buckets currently populated.
    pub fn num_valid(&self) -> u32 {
        self.num_valid
    }

    /// Inserts the preimage for `index`, which must be strictly older
    /// (numerically smaller as a complementary index) than every index
    /// inserted so far, and consistent with every already-known hash
    /// it is supposed to be able to derive.
    pub fn add_hash(&mut self, index: u64, hash: [u8; 32]) -> Result<(), ShachainError> {
        if self.min_index_valid && index >= self.min_index {
            return Err(ShachainError::NotDescending(index, self.min_index));
        }

        let bucket = trailing_zeros(index) as usize;
        for i in 0..bucket {
            let known = match &self.known[i] {
                Some(known) => known,
                None => continue,
            };
            if derive(&hash, index, known.index) != known.hash {
                return Err(ShachainError::InconsistentHash(index));
            }
        }

        self.known[bucket] = Some(Bucket { index, hash });
        if bucket as u32 + 1 > self.num_valid {
            self.num_valid = bucket as u32 + 1;
        }
        self.min_index = index;
        self.min_index_valid = true;
        Ok(())
    }

    /// Recovers the preimage for `index` from whichever known bucket can
    /// derive it.
    pub fn get(&self, index: u64) -> Result<[u8; 32], ShachainError> {
        for slot in self.known.iter() {
            let known = match slot {
                Some(known) => known,
                None => continue,
            };
            // `known.index == 0` has 64 trailing zero bits and no bits above
            // bit 63 to compare, so it derives every index unconditionally.
            let bucket = trailing_zeros(known.index);
            let shares_upper_bits = bucket == 64 || (index >> bucket) == (known.index >> bucket);
            if shares_upper_bits {
                return Ok(derive(&known.hash, known.index, index));
            }
        }
        Err(ShachainError::NotDerivable(index))
    }

    /// Serializes to the fixed 2612-byte little-endian layout:
    /// `(u64 min_index)(u32 num_valid)(u64 index, 32-byte hash) × 65`.
    pub fn linearize(&self) -> [u8; LINEARIZED_LEN] {
        let mut buf = [0u8; LINEARIZED_LEN];
        buf[0..8].copy_from_slice(&self.min_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.num_valid.to_le_bytes());
        let mut off = 12;
        for i in 0..NUM_BUCKETS {
            if let Some(known) = &self.known[i] {
                buf[off..off + 8].copy_from_slice(&known.index.to_le_bytes());
                buf[off + 8..off + 40].copy_from_slice(&known.hash);
            }
            off += 40;
        }
        buf
    }

    /// Reconstructs a shachain from its linearized form.
    pub fn delinearize(buf: &[u8]) -> Result<Self, ShachainError> {
        if buf.len() != LINEARIZED_LEN {
            return Err(ShachainError::BadLength(buf.len()));
        }
        let min_index = u64::from_le_bytes(buf[0..8].try_into().expect("slice is 8 bytes"));
        let num_valid = u32::from_le_bytes(buf[8..12].try_into().expect("slice is 4 bytes"));
        let mut known = [None; NUM_BUCKETS];
        let mut off = 12;
        for slot in known.iter_mut() {
            let index = u64::from_le_bytes(buf[off..off + 8].try_into().expect("slice is 8 bytes"));
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&buf[off + 8..off + 40]);
            off += 40;
            // An all-zero hash is the sentinel for an unpopulated bucket; a
            // real preimage hashing to all zeroes is astronomically unlikely.
            if hash != [0u8; 32] {
                *slot = Some(Bucket { index, hash });
            }
        }
        Ok(Shachain {
            min_index,
            min_index_valid: num_valid > 0,
            num_valid,
            known,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn seed() -> [u8; 32] {
        sha256::Hash::hash(b"test shachain seed").into_inner()
    }

    #[test]
    fn single_insert_roundtrips() {
        let mut chain = Shachain::new();
        let index = 0xFFFF_FFFF_FFFF_FFFFu64;
        chain.add_hash(index, seed()).unwrap();
        assert_eq!(chain.get(index).unwrap(), seed());
    }

    #[test]
    fn descending_inserts_derive_earlier_hashes() {
        let mut chain = Shachain::new();
        let master = seed();
        let top = 0xFFFF_FFFF_FFFF_FFFFu64;
        let hash_top = generate_from_seed(&master, top);
        chain.add_hash(top, hash_top).unwrap();

        // `top - 1` is more general (one more trailing zero bit) and can
        // re-derive the already-known, more specific `top` hash.
        let hash_top_minus_1 = generate_from_seed(&master, top - 1);
        chain.add_hash(top - 1, hash_top_minus_1).unwrap();
        assert_eq!(chain.get(top - 1).unwrap(), hash_top_minus_1);
        assert_eq!(chain.get(top).unwrap(), hash_top);
    }

    #[test]
    fn non_descending_insert_rejected() {
        let mut chain = Shachain::new();
        let top = 0xFFFF_FFFF_FFFF_FFFFu64;
        chain.add_hash(top - 5, seed()).unwrap();
        let err = chain.add_hash(top - 5, seed()).unwrap_err();
        assert!(matches!(err, ShachainError::NotDescending(_, _)));
        let err = chain.add_hash(top, seed()).unwrap_err();
        assert!(matches!(err, ShachainError::NotDescending(_, _)));
    }

    #[test]
    fn inconsistent_hash_rejected() {
        let mut chain = Shachain::new();
        let master = seed();
        let top = 0xFFFF_FFFF_FFFF_FFFEu64; // trailing_zeros == 1
        chain.add_hash(top, generate_from_seed(&master, top)).unwrap();
        let bogus = sha256::Hash::hash(b"not derived from seed").into_inner();
        let err = chain.add_hash(top - 2, bogus).unwrap_err();
        assert!(matches!(err, ShachainError::InconsistentHash(_)));
    }

    #[test]
    fn unknown_index_not_derivable() {
        let chain = Shachain::new();
        let err = chain.get(42).unwrap_err();
        assert!(matches!(err, ShachainError::NotDerivable(_)));
    }

    #[test]
    fn index_zero_derives_every_index() {
        let mut chain = Shachain::new();
        let master = seed();
        chain.add_hash(0, generate_from_seed(&master, 0)).unwrap();
        for index in [1u64, 42, 0xFF, 0xFFFF_FFFF_FFFF_FFFF] {
            assert_eq!(chain.get(index).unwrap(), generate_from_seed(&master, index));
        }
    }

    #[test]
    fn linearize_roundtrip() {
        let mut chain = Shachain::new();
        let master = seed();
        let top = 0xFFFF_FFFF_FFFF_FFFFu64;
        let hash_top = generate_from_seed(&master, top);
        chain.add_hash(top, hash_top).unwrap();
        chain.add_hash(top - 1, generate_from_seed(&master, top - 1)).unwrap();

        let buf = chain.linearize();
        assert_eq!(buf.len(), LINEARIZED_LEN);
        let restored = Shachain::delinearize(&buf).unwrap();
        assert_eq!(restored.get(top).unwrap(), hash_top);
        assert_eq!(restored.get(top - 1).unwrap(), chain.get(top - 1).unwrap());
    }

    #[test]
    fn delinearize_rejects_wrong_length() {
        let err = Shachain::delinearize(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, ShachainError::BadLength(10)));
    }
}
