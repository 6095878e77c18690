//! Opaque FEC codec backing the fragmenter's repair fragments.
//!
//! Implemented over `reed-solomon-erasure`'s systematic Reed-Solomon code
//! (see DESIGN.md for why this replaces a rateless fountain codec) which
//! satisfies the same "any sufficient subset reconstructs the payload"
//! contract for erasure channels.
//!
//! Construction is amortized across all repair fragments for a frame:
//! `FecEncoder::new` does the one-time codec setup and shard encode,
//! `repair_shard` is then a cheap slice into the already-computed parity
//! shards.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::CoreError;

/// Encodes `num_fec` repair shards from a set of original, equal-length
/// shards. Constructed once per frame; repair shards are read out by index.
pub struct FecEncoder {
    shards: Vec<Vec<u8>>,
    num_orig: usize,
}

impl FecEncoder {
    /// `orig_shards` must all be exactly `shard_len` bytes (callers pad the
    /// last, short original fragment to `shard_len` before calling).
    pub fn new(orig_shards: &[Vec<u8>], num_fec: usize, shard_len: usize) -> Result<Self, CoreError> {
        let num_orig = orig_shards.len();
        debug_assert!(orig_shards.iter().all(|s| s.len() == shard_len));

        let rs = ReedSolomon::new(num_orig, num_fec)
            .map_err(|e| CoreError::Fatal(format!("FEC encoder construction failed: {e}")))?;

        let mut shards: Vec<Vec<u8>> = orig_shards.to_vec();
        shards.extend(std::iter::repeat(vec![0u8; shard_len]).take(num_fec));

        rs.encode(&mut shards)
            .map_err(|e| CoreError::Fatal(format!("FEC encode failed: {e}")))?;

        Ok(Self { shards, num_orig })
    }

    /// Produce the repair symbol for a global fragment `index` in
    /// `[num_orig, num_orig + num_fec)`.
    pub fn repair_shard(&self, index: usize) -> &[u8] {
        debug_assert!(index >= self.num_orig);
        &self.shards[index]
    }
}

/// Reconstructs missing original shards given any sufficient subset of
/// original + repair shards.
pub struct FecDecoder {
    rs: ReedSolomon,
}

impl FecDecoder {
    pub fn new(num_orig: usize, num_fec: usize) -> Result<Self, CoreError> {
        let rs = ReedSolomon::new(num_orig, num_fec)
            .map_err(|e| CoreError::Fatal(format!("FEC decoder construction failed: {e}")))?;
        Ok(Self { rs })
    }

    /// `shards[i]` is `Some(data)` for every received fragment at global
    /// index `i` (original or repair), `None` for missing ones. On success,
    /// every original-index slot (`< num_orig`) is filled in.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), CoreError> {
        self.rs
            .reconstruct(shards)
            .map_err(|e| CoreError::DecodeError(format!("FEC reconstruction failed: {e}")))
    }
}
