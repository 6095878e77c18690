//! Packet fragmenter / FEC codec — the "hard core" of the reassembly
//! pipeline.
//!
//! A `Fragment` is the plaintext packet (the header-plus-payload region
//! `castcore-crypto` encrypts/authenticates as the ciphertext of the wire
//! datagram). `fragment_frame` / `defragment` implement the splitting and
//! FEC-assisted reassembly rules.
//!
//! The total original-payload length is carried as a 4-byte little-endian
//! prefix inside the fragmented byte stream itself (ahead of the
//! application bytes), rather than as a separate header field on the
//! last-index fragment. A structured header field cannot survive FEC
//! reconstruction (Reed-Solomon only recovers the data shard bytes, not
//! side metadata attached to a particular fragment), but a length value
//! living inside fragment 0's own data is reconstructed automatically
//! whenever fragment 0 is recovered — original or FEC path alike. This is
//! the same "prefix carries the length" idea `codec::try_decode_frame`
//! already uses for reliable framing, applied one level down.

use crate::error::CoreError;
use crate::fec::{FecDecoder, FecEncoder};
use crate::types::{FrameId, Kind};

/// Maximum bytes of application data per fragment (MTU-safe for UDP over
/// typical tunneled/VPN paths).
pub const MAX_PAYLOAD: usize = 1285;

/// Size of the fixed fragment header, in bytes: kind(4) + frame_id(4) +
/// index(2) + num_indices(2) + num_fec_indices(2) + payload_size(4) +
/// is_retransmit(1).
pub const FRAGMENT_HEADER_SIZE: usize = 4 + 4 + 2 + 2 + 2 + 4 + 1;

const LEN_PREFIX_SIZE: usize = 4;

/// A single fragment of a frame — the plaintext packet payload region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: Kind,
    pub frame_id: FrameId,
    pub index: u16,
    pub num_indices: u16,
    pub num_fec_indices: u16,
    pub payload_size: u32,
    pub is_retransmit: bool,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn num_orig(&self) -> usize {
        self.num_indices as usize - self.num_fec_indices as usize
    }

    pub fn is_fec(&self) -> bool {
        (self.index as usize) >= self.num_orig()
    }

    /// Serialize to the plaintext packet layout
    /// (all multi-byte fields little-endian).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&(self.kind as u32).to_le_bytes());
        buf.extend_from_slice(&self.frame_id.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.num_indices.to_le_bytes());
        buf.extend_from_slice(&self.num_fec_indices.to_le_bytes());
        buf.extend_from_slice(&self.payload_size.to_le_bytes());
        buf.push(self.is_retransmit as u8);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, CoreError> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return Err(CoreError::PacketTooShort {
                expected: FRAGMENT_HEADER_SIZE,
                got: buf.len(),
            });
        }
        let kind_raw = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let kind = Kind::from_u32(kind_raw)
            .ok_or_else(|| CoreError::MalformedPacket(format!("unknown kind {kind_raw}")))?;
        let frame_id = FrameId::from_le_bytes(buf[4..8].try_into().unwrap());
        let index = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let num_indices = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        let num_fec_indices = u16::from_le_bytes(buf[12..14].try_into().unwrap());
        let payload_size = u32::from_le_bytes(buf[14..18].try_into().unwrap());
        let is_retransmit = buf[18] != 0;
        let data = buf[FRAGMENT_HEADER_SIZE..].to_vec();

        if index >= num_indices {
            return Err(CoreError::MalformedPacket(format!(
                "index {index} >= num_indices {num_indices}"
            )));
        }
        if payload_size as usize != data.len() {
            return Err(CoreError::MalformedPacket(format!(
                "payload_size {payload_size} != data len {}",
                data.len()
            )));
        }
        if data.len() > MAX_PAYLOAD {
            return Err(CoreError::MalformedPacket(format!(
                "payload {} exceeds MAX_PAYLOAD {MAX_PAYLOAD}",
                data.len()
            )));
        }

        Ok(Self {
            kind,
            frame_id,
            index,
            num_indices,
            num_fec_indices,
            payload_size,
            is_retransmit,
            data,
        })
    }
}

/// Split `payload` into fixed-size original fragments plus FEC repair
/// fragments.
///
/// `fragment_size` is `S`; `fec_ratio` is `rho in [0, 0.7]`.
pub fn fragment_frame(
    payload: &[u8],
    kind: Kind,
    frame_id: FrameId,
    fragment_size: usize,
    fec_ratio: f64,
    is_retransmit: bool,
) -> Result<Vec<Fragment>, CoreError> {
    if !(0.0..=0.7).contains(&fec_ratio) {
        return Err(CoreError::MalformedPacket(format!(
            "fec_ratio {fec_ratio} out of range [0, 0.7]"
        )));
    }
    if fragment_size == 0 || fragment_size > MAX_PAYLOAD {
        return Err(CoreError::MalformedPacket(format!(
            "fragment_size {fragment_size} out of range (0, {MAX_PAYLOAD}]"
        )));
    }

    // Prefix the total length so it survives FEC reconstruction as part of
    // fragment 0's own data (see module doc comment).
    let mut prefixed = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len());
    prefixed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    prefixed.extend_from_slice(payload);

    let n = prefixed.len();
    let num_orig = n.div_ceil(fragment_size).max(1);
    let num_fec = if fec_ratio == 0.0 {
        0
    } else {
        ((num_orig as f64 * fec_ratio) / (1.0 - fec_ratio)).ceil() as usize
    };
    let num_total = num_orig + num_fec;
    if num_total > u16::MAX as usize {
        return Err(CoreError::ResourceExhausted(format!(
            "frame would require {num_total} fragments"
        )));
    }

    // Padded shards (fixed `fragment_size`) feed the FEC matrix; the
    // fragments we actually emit for original indices carry only the real
    // (possibly short) byte count.
    let mut padded_shards: Vec<Vec<u8>> = Vec::with_capacity(num_orig);
    let mut real_lens: Vec<usize> = Vec::with_capacity(num_orig);
    for i in 0..num_orig {
        let start = i * fragment_size;
        let end = (start + fragment_size).min(n);
        let mut shard = prefixed[start..end].to_vec();
        real_lens.push(shard.len());
        shard.resize(fragment_size, 0);
        padded_shards.push(shard);
    }

    let mut fragments = Vec::with_capacity(num_total);
    for i in 0..num_orig {
        fragments.push(Fragment {
            kind,
            frame_id,
            index: i as u16,
            num_indices: num_total as u16,
            num_fec_indices: num_fec as u16,
            payload_size: real_lens[i] as u32,
            is_retransmit,
            data: padded_shards[i][..real_lens[i]].to_vec(),
        });
    }

    if num_fec > 0 {
        let encoder = FecEncoder::new(&padded_shards, num_fec, fragment_size)?;
        for i in 0..num_fec {
            let global_index = num_orig + i;
            fragments.push(Fragment {
                kind,
                frame_id,
                index: global_index as u16,
                num_indices: num_total as u16,
                num_fec_indices: num_fec as u16,
                payload_size: fragment_size as u32,
                is_retransmit,
                data: encoder.repair_shard(global_index).to_vec(),
            });
        }
    }

    Ok(fragments)
}

/// Reassemble the original payload from a set of received fragments
/// belonging to one frame. `received[i]` corresponds to global index `i`.
///
/// Implements the completion rule: direct path when all originals are
/// present, FEC path when `num_original_received + num_fec_received >=
/// num_orig`.
pub fn defragment(
    received: &[Option<Fragment>],
    num_orig: usize,
    num_fec: usize,
    fragment_size: usize,
) -> Result<Vec<u8>, CoreError> {
    if received.len() != num_orig + num_fec {
        return Err(CoreError::MalformedPacket(
            "received slice length does not match num_orig + num_fec".into(),
        ));
    }

    let num_original_received = received[..num_orig].iter().filter(|f| f.is_some()).count();

    let prefixed = if num_original_received == num_orig {
        let mut out = Vec::new();
        for frag in &received[..num_orig] {
            out.extend_from_slice(&frag.as_ref().unwrap().data);
        }
        out
    } else {
        let num_fec_received = received[num_orig..].iter().filter(|f| f.is_some()).count();
        if num_original_received + num_fec_received < num_orig {
            return Err(CoreError::ResourceExhausted(format!(
                "only {} of {} fragments received",
                num_original_received + num_fec_received,
                num_orig
            )));
        }

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(num_orig + num_fec);
        for frag in &received[..num_orig] {
            shards.push(frag.as_ref().map(|f| {
                let mut v = f.data.clone();
                v.resize(fragment_size, 0);
                v
            }));
        }
        for frag in &received[num_orig..] {
            shards.push(frag.as_ref().map(|f| f.data.clone()));
        }

        let decoder = FecDecoder::new(num_orig, num_fec)?;
        decoder.reconstruct(&mut shards)?;

        let mut out = Vec::with_capacity(num_orig * fragment_size);
        for shard in shards.into_iter().take(num_orig) {
            out.extend_from_slice(&shard.expect("reconstructed original shard"));
        }
        out
    };

    if prefixed.len() < LEN_PREFIX_SIZE {
        return Err(CoreError::MalformedPacket("reassembled frame shorter than length prefix".into()));
    }
    let total_len = u32::from_le_bytes(prefixed[0..4].try_into().unwrap()) as usize;
    if LEN_PREFIX_SIZE + total_len > prefixed.len() {
        return Err(CoreError::MalformedPacket("declared frame length exceeds reassembled bytes".into()));
    }

    Ok(prefixed[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + total_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn sample_payload(n: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..n).map(|_| rng.gen()).collect()
    }

    #[test]
    fn header_roundtrip() {
        let frag = Fragment {
            kind: Kind::Video,
            frame_id: 42,
            index: 3,
            num_indices: 10,
            num_fec_indices: 2,
            payload_size: 5,
            is_retransmit: true,
            data: vec![1, 2, 3, 4, 5],
        };
        let bytes = frag.to_bytes();
        let decoded = Fragment::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, frag);
    }

    #[test]
    fn rejects_index_out_of_range() {
        let frag = Fragment {
            kind: Kind::Audio,
            frame_id: 1,
            index: 5,
            num_indices: 5,
            num_fec_indices: 0,
            payload_size: 0,
            is_retransmit: false,
            data: vec![],
        };
        let bytes = frag.to_bytes();
        assert!(Fragment::from_bytes(&bytes).is_err());
    }

    #[test]
    fn s1_perfect_channel_no_fec_needed() {
        let payload = sample_payload(64 * 1024);
        let frags = fragment_frame(&payload, Kind::Video, 1, 1280, 0.2, false).unwrap();
        let num_fec = frags[0].num_fec_indices as usize;
        let num_orig = frags[0].num_orig();

        let received: Vec<Option<Fragment>> = frags.into_iter().map(Some).collect();
        let out = defragment(&received, num_orig, num_fec, 1280).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn s2_30_percent_random_loss_recovers_via_fec() {
        let payload = sample_payload(64 * 1024);
        let frags = fragment_frame(&payload, Kind::Video, 2, 1280, 0.2, false).unwrap();
        let num_fec = frags[0].num_fec_indices as usize;
        let num_orig = frags[0].num_orig();

        let mut received: Vec<Option<Fragment>> = frags.into_iter().map(Some).collect();
        let mut rng = rand::thread_rng();
        let mut indices: Vec<usize> = (0..received.len()).collect();
        indices.shuffle(&mut rng);
        let drop_count = (received.len() * 3) / 10;
        for &i in indices.iter().take(drop_count) {
            received[i] = None;
        }

        let out = defragment(&received, num_orig, num_fec, 1280).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn s3_burst_loss_of_all_originals_recovers_if_fec_sufficient() {
        let payload = sample_payload(10 * 1280); // num_orig = 10
        // rho chosen so num_fec >= num_orig
        let frags = fragment_frame(&payload, Kind::Video, 3, 1280, 0.55, false).unwrap();
        let num_fec = frags[0].num_fec_indices as usize;
        let num_orig = frags[0].num_orig();
        assert!(num_fec >= num_orig, "test setup requires num_fec >= num_orig");

        let mut received: Vec<Option<Fragment>> = frags.into_iter().map(Some).collect();
        for i in 0..num_orig {
            received[i] = None;
        }
        let out = defragment(&received, num_orig, num_fec, 1280).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn s3_burst_loss_fails_cleanly_when_fec_insufficient() {
        let payload = sample_payload(10 * 1280);
        let frags = fragment_frame(&payload, Kind::Video, 4, 1280, 0.2, false).unwrap();
        let num_fec = frags[0].num_fec_indices as usize;
        let num_orig = frags[0].num_orig();
        assert!(num_fec < num_orig, "test setup requires num_fec < num_orig");

        let mut received: Vec<Option<Fragment>> = frags.into_iter().map(Some).collect();
        for i in 0..num_orig {
            received[i] = None;
        }
        assert!(defragment(&received, num_orig, num_fec, 1280).is_err());
    }

    #[test]
    fn s4_reordered_with_duplicates_completes_once() {
        let payload = sample_payload(8 * 1280);
        let frags = fragment_frame(&payload, Kind::Video, 5, 1280, 0.0, false).unwrap();
        let num_orig = frags[0].num_orig();

        let mut received: Vec<Option<Fragment>> = vec![None; frags.len()];
        // deliver in reverse, each "duplicate" is just re-inserting the same value
        for frag in frags.iter().rev() {
            let idx = frag.index as usize;
            received[idx] = Some(frag.clone());
            received[idx] = Some(frag.clone()); // duplicate write is idempotent
        }

        let out = defragment(&received, num_orig, 0, 1280).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn round_trip_law_across_ratios_and_sizes() {
        for &rho in &[0.0, 0.2, 0.5, 0.7] {
            for &s in &[64usize, 512, MAX_PAYLOAD] {
                let payload = sample_payload(3000);
                let frags = fragment_frame(&payload, Kind::Audio, 10, s, rho, false).unwrap();
                let num_fec = frags[0].num_fec_indices as usize;
                let num_orig = frags[0].num_orig();
                let received: Vec<Option<Fragment>> = frags.into_iter().map(Some).collect();
                let out = defragment(&received, num_orig, num_fec, s).unwrap();
                assert_eq!(out, payload, "rho={rho} s={s}");
            }
        }
    }

    #[test]
    fn empty_payload_still_fragments() {
        let frags = fragment_frame(&[], Kind::Message, 1, 128, 0.0, false).unwrap();
        assert_eq!(frags.len(), 1);
        let num_orig = frags[0].num_orig();
        let received: Vec<Option<Fragment>> = frags.into_iter().map(Some).collect();
        let out = defragment(&received, num_orig, 0, 128).unwrap();
        assert!(out.is_empty());
    }
}
