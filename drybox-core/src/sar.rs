//! SAR-lite: segmentation and reassembly of SDUs across the bearer MTU.
//!
//! Every PDU carries a 3-byte header `{frag_id, idx, last}` so the receive
//! path is uniform; an SDU is split only when it does not fit a single
//! bearer PDU. Within a fragment group, `idx` covers `[0..last]` exactly
//! once and `last` is identical across fragments.

use std::collections::HashMap;

use thiserror::Error;

/// Fragment header length in bytes.
pub const HEADER_LEN: usize = 3;

/// Largest number of fragments a single `frag_id` can address.
pub const MAX_FRAGMENTS: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SarError {
    #[error("SDU of {len} bytes needs more than {MAX_FRAGMENTS} fragments at mtu {mtu}")]
    OversizeSdu { len: usize, mtu: usize },

    #[error("mtu {mtu} leaves no payload room after the {HEADER_LEN}-byte header")]
    MtuTooSmall { mtu: usize },

    #[error("PDU of {len} bytes is shorter than the fragment header")]
    TruncatedPdu { len: usize },
}

/// Per-direction segmenter; `frag_id` is monotone and wraps mod 256.
#[derive(Debug, Default)]
pub struct Segmenter {
    next_frag_id: u8,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame an SDU into one or more PDUs for the given MTU.
    pub fn segment(&mut self, sdu: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, SarError> {
        if mtu <= HEADER_LEN {
            return Err(SarError::MtuTooSmall { mtu });
        }
        let capacity = mtu - HEADER_LEN;
        let frag_id = self.next_frag_id;
        self.next_frag_id = self.next_frag_id.wrapping_add(1);

        if sdu.len() <= capacity {
            let mut pdu = Vec::with_capacity(HEADER_LEN + sdu.len());
            pdu.extend_from_slice(&[frag_id, 0, 0]);
            pdu.extend_from_slice(sdu);
            return Ok(vec![pdu]);
        }

        let count = sdu.len().div_ceil(capacity);
        if count > MAX_FRAGMENTS {
            return Err(SarError::OversizeSdu {
                len: sdu.len(),
                mtu,
            });
        }
        let last = (count - 1) as u8;

        Ok(sdu
            .chunks(capacity)
            .enumerate()
            .map(|(idx, chunk)| {
                let mut pdu = Vec::with_capacity(HEADER_LEN + chunk.len());
                pdu.extend_from_slice(&[frag_id, idx as u8, last]);
                pdu.extend_from_slice(chunk);
                pdu
            })
            .collect())
    }
}

/// Outcome of feeding one PDU into the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum SarOutcome {
    /// The group completed; the reassembled SDU is returned.
    Complete(Vec<u8>),
    /// More fragments are outstanding.
    Pending,
    /// The fragment contradicted its group (`last` mismatch); the group was
    /// dropped.
    Inconsistent { frag_id: u8 },
}

#[derive(Debug)]
struct ReassemblyGroup {
    last: u8,
    received: [bool; MAX_FRAGMENTS],
    parts: Vec<Option<Vec<u8>>>,
    started_t_ms: u64,
}

impl ReassemblyGroup {
    fn new(last: u8, started_t_ms: u64) -> Self {
        Self {
            last,
            received: [false; MAX_FRAGMENTS],
            parts: vec![None; last as usize + 1],
            started_t_ms,
        }
    }

    fn is_complete(&self) -> bool {
        self.received[..=self.last as usize].iter().all(|&r| r)
    }

    fn assemble(self) -> Vec<u8> {
        self.parts.into_iter().flatten().flatten().collect()
    }
}

/// Per-direction reassembly table with logical-time expiry.
#[derive(Debug)]
pub struct Reassembler {
    groups: HashMap<u8, ReassemblyGroup>,
    rtt_est_ms: f64,
    delay_sum_ms: f64,
    delay_count: u64,
}

impl Reassembler {
    pub fn new(rtt_est_ms: f64) -> Self {
        Self {
            groups: HashMap::new(),
            rtt_est_ms,
            delay_sum_ms: 0.0,
            delay_count: 0,
        }
    }

    pub fn rtt_est_ms(&self) -> f64 {
        self.rtt_est_ms
    }

    /// Fold a measured one-way delay into the RTT estimate (RTT taken as
    /// twice the running mean one-way delay, never below the initial
    /// configuration-derived value's tick floor).
    pub fn observe_delay(&mut self, one_way_ms: f64) {
        self.delay_sum_ms += one_way_ms;
        self.delay_count += 1;
        let mean = self.delay_sum_ms / self.delay_count as f64;
        if mean > 0.0 {
            self.rtt_est_ms = 2.0 * mean;
        }
    }

    /// Expire groups older than `2 × RTT_est`; returns the purged frag_ids.
    pub fn purge_stale(&mut self, t_ms: u64) -> Vec<u8> {
        let deadline_ms = 2.0 * self.rtt_est_ms;
        let mut purged: Vec<u8> = self
            .groups
            .iter()
            .filter(|(_, group)| (t_ms.saturating_sub(group.started_t_ms)) as f64 > deadline_ms)
            .map(|(&frag_id, _)| frag_id)
            .collect();
        purged.sort_unstable();
        for frag_id in &purged {
            self.groups.remove(frag_id);
        }
        purged
    }

    /// Feed a delivered PDU into its group.
    pub fn accept(&mut self, pdu: &[u8], t_ms: u64) -> Result<SarOutcome, SarError> {
        if pdu.len() < HEADER_LEN {
            return Err(SarError::TruncatedPdu { len: pdu.len() });
        }
        let (frag_id, idx, last) = (pdu[0], pdu[1], pdu[2]);
        let payload = &pdu[HEADER_LEN..];

        let group = self
            .groups
            .entry(frag_id)
            .or_insert_with(|| ReassemblyGroup::new(last, t_ms));
        if group.last != last || idx > last {
            self.groups.remove(&frag_id);
            return Ok(SarOutcome::Inconsistent { frag_id });
        }

        group.received[idx as usize] = true;
        group.parts[idx as usize] = Some(payload.to_vec());

        if group.is_complete() {
            let group = self
                .groups
                .remove(&frag_id)
                .unwrap_or_else(|| unreachable!("group present"));
            Ok(SarOutcome::Complete(group.assemble()))
        } else {
            Ok(SarOutcome::Pending)
        }
    }

    #[cfg(test)]
    fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(sdu: &[u8], mtu: usize) -> Vec<u8> {
        let mut segmenter = Segmenter::new();
        let mut reassembler = Reassembler::new(40.0);
        let pdus = segmenter.segment(sdu, mtu).unwrap();
        let mut out = None;
        for pdu in pdus {
            if let SarOutcome::Complete(sdu) = reassembler.accept(&pdu, 0).unwrap() {
                out = Some(sdu);
            }
        }
        out.expect("group should complete")
    }

    #[test]
    fn small_sdu_is_single_fragment() {
        let mut segmenter = Segmenter::new();
        let pdus = segmenter.segment(b"PING", 64).unwrap();
        assert_eq!(pdus.len(), 1);
        assert_eq!(&pdus[0][..HEADER_LEN], &[0, 0, 0]);
        assert_eq!(&pdus[0][HEADER_LEN..], b"PING");
    }

    #[test]
    fn thousand_bytes_at_mtu_64_is_17_fragments() {
        let mut segmenter = Segmenter::new();
        let sdu = vec![0xAB; 1_000];
        let pdus = segmenter.segment(&sdu, 64).unwrap();
        assert_eq!(pdus.len(), 17);
        assert!(pdus.iter().all(|p| p[2] == 16));
        assert_eq!(roundtrip(&sdu, 64), sdu);
    }

    #[test]
    fn frag_id_wraps_mod_256() {
        let mut segmenter = Segmenter::new();
        for expected in 0..=255u8 {
            let pdus = segmenter.segment(b"x", 16).unwrap();
            assert_eq!(pdus[0][0], expected);
        }
        let pdus = segmenter.segment(b"x", 16).unwrap();
        assert_eq!(pdus[0][0], 0);
    }

    #[test]
    fn oversize_sdu_is_rejected() {
        let mut segmenter = Segmenter::new();
        let sdu = vec![0u8; 257 * 61];
        assert_eq!(
            segmenter.segment(&sdu, 64),
            Err(SarError::OversizeSdu {
                len: sdu.len(),
                mtu: 64
            })
        );
    }

    #[test]
    fn last_mismatch_drops_group() {
        let mut reassembler = Reassembler::new(40.0);
        assert_eq!(
            reassembler.accept(&[5, 0, 3, 0xAA], 0).unwrap(),
            SarOutcome::Pending
        );
        assert_eq!(
            reassembler.accept(&[5, 1, 2, 0xBB], 0).unwrap(),
            SarOutcome::Inconsistent { frag_id: 5 }
        );
        assert_eq!(reassembler.pending_groups(), 0);
    }

    #[test]
    fn stale_group_is_purged_after_twice_rtt() {
        let mut reassembler = Reassembler::new(40.0);
        reassembler.accept(&[9, 0, 1, 0x01], 100).unwrap();
        assert!(reassembler.purge_stale(160).is_empty());
        assert_eq!(reassembler.purge_stale(181), vec![9]);
        assert_eq!(reassembler.pending_groups(), 0);
    }

    #[test]
    fn observed_delays_adapt_rtt_estimate() {
        let mut reassembler = Reassembler::new(40.0);
        reassembler.observe_delay(100.0);
        reassembler.observe_delay(200.0);
        assert_eq!(reassembler.rtt_est_ms(), 300.0);
    }

    #[test]
    fn out_of_order_fragments_reassemble() {
        let mut segmenter = Segmenter::new();
        let sdu: Vec<u8> = (0..200u16).map(|v| (v & 0xFF) as u8).collect();
        let mut pdus = segmenter.segment(&sdu, 64).unwrap();
        pdus.reverse();

        let mut reassembler = Reassembler::new(40.0);
        let mut out = None;
        for pdu in pdus {
            if let SarOutcome::Complete(s) = reassembler.accept(&pdu, 0).unwrap() {
                out = Some(s);
            }
        }
        assert_eq!(out.unwrap(), sdu);
    }

    proptest! {
        #[test]
        fn lossless_roundtrip_restores_sdu(
            sdu in proptest::collection::vec(any::<u8>(), 0..4_096),
            mtu in 8usize..256,
        ) {
            let capacity = mtu - HEADER_LEN;
            prop_assume!(sdu.len() <= MAX_FRAGMENTS * capacity);
            prop_assert_eq!(roundtrip(&sdu, mtu), sdu);
        }
    }
}
