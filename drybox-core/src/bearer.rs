//! Stochastic bearer: latency, jitter, loss, and reordering on PDUs.
//!
//! Each enqueued PDU first survives a loss draw, then receives a delivery
//! time of `latency + uniform(-jitter, +jitter)` clamped to enqueue time.
//! A reorder draw adds a second, opposite-signed jitter offset so the PDU
//! can overtake (or be overtaken by) a neighbor. Delivery drains everything
//! scheduled at or before the current tick in scheduled-time order; ties go
//! to enqueue order unless a PDU is marked reordered, in which case it
//! overtakes its tied neighbors.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::BearerParams;

/// A PDU sitting in the bearer queue.
#[derive(Debug, Clone)]
struct InFlightPdu {
    payload: Vec<u8>,
    enqueue_t_ms: u64,
    delivery_t_ms: f64,
    seq: u64,
    reordered: bool,
}

impl PartialEq for InFlightPdu {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for InFlightPdu {}

impl Ord for InFlightPdu {
    // Reversed so the BinaryHeap pops the earliest delivery first. Ties go
    // to enqueue order, except that a PDU marked reordered is exempt: it
    // pops ahead of tied unmarked neighbors, and among marked PDUs the
    // later enqueue wins, so a marked PDU can overtake on an exact tie.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .delivery_t_ms
            .total_cmp(&self.delivery_t_ms)
            .then_with(|| self.reordered.cmp(&other.reordered))
            .then_with(|| {
                if self.reordered {
                    self.seq.cmp(&other.seq)
                } else {
                    other.seq.cmp(&self.seq)
                }
            })
    }
}

impl PartialOrd for InFlightPdu {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What happened to a PDU at enqueue time. A dropped PDU hands its payload
/// back so the caller can record it in the capture file.
#[derive(Debug, PartialEq)]
pub enum BearerVerdict {
    Enqueued { delivery_t_ms: f64, reordered: bool },
    Dropped(Vec<u8>),
}

/// A PDU handed back by [`Bearer::drain_due`].
#[derive(Debug)]
pub struct DeliveredPdu {
    pub payload: Vec<u8>,
    pub enqueue_t_ms: u64,
    pub delivery_t_ms: f64,
    pub reordered: bool,
}

impl DeliveredPdu {
    pub fn one_way_delay_ms(&self) -> f64 {
        self.delivery_t_ms - self.enqueue_t_ms as f64
    }
}

/// One direction's bearer queue.
#[derive(Debug)]
pub struct Bearer {
    params: BearerParams,
    rng: ChaCha8Rng,
    queue: BinaryHeap<InFlightPdu>,
    next_seq: u64,
}

impl Bearer {
    pub fn new(params: BearerParams, rng: ChaCha8Rng) -> Self {
        Self {
            params,
            rng,
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn mtu_bytes(&self) -> usize {
        self.params.mtu_bytes
    }

    fn jitter_draw(&mut self) -> f64 {
        if self.params.jitter_ms > 0.0 {
            self.rng
                .gen_range(-self.params.jitter_ms..=self.params.jitter_ms)
        } else {
            0.0
        }
    }

    /// Subject one PDU to the impairment model and queue it for delivery.
    pub fn enqueue(&mut self, payload: Vec<u8>, t_ms: u64) -> BearerVerdict {
        let loss_draw: f64 = self.rng.gen();
        if loss_draw < self.params.loss_rate {
            return BearerVerdict::Dropped(payload);
        }

        let mut delay = (self.params.latency_ms + self.jitter_draw()).max(0.0);

        // The mark exempts the PDU from enqueue-order tie-breaking, so it
        // only applies when a jitter offset exists to move it; with zero
        // jitter, delivery order stays the enqueue order.
        let reorder_draw: f64 = self.rng.gen();
        let reordered = reorder_draw < self.params.reorder_rate && self.params.jitter_ms > 0.0;
        if reordered {
            delay = (delay - self.jitter_draw()).max(0.0);
        }

        let delivery_t_ms = t_ms as f64 + delay;
        self.queue.push(InFlightPdu {
            payload,
            enqueue_t_ms: t_ms,
            delivery_t_ms,
            seq: self.next_seq,
            reordered,
        });
        self.next_seq += 1;

        BearerVerdict::Enqueued {
            delivery_t_ms,
            reordered,
        }
    }

    /// Pop every PDU whose delivery time has arrived.
    pub fn drain_due(&mut self, t_ms: u64) -> Vec<DeliveredPdu> {
        let mut due = Vec::new();
        while let Some(head) = self.queue.peek() {
            if head.delivery_t_ms > t_ms as f64 {
                break;
            }
            let pdu = self
                .queue
                .pop()
                .unwrap_or_else(|| unreachable!("peeked entry pops"));
            due.push(DeliveredPdu {
                payload: pdu.payload,
                enqueue_t_ms: pdu.enqueue_t_ms,
                delivery_t_ms: pdu.delivery_t_ms,
                reordered: pdu.reordered,
            });
        }
        due
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn bearer(params: BearerParams) -> Bearer {
        Bearer::new(params, ChaCha8Rng::seed_from_u64(42))
    }

    #[test]
    fn ideal_bearer_delivers_in_enqueue_order() {
        let mut bearer = bearer(BearerParams::default());
        for i in 0..10u8 {
            assert!(matches!(
                bearer.enqueue(vec![i], 100),
                BearerVerdict::Enqueued { .. }
            ));
        }
        let delivered = bearer.drain_due(100);
        let order: Vec<u8> = delivered.iter().map(|p| p.payload[0]).collect();
        assert_eq!(order, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn delivery_never_precedes_enqueue() {
        let params = BearerParams {
            latency_ms: 5.0,
            jitter_ms: 20.0,
            reorder_rate: 0.5,
            ..BearerParams::default()
        };
        let mut bearer = bearer(params);
        for _ in 0..200 {
            match bearer.enqueue(vec![0], 500) {
                BearerVerdict::Enqueued { delivery_t_ms, .. } => {
                    assert!(delivery_t_ms >= 500.0)
                }
                BearerVerdict::Dropped(_) => panic!("loss disabled"),
            }
        }
    }

    #[test]
    fn reordered_pdus_are_exempt_from_enqueue_order_ties() {
        let pdu = |seq, reordered| InFlightPdu {
            payload: Vec::new(),
            enqueue_t_ms: 0,
            delivery_t_ms: 10.0,
            seq,
            reordered,
        };
        // Greater pops first from the heap.
        assert!(pdu(1, true) > pdu(0, false), "marked PDU overtakes a tied neighbor");
        assert!(pdu(0, false) > pdu(1, false), "unmarked ties keep enqueue order");
        assert!(pdu(4, true) > pdu(3, true), "marked ties let the newcomer overtake");
    }

    #[test]
    fn full_loss_drops_everything() {
        let params = BearerParams {
            loss_rate: 1.0,
            ..BearerParams::default()
        };
        let mut bearer = bearer(params);
        for _ in 0..50 {
            assert_eq!(bearer.enqueue(vec![1], 0), BearerVerdict::Dropped(vec![1]));
        }
        assert_eq!(bearer.in_flight(), 0);
    }

    #[test]
    fn zero_loss_drops_nothing() {
        let mut bearer = bearer(BearerParams::default());
        for _ in 0..50 {
            assert!(matches!(
                bearer.enqueue(vec![1], 0),
                BearerVerdict::Enqueued { .. }
            ));
        }
        assert_eq!(bearer.in_flight(), 50);
    }

    #[test]
    fn latency_holds_pdus_until_due() {
        let params = BearerParams {
            latency_ms: 40.0,
            ..BearerParams::default()
        };
        let mut bearer = bearer(params);
        bearer.enqueue(vec![7], 0);
        assert!(bearer.drain_due(20).is_empty());
        let delivered = bearer.drain_due(40);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].one_way_delay_ms(), 40.0);
    }

    #[test]
    fn same_seed_same_schedule() {
        let params = BearerParams {
            latency_ms: 10.0,
            jitter_ms: 8.0,
            loss_rate: 0.2,
            reorder_rate: 0.2,
            ..BearerParams::default()
        };
        let mut a = bearer(params.clone());
        let mut b = bearer(params);
        for t in 0..100 {
            let va = a.enqueue(vec![0], t);
            let vb = b.enqueue(vec![0], t);
            assert_eq!(va, vb);
        }
    }
}
