use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tracing::trace;
use crate::protocol::ReliableProtocol;
use crate::util::clock::ManualClock;

/// Probabilities for the faults a [LossyLink] injects, per frame
#[derive(Clone, Copy, Debug, Default)]
pub struct Faults {
    /// the frame is dropped
    pub loss: f64,
    /// the frame arrives twice
    pub duplication: f64,
    /// the frame is held back for a step, arriving after frames that were sent later
    pub delay: f64,
}

/// A simulated network between two [ReliableProtocol] instances that share a [ManualClock]. The
///  link is driven in discrete steps, and fault injection is based on a seeded random number
///  generator, so a given seed always produces the same run.
pub struct LossyLink {
    rng: StdRng,
    faults: Faults,
    clock: ManualClock,
    pub a: ReliableProtocol,
    pub b: ReliableProtocol,
    a_to_b: Vec<Bytes>,
    b_to_a: Vec<Bytes>,
}

impl LossyLink {
    pub fn new(seed: u64, faults: Faults, retry_interval: Duration) -> LossyLink {
        let clock = ManualClock::new();
        LossyLink {
            rng: StdRng::seed_from_u64(seed),
            faults,
            a: ReliableProtocol::with_retry_interval(Arc::new(clock.clone()), retry_interval),
            b: ReliableProtocol::with_retry_interval(Arc::new(clock.clone()), retry_interval),
            clock,
            a_to_b: Vec::new(),
            b_to_a: Vec::new(),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Move all frames that are ready for sending onto the wire, deliver frames that are not
    ///  held back, then advance the clock by `tick` and let both sides re-send.
    pub fn step(&mut self, tick: Duration) {
        Self::transmit(&mut self.rng, &self.faults, &mut self.a, &mut self.a_to_b);
        Self::transmit(&mut self.rng, &self.faults, &mut self.b, &mut self.b_to_a);

        Self::deliver(&mut self.rng, &self.faults, &mut self.a_to_b, &mut self.b);
        Self::deliver(&mut self.rng, &self.faults, &mut self.b_to_a, &mut self.a);

        self.clock.advance(tick);
        self.a.update();
        self.b.update();
    }

    /// true if neither side has anything left to send, to re-send or to deliver on the wire
    pub fn is_quiescent(&self) -> bool {
        self.a.waiting_send_count() == 0
            && self.b.waiting_send_count() == 0
            && self.a.send_ready_count() == 0
            && self.b.send_ready_count() == 0
            && self.a_to_b.is_empty()
            && self.b_to_a.is_empty()
    }

    fn transmit(rng: &mut StdRng, faults: &Faults, sender: &mut ReliableProtocol, wire: &mut Vec<Bytes>) {
        while let Some(frame) = sender.pop_send_ready() {
            if rng.gen_bool(faults.loss) {
                trace!("losing frame {:?}", frame);
                continue;
            }
            if rng.gen_bool(faults.duplication) {
                trace!("duplicating frame {:?}", frame);
                wire.push(frame.clone());
            }
            wire.push(frame);
        }
    }

    fn deliver(rng: &mut StdRng, faults: &Faults, wire: &mut Vec<Bytes>, receiver: &mut ReliableProtocol) {
        let mut held_back = Vec::new();
        for frame in wire.drain(..) {
            if rng.gen_bool(faults.delay) {
                held_back.push(frame);
            }
            else {
                receiver.feed(frame);
            }
        }
        *wire = held_back;
    }
}

/// drain all messages that are ready for delivery
pub fn read_all(protocol: &mut ReliableProtocol) -> Vec<Bytes> {
    let mut result = Vec::new();
    while let Some(chunk) = protocol.read_chunk() {
        result.push(chunk);
    }
    result
}
