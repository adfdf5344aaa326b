//! The unreliable part of the simulated network.
//!
//! Every segment that crosses the wire, data or acknowledgment, is offered to
//! a [`LossModel`] exactly once. A dropped segment simply never arrives; the
//! retransmission timer and the cumulative ACK resend policy recover from it.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ktp::segment::Segment;
use crate::ktp::util::lock;

/// Draw a uniform value in `[0, 1)` and report whether it falls below
/// `probability`.
pub fn should_drop(probability: f64) -> bool {
    rand::rng().random::<f64>() < probability
}

pub trait LossModel: Send + Sync {
    /// Decide the fate of one transit of `segment`, given the store's current
    /// loss probability.
    fn should_drop(&self, segment: &Segment, probability: f64) -> bool;
}

/// Independent drops drawn from the thread-local generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomLoss;

impl LossModel for RandomLoss {
    fn should_drop(&self, _segment: &Segment, probability: f64) -> bool {
        should_drop(probability)
    }
}

/// Independent drops from a seeded generator, so a run can be replayed.
#[derive(Debug)]
pub struct SeededLoss {
    rng: Mutex<StdRng>,
}

impl SeededLoss {
    pub fn new(seed: u64) -> Self {
        SeededLoss {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl LossModel for SeededLoss {
    fn should_drop(&self, _segment: &Segment, probability: f64) -> bool {
        lock(&self.rng).random::<f64>() < probability
    }
}
