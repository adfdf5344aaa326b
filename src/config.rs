use std::time::Duration;

use crate::error::{Error, Result};

pub const MAX_SOCKETS: usize = 2;
pub const WINDOW_SIZE: usize = 10;
pub const MESSAGE_SIZE: usize = 512;
/// Retransmission timeout `T`.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(2);
/// Default drop probability `P`.
pub const LOSS_PROBABILITY: f64 = 0.1;
pub const TICK: Duration = Duration::from_millis(10);
pub const RECLAIM_INTERVAL: Duration = Duration::from_secs(1);

/// Sequence numbers live in a cycle of 256; a selective-repeat window may
/// cover at most half of it.
pub const MAX_WINDOW_SIZE: usize = 128;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub max_sockets: usize,
    /// `W`, in segments, for both the send and the receive window.
    pub window_size: usize,
    /// Largest payload carried by one segment.
    pub message_size: usize,
    pub retransmit_timeout: Duration,
    /// Initial process-wide loss probability.
    pub loss_probability: f64,
    /// How long the sender and receiver engines sleep between sweeps.
    pub tick: Duration,
    pub reclaim_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_sockets: MAX_SOCKETS,
            window_size: WINDOW_SIZE,
            message_size: MESSAGE_SIZE,
            retransmit_timeout: RETRANSMIT_TIMEOUT,
            loss_probability: LOSS_PROBABILITY,
            tick: TICK,
            reclaim_interval: RECLAIM_INTERVAL,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_sockets == 0 {
            return Err(Error::InvalidConfig("max_sockets must be at least 1"));
        }
        if self.window_size == 0 || self.window_size > MAX_WINDOW_SIZE {
            return Err(Error::InvalidConfig("window_size must be in 1..=128"));
        }
        if self.message_size == 0 {
            return Err(Error::InvalidConfig("message_size must be at least 1"));
        }
        if self.retransmit_timeout.is_zero() || self.tick.is_zero() || self.reclaim_interval.is_zero()
        {
            return Err(Error::InvalidConfig("timeouts and intervals must be non-zero"));
        }
        validate_probability(self.loss_probability)
    }
}

pub(crate) fn validate_probability(p: f64) -> Result<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(Error::InvalidConfig("loss probability must be in [0, 1]"))
    }
}
