//! The daemon's three engine loops and the pieces they share.

pub(crate) mod reclaimer;
pub(crate) mod receiver;
pub(crate) mod sender;

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::trace;

use crate::error::SocketId;
use crate::ktp::segment::Segment;
use crate::ktp::util::lock;
use crate::loss::LossModel;
use crate::quad::Quad;
use crate::store::Shared;

/// Stop signal shared by the daemon and its engine threads.
#[derive(Clone, Default)]
pub(crate) struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn trigger(&self) {
        let (flag, var) = &*self.inner;
        *lock(flag) = true;
        var.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleep for up to `period`, returning early with `true` once triggered.
    pub fn wait(&self, period: Duration) -> bool {
        let (flag, var) = &*self.inner;
        let stopped = lock(flag);
        if *stopped {
            return true;
        }
        match var.wait_timeout_while(stopped, period, |stopped| !*stopped) {
            Ok((stopped, _)) => *stopped,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

/// Where a batch of segments comes from: the sending socket, the tenancy it
/// was read under, and its binding at that time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Origin {
    pub id: SocketId,
    pub tenancy: u64,
    pub quad: Quad,
}

/// The lossy link between two bound sockets.
#[derive(Clone)]
pub(crate) struct Wire {
    shared: Arc<Shared>,
    loss: Arc<dyn LossModel>,
}

impl Wire {
    pub fn new(shared: Arc<Shared>, loss: Arc<dyn LossModel>) -> Self {
        Wire { shared, loss }
    }

    /// Send `segments` from `from` towards its peer.
    ///
    /// Each segment is offered to the loss model before any control block is
    /// locked; survivors land in the peer's inbound queue. Returns how many
    /// arrived. Without a peer nothing arrives, and neither does anything of
    /// an origin that was closed since the segments were read.
    pub fn transmit(&self, from: Origin, segments: Vec<Segment>) -> usize {
        let (local, remote) = (from.quad.local, from.quad.remote);
        let p = self.shared.loss_probability();
        let survivors: Vec<Segment> = segments
            .into_iter()
            .filter(|s| {
                let dropped = self.loss.should_drop(s, p);
                if dropped {
                    trace!("{} -> {}: {:?} dropped", local, remote, s);
                }
                !dropped
            })
            .collect();
        if survivors.is_empty() {
            return 0;
        }

        let _routes = self.shared.routing();
        if !self.shared.is_current(from.id, from.tenancy) {
            trace!("{}: closed before its segments left", from.id);
            return 0;
        }
        match self.shared.route(from.quad) {
            Some(peer) => {
                let n = survivors.len();
                self.shared.deliver(peer, survivors);
                n
            }
            None => {
                trace!("{} -> {}: no peer bound", local, remote);
                0
            }
        }
    }

    pub fn shared(&self) -> &Shared {
        &self.shared
    }
}

/// A socket id with its binding, for log lines.
pub(crate) fn describe(id: SocketId, quad: Option<Quad>) -> String {
    match quad {
        Some(q) => format!("{} ({} -> {})", id, q.local, q.remote),
        None => format!("{} (unbound)", id),
    }
}
