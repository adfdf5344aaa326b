use std::collections::VecDeque;

use log::{debug, trace};

use super::available::Available;
use super::receive_queue::ReceiveQueue;
use super::segment::{Segment, SegmentKind};
use super::seq_space::{Admission, RecvWindow, SendWindow};
use crate::quad::Quad;

/// Per-tenancy counters of one socket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// data segments put on the wire for the first time
    pub transmitted: u64,
    /// data segments put on the wire again after a timeout
    pub retransmitted: u64,
    /// acknowledgments received from the peer
    pub acks_received: u64,
    /// data segments handed to the application in order
    pub delivered: u64,
    /// inbound data segments dropped as duplicates or out of window
    pub discarded: u64,
}

impl SocketStats {
    /// Transmissions per data segment, the figure of merit of a lossy run.
    pub fn transmissions_per_segment(&self) -> f64 {
        if self.transmitted == 0 {
            0.0
        } else {
            (self.transmitted + self.retransmitted) as f64 / self.transmitted as f64
        }
    }
}

/// Socket Control Block: everything the daemon and the clients share about
/// one socket. Always accessed under its slot's mutex.
pub(crate) struct ControlBlock {
    pub is_free: bool,
    pub owner: u32,
    /// Bumped on every `claim`, so that work started against one tenant is
    /// never applied to the next.
    pub tenancy: u64,
    pub quad: Option<Quad>,

    pub send: SendWindow,
    pub recv: RecvWindow,

    /// delivered, in-order segments not yet consumed by `receive`; at most W
    pub incoming: ReceiveQueue,
    /// segments in transit towards this socket, not yet seen by the receiver engine
    pub inbound: VecDeque<Segment>,
    /// window carried by the last acknowledgment this socket produced
    pub last_rwnd: usize,

    pub stats: SocketStats,
}

impl ControlBlock {
    pub fn new(window_size: usize) -> Self {
        ControlBlock {
            is_free: true,
            owner: 0,
            tenancy: 0,
            quad: None,
            send: SendWindow::new(window_size),
            recv: RecvWindow::new(window_size),
            incoming: ReceiveQueue::new(window_size),
            inbound: VecDeque::new(),
            last_rwnd: window_size,
            stats: SocketStats::default(),
        }
    }

    pub fn claim(&mut self, owner: u32) {
        self.release();
        self.is_free = false;
        self.owner = owner;
        self.tenancy = self.tenancy.wrapping_add(1);
    }

    /// Reset to the free state. Nothing of the previous tenant survives
    /// except the tenancy counter.
    pub fn release(&mut self) {
        self.is_free = true;
        self.owner = 0;
        self.quad = None;
        self.send.reset();
        self.recv.reset();
        self.incoming.clear();
        self.inbound.clear();
        self.last_rwnd = self.recv.rwnd();
        self.stats = SocketStats::default();
    }

    pub fn availability(&self) -> Available {
        let mut a = Available::empty();
        if !self.incoming.is_empty() {
            a |= Available::READ;
        }
        if !self.send.is_full() {
            a |= Available::WRITE;
        }
        if self.send.is_empty() {
            a |= Available::FLUSHED;
        }
        a
    }

    /// Process one segment that survived the wire.
    ///
    /// Returns the acknowledgment to send back to the peer, if any.
    pub fn on_segment(&mut self, segment: Segment) -> Option<Segment> {
        match segment.kind() {
            SegmentKind::Ack => {
                self.stats.acks_received += 1;
                let retired = self.send.on_ack(segment.seq(), segment.rwnd());
                if retired > 0 {
                    debug!(
                        "ack {} retired {} segment(s); base {} next {}",
                        segment.seq(),
                        retired,
                        self.send.base,
                        self.send.next_seq
                    );
                }
                None
            }
            SegmentKind::Data => {
                let seq = segment.seq();
                let admission = self.recv.admit(segment);
                let delivered = self.pull();
                trace!("data seq {} -> {:?}, {} delivered", seq, admission, delivered);
                match admission {
                    Admission::OutOfWindow | Admission::Duplicate => {
                        self.stats.discarded += 1;
                        Some(self.ack())
                    }
                    Admission::Buffered if delivered > 0 => Some(self.ack()),
                    Admission::Buffered => None,
                }
            }
        }
    }

    /// Move every segment contiguous with the receive base into the
    /// application queue, as far as it has room. Returns how many moved.
    pub fn pull(&mut self) -> usize {
        let mut moved = 0;
        while !self.incoming.is_full() {
            let Some(segment) = self.recv.pop_ready() else {
                break;
            };
            self.incoming.push(segment);
            moved += 1;
        }
        self.stats.delivered += moved as u64;
        moved
    }

    /// Acknowledgment to send after the application made room, if any.
    ///
    /// Held segments that now fit are delivered and acknowledged. A window
    /// that reopens from zero is announced even if nothing moved.
    pub fn window_update(&mut self) -> Option<Segment> {
        let moved = self.pull();
        if moved > 0 || (self.last_rwnd == 0 && self.advertised() > 0) {
            Some(self.ack())
        } else {
            None
        }
    }

    /// Window offered to the peer: free reorder slots, capped by the room
    /// left in the application queue.
    pub fn advertised(&self) -> usize {
        self.recv.rwnd().min(self.incoming.free())
    }

    /// Cumulative acknowledgment for the current receive state.
    pub fn ack(&mut self) -> Segment {
        let rwnd = self.advertised();
        self.last_rwnd = rwnd;
        Segment::ack(self.recv.base, rwnd as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_block(w: usize) -> ControlBlock {
        let mut cb = ControlBlock::new(w);
        cb.claim(42);
        cb
    }

    #[test]
    fn claim_stamps_owner_and_bumps_tenancy() {
        let mut cb = ControlBlock::new(3);
        assert!(cb.is_free);
        cb.claim(7);
        assert!(!cb.is_free);
        assert_eq!(cb.owner, 7);
        assert_eq!(cb.tenancy, 1);
        cb.release();
        cb.claim(8);
        assert_eq!(cb.tenancy, 2);
    }

    #[test]
    fn release_leaves_nothing_behind() {
        let mut cb = open_block(3);
        cb.send.push(b"pending");
        cb.on_segment(Segment::data(0, b"delivered"));
        cb.on_segment(Segment::data(2, b"buffered"));
        cb.inbound.push_back(Segment::data(1, b"in transit"));

        cb.release();
        cb.claim(43);
        assert!(cb.send.is_empty());
        assert_eq!(cb.send.next_seq, 0);
        assert_eq!(cb.recv.base, 0);
        assert_eq!(cb.recv.size(), 0);
        assert_eq!(cb.advertised(), 3);
        assert!(cb.incoming.is_empty());
        assert!(cb.inbound.is_empty());
        assert_eq!(cb.stats, SocketStats::default());
    }

    #[test]
    fn in_order_data_is_acked_with_new_base() {
        let mut cb = open_block(3);
        let ack = cb.on_segment(Segment::data(0, b"hi")).unwrap();
        assert!(ack.is_ack());
        assert_eq!(ack.seq(), 1);
        // one queue slot taken until the application reads
        assert_eq!(ack.rwnd(), 2);
        assert_eq!(cb.incoming.read(usize::MAX), b"hi");
        assert_eq!(cb.stats.delivered, 1);
    }

    #[test]
    fn out_of_order_data_buffers_silently() {
        let mut cb = open_block(3);
        assert!(cb.on_segment(Segment::data(1, b"b")).is_none());
        assert!(cb.incoming.is_empty());
        assert_eq!(cb.ack().rwnd(), 2);
    }

    #[test]
    fn duplicate_data_resends_current_ack() {
        let mut cb = open_block(3);
        cb.on_segment(Segment::data(0, b"a"));
        let ack = cb.on_segment(Segment::data(0, b"a")).unwrap();
        assert_eq!(ack.seq(), 1);
        assert_eq!(cb.incoming.bytes(), 1);
        assert_eq!(cb.stats.discarded, 1);

        cb.on_segment(Segment::data(2, b"c"));
        let ack = cb.on_segment(Segment::data(2, b"c")).unwrap();
        assert_eq!(ack.seq(), 1);
        assert_eq!(ack.rwnd(), 2);
    }

    #[test]
    fn one_ack_per_contiguous_run() {
        let mut cb = open_block(4);
        cb.on_segment(Segment::data(2, b"c"));
        cb.on_segment(Segment::data(1, b"b"));
        let ack = cb.on_segment(Segment::data(0, b"a")).unwrap();
        assert_eq!(ack.seq(), 3);
        assert_eq!(ack.rwnd(), 1);
        assert_eq!(cb.incoming.read(usize::MAX), b"abc");
        assert_eq!(cb.stats.delivered, 3);
    }

    #[test]
    fn unread_data_closes_the_window() {
        let mut cb = open_block(3);
        for seq in 0..3 {
            cb.on_segment(Segment::data(seq, &[seq]));
        }
        assert!(cb.incoming.is_full());
        assert_eq!(cb.ack().rwnd(), 0);

        // the next segment is held, not delivered and not acknowledged
        assert!(cb.on_segment(Segment::data(3, b"held")).is_none());
        assert_eq!(cb.recv.base, 3);
        assert_eq!(cb.incoming.bytes(), 3);
        // its retransmission is told the window is still shut
        let ack = cb.on_segment(Segment::data(3, b"held")).unwrap();
        assert_eq!((ack.seq(), ack.rwnd()), (3, 0));
        assert!(cb.window_update().is_none());

        assert_eq!(cb.incoming.read(1), [0]);
        let ack = cb.window_update().unwrap();
        assert_eq!((ack.seq(), ack.rwnd()), (4, 0));
        assert_eq!(cb.stats.delivered, 4);
        cb.recv.check_invariant();
    }

    #[test]
    fn reopened_window_is_announced_once() {
        let mut cb = open_block(2);
        cb.on_segment(Segment::data(0, b"a"));
        cb.on_segment(Segment::data(1, b"b"));
        assert_eq!(cb.last_rwnd, 0);

        cb.incoming.read(1);
        let ack = cb.window_update().unwrap();
        assert_eq!((ack.seq(), ack.rwnd()), (2, 1));
        assert!(cb.window_update().is_none());
    }

    #[test]
    fn ack_retires_and_reports_write_availability() {
        let mut cb = open_block(2);
        cb.send.push(b"a");
        cb.send.push(b"b");
        assert!(!cb.availability().contains(Available::WRITE));

        assert!(cb.on_segment(Segment::ack(1, 2)).is_none());
        let a = cb.availability();
        assert!(a.contains(Available::WRITE));
        assert!(!a.contains(Available::FLUSHED));

        cb.on_segment(Segment::ack(2, 2));
        assert!(cb.availability().contains(Available::FLUSHED));
        assert_eq!(cb.stats.acks_received, 2);
    }
}
