use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::trace;

use super::segment::Segment;
use super::util::{in_window, seq_offset};

/// A segment that has been handed to the send window and not yet acknowledged.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub segment: Segment,
    /// Last transmission, `None` while the segment still waits for its first one.
    pub sent_at: Option<Instant>,
    pub transmissions: u32,
}

/// Segments the sender engine has to put on the wire during one sweep.
#[derive(Debug, Default)]
pub(crate) struct Due {
    pub segments: Vec<Segment>,
    pub first: usize,
    pub retransmitted: usize,
}

/// State of the Send Window
///
/// ```text
///            1          2          3          4
///       ----------|----------|----------|----------
///               BASE     NEXT_SEQ     BASE
///                                    +W
///
/// 1 - old sequence numbers which have been acknowledged
/// 2 - sequence numbers of unacknowledged segments (`size` of them)
/// 3 - sequence numbers free for `send`
/// 4 - future sequence numbers which are not yet allowed
/// ```
///
/// `slots[0]` always holds the segment numbered `base`.
#[derive(Debug)]
pub(crate) struct SendWindow {
    /// oldest unacknowledged sequence number
    pub base: u8,
    /// next sequence number handed out by `push`
    pub next_seq: u8,
    /// free capacity last advertised by the peer
    pub peer_rwnd: usize,
    capacity: usize,
    slots: VecDeque<InFlight>,
}

impl SendWindow {
    pub fn new(capacity: usize) -> Self {
        SendWindow {
            base: 0,
            next_seq: 0,
            peer_rwnd: capacity,
            capacity,
            slots: VecDeque::with_capacity(capacity),
        }
    }

    /// Number of in-flight (unacknowledged) segments.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn reset(&mut self) {
        self.base = 0;
        self.next_seq = 0;
        self.peer_rwnd = self.capacity;
        self.slots.clear();
    }

    /// Append a data segment at `next_seq`. The caller checks `is_full` first.
    pub fn push(&mut self, payload: &[u8]) -> u8 {
        debug_assert!(!self.is_full(), "push on a full send window");
        let seq = self.next_seq;
        self.slots.push_back(InFlight {
            segment: Segment::data(seq, payload),
            sent_at: None,
            transmissions: 0,
        });
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Retire everything in `[base, ack)`.
    ///
    /// Returns the number of retired segments; stale, duplicate or bogus
    /// acknowledgments retire nothing and never move `base` backwards. The
    /// advertised window is taken from every ACK, even a duplicate one.
    pub fn on_ack(&mut self, ack: u8, rwnd: u8) -> usize {
        self.peer_rwnd = rwnd as usize;
        let acked = seq_offset(self.base, ack);
        if acked == 0 || acked > self.slots.len() {
            return 0;
        }
        self.slots.drain(..acked);
        self.base = ack;
        acked
    }

    /// Collect every segment that needs to go out now and stamp it as sent.
    ///
    /// Never-sent segments go out at once, as far as the peer's advertised
    /// window allows. Sent segments go out again once `timeout` has elapsed
    /// since their last transmission.
    ///
    /// The segment at `base` may always go out, even into a closed peer
    /// window: each retransmission asks whether the window has reopened.
    pub fn due(&mut self, now: Instant, timeout: Duration) -> Due {
        let mut due = Due::default();
        let peer_rwnd = self.peer_rwnd.max(1);
        for (offset, slot) in self.slots.iter_mut().enumerate() {
            let send = match slot.sent_at {
                None => {
                    if offset >= peer_rwnd {
                        continue;
                    }
                    due.first += 1;
                    true
                }
                Some(sent) if now.saturating_duration_since(sent) >= timeout => {
                    trace!(
                        "seq {} timed out after {} transmission(s)",
                        slot.segment.seq(),
                        slot.transmissions
                    );
                    due.retransmitted += 1;
                    true
                }
                Some(_) => false,
            };
            if send {
                slot.sent_at = Some(now);
                slot.transmissions += 1;
                due.segments.push(slot.segment.clone());
            }
        }
        due
    }

    #[cfg(test)]
    pub fn slots(&self) -> impl Iterator<Item = &InFlight> {
        self.slots.iter()
    }

    #[cfg(test)]
    pub fn check_invariant(&self) {
        assert!(self.size() <= self.capacity);
        assert_eq!(self.size(), seq_offset(self.base, self.next_seq));
    }
}

/// Outcome of offering a data segment to the receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Outside `[base, base + W)`, most likely an old retransmission.
    OutOfWindow,
    /// Already buffered.
    Duplicate,
    /// Stored at its slot.
    Buffered,
}

/// State of the Receive Window
///
/// ```text
///                1          2          3
///            ----------|----------|----------
///                    BASE       BASE
///                              +W
///
/// 1 - old sequence numbers which have been delivered
/// 2 - sequence numbers allowed for buffering
/// 3 - future sequence numbers which are not yet allowed
/// ```
///
/// `slots[i]` holds the segment numbered `base + i`, if it has arrived.
/// A segment leaves the window only through `pop_ready`, so `base` stays put
/// while the application queue has no room.
#[derive(Debug)]
pub(crate) struct RecvWindow {
    /// next sequence number to hand to the application
    pub base: u8,
    capacity: usize,
    size: usize,
    slots: VecDeque<Option<Segment>>,
}

impl RecvWindow {
    pub fn new(capacity: usize) -> Self {
        RecvWindow {
            base: 0,
            capacity,
            size: 0,
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Segments held in the window and not yet delivered.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Free reorder capacity, always `W - size`.
    pub fn rwnd(&self) -> usize {
        self.capacity - self.size
    }

    pub fn reset(&mut self) {
        self.base = 0;
        self.size = 0;
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// Place `segment` at its slot.
    pub fn admit(&mut self, segment: Segment) -> Admission {
        let seq = segment.seq();
        if !in_window(self.base, seq, self.capacity) {
            return Admission::OutOfWindow;
        }
        let offset = seq_offset(self.base, seq);
        if self.slots[offset].is_some() {
            return Admission::Duplicate;
        }
        self.slots[offset] = Some(segment);
        self.size += 1;
        Admission::Buffered
    }

    /// Take the segment at `base` if it has arrived, advancing `base`.
    pub fn pop_ready(&mut self) -> Option<Segment> {
        if !self.slots.front().map_or(false, Option::is_some) {
            return None;
        }
        let segment = self.slots.pop_front().flatten();
        self.slots.push_back(None);
        self.size -= 1;
        self.base = self.base.wrapping_add(1);
        segment
    }

    #[cfg(test)]
    pub fn check_invariant(&self) {
        assert_eq!(self.size + self.rwnd(), self.capacity);
        assert_eq!(self.slots.len(), self.capacity);
        assert_eq!(self.slots.iter().filter(|s| s.is_some()).count(), self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(100);

    fn filled(capacity: usize, n: usize) -> SendWindow {
        let mut w = SendWindow::new(capacity);
        for i in 0..n {
            w.push(&[i as u8]);
        }
        w
    }

    #[test]
    fn push_assigns_consecutive_sequence_numbers() {
        let mut w = SendWindow::new(3);
        assert_eq!(w.push(b"a"), 0);
        assert_eq!(w.push(b"b"), 1);
        assert_eq!(w.push(b"c"), 2);
        assert!(w.is_full());
        assert_eq!(w.next_seq, 3);
        w.check_invariant();
    }

    #[test]
    fn cumulative_ack_retires_prefix() {
        let mut w = filled(4, 3);
        assert_eq!(w.on_ack(2, 4), 2);
        assert_eq!(w.base, 2);
        assert_eq!(w.size(), 1);
        w.check_invariant();
    }

    #[test]
    fn duplicate_and_stale_acks_are_no_ops() {
        let mut w = filled(4, 3);
        assert_eq!(w.on_ack(2, 4), 2);
        assert_eq!(w.on_ack(2, 4), 0);
        assert_eq!(w.on_ack(1, 4), 0);
        assert_eq!(w.base, 2);
        w.check_invariant();
    }

    #[test]
    fn ack_beyond_next_seq_ignored() {
        let mut w = filled(4, 2);
        assert_eq!(w.on_ack(9, 4), 0);
        assert_eq!(w.base, 0);
        assert_eq!(w.size(), 2);
    }

    #[test]
    fn ack_updates_peer_window_even_when_duplicate() {
        let mut w = filled(4, 2);
        w.on_ack(0, 1);
        assert_eq!(w.peer_rwnd, 1);
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut w = SendWindow::new(3);
        for _ in 0..85 {
            for _ in 0..3 {
                w.push(b"x");
            }
            let next = w.next_seq;
            assert_eq!(w.on_ack(next, 3), 3);
        }
        assert_eq!(w.base, 255);
        w.push(b"y");
        w.push(b"z");
        assert_eq!(w.next_seq, 1);
        w.check_invariant();
        assert_eq!(w.on_ack(1, 3), 2);
        assert!(w.is_empty());
        w.check_invariant();
    }

    #[test]
    fn new_segments_due_immediately_then_after_timeout() {
        let mut w = filled(3, 2);
        let t0 = Instant::now();

        let due = w.due(t0, T);
        assert_eq!(due.first, 2);
        assert_eq!(due.retransmitted, 0);
        assert_eq!(due.segments.len(), 2);

        assert!(w.due(t0 + T / 2, T).segments.is_empty());

        let due = w.due(t0 + T, T);
        assert_eq!(due.retransmitted, 2);
        assert!(w.slots().all(|s| s.transmissions == 2));
    }

    #[test]
    fn peer_window_throttles_first_transmissions_only() {
        let mut w = filled(4, 3);
        w.peer_rwnd = 1;
        let t0 = Instant::now();
        let due = w.due(t0, T);
        assert_eq!(due.segments.len(), 1);
        assert_eq!(due.segments[0].seq(), 0);
        assert_eq!(w.slots().filter(|s| s.sent_at.is_none()).count(), 2);

        let due = w.due(t0 + T, T);
        assert_eq!(due.retransmitted, 1);
        assert_eq!(due.first, 0);
    }

    fn drain(r: &mut RecvWindow) -> Vec<Segment> {
        std::iter::from_fn(|| r.pop_ready()).collect()
    }

    #[test]
    fn closed_peer_window_still_lets_base_out() {
        let mut w = filled(3, 2);
        w.peer_rwnd = 0;
        let t0 = Instant::now();
        let due = w.due(t0, T);
        assert_eq!(due.first, 1);
        assert_eq!(due.segments[0].seq(), 0);
        assert!(w.due(t0, T).segments.is_empty());

        let due = w.due(t0 + T, T);
        assert_eq!(due.retransmitted, 1);
        assert_eq!(due.first, 0);
    }

    #[test]
    fn in_order_segment_is_ready_immediately() {
        let mut r = RecvWindow::new(3);
        assert_eq!(r.admit(Segment::data(0, b"a")), Admission::Buffered);
        assert_eq!(r.rwnd(), 2);
        assert_eq!(r.pop_ready().map(|s| s.seq()), Some(0));
        assert_eq!(r.base, 1);
        assert_eq!(r.rwnd(), 3);
        assert!(r.pop_ready().is_none());
        r.check_invariant();
    }

    #[test]
    fn gap_is_held_until_filled() {
        let mut r = RecvWindow::new(3);
        assert_eq!(r.admit(Segment::data(1, b"b")), Admission::Buffered);
        assert_eq!(r.admit(Segment::data(2, b"c")), Admission::Buffered);
        assert!(r.pop_ready().is_none());
        assert_eq!(r.size(), 2);
        assert_eq!(r.rwnd(), 1);
        r.check_invariant();

        r.admit(Segment::data(0, b"a"));
        let bytes: Vec<u8> = drain(&mut r).iter().flat_map(|s| s.payload().to_vec()).collect();
        assert_eq!(bytes, b"abc");
        assert_eq!(r.base, 3);
        assert_eq!(r.size(), 0);
        r.check_invariant();
    }

    #[test]
    fn undelivered_base_keeps_the_window_in_place() {
        let mut r = RecvWindow::new(3);
        r.admit(Segment::data(0, b"a"));
        r.admit(Segment::data(1, b"b"));
        assert_eq!(r.admit(Segment::data(0, b"a")), Admission::Duplicate);
        assert_eq!(r.admit(Segment::data(3, b"d")), Admission::OutOfWindow);
        assert_eq!(r.base, 0);
        assert_eq!(r.rwnd(), 1);
        r.check_invariant();
    }

    #[test]
    fn duplicate_buffered_segment_discarded() {
        let mut r = RecvWindow::new(3);
        r.admit(Segment::data(2, b"c"));
        assert_eq!(r.admit(Segment::data(2, b"c")), Admission::Duplicate);
        assert_eq!(r.size(), 1);
        r.check_invariant();
    }

    #[test]
    fn old_and_far_future_segments_out_of_window() {
        let mut r = RecvWindow::new(3);
        r.admit(Segment::data(0, b"a"));
        drain(&mut r);
        assert_eq!(r.admit(Segment::data(0, b"a")), Admission::OutOfWindow);
        assert_eq!(r.admit(Segment::data(4, b"e")), Admission::OutOfWindow);
        assert_eq!(r.base, 1);
        r.check_invariant();
    }

    #[test]
    fn receive_window_wraps() {
        let mut r = RecvWindow::new(3);
        r.base = 254;
        r.admit(Segment::data(0, b"c"));
        r.admit(Segment::data(255, b"b"));
        assert!(r.pop_ready().is_none());
        r.admit(Segment::data(254, b"a"));
        let seqs: Vec<u8> = drain(&mut r).iter().map(|s| s.seq()).collect();
        assert_eq!(seqs, vec![254, 255, 0]);
        assert_eq!(r.base, 1);
        r.check_invariant();
    }
}
