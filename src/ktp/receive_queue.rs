use std::collections::VecDeque;

use super::segment::Segment;

/// In-order segments delivered to the application and not yet fully read.
///
/// Holds at most `capacity` segments; a partially read segment keeps its slot
/// until its last byte is taken.
#[derive(Debug)]
pub(crate) struct ReceiveQueue {
    segments: VecDeque<Segment>,
    /// bytes of the front segment already handed out
    consumed: usize,
    capacity: usize,
}

impl ReceiveQueue {
    pub fn new(capacity: usize) -> Self {
        ReceiveQueue {
            segments: VecDeque::with_capacity(capacity),
            consumed: 0,
            capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.segments.len() >= self.capacity
    }

    /// Segment slots still free.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.segments.len())
    }

    /// Unread bytes.
    pub fn bytes(&self) -> usize {
        self.segments.iter().map(|s| s.payload().len()).sum::<usize>() - self.consumed
    }

    pub fn push(&mut self, segment: Segment) {
        debug_assert!(!self.is_full(), "push on a full receive queue");
        self.segments.push_back(segment);
    }

    /// Take up to `max_len` bytes, crossing segment boundaries.
    pub fn read(&mut self, max_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max_len.min(self.bytes()));
        while out.len() < max_len {
            let Some(front) = self.segments.front() else {
                break;
            };
            let rest = &front.payload()[self.consumed..];
            let n = rest.len().min(max_len - out.len());
            out.extend_from_slice(&rest[..n]);
            self.consumed += n;
            if self.consumed == front.payload().len() {
                self.segments.pop_front();
                self.consumed = 0;
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.consumed = 0;
    }
}
