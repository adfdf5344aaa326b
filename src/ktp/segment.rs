use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum SegmentKind {
    Data,
    Ack,
}

/// One unit on the simulated wire.
///
/// For `Data` segments `seq` is the segment's own sequence number. For `Ack`
/// segments it is the cumulative acknowledgment: the next sequence number the
/// receiver expects, with `rwnd` carrying its advertised free capacity.
///
/// Payloads are shared so that retransmitting a segment does not copy it.
#[derive(Clone, Eq, PartialEq)]
pub struct Segment {
    seq: u8,
    kind: SegmentKind,
    rwnd: u8,
    payload: Arc<[u8]>,
}

impl Segment {
    pub(crate) fn data(seq: u8, payload: &[u8]) -> Self {
        Segment {
            seq,
            kind: SegmentKind::Data,
            rwnd: 0,
            payload: Arc::from(payload),
        }
    }

    pub(crate) fn ack(next_expected: u8, rwnd: u8) -> Self {
        Segment {
            seq: next_expected,
            kind: SegmentKind::Ack,
            rwnd,
            payload: Arc::from(&[][..]),
        }
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn is_ack(&self) -> bool {
        self.kind == SegmentKind::Ack
    }

    /// Receiver's advertised window. Zero on data segments.
    pub fn rwnd(&self) -> u8 {
        self.rwnd
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SegmentKind::Data => write!(f, "DATA(seq: {}, len: {})", self.seq, self.payload.len()),
            SegmentKind::Ack => write!(f, "ACK(next: {}, rwnd: {})", self.seq, self.rwnd),
        }
    }
}
