#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ktp::{Config, Ktp, LossModel, Segment, SegmentKind, SocketId, StoreHandle};

pub const PATIENCE: Duration = Duration::from_secs(10);

pub fn addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new([127, 0, 0, 1].into(), port)
}

/// Fast timers so retransmissions happen within a test's lifetime.
pub fn fast_config(window_size: usize, loss_probability: f64) -> Config {
    Config {
        window_size,
        loss_probability,
        retransmit_timeout: Duration::from_millis(200),
        tick: Duration::from_millis(2),
        reclaim_interval: Duration::from_millis(50),
        ..Config::default()
    }
}

/// Open two sockets and bind them as each other's peer.
pub fn connected_pair(store: &StoreHandle) -> (Ktp, SocketId, SocketId) {
    let ktp = store.attach().unwrap();
    let a = ktp.open().unwrap();
    let b = ktp.open().unwrap();
    ktp.bind(a, addr(8080), addr(8081)).unwrap();
    ktp.bind(b, addr(8081), addr(8080)).unwrap();
    (ktp, a, b)
}

/// Push all of `data` through `send_blocking`, one message at a time.
pub fn send_all(ktp: &Ktp, id: SocketId, data: &[u8]) {
    let mut sent = 0;
    while sent < data.len() {
        sent += ktp.send_blocking(id, &data[sent..], Some(PATIENCE)).unwrap();
    }
}

/// Receive exactly `len` bytes, failing the test if they take too long.
pub fn receive_exact(ktp: &Ktp, id: SocketId, len: usize) -> Vec<u8> {
    let deadline = Instant::now() + PATIENCE;
    let mut buf = Vec::with_capacity(len);
    while buf.len() < len {
        let left = deadline.saturating_duration_since(Instant::now());
        buf.extend(ktp.receive_blocking(id, len - buf.len(), Some(left)).unwrap());
    }
    buf
}

/// Drops the first transmission of chosen data segments and records when
/// each data sequence number crossed the wire.
#[derive(Clone, Default)]
pub struct DropFirstTransmission {
    targets: Vec<u8>,
    sent_at: Arc<Mutex<HashMap<u8, Vec<Instant>>>>,
}

impl DropFirstTransmission {
    pub fn of(targets: &[u8]) -> Self {
        DropFirstTransmission {
            targets: targets.to_vec(),
            sent_at: Arc::default(),
        }
    }

    pub fn transmissions(&self, seq: u8) -> usize {
        self.transmission_times(seq).len()
    }

    pub fn transmission_times(&self, seq: u8) -> Vec<Instant> {
        self.sent_at
            .lock()
            .unwrap()
            .get(&seq)
            .cloned()
            .unwrap_or_default()
    }
}

impl LossModel for DropFirstTransmission {
    fn should_drop(&self, segment: &Segment, _probability: f64) -> bool {
        if segment.kind() != SegmentKind::Data {
            return false;
        }
        let mut sent_at = self.sent_at.lock().unwrap();
        let times = sent_at.entry(segment.seq()).or_default();
        times.push(Instant::now());
        times.len() == 1 && self.targets.contains(&segment.seq())
    }
}
