use std::time::Instant;

use log::{debug, info};

use super::{describe, Origin, Shutdown, Wire};

/// Push due window slots across the wire until shut down.
pub(crate) fn sender_loop(wire: Wire, shutdown: Shutdown) {
    let tick = wire.shared().config.tick;
    info!("sender engine running");
    while !shutdown.wait(tick) {
        sweep(&wire, Instant::now());
    }
    info!("sender engine stopped");
}

/// One pass over every socket: first transmissions of fresh segments and
/// retransmissions of timed-out ones. Returns the number of segments put on
/// the wire.
pub(crate) fn sweep(wire: &Wire, now: Instant) -> usize {
    let shared = wire.shared();
    let timeout = shared.config.retransmit_timeout;
    let mut sent = 0;
    for id in shared.ids() {
        let (quad, tenancy, due) = {
            let mut cb = shared.slots[id.index()].lock();
            if cb.is_free || cb.send.is_empty() {
                continue;
            }
            let due = cb.send.due(now, timeout);
            cb.stats.transmitted += due.first as u64;
            cb.stats.retransmitted += due.retransmitted as u64;
            (cb.quad, cb.tenancy, due)
        };
        if due.segments.is_empty() {
            continue;
        }
        if due.retransmitted > 0 {
            debug!(
                "{}: retransmitting {} timed-out segment(s)",
                describe(id, quad),
                due.retransmitted
            );
        }
        sent += due.segments.len();
        // an unbound socket has no peer; its segments are simply lost
        if let Some(quad) = quad {
            wire.transmit(Origin { id, tenancy, quad }, due.segments);
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::loss::RandomLoss;
    use crate::store::StoreHandle;
    use std::net::SocketAddrV4;
    use std::sync::Arc;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    #[test]
    fn fresh_segments_go_out_once_per_timeout() {
        let h = StoreHandle::create(Config {
            window_size: 3,
            loss_probability: 0.0,
            retransmit_timeout: Duration::from_millis(100),
            ..Config::default()
        })
        .unwrap();
        let ktp = h.attach().unwrap();
        let a = ktp.open().unwrap();
        let b = ktp.open().unwrap();
        ktp.bind(a, addr(1), addr(2)).unwrap();
        ktp.bind(b, addr(2), addr(1)).unwrap();
        ktp.send(a, b"one").unwrap();
        ktp.send(a, b"two").unwrap();

        let wire = Wire::new(h.shared.clone(), Arc::new(RandomLoss));
        let t0 = Instant::now();
        assert_eq!(sweep(&wire, t0), 2);
        assert_eq!(sweep(&wire, t0 + Duration::from_millis(50)), 0);
        assert_eq!(h.shared.slots[b.index()].lock().inbound.len(), 2);

        assert_eq!(sweep(&wire, t0 + Duration::from_millis(100)), 2);
        assert_eq!(h.shared.slots[b.index()].lock().inbound.len(), 4);

        let stats = ktp.stats(a).unwrap();
        assert_eq!(stats.transmitted, 2);
        assert_eq!(stats.retransmitted, 2);
    }

    #[test]
    fn dropped_segments_still_wait_for_timeout() {
        let h = StoreHandle::create(Config {
            loss_probability: 1.0,
            ..Config::default()
        })
        .unwrap();
        let ktp = h.attach().unwrap();
        let a = ktp.open().unwrap();
        let b = ktp.open().unwrap();
        ktp.bind(a, addr(1), addr(2)).unwrap();
        ktp.bind(b, addr(2), addr(1)).unwrap();
        ktp.send(a, b"lost").unwrap();

        let wire = Wire::new(h.shared.clone(), Arc::new(RandomLoss));
        let t0 = Instant::now();
        assert_eq!(sweep(&wire, t0), 1);
        assert_eq!(sweep(&wire, t0), 0);
        assert!(h.shared.slots[b.index()].lock().inbound.is_empty());
    }
}
