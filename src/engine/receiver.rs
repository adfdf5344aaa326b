use log::{info, trace};

use super::{describe, Origin, Shutdown, Wire};

/// Process inbound segments until shut down.
pub(crate) fn receiver_loop(wire: Wire, shutdown: Shutdown) {
    let tick = wire.shared().config.tick;
    info!("receiver engine running");
    while !shutdown.wait(tick) {
        sweep(&wire);
    }
    info!("receiver engine stopped");
}

/// One pass over every socket's inbound queue.
///
/// Data segments go through window admission; ACKs advance the send window.
/// Segments held back by a full receive queue move up once the application
/// has read. The latest acknowledgment a pass produced goes back over the
/// wire; ACKs are cumulative, so it covers every earlier one. Returns the
/// number of inbound segments processed.
pub(crate) fn sweep(wire: &Wire) -> usize {
    let shared = wire.shared();
    let mut processed = 0;
    for id in shared.ids() {
        let slot = &shared.slots[id.index()];
        let (ack, quad, tenancy) = {
            let mut cb = slot.lock();
            if cb.is_free {
                continue;
            }
            let mut ack = None;
            let mut changed = false;
            while let Some(segment) = cb.inbound.pop_front() {
                processed += 1;
                changed = true;
                if let Some(a) = cb.on_segment(segment) {
                    ack = Some(a);
                }
            }
            if let Some(a) = cb.window_update() {
                changed = true;
                ack = Some(a);
            }
            if !changed {
                continue;
            }
            let available = cb.availability();
            let (quad, tenancy) = (cb.quad, cb.tenancy);
            drop(cb);
            slot.notify(available);
            (ack, quad, tenancy)
        };
        if let (Some(ack), Some(quad)) = (ack, quad) {
            trace!("{}: sending {:?}", describe(id, Some(quad)), ack);
            wire.transmit(Origin { id, tenancy, quad }, vec![ack]);
        }
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ktp::segment::Segment;
    use crate::loss::RandomLoss;
    use crate::store::StoreHandle;
    use std::net::SocketAddrV4;
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    #[test]
    fn data_is_delivered_and_acked_back() {
        let h = StoreHandle::create(Config {
            window_size: 3,
            loss_probability: 0.0,
            ..Config::default()
        })
        .unwrap();
        let ktp = h.attach().unwrap();
        let a = ktp.open().unwrap();
        let b = ktp.open().unwrap();
        ktp.bind(a, addr(1), addr(2)).unwrap();
        ktp.bind(b, addr(2), addr(1)).unwrap();
        ktp.send(a, b"x").unwrap();
        ktp.send(a, b"y").unwrap();

        {
            let mut cb = h.shared.slots[b.index()].lock();
            cb.inbound.push_back(Segment::data(1, b"y"));
            cb.inbound.push_back(Segment::data(0, b"x"));
        }
        let wire = Wire::new(h.shared.clone(), Arc::new(RandomLoss));
        assert_eq!(sweep(&wire), 2);
        assert_eq!(ktp.receive(b, 10).unwrap(), b"xy");
        // the ACK lands in a's queue, behind the slot the sweep already passed
        assert_eq!(sweep(&wire), 1);

        {
            let cb = h.shared.slots[a.index()].lock();
            assert!(cb.send.is_empty());
            assert_eq!(cb.send.base, 2);
        }
        ktp.flush(a).unwrap();
    }

    #[test]
    fn inbound_on_unbound_socket_is_processed_without_ack() {
        let h = StoreHandle::create(Config::default()).unwrap();
        let ktp = h.attach().unwrap();
        let b = ktp.open().unwrap();
        h.shared.slots[b.index()]
            .lock()
            .inbound
            .push_back(Segment::data(0, b"z"));
        let wire = Wire::new(h.shared.clone(), Arc::new(RandomLoss));
        assert_eq!(sweep(&wire), 1);
        assert_eq!(ktp.receive(b, 10).unwrap(), b"z");
    }

    #[test]
    fn reading_releases_held_segments() {
        let h = StoreHandle::create(Config {
            window_size: 2,
            loss_probability: 0.0,
            ..Config::default()
        })
        .unwrap();
        let ktp = h.attach().unwrap();
        let a = ktp.open().unwrap();
        let b = ktp.open().unwrap();
        ktp.bind(a, addr(1), addr(2)).unwrap();
        ktp.bind(b, addr(2), addr(1)).unwrap();
        {
            let mut cb = h.shared.slots[b.index()].lock();
            for seq in 0..3u8 {
                cb.inbound.push_back(Segment::data(seq, &[b'a' + seq]));
            }
        }
        let wire = Wire::new(h.shared.clone(), Arc::new(RandomLoss));
        assert_eq!(sweep(&wire), 3);
        {
            let cb = h.shared.slots[b.index()].lock();
            assert_eq!(cb.recv.base, 2);
            assert_eq!(cb.recv.size(), 1);
        }
        h.shared.slots[a.index()].lock().inbound.clear();

        assert_eq!(ktp.receive(b, 1).unwrap(), b"a");
        assert_eq!(sweep(&wire), 0);
        assert_eq!(ktp.receive(b, 10).unwrap(), b"bc");
        // the held segment was acknowledged on its way up
        let ack = h.shared.slots[a.index()].lock().inbound.pop_back().unwrap();
        assert_eq!((ack.seq(), ack.rwnd()), (3, 0));
    }
}
