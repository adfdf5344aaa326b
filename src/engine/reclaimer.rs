use std::sync::Arc;

use log::{info, warn};

use super::Shutdown;
use crate::liveness::LivenessProbe;
use crate::store::Shared;

/// Periodically free sockets whose owner died without closing them.
pub(crate) fn reclaimer_loop(shared: Arc<Shared>, probe: Arc<dyn LivenessProbe>, shutdown: Shutdown) {
    let interval = shared.config.reclaim_interval;
    info!("reclaimer running every {:?}", interval);
    while !shutdown.wait(interval) {
        sweep(&shared, &*probe);
    }
    info!("reclaimer stopped");
}

/// One pass over the table. Returns the number of sockets reclaimed.
///
/// The probe runs without the block lock held; the reset only happens if
/// the block still belongs to the same tenant afterwards.
pub(crate) fn sweep(shared: &Shared, probe: &dyn LivenessProbe) -> usize {
    let mut reclaimed = 0;
    for id in shared.ids() {
        let slot = &shared.slots[id.index()];
        let (owner, tenancy) = {
            let cb = slot.lock();
            if cb.is_free {
                continue;
            }
            (cb.owner, cb.tenancy)
        };
        if probe.is_alive(owner) {
            continue;
        }
        let _routes = shared.rebinding();
        let mut cb = slot.lock();
        if cb.is_free || cb.tenancy != tenancy {
            continue;
        }
        cb.release();
        drop(cb);
        slot.notify_all();
        warn!("{} reclaimed: owner process {} is gone", id, owner);
        reclaimed += 1;
    }
    reclaimed
}
