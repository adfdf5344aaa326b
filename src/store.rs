//! The segment store: a fixed table of socket control blocks shared by the
//! daemon's engines and every attached client.
//!
//! Each control block sits behind its own mutex, paired with the condition
//! variables blocked `send`/`receive` calls wait on. `open` additionally
//! takes a table-wide claim lock so its scan-and-claim is atomic.
//!
//! The routing lock orders transmissions against changes of who is bound
//! where: the engines hold it shared from checking a segment's origin until
//! the segment sits in its peer's inbound queue, while `bind`, `close`,
//! reclamation and `destroy` hold it exclusively. A segment of a closed
//! tenant therefore never reaches the peer of the next one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};

use crate::config::{validate_probability, Config};
use crate::error::{Error, Result, SocketId};
use crate::ktp::available::Available;
use crate::ktp::control_block::ControlBlock;
use crate::ktp::segment::Segment;
use crate::ktp::util::{lock, read_lock, write_lock};
use crate::quad::Quad;
use crate::socket::Ktp;

pub(crate) struct Slot {
    pub block: Mutex<ControlBlock>,
    pub rcv_var: Condvar,
    pub snd_var: Condvar,
}

impl Slot {
    pub fn lock(&self) -> MutexGuard<'_, ControlBlock> {
        lock(&self.block)
    }

    /// Wake whoever may be able to make progress given `a`.
    pub fn notify(&self, a: Available) {
        if a.contains(Available::READ) {
            self.rcv_var.notify_all();
        }
        if a.intersects(Available::WRITE | Available::FLUSHED) {
            self.snd_var.notify_all();
        }
    }

    /// Wake every waiter, e.g. because the block was freed under them.
    pub fn notify_all(&self) {
        self.rcv_var.notify_all();
        self.snd_var.notify_all();
    }
}

pub(crate) struct Shared {
    pub config: Config,
    pub slots: Box<[Slot]>,
    pub claim: Mutex<()>,
    routing: RwLock<()>,
    loss_probability: AtomicU64,
    destroyed: AtomicBool,
}

impl Shared {
    pub fn slot(&self, id: SocketId) -> Result<&Slot> {
        self.slots.get(id.0).ok_or(Error::InvalidSocket(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = SocketId> {
        (0..self.slots.len()).map(SocketId)
    }

    pub fn loss_probability(&self) -> f64 {
        f64::from_bits(self.loss_probability.load(Ordering::Relaxed))
    }

    pub fn set_loss_probability(&self, p: f64) -> Result<()> {
        validate_probability(p)?;
        self.loss_probability.store(p.to_bits(), Ordering::Relaxed);
        info!("loss probability set to {}", p);
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Held while segments travel; bindings stay put meanwhile.
    pub fn routing(&self) -> RwLockReadGuard<'_, ()> {
        read_lock(&self.routing)
    }

    /// Held while a binding changes or a socket is freed.
    pub fn rebinding(&self) -> RwLockWriteGuard<'_, ()> {
        write_lock(&self.routing)
    }

    /// Whether `id` is still open under the tenancy `tenancy`.
    pub fn is_current(&self, id: SocketId, tenancy: u64) -> bool {
        self.slots.get(id.0).map_or(false, |slot| {
            let cb = slot.lock();
            !cb.is_free && cb.tenancy == tenancy
        })
    }

    /// The open socket bound as the peer of `quad`, if any.
    pub fn route(&self, quad: Quad) -> Option<SocketId> {
        let want = quad.reverse();
        self.ids().find(|&id| {
            let cb = self.slots[id.0].lock();
            !cb.is_free && cb.quad == Some(want)
        })
    }

    /// Put segments that survived the wire into `to`'s inbound queue.
    /// Delivery to a free socket is a no-op.
    pub fn deliver(&self, to: SocketId, segments: impl IntoIterator<Item = Segment>) {
        let Some(slot) = self.slots.get(to.0) else {
            return;
        };
        let mut cb = slot.lock();
        if cb.is_free {
            debug!("{} is free; segments lost", to);
            return;
        }
        cb.inbound.extend(segments);
    }
}

/// Owner of the shared table. Clone it to hand the table to another
/// component; every clone names the same store.
#[derive(Clone)]
pub struct StoreHandle {
    pub(crate) shared: Arc<Shared>,
}

impl StoreHandle {
    /// Allocate the table with every control block free.
    pub fn create(config: Config) -> Result<Self> {
        config.validate()?;
        let slots = (0..config.max_sockets)
            .map(|_| Slot {
                block: Mutex::new(ControlBlock::new(config.window_size)),
                rcv_var: Condvar::new(),
                snd_var: Condvar::new(),
            })
            .collect();
        let shared = Shared {
            loss_probability: AtomicU64::new(config.loss_probability.to_bits()),
            config,
            slots,
            claim: Mutex::new(()),
            routing: RwLock::new(()),
            destroyed: AtomicBool::new(false),
        };
        info!(
            "segment store created: {} socket(s), window {}, message size {}",
            shared.config.max_sockets, shared.config.window_size, shared.config.message_size
        );
        Ok(StoreHandle {
            shared: Arc::new(shared),
        })
    }

    /// Attach on behalf of the calling process.
    pub fn attach(&self) -> Result<Ktp> {
        self.attach_as(std::process::id())
    }

    /// Attach on behalf of process `pid`. Sockets opened through the returned
    /// view are owned by `pid` and reclaimed once it exits.
    pub fn attach_as(&self, pid: u32) -> Result<Ktp> {
        if self.shared.is_destroyed() {
            return Err(Error::Attach("segment store has been destroyed"));
        }
        if pid == 0 {
            return Err(Error::Attach("owner process id must be non-zero"));
        }
        debug!("process {} attached", pid);
        Ok(Ktp::new(self.shared.clone(), pid))
    }

    /// Release the table. Every block is freed and later attaches fail.
    ///
    /// Callers make sure no attached client is still active; views that
    /// outlive this call only see free sockets.
    pub fn destroy(self) {
        self.shared.destroyed.store(true, Ordering::Release);
        let _routes = self.shared.rebinding();
        for slot in self.shared.slots.iter() {
            slot.lock().release();
            slot.notify_all();
        }
        info!("segment store destroyed");
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Every open socket with the process that owns it.
    pub fn open_sockets(&self) -> Vec<(SocketId, u32)> {
        self.shared
            .ids()
            .filter_map(|id| {
                let cb = self.shared.slots[id.0].lock();
                (!cb.is_free).then_some((id, cb.owner))
            })
            .collect()
    }

    pub fn set_loss_probability(&self, p: f64) -> Result<()> {
        self.shared.set_loss_probability(p)
    }

    pub fn loss_probability(&self) -> f64 {
        self.shared.loss_probability()
    }
}
