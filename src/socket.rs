use std::net::SocketAddrV4;
use std::sync::{Arc, Condvar, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, trace};

use crate::error::{Error, Result, SocketId};
use crate::ktp::control_block::{ControlBlock, SocketStats};
use crate::ktp::util::lock;
use crate::quad::Quad;
use crate::store::{Shared, Slot};

/// A process's attached view of the segment store, and the socket API
/// clients use.
///
/// Every call either completes immediately or fails with
/// [`Error::WouldBlock`]; the `*_blocking` variants wait for the engines to
/// make progress instead.
#[derive(Clone)]
pub struct Ktp {
    shared: Arc<Shared>,
    pid: u32,
}

impl Ktp {
    pub(crate) fn new(shared: Arc<Shared>, pid: u32) -> Self {
        Ktp { shared, pid }
    }

    /// The process this view acts for.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Largest payload a single `send` accepts.
    pub fn message_size(&self) -> usize {
        self.shared.config.message_size
    }

    pub fn window_size(&self) -> usize {
        self.shared.config.window_size
    }

    pub fn retransmit_timeout(&self) -> Duration {
        self.shared.config.retransmit_timeout
    }

    pub fn set_loss_probability(&self, p: f64) -> Result<()> {
        self.shared.set_loss_probability(p)
    }

    /// Claim the first free control block.
    pub fn open(&self) -> Result<SocketId> {
        let _claim = lock(&self.shared.claim);
        for id in self.shared.ids() {
            let mut cb = self.shared.slots[id.0].lock();
            if cb.is_free {
                cb.claim(self.pid);
                info!("{} opened by process {}", id, self.pid);
                return Ok(id);
            }
        }
        debug!("no free socket for process {}", self.pid);
        Err(Error::NoSpace)
    }

    /// Record the socket's endpoint addresses; rebinding overwrites them.
    pub fn bind(&self, id: SocketId, local: SocketAddrV4, remote: SocketAddrV4) -> Result<()> {
        let _routes = self.shared.rebinding();
        let (_, mut cb) = self.block(id)?;
        cb.quad = Some(Quad { local, remote });
        info!("{} bound {} -> {}", id, local, remote);
        Ok(())
    }

    /// Free the socket without waiting for in-flight segments.
    pub fn close(&self, id: SocketId) -> Result<()> {
        let _routes = self.shared.rebinding();
        let (slot, mut cb) = self.block(id)?;
        let unacked = cb.send.size();
        cb.release();
        drop(cb);
        slot.notify_all();
        info!("{} closed ({} segment(s) unacknowledged)", id, unacked);
        Ok(())
    }

    /// Queue up to one segment's worth of `buf` for transmission.
    ///
    /// Returns how many bytes were taken, at most the configured message
    /// size; callers chunk larger payloads across calls.
    pub fn send(&self, id: SocketId, buf: &[u8]) -> Result<usize> {
        let (_, mut cb) = self.block(id)?;
        self.enqueue(id, &mut cb, buf)
    }

    /// Take up to `max_len` bytes from the front of the receive queue.
    pub fn receive(&self, id: SocketId, max_len: usize) -> Result<Vec<u8>> {
        let (_, mut cb) = self.block(id)?;
        dequeue(&mut cb, max_len)
    }

    /// Like [`Ktp::send`], but waits for a free window slot.
    pub fn send_blocking(&self, id: SocketId, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let (slot, cb) = self.block(id)?;
        let mut cb = self.wait_until(id, cb, &slot.snd_var, timeout, |cb| !cb.send.is_full())?;
        self.enqueue(id, &mut cb, buf)
    }

    /// Like [`Ktp::receive`], but waits for data to arrive.
    pub fn receive_blocking(
        &self,
        id: SocketId,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let (slot, cb) = self.block(id)?;
        let mut cb = self.wait_until(id, cb, &slot.rcv_var, timeout, |cb| !cb.incoming.is_empty())?;
        dequeue(&mut cb, max_len)
    }

    /// `Ok` once every segment sent so far has been acknowledged.
    pub fn flush(&self, id: SocketId) -> Result<()> {
        let (_, cb) = self.block(id)?;
        if cb.send.is_empty() {
            Ok(())
        } else {
            Err(Error::WouldBlock)
        }
    }

    /// Wait until every segment sent so far has been acknowledged.
    pub fn flush_blocking(&self, id: SocketId, timeout: Option<Duration>) -> Result<()> {
        let (slot, cb) = self.block(id)?;
        self.wait_until(id, cb, &slot.snd_var, timeout, |cb| cb.send.is_empty())?;
        Ok(())
    }

    /// Counters for the current tenancy of `id`.
    pub fn stats(&self, id: SocketId) -> Result<SocketStats> {
        let (_, cb) = self.block(id)?;
        Ok(cb.stats)
    }

    /// Lock an open socket's block.
    fn block(&self, id: SocketId) -> Result<(&Slot, MutexGuard<'_, ControlBlock>)> {
        let slot = self.shared.slot(id)?;
        let cb = slot.lock();
        if cb.is_free {
            return Err(Error::InvalidSocket(id));
        }
        Ok((slot, cb))
    }

    fn enqueue(&self, id: SocketId, cb: &mut ControlBlock, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if cb.send.is_full() {
            trace!(
                "{} send window full (base {}, next {})",
                id,
                cb.send.base,
                cb.send.next_seq
            );
            return Err(Error::WouldBlock);
        }
        let n = buf.len().min(self.shared.config.message_size);
        let seq = cb.send.push(&buf[..n]);
        trace!("{} queued seq {} ({} bytes)", id, seq, n);
        Ok(n)
    }

    /// Wait on `var` until `ready` holds for the socket's current tenant.
    ///
    /// Fails with `InvalidSocket` if the socket is closed or reclaimed while
    /// waiting, and with `TimedOut` once `timeout` has passed.
    fn wait_until<'a>(
        &self,
        id: SocketId,
        mut cb: MutexGuard<'a, ControlBlock>,
        var: &Condvar,
        timeout: Option<Duration>,
        ready: impl Fn(&ControlBlock) -> bool,
    ) -> Result<MutexGuard<'a, ControlBlock>> {
        let tenancy = cb.tenancy;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if cb.is_free || cb.tenancy != tenancy {
                return Err(Error::InvalidSocket(id));
            }
            if ready(&*cb) {
                return Ok(cb);
            }
            // re-check at least once per retransmission timeout
            let mut wait = self.shared.config.retransmit_timeout;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::TimedOut);
                }
                wait = wait.min(deadline - now);
            }
            cb = match var.wait_timeout(cb, wait) {
                Ok((cb, _)) => cb,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// The socket calls of a client, whether it shares the daemon's process
/// ([`Ktp`]) or reaches it over the control socket ([`Client`]).
///
/// [`Client`]: crate::Client
pub trait SocketApi {
    fn open(&self) -> Result<SocketId>;
    fn bind(&self, id: SocketId, local: SocketAddrV4, remote: SocketAddrV4) -> Result<()>;
    fn close(&self, id: SocketId) -> Result<()>;
    fn send(&self, id: SocketId, buf: &[u8]) -> Result<usize>;
    fn receive(&self, id: SocketId, max_len: usize) -> Result<Vec<u8>>;
    fn send_blocking(&self, id: SocketId, buf: &[u8], timeout: Option<Duration>) -> Result<usize>;
    fn receive_blocking(
        &self,
        id: SocketId,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>>;
    fn flush(&self, id: SocketId) -> Result<()>;
    fn flush_blocking(&self, id: SocketId, timeout: Option<Duration>) -> Result<()>;
    fn stats(&self, id: SocketId) -> Result<SocketStats>;
    fn message_size(&self) -> usize;
    fn retransmit_timeout(&self) -> Duration;
}

impl SocketApi for Ktp {
    fn open(&self) -> Result<SocketId> {
        Ktp::open(self)
    }

    fn bind(&self, id: SocketId, local: SocketAddrV4, remote: SocketAddrV4) -> Result<()> {
        Ktp::bind(self, id, local, remote)
    }

    fn close(&self, id: SocketId) -> Result<()> {
        Ktp::close(self, id)
    }

    fn send(&self, id: SocketId, buf: &[u8]) -> Result<usize> {
        Ktp::send(self, id, buf)
    }

    fn receive(&self, id: SocketId, max_len: usize) -> Result<Vec<u8>> {
        Ktp::receive(self, id, max_len)
    }

    fn send_blocking(&self, id: SocketId, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        Ktp::send_blocking(self, id, buf, timeout)
    }

    fn receive_blocking(
        &self,
        id: SocketId,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        Ktp::receive_blocking(self, id, max_len, timeout)
    }

    fn flush(&self, id: SocketId) -> Result<()> {
        Ktp::flush(self, id)
    }

    fn flush_blocking(&self, id: SocketId, timeout: Option<Duration>) -> Result<()> {
        Ktp::flush_blocking(self, id, timeout)
    }

    fn stats(&self, id: SocketId) -> Result<SocketStats> {
        Ktp::stats(self, id)
    }

    fn message_size(&self) -> usize {
        Ktp::message_size(self)
    }

    fn retransmit_timeout(&self) -> Duration {
        Ktp::retransmit_timeout(self)
    }
}

fn dequeue(cb: &mut ControlBlock, max_len: usize) -> Result<Vec<u8>> {
    if cb.incoming.is_empty() {
        return Err(Error::WouldBlock);
    }
    Ok(cb.incoming.read(max_len))
}
