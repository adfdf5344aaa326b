use std::io;
use std::net;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

use super::frame::{encode_reply, read_frame, write_frame, Reply, Request, Wait};
use crate::engine::Shutdown;
use crate::error::{Error, Result};
use crate::socket::Ktp;
use crate::store::StoreHandle;

/// Longest a client's blocking call runs before the daemon checks whether it
/// is shutting down.
const SLICE: Duration = Duration::from_millis(100);

/// Accept client processes until shut down, serving each on its own thread.
pub(crate) fn control_loop(listener: UnixListener, store: StoreHandle, shutdown: Shutdown) {
    let tick = store.config().tick;
    let mut clients: Vec<(UnixStream, JoinHandle<()>)> = Vec::new();
    info!("control socket accepting clients");
    loop {
        match listener.accept() {
            Ok((stream, _)) => match connect(&store, stream, &shutdown) {
                Ok(client) => clients.push(client),
                Err(e) => warn!("refused a client: {}", e),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if shutdown.wait(tick) {
                    break;
                }
            }
            Err(e) => {
                warn!("accept on the control socket failed: {}", e);
                if shutdown.wait(tick) {
                    break;
                }
            }
        }
        clients.retain(|(_, handle)| !handle.is_finished());
    }

    for (stream, handle) in clients {
        // unblocks a thread waiting for the client's next request
        let _ = stream.shutdown(net::Shutdown::Both);
        if handle.join().is_err() {
            warn!("a client thread panicked");
        }
    }
    info!("control socket closed");
}

/// Attach the connecting process by its kernel-reported pid and start
/// serving it.
fn connect(
    store: &StoreHandle,
    stream: UnixStream,
    shutdown: &Shutdown,
) -> Result<(UnixStream, JoinHandle<()>)> {
    stream.set_nonblocking(false)?;
    let pid = peer_pid(&stream)?;
    let ktp = store.attach_as(pid)?;
    let ours = stream.try_clone()?;
    let shutdown = shutdown.clone();
    let handle = thread::Builder::new()
        .name(format!("ktp-client-{}", pid))
        .spawn(move || serve(stream, ktp, shutdown))?;
    Ok((ours, handle))
}

fn peer_pid(stream: &UnixStream) -> Result<u32> {
    let cred = getsockopt(stream.as_raw_fd(), PeerCredentials).map_err(io::Error::from)?;
    u32::try_from(cred.pid()).map_err(|_| Error::Attach("peer reported no process id"))
}

/// Answer one client's requests until it hangs up. Its sockets stay open:
/// they belong to the process, not the connection, and go away on `close`
/// or once the process is gone.
fn serve(mut stream: UnixStream, ktp: Ktp, shutdown: Shutdown) {
    let pid = ktp.pid();
    debug!("process {} connected", pid);
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("process {}: {}", pid, e);
                break;
            }
        };
        let request = match Request::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("process {} sent a malformed request: {}", pid, e);
                break;
            }
        };
        let reply = handle(&ktp, request, &|| {
            shutdown.is_triggered() || hung_up(&stream)
        });
        if let Err(e) = write_frame(&mut stream, &encode_reply(&reply)) {
            debug!("process {}: {}", pid, e);
            break;
        }
    }
    debug!("process {} disconnected", pid);
}

/// Whether the peer has closed its end. Only meaningful while the client
/// waits for a reply and so has nothing in flight.
fn hung_up(stream: &UnixStream) -> bool {
    let mut byte = [0u8; 1];
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let peeked = nix::sys::socket::recv(stream.as_raw_fd(), &mut byte, nix::sys::socket::MsgFlags::MSG_PEEK)
        .map_err(io::Error::from);
    let _ = stream.set_nonblocking(false);
    match peeked {
        Ok(n) => n == 0,
        Err(e) => e.kind() != io::ErrorKind::WouldBlock,
    }
}

fn handle(ktp: &Ktp, request: Request, stop: &dyn Fn() -> bool) -> Result<Reply> {
    match request {
        Request::Hello => Ok(Reply::Welcome {
            message_size: ktp.message_size(),
            window_size: ktp.window_size(),
            retransmit_timeout: ktp.retransmit_timeout(),
        }),
        Request::Open => ktp.open().map(Reply::Opened),
        Request::Bind { id, local, remote } => ktp.bind(id, local, remote).map(|()| Reply::Done),
        Request::Close { id } => ktp.close(id).map(|()| Reply::Done),
        Request::Send { id, wait, data } => match wait {
            Wait::Poll => ktp.send(id, &data),
            Wait::Block(t) => sliced(stop, t, |t| ktp.send_blocking(id, &data, Some(t))),
        }
        .map(Reply::Sent),
        Request::Receive { id, wait, max_len } => match wait {
            Wait::Poll => ktp.receive(id, max_len),
            Wait::Block(t) => sliced(stop, t, |t| ktp.receive_blocking(id, max_len, Some(t))),
        }
        .map(Reply::Received),
        Request::Flush { id, wait } => match wait {
            Wait::Poll => ktp.flush(id),
            Wait::Block(t) => sliced(stop, t, |t| ktp.flush_blocking(id, Some(t))),
        }
        .map(|()| Reply::Done),
        Request::Stats { id } => ktp.stats(id).map(Reply::Stats),
    }
}

/// Run a blocking call in slices of at most `SLICE`, giving up with
/// `TimedOut` once `timeout` has passed or `stop` says so.
fn sliced<T>(
    stop: &dyn Fn() -> bool,
    timeout: Option<Duration>,
    mut op: impl FnMut(Duration) -> Result<T>,
) -> Result<T> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let slice = match deadline {
            Some(deadline) => SLICE.min(deadline.saturating_duration_since(Instant::now())),
            None => SLICE,
        };
        match op(slice) {
            Err(Error::TimedOut)
                if !stop() && deadline.map_or(true, |d| Instant::now() < d) => {}
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn sliced_call_retries_until_ready() {
        let calls = Cell::new(0);
        let r = sliced(&|| false, None, |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::TimedOut)
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(r.unwrap(), 3);
    }

    #[test]
    fn sliced_call_respects_deadline_and_stop() {
        let start = Instant::now();
        let r: Result<()> = sliced(&|| false, Some(Duration::from_millis(30)), |t| {
            assert!(t <= SLICE);
            thread::sleep(t);
            Err(Error::TimedOut)
        });
        assert!(matches!(r, Err(Error::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(30));

        let stopped = Shutdown::default();
        stopped.trigger();
        let r: Result<()> = sliced(&|| stopped.is_triggered(), None, |_| Err(Error::TimedOut));
        assert!(matches!(r, Err(Error::TimedOut)));
    }

    #[test]
    fn hang_up_is_seen_without_consuming_requests() {
        let (a, mut b) = UnixStream::pair().unwrap();
        assert!(!hung_up(&a));
        io::Write::write_all(&mut b, &[7]).unwrap();
        assert!(!hung_up(&a));
        let mut byte = [0u8; 1];
        io::Read::read_exact(&mut &a, &mut byte).unwrap();
        assert_eq!(byte, [7]);
        drop(b);
        assert!(hung_up(&a));
    }

    #[test]
    fn peer_pid_is_our_own_over_a_pair() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert_eq!(peer_pid(&a).unwrap(), std::process::id());
    }
}
