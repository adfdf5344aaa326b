use std::io;
use std::net::SocketAddrV4;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;

use super::frame::{decode_reply, read_frame, write_frame, Reply, Request, Wait};
use crate::error::{Error, Result, SocketId};
use crate::ktp::control_block::SocketStats;
use crate::ktp::util::lock;
use crate::socket::SocketApi;

/// A client process's view of a daemon's segment store, reached through the
/// daemon's control socket.
///
/// Sockets opened through it belong to this process: the daemon reclaims
/// them once the process exits without closing them.
pub struct Client {
    stream: Mutex<UnixStream>,
    message_size: usize,
    window_size: usize,
    retransmit_timeout: Duration,
}

impl Client {
    /// Attach to the daemon listening on `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| {
            debug!("connecting to {}: {}", path.display(), e);
            Error::Attach("no daemon is listening on the control socket")
        })?;
        let mut client = Client {
            stream: Mutex::new(stream),
            message_size: 0,
            window_size: 0,
            retransmit_timeout: Duration::ZERO,
        };
        match client.call(Request::Hello)? {
            Reply::Welcome {
                message_size,
                window_size,
                retransmit_timeout,
            } => {
                client.message_size = message_size;
                client.window_size = window_size;
                client.retransmit_timeout = retransmit_timeout;
            }
            _ => return Err(Error::Attach("daemon did not greet")),
        }
        debug!("attached to {}", path.display());
        Ok(client)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// One request, one reply. Calls from several threads are serialized.
    fn call(&self, request: Request) -> Result<Reply> {
        let mut stream = lock(&self.stream);
        write_frame(&mut *stream, &request.encode())?;
        let frame = read_frame(&mut *stream)?.ok_or(Error::Attach("daemon hung up"))?;
        // the daemon's reply carries the operation's own error, if any
        decode_reply(&frame).map_err(io::Error::from)?
    }
}

fn unexpected(reply: Reply) -> Error {
    debug!("unexpected reply {:?}", reply);
    Error::Attach("daemon answered out of turn")
}

impl SocketApi for Client {
    fn open(&self) -> Result<SocketId> {
        match self.call(Request::Open)? {
            Reply::Opened(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    fn bind(&self, id: SocketId, local: SocketAddrV4, remote: SocketAddrV4) -> Result<()> {
        match self.call(Request::Bind { id, local, remote })? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn close(&self, id: SocketId) -> Result<()> {
        match self.call(Request::Close { id })? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn send(&self, id: SocketId, buf: &[u8]) -> Result<usize> {
        self.send_with(id, buf, Wait::Poll)
    }

    fn receive(&self, id: SocketId, max_len: usize) -> Result<Vec<u8>> {
        self.receive_with(id, max_len, Wait::Poll)
    }

    fn send_blocking(&self, id: SocketId, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        self.send_with(id, buf, Wait::Block(timeout))
    }

    fn receive_blocking(
        &self,
        id: SocketId,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.receive_with(id, max_len, Wait::Block(timeout))
    }

    fn flush(&self, id: SocketId) -> Result<()> {
        self.flush_with(id, Wait::Poll)
    }

    fn flush_blocking(&self, id: SocketId, timeout: Option<Duration>) -> Result<()> {
        self.flush_with(id, Wait::Block(timeout))
    }

    fn stats(&self, id: SocketId) -> Result<SocketStats> {
        match self.call(Request::Stats { id })? {
            Reply::Stats(s) => Ok(s),
            other => Err(unexpected(other)),
        }
    }

    fn message_size(&self) -> usize {
        self.message_size
    }

    fn retransmit_timeout(&self) -> Duration {
        self.retransmit_timeout
    }
}

impl Client {
    fn send_with(&self, id: SocketId, buf: &[u8], wait: Wait) -> Result<usize> {
        // the daemon would truncate anyway; don't ship what it drops
        let data = buf[..buf.len().min(self.message_size)].to_vec();
        match self.call(Request::Send { id, wait, data })? {
            Reply::Sent(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn receive_with(&self, id: SocketId, max_len: usize, wait: Wait) -> Result<Vec<u8>> {
        match self.call(Request::Receive { id, wait, max_len })? {
            Reply::Received(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    fn flush_with(&self, id: SocketId, wait: Wait) -> Result<()> {
        match self.call(Request::Flush { id, wait })? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
