//! Messages exchanged over the control socket.
//!
//! Every message is one length-delimited frame. All integers are big-endian.
//!
//! ```text
//! [len: u32][tag: u8][body ...]        len = 1 + body.len()
//! ```
//!
//! Requests carry tags below `0x80`, replies `0x80` and up. A socket address
//! is its four IPv4 octets followed by the port. A wait is one byte: `0` to
//! poll, `1` to block without a deadline, `2` to block for the `u64` number
//! of microseconds that follows.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use thiserror::Error;

use crate::error::{Error, SocketId};
use crate::ktp::control_block::SocketStats;

/// Largest frame either side accepts.
pub(crate) const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HELLO: u8 = 0x01;
const OPEN: u8 = 0x02;
const BIND: u8 = 0x03;
const CLOSE: u8 = 0x04;
const SEND: u8 = 0x05;
const RECEIVE: u8 = 0x06;
const FLUSH: u8 = 0x07;
const STATS: u8 = 0x08;

const DONE: u8 = 0x80;
const WELCOME: u8 = 0x81;
const OPENED: u8 = 0x82;
const SENT: u8 = 0x83;
const RECEIVED: u8 = 0x84;
const COUNTERS: u8 = 0x85;
const FAILED: u8 = 0xff;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum FrameError {
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("frame ends early")]
    Truncated,
    #[error("{0} trailing bytes after the message")]
    Trailing(usize),
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unknown wait mode {0}")]
    UnknownWait(u8),
    #[error("unknown error code {0}")]
    UnknownError(u8),
}

impl From<FrameError> for io::Error {
    fn from(e: FrameError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// How long a request may wait for the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    /// Fail with `WouldBlock` instead of waiting.
    Poll,
    /// Wait, for at most the given time if any.
    Block(Option<Duration>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Request {
    Hello,
    Open,
    Bind {
        id: SocketId,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    },
    Close {
        id: SocketId,
    },
    Send {
        id: SocketId,
        wait: Wait,
        data: Vec<u8>,
    },
    Receive {
        id: SocketId,
        wait: Wait,
        max_len: usize,
    },
    Flush {
        id: SocketId,
        wait: Wait,
    },
    Stats {
        id: SocketId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Done,
    Welcome {
        message_size: usize,
        window_size: usize,
        retransmit_timeout: Duration,
    },
    Opened(SocketId),
    Sent(usize),
    Received(Vec<u8>),
    Stats(SocketStats),
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Out::new();
        match self {
            Request::Hello => out.u8(HELLO),
            Request::Open => out.u8(OPEN),
            Request::Bind { id, local, remote } => {
                out.u8(BIND);
                out.id(*id);
                out.addr(*local);
                out.addr(*remote);
            }
            Request::Close { id } => {
                out.u8(CLOSE);
                out.id(*id);
            }
            Request::Send { id, wait, data } => {
                out.u8(SEND);
                out.id(*id);
                out.wait(*wait);
                out.bytes(data);
            }
            Request::Receive { id, wait, max_len } => {
                out.u8(RECEIVE);
                out.id(*id);
                out.wait(*wait);
                out.u32(u32::try_from(*max_len).unwrap_or(u32::MAX));
            }
            Request::Flush { id, wait } => {
                out.u8(FLUSH);
                out.id(*id);
                out.wait(*wait);
            }
            Request::Stats { id } => {
                out.u8(STATS);
                out.id(*id);
            }
        }
        out.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let mut body = Body(frame);
        let request = match body.u8()? {
            HELLO => Request::Hello,
            OPEN => Request::Open,
            BIND => Request::Bind {
                id: body.id()?,
                local: body.addr()?,
                remote: body.addr()?,
            },
            CLOSE => Request::Close { id: body.id()? },
            SEND => Request::Send {
                id: body.id()?,
                wait: body.wait()?,
                data: body.rest(),
            },
            RECEIVE => Request::Receive {
                id: body.id()?,
                wait: body.wait()?,
                max_len: body.u32()? as usize,
            },
            FLUSH => Request::Flush {
                id: body.id()?,
                wait: body.wait()?,
            },
            STATS => Request::Stats { id: body.id()? },
            tag => return Err(FrameError::UnknownTag(tag)),
        };
        body.end()?;
        Ok(request)
    }
}

/// Encode the outcome of a request.
pub(crate) fn encode_reply(reply: &Result<Reply, Error>) -> Vec<u8> {
    let mut out = Out::new();
    match reply {
        Ok(Reply::Done) => out.u8(DONE),
        Ok(Reply::Welcome {
            message_size,
            window_size,
            retransmit_timeout,
        }) => {
            out.u8(WELCOME);
            out.u32(*message_size as u32);
            out.u32(*window_size as u32);
            out.u64(retransmit_timeout.as_micros() as u64);
        }
        Ok(Reply::Opened(id)) => {
            out.u8(OPENED);
            out.id(*id);
        }
        Ok(Reply::Sent(n)) => {
            out.u8(SENT);
            out.u32(*n as u32);
        }
        Ok(Reply::Received(data)) => {
            out.u8(RECEIVED);
            out.bytes(data);
        }
        Ok(Reply::Stats(s)) => {
            out.u8(COUNTERS);
            for n in [s.transmitted, s.retransmitted, s.acks_received, s.delivered, s.discarded] {
                out.u64(n);
            }
        }
        Err(e) => {
            out.u8(FAILED);
            let (code, id) = match e {
                Error::NoSpace => (1, 0),
                Error::InvalidSocket(id) => (2, id.0 as u32),
                Error::WouldBlock => (3, 0),
                Error::TimedOut => (4, 0),
                Error::Attach(_) => (5, 0),
                Error::InvalidConfig(_) => (6, 0),
                Error::Io(_) => (7, 0),
            };
            out.u8(code);
            out.u32(id);
            out.bytes(e.to_string().as_bytes());
        }
    }
    out.finish()
}

pub(crate) fn decode_reply(frame: &[u8]) -> Result<Result<Reply, Error>, FrameError> {
    let mut body = Body(frame);
    let reply = match body.u8()? {
        DONE => Ok(Reply::Done),
        WELCOME => Ok(Reply::Welcome {
            message_size: body.u32()? as usize,
            window_size: body.u32()? as usize,
            retransmit_timeout: Duration::from_micros(body.u64()?),
        }),
        OPENED => Ok(Reply::Opened(body.id()?)),
        SENT => Ok(Reply::Sent(body.u32()? as usize)),
        RECEIVED => Ok(Reply::Received(body.rest())),
        COUNTERS => Ok(Reply::Stats(SocketStats {
            transmitted: body.u64()?,
            retransmitted: body.u64()?,
            acks_received: body.u64()?,
            delivered: body.u64()?,
            discarded: body.u64()?,
        })),
        FAILED => {
            let code = body.u8()?;
            let id = SocketId(body.u32()? as usize);
            let message = String::from_utf8_lossy(&body.rest()).into_owned();
            Err(match code {
                1 => Error::NoSpace,
                2 => Error::InvalidSocket(id),
                3 => Error::WouldBlock,
                4 => Error::TimedOut,
                5 => Error::Attach("refused by the daemon"),
                6 => Error::InvalidConfig("refused by the daemon"),
                7 => Error::Io(io::Error::new(io::ErrorKind::Other, message)),
                code => return Err(FrameError::UnknownError(code)),
            })
        }
        tag => return Err(FrameError::UnknownTag(tag)),
    };
    body.end()?;
    Ok(reply)
}

/// Read one frame. `None` means the peer hung up between frames.
pub(crate) fn read_frame(r: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len).into());
    }
    let mut frame = vec![0u8; len];
    r.read_exact(&mut frame)?;
    Ok(Some(frame))
}

/// Write `frame`, as produced by the encoders above, in one go.
pub(crate) fn write_frame(w: &mut impl Write, frame: &[u8]) -> io::Result<()> {
    w.write_all(frame)?;
    w.flush()
}

/// Encoder for one frame; reserves the length prefix up front.
struct Out(Vec<u8>);

impl Out {
    fn new() -> Self {
        Out(vec![0; 4])
    }

    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn id(&mut self, id: SocketId) {
        self.u32(id.0 as u32);
    }

    fn addr(&mut self, a: SocketAddrV4) {
        self.0.extend_from_slice(&a.ip().octets());
        self.0.extend_from_slice(&a.port().to_be_bytes());
    }

    fn wait(&mut self, w: Wait) {
        match w {
            Wait::Poll => self.u8(0),
            Wait::Block(None) => self.u8(1),
            Wait::Block(Some(t)) => {
                self.u8(2);
                self.u64(u64::try_from(t.as_micros()).unwrap_or(u64::MAX));
            }
        }
    }

    /// Raw bytes running to the end of the frame.
    fn bytes(&mut self, b: &[u8]) {
        self.0.extend_from_slice(b);
    }

    fn finish(mut self) -> Vec<u8> {
        let len = (self.0.len() - 4) as u32;
        self.0[..4].copy_from_slice(&len.to_be_bytes());
        self.0
    }
}

/// Decoder over a frame without its length prefix.
struct Body<'a>(&'a [u8]);

impl<'a> Body<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.0.len() < n {
            return Err(FrameError::Truncated);
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn id(&mut self) -> Result<SocketId, FrameError> {
        Ok(SocketId(self.u32()? as usize))
    }

    fn addr(&mut self) -> Result<SocketAddrV4, FrameError> {
        let o = self.take(4)?;
        let ip = Ipv4Addr::new(o[0], o[1], o[2], o[3]);
        Ok(SocketAddrV4::new(ip, self.u16()?))
    }

    fn wait(&mut self) -> Result<Wait, FrameError> {
        match self.u8()? {
            0 => Ok(Wait::Poll),
            1 => Ok(Wait::Block(None)),
            2 => Ok(Wait::Block(Some(Duration::from_micros(self.u64()?)))),
            mode => Err(FrameError::UnknownWait(mode)),
        }
    }

    fn rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.0).to_vec()
    }

    fn end(&self) -> Result<(), FrameError> {
        match self.0.len() {
            0 => Ok(()),
            n => Err(FrameError::Trailing(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([10, 0, 0, 1].into(), port)
    }

    /// Strip the length prefix the way `read_frame` does.
    fn unframe(bytes: Vec<u8>) -> Vec<u8> {
        read_frame(&mut Cursor::new(bytes)).unwrap().unwrap()
    }

    #[test]
    fn bind_request_layout() {
        let bytes = Request::Bind {
            id: SocketId(1),
            local: addr(8080),
            remote: addr(8081),
        }
        .encode();
        assert_eq!(
            bytes,
            [
                0, 0, 0, 17, BIND, 0, 0, 0, 1, 10, 0, 0, 1, 0x1f, 0x90, 10, 0, 0, 1, 0x1f, 0x91
            ]
        );
    }

    #[test]
    fn send_request_carries_wait_and_payload() {
        let request = Request::Send {
            id: SocketId(0),
            wait: Wait::Block(Some(Duration::from_millis(1500))),
            data: b"payload".to_vec(),
        };
        assert_eq!(Request::decode(&unframe(request.encode())).unwrap(), request);
    }

    #[test]
    fn errors_keep_their_kind() {
        let frame = unframe(encode_reply(&Err(Error::InvalidSocket(SocketId(3)))));
        assert!(matches!(decode_reply(&frame), Ok(Err(Error::InvalidSocket(SocketId(3))))));
        let frame = unframe(encode_reply(&Err(Error::WouldBlock)));
        assert!(matches!(decode_reply(&frame), Ok(Err(Error::WouldBlock))));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert_eq!(Request::decode(&[0x42]), Err(FrameError::UnknownTag(0x42)));
        assert_eq!(Request::decode(&[CLOSE, 0, 0]), Err(FrameError::Truncated));
        assert_eq!(Request::decode(&[OPEN, 9]), Err(FrameError::Trailing(1)));
        assert_eq!(
            Request::decode(&[FLUSH, 0, 0, 0, 0, 7]),
            Err(FrameError::UnknownWait(7))
        );
    }

    #[test]
    fn oversized_and_cut_frames_fail_to_read() {
        let huge = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        assert_eq!(
            read_frame(&mut Cursor::new(huge)).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
        let cut = vec![0, 0, 0, 5, OPEN];
        assert_eq!(
            read_frame(&mut Cursor::new(cut)).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
        assert!(read_frame(&mut Cursor::new(Vec::new())).unwrap().is_none());
    }
}
