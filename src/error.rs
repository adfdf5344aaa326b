use std::{fmt, io};

use thiserror::Error;

/// Index of a control block in the segment store.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SocketId(pub(crate) usize);

impl SocketId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ktp#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no free socket slot")]
    NoSpace,
    #[error("socket {0} is not open")]
    InvalidSocket(SocketId),
    /// Not a failure: the send window is full or the receive queue is empty.
    #[error("operation would block")]
    WouldBlock,
    #[error("timed out waiting for the socket")]
    TimedOut,
    #[error("cannot attach to segment store: {0}")]
    Attach(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller is expected to retry after a delay.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        let kind = match e {
            Error::Io(e) => return e,
            Error::WouldBlock => io::ErrorKind::WouldBlock,
            Error::InvalidSocket(_) => io::ErrorKind::NotConnected,
            Error::TimedOut => io::ErrorKind::TimedOut,
            Error::NoSpace => io::ErrorKind::AddrNotAvailable,
            Error::Attach(_) | Error::InvalidConfig(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e.to_string())
    }
}
