//! KTP: a reliable, ordered, sliding-window transport over a shared table of
//! socket control blocks.
//!
//! A [`Daemon`] runs the protocol engine against a [`StoreHandle`]; clients
//! [`attach`](StoreHandle::attach) to the store and use the socket API on the
//! returned [`Ktp`] view:
//!
//! ```no_run
//! use std::net::SocketAddrV4;
//! use ktp::{Config, Daemon, StoreHandle};
//!
//! let store = StoreHandle::create(Config::default())?;
//! let _daemon = Daemon::start(&store)?;
//!
//! let ktp = store.attach()?;
//! let a = ktp.open()?;
//! let b = ktp.open()?;
//! let (x, y): (SocketAddrV4, SocketAddrV4) = ("127.0.0.1:8080".parse()?, "127.0.0.1:8081".parse()?);
//! ktp.bind(a, x, y)?;
//! ktp.bind(b, y, x)?;
//! ktp.send_blocking(a, b"hello", None)?;
//! assert_eq!(ktp.receive_blocking(b, 5, None)?, b"hello");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Other processes reach the same store through the daemon's control socket
//! (see [`DaemonBuilder::control_socket`]) with a [`Client`], which offers the
//! same calls through [`SocketApi`].

mod config;
mod daemon;
mod engine;
mod error;
mod ipc;
mod ktp;
mod liveness;
mod loss;
mod quad;
mod socket;
mod store;

pub use config::Config;
pub use daemon::{Daemon, DaemonBuilder};
pub use error::{Error, Result, SocketId};
pub use ipc::Client;
pub use ktp::control_block::SocketStats;
pub use ktp::segment::{Segment, SegmentKind};
pub use liveness::{LivenessProbe, SignalProbe};
pub use loss::{should_drop, LossModel, RandomLoss, SeededLoss};
pub use quad::Quad;
pub use socket::{Ktp, SocketApi};
pub use store::StoreHandle;

/// Build-time defaults for [`Config`].
pub mod defaults {
    pub use crate::config::{
        LOSS_PROBABILITY, MAX_SOCKETS, MAX_WINDOW_SIZE, MESSAGE_SIZE, RECLAIM_INTERVAL,
        RETRANSMIT_TIMEOUT, TICK, WINDOW_SIZE,
    };
}
