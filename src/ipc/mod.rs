//! Attaching from another process.
//!
//! The daemon listens on a Unix-domain control socket. A client process
//! connects, the daemon learns its pid from the kernel's peer credentials and
//! attaches to the store on its behalf; after that every socket call is one
//! length-delimited request frame answered by one reply frame.

pub(crate) mod client;
pub(crate) mod frame;
pub(crate) mod server;

pub use client::Client;
