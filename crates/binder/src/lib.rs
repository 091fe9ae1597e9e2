//! Skewer - Privileged binder
//!
//! The binder runs in the privileged supervisor and performs `bind()` on
//! behalf of unprivileged child workers. Each child inherits one end of a
//! UNIX-domain socketpair; the control protocol on it is ASCII lines, with
//! accepted-connection file descriptors attached as SCM_RIGHTS ancillary
//! data.
//!
//! # Control protocol
//!
//! Child → binder: `listen ADDR [ADDR ...]`, `closeconn UID`,
//! `stoplisten ADDR`, `reset`, `byebye`. Addresses are `NET:ADDRSPEC`
//! (`tcp:0.0.0.0:2514`, `unix:/run/skewer.sock`, `udp:...`, `unixgram:...`).
//!
//! Binder → child: `confirmlisten ADDR`, `error ADDR MESSAGE`,
//! `stopped ADDR`, and `newconn UID ADDR` carrying the connection fd.
//!
//! The binder is control plane, not data plane: traffic on the passed
//! descriptors never touches it. It runs on plain threads because SCM_RIGHTS
//! transfers are blocking point-to-point exchanges.

mod client;
mod fd_channel;
mod server;

pub use client::{BinderClient, BinderError, BinderListener};
pub use fd_channel::{FdChannel, FdSender};
pub use server::BinderServer;

/// Fixed descriptor number at which children inherit their binder channel
pub const BINDER_FD: std::os::fd::RawFd = 3;

/// Environment flag signalling that [`BINDER_FD`] is present
pub const HAS_BINDER_ENV: &str = "SKEWER_HAS_BINDER";

/// Stream socket networks handled with a listener and per-connection fds
pub fn is_stream_net(net: &str) -> bool {
    matches!(net, "tcp" | "tcp4" | "tcp6" | "unix" | "unixpacket")
}

/// Datagram networks handled with a single packet socket fd
pub fn is_packet_net(net: &str) -> bool {
    matches!(net, "udp" | "udpgram" | "unixgram")
}

/// Split `NET:ADDRSPEC` into its parts
pub fn split_addr(addr: &str) -> Option<(&str, &str)> {
    addr.split_once(':')
}
