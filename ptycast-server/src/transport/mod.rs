//! Transport backends
//!
//! The multiplexer core never touches a socket: each backend authenticates
//! connections, owns the per-peer reader/writer tasks, and reduces
//! everything to one typed event stream. Outbound traffic reaches a peer
//! through the bounded channel registered with its [`RemotePeer`].

pub mod ssh;
pub mod tls;

use bytes::Bytes;
use ptycast_protocol::Winch;

use crate::registry::RemotePeer;

/// Events produced by a transport backend for the multiplexer core.
#[derive(Debug)]
pub enum PeerEvent {
    /// A peer authenticated; its writer task is wired to `peer`'s channel.
    Connected { peer: RemotePeer },
    /// Keystrokes from a peer (dropped by the core in read-only mode).
    Input { id: String, data: Bytes },
    /// A peer declared a new window size.
    Resize { id: String, size: Winch },
    /// The peer's stream ended (close, error, or decode failure).
    Disconnected { id: String },
}
