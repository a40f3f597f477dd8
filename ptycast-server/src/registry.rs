//! Remote connection registry
//!
//! An ordered, mutex-guarded set of live peers. Each peer is its stable id
//! (the remote address string) plus a bounded channel into that peer's
//! writer task. Eviction is the only failure handling: a peer whose queue
//! is full or whose writer has gone away is closed and removed mid-iteration
//! without skipping its successors.

use bytes::Bytes;
use parking_lot::Mutex;
use ptycast_protocol::Winch;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound queue depth per peer. Remote viewers are best-effort: a peer
/// that falls this far behind is evicted rather than awaited.
pub const PEER_QUEUE_DEPTH: usize = 64;

/// A message bound for one remote peer's writer task.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    /// Raw bytes of the shared stream (PTY output, banners).
    Output(Bytes),
    /// The effective size changed; `clear` is set when the height changed
    /// and the peer's display should be reset before the refresh.
    Resize { size: Winch, clear: bool },
}

/// One live remote connection.
#[derive(Debug)]
pub struct RemotePeer {
    id: String,
    tx: mpsc::Sender<PeerMessage>,
}

impl RemotePeer {
    pub fn new(id: impl Into<String>, tx: mpsc::Sender<PeerMessage>) -> Self {
        Self { id: id.into(), tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a message without blocking. `Err` means the peer is dead or
    /// hopelessly behind; the caller evicts it.
    pub fn send(&self, msg: PeerMessage) -> std::result::Result<(), ()> {
        self.tx.try_send(msg).map_err(|_| ())
    }
}

/// Thread-safe set of live remote connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    peers: Mutex<Vec<RemotePeer>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: RemotePeer) {
        debug!(peer = %peer.id, "remote peer registered");
        self.peers.lock().push(peer);
    }

    /// Remove one peer by id (orderly disconnect). Dropping the entry drops
    /// its sender, which closes the peer's writer task.
    pub fn remove(&self, id: &str) -> bool {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|p| p.id != id);
        before != peers.len()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Visit every peer in index order. When `f` fails the peer is removed
    /// in place and iteration continues with the element that slid into its
    /// slot, so no successor is skipped. Returns the evicted ids.
    pub fn iterate<F>(&self, mut f: F) -> Vec<String>
    where
        F: FnMut(&RemotePeer, usize) -> std::result::Result<(), ()>,
    {
        let mut peers = self.peers.lock();
        let mut evicted = Vec::new();
        let mut i = 0;
        while i < peers.len() {
            if f(&peers[i], i).is_err() {
                let peer = peers.remove(i);
                debug!(peer = %peer.id, "evicting remote peer");
                evicted.push(peer.id);
            } else {
                i += 1;
            }
        }
        evicted
    }

    /// Queue `msg` to every peer, evicting peers that cannot take it.
    /// Returns the evicted ids so the caller can drop their winsize entries.
    pub fn broadcast(&self, msg: PeerMessage) -> Vec<String> {
        self.iterate(|peer, _| peer.send(msg.clone()))
    }

    /// Drop every peer, closing all writer tasks.
    pub fn close_all(&self) {
        self.peers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> (RemotePeer, mpsc::Receiver<PeerMessage>) {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        (RemotePeer::new(id, tx), rx)
    }

    #[test]
    fn test_add_remove() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = peer("a");
        registry.add(a);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_iterate_visits_in_order() {
        let registry = ConnectionRegistry::new();
        let _rxs: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| {
                let (p, rx) = peer(id);
                registry.add(p);
                rx
            })
            .collect();

        let mut seen = Vec::new();
        let evicted = registry.iterate(|p, i| {
            seen.push((p.id().to_string(), i));
            Ok(())
        });
        assert!(evicted.is_empty());
        assert_eq!(
            seen,
            vec![("a".into(), 0), ("b".into(), 1), ("c".into(), 2)]
        );
    }

    #[test]
    fn test_mid_list_eviction_does_not_skip() {
        let registry = ConnectionRegistry::new();
        let _rxs: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| {
                let (p, rx) = peer(id);
                registry.add(p);
                rx
            })
            .collect();

        let mut seen = Vec::new();
        let evicted = registry.iterate(|p, _| {
            seen.push(p.id().to_string());
            if p.id() == "b" {
                Err(())
            } else {
                Ok(())
            }
        });

        // Every peer is visited even though "b" vanished mid-list.
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
        assert_eq!(evicted, vec!["b"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_eviction_of_consecutive_peers() {
        let registry = ConnectionRegistry::new();
        let _rxs: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| {
                let (p, rx) = peer(id);
                registry.add(p);
                rx
            })
            .collect();

        let evicted = registry.iterate(|p, _| {
            if p.id() == "b" || p.id() == "c" {
                Err(())
            } else {
                Ok(())
            }
        });
        assert_eq!(evicted, vec!["b", "c"]);

        let mut left = Vec::new();
        registry.iterate(|p, _| {
            left.push(p.id().to_string());
            Ok(())
        });
        assert_eq!(left, vec!["a", "d"]);
    }

    #[test]
    fn test_eviction_of_last_peer() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = peer("a");
        let (b, _rx_b) = peer("b");
        registry.add(a);
        registry.add(b);

        let evicted = registry.iterate(|p, _| if p.id() == "b" { Err(()) } else { Ok(()) });
        assert_eq!(evicted, vec!["b"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_evicts_closed_peer() {
        let registry = ConnectionRegistry::new();
        let (a, rx_a) = peer("a");
        let (b, _rx_b) = peer("b");
        registry.add(a);
        registry.add(b);
        drop(rx_a);

        let evicted = registry.broadcast(PeerMessage::Output(Bytes::from_static(b"x")));
        assert_eq!(evicted, vec!["a"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_evicts_full_queue() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.add(RemotePeer::new("slow", tx));

        // First message fills the queue; the second evicts.
        assert!(registry
            .broadcast(PeerMessage::Output(Bytes::from_static(b"1")))
            .is_empty());
        let evicted = registry.broadcast(PeerMessage::Output(Bytes::from_static(b"2")));
        assert_eq!(evicted, vec!["slow"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broadcast_delivers_to_survivors() {
        let registry = ConnectionRegistry::new();
        let (a, _dead) = peer("a");
        drop(_dead);
        let (b, mut rx_b) = peer("b");
        registry.add(a);
        registry.add(b);

        registry.broadcast(PeerMessage::Output(Bytes::from_static(b"out")));
        match rx_b.try_recv().unwrap() {
            PeerMessage::Output(bytes) => assert_eq!(&bytes[..], b"out"),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
