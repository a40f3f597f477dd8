//! Winsize reconciliation
//!
//! Every participant (the operator under the key `"localhost"`, each remote
//! peer under its address string) declares a desired size. The effective
//! size is the coordinate-wise minimum over all declared sizes, ignoring
//! zero axes, so the child's output fits every screen at once. Whenever the
//! effective size changes the PTY is resized and the new size is pushed to
//! every peer; the local display is cleared when the height changed, since
//! most emulators leave stale cells behind a shrink-then-grow.
//!
//! Lock order is reconciler, then registry. The registry is only ever
//! locked from inside `reconcile`, never the other way around.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use ptycast_protocol::Winch;
use ptycast_utils::{term, Result};
use tracing::{debug, info};

use crate::pty::PtyProcess;
use crate::registry::{ConnectionRegistry, PeerMessage};

/// WinsizeMap key for the operator's terminal.
pub const LOCALHOST: &str = "localhost";

pub struct SizeReconciler {
    sizes: Mutex<HashMap<String, Winch>>,
    pty: Arc<PtyProcess>,
    registry: Arc<ConnectionRegistry>,
    local_out: Mutex<Box<dyn Write + Send>>,
}

impl SizeReconciler {
    pub fn new(
        pty: Arc<PtyProcess>,
        registry: Arc<ConnectionRegistry>,
        local_out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            sizes: Mutex::new(HashMap::new()),
            pty,
            registry,
            local_out: Mutex::new(local_out),
        }
    }

    /// Record `id`'s desired size and reconcile. Returns ids of peers
    /// evicted while propagating the change.
    pub fn observe(&self, id: &str, size: Winch) -> Result<Vec<String>> {
        let mut sizes = self.sizes.lock();
        debug!(participant = id, %size, "winsize observed");
        sizes.insert(id.to_string(), size);
        self.reconcile(&mut sizes)
    }

    /// Drop `id`'s entry and reconcile; the effective size may grow.
    pub fn forget(&self, id: &str) -> Result<Vec<String>> {
        let mut sizes = self.sizes.lock();
        sizes.remove(id);
        self.reconcile(&mut sizes)
    }

    /// The current effective size, if any participant has declared one.
    pub fn effective(&self) -> Option<Winch> {
        effective_of(&self.sizes.lock())
    }

    pub fn participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sizes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Bring the PTY to the effective size and tell every peer. Evicting a
    /// peer can change the effective size again, so this loops until the
    /// PTY and the map agree.
    fn reconcile(&self, sizes: &mut HashMap<String, Winch>) -> Result<Vec<String>> {
        let mut all_evicted = Vec::new();
        loop {
            let Some(effective) = effective_of(sizes) else {
                break;
            };

            let current = self.pty.size()?;
            if effective == current {
                break;
            }

            let clear = effective.height != current.height;
            if clear {
                let mut out = self.local_out.lock();
                let _ = term::write_clear(&mut *out);
            }

            self.pty.resize(effective)?;
            info!(%effective, "PTY resized");

            let evicted = self.registry.broadcast(PeerMessage::Resize {
                size: effective,
                clear,
            });
            if evicted.is_empty() {
                break;
            }
            for id in &evicted {
                sizes.remove(id);
            }
            all_evicted.extend(evicted);
        }
        Ok(all_evicted)
    }
}

impl std::fmt::Debug for SizeReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeReconciler")
            .field("sizes", &*self.sizes.lock())
            .finish_non_exhaustive()
    }
}

/// Coordinate-wise minimum over all entries, per axis, skipping zero axes.
/// `None` when the map is empty or no entry carries a usable value for one
/// of the axes.
fn effective_of(sizes: &HashMap<String, Winch>) -> Option<Winch> {
    let width = sizes.values().map(|ws| ws.width).filter(|w| *w > 0).min()?;
    let height = sizes.values().map(|ws| ws.height).filter(|h| *h > 0).min()?;
    Some(Winch::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RemotePeer, PEER_QUEUE_DEPTH};
    use tokio::sync::mpsc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn setup(local: Winch) -> (SizeReconciler, Arc<ConnectionRegistry>, SharedBuf) {
        let pty = Arc::new(PtyProcess::spawn("cat", local).unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let out = SharedBuf::default();
        let reconciler =
            SizeReconciler::new(pty, Arc::clone(&registry), Box::new(out.clone()));
        reconciler.observe(LOCALHOST, local).unwrap();
        (reconciler, registry, out)
    }

    fn clear_count(out: &SharedBuf) -> usize {
        let buf = out.0.lock();
        buf.windows(2).filter(|w| *w == b"\x1bc").count()
    }

    #[test]
    fn test_smaller_peer_shrinks_pty() {
        let (reconciler, _registry, _out) = setup(Winch::new(100, 30));

        reconciler.observe("peer:1", Winch::new(80, 24)).unwrap();
        assert_eq!(reconciler.effective(), Some(Winch::new(80, 24)));
    }

    #[test]
    fn test_forget_grows_back() {
        let (reconciler, _registry, _out) = setup(Winch::new(100, 30));

        reconciler.observe("peer:1", Winch::new(60, 20)).unwrap();
        assert_eq!(reconciler.effective(), Some(Winch::new(60, 20)));

        reconciler.forget("peer:1").unwrap();
        assert_eq!(reconciler.effective(), Some(Winch::new(100, 30)));
    }

    #[test]
    fn test_min_is_per_axis() {
        let (reconciler, _registry, _out) = setup(Winch::new(100, 30));

        // Narrow-but-tall and wide-but-short peers combine to 70x20.
        reconciler.observe("narrow", Winch::new(70, 50)).unwrap();
        reconciler.observe("short", Winch::new(120, 20)).unwrap();
        assert_eq!(reconciler.effective(), Some(Winch::new(70, 20)));
    }

    #[test]
    fn test_zero_axes_are_ignored() {
        let (reconciler, _registry, _out) = setup(Winch::new(100, 30));

        reconciler.observe("degenerate", Winch::new(0, 0)).unwrap();
        assert_eq!(reconciler.effective(), Some(Winch::new(100, 30)));

        reconciler.observe("half", Winch::new(0, 20)).unwrap();
        assert_eq!(reconciler.effective(), Some(Winch::new(100, 20)));
    }

    #[test]
    fn test_clear_only_on_height_change() {
        let (reconciler, _registry, out) = setup(Winch::new(100, 30));

        reconciler.observe("peer:1", Winch::new(80, 30)).unwrap();
        assert_eq!(clear_count(&out), 0, "width-only change must not clear");

        reconciler.observe("peer:1", Winch::new(80, 24)).unwrap();
        assert_eq!(clear_count(&out), 1);
    }

    #[test]
    fn test_resize_broadcast_to_peers() {
        let (reconciler, registry, _out) = setup(Winch::new(100, 30));

        let (tx, mut rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        registry.add(RemotePeer::new("peer:1", tx));

        reconciler.observe("peer:1", Winch::new(60, 20)).unwrap();
        match rx.try_recv().unwrap() {
            PeerMessage::Resize { size, clear } => {
                assert_eq!(size, Winch::new(60, 20));
                assert!(clear);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unchanged_size_broadcasts_nothing() {
        let (reconciler, registry, _out) = setup(Winch::new(100, 30));

        let (tx, mut rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        registry.add(RemotePeer::new("peer:1", tx));

        // Same as the current effective size: no resize, no traffic.
        reconciler.observe("peer:1", Winch::new(100, 30)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_eviction_during_broadcast_removes_map_entry() {
        let (reconciler, registry, _out) = setup(Winch::new(100, 30));

        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        registry.add(RemotePeer::new("peer:1", tx));
        drop(rx);

        let evicted = reconciler.observe("peer:1", Winch::new(60, 20)).unwrap();
        assert_eq!(evicted, vec!["peer:1"]);
        assert!(registry.is_empty());
        assert_eq!(reconciler.participants(), vec![LOCALHOST.to_string()]);

        // With the dead peer gone the reconcile loop grew the size back.
        assert_eq!(reconciler.effective(), Some(Winch::new(100, 30)));
    }
}
