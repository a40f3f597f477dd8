//! The multiplexer core
//!
//! Couples the local terminal, the child PTY, and the set of remote peers:
//!
//! - local stdin and remote keystrokes merge into one input queue that
//!   drains into the PTY (chunk-atomic, so sources never interleave inside
//!   a chunk);
//! - PTY output fans out to local stdout and to every registered peer,
//!   evicting peers that cannot keep up;
//! - resize events from any participant run through the reconciler;
//! - the child exiting, or a fatal error, tears everything down.
//!
//! Cancellation is fd-closure: shutdown closes the listener and the PTY,
//! and every pump task exits on the resulting I/O error.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ptycast_protocol::Winch;
use ptycast_utils::{term, PtycastError, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::pty::PtyProcess;
use crate::registry::{ConnectionRegistry, PeerMessage};
use crate::transport::PeerEvent;
use crate::winsize::{SizeReconciler, LOCALHOST};

/// Read chunk for operator keystrokes.
const STDIN_CHUNK: usize = 256;
/// Read chunk for PTY output.
const PTY_CHUNK: usize = 4096;
/// Depth of the merged input queue feeding the PTY.
const INPUT_QUEUE_DEPTH: usize = 64;
/// How long a connect/disconnect banner stays on screen.
const BANNER_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct MuxOptions {
    /// Discard keystrokes from remote peers.
    pub read_only: bool,
    /// Show top-bar banners on connect and disconnect.
    pub notify: bool,
}

pub struct Multiplexer {
    pty: Arc<PtyProcess>,
    registry: Arc<ConnectionRegistry>,
    reconciler: Arc<SizeReconciler>,
    options: MuxOptions,
    shutdown_tx: broadcast::Sender<()>,
}

impl Multiplexer {
    /// Spawn the child sized to the operator's terminal and seed the
    /// winsize map with the `"localhost"` entry. The local fd must already
    /// be in raw mode.
    pub fn new(command: &str, options: MuxOptions) -> Result<Self> {
        let local_size = term::get_winsize(libc::STDIN_FILENO)?;
        Self::build(command, local_size, options, Box::new(std::io::stdout()))
    }

    fn build(
        command: &str,
        local_size: Winch,
        options: MuxOptions,
        local_out: Box<dyn Write + Send>,
    ) -> Result<Self> {
        let pty = Arc::new(PtyProcess::spawn(command, local_size)?);
        let registry = Arc::new(ConnectionRegistry::new());
        let reconciler = Arc::new(SizeReconciler::new(
            Arc::clone(&pty),
            Arc::clone(&registry),
            local_out,
        ));
        reconciler.observe(LOCALHOST, local_size)?;

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            pty,
            registry,
            reconciler,
            options,
            shutdown_tx,
        })
    }

    /// A receiver on the global shutdown signal, for the transport listener.
    pub fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Drive the session. Returns `Ok(())` when the child exits, `Err` on a
    /// fatal error.
    pub async fn run(&self, mut events: mpsc::Receiver<PeerEvent>) -> Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<PtycastError>(1);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_QUEUE_DEPTH);

        self.spawn_stdin_pump(input_tx.clone());
        self.spawn_input_drain(input_rx);
        self.spawn_output_fanout(fatal_tx.clone());
        self.spawn_winch_handler(fatal_tx.clone())?;
        self.spawn_child_waiter();

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("child exited, shutting down");
                    return Ok(());
                }
                Some(err) = fatal_rx.recv() => return Err(err),
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &input_tx).await?,
                    None => {
                        return Err(PtycastError::network("transport listener stopped"));
                    }
                },
            }
        }
    }

    /// Tear down: stop the listener, drop every peer, terminate the child.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.registry.close_all();
        let _ = self.pty.kill();
    }

    async fn handle_event(
        &self,
        event: PeerEvent,
        input_tx: &mpsc::Sender<Bytes>,
    ) -> Result<()> {
        match event {
            PeerEvent::Connected { peer } => {
                let id = peer.id().to_string();
                self.registry.add(peer);
                // The map entry exists as soon as the peer is live. A zero
                // size carries no constraint until real dimensions arrive.
                self.reconciler.observe(&id, Winch::default())?;
                info!(peer = %id, "peer connected");
                self.notify(format!("{} connected", id));
            }
            PeerEvent::Input { id, data } => {
                if self.options.read_only {
                    debug!(peer = %id, "input dropped (read-only)");
                    return Ok(());
                }
                if input_tx.send(data).await.is_err() {
                    return Err(PtycastError::command("PTY input queue closed"));
                }
            }
            PeerEvent::Resize { id, size } => {
                // A failed PTY resize is fatal; evictions during the
                // broadcast are not.
                let evicted = self.reconciler.observe(&id, size)?;
                for id in evicted {
                    warn!(peer = %id, "peer evicted during resize broadcast");
                }
            }
            PeerEvent::Disconnected { id } => {
                let was_registered = self.registry.remove(&id);
                self.reconciler.forget(&id)?;
                if was_registered {
                    info!(peer = %id, "peer disconnected");
                    self.notify(format!("{} disconnected", id));
                }
            }
        }
        Ok(())
    }

    /// T1: blocking reads of operator keystrokes into the input queue.
    fn spawn_stdin_pump(&self, input_tx: mpsc::Sender<Bytes>) {
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; STDIN_CHUNK];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if input_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// T2: drain the merged input queue into the PTY.
    fn spawn_input_drain(&self, mut input_rx: mpsc::Receiver<Bytes>) {
        let pty = Arc::clone(&self.pty);
        tokio::spawn(async move {
            while let Some(chunk) = input_rx.recv().await {
                if let Err(e) = pty.write_all(&chunk) {
                    debug!("PTY input write failed: {}", e);
                    return;
                }
            }
        });
    }

    /// T3: blocking PTY reads, fanned out to local stdout and all peers.
    fn spawn_output_fanout(&self, fatal_tx: mpsc::Sender<PtycastError>) {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(64);

        let pty = Arc::clone(&self.pty);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; PTY_CHUNK];
            loop {
                match pty.read(&mut buf) {
                    // 0 or EIO: the child is gone and the waiter will fire.
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if chunk_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let registry = Arc::clone(&self.registry);
        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let write_failed = {
                    let mut out = std::io::stdout().lock();
                    out.write_all(&chunk).and_then(|_| out.flush()).is_err()
                };
                if write_failed {
                    let _ = fatal_tx
                        .send(PtycastError::terminal("local stdout write failed"))
                        .await;
                    return;
                }

                for id in registry.broadcast(PeerMessage::Output(chunk)) {
                    warn!(peer = %id, "peer evicted: output queue overrun");
                    if let Err(e) = reconciler.forget(&id) {
                        let _ = fatal_tx.send(e).await;
                        return;
                    }
                }
            }
        });
    }

    /// T6: SIGWINCH drives the `"localhost"` entry. A winsize query failure
    /// here is fatal, since later reconciliation would be wrong.
    fn spawn_winch_handler(&self, fatal_tx: mpsc::Sender<PtycastError>) -> Result<()> {
        let mut winch = signal(SignalKind::window_change())
            .map_err(|e| PtycastError::terminal(format!("SIGWINCH handler: {}", e)))?;

        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(async move {
            while winch.recv().await.is_some() {
                let result = term::get_winsize(libc::STDIN_FILENO)
                    .and_then(|size| reconciler.observe(LOCALHOST, size));
                if let Err(e) = result {
                    let _ = fatal_tx.send(e).await;
                    return;
                }
            }
        });
        Ok(())
    }

    /// T8: block on the child, then trigger shutdown.
    fn spawn_child_waiter(&self) {
        let pty = Arc::clone(&self.pty);
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::task::spawn_blocking(move || {
            match pty.wait() {
                Ok(code) => debug!("child exited with status {}", code),
                Err(e) => debug!("child wait failed: {}", e),
            }
            let _ = shutdown_tx.send(());
        });
    }

    /// Transient top-bar banner, locally and on every peer, erased after a
    /// second.
    fn notify(&self, text: String) {
        if !self.options.notify {
            return;
        }

        let mut out = std::io::stdout();
        let _ = term::write_top(&mut out, &text);
        self.registry
            .broadcast(PeerMessage::Output(Bytes::from(term::banner_bytes(&text))));

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            tokio::time::sleep(BANNER_DURATION).await;
            let mut out = std::io::stdout();
            let _ = out.write_all(term::banner_clear_bytes());
            let _ = out.flush();
            registry.broadcast(PeerMessage::Output(Bytes::from_static(
                term::banner_clear_bytes(),
            )));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RemotePeer, PEER_QUEUE_DEPTH};

    // Multiplexer::new needs a real controlling terminal for the localhost
    // seed, so these tests build from parts with a fixed size.

    fn test_mux(options: MuxOptions) -> Multiplexer {
        Multiplexer::build(
            "cat",
            Winch::new(80, 24),
            options,
            Box::new(std::io::sink()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_only_drops_remote_input() {
        let mux = test_mux(MuxOptions {
            read_only: true,
            ..Default::default()
        });
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(8);

        mux.handle_event(
            PeerEvent::Input {
                id: "peer:1".into(),
                data: Bytes::from_static(b"x"),
            },
            &input_tx,
        )
        .await
        .unwrap();
        assert!(input_rx.try_recv().is_err(), "read-only input must be dropped");

        // Resize events still apply in read-only mode.
        mux.handle_event(
            PeerEvent::Resize {
                id: "peer:1".into(),
                size: Winch::new(60, 20),
            },
            &input_tx,
        )
        .await
        .unwrap();
        assert_eq!(mux.reconciler.effective(), Some(Winch::new(60, 20)));

        mux.shutdown();
    }

    #[tokio::test]
    async fn test_remote_input_reaches_queue() {
        let mux = test_mux(MuxOptions::default());
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(8);

        mux.handle_event(
            PeerEvent::Input {
                id: "peer:1".into(),
                data: Bytes::from_static(b"hello"),
            },
            &input_tx,
        )
        .await
        .unwrap();
        assert_eq!(&input_rx.try_recv().unwrap()[..], b"hello");

        mux.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_forgets_winsize() {
        let mux = test_mux(MuxOptions::default());
        let (input_tx, _input_rx) = mpsc::channel::<Bytes>(8);

        let (tx, _rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        mux.handle_event(
            PeerEvent::Connected {
                peer: RemotePeer::new("peer:1", tx),
            },
            &input_tx,
        )
        .await
        .unwrap();
        mux.handle_event(
            PeerEvent::Resize {
                id: "peer:1".into(),
                size: Winch::new(60, 20),
            },
            &input_tx,
        )
        .await
        .unwrap();
        assert_eq!(mux.reconciler.effective(), Some(Winch::new(60, 20)));

        mux.handle_event(
            PeerEvent::Disconnected {
                id: "peer:1".into(),
            },
            &input_tx,
        )
        .await
        .unwrap();
        assert_eq!(mux.registry.len(), 0);
        assert_eq!(mux.reconciler.effective(), Some(Winch::new(80, 24)));

        mux.shutdown();
    }

    #[tokio::test]
    async fn test_child_exit_triggers_shutdown_signal() {
        let pty = Arc::new(PtyProcess::spawn("true", Winch::new(80, 24)).unwrap());
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

        let waiter_pty = Arc::clone(&pty);
        let waiter_tx = shutdown_tx.clone();
        tokio::task::spawn_blocking(move || {
            let _ = waiter_pty.wait();
            let _ = waiter_tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(5), shutdown_rx.recv())
            .await
            .expect("child exit did not signal shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_output_broadcast_reaches_peer_queue() {
        let pty = Arc::new(PtyProcess::spawn("echo fanout; cat", Winch::new(80, 24)).unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        registry.add(RemotePeer::new("peer:1", tx));

        let mut buf = [0u8; PTY_CHUNK];
        let n = pty.read(&mut buf).unwrap();
        registry.broadcast(PeerMessage::Output(Bytes::copy_from_slice(&buf[..n])));

        match rx.recv().await.unwrap() {
            PeerMessage::Output(bytes) => assert_eq!(&bytes[..], b"fanout\r\n"),
            other => panic!("unexpected message: {:?}", other),
        }

        pty.kill().unwrap();
    }
}
