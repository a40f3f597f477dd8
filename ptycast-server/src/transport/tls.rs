//! Mutual-TLS transport
//!
//! TCP + rustls with required client-certificate verification against the
//! configured CA. The embedded stream is framed in both directions with
//! [`FrameCodec`]: the server sends `Data` (PTY output) and `Winch`
//! (effective-size changes, which clients treat as clear-and-resize);
//! clients send `Data` (keystrokes) and `Winch` (their window size).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use ptycast_protocol::{Frame, FrameCodec};
use ptycast_utils::{PtycastError, Result};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::PeerEvent;
use crate::registry::{PeerMessage, RemotePeer, PEER_QUEUE_DEPTH};

/// Certificate material for the TLS listener.
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(|e| {
        PtycastError::tls(format!("could not read certificate {}: {}", path.display(), e))
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| {
            PtycastError::tls(format!("could not parse {}: {}", path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(PtycastError::tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).map_err(|e| {
        PtycastError::tls(format!("could not read key {}: {}", path.display(), e))
    })?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| PtycastError::tls(format!("could not parse {}: {}", path.display(), e)))?
        .ok_or_else(|| PtycastError::tls(format!("no private key found in {}", path.display())))
}

fn build_acceptor(config: &TlsServerConfig) -> Result<TlsAcceptor> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&config.ca)? {
        roots
            .add(cert)
            .map_err(|e| PtycastError::tls(format!("bad CA certificate: {}", e)))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| PtycastError::tls(format!("client verifier: {}", e)))?;

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&config.cert)?, load_key(&config.key)?)
        .map_err(|e| PtycastError::tls(format!("server certificate: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Accept loop. Runs until the shutdown signal fires or the bind fails.
pub async fn serve(
    listen: String,
    config: TlsServerConfig,
    events: mpsc::Sender<PeerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let acceptor = build_acceptor(&config)?;
    let listener = TcpListener::bind(&listen).await.map_err(|e| {
        PtycastError::network(format!("could not listen on {}: {}", listen, e))
    })?;
    info!("listening for TLS clients on {}", listen);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let acceptor = acceptor.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            handle_connection(acceptor, stream, addr.to_string(), events)
                                .await;
                        });
                    }
                    Err(e) => warn!("accept error: {}", e),
                }
            }
            _ = shutdown.recv() => {
                info!("TLS listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    id: String,
    events: mpsc::Sender<PeerEvent>,
) {
    // Unauthenticated peers fail here, with no effect on the multiplexer.
    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            warn!(peer = %id, "TLS handshake rejected: {}", e);
            return;
        }
    };
    info!(peer = %id, "TLS client connected");

    let (read_half, write_half) = tokio::io::split(tls);
    let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);

    if events
        .send(PeerEvent::Connected {
            peer: RemotePeer::new(id.clone(), tx),
        })
        .await
        .is_err()
    {
        return;
    }

    tokio::spawn(write_loop(write_half, rx, id.clone()));
    read_loop(read_half, id, events).await;
}

async fn write_loop(
    write_half: WriteHalf<TlsStream<TcpStream>>,
    mut rx: mpsc::Receiver<PeerMessage>,
    id: String,
) {
    let mut framed = FramedWrite::new(write_half, FrameCodec::new());
    while let Some(msg) = rx.recv().await {
        let frame = match msg {
            PeerMessage::Output(bytes) => Frame::Data(bytes),
            // The client clears its own screen on any Winch, so the clear
            // flag needs no separate message on this transport.
            PeerMessage::Resize { size, .. } => Frame::Winch(size),
        };
        if let Err(e) = framed.send(frame).await {
            debug!(peer = %id, "write failed, dropping peer: {}", e);
            break;
        }
    }
    // Channel closed: the peer was evicted or the server is shutting down.
    let _ = framed.into_inner().shutdown().await;
}

async fn read_loop(
    read_half: ReadHalf<TlsStream<TcpStream>>,
    id: String,
    events: mpsc::Sender<PeerEvent>,
) {
    let mut framed = FramedRead::new(read_half, FrameCodec::new());
    while let Some(item) = framed.next().await {
        match item {
            Ok(Frame::Data(data)) => {
                if events
                    .send(PeerEvent::Input {
                        id: id.clone(),
                        data,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(Frame::Winch(size)) => {
                if events
                    .send(PeerEvent::Resize {
                        id: id.clone(),
                        size,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                // Protocol violation or transport failure: cut the peer off.
                debug!(peer = %id, "inbound frame error: {}", e);
                break;
            }
        }
    }
    let _ = events.send(PeerEvent::Disconnected { id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_ca_is_tls_error() {
        let config = TlsServerConfig {
            ca: PathBuf::from("/nonexistent/ca.crt"),
            cert: PathBuf::from("/nonexistent/server.crt"),
            key: PathBuf::from("/nonexistent/server.key"),
        };
        let err = match build_acceptor(&config) {
            Ok(_) => panic!("expected build_acceptor to fail"),
            Err(e) => e,
        };
        assert_eq!(err.exit_code(), ptycast_utils::error::EXIT_TLS);
    }
}
