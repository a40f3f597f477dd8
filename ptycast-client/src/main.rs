//! ptycast - TLS client for a shared PTY session
//!
//! Connects with a client certificate, raw-modes the local terminal, and
//! then pipes: local keystrokes out as `Data` frames, inbound `Data` to
//! stdout, and inbound `Winch` as a local clear (the server refreshes the
//! screen right after). The local window size is reported on connect and on
//! every SIGWINCH.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use ptycast_protocol::{CodecError, Frame, FrameCodec};
use ptycast_utils::error::EXIT_USAGE;
use ptycast_utils::logging::{init_logging, LogConfig};
use ptycast_utils::{term, PtycastError, Result};
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

mod cli;
mod detach;

use cli::Args;
use detach::DetachDetector;

const STDIN_CHUNK: usize = 256;

/// How a background task ends the session.
enum ClientExit {
    /// Peer went away or the detach sequence fired: not an error.
    Clean,
    Fatal(PtycastError),
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_USAGE);
        }
    };

    if let Err(e) = init_logging(LogConfig::client()) {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }

    match run(args).await {
        Ok(()) => {
            let _ = term::restore_terminal();
            println!("\nConnection terminated!");
            std::process::exit(0);
        }
        Err(e) => {
            let _ = term::restore_terminal();
            println!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let detach = args
        .detach_keys
        .as_deref()
        .map(DetachDetector::parse)
        .transpose()?;

    // Dial first: connect failures should print on a cooked terminal.
    let stream = connect(&args).await?;
    term::make_raw(libc::STDIN_FILENO)?;

    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames_in = FramedRead::new(read_half, FrameCodec::new());

    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(64);
    let (exit_tx, mut exit_rx) = mpsc::channel::<ClientExit>(1);

    tokio::spawn(write_loop(
        FramedWrite::new(write_half, FrameCodec::new()),
        frame_rx,
        exit_tx.clone(),
    ));

    // Report our size before anything else; the server folds it into the
    // effective size.
    let size = term::get_winsize(libc::STDIN_FILENO)?;
    let _ = frame_tx.send(Frame::Winch(size)).await;

    spawn_winch_reporter(frame_tx.clone(), exit_tx.clone())?;
    spawn_stdin_pump(frame_tx, detach, exit_tx);

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            Some(exit) = exit_rx.recv() => {
                return match exit {
                    ClientExit::Clean => Ok(()),
                    ClientExit::Fatal(e) => Err(e),
                };
            }
            frame = frames_in.next() => match frame {
                None => return Ok(()),
                Some(Ok(Frame::Data(data))) => {
                    stdout
                        .write_all(&data)
                        .and_then(|_| stdout.flush())
                        .map_err(|e| {
                            PtycastError::terminal(format!("stdout write failed: {}", e))
                        })?;
                }
                Some(Ok(Frame::Winch(_))) => {
                    // The host refreshes right after; just reset the screen.
                    let _ = term::write_clear(&mut stdout);
                }
                Some(Err(e)) => {
                    return Err(PtycastError::protocol(format!(
                        "bad frame from server: {}",
                        e
                    )));
                }
            },
        }
    }
}

async fn write_loop(
    mut frames_out: FramedWrite<WriteHalf<TlsStream<TcpStream>>, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    exit_tx: mpsc::Sender<ClientExit>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = frames_out.send(frame).await {
            let exit = match &e {
                // The server hung up mid-write; same as a clean close.
                CodecError::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe => {
                    ClientExit::Clean
                }
                _ => ClientExit::Fatal(PtycastError::network(format!(
                    "error writing to server: {}",
                    e
                ))),
            };
            let _ = exit_tx.send(exit).await;
            return;
        }
    }
}

fn spawn_winch_reporter(
    frame_tx: mpsc::Sender<Frame>,
    exit_tx: mpsc::Sender<ClientExit>,
) -> Result<()> {
    let mut winch = signal(SignalKind::window_change())
        .map_err(|e| PtycastError::terminal(format!("SIGWINCH handler: {}", e)))?;

    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            match term::get_winsize(libc::STDIN_FILENO) {
                Ok(size) => {
                    if frame_tx.send(Frame::Winch(size)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = exit_tx.send(ClientExit::Fatal(e)).await;
                    return;
                }
            }
        }
    });
    Ok(())
}

fn spawn_stdin_pump(
    frame_tx: mpsc::Sender<Frame>,
    mut detach: Option<DetachDetector>,
    exit_tx: mpsc::Sender<ClientExit>,
) {
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; STDIN_CHUNK];
        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };

            let chunk = match detach.as_mut() {
                Some(detector) => {
                    let (cleaned, detached) = detector.feed(&buf[..n]);
                    if detached {
                        debug!("detach sequence pressed");
                        let _ = exit_tx.blocking_send(ClientExit::Clean);
                        return;
                    }
                    if cleaned.is_empty() {
                        continue;
                    }
                    Bytes::from(cleaned)
                }
                None => Bytes::copy_from_slice(&buf[..n]),
            };

            if frame_tx.blocking_send(Frame::Data(chunk)).is_err() {
                return;
            }
        }
    });
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

async fn connect(args: &Args) -> Result<TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&args.ca)?
        .into_iter()
        .chain(load_certs(&args.servercert)?)
    {
        roots
            .add(cert)
            .map_err(|e| PtycastError::tls(format!("bad trust certificate: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(&args.cert)?, load_key(&args.key)?)
        .map_err(|e| PtycastError::tls(format!("client certificate: {}", e)))?;
    let connector = TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(&args.host)
        .await
        .map_err(|e| PtycastError::Connect {
            addr: args.host.clone(),
            reason: e.to_string(),
        })?;

    let hostname = args
        .host
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(&args.host)
        .to_string();
    let server_name = ServerName::try_from(hostname)
        .map_err(|e| PtycastError::tls(format!("invalid server name: {}", e)))?;

    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| PtycastError::Connect {
            addr: args.host.clone(),
            reason: e.to_string(),
        })
}
