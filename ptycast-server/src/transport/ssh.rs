//! SSH transport
//!
//! A russh server offering one session channel per connection. The channel
//! carries the raw PTY byte stream in both directions; resize information
//! travels as native channel requests: inbound `pty-req` and
//! `window-change` feed the reconciler, and effective-size changes go out
//! as `window-change` requests (four big-endian u32s per RFC 4254 §6.7),
//! followed by a clear-screen sequence when the height changed.
//!
//! Password auth is enabled by a nonempty password, public-key auth by a
//! nonempty authorized_keys path. Failed auth drops the connection with no
//! effect on the multiplexer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use ptycast_protocol::Winch;
use ptycast_utils::{term, PtycastError, Result};
use russh::server::{Auth, Config, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, ChannelMsg, MethodSet, Pty};
use russh_keys::key::PublicKey;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::PeerEvent;
use crate::registry::{PeerMessage, RemotePeer, PEER_QUEUE_DEPTH};

/// Settings for the SSH listener.
#[derive(Debug, Clone)]
pub struct SshServerConfig {
    pub username: String,
    /// Empty disables password authentication.
    pub password: String,
    pub host_key: PathBuf,
    /// Empty disables public-key authentication.
    pub authorized_keys: PathBuf,
}

fn winch_from_request(col_width: u32, row_height: u32) -> Winch {
    // Terminals cap well below 16 bits; anything larger is clamped.
    Winch::new(
        col_width.min(u16::MAX as u32) as u16,
        row_height.min(u16::MAX as u32) as u16,
    )
}

fn load_authorized_fingerprints(path: &Path) -> Result<Vec<String>> {
    if path.as_os_str().is_empty() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| {
        PtycastError::tls(format!(
            "could not read authorized keys {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut fingerprints = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(_algo), Some(b64)) = (fields.next(), fields.next()) else {
            return Err(PtycastError::tls(format!(
                "malformed authorized keys line in {}",
                path.display()
            )));
        };
        let key = russh_keys::parse_public_key_base64(b64).map_err(|e| {
            PtycastError::tls(format!("could not parse public key: {}", e))
        })?;
        fingerprints.push(key.fingerprint());
    }
    Ok(fingerprints)
}

/// Accept loop. Runs until the shutdown signal fires or the listener fails.
pub async fn serve(
    listen: String,
    config: SshServerConfig,
    events: mpsc::Sender<PeerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let host_key = russh_keys::load_secret_key(&config.host_key, None).map_err(|e| {
        PtycastError::tls(format!(
            "could not load host key {}: {}",
            config.host_key.display(),
            e
        ))
    })?;
    let authorized = Arc::new(load_authorized_fingerprints(&config.authorized_keys)?);

    let mut methods = MethodSet::empty();
    if !config.password.is_empty() {
        methods |= MethodSet::PASSWORD;
    }
    if !authorized.is_empty() {
        methods |= MethodSet::PUBLICKEY;
    }
    if methods.is_empty() {
        return Err(PtycastError::usage(
            "SSH transport needs a password (-p) or an authorized-keys file (-a)",
        ));
    }

    let server_config = Arc::new(Config {
        methods,
        keys: vec![host_key],
        ..Default::default()
    });

    let mut listener = SshListener {
        config: Arc::new(config),
        authorized,
        events,
    };

    info!("listening for SSH clients on {}", listen);
    tokio::select! {
        result = listener.run_on_address(server_config, listen.as_str()) => {
            result.map_err(|e| PtycastError::network(format!("SSH listener failed: {}", e)))
        }
        _ = shutdown.recv() => {
            info!("SSH listener shutting down");
            Ok(())
        }
    }
}

struct SshListener {
    config: Arc<SshServerConfig>,
    authorized: Arc<Vec<String>>,
    events: mpsc::Sender<PeerEvent>,
}

impl Server for SshListener {
    type Handler = SshPeer;

    fn new_client(&mut self, addr: Option<std::net::SocketAddr>) -> SshPeer {
        let id = addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        SshPeer {
            id,
            config: Arc::clone(&self.config),
            authorized: Arc::clone(&self.authorized),
            events: self.events.clone(),
            opened: false,
        }
    }
}

struct SshPeer {
    id: String,
    config: Arc<SshServerConfig>,
    authorized: Arc<Vec<String>>,
    events: mpsc::Sender<PeerEvent>,
    opened: bool,
}

impl SshPeer {
    async fn emit(&self, event: PeerEvent) -> std::result::Result<(), russh::Error> {
        // The multiplexer going away means the session is over.
        self.events
            .send(event)
            .await
            .map_err(|_| russh::Error::Disconnect)
    }
}

#[async_trait::async_trait]
impl Handler for SshPeer {
    type Error = russh::Error;

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        if !self.config.password.is_empty()
            && user == self.config.username
            && password == self.config.password
        {
            info!(peer = %self.id, user, "password auth accepted");
            return Ok(Auth::Accept);
        }
        warn!(peer = %self.id, user, "password auth rejected");
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        let fingerprint = key.fingerprint();
        if self.authorized.contains(&fingerprint) {
            info!(peer = %self.id, user, %fingerprint, "public key auth accepted");
            return Ok(Auth::Accept);
        }
        warn!(peer = %self.id, user, %fingerprint, "public key auth rejected");
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        // One session channel per connection.
        if self.opened {
            warn!(peer = %self.id, "second session channel rejected");
            return Ok(false);
        }
        self.opened = true;

        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        self.emit(PeerEvent::Connected {
            peer: RemotePeer::new(self.id.clone(), tx),
        })
        .await?;

        tokio::spawn(channel_loop(
            channel,
            rx,
            self.id.clone(),
            self.events.clone(),
        ));
        Ok(true)
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.emit(PeerEvent::Input {
            id: self.id.clone(),
            data: Bytes::copy_from_slice(data),
        })
        .await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        self.emit(PeerEvent::Resize {
            id: self.id.clone(),
            size: winch_from_request(col_width, row_height),
        })
        .await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        self.emit(PeerEvent::Resize {
            id: self.id.clone(),
            size: winch_from_request(col_width, row_height),
        })
        .await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        // The session mirrors one shared PTY; arbitrary commands are not on
        // offer.
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = session.channel_failure(channel);
        Ok(())
    }
}

/// Per-connection writer. Inbound messages arrive through the handler
/// callbacks; this task only drains the mirrored channel queue and pushes
/// outbound traffic.
async fn channel_loop(
    mut channel: Channel<Msg>,
    mut rx: mpsc::Receiver<PeerMessage>,
    id: String,
    events: mpsc::Sender<PeerEvent>,
) {
    loop {
        tokio::select! {
            msg = channel.wait() => {
                match msg {
                    // Handled by the session handler; drained here so the
                    // mirror queue never backs up.
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            out = rx.recv() => {
                let Some(out) = out else {
                    // Evicted from the registry or server shutdown.
                    break;
                };
                let result = match out {
                    PeerMessage::Output(bytes) => channel.data(&bytes[..]).await,
                    PeerMessage::Resize { size, clear } => {
                        let sent = channel
                            .window_change(size.width as u32, size.height as u32, 0, 0)
                            .await;
                        match sent {
                            Ok(()) if clear => channel.data(term::CLEAR_SCREEN).await,
                            other => other,
                        }
                    }
                };
                if let Err(e) = result {
                    debug!(peer = %id, "write failed, dropping peer: {}", e);
                    break;
                }
            }
        }
    }

    let _ = channel.close().await;
    let _ = events.send(PeerEvent::Disconnected { id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_winch_from_request_clamps() {
        assert_eq!(winch_from_request(80, 24), Winch::new(80, 24));
        assert_eq!(winch_from_request(70_000, 24), Winch::new(u16::MAX, 24));
    }

    #[test]
    fn test_empty_authorized_keys_path_disables_pubkey() {
        let fingerprints = load_authorized_fingerprints(&PathBuf::new()).unwrap();
        assert!(fingerprints.is_empty());
    }

    #[test]
    fn test_missing_authorized_keys_file_is_tls_error() {
        let err =
            load_authorized_fingerprints(&PathBuf::from("/nonexistent/keys")).unwrap_err();
        assert_eq!(err.exit_code(), ptycast_utils::error::EXIT_TLS);
    }
}
