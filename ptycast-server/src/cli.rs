//! Command-line argument parsing for ptycastd
//!
//! The transport is a subcommand; everything after it is shared: the
//! listen address, the command to run, read-only mode, and notifications.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::mux::MuxOptions;

/// ptycastd - share one PTY session with authenticated remote viewers
#[derive(Parser, Debug)]
#[command(name = "ptycastd", version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub transport: Transport,
}

#[derive(Subcommand, Debug)]
pub enum Transport {
    /// Serve over mutual TLS with a framed wire protocol
    Tls(TlsArgs),
    /// Serve over SSH (password and/or public-key auth)
    Ssh(SshArgs),
}

impl Transport {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Transport::Tls(args) => &args.common,
            Transport::Ssh(args) => &args.common,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct TlsArgs {
    /// Path to the CA certificate clients are verified against
    #[arg(long, default_value = "ca.crt")]
    pub ca: PathBuf,

    /// Path to the server certificate
    #[arg(short = 'c', long, default_value = "server.crt")]
    pub cert: PathBuf,

    /// Path to the server key
    #[arg(short = 'k', long, default_value = "server.key")]
    pub key: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(clap::Args, Debug)]
pub struct SshArgs {
    /// Username for password authentication
    #[arg(short = 'u', long, default_value = "ptycast")]
    pub username: String,

    /// Password for password authentication (empty disables it)
    #[arg(short = 'p', long, default_value = "")]
    pub password: String,

    /// Path to the server host key
    #[arg(short = 'k', long = "host-key", default_value = "host_key")]
    pub host_key: PathBuf,

    /// Path to an OpenSSH authorized_keys file (empty disables public-key
    /// auth)
    #[arg(short = 'a', long = "authorized-keys", default_value = "")]
    pub authorized_keys: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(clap::Args, Debug)]
pub struct CommonArgs {
    /// Drop input from remote clients; only their resize events apply
    #[arg(short = 'r', long = "read-only")]
    pub read_only: bool,

    /// Show connect/disconnect banners in a top bar
    #[arg(short = 'n', long = "notify")]
    pub notify: bool,

    /// host:port to listen on
    pub listen: String,

    /// Program to run under the PTY (via /bin/sh -c)
    pub command: String,
}

impl CommonArgs {
    pub fn mux_options(&self) -> MuxOptions {
        MuxOptions {
            read_only: self.read_only,
            notify: self.notify,
        }
    }
}
