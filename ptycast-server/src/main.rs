//! ptycastd - PTY session multiplexer daemon
//!
//! Mirrors one interactive PTY session to authenticated remote viewers and
//! merges their input and window sizes back in. Every exit path restores
//! the operator's terminal before the process ends.

use clap::Parser;
use ptycast_utils::error::EXIT_USAGE;
use ptycast_utils::logging::{init_logging, LogConfig};
use ptycast_utils::{term, PtycastError, Result};
use tokio::sync::mpsc;
use tracing::error;

mod cli;
mod mux;
mod pty;
mod registry;
mod transport;
mod winsize;

use cli::{Args, Transport};
use mux::Multiplexer;
use transport::ssh::SshServerConfig;
use transport::tls::TlsServerConfig;

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_USAGE);
        }
    };

    if let Err(e) = init_logging(LogConfig::server()) {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }

    match run(args).await {
        Ok(()) => {
            let _ = term::restore_terminal();
            println!("\nShell exited!");
            std::process::exit(0);
        }
        Err(e) => {
            // Restore before printing: the message must land on a sane
            // terminal.
            let _ = term::restore_terminal();
            error!("fatal: {}", e);
            println!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(args: Args) -> Result<()> {
    term::make_raw(libc::STDIN_FILENO)?;

    let common = args.transport.common();
    let listen = common.listen.clone();
    let options = common.mux_options();

    let mux = Multiplexer::new(&common.command, options)?;
    let (events_tx, events_rx) = mpsc::channel(128);
    let shutdown_rx = mux.shutdown_rx();

    let mut listener = match args.transport {
        Transport::Tls(tls) => {
            let config = TlsServerConfig {
                ca: tls.ca,
                cert: tls.cert,
                key: tls.key,
            };
            tokio::spawn(transport::tls::serve(listen, config, events_tx, shutdown_rx))
        }
        Transport::Ssh(ssh) => {
            let config = SshServerConfig {
                username: ssh.username,
                password: ssh.password,
                host_key: ssh.host_key,
                authorized_keys: ssh.authorized_keys,
            };
            tokio::spawn(transport::ssh::serve(listen, config, events_tx, shutdown_rx))
        }
    };

    let result = tokio::select! {
        result = mux.run(events_rx) => result,
        joined = &mut listener => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(PtycastError::network(format!("listener task failed: {}", e))),
        },
    };

    mux.shutdown();
    result
}
