//! Command-line argument parsing for the ptycast client

use std::path::PathBuf;

use clap::Parser;

/// ptycast - join a shared PTY session over mutual TLS
#[derive(Parser, Debug)]
#[command(name = "ptycast", version, about, long_about = None)]
pub struct Args {
    /// Path to the CA certificate
    #[arg(long, default_value = "ca.crt")]
    pub ca: PathBuf,

    /// Path to the server certificate
    #[arg(short = 's', long = "servercert", default_value = "server.crt")]
    pub servercert: PathBuf,

    /// Path to the client certificate
    #[arg(short = 'c', long, default_value = "client.crt")]
    pub cert: PathBuf,

    /// Path to the client key
    #[arg(short = 'k', long, default_value = "client.key")]
    pub key: PathBuf,

    /// Key sequence that detaches the client, e.g. "ctrl-p,ctrl-q".
    /// Disabled when not given.
    #[arg(long = "detach-keys")]
    pub detach_keys: Option<String>,

    /// host:port of the server
    pub host: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["ptycast", "example.com:4321"]);
        assert_eq!(args.ca, PathBuf::from("ca.crt"));
        assert_eq!(args.servercert, PathBuf::from("server.crt"));
        assert_eq!(args.cert, PathBuf::from("client.crt"));
        assert_eq!(args.key, PathBuf::from("client.key"));
        assert!(args.detach_keys.is_none());
        assert_eq!(args.host, "example.com:4321");
    }

    #[test]
    fn test_detach_keys_flag() {
        let args =
            Args::parse_from(["ptycast", "--detach-keys", "ctrl-p,ctrl-q", "h:1"]);
        assert_eq!(args.detach_keys.as_deref(), Some("ctrl-p,ctrl-q"));
    }

    #[test]
    fn test_host_required() {
        assert!(Args::try_parse_from(["ptycast"]).is_err());
    }
}
