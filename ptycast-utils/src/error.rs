//! Error types for ptycast
//!
//! A single error enum shared by all crates. Every variant maps onto one of
//! the categorized process exit codes; categories combine bitwise for
//! failures that span two (a TLS dial error is both TLS and network).

/// Exit code bit for usage errors.
pub const EXIT_USAGE: i32 = 1;
/// Exit code bit for local-terminal failures.
pub const EXIT_TERMINAL: i32 = 1 << 1;
/// Exit code bit for child-command failures.
pub const EXIT_COMMAND: i32 = 1 << 2;
/// Exit code bit for TLS failures.
pub const EXIT_TLS: i32 = 1 << 3;
/// Exit code bit for network failures.
pub const EXIT_NETWORK: i32 = 1 << 4;

/// Main error type for ptycast operations
#[derive(Debug, thiserror::Error)]
pub enum PtycastError {
    #[error("{0}")]
    Usage(String),

    #[error("terminal error: {0}")]
    Terminal(String),

    #[error("could not start program: {0}")]
    Command(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("could not connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PtycastError {
    /// Create a usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Create a terminal error
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// Create a command error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// The categorized process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => EXIT_USAGE,
            Self::Terminal(_) => EXIT_TERMINAL,
            Self::Command(_) => EXIT_COMMAND,
            Self::Tls(_) => EXIT_TLS,
            Self::Network(_) | Self::Protocol(_) | Self::Io(_) => EXIT_NETWORK,
            Self::Connect { .. } => EXIT_TLS | EXIT_NETWORK,
        }
    }
}

/// Result type alias using PtycastError
pub type Result<T> = std::result::Result<T, PtycastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(PtycastError::usage("x").exit_code(), 1);
        assert_eq!(PtycastError::terminal("x").exit_code(), 2);
        assert_eq!(PtycastError::command("x").exit_code(), 4);
        assert_eq!(PtycastError::tls("x").exit_code(), 8);
        assert_eq!(PtycastError::network("x").exit_code(), 16);
    }

    #[test]
    fn test_combined_exit_code() {
        let err = PtycastError::Connect {
            addr: "host:4321".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.exit_code(), 24);
    }

    #[test]
    fn test_error_display() {
        let err = PtycastError::terminal("no tty");
        assert_eq!(err.to_string(), "terminal error: no tty");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: PtycastError = io_err.into();
        assert_eq!(err.exit_code(), EXIT_NETWORK);
    }
}
