//! Shared infrastructure for ptycast binaries
//!
//! Carries the unified error type with its categorized exit codes, the
//! tracing bootstrap, and the raw-terminal capability (termios save/restore,
//! winsize ioctls, and the escape sequences the multiplexer emits).

pub mod error;
pub mod logging;
pub mod term;

pub use error::{PtycastError, Result};
