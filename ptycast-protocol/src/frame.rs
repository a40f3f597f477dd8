//! Frame and window-size types

use bytes::Bytes;

/// Terminal window dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Winch {
    pub width: u16,
    pub height: u16,
}

impl Winch {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// True if either axis is zero. Zero axes carry no size information
    /// and are skipped when computing a common size.
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Winch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A single message on the embedded wire protocol.
///
/// Servers send `Data` carrying PTY output and `Winch` announcing a new
/// effective size (clients clear their screen on receipt). Clients send
/// `Data` carrying keystrokes and `Winch` carrying their own size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A desired or announced window size.
    Winch(Winch),
    /// An opaque chunk of the byte stream.
    Data(Bytes),
}

impl Frame {
    pub fn winch(width: u16, height: u16) -> Self {
        Frame::Winch(Winch::new(width, height))
    }

    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Frame::Data(bytes.into())
    }
}
