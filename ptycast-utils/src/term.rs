//! Raw-terminal capability
//!
//! Puts the operator's terminal into raw mode and guarantees restoration on
//! every exit path: the saved termios state and winsize live in a single
//! process-wide slot behind a mutex, so the fatal-error funnel can restore
//! the terminal without holding any object reference. Also carries the
//! winsize ioctls and the escape sequences the multiplexer emits (full
//! clear, top-bar banner).

use std::io::Write;
use std::os::fd::{BorrowedFd, RawFd};

use nix::sys::termios::{self, SetArg, Termios};
use parking_lot::Mutex;
use ptycast_protocol::Winch;

use crate::{PtycastError, Result};

/// The two-byte full-reset sequence (`ESC c`).
pub const CLEAR_SCREEN: &[u8] = b"\x1bc";

/// Saved terminal state: termios plus the winsize at save time. The winsize
/// is restored too, since the child may have altered it via escape
/// sequences.
#[derive(Debug)]
struct SavedTerm {
    fd: RawFd,
    termios: Termios,
    size: Winch,
}

static SAVED: Mutex<Option<SavedTerm>> = Mutex::new(None);

fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    // The fds passed here (stdin, PTY masters) outlive every call site.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// Query the window size of a terminal fd.
pub fn get_winsize(fd: RawFd) -> Result<Winch> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if rc == -1 {
        return Err(PtycastError::terminal(format!(
            "could not read winsize of fd {}: {}",
            fd,
            std::io::Error::last_os_error()
        )));
    }
    Ok(Winch::new(ws.ws_col, ws.ws_row))
}

/// Set the window size of a terminal fd.
pub fn set_winsize(fd: RawFd, size: Winch) -> Result<()> {
    let ws = libc::winsize {
        ws_row: size.height,
        ws_col: size.width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
    if rc == -1 {
        return Err(PtycastError::terminal(format!(
            "could not set winsize of fd {}: {}",
            fd,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Put `fd` into raw mode, recording the previous state in the process-wide
/// restore slot.
pub fn make_raw(fd: RawFd) -> Result<()> {
    let size = get_winsize(fd)?;
    let saved = termios::tcgetattr(borrowed(fd))
        .map_err(|e| PtycastError::terminal(format!("could not read termios: {}", e)))?;

    let mut raw = saved.clone();
    termios::cfmakeraw(&mut raw);
    termios::tcsetattr(borrowed(fd), SetArg::TCSANOW, &raw)
        .map_err(|e| PtycastError::terminal(format!("could not enter raw mode: {}", e)))?;

    *SAVED.lock() = Some(SavedTerm {
        fd,
        termios: saved,
        size,
    });
    Ok(())
}

/// Restore the terminal saved by [`make_raw`]. Idempotent: the second and
/// later calls are no-ops, so every exit path may call it unconditionally.
pub fn restore_terminal() -> Result<()> {
    let Some(saved) = SAVED.lock().take() else {
        return Ok(());
    };

    termios::tcsetattr(borrowed(saved.fd), SetArg::TCSADRAIN, &saved.termios)
        .map_err(|e| PtycastError::terminal(format!("could not restore termios: {}", e)))?;
    set_winsize(saved.fd, saved.size)
}

/// Write the full-reset sequence.
pub fn write_clear<W: Write>(w: &mut W) -> std::io::Result<()> {
    w.write_all(CLEAR_SCREEN)?;
    w.flush()
}

/// The top-bar banner sequence: save cursor, reverse video, home, erase
/// line, message, reset attributes, restore cursor.
pub fn banner_bytes(text: &str) -> Vec<u8> {
    let mut seq = Vec::with_capacity(text.len() + 16);
    seq.extend_from_slice(b"\x1b7");
    seq.extend_from_slice(b"\x1b[7m\x1b[1;1H\x1b[2K");
    seq.extend_from_slice(text.as_bytes());
    seq.extend_from_slice(b"\x1b[0m\x1b8");
    seq
}

/// The sequence that erases the banner line again.
pub fn banner_clear_bytes() -> &'static [u8] {
    b"\x1b7\x1b[1;1H\x1b[2K\x1b8"
}

/// Write a transient top-bar notification. The caller is responsible for
/// writing [`banner_clear_bytes`] after a delay.
pub fn write_top<W: Write>(w: &mut W, text: &str) -> std::io::Result<()> {
    w.write_all(&banner_bytes(text))?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_clear_sequence() {
        let mut out = Vec::new();
        write_clear(&mut out).unwrap();
        assert_eq!(out, [27, b'c']);
    }

    #[test]
    fn test_banner_sequence() {
        let seq = banner_bytes("hi");
        assert!(seq.starts_with(&[27, b'7', 27, b'[', b'7', b'm']));
        assert!(seq.ends_with(&[27, b'[', b'0', b'm', 27, b'8']));
        let text_at = seq.windows(2).position(|w| w == b"hi");
        assert!(text_at.is_some());
    }

    #[test]
    fn test_winsize_round_trip_on_pty() {
        let pty = nix::pty::openpty(None, None).unwrap();
        let fd = pty.master.as_raw_fd();
        set_winsize(fd, Winch::new(101, 42)).unwrap();
        assert_eq!(get_winsize(fd).unwrap(), Winch::new(101, 42));
    }

    #[test]
    fn test_restore_is_idempotent() {
        // Nothing saved: both calls are no-ops and must not fail.
        restore_terminal().unwrap();
        restore_terminal().unwrap();
    }
}
