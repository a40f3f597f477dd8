//! Child process under a pseudo-terminal
//!
//! Wraps portable-pty: the command runs as `/bin/sh -c <command>` with
//! `TERM=screen-256color`, and the master side is exposed as blocking
//! reader/writer handles suitable for `spawn_blocking` pump tasks.

use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use ptycast_protocol::Winch;
use ptycast_utils::{PtycastError, Result};

fn pty_size(ws: Winch) -> PtySize {
    PtySize {
        rows: ws.height,
        cols: ws.width,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A running child on a PTY.
pub struct PtyProcess {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    // Separate killer handle: `wait` holds the child lock for the child's
    // whole lifetime.
    killer: Arc<Mutex<Box<dyn ChildKiller + Send + Sync>>>,
    child_pid: Option<u32>,
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl PtyProcess {
    /// Spawn `/bin/sh -c <command>` under a new PTY of the given size.
    pub fn spawn(command: &str, size: Winch) -> Result<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|e| PtycastError::terminal(format!("could not open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.args(["-c", command]);
        cmd.env("TERM", "screen-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtycastError::command(format!("{}: {}", command, e)))?;
        let killer = child.clone_killer();
        let child_pid = child.process_id();

        // The child holds the slave now; keeping our copy open would stop
        // the master from reporting EOF when the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtycastError::terminal(format!("could not clone PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtycastError::terminal(format!("could not take PTY writer: {}", e)))?;

        Ok(Self {
            master: Arc::new(Mutex::new(pair.master)),
            child: Arc::new(Mutex::new(child)),
            killer: Arc::new(Mutex::new(killer)),
            child_pid,
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    /// Blocking read of the next chunk of child output.
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.lock().read(buf)
    }

    /// Write input to the child. Chunks are written whole, so input from
    /// different sources interleaves at chunk granularity only.
    pub fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()
    }

    /// Current PTY size.
    pub fn size(&self) -> Result<Winch> {
        let size = self
            .master
            .lock()
            .get_size()
            .map_err(|e| PtycastError::terminal(format!("could not read PTY size: {}", e)))?;
        Ok(Winch::new(size.cols, size.rows))
    }

    /// Resize the PTY. A failure here is fatal: the child's view of the
    /// terminal would no longer match any participant.
    pub fn resize(&self, size: Winch) -> Result<()> {
        self.master
            .lock()
            .resize(pty_size(size))
            .map_err(|e| PtycastError::terminal(format!("could not set PTY size: {}", e)))
    }

    /// Block until the child exits.
    pub fn wait(&self) -> Result<u32> {
        let status = self
            .child
            .lock()
            .wait()
            .map_err(|e| PtycastError::command(format!("wait failed: {}", e)))?;
        Ok(status.exit_code())
    }

    /// Terminate the child with SIGTERM. Safe to call while another task is
    /// blocked in `wait`.
    pub fn kill(&self) -> Result<()> {
        if let Some(pid) = self.child_pid {
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
                return Ok(());
            }
        }
        self.killer
            .lock()
            .kill()
            .map_err(|e| PtycastError::command(format!("kill failed: {}", e)))
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_echo_through_pty() {
        let pty = PtyProcess::spawn("echo hello; cat", Winch::new(80, 24)).unwrap();

        let mut buf = [0u8; 32];
        let n = pty.read(&mut buf).unwrap();
        // PTY echo discipline turns \n into \r\n.
        assert_eq!(&buf[..n], b"hello\r\n");

        pty.kill().unwrap();
        pty.wait().unwrap();
    }

    #[test]
    fn test_resize_round_trip() {
        let pty = PtyProcess::spawn("cat", Winch::new(100, 30)).unwrap();
        assert_eq!(pty.size().unwrap(), Winch::new(100, 30));

        pty.resize(Winch::new(60, 20)).unwrap();
        assert_eq!(pty.size().unwrap(), Winch::new(60, 20));

        pty.kill().unwrap();
        pty.wait().unwrap();
    }

    #[test]
    fn test_wait_reports_exit() {
        let pty = PtyProcess::spawn("true", Winch::new(80, 24)).unwrap();
        assert_eq!(pty.wait().unwrap(), 0);
    }
}
