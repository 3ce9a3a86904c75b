//! Cursor-positioned display (`-c`): the line is painted at a fixed
//! terminal row instead of the current one, so several transfers can
//! stack their displays.
//!
//! The row is discovered once with an ECMA-48 cursor position report,
//! serialised against other instances by a lock file in the runtime
//! directory. Coordination of row *allocation* between concurrent
//! instances is deliberately not attempted here; each instance anchors to
//! the row it started on.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;

use nix::sys::termios::{self, LocalFlags, SetArg};
use tracing::{event, Level};

use crate::state::Engine;
use crate::{fdio, remote};

/// Ask the terminal where the cursor is. Returns the 1-based row.
fn query_cursor_row() -> Option<u16> {
    let tty = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/tty")
        .ok()?;
    let fd = tty.as_raw_fd();

    // Canonical mode would hold the reply until a newline that never
    // comes; echo would splat the reply onto the display.
    let saved = termios::tcgetattr(&tty).ok()?;
    let mut raw = saved.clone();
    raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
    termios::tcsetattr(&tty, SetArg::TCSANOW, &raw).ok()?;

    let row = (|| {
        fdio::write_retry(fd, b"\x1b[6n");
        let mut reply = Vec::new();
        let mut buf = [0u8; 32];
        // Reply format: ESC [ row ; col R
        for _ in 0..10 {
            if !fdio::poll_readable(fd, 100).ok()? {
                break;
            }
            let got = fdio::read_fd(fd, &mut buf).ok()?;
            if got == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..got]);
            if reply.contains(&b'R') {
                break;
            }
        }
        let text = String::from_utf8_lossy(&reply);
        let start = text.find("\x1b[")? + 2;
        let rest = &text[start..];
        let semi = rest.find(';')?;
        rest[..semi].parse::<u16>().ok()
    })();

    let _ = termios::tcsetattr(&tty, SetArg::TCSANOW, &saved);
    row
}

/// Hold a lock file while probing the cursor, so two instances starting
/// at once do not interleave their position reports.
fn with_probe_lock<T>(probe: impl FnOnce() -> T) -> T {
    let lock_path = remote::runtime_dir().join("cursor.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .ok();
    if let Some(file) = &lock_file {
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_EX);
        }
    }
    let result = probe();
    if let Some(file) = &lock_file {
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
    result
}

impl Engine {
    /// Remember the row this display will repaint. Called lazily so a
    /// SIGCONT-triggered reinit just clears the stored row.
    pub fn cursor_init(&mut self) {
        if !self.control.cursor {
            return;
        }
        self.cursor_row = with_probe_lock(query_cursor_row);
        match self.cursor_row {
            Some(row) => event!(Level::DEBUG, row, "cursor display anchored"),
            None => event!(Level::DEBUG, "cursor position unavailable"),
        }
    }

    /// Paint the current display buffer at the anchored row.
    pub fn cursor_paint(&mut self) {
        if !self.cursor_probed {
            self.cursor_init();
            self.cursor_probed = true;
        }
        match self.cursor_row {
            Some(row) => {
                let mut out = Vec::with_capacity(self.display.display_buffer.len() + 16);
                let _ = write!(out, "\x1b[{};1H", row);
                out.extend_from_slice(self.display.display_buffer.as_bytes());
                fdio::write_retry(libc::STDERR_FILENO, &out);
            }
            None => {
                // No terminal to anchor to; degrade to the default mode.
                fdio::write_retry(libc::STDERR_FILENO, self.display.display_buffer.as_bytes());
                fdio::write_retry(libc::STDERR_FILENO, b"\r");
            }
        }
    }

    /// Leave the cursor below the painted row so the shell prompt does
    /// not land on top of the display.
    pub fn cursor_fini(&mut self) {
        if let Some(row) = self.cursor_row.take() {
            let mut out = Vec::new();
            let _ = write!(out, "\x1b[{};1H\n", row);
            fdio::write_retry(libc::STDERR_FILENO, &out);
        }
    }
}
