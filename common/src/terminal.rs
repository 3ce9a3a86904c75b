//! Terminal state: foreground detection, geometry, and the TOSTOP
//! discipline that makes backgrounded instances receive SIGTTOU instead of
//! scribbling over the shell.

use std::io::stderr;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::termios::{self, LocalFlags, SetArg};
use tracing::{event, Level};

/// Set if `ensure_tostop` had to turn the attribute on, so teardown knows
/// to put the terminal back the way it found it.
static TOSTOP_ADDED: AtomicBool = AtomicBool::new(false);

/// True if we are the foreground process group on the controlling
/// terminal, or if standard error is not a terminal at all.
///
/// `ENOTTY` from the process-group query is treated as "foreground", so
/// running without a controlling terminal keeps the display alive.
pub fn in_foreground() -> bool {
    if unsafe { libc::isatty(libc::STDERR_FILENO) } == 0 {
        return true;
    }

    let tty_pgrp = unsafe { libc::tcgetpgrp(libc::STDERR_FILENO) };
    if tty_pgrp == -1 {
        if let Some(libc::ENOTTY) = std::io::Error::last_os_error().raw_os_error() {
            return true;
        }
    }

    let our_pgrp = unsafe { libc::getpgrp() };
    our_pgrp == tty_pgrp
}

/// Query the terminal size, leaving the inputs untouched on failure.
pub fn screen_size(width: &mut u32, height: &mut u32) {
    if unsafe { libc::isatty(libc::STDERR_FILENO) } == 0 {
        return;
    }
    let mut wsz: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(libc::STDERR_FILENO, libc::TIOCGWINSZ, &mut wsz) };
    if rc == 0 {
        if wsz.ws_col > 0 {
            *width = wsz.ws_col as u32;
        }
        if wsz.ws_row > 0 {
            *height = wsz.ws_row as u32;
        }
    }
}

/// Make sure TOSTOP is set on the controlling terminal, so that a write
/// from a backgrounded process raises SIGTTOU instead of succeeding
/// silently. Remembers whether this process added the attribute.
pub fn ensure_tostop() {
    let mut attrs = match termios::tcgetattr(stderr()) {
        Ok(attrs) => attrs,
        Err(err) => {
            event!(Level::DEBUG, "failed to read terminal attributes: {}", err);
            return;
        }
    };

    if !attrs.local_flags.contains(LocalFlags::TOSTOP) {
        attrs.local_flags.insert(LocalFlags::TOSTOP);
        match termios::tcsetattr(stderr(), SetArg::TCSANOW, &attrs) {
            Ok(()) => {
                TOSTOP_ADDED.store(true, Ordering::SeqCst);
                event!(Level::DEBUG, "set terminal TOSTOP attribute");
            }
            Err(err) => {
                event!(Level::DEBUG, "failed to set TOSTOP: {}", err);
            }
        }
    }
}

/// Clear TOSTOP again at teardown, but only if this process set it and is
/// still in the foreground to do so safely.
pub fn clear_tostop_if_added() {
    if !TOSTOP_ADDED.swap(false, Ordering::SeqCst) {
        return;
    }
    if !in_foreground() {
        return;
    }
    if let Ok(mut attrs) = termios::tcgetattr(stderr()) {
        if attrs.local_flags.contains(LocalFlags::TOSTOP) {
            attrs.local_flags.remove(LocalFlags::TOSTOP);
            let _ = termios::tcsetattr(stderr(), SetArg::TCSANOW, &attrs);
        }
    }
}

/// Whether the locale allows multi-byte UTF-8 output, from `LC_ALL`,
/// `LC_CTYPE`, or `LANG`.
pub fn locale_allows_utf8() -> bool {
    for key in ["LC_ALL", "LC_CTYPE", "LANG"] {
        if let Ok(value) = std::env::var(key) {
            if value.is_empty() {
                continue;
            }
            let value = value.to_ascii_uppercase();
            return value.contains("UTF-8") || value.contains("UTF8");
        }
    }
    false
}

/// Whether SGR colour sequences are worth emitting at all.
pub fn colour_permitted() -> bool {
    match std::env::var("TERM") {
        Ok(term) => !term.is_empty() && term != "dumb",
        Err(_) => false,
    }
}
