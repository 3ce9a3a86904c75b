//! Signal handling for the transfer engine.
//!
//! Handlers never branch into engine logic: each one only stores into the
//! process-wide [`SignalFlags`] (and, for SIGTSTP, re-raises a stop), and
//! the main loop reads the flags at the top of each iteration. There is
//! exactly one live engine per process, so a single static flag block is
//! the whole registration.
//!
//! The stop/continue pair also maintains the cumulative "time spent
//! stopped" offset so that suspending the pipeline with ^Z does not
//! inflate the elapsed time or deflate the rate.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{Context, Result};
use signal_hook::consts::{
    SIGCONT, SIGHUP, SIGINT, SIGPIPE, SIGTERM, SIGTSTP, SIGTTOU, SIGWINCH,
};
use signal_hook::SigId;

use crate::clock::{self, NanosCell, Timestamp};

#[derive(Debug)]
pub struct SignalFlags {
    /// The terminal geometry may have changed; re-query it.
    pub terminal_resized: AtomicBool,
    /// A terminating signal (SIGINT/SIGHUP/SIGTERM) was received.
    pub trigger_exit: AtomicBool,
    /// The format string changed (remote control); recompile the display.
    pub reparse_display: AtomicBool,
    /// The output pipe was reported closed (SIGPIPE or EPIPE).
    pub pipe_closed: AtomicBool,
    /// The cursor-positioning display must re-probe its row.
    pub cursor_reinit: AtomicBool,
    /// TOSTOP may have been cleared while we were stopped; re-assert it.
    pub recheck_tostop: AtomicBool,
    /// Monotonic nanoseconds at the last SIGTSTP; 0 when not stopped.
    tstp_time: NanosCell,
    /// Cumulative nanoseconds spent stopped.
    stopped_time: NanosCell,
    /// Saved standard error while it is redirected to the null device by
    /// the SIGTTOU handler; -1 when not redirected.
    old_stderr: AtomicI32,
}

static FLAGS: SignalFlags = SignalFlags {
    terminal_resized: AtomicBool::new(false),
    trigger_exit: AtomicBool::new(false),
    reparse_display: AtomicBool::new(false),
    pipe_closed: AtomicBool::new(false),
    cursor_reinit: AtomicBool::new(false),
    recheck_tostop: AtomicBool::new(false),
    tstp_time: NanosCell::new(),
    stopped_time: NanosCell::new(),
    old_stderr: AtomicI32::new(-1),
};

pub fn flags() -> &'static SignalFlags {
    &FLAGS
}

impl SignalFlags {
    /// Total time spent stopped, for elapsed-time correction.
    pub fn stopped_offset(&self) -> Timestamp {
        Timestamp::from_nanos(self.stopped_time.load() as i64)
    }

    /// Zero the stop bookkeeping. Used when `--wait` restarts the clock at
    /// the first transferred byte, so a stop that happened while waiting
    /// for data does not offset the fresh timer.
    pub fn reset_time_offsets(&self) {
        self.tstp_time.take();
        self.stopped_time.take();
    }

    /// Whether standard error is currently parked on the null device.
    pub fn stderr_suspended(&self) -> bool {
        self.old_stderr.load(Ordering::SeqCst) >= 0
    }

    /// Restore standard error if the SIGTTOU handler replaced it. Returns
    /// true if a restore happened, meaning the terminal is reachable again.
    pub fn restore_stderr(&self) -> bool {
        let saved = self.old_stderr.swap(-1, Ordering::SeqCst);
        if saved < 0 {
            return false;
        }
        unsafe {
            libc::dup2(saved, libc::STDERR_FILENO);
            libc::close(saved);
        }
        true
    }
}

/// Redirect standard error to the null device, remembering the original so
/// SIGCONT (or the periodic background check) can put it back.
///
/// Only async-signal-safe calls: open/dup/dup2/close.
fn suspend_stderr() {
    unsafe {
        let null_fd = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if null_fd < 0 {
            return;
        }
        if FLAGS.old_stderr.load(Ordering::SeqCst) < 0 {
            let saved = libc::dup(libc::STDERR_FILENO);
            FLAGS.old_stderr.store(saved, Ordering::SeqCst);
        }
        libc::dup2(null_fd, libc::STDERR_FILENO);
        libc::close(null_fd);
    }
}

/// Installed signal handlers; dropping the guard unregisters them.
pub struct SignalGuard {
    ids: Vec<SigId>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Install every handler the engine relies on.
pub fn install() -> Result<SignalGuard> {
    let mut ids = Vec::new();

    // SAFETY: every closure below restricts itself to atomic stores and
    // async-signal-safe libc calls.
    unsafe {
        ids.push(
            signal_hook::low_level::register(SIGPIPE, || {
                FLAGS.pipe_closed.store(true, Ordering::SeqCst);
            })
            .context("registering SIGPIPE handler")?,
        );

        ids.push(
            signal_hook::low_level::register(SIGTTOU, suspend_stderr)
                .context("registering SIGTTOU handler")?,
        );

        ids.push(
            signal_hook::low_level::register(SIGTSTP, || {
                FLAGS.tstp_time.store(clock::now_nanos_for_handler());
                libc::raise(libc::SIGSTOP);
            })
            .context("registering SIGTSTP handler")?,
        );

        ids.push(
            signal_hook::low_level::register(SIGCONT, || {
                let stopped_at = FLAGS.tstp_time.take();
                if stopped_at != 0 {
                    let now = clock::now_nanos_for_handler();
                    if now > stopped_at {
                        FLAGS.stopped_time.add(now - stopped_at);
                    }
                }
                FLAGS.restore_stderr();
                FLAGS.terminal_resized.store(true, Ordering::SeqCst);
                FLAGS.cursor_reinit.store(true, Ordering::SeqCst);
                FLAGS.recheck_tostop.store(true, Ordering::SeqCst);
            })
            .context("registering SIGCONT handler")?,
        );

        ids.push(
            signal_hook::low_level::register(SIGWINCH, || {
                FLAGS.terminal_resized.store(true, Ordering::SeqCst);
            })
            .context("registering SIGWINCH handler")?,
        );

        for signal in [SIGINT, SIGHUP, SIGTERM] {
            ids.push(
                signal_hook::low_level::register(signal, || {
                    FLAGS.trigger_exit.store(true, Ordering::SeqCst);
                })
                .context("registering termination handler")?,
            );
        }
    }

    Ok(SignalGuard { ids })
}
