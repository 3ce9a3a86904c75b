//! Monotonic clock used for all transfer timing.
//!
//! The engine never looks at wall-clock time for scheduling; everything is
//! derived from `CLOCK_MONOTONIC` so that system clock adjustments cannot
//! make the rate or ETA jump. Arithmetic keeps the nanosecond part
//! normalised into `[0, 1_000_000_000)`.

use std::sync::atomic::{AtomicU64, Ordering};

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// A point on the monotonic clock, or a span between two such points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    sec: i64,
    nsec: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, nsec: 0 };

    fn normalised(sec: i64, nsec: i64) -> Timestamp {
        let mut sec = sec + nsec / NSEC_PER_SEC;
        let mut nsec = nsec % NSEC_PER_SEC;
        if nsec < 0 {
            sec -= 1;
            nsec += NSEC_PER_SEC;
        }
        Timestamp { sec, nsec }
    }

    pub fn from_nanos(nanos: i64) -> Timestamp {
        Timestamp::normalised(0, nanos)
    }

    pub fn as_nanos(&self) -> i64 {
        self.sec * NSEC_PER_SEC + self.nsec
    }

    pub fn add(&self, other: Timestamp) -> Timestamp {
        Timestamp::normalised(self.sec + other.sec, self.nsec + other.nsec)
    }

    pub fn subtract(&self, other: Timestamp) -> Timestamp {
        Timestamp::normalised(self.sec - other.sec, self.nsec - other.nsec)
    }

    pub fn add_nanos(&self, nanos: i64) -> Timestamp {
        Timestamp::normalised(self.sec, self.nsec + nanos)
    }

    pub fn as_seconds(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NSEC_PER_SEC as f64
    }
}

/// Read the monotonic clock.
///
/// A failed read leaves the engine with no usable notion of time at all, so
/// it aborts the process with exit status 16, matching the transfer-error
/// exit bit.
pub fn now() -> Timestamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        eprintln!("pmeter: clock_gettime: {}", err);
        std::process::exit(16);
    }
    Timestamp {
        sec: ts.tv_sec as i64,
        nsec: ts.tv_nsec as i64,
    }
}

/// Monotonic nanoseconds as a single integer, for use inside signal
/// handlers where only atomic stores are permitted. Returns 0 on failure
/// rather than aborting, since a handler cannot safely exit.
pub fn now_nanos_for_handler() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * NSEC_PER_SEC as u64 + ts.tv_nsec as u64
}

/// Shared nanosecond cell written by signal handlers and read by the loop.
#[derive(Debug, Default)]
pub struct NanosCell(AtomicU64);

impl NanosCell {
    pub const fn new() -> NanosCell {
        NanosCell(AtomicU64::new(0))
    }

    pub fn store(&self, nanos: u64) {
        self.0.store(nanos, Ordering::SeqCst);
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn add(&self, nanos: u64) {
        self.0.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::SeqCst)
    }
}
