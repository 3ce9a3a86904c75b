//! Transfer engine for `pmeter`, a pipeline progress meter.
//!
//! The engine copies bytes (or lines) from a list of inputs to one
//! output while painting a live status line on the controlling terminal.
//! It is single-threaded and cooperative: one loop pumps the transfer in
//! short bounded steps, and everything asynchronous (signals, remote
//! reconfiguration) is folded in between steps via atomic flags or a
//! polled message file.
//!
//! Module map, leaf first:
//!
//! - [`clock`] - monotonic time with normalised arithmetic
//! - [`units`] - human-readable quantities and durations
//! - [`fdio`] - raw descriptor syscall wrappers
//! - [`config`] / [`state`] - the control configuration and engine state
//! - [`signal`] / [`terminal`] - signal flags and terminal discipline
//! - [`calc`] - rates, percentage, ETA statistics
//! - [`transfer`] - the buffered and zero-copy data movers
//! - [`format`] / [`display`] / [`cursor`] - the status line
//! - [`remote`] - live option updates from another instance
//! - [`file`] / [`mainloop`] - input handling and the scheduler

pub mod calc;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod display;
pub mod fdio;
pub mod file;
pub mod format;
pub mod mainloop;
pub mod remote;
pub mod signal;
pub mod state;
pub mod terminal;
pub mod transfer;
pub mod units;
pub mod version;

pub use config::{ControlConfig, ExtraDisplays, FormatSwitches};
pub use remote::{RemoteMessage, StringUpdate};
pub use state::{exitcode, Engine};
