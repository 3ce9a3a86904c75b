//! Remote control: another instance changes this process's display and
//! limit options while the transfer runs.
//!
//! The channel is a per-user message directory. The sender serialises one
//! [`RemoteMessage`] and renames it into place under the recipient's pid;
//! the running instance polls for its own file on a short cadence,
//! applies the options, and unlinks it. Unlinking is the acknowledgement
//! the sender waits for.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::config::FormatSwitches;
use crate::signal;
use crate::state::Engine;

/// How often the sender re-checks for consumption.
const SEND_POLL_INTERVAL_MS: u64 = 10;
/// How long the sender waits in total before withdrawing the message.
const SEND_TIMEOUT_MS: u64 = 1_100;
/// Longest accepted name or format string.
const MAX_STRING_BYTES: usize = 255;

/// A string option carried by a remote message: either reset to unset, or
/// replaced. Numeric fields use zero for "leave unchanged" instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StringUpdate {
    #[default]
    Clear,
    Set(String),
}

impl StringUpdate {
    fn from_option(value: &Option<String>) -> StringUpdate {
        match value {
            Some(text) => {
                let mut text = text.clone();
                if text.len() > MAX_STRING_BYTES {
                    // Cut on a character boundary at or below the limit.
                    let mut end = MAX_STRING_BYTES;
                    while !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    text.truncate(end);
                }
                StringUpdate::Set(text)
            }
            None => StringUpdate::Clear,
        }
    }

    fn into_option(self) -> Option<String> {
        match self {
            StringUpdate::Clear => None,
            StringUpdate::Set(text) => Some(text),
        }
    }
}

/// The option subset a peer may change mid-transfer. Options that cannot
/// change (cursor mode, line mode, force, delay-start, error skipping,
/// stop-at-size) are simply not part of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RemoteMessage {
    pub progress: bool,
    pub timer: bool,
    pub eta: bool,
    pub fineta: bool,
    pub rate: bool,
    pub average_rate: bool,
    pub bytes: bool,
    pub bufpercent: bool,
    pub lastwritten: u32,
    /// Bytes per second; 0 = leave unchanged.
    pub rate_limit: u64,
    /// Buffer size in bytes; 0 = leave unchanged.
    pub buffer_size: u64,
    /// Total size; 0 = leave unchanged.
    pub size: u64,
    /// Update interval in seconds; 0 = leave unchanged.
    pub interval: f64,
    pub width: u32,
    pub height: u32,
    pub width_set_manually: bool,
    pub height_set_manually: bool,
    pub name: StringUpdate,
    pub format: StringUpdate,
}

impl RemoteMessage {
    /// Build a message from a sending instance's own configuration.
    pub fn from_control(control: &crate::config::ControlConfig) -> RemoteMessage {
        RemoteMessage {
            progress: control.format_option.progress,
            timer: control.format_option.timer,
            eta: control.format_option.eta,
            fineta: control.format_option.fineta,
            rate: control.format_option.rate,
            average_rate: control.format_option.average_rate,
            bytes: control.format_option.bytes,
            bufpercent: control.format_option.bufpercent,
            lastwritten: control.format_option.lastwritten,
            rate_limit: control.rate_limit,
            buffer_size: control.target_buffer_size,
            size: control.size,
            interval: control.interval,
            width: control.width,
            height: control.height,
            width_set_manually: control.width_set_manually,
            height_set_manually: control.height_set_manually,
            name: StringUpdate::from_option(&control.name),
            format: StringUpdate::from_option(&control.format_string),
        }
    }

    /// Clamp the numeric fields into the ranges the receiver will honour.
    fn clamp(&mut self) {
        if self.width > 0 {
            self.width = self.width.clamp(1, 999_999);
        }
        if self.height > 0 {
            self.height = self.height.clamp(1, 999_999);
        }
        if self.interval > 0.0 {
            self.interval = self.interval.clamp(0.1, 600.0);
        }
    }
}

/// Per-user message directory: `$XDG_RUNTIME_DIR/pmeter`, else
/// `$HOME/.pmeter`, else a uid-stamped directory under the system
/// temporary directory.
pub fn runtime_dir() -> PathBuf {
    let base = if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime.is_empty() {
            PathBuf::from(runtime).join("pmeter")
        } else {
            home_fallback()
        }
    } else {
        home_fallback()
    };
    let _ = std::fs::create_dir_all(&base);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&base, std::fs::Permissions::from_mode(0o700));
    }
    base
}

fn home_fallback() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".pmeter"),
        _ => {
            let uid = unsafe { libc::getuid() };
            std::env::temp_dir().join(format!(".pmeter-{}", uid))
        }
    }
}

fn message_path(pid: u32) -> PathBuf {
    runtime_dir().join(format!("remote.{}", pid))
}

/// Send an option update to a running instance and wait for it to be
/// consumed. Used by the `-R` mode of the command-line tool.
pub fn send(target_pid: u32, mut message: RemoteMessage) -> Result<()> {
    if kill(Pid::from_raw(target_pid as i32), None).is_err() {
        bail!("{}: no such process", target_pid);
    }

    message.clamp();

    let directory = runtime_dir();
    let encoded = bincode::serialize(&message).context("encoding remote message")?;

    let mut staging =
        tempfile::NamedTempFile::new_in(&directory).context("creating message file")?;
    staging
        .write_all(&encoded)
        .context("writing message file")?;
    let path = message_path(target_pid);
    staging
        .persist(&path)
        .with_context(|| format!("installing message file {:?}", path))?;

    event!(Level::DEBUG, pid = target_pid, "remote message sent");

    let mut waited = 0;
    while waited < SEND_TIMEOUT_MS {
        std::thread::sleep(std::time::Duration::from_millis(SEND_POLL_INTERVAL_MS));
        waited += SEND_POLL_INTERVAL_MS;
        if !path.exists() {
            event!(Level::DEBUG, pid = target_pid, "remote message consumed");
            return Ok(());
        }
    }

    let _ = std::fs::remove_file(&path);
    bail!("{}: message not received", target_pid);
}

impl Engine {
    /// Non-blocking check for a pending remote message; applies it if one
    /// is waiting. Called from the main loop on a short cadence.
    pub fn remote_check(&mut self) {
        let path = message_path(std::process::id());
        let encoded = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        // Unlinking is the acknowledgement the sender polls for.
        let _ = std::fs::remove_file(&path);

        let message: RemoteMessage = match bincode::deserialize(&encoded) {
            Ok(message) => message,
            Err(err) => {
                self.report_error(format!("ignoring malformed remote message: {}", err));
                return;
            }
        };

        self.apply_remote(message);
    }

    /// Apply a remote option update to the running transfer.
    pub fn apply_remote(&mut self, message: RemoteMessage) {
        event!(Level::DEBUG, "applying remote option update");

        self.control.format_option = FormatSwitches {
            progress: message.progress,
            timer: message.timer,
            eta: message.eta,
            fineta: message.fineta,
            rate: message.rate,
            average_rate: message.average_rate,
            bytes: message.bytes,
            bufpercent: message.bufpercent,
            lastwritten: message.lastwritten,
        };
        self.control.name = message.name.into_option();
        self.control.format_string = message.format.into_option();

        if message.rate_limit > 0 {
            self.control.rate_limit = message.rate_limit;
        }
        if message.buffer_size > 0 {
            self.control.target_buffer_size = message.buffer_size;
        }
        if message.size > 0 {
            self.control.size = message.size;
        }
        if message.interval > 0.0 {
            self.control.interval = message.interval;
        }
        if message.width > 0 && message.width_set_manually {
            self.control.width = message.width;
            self.control.width_set_manually = true;
        }
        if message.height > 0 && message.height_set_manually {
            self.control.height = message.height;
            self.control.height_set_manually = true;
        }

        self.control.rebuild_default_format();
        self.control.clamp_ranges();
        signal::flags()
            .reparse_display
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// The message file is named after the process id, so every test that
/// runs an engine loop (which drains the channel) shares one path with
/// the channel tests. This lock keeps them from stealing each other's
/// messages.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static CHANNEL_LOCK: Mutex<()> = Mutex::new(());

    pub fn channel_guard() -> MutexGuard<'static, ()> {
        CHANNEL_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;

    #[test]
    fn message_roundtrips_through_bincode() {
        let message = RemoteMessage {
            progress: true,
            rate: true,
            lastwritten: 32,
            rate_limit: 1_000_000,
            interval: 0.5,
            width: 120,
            width_set_manually: true,
            name: StringUpdate::Set("tape".to_string()),
            format: StringUpdate::Clear,
            ..RemoteMessage::default()
        };
        let encoded = bincode::serialize(&message).unwrap();
        let decoded: RemoteMessage = bincode::deserialize(&encoded).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn zero_numeric_fields_leave_config_unchanged() {
        let mut control = ControlConfig::default();
        control.rate_limit = 5_000;
        control.size = 77;
        control.rebuild_default_format();
        let mut engine = Engine::new(control);

        engine.apply_remote(RemoteMessage {
            bytes: true,
            ..RemoteMessage::default()
        });
        assert_eq!(engine.control.rate_limit, 5_000);
        assert_eq!(engine.control.size, 77);
        assert!(engine.control.format_option.bytes);
        assert_eq!(engine.control.default_format, "%b");
    }

    #[test]
    fn manual_flags_gate_geometry_updates() {
        let mut engine = Engine::new(ControlConfig::default());
        engine.apply_remote(RemoteMessage {
            width: 200,
            height: 50,
            width_set_manually: true,
            height_set_manually: false,
            ..RemoteMessage::default()
        });
        assert_eq!(engine.control.width, 200);
        assert!(engine.control.width_set_manually);
        assert_eq!(engine.control.height, 25);
        assert!(!engine.control.height_set_manually);
    }

    #[test]
    fn format_update_sets_reparse_flag() {
        let mut engine = Engine::new(ControlConfig::default());
        engine.apply_remote(RemoteMessage {
            format: StringUpdate::Set("%t only".to_string()),
            ..RemoteMessage::default()
        });
        assert_eq!(engine.control.active_format(), "%t only");
        assert!(signal::flags()
            .reparse_display
            .swap(false, std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn sender_fails_cleanly_for_a_dead_pid() {
        // Far above any default pid-max, so the existence check fails.
        let result = send(999_999_999, RemoteMessage::default());
        assert!(result.is_err());
    }

    #[test]
    fn receiver_consumes_its_message_file() {
        let _channel = test_support::channel_guard();
        let message = RemoteMessage {
            size: 4096,
            ..RemoteMessage::default()
        };
        let path = message_path(std::process::id());
        std::fs::write(&path, bincode::serialize(&message).unwrap()).unwrap();

        let mut engine = Engine::new(ControlConfig::default());
        engine.remote_check();
        assert_eq!(engine.control.size, 4096);
        assert!(!path.exists());
    }

    #[test]
    fn clamping_bounds_geometry_and_interval() {
        let mut message = RemoteMessage {
            width: 5_000_000,
            interval: 0.001,
            ..RemoteMessage::default()
        };
        message.clamp();
        assert_eq!(message.width, 999_999);
        assert!((message.interval - 0.1).abs() < f64::EPSILON);
    }
}
