//! Runtime configuration for a transfer.
//!
//! Built once at startup from the command line, then mutated only by the
//! remote-control receiver. The width/height "set manually" bits decide
//! whether terminal resize events are allowed to overwrite the dimensions.

use crate::units::CountType;

/// Which display components were selected by switches; used both to
/// assemble the default format string and as the remote-control payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatSwitches {
    pub progress: bool,
    pub timer: bool,
    pub eta: bool,
    pub fineta: bool,
    pub rate: bool,
    pub average_rate: bool,
    pub bytes: bool,
    pub bufpercent: bool,
    /// Width of the `%A` last-written window; 0 disables it.
    pub lastwritten: u32,
}

impl FormatSwitches {
    pub fn any(&self) -> bool {
        self.progress
            || self.timer
            || self.eta
            || self.fineta
            || self.rate
            || self.average_rate
            || self.bytes
            || self.bufpercent
            || self.lastwritten > 0
    }
}

/// Extra places the rendered line is mirrored to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraDisplays {
    pub window_title: bool,
    pub process_title: bool,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub force: bool,
    pub cursor: bool,
    pub numeric: bool,
    pub wait: bool,
    pub linemode: bool,
    pub bits: bool,
    pub si: bool,
    pub null_terminated_lines: bool,
    pub no_display: bool,
    /// 0 = off, 1 = skip read errors, 2+ = also quieten repeat warnings.
    pub skip_errors: u32,
    /// Fixed skip alignment for read errors; 0 selects the adaptive policy.
    pub error_skip_block: u64,
    pub stop_at_size: bool,
    pub sync_after_write: bool,
    pub direct_io: bool,
    pub direct_io_changed: bool,
    pub no_splice: bool,
    pub discard_input: bool,
    pub rate_gauge: bool,
    pub show_stats: bool,
    /// Bytes per second (lines per second in line mode); 0 = unlimited.
    pub rate_limit: u64,
    /// Transfer buffer size; 0 = pick automatically from the input.
    pub target_buffer_size: u64,
    /// Total expected size; 0 = unknown.
    pub size: u64,
    /// Seconds between display updates.
    pub interval: f64,
    /// Seconds to hold off the first display.
    pub delay_start: f64,
    /// Window for the average-rate history, in seconds.
    pub average_rate_window: u32,
    pub width: u32,
    pub height: u32,
    pub width_set_manually: bool,
    pub height_set_manually: bool,
    pub name: Option<String>,
    pub format_string: Option<String>,
    pub default_format: String,
    pub format_option: FormatSwitches,
    pub extra_displays: ExtraDisplays,
    /// Default bar style name used by `%p` (`plain`, `block`, `granular`,
    /// `shaded`).
    pub bar_style: String,
    pub store_and_forward: Option<std::path::PathBuf>,
    pub can_display_utf8: bool,
    pub can_display_colour: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            force: false,
            cursor: false,
            numeric: false,
            wait: false,
            linemode: false,
            bits: false,
            si: false,
            null_terminated_lines: false,
            no_display: false,
            skip_errors: 0,
            error_skip_block: 0,
            stop_at_size: false,
            sync_after_write: false,
            direct_io: false,
            direct_io_changed: false,
            no_splice: false,
            discard_input: false,
            rate_gauge: false,
            show_stats: false,
            rate_limit: 0,
            target_buffer_size: 0,
            size: 0,
            interval: 1.0,
            delay_start: 0.0,
            average_rate_window: 30,
            width: 80,
            height: 25,
            width_set_manually: false,
            height_set_manually: false,
            name: None,
            format_string: None,
            default_format: String::new(),
            format_option: FormatSwitches::default(),
            extra_displays: ExtraDisplays::default(),
            bar_style: "plain".to_string(),
            store_and_forward: None,
            can_display_utf8: false,
            can_display_colour: false,
        }
    }
}

impl ControlConfig {
    /// The count type the user-visible counters are described in.
    pub fn count_type(&self) -> CountType {
        if self.linemode {
            CountType::Lines
        } else if self.si {
            CountType::DecBytes
        } else {
            CountType::Bytes
        }
    }

    /// Rebuild the default format string from the selected switches, in
    /// display order. When no switch at all is selected, the classic
    /// progress display is used.
    pub fn rebuild_default_format(&mut self) {
        let mut switches = self.format_option;
        if !switches.any() {
            switches.progress = true;
            switches.timer = true;
            switches.eta = true;
            switches.rate = true;
            switches.bytes = true;
        }

        let mut parts: Vec<String> = Vec::new();
        if self.name.is_some() {
            parts.push("%N".to_string());
        }
        if switches.bytes {
            parts.push("%b".to_string());
        }
        if switches.bufpercent {
            parts.push("%T".to_string());
        }
        if switches.timer {
            parts.push("%t".to_string());
        }
        if switches.rate {
            parts.push("%r".to_string());
        }
        if switches.average_rate {
            parts.push("%a".to_string());
        }
        if switches.progress {
            parts.push("%p".to_string());
        }
        if switches.eta {
            parts.push("%e".to_string());
        }
        if switches.fineta {
            parts.push("%I".to_string());
        }
        if switches.lastwritten > 0 {
            parts.push(format!("%{}A", switches.lastwritten));
        }
        self.default_format = parts.join(" ");
    }

    /// The format string currently in effect.
    pub fn active_format(&self) -> &str {
        self.format_string.as_deref().unwrap_or(&self.default_format)
    }

    /// Clamp interval, width, and height into their documented bounds.
    pub fn clamp_ranges(&mut self) {
        if self.interval < 0.1 {
            self.interval = 0.1;
        }
        if self.interval > 600.0 {
            self.interval = 600.0;
        }
        if self.delay_start < 0.0 {
            self.delay_start = 0.0;
        }
        if self.delay_start > 600.0 {
            self.delay_start = 600.0;
        }
        self.width = self.width.clamp(1, 999_999);
        self.height = self.height.clamp(1, 999_999);
    }
}
