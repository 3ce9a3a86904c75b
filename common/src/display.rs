//! The display driver: compile the format when needed, render a line
//! sized to the terminal, and write it to the right sink for the current
//! mode (default carriage-return painting, numeric lines, cursor
//! positioning, window/process title mirrors).

use tracing::{event, Level};

use crate::format::{
    self, progress, sgr, widgets, ComponentKind, CompiledFormat, FormatDemands, RenderArgs,
    Segment, SegmentKind,
};
use crate::state::{Engine, MAX_PREVLINE};
use crate::terminal;
use crate::{fdio, signal};

/// When the rendered line shrinks, at most this many trailing spaces are
/// appended to overwrite what the longer previous line left behind.
const MAX_SHRINK_PADDING: usize = 15;

#[derive(Debug, Default)]
pub struct DisplayState {
    pub compiled: CompiledFormat,
    /// The assembled output line from the last paint.
    pub display_buffer: String,
    /// Terminal width at the last paint.
    pub prev_width: u32,
    /// Visible width of the last painted line.
    pub prev_length: usize,
    /// Counter value at startup (nonzero when resuming mid-stream), so
    /// final averages reflect only what this process moved.
    pub initial_offset: u64,
    /// Set once anything has been painted to the terminal.
    pub display_visible: bool,
}

impl DisplayState {
    /// Compile `source` into a fresh segment plan and report what the
    /// plan needs from the transfer.
    pub fn recompile(&mut self, source: &str, utf8: bool) -> FormatDemands {
        self.compiled = format::compile(source, utf8);
        self.compiled.demands()
    }

    fn render_fixed(&self, segment: &Segment, args: &RenderArgs) -> (String, usize) {
        let utf8 = args.control.can_display_utf8;
        match &segment.kind {
            SegmentKind::Literal { .. } => {
                let text = self.compiled.literal_text(segment).to_string();
                (text, segment.literal_width)
            }
            SegmentKind::Component(kind) => {
                let content = match kind {
                    ComponentKind::Timer => widgets::timer(args),
                    ComponentKind::Eta => widgets::eta(args),
                    ComponentKind::FinEta => widgets::fineta(args),
                    ComponentKind::Rate => widgets::rate(args),
                    ComponentKind::AverageRate => widgets::average_rate(args),
                    ComponentKind::Bytes => widgets::bytes(args),
                    ComponentKind::BufferPercent => widgets::buffer_percent(args),
                    ComponentKind::LastWritten => {
                        let window = segment.chosen_size.max(1).min(crate::state::MAX_LASTWRITTEN);
                        widgets::last_written(args, window)
                    }
                    ComponentKind::PreviousLine => {
                        widgets::previous_line(args, segment.chosen_size.min(MAX_PREVLINE))
                    }
                    ComponentKind::Name => widgets::name(args, segment.chosen_size),
                    ComponentKind::ProgressAmountOnly => {
                        let style =
                            progress::bar_style(&args.control.bar_style, utf8);
                        progress::render_amount_only(args, &style)
                    }
                    ComponentKind::Sgr => {
                        let rendered = sgr::render(
                            segment.parameter.as_deref().unwrap_or(""),
                            args.control.can_display_colour,
                        );
                        // Escape sequences occupy no columns.
                        return (rendered, 0);
                    }
                    _ => String::new(),
                };
                let width = format::str_width(&content, utf8);
                (content, width)
            }
        }
    }

    fn render_dynamic(&self, segment: &Segment, args: &RenderArgs, width: usize) -> String {
        let utf8 = args.control.can_display_utf8;
        match &segment.kind {
            SegmentKind::Component(kind) => match kind {
                ComponentKind::Progress => {
                    let style = progress::bar_style(&args.control.bar_style, utf8);
                    progress::render(args, &style, width)
                }
                ComponentKind::ProgressBarOnly => {
                    let style = progress::bar_style(&args.control.bar_style, utf8);
                    progress::render_bar_only(args, &style, width)
                }
                ComponentKind::BarPlain => {
                    progress::render_bar_only(args, &progress::bar_style("plain", utf8), width)
                }
                ComponentKind::BarBlock => {
                    progress::render_bar_only(args, &progress::bar_style("block", utf8), width)
                }
                ComponentKind::BarGranular => {
                    progress::render_bar_only(args, &progress::bar_style("granular", utf8), width)
                }
                ComponentKind::BarShaded => {
                    progress::render_bar_only(args, &progress::bar_style("shaded", utf8), width)
                }
                ComponentKind::PreviousLine => widgets::previous_line(args, width),
                _ => String::new(),
            },
            SegmentKind::Literal { .. } => String::new(),
        }
    }

    /// Compose one display line bounded to `terminal_width` columns.
    ///
    /// First pass renders every fixed segment and sums their widths; the
    /// second divides the remaining columns evenly among the dynamic
    /// segments. The result lands in `display_buffer`.
    pub fn render_line(&mut self, args: &RenderArgs, terminal_width: u32) {
        let utf8 = args.control.can_display_utf8;
        let segment_count = self.compiled.segments.len();
        let mut contents: Vec<Option<(String, usize)>> = vec![None; segment_count];

        let mut static_width = 0usize;
        let mut dynamic_count = 0usize;
        for index in 0..segment_count {
            let segment = self.compiled.segments[index].clone();
            if segment.is_dynamic() {
                dynamic_count += 1;
            } else {
                let (content, width) = self.render_fixed(&segment, args);
                static_width += width;
                contents[index] = Some((content, width));
            }
        }

        if dynamic_count > 0 {
            let remaining = (terminal_width as usize).saturating_sub(static_width);
            let share = remaining / dynamic_count;
            for index in 0..segment_count {
                let segment = self.compiled.segments[index].clone();
                if segment.is_dynamic() {
                    let content = self.render_dynamic(&segment, args, share);
                    let width = format::str_width(&content, utf8);
                    contents[index] = Some((content, width));
                }
            }
        }

        self.display_buffer.clear();
        let mut used_width = 0usize;
        for entry in contents.into_iter().flatten() {
            let (content, width) = entry;
            if width == 0 && content.is_empty() {
                continue;
            }
            if used_width + width > terminal_width as usize {
                break;
            }
            self.display_buffer.push_str(&content);
            used_width += width;
        }

        // Overwrite leftovers from a longer previous line, up to a cap,
        // unless the terminal itself narrowed.
        if used_width < self.prev_length && terminal_width >= self.prev_width {
            let padding = (self.prev_length - used_width).min(MAX_SHRINK_PADDING);
            for _ in 0..padding {
                self.display_buffer.push(' ');
            }
            used_width += padding;
        }

        self.prev_width = terminal_width;
        self.prev_length = used_width;
    }
}

/// Compose the numeric-mode line: the selected values, whitespace
/// separated, in the fixed order timer, count, rate, percentage.
fn numeric_line(args: &RenderArgs, demands: &FormatDemands) -> String {
    let mut parts: Vec<String> = Vec::new();
    if demands.timer {
        parts.push(format!("{:.4}", args.transfer.elapsed_seconds));
    }
    if demands.bytes {
        let count = if args.control.bits && !args.control.linemode {
            args.transfer.total_written * 8
        } else {
            args.transfer.total_written
        };
        parts.push(count.to_string());
    }
    if demands.rate {
        let rate = if args.control.bits && !args.control.linemode {
            args.calc.transfer_rate * 8.0
        } else {
            args.calc.transfer_rate
        };
        parts.push(format!("{:.0}", rate.max(0.0)));
    }
    if demands.percentage || parts.is_empty() {
        parts.push(args.calc.percentage.to_string());
    }
    parts.join(" ")
}

impl Engine {
    /// Print an error without corrupting the progress line: a newline
    /// first if anything is already painted, then `program: message`.
    pub fn report_error(&mut self, message: impl AsRef<str>) {
        let mut text = String::new();
        if self.display.display_visible {
            text.push('\n');
            self.display.display_visible = false;
        }
        text.push_str(&self.status.program_name);
        text.push_str(": ");
        text.push_str(message.as_ref());
        text.push('\n');
        fdio::write_retry(libc::STDERR_FILENO, text.as_bytes());
    }

    /// Recompile the format plan and propagate what it demands into the
    /// transfer bookkeeping.
    pub fn reparse_format(&mut self) {
        let source = self.control.active_format().to_string();
        let demands = self
            .display
            .recompile(&source, self.control.can_display_utf8);
        self.transfer.lastwritten_capacity = demands.lastwritten;
        self.transfer.track_previous_line = demands.previous_line;
        event!(Level::DEBUG, format = %source, "display format compiled");
    }

    /// Render and write one display update.
    pub fn display_tick(&mut self, final_update: bool) {
        if signal::flags()
            .reparse_display
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            self.reparse_format();
        }

        let args = RenderArgs {
            control: &self.control,
            transfer: &self.transfer,
            calc: &self.calc,
            final_update,
            initial_offset: self.display.initial_offset,
        };

        if self.control.numeric {
            let demands = self.display.compiled.demands();
            let mut line = numeric_line(&args, &demands);
            line.push('\n');
            fdio::write_retry(libc::STDERR_FILENO, line.as_bytes());
            return;
        }

        // While SIGTTOU has standard error parked on the null device
        // there is no point rendering; the background check will reclaim
        // the terminal when the process is foregrounded again.
        if signal::flags().stderr_suspended() {
            return;
        }

        if !self.control.force && !terminal::in_foreground() {
            return;
        }

        let width = self.control.width;
        self.display.render_line(&args, width);

        if self.control.cursor {
            self.cursor_paint();
        } else {
            fdio::write_retry(libc::STDERR_FILENO, self.display.display_buffer.as_bytes());
            fdio::write_retry(libc::STDERR_FILENO, b"\r");
        }
        self.display.display_visible = true;

        if self.control.extra_displays.window_title {
            let title = format!(
                "\x1b]2;{}\x1b\\",
                self.display.display_buffer.trim_end_matches(' ')
            );
            fdio::write_retry(libc::STDERR_FILENO, title.as_bytes());
        }
        if self.control.extra_displays.process_title {
            set_process_title(self.display.display_buffer.trim_end_matches(' '));
        }
    }
}

/// Set the kernel-visible process name to a trimmed rendered line.
#[cfg(target_os = "linux")]
fn set_process_title(title: &str) {
    // PR_SET_NAME takes at most 15 bytes plus the terminator.
    let mut bytes: Vec<u8> = title.bytes().take(15).collect();
    bytes.push(0);
    unsafe {
        libc::prctl(libc::PR_SET_NAME, bytes.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
fn set_process_title(_title: &str) {}
