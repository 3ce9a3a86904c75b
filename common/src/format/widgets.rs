//! Renderers for the fixed-width display components.

use chrono::{Duration, Local};

use crate::calc::seconds_remaining;
use crate::format::RenderArgs;
use crate::units::{count_suffix, describe_amount, describe_duration, rate_suffix, CountType};

/// Elapsed transfer time.
pub fn timer(args: &RenderArgs) -> String {
    describe_duration(args.transfer.elapsed_seconds)
}

fn eta_seconds(args: &RenderArgs) -> i64 {
    seconds_remaining(
        args.transfer
            .transferred
            .saturating_sub(args.initial_offset),
        args.control.size.saturating_sub(args.initial_offset),
        args.calc.current_avg_rate,
    )
}

/// Estimated time until completion; empty when the size is unknown, and
/// blanked (same width) on the final update so a finished transfer does
/// not advertise a stale estimate.
pub fn eta(args: &RenderArgs) -> String {
    if args.control.size == 0 {
        return String::new();
    }
    let text = format!("ETA {}", describe_duration(eta_seconds(args) as f64));
    if args.final_update {
        " ".repeat(text.len())
    } else {
        text
    }
}

/// Estimated local time of completion, with the date included only once
/// the estimate is more than six hours out.
pub fn fineta(args: &RenderArgs) -> String {
    if args.control.size == 0 {
        return String::new();
    }
    let eta = eta_seconds(args);
    let then = Local::now() + Duration::seconds(eta);
    let stamp = if eta > 6 * 3600 {
        then.format("%Y-%m-%d %H:%M:%S")
    } else {
        then.format("%H:%M:%S")
    };
    let text = format!("FIN {}", stamp);
    if args.final_update {
        " ".repeat(text.len())
    } else {
        text
    }
}

/// A quantity in the configured units, ×8 with a bit suffix under
/// `--bits` (line mode keeps counting lines).
fn amount_in_units(args: &RenderArgs, quantity: f64, per_second: bool) -> String {
    let count_type = args.control.count_type();
    if args.control.bits && count_type != CountType::Lines {
        let suffix = if per_second { "b/s" } else { "b" };
        describe_amount(8.0 * quantity, suffix, count_type)
    } else {
        let suffix = if per_second {
            rate_suffix(count_type)
        } else {
            count_suffix(count_type)
        };
        describe_amount(quantity, suffix, count_type)
    }
}

/// Current transfer rate, bracketed.
pub fn rate(args: &RenderArgs) -> String {
    format!("[{}]", amount_in_units(args, args.calc.transfer_rate, true))
}

/// Windowed average rate, in parentheses to tell it from `%r`.
pub fn average_rate(args: &RenderArgs) -> String {
    format!("({})", amount_in_units(args, args.calc.average_rate, true))
}

/// Cumulative byte or line count.
pub fn bytes(args: &RenderArgs) -> String {
    amount_in_units(args, args.transfer.total_written as f64, false)
}

/// Percentage of the staging buffer in use, or `{----}` while the
/// zero-copy path is active and there is no buffer to speak of.
pub fn buffer_percent(args: &RenderArgs) -> String {
    if args.transfer.splice_used {
        return "{----}".to_string();
    }
    let size = args.transfer.buffer.len();
    if size == 0 {
        return String::new();
    }
    let used = args.transfer.read_position - args.transfer.write_position;
    format!("{{{:3}%}}", used * 100 / size)
}

/// The last `window` bytes written, with non-printable bytes shown as
/// dots; left-padded until enough output has accumulated.
pub fn last_written(args: &RenderArgs, window: usize) -> String {
    let ring = &args.transfer.last_written;
    let mut text = String::with_capacity(window);
    for _ in 0..window.saturating_sub(ring.len()) {
        text.push(' ');
    }
    let skip = ring.len().saturating_sub(window);
    for byte in ring.iter().skip(skip) {
        text.push(printable_or(*byte, '.'));
    }
    text
}

/// The first `width` bytes of the most recently completed line, padded to
/// exactly `width` so the field does not wobble as lines change.
pub fn previous_line(args: &RenderArgs, width: usize) -> String {
    let mut text = String::with_capacity(width);
    for byte in args.transfer.previous_line.iter().take(width) {
        text.push(printable_or(*byte, ' '));
    }
    while text.len() < width {
        text.push(' ');
    }
    text
}

/// The transfer name, right-aligned in a fixed-width field with a
/// trailing colon.
pub fn name(args: &RenderArgs, chosen_size: usize) -> String {
    let width = if chosen_size > 0 { chosen_size } else { 9 };
    match &args.control.name {
        Some(name) => format!("{:>width$}:", name, width = width),
        None => String::new(),
    }
}

fn printable_or(byte: u8, replacement: char) -> char {
    if byte.is_ascii_graphic() || byte == b' ' {
        byte as char
    } else {
        replacement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::CalcState;
    use crate::config::ControlConfig;
    use crate::state::TransferState;

    fn args_with<'a>(
        control: &'a ControlConfig,
        transfer: &'a TransferState,
        calc: &'a CalcState,
    ) -> RenderArgs<'a> {
        RenderArgs {
            control,
            transfer,
            calc,
            final_update: false,
            initial_offset: 0,
        }
    }

    #[test]
    fn timer_formats_elapsed() {
        let control = ControlConfig::default();
        let transfer = TransferState {
            elapsed_seconds: 65.0,
            ..TransferState::default()
        };
        let calc = CalcState::new(30);
        assert_eq!(timer(&args_with(&control, &transfer, &calc)), "0:01:05");
    }

    #[test]
    fn eta_is_empty_without_a_size() {
        let control = ControlConfig::default();
        let transfer = TransferState::default();
        let calc = CalcState::new(30);
        assert_eq!(eta(&args_with(&control, &transfer, &calc)), "");
    }

    #[test]
    fn eta_counts_down_and_blanks_at_the_end() {
        let control = ControlConfig {
            size: 1000,
            ..ControlConfig::default()
        };
        let transfer = TransferState {
            transferred: 500,
            ..TransferState::default()
        };
        let mut calc = CalcState::new(30);
        calc.current_avg_rate = 100.0;
        let mut args = args_with(&control, &transfer, &calc);
        assert_eq!(eta(&args), "ETA 0:00:05");
        args.final_update = true;
        assert_eq!(eta(&args), "           ");
    }

    #[test]
    fn rate_is_bracketed_and_average_parenthesised() {
        let control = ControlConfig::default();
        let transfer = TransferState::default();
        let mut calc = CalcState::new(30);
        calc.transfer_rate = 1024.0;
        calc.average_rate = 2048.0;
        let args = args_with(&control, &transfer, &calc);
        assert_eq!(rate(&args), "[1.00KiB/s]");
        assert_eq!(average_rate(&args), "(2.00KiB/s)");
    }

    #[test]
    fn bits_mode_scales_by_eight() {
        let control = ControlConfig {
            bits: true,
            ..ControlConfig::default()
        };
        let transfer = TransferState {
            total_written: 1024,
            ..TransferState::default()
        };
        let calc = CalcState::new(30);
        assert_eq!(bytes(&args_with(&control, &transfer, &calc)), "8.00Kib");
    }

    #[test]
    fn line_mode_counts_lines_not_bytes() {
        let control = ControlConfig {
            linemode: true,
            ..ControlConfig::default()
        };
        let transfer = TransferState {
            total_written: 3,
            ..TransferState::default()
        };
        let calc = CalcState::new(30);
        assert_eq!(bytes(&args_with(&control, &transfer, &calc)), "3.00");
    }

    #[test]
    fn buffer_percent_reports_fill_or_splice() {
        let control = ControlConfig::default();
        let mut transfer = TransferState {
            buffer: vec![0; 100],
            read_position: 42,
            write_position: 0,
            ..TransferState::default()
        };
        let calc = CalcState::new(30);
        assert_eq!(
            buffer_percent(&args_with(&control, &transfer, &calc)),
            "{ 42%}"
        );
        transfer.splice_used = true;
        assert_eq!(
            buffer_percent(&args_with(&control, &transfer, &calc)),
            "{----}"
        );
    }

    #[test]
    fn last_written_pads_then_scrolls() {
        let control = ControlConfig::default();
        let mut transfer = TransferState::default();
        transfer.last_written.extend(b"ab\n".iter().copied());
        let calc = CalcState::new(30);
        assert_eq!(
            last_written(&args_with(&control, &transfer, &calc), 5),
            "  ab."
        );
        assert_eq!(
            last_written(&args_with(&control, &transfer, &calc), 2),
            "b."
        );
    }

    #[test]
    fn previous_line_is_fixed_width() {
        let control = ControlConfig::default();
        let transfer = TransferState {
            previous_line: b"hi\tthere".to_vec(),
            ..TransferState::default()
        };
        let calc = CalcState::new(30);
        assert_eq!(
            previous_line(&args_with(&control, &transfer, &calc), 4),
            "hi t"
        );
        assert_eq!(
            previous_line(&args_with(&control, &transfer, &calc), 10),
            "hi there  "
        );
    }

    #[test]
    fn name_field_is_right_aligned() {
        let control = ControlConfig {
            name: Some("disk".to_string()),
            ..ControlConfig::default()
        };
        let transfer = TransferState::default();
        let calc = CalcState::new(30);
        assert_eq!(
            name(&args_with(&control, &transfer, &calc), 0),
            "     disk:"
        );
        assert_eq!(name(&args_with(&control, &transfer, &calc), 4), "disk:");
    }
}
