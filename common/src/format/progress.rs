//! Progress bar rendering: known-size bars, the rate gauge, the
//! unknown-size oscillator, and the styled Unicode variants.

use crate::format::{str_width, RenderArgs};
use crate::units::describe_amount;

/// A bar style: what fills the bar, what caps it, and what slides around
/// in unknown-size mode.
///
/// `filler` runs from the empty cell to the full cell; styles with more
/// than two entries use the intermediate cells to show fractional
/// progress within the cell at the tip of the bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarStyle {
    pub indicator: &'static str,
    pub indicator_width: usize,
    pub tip: &'static str,
    pub filler: &'static [&'static str],
}

const PLAIN: BarStyle = BarStyle {
    indicator: "<=>",
    indicator_width: 3,
    tip: ">",
    filler: &[" ", "="],
};

const BLOCK: BarStyle = BarStyle {
    indicator: "◀▶",
    indicator_width: 2,
    tip: "",
    filler: &[" ", "█"],
};

const GRANULAR: BarStyle = BarStyle {
    indicator: "◀▶",
    indicator_width: 2,
    tip: "",
    filler: &[" ", "▏", "▎", "▍", "▌", "▋", "▊", "▉", "█"],
};

const SHADED: BarStyle = BarStyle {
    indicator: "▒▓▒",
    indicator_width: 3,
    tip: "",
    filler: &["░", "▒", "▓", "█"],
};

/// Look a style up by name, falling back to the plain ASCII bar when the
/// name is unknown or the locale cannot display the Unicode cells.
pub fn bar_style(name: &str, utf8: bool) -> BarStyle {
    if !utf8 {
        return PLAIN;
    }
    match name {
        "block" => BLOCK,
        "granular" => GRANULAR,
        "shaded" => SHADED,
        _ => PLAIN,
    }
}

/// The text after the bar: a percentage when the size is known, or the
/// rate against the maximum seen in gauge mode. Includes its leading
/// separator character.
fn after_bar(args: &RenderArgs) -> (String, i64) {
    if args.control.size > 0 {
        let percentage = args.calc.percentage.clamp(0, 100_000);
        (format!(" {:3}%", percentage), percentage)
    } else {
        let mut percentage = 0;
        if args.calc.rate_max > 0.0 {
            percentage = (100.0 * args.calc.transfer_rate / args.calc.rate_max) as i64;
        }
        let count_type = args.control.count_type();
        let described = if args.control.bits && !args.control.linemode {
            describe_amount(8.0 * args.calc.rate_max, "b/s", count_type)
        } else {
            let suffix = crate::units::rate_suffix(count_type);
            describe_amount(args.calc.rate_max, suffix, count_type)
        };
        (format!("/{}", described), percentage)
    }
}

/// Paint the filled region of a bar `cells` wide at `percentage`.
fn paint_filled(out: &mut String, style: &BarStyle, cells: usize, percentage: i64) {
    let percentage = percentage.clamp(0, 100) as usize;
    let exact = cells * percentage; // in hundredths of a cell
    let mut whole = exact / 100;
    let remainder = exact % 100;

    let full = style.filler[style.filler.len() - 1];
    let empty = style.filler[0];

    if style.filler.len() == 2 && !style.tip.is_empty() {
        // Plain style: '=' run with a '>' tip, omitted at 100%.
        if percentage >= 100 {
            for _ in 0..cells {
                out.push_str(full);
            }
            return;
        }
        let mut painted = 0;
        if whole > 0 {
            whole -= 1;
        }
        for _ in 0..whole {
            out.push_str(full);
            painted += 1;
        }
        if painted < cells {
            out.push_str(style.tip);
            painted += 1;
        }
        for _ in painted..cells {
            out.push_str(empty);
        }
    } else {
        // Styled bars: full cells, then one partial cell chosen from the
        // intermediate fillers by the fractional remainder.
        for _ in 0..whole {
            out.push_str(full);
        }
        let mut painted = whole;
        if painted < cells && remainder > 0 && style.filler.len() > 2 {
            let steps = style.filler.len() - 1;
            let index = (remainder * steps) / 100;
            out.push_str(style.filler[index.clamp(0, steps)]);
            painted += 1;
        }
        for _ in painted..cells {
            out.push_str(empty);
        }
    }
}

/// Bar plus number for a known size (or rate gauge).
fn render_known_size(
    args: &RenderArgs,
    style: &BarStyle,
    width: usize,
    sides: bool,
    include_bar: bool,
    include_amount: bool,
) -> String {
    let (mut amount, percentage) = after_bar(args);
    if !include_amount {
        amount.clear();
    }
    let amount_width = str_width(&amount, true);

    if !include_bar {
        // Just the number, without its leading separator.
        if amount.len() > 1 {
            return amount[1..].to_string();
        }
        return String::new();
    }

    let frame = if sides { 2 } else { 0 };
    if width < amount_width + frame + 1 {
        return String::new();
    }
    let cells = width - amount_width - frame;

    let mut out = String::with_capacity(width * 3);
    if sides {
        out.push('[');
    }
    paint_filled(&mut out, style, cells, percentage);
    if sides {
        out.push(']');
    }
    out.push_str(&amount);
    out
}

/// Unknown-size mode: sweep a small indicator back and forth. The
/// percentage counter runs 0..200; values past 100 fold back so the
/// indicator returns the way it came.
fn render_unknown_size(args: &RenderArgs, style: &BarStyle, width: usize, sides: bool) -> String {
    let frame = if sides { 2 } else { 0 };
    if width < style.indicator_width + frame + 1 {
        return String::new();
    }
    let cells = width - style.indicator_width - frame;

    let mut position = args.calc.percentage % 200;
    if position > 100 {
        position = 200 - position;
    }
    let before = cells * position.clamp(0, 100) as usize / 100;

    let mut out = String::with_capacity(width * 3);
    if sides {
        out.push('[');
    }
    for _ in 0..before {
        out.push(' ');
    }
    out.push_str(style.indicator);
    for _ in before..cells {
        out.push(' ');
    }
    if sides {
        out.push(']');
    }
    out
}

/// Full `%p` component: bar with sides and trailing number.
pub fn render(args: &RenderArgs, style: &BarStyle, width: usize) -> String {
    if args.control.size > 0 || args.control.rate_gauge {
        render_known_size(args, style, width, true, true, true)
    } else {
        render_unknown_size(args, style, width, true)
    }
}

/// Bar without sides or number (`%{progress-bar-only}` and the styled
/// `%{bar-*}` components).
pub fn render_bar_only(args: &RenderArgs, style: &BarStyle, width: usize) -> String {
    if args.control.size > 0 || args.control.rate_gauge {
        render_known_size(args, style, width, false, true, false)
    } else {
        render_unknown_size(args, style, width, false)
    }
}

/// The number alone (`%{progress-amount-only}`); empty when the size is
/// unknown and the gauge is off.
pub fn render_amount_only(args: &RenderArgs, style: &BarStyle) -> String {
    if args.control.size > 0 || args.control.rate_gauge {
        render_known_size(args, style, 0, false, false, true)
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::CalcState;
    use crate::config::ControlConfig;
    use crate::state::TransferState;

    fn fixtures(size: u64, percentage: i64) -> (ControlConfig, TransferState, CalcState) {
        let control = ControlConfig {
            size,
            ..ControlConfig::default()
        };
        let transfer = TransferState::default();
        let mut calc = CalcState::new(30);
        calc.percentage = percentage;
        (control, transfer, calc)
    }

    fn args<'a>(
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
    fn half_done_bar_has_tip_and_percentage() {
        let (control, transfer, calc) = fixtures(1000, 50);
        let bar = render(&args(&control, &transfer, &calc), &PLAIN, 20);
        assert_eq!(bar.len(), 20);
        assert_eq!(bar, "[=====>       ]  50%");
    }

    #[test]
    fn complete_bar_drops_the_tip() {
        let (control, transfer, calc) = fixtures(1000, 100);
        let bar = render(&args(&control, &transfer, &calc), &PLAIN, 20);
        assert_eq!(bar, "[=============] 100%");
    }

    #[test]
    fn zero_progress_is_all_spaces() {
        let (control, transfer, calc) = fixtures(1000, 0);
        let bar = render(&args(&control, &transfer, &calc), &PLAIN, 20);
        assert_eq!(bar, "[>            ]   0%");
    }

    #[test]
    fn unknown_size_renders_an_oscillator() {
        let (control, transfer, calc) = fixtures(0, 40);
        let bar = render(&args(&control, &transfer, &calc), &PLAIN, 20);
        assert_eq!(bar.len(), 20);
        assert!(bar.starts_with('['));
        assert!(bar.ends_with(']'));
        assert!(bar.contains("<=>"));
    }

    #[test]
    fn oscillator_folds_past_one_hundred() {
        let (control, transfer, calc) = fixtures(0, 150);
        let folded = render(&args(&control, &transfer, &calc), &PLAIN, 20);
        let (control, transfer, calc) = fixtures(0, 50);
        let rising = render(&args(&control, &transfer, &calc), &PLAIN, 20);
        assert_eq!(folded, rising);
    }

    #[test]
    fn styled_bar_uses_unicode_cells() {
        let (control, transfer, calc) = fixtures(1000, 50);
        let bar = render_bar_only(&args(&control, &transfer, &calc), &BLOCK, 10);
        assert_eq!(str_width(&bar, true), 10);
        assert!(bar.contains('█'));
    }

    #[test]
    fn granular_bar_shows_a_partial_cell() {
        let (control, transfer, calc) = fixtures(1000, 55);
        let bar = render_bar_only(&args(&control, &transfer, &calc), &GRANULAR, 10);
        assert_eq!(str_width(&bar, true), 10);
        // 5.5 cells: five full blocks then a half block.
        assert_eq!(bar.chars().filter(|c| *c == '█').count(), 5);
        assert!(bar.contains('▌'));
    }

    #[test]
    fn amount_only_is_the_bare_percentage() {
        let (control, transfer, calc) = fixtures(1000, 77);
        let amount = render_amount_only(&args(&control, &transfer, &calc), &PLAIN);
        assert_eq!(amount, " 77%");
    }

    #[test]
    fn gauge_mode_shows_rate_against_maximum() {
        let (mut control, transfer, mut calc) = fixtures(0, 0);
        control.rate_gauge = true;
        calc.transfer_rate = 512.0;
        calc.rate_max = 1024.0;
        let bar = render(&args(&control, &transfer, &calc), &PLAIN, 24);
        assert!(bar.contains("/1.00KiB/s"));
        assert!(bar.starts_with('['));
    }

    #[test]
    fn too_narrow_a_bar_renders_nothing() {
        let (control, transfer, calc) = fixtures(1000, 50);
        assert_eq!(render(&args(&control, &transfer, &calc), &PLAIN, 3), "");
    }

    #[test]
    fn unknown_style_names_fall_back_to_plain() {
        assert_eq!(bar_style("nope", true), PLAIN);
        assert_eq!(bar_style("block", false), PLAIN);
        assert_eq!(bar_style("block", true), BLOCK);
    }
}
