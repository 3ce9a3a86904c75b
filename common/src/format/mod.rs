//! The display format language.
//!
//! A format string such as `"%N %b %t %r %p %e"` compiles into an ordered
//! list of segments: literals (byte ranges into the format string) and
//! components (an enumerated tag plus an optional `%<n>` size prefix).
//! Rendering is two-pass: fixed-width components paint first and their
//! widths are summed, then whatever terminal width remains is divided
//! evenly between the dynamic segments (progress bars, the elastic
//! previous-line window).
//!
//! Unknown `%x` sequences pass through verbatim and a trailing `%` is
//! literal, so a bad format degrades to visible text instead of an error.

pub mod progress;
pub mod sgr;
pub mod widgets;

use unicode_width::UnicodeWidthStr;

use crate::calc::CalcState;
use crate::config::ControlConfig;
use crate::state::TransferState;

/// Everything a component renderer may look at. Mirrors the ownership
/// rules: renderers read transfer/calc state, they never mutate it.
pub struct RenderArgs<'a> {
    pub control: &'a ControlConfig,
    pub transfer: &'a TransferState,
    pub calc: &'a CalcState,
    pub final_update: bool,
    pub initial_offset: u64,
}

/// Closed set of renderable components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Progress,
    ProgressBarOnly,
    ProgressAmountOnly,
    BarPlain,
    BarBlock,
    BarGranular,
    BarShaded,
    Timer,
    Eta,
    FinEta,
    Rate,
    AverageRate,
    Bytes,
    BufferPercent,
    LastWritten,
    PreviousLine,
    Name,
    Sgr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentKind {
    /// Byte range into the format source string.
    Literal { start: usize, end: usize },
    Component(ComponentKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Numeric `%<n>` prefix; 0 when absent.
    pub chosen_size: usize,
    /// Brace parameter, currently only the SGR keyword list.
    pub parameter: Option<String>,
    /// Visible width, pre-computed at compile time for literals.
    pub literal_width: usize,
}

impl Segment {
    /// Dynamic segments scale with the space left over after the fixed
    /// ones have been painted.
    pub fn is_dynamic(&self) -> bool {
        match &self.kind {
            SegmentKind::Literal { .. } => false,
            SegmentKind::Component(kind) => match kind {
                ComponentKind::Progress
                | ComponentKind::ProgressBarOnly
                | ComponentKind::BarPlain
                | ComponentKind::BarBlock
                | ComponentKind::BarGranular
                | ComponentKind::BarShaded => true,
                ComponentKind::PreviousLine => self.chosen_size == 0,
                _ => false,
            },
        }
    }
}

/// What a compiled format needs from the rest of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatDemands {
    /// Largest `%<n>A` window, 0 when `%A` is absent.
    pub lastwritten: usize,
    /// Whether `%L` appears, so the transfer must track line contents.
    pub previous_line: bool,
    pub timer: bool,
    pub bytes: bool,
    pub rate: bool,
    pub percentage: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledFormat {
    pub source: String,
    pub segments: Vec<Segment>,
}

impl CompiledFormat {
    pub fn literal_text(&self, segment: &Segment) -> &str {
        match segment.kind {
            SegmentKind::Literal { start, end } => &self.source[start..end],
            SegmentKind::Component(_) => "",
        }
    }

    /// Scan the plan for the features it requires.
    pub fn demands(&self) -> FormatDemands {
        let mut demands = FormatDemands::default();
        for segment in &self.segments {
            if let SegmentKind::Component(kind) = segment.kind {
                match kind {
                    ComponentKind::LastWritten => {
                        let window = segment.chosen_size.max(1).min(crate::state::MAX_LASTWRITTEN);
                        demands.lastwritten = demands.lastwritten.max(window);
                    }
                    ComponentKind::PreviousLine => demands.previous_line = true,
                    ComponentKind::Timer => demands.timer = true,
                    ComponentKind::Bytes => demands.bytes = true,
                    ComponentKind::Rate => demands.rate = true,
                    ComponentKind::Progress
                    | ComponentKind::ProgressBarOnly
                    | ComponentKind::ProgressAmountOnly => demands.percentage = true,
                    _ => {}
                }
            }
        }
        demands
    }
}

fn brace_component(tag: &str) -> Option<ComponentKind> {
    let kind = match tag {
        "progress" => ComponentKind::Progress,
        "progress-bar-only" => ComponentKind::ProgressBarOnly,
        "progress-amount-only" => ComponentKind::ProgressAmountOnly,
        "bar-plain" => ComponentKind::BarPlain,
        "bar-block" => ComponentKind::BarBlock,
        "bar-granular" => ComponentKind::BarGranular,
        "bar-shaded" => ComponentKind::BarShaded,
        "timer" => ComponentKind::Timer,
        "eta" => ComponentKind::Eta,
        "fineta" => ComponentKind::FinEta,
        "rate" => ComponentKind::Rate,
        "average-rate" => ComponentKind::AverageRate,
        "bytes" | "transferred" => ComponentKind::Bytes,
        "buffer-percent" => ComponentKind::BufferPercent,
        "last-written" => ComponentKind::LastWritten,
        "previous-line" => ComponentKind::PreviousLine,
        "name" => ComponentKind::Name,
        _ => return None,
    };
    Some(kind)
}

fn letter_component(letter: u8) -> Option<ComponentKind> {
    let kind = match letter {
        b'p' => ComponentKind::Progress,
        b't' => ComponentKind::Timer,
        b'e' => ComponentKind::Eta,
        b'I' => ComponentKind::FinEta,
        b'r' => ComponentKind::Rate,
        b'a' => ComponentKind::AverageRate,
        b'b' => ComponentKind::Bytes,
        b'T' => ComponentKind::BufferPercent,
        b'A' => ComponentKind::LastWritten,
        b'L' => ComponentKind::PreviousLine,
        b'N' => ComponentKind::Name,
        _ => return None,
    };
    Some(kind)
}

/// Visible width of a string in display columns when the locale allows
/// UTF-8, or in bytes otherwise.
pub fn str_width(text: &str, utf8: bool) -> usize {
    if utf8 {
        UnicodeWidthStr::width(text)
    } else {
        text.len()
    }
}

fn push_literal(segments: &mut Vec<Segment>, source: &str, start: usize, end: usize, utf8: bool) {
    if end <= start {
        return;
    }
    segments.push(Segment {
        kind: SegmentKind::Literal { start, end },
        chosen_size: 0,
        parameter: None,
        literal_width: str_width(&source[start..end], utf8),
    });
}

/// Compile a format string into a segment plan. Compiling the same string
/// twice yields an identical plan.
pub fn compile(source: &str, utf8: bool) -> CompiledFormat {
    let bytes = source.as_bytes();
    let mut segments = Vec::new();
    let mut position = 0;

    while position < bytes.len() {
        if bytes[position] != b'%' {
            let literal_start = position;
            while position < bytes.len() && bytes[position] != b'%' {
                position += 1;
            }
            push_literal(&mut segments, source, literal_start, position, utf8);
            continue;
        }

        // A '%' escape begins here.
        let escape_start = position;
        position += 1;

        if position >= bytes.len() {
            // Trailing '%' is a literal.
            push_literal(&mut segments, source, escape_start, position, utf8);
            break;
        }

        // Optional decimal size prefix.
        let digits_start = position;
        while position < bytes.len() && bytes[position].is_ascii_digit() {
            position += 1;
        }
        let chosen_size: usize = source[digits_start..position].parse().unwrap_or(0);

        if position >= bytes.len() {
            // "%123" at end of string: pass through verbatim.
            push_literal(&mut segments, source, escape_start, position, utf8);
            break;
        }

        match bytes[position] {
            b'%' if position == digits_start => {
                // "%%" is a literal percent sign.
                segments.push(Segment {
                    kind: SegmentKind::Literal {
                        start: position,
                        end: position + 1,
                    },
                    chosen_size: 0,
                    parameter: None,
                    literal_width: 1,
                });
                position += 1;
            }
            b'{' => {
                // Brace-wrapped tag, possibly with an argument after ':'.
                let body_start = position + 1;
                match source[body_start..].find('}') {
                    Some(relative_end) => {
                        let body = &source[body_start..body_start + relative_end];
                        position = body_start + relative_end + 1;
                        if let Some(argument) = body.strip_prefix("sgr:") {
                            segments.push(Segment {
                                kind: SegmentKind::Component(ComponentKind::Sgr),
                                chosen_size,
                                parameter: Some(argument.to_string()),
                                literal_width: 0,
                            });
                        } else if let Some(kind) = brace_component(body) {
                            segments.push(Segment {
                                kind: SegmentKind::Component(kind),
                                chosen_size,
                                parameter: None,
                                literal_width: 0,
                            });
                        } else {
                            // Unknown brace tag: show it verbatim.
                            push_literal(&mut segments, source, escape_start, position, utf8);
                        }
                    }
                    None => {
                        // Unterminated brace: show the rest verbatim.
                        push_literal(&mut segments, source, escape_start, bytes.len(), utf8);
                        position = bytes.len();
                    }
                }
            }
            letter => match letter_component(letter) {
                Some(kind) => {
                    segments.push(Segment {
                        kind: SegmentKind::Component(kind),
                        chosen_size,
                        parameter: None,
                        literal_width: 0,
                    });
                    position += 1;
                }
                None => {
                    // Unknown escape: pass it through verbatim, stepping
                    // over the whole character, which may be multi-byte.
                    let step = source[position..]
                        .chars()
                        .next()
                        .map(char::len_utf8)
                        .unwrap_or(1);
                    position += step;
                    push_literal(&mut segments, source, escape_start, position, utf8);
                }
            },
        }
    }

    CompiledFormat {
        source: source.to_string(),
        segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(compiled: &CompiledFormat) -> Vec<String> {
        compiled
            .segments
            .iter()
            .map(|segment| match &segment.kind {
                SegmentKind::Literal { .. } => {
                    format!("lit:{}", compiled.literal_text(segment))
                }
                SegmentKind::Component(kind) => format!("{:?}", kind),
            })
            .collect()
    }

    #[test]
    fn classic_default_format_compiles() {
        let compiled = compile("%b %t %r %p %e", true);
        assert_eq!(
            kinds(&compiled),
            vec!["Bytes", "lit: ", "Timer", "lit: ", "Rate", "lit: ", "Progress", "lit: ", "Eta"]
        );
    }

    #[test]
    fn double_percent_is_one_literal_percent() {
        let compiled = compile("100%% done", true);
        let text: String = compiled
            .segments
            .iter()
            .map(|segment| compiled.literal_text(segment).to_string())
            .collect();
        assert_eq!(text, "100% done");
    }

    #[test]
    fn trailing_percent_is_literal() {
        let compiled = compile("ends with %", true);
        assert_eq!(kinds(&compiled), vec!["lit:ends with ", "lit:%"]);
    }

    #[test]
    fn unknown_escape_passes_through() {
        let compiled = compile("%z", true);
        assert_eq!(kinds(&compiled), vec!["lit:%z"]);
    }

    #[test]
    fn unknown_multibyte_escape_is_verbatim() {
        let compiled = compile("%进 %b", true);
        assert_eq!(kinds(&compiled)[0], "lit:%进");
    }

    #[test]
    fn numeric_prefix_is_recorded() {
        let compiled = compile("%20A", true);
        assert_eq!(compiled.segments.len(), 1);
        assert_eq!(compiled.segments[0].chosen_size, 20);
        assert_eq!(
            compiled.segments[0].kind,
            SegmentKind::Component(ComponentKind::LastWritten)
        );
    }

    #[test]
    fn brace_tags_and_sgr_parameters() {
        let compiled = compile("%{progress} %{sgr:bold,red}%{rate}", true);
        assert_eq!(
            compiled.segments[0].kind,
            SegmentKind::Component(ComponentKind::Progress)
        );
        assert_eq!(
            compiled.segments[2].kind,
            SegmentKind::Component(ComponentKind::Sgr)
        );
        assert_eq!(compiled.segments[2].parameter.as_deref(), Some("bold,red"));
        assert_eq!(
            compiled.segments[3].kind,
            SegmentKind::Component(ComponentKind::Rate)
        );
    }

    #[test]
    fn unknown_brace_tag_is_verbatim() {
        let compiled = compile("%{nonsense}", true);
        assert_eq!(kinds(&compiled), vec!["lit:%{nonsense}"]);
    }

    #[test]
    fn recompiling_the_same_source_gives_the_same_plan() {
        let source = "%N %b %T %t %r %a %p %e %I %12A %{sgr:bold} %{previous-line}";
        let first = compile(source, true);
        let second = compile(source, true);
        assert_eq!(first, second);
    }

    #[test]
    fn demands_reflect_components() {
        let compiled = compile("%t %b %r %p %16A %L", true);
        let demands = compiled.demands();
        assert!(demands.timer && demands.bytes && demands.rate && demands.percentage);
        assert!(demands.previous_line);
        assert_eq!(demands.lastwritten, 16);
    }

    #[test]
    fn elastic_previous_line_is_dynamic_but_sized_is_not() {
        let compiled = compile("%L %40L %p", true);
        assert!(compiled.segments[0].is_dynamic());
        assert!(!compiled.segments[2].is_dynamic());
        assert!(compiled.segments[4].is_dynamic());
    }

    #[test]
    fn wide_characters_count_in_columns() {
        let compiled = compile("进度 %p", true);
        // Two double-width characters plus a space.
        assert_eq!(compiled.segments[0].literal_width, 5);
    }
}
