//! ECMA-48 SGR sequences for the `%{sgr:...}` component.
//!
//! Keywords map to SGR code numbers; bare numbers in range pass straight
//! through. When the terminal cannot display colour the component renders
//! as nothing, so formats stay portable.

const KEYWORDS: &[(&str, u8)] = &[
    ("reset", 0),
    ("none", 0),
    ("bold", 1),
    ("dim", 2),
    ("italic", 3),
    ("underscore", 4),
    ("underline", 4),
    ("blink", 5),
    ("reverse", 7),
    ("no-bold", 22),
    ("no-dim", 22),
    ("no-italic", 23),
    ("no-underscore", 24),
    ("no-underline", 24),
    ("no-blink", 25),
    ("no-reverse", 27),
    ("black", 30),
    ("red", 31),
    ("green", 32),
    ("brown", 33),
    ("yellow", 33),
    ("blue", 34),
    ("magenta", 35),
    ("cyan", 36),
    ("white", 37),
    ("fg-black", 30),
    ("fg-red", 31),
    ("fg-green", 32),
    ("fg-brown", 33),
    ("fg-yellow", 33),
    ("fg-blue", 34),
    ("fg-magenta", 35),
    ("fg-cyan", 36),
    ("fg-white", 37),
    ("fg-default", 39),
    ("bg-black", 40),
    ("bg-red", 41),
    ("bg-green", 42),
    ("bg-brown", 43),
    ("bg-yellow", 43),
    ("bg-blue", 44),
    ("bg-magenta", 45),
    ("bg-cyan", 46),
    ("bg-white", 47),
    ("bg-default", 49),
];

fn code_for(word: &str) -> Option<u8> {
    if let Ok(number) = word.parse::<u8>() {
        if number < 255 {
            return Some(number);
        }
    }
    KEYWORDS
        .iter()
        .find(|(keyword, _)| *keyword == word)
        .map(|(_, code)| *code)
}

/// Translate a comma- or semicolon-separated keyword list into an escape
/// sequence. Unknown keywords are skipped rather than erroring, so a typo
/// costs one attribute, not the display.
pub fn render(parameter: &str, colour_allowed: bool) -> String {
    if !colour_allowed {
        return String::new();
    }

    let codes: Vec<String> = parameter
        .split([',', ';'])
        .filter_map(|word| code_for(word.trim()))
        .map(|code| code.to_string())
        .collect();

    if codes.is_empty() {
        return String::new();
    }
    format!("\x1b[{}m", codes.join(";"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_become_codes() {
        assert_eq!(render("bold,red", true), "\x1b[1;31m");
        assert_eq!(render("reset", true), "\x1b[0m");
    }

    #[test]
    fn raw_numbers_pass_through() {
        assert_eq!(render("38", true), "\x1b[38m");
    }

    #[test]
    fn unknown_keywords_are_skipped() {
        assert_eq!(render("sparkly,bold", true), "\x1b[1m");
        assert_eq!(render("sparkly", true), "");
    }

    #[test]
    fn colourless_terminals_get_nothing() {
        assert_eq!(render("bold", false), "");
    }
}
