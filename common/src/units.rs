//! Human-readable quantity formatting.
//!
//! Transfer counts and rates are shown as three to four significant digits
//! followed by a scale prefix, e.g. `9.77KiB`, ` 105MiB/s`, `1.23k`. Byte
//! counts scale by 1024 with IEC `Ki`/`Mi` prefixes, decimal byte counts by
//! 1000 with SI prefixes, and line counts by 1000 with bare SI prefixes.

/// What kind of quantity a counter holds, which decides the divisor and the
/// prefix spelling used when describing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountType {
    /// Bytes, scaled by 1024: `KiB`, `MiB`, ...
    Bytes,
    /// Bytes, scaled by 1000: `kB`, `MB`, ... (the `--si` switch)
    DecBytes,
    /// Lines (or any unitless count), scaled by 1000: `k`, `M`, ...
    Lines,
}

impl CountType {
    fn ratio(self) -> f64 {
        match self {
            CountType::Bytes => 1024.0,
            CountType::DecBytes | CountType::Lines => 1000.0,
        }
    }
}

/// Rising prefixes shared by every count type; index 0 is "no prefix".
const PREFIX_1024: [&str; 9] = ["", "K", "M", "G", "T", "P", "E", "Z", "Y"];
const PREFIX_1000: [&str; 9] = ["", "k", "M", "G", "T", "P", "E", "Z", "Y"];

/// Scale `amount` into the range [1, ratio) and return the digits plus the
/// chosen prefix, e.g. (9.77, "Ki") for 10_000 bytes.
fn scale(amount: f64, count_type: CountType) -> (f64, String) {
    let ratio = count_type.ratio();
    let prefixes: &[&str; 9] = match count_type {
        CountType::Bytes => &PREFIX_1024,
        CountType::DecBytes | CountType::Lines => &PREFIX_1000,
    };

    // Very small values keep an empty prefix so we never show "0.00KiB".
    if amount.abs() < 0.000_000_01 {
        return (0.0, String::new());
    }

    // A little below the ratio, so 1000 becomes "0.98KiB" rather than
    // "1000B" overflowing to four digits.
    let cutoff = ratio * 0.97;
    let mut value = amount;
    let mut index = 0;
    while value.abs() > cutoff && index + 1 < prefixes.len() {
        value /= ratio;
        index += 1;
    }

    let mut prefix = String::from(prefixes[index]);
    if count_type == CountType::Bytes && index > 0 {
        prefix.push('i');
    }
    (value, prefix)
}

/// Render a quantity as digits + prefix + suffix, e.g. `9.77KiB/s`.
///
/// `suffix` is the unit name without any prefix (`B`, `B/s`, `b/s`, `/s`,
/// or empty for plain line counts). Three significant digits are kept,
/// with trailing zeros preserved (`10.0` rather than `10`); quantities of
/// 100 or more in their scaled form are shown as integers.
pub fn describe_amount(amount: f64, suffix: &str, count_type: CountType) -> String {
    let (value, prefix) = scale(amount, count_type);

    let digits = if value.abs() >= 99.95 {
        format!("{:4.0}", value)
    } else if value.abs() >= 9.995 {
        format!("{:.1}", value)
    } else if value.abs() >= 0.9995 {
        format!("{:.2}", value)
    } else {
        format!("{:.3}", value)
    };

    format!("{}{}{}", digits, prefix, suffix)
}

/// The per-count-type suffix for a plain count: `B` for bytes, nothing for
/// lines.
pub fn count_suffix(count_type: CountType) -> &'static str {
    match count_type {
        CountType::Bytes | CountType::DecBytes => "B",
        CountType::Lines => "",
    }
}

/// The per-count-type suffix for a rate.
pub fn rate_suffix(count_type: CountType) -> &'static str {
    match count_type {
        CountType::Bytes | CountType::DecBytes => "B/s",
        CountType::Lines => "/s",
    }
}

/// Format a second count as `[D:]H:MM:SS`, with the day component only
/// included beyond 24 hours. Bounded above at 100,000 hours so the field
/// width stays sane.
pub fn describe_duration(seconds: f64) -> String {
    let total = seconds.min(360_000_000.0).max(0.0) as i64;
    if total > 86_400 {
        format!(
            "{}:{:02}:{:02}:{:02}",
            total / 86_400,
            (total / 3_600) % 24,
            (total / 60) % 60,
            total % 60
        )
    } else {
        format!("{}:{:02}:{:02}", total / 3_600, (total / 60) % 60, total % 60)
    }
}

/// Parse a size argument: a decimal number with an optional `K`, `M`,
/// `G`, or `T` suffix (binary multiples, case-insensitive). Decimals are
/// accepted with `.` or `,`, so `-s 1.5G` works in either locale habit.
pub fn parse_size(text: &str) -> Result<u64, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty size".to_string());
    }

    let mut digits = String::new();
    let mut rest = trimmed;
    let mut seen_point = false;
    for (index, character) in trimmed.char_indices() {
        match character {
            '0'..='9' => digits.push(character),
            '.' | ',' if !seen_point => {
                seen_point = true;
                digits.push('.');
            }
            _ => {
                rest = &trimmed[index..];
                break;
            }
        }
        rest = &trimmed[index + character.len_utf8()..];
    }

    let value: f64 = digits
        .parse()
        .map_err(|_| format!("invalid number: {:?}", text))?;

    let shift = match rest.trim() {
        "" => 0u32,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        other => return Err(format!("unknown size suffix: {:?}", other)),
    };

    Ok((value * (1u64 << shift) as f64) as u64)
}

/// Parse a fractional second count, accepting `,` as the decimal point.
pub fn parse_seconds(text: &str) -> Result<f64, String> {
    let normalised = text.trim().replace(',', ".");
    let value: f64 = normalised
        .parse()
        .map_err(|_| format!("invalid number of seconds: {:?}", text))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid number of seconds: {:?}", text));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale_by_1024() {
        assert_eq!(describe_amount(10_000.0, "B", CountType::Bytes), "9.77KiB");
        assert_eq!(
            describe_amount(1024.0 * 1024.0, "B", CountType::Bytes),
            "1.00MiB"
        );
    }

    #[test]
    fn trailing_zeros_are_kept() {
        assert_eq!(describe_amount(10.0 * 1024.0, "B", CountType::Bytes), "10.0KiB");
    }

    #[test]
    fn lines_scale_by_1000_without_unit() {
        assert_eq!(describe_amount(1500.0, "", CountType::Lines), "1.50k");
        assert_eq!(describe_amount(3.0, "", CountType::Lines), "3.00");
    }

    #[test]
    fn decimal_bytes_use_si_prefixes() {
        assert_eq!(describe_amount(10_000.0, "B", CountType::DecBytes), "10.0kB");
    }

    #[test]
    fn zero_has_no_prefix() {
        assert_eq!(describe_amount(0.0, "B", CountType::Bytes), "0.000B");
    }

    #[test]
    fn large_values_lose_the_decimal_point() {
        // 500 GiB scaled down is 500, shown as an integer.
        let text = describe_amount(500.0 * 1024.0 * 1024.0 * 1024.0, "B", CountType::Bytes);
        assert_eq!(text, " 500GiB");
    }

    #[test]
    fn duration_under_a_day() {
        assert_eq!(describe_duration(0.0), "0:00:00");
        assert_eq!(describe_duration(3_725.0), "1:02:05");
    }

    #[test]
    fn duration_over_a_day_includes_days() {
        assert_eq!(describe_duration(90_000.0), "1:01:00:00");
    }

    #[test]
    fn duration_is_clamped() {
        assert!(describe_duration(1e12).starts_with("4166:"));
    }

    #[test]
    fn sizes_parse_with_binary_suffixes() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("10k"), Ok(10 * 1024));
        assert_eq!(parse_size("10M"), Ok(10 * 1024 * 1024));
        assert_eq!(parse_size("2G"), Ok(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("1T"), Ok(1u64 << 40));
    }

    #[test]
    fn sizes_accept_decimals_and_spacing() {
        assert_eq!(parse_size("1.5K"), Ok(1536));
        assert_eq!(parse_size("1,5K"), Ok(1536));
        assert_eq!(parse_size(" 2 M "), Ok(2 * 1024 * 1024));
    }

    #[test]
    fn bad_sizes_are_rejected() {
        assert!(parse_size("").is_err());
        assert!(parse_size("ten").is_err());
        assert!(parse_size("5X").is_err());
        assert!(parse_size("1.2.3").is_err());
    }

    #[test]
    fn seconds_parse_with_either_decimal_point() {
        assert_eq!(parse_seconds("0.5"), Ok(0.5));
        assert_eq!(parse_seconds("0,5"), Ok(0.5));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("abc").is_err());
    }
}
