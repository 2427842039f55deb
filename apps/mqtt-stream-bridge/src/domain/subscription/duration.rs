//! Duration Literals
//!
//! Formatting and parsing of the duration literals used in channel
//! addresses (`0s`, `500ms`, `1.5s`, `1m30s`, `2h0m0s`). The host platform
//! writes intervals in this notation, so both directions must agree with it
//! exactly.

use std::time::Duration;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Maximum fractional digits considered when parsing.
const MAX_FRACTION_DIGITS: usize = 18;

/// Duration literal parse error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    /// The literal is empty or not a sequence of `<number><unit>` pairs.
    #[error("invalid duration {0:?}")]
    Invalid(String),
    /// A number is not followed by a unit.
    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),
    /// Unit is not one of `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`.
    #[error("unknown unit {unit:?} in duration {literal:?}")]
    UnknownUnit {
        /// Offending unit.
        unit: String,
        /// Full literal.
        literal: String,
    },
    /// Negative durations cannot describe a window.
    #[error("negative duration {0:?}")]
    Negative(String),
    /// The value does not fit in a [`Duration`].
    #[error("duration {0:?} out of range")]
    Overflow(String),
}

/// Format a duration as a literal such as `0s`, `500ms` or `1m30.5s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();

    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < NANOS_PER_MICRO {
        return format!("{nanos}ns");
    }
    if nanos < NANOS_PER_MILLI {
        return format!("{}µs", with_fraction(nanos, NANOS_PER_MICRO));
    }
    if nanos < NANOS_PER_SEC {
        return format!("{}ms", with_fraction(nanos, NANOS_PER_MILLI));
    }

    let total_secs = nanos / NANOS_PER_SEC;
    let sub_second = nanos % NANOS_PER_SEC;
    let hours = total_secs / 3600;
    let minutes = (total_secs / 60) % 60;
    let seconds = with_fraction((total_secs % 60) * NANOS_PER_SEC + sub_second, NANOS_PER_SEC);

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// `value / unit` written with the minimum number of fractional digits.
fn with_fraction(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let rest = value % unit;
    if rest == 0 {
        return whole.to_string();
    }

    let width = unit.ilog10() as usize;
    let digits = format!("{rest:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// Parse a duration literal.
///
/// Accepts an optional leading `+`, the bare literal `0`, and any sequence
/// of decimal numbers (with optional fraction) each followed by a unit.
///
/// # Errors
///
/// Returns [`DurationError`] if the literal is malformed, negative or out of
/// range.
pub fn parse_duration(literal: &str) -> Result<Duration, DurationError> {
    let invalid = || DurationError::Invalid(literal.to_string());

    let text = literal.strip_prefix('+').unwrap_or(literal);
    if text.starts_with('-') {
        return Err(DurationError::Negative(literal.to_string()));
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(invalid());
    }

    let mut rest = text;
    let mut total: u128 = 0;

    while !rest.is_empty() {
        let whole_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let whole_text = &rest[..whole_len];
        rest = &rest[whole_len..];

        let mut fraction_text = "";
        if let Some(after_dot) = rest.strip_prefix('.') {
            let fraction_len = after_dot.bytes().take_while(u8::is_ascii_digit).count();
            fraction_text = &after_dot[..fraction_len];
            rest = &after_dot[fraction_len..];
        }

        if whole_text.is_empty() && fraction_text.is_empty() {
            return Err(invalid());
        }

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let unit_nanos = unit_in_nanos(unit).ok_or_else(|| {
            if unit.is_empty() {
                DurationError::MissingUnit(literal.to_string())
            } else {
                DurationError::UnknownUnit {
                    unit: unit.to_string(),
                    literal: literal.to_string(),
                }
            }
        })?;

        let whole: u128 = if whole_text.is_empty() {
            0
        } else {
            whole_text.parse().map_err(|_| invalid())?
        };
        let overflow = || DurationError::Overflow(literal.to_string());
        let mut part = whole.checked_mul(unit_nanos).ok_or_else(overflow)?;

        let fraction_digits = &fraction_text[..fraction_text.len().min(MAX_FRACTION_DIGITS)];
        if !fraction_digits.is_empty() {
            let numerator: u128 = fraction_digits.parse().map_err(|_| invalid())?;
            let scale = 10u128.pow(u32::try_from(fraction_digits.len()).map_err(|_| invalid())?);
            part = part
                .checked_add(numerator * unit_nanos / scale)
                .ok_or_else(overflow)?;
        }

        total = total.checked_add(part).ok_or_else(overflow)?;
    }

    let overflow = || DurationError::Overflow(literal.to_string());
    let secs = u64::try_from(total / NANOS_PER_SEC).map_err(|_| overflow())?;
    let sub_second = u32::try_from(total % NANOS_PER_SEC).map_err(|_| overflow())?;
    Ok(Duration::new(secs, sub_second))
}

fn unit_in_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SEC),
        "m" => Some(60 * NANOS_PER_SEC),
        "h" => Some(3600 * NANOS_PER_SEC),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(0, "0s")]
    #[test_case(1, "1ms")]
    #[test_case(500, "500ms")]
    #[test_case(1_000, "1s")]
    #[test_case(1_500, "1.5s")]
    #[test_case(60_000, "1m0s")]
    #[test_case(90_500, "1m30.5s")]
    #[test_case(3_600_000, "1h0m0s")]
    #[test_case(5_430_250, "1h30m30.25s")]
    fn formats_millis(millis: u64, expected: &str) {
        assert_eq!(format_duration(Duration::from_millis(millis)), expected);
    }

    #[test]
    fn formats_sub_millisecond() {
        assert_eq!(format_duration(Duration::from_nanos(15)), "15ns");
        assert_eq!(format_duration(Duration::from_micros(2)), "2µs");
        assert_eq!(format_duration(Duration::from_nanos(1_500)), "1.5µs");
        assert_eq!(format_duration(Duration::from_micros(1_250)), "1.25ms");
    }

    #[test_case("0", 0)]
    #[test_case("0s", 0)]
    #[test_case("+5s", 5_000)]
    #[test_case("500ms", 500)]
    #[test_case("1.5s", 1_500)]
    #[test_case(".5s", 500)]
    #[test_case("1m30s", 90_000)]
    #[test_case("1h0m0s", 3_600_000)]
    #[test_case("2h45m", 9_900_000)]
    #[test_case("1500us", 1)]
    #[test_case("1500µs", 1)]
    fn parses_to_millis(literal: &str, millis: u128) {
        assert_eq!(parse_duration(literal).unwrap().as_millis(), millis);
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!(matches!(parse_duration(""), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("s"), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("."), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("10"), Err(DurationError::MissingUnit(_))));
        assert!(matches!(
            parse_duration("3days"),
            Err(DurationError::UnknownUnit { .. })
        ));
        assert!(matches!(parse_duration("-1s"), Err(DurationError::Negative(_))));
        assert!(matches!(
            parse_duration("99999999999999999999h"),
            Err(DurationError::Overflow(_))
        ));
    }

    #[test]
    fn format_then_parse_is_identity_for_millis() {
        for millis in [
            0,
            1,
            7,
            999,
            1_000,
            1_001,
            59_999,
            61_000,
            86_400_000,
            123_456_789,
            20_000_000_000_000,
            u64::MAX,
        ] {
            let duration = Duration::from_millis(millis);
            assert_eq!(parse_duration(&format_duration(duration)).unwrap(), duration);
        }
    }
}
