//! Provides parsing and formatting helpers for durations.
//!
//! Max ages are mostly given in configuration files and show up in log output, therefore we
//! support a compact, human readable notation like "250ms" or "15m". Formatted durations may
//! combine several units (e.g. "1d 2h").
use std::fmt::Write;
use std::time::Duration;

use anyhow::Context;

/// Parses a duration from a given string.
///
/// A bare number is treated as seconds (just like the `max_age_seconds` of a
/// [Builder](crate::builder::Builder)). Otherwise, the following suffixes are supported (case
/// insensitive):
/// * **ms**: treats the value as milliseconds
/// * **s**: treats the value as seconds
/// * **m**: treats the value as minutes
/// * **h**: treats the value as hours
/// * **d**: treats the value as days
///
/// Returns an **Err** if a negative number or an unknown suffix was given.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(lazymemo::fmt::parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(lazymemo::fmt::parse_duration("12").unwrap(), Duration::from_secs(12));
/// assert_eq!(lazymemo::fmt::parse_duration("0.5s").unwrap(), Duration::from_millis(500));
/// assert_eq!(lazymemo::fmt::parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(lazymemo::fmt::parse_duration("2h").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(lazymemo::fmt::parse_duration("5 d").unwrap(), Duration::from_secs(5 * 24 * 60 * 60));
///
/// // An invalid suffix results in an error...
/// assert_eq!(lazymemo::fmt::parse_duration("3 Y").is_err(), true);
///
/// // Negative numbers result in an error...
/// assert_eq!(lazymemo::fmt::parse_duration("-1m").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_UNIT: regex::Regex =
            regex::Regex::new(r"(?i)^ *(\d+(?:\.\d+)?) *(ms|s|m|h|d)? *$").unwrap();
    }

    let input = str.as_ref();
    let captures = NUMBER_AND_UNIT.captures(input).with_context(|| {
        format!(
            "Cannot parse '{}' into a duration expression. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as suffix.",
            input
        )
    })?;

    let number = captures[1]
        .parse::<f64>()
        .with_context(|| format!("Invalid number in duration expression '{}'", input))?;
    let seconds = match captures.get(2).map(|unit| unit.as_str().to_ascii_lowercase()) {
        Some(unit) if unit == "ms" => number / 1000.,
        Some(unit) if unit == "m" => number * 60.,
        Some(unit) if unit == "h" => number * 60. * 60.,
        Some(unit) if unit == "d" => number * 60. * 60. * 24.,
        _ => number,
    };

    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("Duration expression '{}' is out of range", input))
}

/// Formats a duration into a string like "5d 3h 17m 2s 12ms".
///
/// Zero is rendered as "0ms" so that log lines never end up with an empty value.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(lazymemo::fmt::format_duration(Duration::ZERO), "0ms");
/// assert_eq!(lazymemo::fmt::format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(lazymemo::fmt::format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(lazymemo::fmt::format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(lazymemo::fmt::format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u128, &str); 5] = [
        (1000 * 60 * 60 * 24, "d"),
        (1000 * 60 * 60, "h"),
        (1000 * 60, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut result = String::new();
    let mut remaining = duration.as_millis();
    for (millis_per_unit, suffix) in UNITS {
        let amount = remaining / millis_per_unit;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, suffix);
            remaining %= millis_per_unit;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}
