use anyhow::{anyhow, bail, Context, Result};
use range_parser::parse;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;

/// Highest `/proc/sys/kernel/pid_max` on 64-bit Linux.
const PID_MAX: u64 = 4_194_304;

static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([0-9]+(?:\.[0-9]+)?)\s*([kmgtp]?)(i?)(b?)$").expect("size pattern is valid")
});

/// Parse a time window made of `<int><unit>` tokens into a single duration.
///
/// Units are `w`, `d`, `h`, `m`, `s` or their long forms (`week`, `days`, `hour`, ...).
/// Tokens may be passed separately or whitespace-separated in one string; they are summed,
/// so their order does not matter.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use spg::utils::parsers::parse_time_window;
///
/// assert_eq!(parse_time_window(&["1h", "30m"]).unwrap(), Duration::from_secs(5400));
/// assert_eq!(parse_time_window(&["2d"]).unwrap(), Duration::from_secs(172800));
/// assert_eq!(parse_time_window(&["1w 1s"]).unwrap(), Duration::from_secs(604801));
/// ```
pub fn parse_time_window<S: AsRef<str>>(tokens: &[S]) -> Result<Duration> {
    let mut total: u64 = 0;
    let mut seen = 0usize;

    for token in tokens.iter().flat_map(|t| t.as_ref().split_whitespace()) {
        let seconds = parse_time_token(token)?;
        total = total
            .checked_add(seconds)
            .ok_or_else(|| anyhow!("Time window is too large"))?;
        seen += 1;
    }

    if seen == 0 {
        bail!("Time window cannot be empty");
    }
    Ok(Duration::from_secs(total))
}

fn parse_time_token(token: &str) -> Result<u64> {
    let split = token
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("Time '{token}' must end with a unit (w, d, h, m or s)"))?;
    let (value, unit) = token.split_at(split);
    let value = value
        .parse::<u64>()
        .with_context(|| format!("Invalid number in time '{token}'"))?;

    let scale = match unit.to_ascii_lowercase().as_str() {
        "w" | "week" | "weeks" => WEEK,
        "d" | "day" | "days" => DAY,
        "h" | "hour" | "hours" => HOUR,
        "m" | "min" | "minute" | "minutes" => MINUTE,
        "s" | "sec" | "second" | "seconds" => 1,
        _ => bail!("Invalid time unit in '{token}'. Expected w, d, h, m or s"),
    };

    value
        .checked_mul(scale)
        .ok_or_else(|| anyhow!("Time '{token}' is too large"))
}

/// Format a duration as the compact time window accepted by [`parse_time_window`].
///
/// ```
/// use std::time::Duration;
/// use spg::utils::parsers::format_time_window;
///
/// assert_eq!(format_time_window(Duration::from_secs(90061)), "1d 1h 1m 1s");
/// assert_eq!(format_time_window(Duration::ZERO), "0s");
/// ```
pub fn format_time_window(duration: Duration) -> String {
    let mut remaining = duration.as_secs();
    let mut parts = Vec::new();
    for (scale, unit) in [(WEEK, "w"), (DAY, "d"), (HOUR, "h"), (MINUTE, "m"), (1, "s")] {
        let value = remaining / scale;
        remaining %= scale;
        if value != 0 {
            parts.push(format!("{value}{unit}"));
        }
    }

    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}

/// Parse the elapsed time printed by `ps` (`[[DD-]hh:]mm:ss`).
///
/// ```
/// use std::time::Duration;
/// use spg::utils::parsers::parse_ps_elapsed;
///
/// assert_eq!(parse_ps_elapsed("05:07").unwrap(), Duration::from_secs(307));
/// assert_eq!(parse_ps_elapsed("01:00:00").unwrap(), Duration::from_secs(3600));
/// assert_eq!(parse_ps_elapsed("2-00:00:01").unwrap(), Duration::from_secs(172801));
/// ```
pub fn parse_ps_elapsed(elapsed: &str) -> Result<Duration> {
    let elapsed = elapsed.trim();
    let (days, clock) = match elapsed.split_once('-') {
        Some((days, clock)) => (
            days.parse::<u64>()
                .with_context(|| format!("Invalid days in elapsed time '{elapsed}'"))?,
            clock,
        ),
        None => (0, elapsed),
    };

    let fields = clock
        .split(':')
        .map(|field| field.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid elapsed time '{elapsed}'"))?;

    let (hours, minutes, seconds) = match fields.as_slice() {
        [minutes, seconds] => (0, *minutes, *seconds),
        [hours, minutes, seconds] => (*hours, *minutes, *seconds),
        _ => bail!("Invalid elapsed time '{elapsed}'. Expected [[DD-]hh:]mm:ss"),
    };
    if minutes >= 60 || seconds >= 60 {
        bail!("Invalid elapsed time '{elapsed}'. Minutes and seconds must be below 60");
    }

    Ok(Duration::from_secs(
        days * DAY + hours * HOUR + minutes * MINUTE + seconds,
    ))
}

/// Format a duration the way `ps` prints elapsed time.
///
/// ```
/// use std::time::Duration;
/// use spg::utils::parsers::format_ps_elapsed;
///
/// assert_eq!(format_ps_elapsed(Duration::from_secs(307)), "05:07");
/// assert_eq!(format_ps_elapsed(Duration::from_secs(3661)), "01:01:01");
/// assert_eq!(format_ps_elapsed(Duration::from_secs(172801)), "2-00:00:01");
/// ```
pub fn format_ps_elapsed(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / DAY;
    let hours = (total % DAY) / HOUR;
    let minutes = (total % HOUR) / MINUTE;
    let seconds = total % MINUTE;

    if days > 0 {
        format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
    } else if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// Parse a memory size into bytes.
///
/// `K`, `M`, `G`, `T`, `P` are decimal units, `Ki`, `Mi`, ... binary ones, and a trailing `B`
/// is optional. A bare number is multiplied by `bare_unit` (e.g. 1024 for the KiB printed by
/// `ps`).
///
/// ```
/// use spg::utils::parsers::parse_size;
///
/// assert_eq!(parse_size("256G", 1).unwrap(), 256_000_000_000);
/// assert_eq!(parse_size("1.5MB", 1).unwrap(), 1_500_000);
/// assert_eq!(parse_size("2Ki", 1).unwrap(), 2048);
/// assert_eq!(parse_size("4", 1024).unwrap(), 4096);
/// ```
pub fn parse_size(size: &str, bare_unit: u64) -> Result<u64> {
    let size = size.trim();
    let caps = SIZE_RE
        .captures(size)
        .ok_or_else(|| anyhow!("Invalid memory size '{size}'. Expected e.g. 512M, 16G or 1024"))?;

    let value = caps[1]
        .parse::<f64>()
        .with_context(|| format!("Invalid memory size '{size}'"))?;
    let exponent = match caps[2].to_ascii_uppercase().as_str() {
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        _ => 0,
    };
    let binary = !caps[3].is_empty();
    let explicit_bytes = !caps[4].is_empty();

    if exponent == 0 && binary {
        bail!("Invalid memory size '{size}'. Binary prefix needs a unit");
    }

    let multiplier = match (exponent, explicit_bytes) {
        (0, true) => 1.0,
        (0, false) => bare_unit as f64,
        (exp, _) if binary => 1024f64.powi(exp),
        (exp, _) => 1000f64.powi(exp),
    };

    Ok((value * multiplier).round() as u64)
}

/// Format bytes with a decimal unit and one fractional digit (`7.5GB`, `256.0MB`).
///
/// ```
/// use spg::utils::parsers::format_bytes;
///
/// assert_eq!(format_bytes(0), "0.0B");
/// assert_eq!(format_bytes(1_500), "1.5KB");
/// assert_eq!(format_bytes(256_000_000_000), "256.0GB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

/// Parse process IDs, supporting ranges like "100-103" or comma-separated "1,2,3".
///
/// ```
/// use spg::utils::parsers::parse_pids;
///
/// assert_eq!(parse_pids("1234").unwrap(), vec![1234]);
/// assert_eq!(parse_pids("7,5,6").unwrap(), vec![5, 6, 7]);
/// assert_eq!(parse_pids("100-102").unwrap(), vec![100, 101, 102]);
/// ```
pub fn parse_pids(input: &str) -> Result<Vec<u32>> {
    check_pid_count(input)?;
    let mut parsed: Vec<u32> =
        parse::<u32>(input.trim()).context(format!("Invalid pid or range: {}", input))?;

    parsed.sort_unstable();
    parsed.dedup();

    Ok(parsed)
}

/// Reject pid lists expanding to more pids than a kernel can hand out, before expanding them.
fn check_pid_count(input: &str) -> Result<()> {
    let mut total: u64 = 0;
    for part in input.split(',') {
        let count = match part.split_once('-') {
            Some((start, end)) => match (start.trim().parse::<u64>(), end.trim().parse::<u64>()) {
                (Ok(start), Ok(end)) => start.abs_diff(end) + 1,
                _ => continue,
            },
            None => 1,
        };
        total = total.saturating_add(count);
        if total > PID_MAX {
            bail!("Too many pids in '{input}': at most {PID_MAX} can be selected");
        }
    }
    Ok(())
}

/// Split a machine name into its group prefix and numeric id (`tenet12` -> `("tenet", 12)`).
pub fn split_machine_name(name: &str) -> Option<(&str, u32)> {
    let prefix = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if prefix.is_empty() || prefix.len() == name.len() {
        return None;
    }
    let id = name[prefix.len()..].parse().ok()?;
    Some((prefix, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_window_full_example() {
        let expected = WEEK + 5 * DAY + 11 * HOUR + 50 * MINUTE + 1;
        assert_eq!(
            parse_time_window(&["1w", "5d", "11h", "50m", "1s"]).unwrap(),
            Duration::from_secs(expected)
        );
        assert_eq!(
            parse_time_window(&["1w 5d 11h 50m 1s"]).unwrap(),
            Duration::from_secs(expected)
        );
    }

    #[test]
    fn test_parse_time_window_long_units() {
        assert_eq!(
            parse_time_window(&["2days", "1hour", "3minutes"]).unwrap(),
            Duration::from_secs(2 * DAY + HOUR + 3 * MINUTE)
        );
        assert_eq!(
            parse_time_window(&["1week"]).unwrap(),
            Duration::from_secs(WEEK)
        );
    }

    #[test]
    fn test_parse_time_window_invalid() {
        assert!(parse_time_window::<&str>(&[]).is_err());
        assert!(parse_time_window(&["   "]).is_err());
        assert!(parse_time_window(&["1a"]).is_err());
        assert!(parse_time_window(&["10"]).is_err());
        assert!(parse_time_window(&["h"]).is_err());
        assert!(parse_time_window(&["-1h"]).is_err());
    }

    #[test]
    fn test_format_time_window() {
        assert_eq!(format_time_window(Duration::from_secs(3600)), "1h");
        assert_eq!(
            format_time_window(Duration::from_secs(WEEK + 5 * DAY + 1)),
            "1w 5d 1s"
        );
    }

    #[test]
    fn test_parse_ps_elapsed_forms() {
        assert_eq!(parse_ps_elapsed("00:01").unwrap(), Duration::from_secs(1));
        assert_eq!(
            parse_ps_elapsed("12:34:56").unwrap(),
            Duration::from_secs(12 * HOUR + 34 * MINUTE + 56)
        );
        assert_eq!(
            parse_ps_elapsed("10-01:02:03").unwrap(),
            Duration::from_secs(10 * DAY + HOUR + 2 * MINUTE + 3)
        );
    }

    #[test]
    fn test_parse_ps_elapsed_invalid() {
        assert!(parse_ps_elapsed("").is_err());
        assert!(parse_ps_elapsed("12").is_err());
        assert!(parse_ps_elapsed("1:2:3:4").is_err());
        assert!(parse_ps_elapsed("00:75").is_err());
        assert!(parse_ps_elapsed("x-00:01").is_err());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("1K", 1).unwrap(), 1_000);
        assert_eq!(parse_size("1KiB", 1).unwrap(), 1_024);
        assert_eq!(parse_size("3g", 1).unwrap(), 3_000_000_000);
        assert_eq!(parse_size("12B", 1024).unwrap(), 12);
        assert_eq!(parse_size(" 2048 ", 1024).unwrap(), 2_097_152);
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(parse_size("", 1).is_err());
        assert!(parse_size("G", 1).is_err());
        assert!(parse_size("12X", 1).is_err());
        assert!(parse_size("5i", 1).is_err());
    }

    #[test]
    fn test_split_machine_name() {
        assert_eq!(split_machine_name("tenet12"), Some(("tenet", 12)));
        assert_eq!(split_machine_name("kuda1"), Some(("kuda", 1)));
        assert_eq!(split_machine_name("tenet"), None);
        assert_eq!(split_machine_name("123"), None);
    }

    #[test]
    fn test_parse_pids_invalid() {
        assert!(parse_pids("").is_err());
        assert!(parse_pids("abc").is_err());
    }

    #[test]
    fn test_parse_pids_bounds_ranges() {
        assert!(parse_pids("1-4000000000").is_err());
        assert!(parse_pids("4000000000-1").is_err());
        assert!(parse_pids("1-3000000,5-2000000").is_err());
        assert_eq!(parse_pids("1-1000").unwrap().len(), 1000);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn token() -> impl Strategy<Value = String> {
            (0u64..1000, prop::sample::select(vec!["w", "d", "h", "m", "s"]))
                .prop_map(|(value, unit)| format!("{value}{unit}"))
        }

        proptest! {
            /// Property: the time window is a sum, so token order is irrelevant
            #[test]
            fn prop_time_window_order_independent(
                tokens in prop::collection::vec(token(), 1..8),
            ) {
                let forward = parse_time_window(&tokens).unwrap();
                let mut reversed = tokens.clone();
                reversed.reverse();
                prop_assert_eq!(forward, parse_time_window(&reversed).unwrap());
            }

            /// Property: formatting and re-parsing ps elapsed time is lossless
            #[test]
            fn prop_ps_elapsed_round_trip(secs in 0u64..(400 * DAY)) {
                let formatted = format_ps_elapsed(Duration::from_secs(secs));
                prop_assert_eq!(parse_ps_elapsed(&formatted).unwrap(), Duration::from_secs(secs));
            }
        }
    }
}
