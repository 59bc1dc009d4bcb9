//! # Duration Parsing
//!
//! Parses the Go-style durations used by `interval` and `retryInterval`
//! (`30s`, `5m`, `1h30m`, `500ms`). A bare `d` unit is accepted as days.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<number>\d+(?:\.\d+)?)(?P<unit>ns|us|µs|ms|s|m|h|d)")
        .expect("duration segment regex is valid")
});

/// Parse a Go-style duration string into a `Duration`
///
/// Every character must belong to a `<number><unit>` segment; the total must be
/// greater than zero.
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let trimmed = duration_str.trim();
    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    let mut consumed = 0;
    let mut total_secs = 0f64;
    for captures in SEGMENT.captures_iter(trimmed) {
        let whole = captures.get(0).map_or(0..0, |m| m.range());
        if whole.start != consumed {
            return Err(invalid(trimmed));
        }
        consumed = whole.end;

        let number: f64 = captures["number"]
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid duration number in '{trimmed}': {e}"))?;
        let scale = match &captures["unit"] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            _ => return Err(invalid(trimmed)),
        };
        total_secs += number * scale;
    }

    if consumed != trimmed.len() {
        return Err(invalid(trimmed));
    }
    if total_secs <= 0.0 {
        return Err(anyhow::anyhow!(
            "Duration must be greater than 0, got '{trimmed}'"
        ));
    }

    Ok(Duration::from_secs_f64(total_secs))
}

/// Render whole seconds the way Go prints durations (`30s`, `5m0s`, `1h30m0s`)
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn invalid(value: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "Invalid duration format '{value}'. Expected Go duration format (e.g., '30s', '5m', '1h30m')"
    )
}
