//! Human-facing durations: `3d`, `1w`, `12h`.

use chrono::Duration;

use crate::error::ErrorKind;

/// Parse a TTL or extension such as `12h`, `3d`, or `1w`.
///
/// # Errors
///
/// Returns `ErrorKind::InvalidArgument` if the unit is not `h`, `d`, or `w`,
/// the count is not a positive integer, or the result overflows.
pub fn parse_duration(input: &str) -> Result<Duration, ErrorKind> {
    let input = input.trim();
    let invalid = || {
        ErrorKind::InvalidArgument(format!(
            "invalid duration {input:?}: expected <n>h, <n>d or <n>w (e.g. 3d, 1w)"
        ))
    };

    let Some(unit) = input.chars().last() else {
        return Err(invalid());
    };
    let count: i64 = input[..input.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    if count <= 0 {
        return Err(ErrorKind::InvalidArgument(format!(
            "duration {input:?} must be greater than zero"
        )));
    }

    let duration = match unit {
        'h' => Duration::try_hours(count),
        'd' => Duration::try_days(count),
        'w' => Duration::try_weeks(count),
        _ => return Err(invalid()),
    };
    duration.ok_or_else(invalid)
}

/// Render time left until expiry: `3d 4h`, `2h 10m`, `15m`, or `EXPIRED`.
#[must_use]
pub fn format_time_remaining(remaining: Duration) -> String {
    if remaining < Duration::zero() {
        return "EXPIRED".to_string();
    }
    let days = remaining.num_days();
    let hours = remaining.num_hours() % 24;
    let minutes = remaining.num_minutes() % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
