//! Human-readable rendering helpers for timestamps and durations, shared by
//! every subcommand that prints a monitor or a probe.

/// Renders a duration in seconds as e.g. `"90 seconds"`, `"1 minute"`, or
/// `"2 minutes 30 seconds"`.
pub fn seconds_to_human_readable_string(seconds: f64) -> String {
    if seconds < 0.0 {
        return "invalid duration".to_string();
    }

    if seconds < 60.0 {
        return human_readable_seconds(seconds);
    }

    let whole = seconds.floor() as i64;
    let minutes = whole / 60;
    let remainder = seconds - (minutes * 60) as f64;

    let mut minute_string = format!("{minutes} minute");
    if minutes != 1 {
        minute_string.push('s');
    }

    if remainder == 0.0 {
        minute_string
    } else {
        format!("{minute_string} {}", human_readable_seconds(remainder))
    }
}

fn human_readable_seconds(seconds: f64) -> String {
    let postfix = if seconds == 1.0 { "second" } else { "seconds" };
    if seconds.fract() == 0.0 {
        format!("{} {postfix}", seconds as i64)
    } else {
        format!("{seconds:.2} {postfix}")
    }
}

/// Renders a Unix timestamp as `YYYY-MM-DD HH:MM:SS` in local time.
pub fn timestamp_to_human_readable_string(timestamp: i64) -> String {
    let datetime = chrono::DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_else(|| chrono::DateTime::from_timestamp(0, 0).unwrap());
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}
