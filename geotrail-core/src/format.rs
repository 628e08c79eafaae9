//! Formatting helpers for CLI output.

use chrono::{DateTime, Utc};

/// Format a timestamp as relative time (e.g., "2m ago").
pub fn format_relative_time(ts: DateTime<Utc>) -> String {
    format_relative_time_at(ts, Utc::now())
}

fn format_relative_time_at(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let duration = now.signed_duration_since(ts);

    if duration.num_seconds() < 0 {
        "just now".to_string()
    } else if duration.num_seconds() < 60 {
        format!("{}s ago", duration.num_seconds())
    } else if duration.num_minutes() < 60 {
        format!("{}m ago", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{}h ago", duration.num_hours())
    } else if duration.num_days() < 7 {
        format!("{}d ago", duration.num_days())
    } else {
        ts.format("%b %d").to_string()
    }
}

/// Format an optional timestamp as relative time, or "never" if missing.
pub fn format_relative_time_opt(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => format_relative_time(ts),
        None => "never".to_string(),
    }
}

/// Seconds rendered compactly ("30s", "1.5s", "2m").
pub fn format_interval(secs: f64) -> String {
    if secs >= 60.0 && secs % 60.0 == 0.0 {
        format!("{}m", secs / 60.0)
    } else if secs.fract() == 0.0 {
        format!("{}s", secs)
    } else {
        format!("{:.1}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_relative_time_buckets() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        assert_eq!(format_relative_time_at(now + Duration::seconds(5), now), "just now");
        assert_eq!(format_relative_time_at(now - Duration::seconds(42), now), "42s ago");
        assert_eq!(format_relative_time_at(now - Duration::minutes(5), now), "5m ago");
        assert_eq!(format_relative_time_at(now - Duration::hours(3), now), "3h ago");
        assert_eq!(format_relative_time_at(now - Duration::days(2), now), "2d ago");
        assert_eq!(format_relative_time_at(now - Duration::days(30), now), "Feb 08");
    }

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(30.0), "30s");
        assert_eq!(format_interval(1.5), "1.5s");
        assert_eq!(format_interval(120.0), "2m");
        assert_eq!(format_relative_time_opt(None), "never");
    }
}
