//! Quiet-hours evaluator: decides whether a device is inside its
//! do-not-disturb window.
//!
//! The window is evaluated in the device's local time at minute granularity.
//! Windows where `start >= end` wrap past midnight. Every failure (bad `HH:MM`,
//! unknown zone) fails open: delivery is never suppressed because of a
//! misconfigured window.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

use beacon_common::types::{Device, QuietHours};

/// Returns `true` when `now` falls inside the device's quiet hours.
pub fn is_in_quiet_hours(now: DateTime<Utc>, device: &Device) -> bool {
    let Some(quiet_hours) = device
        .notification_preferences
        .as_ref()
        .and_then(|prefs| prefs.quiet_hours.as_ref())
    else {
        return false;
    };

    if !quiet_hours.enabled {
        return false;
    }

    let (Some(start), Some(end)) = (
        non_empty(quiet_hours.start.as_deref()),
        non_empty(quiet_hours.end.as_deref()),
    ) else {
        return false;
    };

    let Some(tz) = resolve_timezone(quiet_hours, device) else {
        return false;
    };

    let (Some(start_min), Some(end_min)) = (parse_hhmm(start), parse_hhmm(end)) else {
        tracing::warn!(
            device_id = %device.id,
            start,
            end,
            "Invalid quiet hours window, ignoring"
        );
        return false;
    };

    let local = now.with_timezone(&tz);
    let now_min = local.hour() * 60 + local.minute();

    window_contains(start_min, end_min, now_min)
}

/// Inclusive window test on minutes since midnight.
pub fn window_contains(start_min: u32, end_min: u32, now_min: u32) -> bool {
    if start_min < end_min {
        now_min >= start_min && now_min <= end_min
    } else {
        now_min >= start_min || now_min <= end_min
    }
}

/// Parse `HH:MM` into minutes since midnight.
pub fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.trim().split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;

    if hours >= 24 || minutes >= 60 {
        return None;
    }

    Some(hours * 60 + minutes)
}

/// quiet_hours.timezone, else device.timezone, else UTC.
fn resolve_timezone(quiet_hours: &QuietHours, device: &Device) -> Option<Tz> {
    let name = non_empty(quiet_hours.timezone.as_deref())
        .or_else(|| non_empty(device.timezone.as_deref()));

    match name {
        None => Some(chrono_tz::UTC),
        Some(name) => match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                tracing::warn!(
                    device_id = %device.id,
                    timezone = name,
                    "Unknown timezone for quiet hours, ignoring"
                );
                None
            }
        },
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
