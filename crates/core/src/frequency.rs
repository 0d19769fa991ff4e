//! Cadence parsing for recurring schedules.
//!
//! Accepts compact forms (`"90s"`, `"5m"`, `"1h"`, `"1d"`, `"500ms"`) and
//! spelled-out forms (`"30 seconds"`, `"5 minutes"`, `"1 hour"`).

use std::time::Duration;

use crate::error::CoreError;
use crate::types::Timestamp;

/// Shortest cadence a schedule may use.
pub const MIN_FREQUENCY: Duration = Duration::from_secs(30);

/// Longest cadence a schedule may use (one year).
pub const MAX_FREQUENCY: Duration = Duration::from_secs(365 * 24 * 3600);

/// Parse a cadence spec into a [`Duration`] and check it is within bounds.
pub fn parse_frequency(spec: &str) -> Result<Duration, CoreError> {
    let spec = spec.trim().to_ascii_lowercase();
    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(spec.len());
    let (digits, unit) = spec.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| CoreError::Validation(format!("Invalid frequency '{spec}'")))?;

    let unit_ms: u64 = match unit.trim() {
        "ms" | "millisecond" | "milliseconds" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        other => {
            return Err(CoreError::Validation(format!(
                "Unknown frequency unit '{other}' in '{spec}'"
            )))
        }
    };

    let frequency = amount
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| CoreError::Validation(format!("Frequency '{spec}' is too large")))?;

    validate_frequency(frequency)?;
    Ok(frequency)
}

/// Check a cadence against [`MIN_FREQUENCY`] and [`MAX_FREQUENCY`].
pub fn validate_frequency(frequency: Duration) -> Result<(), CoreError> {
    if frequency < MIN_FREQUENCY {
        return Err(CoreError::Validation(format!(
            "Frequency must be at least {} seconds",
            MIN_FREQUENCY.as_secs()
        )));
    }
    if frequency > MAX_FREQUENCY {
        return Err(CoreError::Validation(
            "Frequency must not exceed one year".to_string(),
        ));
    }
    Ok(())
}

/// Compute the next execution slot strictly after `now`.
///
/// Advances `previous` by whole multiples of `frequency`, so missed slots are
/// skipped instead of fired back-to-back.
pub fn next_execution_after(previous: Timestamp, frequency: Duration, now: Timestamp) -> Timestamp {
    let freq_ms = frequency.as_millis().max(1) as i64;
    let step = chrono::Duration::milliseconds(freq_ms);
    let next = previous + step;
    if next > now {
        return next;
    }
    let behind_ms = (now - next).num_milliseconds();
    let skipped = behind_ms / freq_ms + 1;
    next + chrono::Duration::milliseconds(skipped * freq_ms)
}
