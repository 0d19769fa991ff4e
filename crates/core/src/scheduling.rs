//! Task and schedule state machines, input limits and retry timing.
//!
//! This module lives in `core` (zero internal deps) so it can be used by both
//! the repository layer and the scheduler / API crates.

use std::time::Duration;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Limits and defaults
// ---------------------------------------------------------------------------

/// Largest accepted serialized task payload.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Maximum length of a task or schedule name.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a group key.
pub const MAX_GROUP_KEY_LEN: usize = 255;

/// Upper bound on `retry_max` accepted from callers.
pub const MAX_RETRY_MAX: i32 = 100;

/// Default number of retries when a caller does not specify one.
pub const DEFAULT_RETRY_MAX: i32 = 3;

/// Base delay of the successor backoff (`base * 2^retry_count`).
pub const DEFAULT_RETRY_BACKOFF_BASE_SECS: u64 = 5;

/// Cap on the successor backoff delay.
pub const DEFAULT_RETRY_BACKOFF_MAX_SECS: u64 = 3600;

/// `group_max_concurrency` value meaning "no cap".
pub const UNLIMITED_CONCURRENCY: i32 = 0;

// ---------------------------------------------------------------------------
// State machines
// ---------------------------------------------------------------------------

/// Task status IDs matching `task_statuses` seed data (1-based SMALLSERIAL).
///
/// The transition tables are duplicated from the `db` crate's status enums
/// because `core` must have zero internal deps.
pub mod task_state_machine {
    pub const CREATED: i16 = 1;
    pub const STARTED: i16 = 2;
    pub const SUCCEEDED: i16 = 3;
    pub const FAILED: i16 = 4;
    pub const EXPIRED: i16 = 5;
    pub const CANCELLED: i16 = 6;

    /// Returns the set of valid target status IDs reachable from `from_status`.
    ///
    /// Terminal states return an empty slice: no terminal state re-enters
    /// CREATED or STARTED.
    pub fn valid_transitions(from_status: i16) -> &'static [i16] {
        match from_status {
            // Created -> Started, Cancelled, Expired
            CREATED => &[STARTED, CANCELLED, EXPIRED],
            // Started -> Succeeded, Failed, Cancelled, Expired
            STARTED => &[SUCCEEDED, FAILED, CANCELLED, EXPIRED],
            SUCCEEDED | FAILED | EXPIRED | CANCELLED => &[],
            _ => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: i16, to: i16) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Whether `status` is one of the terminal states.
    pub fn is_terminal(status: i16) -> bool {
        matches!(status, SUCCEEDED | FAILED | EXPIRED | CANCELLED)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(from: i16, to: i16) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid task state transition from {from} to {to}"))
        }
    }
}

/// Schedule status IDs matching `schedule_statuses` seed data.
pub mod schedule_state_machine {
    pub const STARTED: i16 = 1;
    pub const PAUSED: i16 = 2;
    pub const DELETED: i16 = 3;

    pub fn valid_transitions(from_status: i16) -> &'static [i16] {
        match from_status {
            STARTED => &[PAUSED, DELETED],
            PAUSED => &[STARTED, DELETED],
            _ => &[],
        }
    }

    pub fn can_transition(from: i16, to: i16) -> bool {
        valid_transitions(from).contains(&to)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the caller-supplied fields of a new task.
///
/// Rules:
/// - `name` and `group_key` are non-empty and within their length limits.
/// - `group_max_concurrency` is not negative (0 means unlimited).
/// - `retry_max` is within `0..=MAX_RETRY_MAX`.
/// - The serialized `payload` does not exceed `MAX_PAYLOAD_BYTES`.
pub fn validate_task_input(
    name: &str,
    group_key: &str,
    group_max_concurrency: i32,
    retry_max: i32,
    payload: &serde_json::Value,
) -> Result<(), CoreError> {
    validate_name("name", name, MAX_NAME_LEN)?;
    validate_name("group_key", group_key, MAX_GROUP_KEY_LEN)?;

    validate_group_max_concurrency(group_max_concurrency)?;
    validate_retry_max(retry_max)?;
    validate_payload(payload)
}

pub fn validate_group_max_concurrency(value: i32) -> Result<(), CoreError> {
    if value < 0 {
        return Err(CoreError::Validation(format!(
            "group_max_concurrency must not be negative, got {value}"
        )));
    }
    Ok(())
}

pub fn validate_retry_max(value: i32) -> Result<(), CoreError> {
    if !(0..=MAX_RETRY_MAX).contains(&value) {
        return Err(CoreError::Validation(format!(
            "retry_max must be between 0 and {MAX_RETRY_MAX}, got {value}"
        )));
    }
    Ok(())
}

/// Reject payloads whose JSON encoding exceeds [`MAX_PAYLOAD_BYTES`].
pub fn validate_payload(payload: &serde_json::Value) -> Result<(), CoreError> {
    let size = serde_json::to_vec(payload)
        .map_err(|e| CoreError::Validation(format!("payload is not serializable: {e}")))?
        .len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(CoreError::Validation(format!(
            "payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}"
        )));
    }
    Ok(())
}

/// Validate an optional per-task timeout. `None` means no limit.
pub fn validate_timeout_secs(field: &str, value: Option<i32>) -> Result<(), CoreError> {
    match value {
        Some(secs) if secs <= 0 => Err(CoreError::Validation(format!(
            "{field} must be positive, got {secs}"
        ))),
        _ => Ok(()),
    }
}

fn validate_name(field: &str, value: &str, max_len: usize) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > max_len {
        return Err(CoreError::Validation(format!(
            "{field} must not exceed {max_len} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Retry timing
// ---------------------------------------------------------------------------

/// Delay before a retry successor becomes runnable.
///
/// `retry_count` is the count of the task that just failed, so the first
/// successor waits `base`, the second `2 * base`, and so on, capped at `max`.
pub fn retry_backoff(retry_count: i32, base: Duration, max: Duration) -> Duration {
    let exponent = retry_count.clamp(0, 30) as u32;
    base.checked_mul(2u32.saturating_pow(exponent))
        .unwrap_or(max)
        .min(max)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
