//! Common validation utilities.

use validator::ValidationError;

/// Longest lease or extension accepted through the API (ten years).
pub const MAX_DURATION_DAYS: i64 = 3650;

/// Validates a day count used for lease durations and extensions.
pub fn validate_duration_days(days: i64) -> Result<(), ValidationError> {
    if days <= 0 {
        let mut err = ValidationError::new("duration_not_positive");
        err.message = Some("Duration must be a positive number of days".into());
        return Err(err);
    }
    if days > MAX_DURATION_DAYS {
        let mut err = ValidationError::new("duration_too_long");
        err.message = Some(format!("Duration cannot exceed {} days", MAX_DURATION_DAYS).into());
        return Err(err);
    }
    Ok(())
}

/// Validates a seat capacity: when present it must be at least 1.
pub fn validate_capacity(capacity: i32) -> Result<(), ValidationError> {
    if capacity >= 1 {
        Ok(())
    } else {
        let mut err = ValidationError::new("capacity_range");
        err.message = Some("Capacity must be at least 1".into());
        Err(err)
    }
}

/// Normalizes an email-like identifier: trimmed and lowercased.
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}
