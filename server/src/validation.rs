//! Boundary validation for push-channel payloads.
//!
//! Everything here runs before the engine is called; invalid input never
//! reaches the matchmaking core. Validation produces owned, typed request
//! values rather than mutating the incoming payload.

use uuid::{Uuid, Variant};

use crate::models::TreatmentGroup;

pub const MIN_ROUND: u32 = 1;
pub const MAX_ROUND: u32 = 10;
pub const MIN_SKILL: f64 = 1.0;
pub const MAX_SKILL: f64 = 10.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("'{0}' is not a valid participant or match id")]
    InvalidId(String),

    #[error("round number {0} is out of range (1-10)")]
    RoundOutOfRange(i64),

    #[error("skill level {0} is out of range (1-10)")]
    SkillOutOfRange(f64),

    #[error("unrecognized treatment group '{0}'")]
    UnknownTreatmentGroup(String),
}

/// Accepts UUID v1-v5 with the RFC 4122 variant (hex digit `[89ab]` in the
/// variant position), matching what the experiment platform issues.
pub fn validate_id(value: &str) -> Result<Uuid, ValidationError> {
    let parsed =
        Uuid::parse_str(value).map_err(|_| ValidationError::InvalidId(value.to_string()))?;
    let version_ok = (1..=5).contains(&parsed.get_version_num());
    let variant_ok = parsed.get_variant() == Variant::RFC4122;
    if version_ok && variant_ok {
        Ok(parsed)
    } else {
        Err(ValidationError::InvalidId(value.to_string()))
    }
}

pub fn validate_round(value: i64) -> Result<u32, ValidationError> {
    if (MIN_ROUND as i64..=MAX_ROUND as i64).contains(&value) {
        Ok(value as u32)
    } else {
        Err(ValidationError::RoundOutOfRange(value))
    }
}

pub fn validate_skill(value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && (MIN_SKILL..=MAX_SKILL).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::SkillOutOfRange(value))
    }
}

pub fn validate_treatment_group(value: &str) -> Result<TreatmentGroup, ValidationError> {
    TreatmentGroup::parse(value)
        .ok_or_else(|| ValidationError::UnknownTreatmentGroup(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_v4_rfc4122_ids() {
        assert!(validate_id("00000000-0000-4000-8000-000000000001").is_ok());
        assert!(validate_id("6fa459ea-ee8a-3ca4-894e-db77e160355e").is_ok()); // v3
    }

    #[test]
    fn rejects_malformed_and_non_rfc_ids() {
        // Not a UUID at all.
        assert!(validate_id("participant-42").is_err());
        // Nil UUID: version 0.
        assert!(validate_id("00000000-0000-0000-0000-000000000000").is_err());
        // Variant nibble 'c' is the Microsoft variant, not RFC 4122.
        assert!(validate_id("00000000-0000-4000-c000-000000000001").is_err());
        // Version 7 is outside v1-v5.
        assert!(validate_id("00000000-0000-7000-8000-000000000001").is_err());
    }

    #[test]
    fn round_bounds_are_inclusive() {
        assert!(validate_round(0).is_err());
        assert_eq!(validate_round(1), Ok(1));
        assert_eq!(validate_round(10), Ok(10));
        assert!(validate_round(11).is_err());
        assert!(validate_round(-3).is_err());
    }

    #[test]
    fn skill_bounds_are_inclusive() {
        assert!(validate_skill(0.99).is_err());
        assert_eq!(validate_skill(1.0), Ok(1.0));
        assert_eq!(validate_skill(10.0), Ok(10.0));
        assert!(validate_skill(10.01).is_err());
        assert!(validate_skill(f64::NAN).is_err());
    }

    #[test]
    fn unknown_treatment_groups_are_rejected() {
        assert!(validate_treatment_group("control").is_ok());
        assert!(validate_treatment_group("Group 3: Goal Setting + AI Assistant").is_ok());
        assert!(validate_treatment_group("placebo").is_err());
    }
}
