//! Meeting and participant models.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A scheduled, PIN-protected session under which votings take place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_by: String,
    pub access_pin: String,
    pub start_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    /// Participants may join without email or provider identity
    pub anonymous_voting: bool,
    pub active: bool,
    pub archived: bool,
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every committed change; doubles as the optimistic concurrency token
    #[serde(default)]
    pub version: i64,
}

impl Meeting {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.created_by == user_id
    }

    /// Live meetings accept participants and new votings.
    pub fn is_live(&self) -> bool {
        self.active && !self.archived
    }

    /// Past its scheduled end; no more joins or votings.
    pub fn has_ended_at(&self, now: DateTime<Utc>) -> bool {
        self.end_at.is_some_and(|end| now >= end)
    }
}

/// A participant that joined a meeting with its PIN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_id: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// Which slice of meetings a listing returns.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    #[default]
    Current,
    Archived,
    All,
}

/// Query parameters for listing meetings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingListQuery {
    #[serde(default)]
    pub status: MeetingStatus,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Request body for creating a new meeting.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMeetingRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub access_pin: String,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub anonymous_voting: bool,
}

/// Request body for updating an existing meeting.
///
/// Clearable fields distinguish absent (keep) from `null` (clear).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMeetingRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub access_pin: Option<String>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "nullable")]
    pub end_at: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub anonymous_voting: Option<bool>,
    #[serde(default)]
    pub active: Option<bool>,
    /// Expected version for optimistic concurrency control
    #[serde(default)]
    pub expected_version: Option<i64>,
}

fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Request body for joining a meeting with its PIN.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMeetingRequest {
    pub access_pin: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub google_id: Option<String>,
}

/// Minimum and maximum PIN length.
pub const PIN_MIN_LEN: usize = 4;
pub const PIN_MAX_LEN: usize = 32;

/// Check a PIN before it reaches the store.
pub fn validate_pin(pin: &str) -> Result<(), String> {
    let len = pin.chars().count();
    if !(PIN_MIN_LEN..=PIN_MAX_LEN).contains(&len) {
        return Err(format!(
            "Access PIN must be between {} and {} characters",
            PIN_MIN_LEN, PIN_MAX_LEN
        ));
    }
    if pin.chars().any(char::is_whitespace) {
        return Err("Access PIN must not contain whitespace".to_string());
    }
    Ok(())
}

/// Years representable in stored timestamps.
const MIN_YEAR: i32 = 0;
const MAX_YEAR: i32 = 9999;

/// Check that a schedule window is well-formed and storable.
pub fn validate_schedule(start_at: DateTime<Utc>, end_at: Option<DateTime<Utc>>) -> Result<(), String> {
    for (field, ts) in [("startAt", Some(start_at)), ("endAt", end_at)] {
        if let Some(ts) = ts {
            if !(MIN_YEAR..=MAX_YEAR).contains(&ts.year()) {
                return Err(format!(
                    "{} must fall within years {} to {}",
                    field, MIN_YEAR, MAX_YEAR
                ));
            }
        }
    }
    match end_at {
        Some(end) if end <= start_at => Err("endAt must be after startAt".to_string()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_validate_pin() {
        assert!(validate_pin("1234").is_ok());
        assert!(validate_pin("abc").is_err());
        assert!(validate_pin("12 34").is_err());
        assert!(validate_pin(&"9".repeat(33)).is_err());
    }

    #[test]
    fn test_validate_schedule() {
        let start = Utc::now();
        assert!(validate_schedule(start, None).is_ok());
        assert!(validate_schedule(start, Some(start + Duration::hours(1))).is_ok());
        assert!(validate_schedule(start, Some(start)).is_err());
    }

    #[test]
    fn test_validate_schedule_rejects_unstorable_years() {
        let start = Utc::now();
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        assert!(validate_schedule(start, Some(far)).is_err());
        assert!(validate_schedule(far, None).is_err());
        let last = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        assert!(validate_schedule(start, Some(last)).is_ok());
    }

    #[test]
    fn test_update_request_distinguishes_null_from_absent() {
        let absent: UpdateMeetingRequest = serde_json::from_str("{}").unwrap();
        assert!(absent.description.is_none());
        assert!(absent.end_at.is_none());

        let cleared: UpdateMeetingRequest =
            serde_json::from_str(r#"{"description": null, "endAt": null}"#).unwrap();
        assert_eq!(cleared.description, Some(None));
        assert_eq!(cleared.end_at, Some(None));

        let set: UpdateMeetingRequest =
            serde_json::from_str(r#"{"description": "Agenda"}"#).unwrap();
        assert_eq!(set.description, Some(Some("Agenda".to_string())));
    }

    #[test]
    fn test_status_defaults_to_current() {
        let query: MeetingListQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.status, MeetingStatus::Current);
        assert!(query.created_by.is_none());
    }
}
