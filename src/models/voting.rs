//! Voting model: a single poll with a fixed option set and a per-participant ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Option labels offered when a voting is created without explicit options.
pub const DEFAULT_OPTIONS: [&str; 2] = ["Concordo", "Discordo"];

/// Bounds on a voting's duration, in minutes.
pub const MIN_DURATION_MINUTES: i64 = 1;
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

/// One option of a voting with its derived vote count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoteOption {
    pub label: String,
    pub votes: u32,
}

impl VoteOption {
    pub fn new(label: impl Into<String>, votes: u32) -> Self {
        Self {
            label: label.into(),
            votes,
        }
    }
}

/// A poll nested under a meeting.
///
/// `options` keeps definition order. `votes` is the ledger (participant id to
/// chosen label) and the sum of option counts always equals its length.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Voting {
    pub id: String,
    pub meeting_id: String,
    pub title: String,
    pub options: Vec<VoteOption>,
    pub votes: BTreeMap<String, String>,
    pub duration_minutes: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub active: bool,
    pub has_minerva_vote: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minerva_option: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minerva_voted_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minerva_voted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Bumped on every committed change to this voting
    pub revision: i64,
}

impl Voting {
    /// Open means the stored flag is set and the end time has not been reached.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.active && now < self.end_time
    }

    /// Stored as active but already past its end time.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.active && now >= self.end_time
    }

    pub fn has_option(&self, label: &str) -> bool {
        self.options.iter().any(|o| o.label == label)
    }

    pub fn total_votes(&self) -> u32 {
        self.options.iter().map(|o| o.votes).sum()
    }

    /// Counts agree with the ledger, both in total and per option.
    #[cfg(test)]
    pub fn ledger_consistent(&self) -> bool {
        if self.total_votes() as usize != self.votes.len() {
            return false;
        }
        self.options.iter().all(|option| {
            let in_ledger = self.votes.values().filter(|l| **l == option.label).count();
            in_ledger == option.votes as usize
        })
    }
}

/// Request body for creating a voting.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVotingRequest {
    pub title: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    pub duration_minutes: i64,
}

/// Request body for casting a vote.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastVoteRequest {
    pub option: String,
}

/// Request body for the organizer's tie-breaking vote.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TieBreakRequest {
    pub option: String,
}

/// Whether the acting participant already voted, and for what.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MyVote {
    pub has_voted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
}

/// Normalize and validate the option labels of a new voting.
pub fn normalize_options(raw: Option<&[String]>) -> Result<Vec<String>, String> {
    let labels: Vec<String> = match raw {
        Some(list) if !list.is_empty() => list.iter().map(|l| l.trim().to_string()).collect(),
        _ => DEFAULT_OPTIONS.iter().map(|l| l.to_string()).collect(),
    };

    if labels.len() < 2 {
        return Err("A voting needs at least two options".to_string());
    }
    if labels.iter().any(|l| l.is_empty()) {
        return Err("Option labels must not be empty".to_string());
    }
    for (i, label) in labels.iter().enumerate() {
        if labels[..i].contains(label) {
            return Err(format!("Duplicate option label: {}", label));
        }
    }
    Ok(labels)
}

pub fn validate_duration(minutes: i64) -> Result<(), String> {
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&minutes) {
        return Err(format!(
            "durationMinutes must be between {} and {}",
            MIN_DURATION_MINUTES, MAX_DURATION_MINUTES
        ));
    }
    Ok(())
}
