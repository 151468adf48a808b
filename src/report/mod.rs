//! Meeting reports.
//!
//! Pure presentation over stored votings: every figure is derived from the
//! option counts through [`crate::tally`], nothing here touches the store.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Meeting, Voting};
use crate::tally::{self, Decision};

/// How a voting's final decision came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DecisionSource {
    Votes,
    TieBreak,
    Tied,
    NoVotes,
    Open,
}

impl DecisionSource {
    fn as_str(self) -> &'static str {
        match self {
            DecisionSource::Votes => "votes",
            DecisionSource::TieBreak => "tieBreak",
            DecisionSource::Tied => "tied",
            DecisionSource::NoVotes => "noVotes",
            DecisionSource::Open => "open",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionLine {
    pub label: String,
    pub votes: u32,
    /// Share of all votes, rounded to one decimal
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingReport {
    pub voting_id: String,
    pub title: String,
    pub open: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_votes: u32,
    pub options: Vec<OptionLine>,
    pub winners: Vec<String>,
    pub is_tie: bool,
    pub decision: DecisionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_option: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingReport {
    pub meeting_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_by: String,
    pub start_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub participant_count: usize,
    pub generated_at: DateTime<Utc>,
    pub votings: Vec<VotingReport>,
}

fn percentage(votes: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(votes) * 1000.0 / f64::from(total)).round() / 10.0
}

/// Summarize one voting as seen at `now`.
pub fn voting_report(voting: &Voting, now: DateTime<Utc>) -> VotingReport {
    let outcome = tally::compute(&voting.options);
    let decision = tally::decide(voting, &outcome, now);

    let (source, final_option, decided_by) = match &decision {
        Decision::Open => (DecisionSource::Open, None, None),
        Decision::NoVotes => (DecisionSource::NoVotes, None, None),
        Decision::Winner { option } => (DecisionSource::Votes, Some(option.clone()), None),
        Decision::Tied { .. } => (DecisionSource::Tied, None, None),
        Decision::TieBreak { option, decided_by } => (
            DecisionSource::TieBreak,
            Some(option.clone()),
            Some(decided_by.clone()),
        ),
    };

    VotingReport {
        voting_id: voting.id.clone(),
        title: voting.title.clone(),
        open: voting.is_open_at(now),
        start_time: voting.start_time,
        end_time: voting.end_time,
        total_votes: outcome.total_votes,
        options: voting
            .options
            .iter()
            .map(|o| OptionLine {
                label: o.label.clone(),
                votes: o.votes,
                percentage: percentage(o.votes, outcome.total_votes),
            })
            .collect(),
        winners: outcome.winners,
        is_tie: outcome.is_tie,
        decision: source,
        final_option,
        decided_by,
    }
}

/// Build the report of a meeting and its votings.
pub fn meeting_report(meeting: &Meeting, votings: &[Voting], now: DateTime<Utc>) -> MeetingReport {
    MeetingReport {
        meeting_id: meeting.id.clone(),
        name: meeting.name.clone(),
        description: meeting.description.clone(),
        created_by: meeting.created_by.clone(),
        start_at: meeting.start_at,
        end_at: meeting.end_at,
        archived: meeting.archived,
        participant_count: meeting.participants.len(),
        generated_at: now,
        votings: votings.iter().map(|v| voting_report(v, now)).collect(),
    }
}

const CSV_HEADER: &str =
    "voting_id,title,status,option,votes,percentage,total_votes,decision,final_option";

/// Render a report as CSV, one row per voting option.
pub fn to_csv(report: &MeetingReport) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push_str("\r\n");

    for voting in &report.votings {
        let status = if voting.open { "open" } else { "closed" };
        for option in &voting.options {
            let fields = [
                csv_field(&voting.voting_id),
                csv_field(&voting.title),
                status.to_string(),
                csv_field(&option.label),
                option.votes.to_string(),
                format!("{:.1}", option.percentage),
                voting.total_votes.to_string(),
                voting.decision.as_str().to_string(),
                csv_field(voting.final_option.as_deref().unwrap_or("")),
            ];
            out.push_str(&fields.join(","));
            out.push_str("\r\n");
        }
    }
    out
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
