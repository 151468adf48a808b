//! Winner and tie computation.
//!
//! Everything here is a pure function of a voting's option counts, so the
//! outcome is re-derived on demand and never stored next to the raw counts.

use serde::Serialize;

use crate::models::{VoteOption, Voting};

/// Result of counting a voting's options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub total_votes: u32,
    pub max_votes: u32,
    /// Labels holding `max_votes`, in option-definition order. Empty when nobody voted.
    pub winners: Vec<String>,
    pub is_tie: bool,
    pub no_votes: bool,
}

impl Outcome {
    /// The single winning label, if there is exactly one.
    pub fn sole_winner(&self) -> Option<&str> {
        match self.winners.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }
}

/// Count the options of a voting.
pub fn compute(options: &[VoteOption]) -> Outcome {
    let total_votes = options.iter().map(|o| o.votes).sum();
    let max_votes = options.iter().map(|o| o.votes).max().unwrap_or(0);

    if max_votes == 0 {
        return Outcome {
            total_votes,
            max_votes,
            winners: Vec::new(),
            is_tie: false,
            no_votes: true,
        };
    }

    let winners: Vec<String> = options
        .iter()
        .filter(|o| o.votes == max_votes)
        .map(|o| o.label.clone())
        .collect();

    Outcome {
        total_votes,
        max_votes,
        is_tie: winners.len() > 1,
        winners,
        no_votes: false,
    }
}

/// How a voting's result is ultimately read, with the tie-break taking precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Decision {
    /// Voting still accepts votes
    Open,
    /// Closed without any vote
    NoVotes,
    /// Closed with a single most-voted option
    #[serde(rename_all = "camelCase")]
    Winner { option: String },
    /// Closed with a tie the organizer has not broken yet
    #[serde(rename_all = "camelCase")]
    Tied { options: Vec<String> },
    /// Closed with a tie broken by the organizer
    #[serde(rename_all = "camelCase")]
    TieBreak { option: String, decided_by: String },
}

impl Decision {
    /// The option the voting resolved to, if any.
    #[cfg(test)]
    pub fn option(&self) -> Option<&str> {
        match self {
            Decision::Winner { option } | Decision::TieBreak { option, .. } => Some(option),
            _ => None,
        }
    }
}

/// Resolve the final decision of a voting as seen at `now`.
pub fn decide(voting: &Voting, outcome: &Outcome, now: chrono::DateTime<chrono::Utc>) -> Decision {
    if voting.is_open_at(now) {
        return Decision::Open;
    }
    if voting.has_minerva_vote {
        if let Some(option) = &voting.minerva_option {
            return Decision::TieBreak {
                option: option.clone(),
                decided_by: voting.minerva_voted_by.clone().unwrap_or_default(),
            };
        }
    }
    if outcome.no_votes {
        return Decision::NoVotes;
    }
    match outcome.sole_winner() {
        Some(winner) => Decision::Winner {
            option: winner.to_string(),
        },
        None => Decision::Tied {
            options: outcome.winners.clone(),
        },
    }
}
