//! Server-sent change stream for a meeting.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use crate::errors::AppError;
use crate::events::{Change, Subscription};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    /// Restrict the stream to a single voting
    #[serde(default)]
    pub voting_id: Option<String>,
}

struct Live {
    sub: Subscription,
    voting_id: Option<String>,
    done: bool,
}

impl Live {
    fn wants(&self, change: &Change) -> bool {
        match (&self.voting_id, change) {
            (None, _) => true,
            (Some(_), Change::MeetingDeleted { .. }) => true,
            (Some(id), change) => change.voting_id() == Some(id.as_str()),
        }
    }
}

fn to_event(change: &Change) -> Option<Event> {
    match Event::default().event(change.kind()).json_data(change) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("Failed to encode {} change: {}", change.kind(), e);
            None
        }
    }
}

/// GET /api/meetings/:id/events - Snapshot of the meeting, then live changes.
pub async fn meeting_events(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Subscribe before reading so nothing committed in between is missed
    let mut sub = state.repo.subscribe(&meeting_id);
    let now = Utc::now();

    let mut initial = Vec::new();
    match &query.voting_id {
        Some(voting_id) => {
            let voting = state.repo.get_voting(&meeting_id, voting_id, now).await?;
            initial.push(Change::Voting(voting));
        }
        None => {
            let meeting = state
                .repo
                .get_meeting(&meeting_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Meeting {} not found", meeting_id)))?;
            initial.push(Change::Meeting(meeting));
            for voting in state.repo.list_votings(&meeting_id, now).await? {
                initial.push(Change::Voting(voting));
            }
        }
    }

    for change in &initial {
        sub.observe(change);
    }
    tracing::debug!(
        "Event stream opened for meeting {} with {} snapshots",
        meeting_id,
        initial.len()
    );

    let snapshots = stream::iter(
        initial
            .iter()
            .filter_map(to_event)
            .map(Ok::<Event, Infallible>)
            .collect::<Vec<_>>(),
    );

    let live = stream::unfold(
        Live {
            sub,
            voting_id: query.voting_id,
            done: false,
        },
        |mut live| async move {
            while !live.done {
                let change = live.sub.recv().await?;
                if !live.wants(&change) {
                    continue;
                }
                if matches!(change, Change::MeetingDeleted { .. }) {
                    live.done = true;
                }
                if let Some(event) = to_event(&change) {
                    return Some((Ok::<Event, Infallible>(event), live));
                }
            }
            None
        },
    );

    Ok(Sse::new(snapshots.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
