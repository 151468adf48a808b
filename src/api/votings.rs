//! Voting API endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Serialize;

use super::{created, success, ApiResult};
use crate::auth::ActingUser;
use crate::models::{CastVoteRequest, CreateVotingRequest, MyVote, TieBreakRequest, Voting};
use crate::tally::{self, Decision, Outcome};
use crate::AppState;

/// Body of the result endpoint: the tally plus how it resolves.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingResult {
    #[serde(flatten)]
    pub outcome: Outcome,
    pub decision: Decision,
}

/// GET /api/meetings/:id/votings - List votings of a meeting.
pub async fn list_votings(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
) -> ApiResult<Vec<Voting>> {
    success(state.repo.list_votings(&meeting_id, Utc::now()).await?)
}

/// GET /api/meetings/:id/votings/:voting_id
pub async fn get_voting(
    State(state): State<AppState>,
    Path((meeting_id, voting_id)): Path<(String, String)>,
) -> ApiResult<Voting> {
    success(
        state
            .repo
            .get_voting(&meeting_id, &voting_id, Utc::now())
            .await?,
    )
}

/// POST /api/meetings/:id/votings - Open a new voting.
pub async fn create_voting(
    State(state): State<AppState>,
    user: ActingUser,
    Path(meeting_id): Path<String>,
    Json(request): Json<CreateVotingRequest>,
) -> ApiResult<Voting> {
    created(
        state
            .repo
            .create_voting(&meeting_id, user.id(), &request, Utc::now())
            .await?,
    )
}

/// DELETE /api/meetings/:id/votings/:voting_id
pub async fn delete_voting(
    State(state): State<AppState>,
    user: ActingUser,
    Path((meeting_id, voting_id)): Path<(String, String)>,
) -> ApiResult<()> {
    state
        .repo
        .delete_voting(&meeting_id, &voting_id, user.id())
        .await?;
    success(())
}

/// POST /api/meetings/:id/votings/:voting_id/votes - Cast the acting user's vote.
pub async fn cast_vote(
    State(state): State<AppState>,
    user: ActingUser,
    Path((meeting_id, voting_id)): Path<(String, String)>,
    Json(request): Json<CastVoteRequest>,
) -> ApiResult<Voting> {
    success(
        state
            .repo
            .apply_vote(
                &meeting_id,
                &voting_id,
                user.id(),
                &request.option,
                Utc::now(),
            )
            .await?,
    )
}

/// GET /api/meetings/:id/votings/:voting_id/votes/me
pub async fn my_vote(
    State(state): State<AppState>,
    user: ActingUser,
    Path((meeting_id, voting_id)): Path<(String, String)>,
) -> ApiResult<MyVote> {
    success(
        state
            .repo
            .my_vote(&meeting_id, &voting_id, user.id())
            .await?,
    )
}

/// POST /api/meetings/:id/votings/:voting_id/close
pub async fn close_voting(
    State(state): State<AppState>,
    user: ActingUser,
    Path((meeting_id, voting_id)): Path<(String, String)>,
) -> ApiResult<Voting> {
    success(
        state
            .repo
            .close_voting(&meeting_id, &voting_id, user.id())
            .await?,
    )
}

/// GET /api/meetings/:id/votings/:voting_id/result
pub async fn voting_result(
    State(state): State<AppState>,
    Path((meeting_id, voting_id)): Path<(String, String)>,
) -> ApiResult<VotingResult> {
    let now = Utc::now();
    let voting = state.repo.get_voting(&meeting_id, &voting_id, now).await?;
    let outcome = tally::compute(&voting.options);
    let decision = tally::decide(&voting, &outcome, now);
    success(VotingResult { outcome, decision })
}

/// POST /api/meetings/:id/votings/:voting_id/tie-break
pub async fn tie_break(
    State(state): State<AppState>,
    user: ActingUser,
    Path((meeting_id, voting_id)): Path<(String, String)>,
    Json(request): Json<TieBreakRequest>,
) -> ApiResult<Voting> {
    success(
        state
            .repo
            .tie_break(
                &meeting_id,
                &voting_id,
                user.id(),
                &request.option,
                Utc::now(),
            )
            .await?,
    )
}
