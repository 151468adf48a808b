//! Meeting API endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;

use super::{created, success, ApiResult};
use crate::auth::ActingUser;
use crate::errors::AppError;
use crate::models::{
    CreateMeetingRequest, JoinMeetingRequest, Meeting, MeetingListQuery, Participant,
    UpdateMeetingRequest,
};
use crate::AppState;

/// GET /api/meetings - List meetings.
pub async fn list_meetings(
    State(state): State<AppState>,
    Query(query): Query<MeetingListQuery>,
) -> ApiResult<Vec<Meeting>> {
    success(state.repo.list_meetings(&query).await?)
}

/// GET /api/meetings/:id - Get a single meeting.
pub async fn get_meeting(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Meeting> {
    match state.repo.get_meeting(&id).await? {
        Some(meeting) => success(meeting),
        None => Err(AppError::NotFound(format!("Meeting {} not found", id))),
    }
}

/// POST /api/meetings - Create a meeting owned by the acting user.
pub async fn create_meeting(
    State(state): State<AppState>,
    user: ActingUser,
    Json(request): Json<CreateMeetingRequest>,
) -> ApiResult<Meeting> {
    created(
        state
            .repo
            .create_meeting(user.id(), &request, Utc::now())
            .await?,
    )
}

/// PUT /api/meetings/:id - Update a meeting.
pub async fn update_meeting(
    State(state): State<AppState>,
    user: ActingUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateMeetingRequest>,
) -> ApiResult<Meeting> {
    success(
        state
            .repo
            .update_meeting(&id, user.id(), &request, Utc::now())
            .await?,
    )
}

/// DELETE /api/meetings/:id - Delete a meeting with all its votings.
pub async fn delete_meeting(
    State(state): State<AppState>,
    user: ActingUser,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state.repo.delete_meeting(&id, user.id()).await?;
    success(())
}

/// POST /api/meetings/:id/archive
pub async fn archive_meeting(
    State(state): State<AppState>,
    user: ActingUser,
    Path(id): Path<String>,
) -> ApiResult<Meeting> {
    success(
        state
            .repo
            .set_archived(&id, user.id(), true, Utc::now())
            .await?,
    )
}

/// POST /api/meetings/:id/restore
pub async fn restore_meeting(
    State(state): State<AppState>,
    user: ActingUser,
    Path(id): Path<String>,
) -> ApiResult<Meeting> {
    success(
        state
            .repo
            .set_archived(&id, user.id(), false, Utc::now())
            .await?,
    )
}

/// POST /api/meetings/join - Join the live meeting holding a PIN.
pub async fn join_meeting(
    State(state): State<AppState>,
    user: ActingUser,
    Json(request): Json<JoinMeetingRequest>,
) -> ApiResult<Meeting> {
    success(
        state
            .repo
            .join_meeting(user.id(), &request, Utc::now())
            .await?,
    )
}

/// GET /api/meetings/:id/participants
pub async fn list_participants(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Participant>> {
    success(state.repo.list_participants(&id).await?)
}
