//! Report endpoints.

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;

use super::{success, ApiResult};
use crate::errors::AppError;
use crate::report::{self, MeetingReport};
use crate::AppState;

async fn build_report(state: &AppState, meeting_id: &str) -> Result<MeetingReport, AppError> {
    let now = Utc::now();
    let meeting = state
        .repo
        .get_meeting(meeting_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Meeting {} not found", meeting_id)))?;
    let votings = state.repo.list_votings(meeting_id, now).await?;
    Ok(report::meeting_report(&meeting, &votings, now))
}

/// GET /api/meetings/:id/report
pub async fn meeting_report(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
) -> ApiResult<MeetingReport> {
    success(build_report(&state, &meeting_id).await?)
}

/// GET /api/meetings/:id/report/csv
pub async fn meeting_report_csv(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
) -> Result<Response, AppError> {
    let report = build_report(&state, &meeting_id).await?;
    let disposition = format!("attachment; filename=\"meeting-{}.csv\"", report.meeting_id);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        report::to_csv(&report),
    )
        .into_response())
}
