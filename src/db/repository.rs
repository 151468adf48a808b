//! Database repository for meetings, votings and the vote ledger.
//!
//! Every committed mutation is published to the change feed after commit, so
//! callers never have to remember to notify listeners.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{fmt_ts, parse_ts};
use crate::errors::{is_unique_violation, AppError};
use crate::events::{Change, ChangeFeed, Subscription};
use crate::models::{
    normalize_options, validate_duration, validate_pin, validate_schedule, CreateMeetingRequest,
    CreateVotingRequest, JoinMeetingRequest, Meeting, MeetingListQuery, MeetingStatus, MyVote,
    Participant, UpdateMeetingRequest, VoteOption, Voting,
};
use crate::tally;

const MEETING_COLUMNS: &str = "id, name, description, created_by, access_pin, start_at, end_at, \
     anonymous_voting, active, archived, created_at, updated_at, version";

const VOTING_COLUMNS: &str = "id, meeting_id, title, duration_minutes, start_time, end_time, \
     active, has_minerva_vote, minerva_option, minerva_voted_by, minerva_voted_at, created_at, revision";

/// Name given to participants of anonymous meetings that do not pick one.
const ANONYMOUS_NAME: &str = "Anonymous";

/// Database repository for all data operations.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
    feed: Arc<dyn ChangeFeed>,
}

impl Repository {
    pub fn new(pool: SqlitePool, feed: Arc<dyn ChangeFeed>) -> Self {
        Self { pool, feed }
    }

    /// Listen to a meeting and all of its votings.
    pub fn subscribe(&self, meeting_id: &str) -> Subscription {
        self.feed.subscribe(meeting_id)
    }

    // ==================== MEETING OPERATIONS ====================

    /// List meetings, newest schedule first.
    pub async fn list_meetings(&self, query: &MeetingListQuery) -> Result<Vec<Meeting>, AppError> {
        let mut sql = format!("SELECT {} FROM meetings WHERE 1 = 1", MEETING_COLUMNS);
        match query.status {
            MeetingStatus::Current => sql.push_str(" AND archived = 0"),
            MeetingStatus::Archived => sql.push_str(" AND archived = 1"),
            MeetingStatus::All => {}
        }
        if query.created_by.is_some() {
            sql.push_str(" AND created_by = ?");
        }
        sql.push_str(" ORDER BY start_at DESC, created_at DESC");

        let mut q = sqlx::query(&sql);
        if let Some(created_by) = &query.created_by {
            q = q.bind(created_by);
        }

        let mut conn = self.pool.acquire().await?;
        let rows = q.fetch_all(&mut *conn).await?;

        let mut meetings = Vec::with_capacity(rows.len());
        for row in &rows {
            meetings.push(hydrate_meeting(&mut conn, row).await?);
        }
        Ok(meetings)
    }

    /// Get a meeting by ID.
    pub async fn get_meeting(&self, id: &str) -> Result<Option<Meeting>, AppError> {
        let mut conn = self.pool.acquire().await?;
        load_meeting(&mut conn, id).await
    }

    async fn require_meeting(&self, id: &str) -> Result<Meeting, AppError> {
        self.get_meeting(id)
            .await?
            .ok_or_else(|| meeting_not_found(id))
    }

    async fn require_owned_meeting(&self, id: &str, actor: &str) -> Result<Meeting, AppError> {
        let meeting = self.require_meeting(id).await?;
        if !meeting.is_owned_by(actor) {
            return Err(AppError::Forbidden(format!(
                "Only the organizer of meeting {} may do this",
                id
            )));
        }
        Ok(meeting)
    }

    /// Create a new meeting owned by `created_by`.
    pub async fn create_meeting(
        &self,
        created_by: &str,
        request: &CreateMeetingRequest,
        now: DateTime<Utc>,
    ) -> Result<Meeting, AppError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Meeting name is required".to_string()));
        }
        validate_pin(&request.access_pin).map_err(AppError::Validation)?;
        let start_at = request.start_at.unwrap_or(now);
        validate_schedule(start_at, request.end_at).map_err(AppError::Validation)?;

        let id = uuid::Uuid::new_v4().to_string();
        let now_s = fmt_ts(now);

        let inserted = sqlx::query(
            "INSERT INTO meetings (id, name, description, created_by, access_pin, start_at, end_at, anonymous_voting, active, archived, created_at, updated_at, version) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, 0, ?, ?, 1)"
        )
        .bind(&id)
        .bind(name)
        .bind(&request.description)
        .bind(created_by)
        .bind(&request.access_pin)
        .bind(fmt_ts(start_at))
        .bind(request.end_at.map(fmt_ts))
        .bind(request.anonymous_voting as i32)
        .bind(&now_s)
        .bind(&now_s)
        .execute(&self.pool)
        .await;

        match inserted {
            Err(e) if is_unique_violation(&e) => return Err(pin_in_use()),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        tracing::info!("Meeting {} created by {}", id, created_by);
        let meeting = self.require_meeting(&id).await?;
        self.feed.publish(Change::Meeting(meeting.clone()));
        Ok(meeting)
    }

    /// Update a meeting with optimistic concurrency control. Organizer only.
    pub async fn update_meeting(
        &self,
        id: &str,
        actor: &str,
        request: &UpdateMeetingRequest,
        now: DateTime<Utc>,
    ) -> Result<Meeting, AppError> {
        let existing = self.require_owned_meeting(id, actor).await?;

        // Check version for optimistic concurrency
        if let Some(expected) = request.expected_version {
            if existing.version != expected {
                return Err(AppError::Conflict {
                    message: format!(
                        "Version mismatch: expected {}, current {}",
                        expected, existing.version
                    ),
                    current_version: existing.version,
                });
            }
        }

        let name = match &request.name {
            Some(name) if name.trim().is_empty() => {
                return Err(AppError::Validation("Meeting name is required".to_string()))
            }
            Some(name) => name.trim().to_string(),
            None => existing.name.clone(),
        };
        if let Some(pin) = &request.access_pin {
            validate_pin(pin).map_err(AppError::Validation)?;
        }
        let access_pin = request
            .access_pin
            .clone()
            .unwrap_or(existing.access_pin.clone());
        let description = match &request.description {
            Some(description) => description.clone(),
            None => existing.description.clone(),
        };
        let start_at = request.start_at.unwrap_or(existing.start_at);
        let end_at = request.end_at.unwrap_or(existing.end_at);
        validate_schedule(start_at, end_at).map_err(AppError::Validation)?;
        let anonymous_voting = request.anonymous_voting.unwrap_or(existing.anonymous_voting);
        let active = request.active.unwrap_or(existing.active);
        if active && existing.archived {
            return Err(AppError::Validation(
                "Archived meetings must be restored before they can be reactivated".to_string(),
            ));
        }

        let new_version = existing.version + 1;

        // Use conditional UPDATE with version check to prevent race conditions
        let result = sqlx::query(
            "UPDATE meetings SET name = ?, description = ?, access_pin = ?, start_at = ?, end_at = ?, anonymous_voting = ?, active = ?, updated_at = ?, version = ? WHERE id = ? AND version = ?"
        )
        .bind(&name)
        .bind(&description)
        .bind(&access_pin)
        .bind(fmt_ts(start_at))
        .bind(end_at.map(fmt_ts))
        .bind(anonymous_voting as i32)
        .bind(active as i32)
        .bind(fmt_ts(now))
        .bind(new_version)
        .bind(id)
        .bind(existing.version)
        .execute(&self.pool)
        .await;

        let result = match result {
            Err(e) if is_unique_violation(&e) => return Err(pin_in_use()),
            other => other?,
        };

        if result.rows_affected() == 0 {
            // Race condition - version changed between read and write
            let current = self.get_meeting(id).await?;
            return Err(AppError::Conflict {
                message: "Concurrent modification detected".to_string(),
                current_version: current.map(|m| m.version).unwrap_or(0),
            });
        }

        let meeting = self.require_meeting(id).await?;
        self.feed.publish(Change::Meeting(meeting.clone()));
        Ok(meeting)
    }

    /// Archive (or restore) a meeting. Archived meetings are never live.
    pub async fn set_archived(
        &self,
        id: &str,
        actor: &str,
        archived: bool,
        now: DateTime<Utc>,
    ) -> Result<Meeting, AppError> {
        let existing = self.require_owned_meeting(id, actor).await?;
        if existing.archived == archived {
            return Ok(existing);
        }

        let result = sqlx::query(
            "UPDATE meetings SET archived = ?, active = ?, updated_at = ?, version = version + 1 WHERE id = ?",
        )
        .bind(archived as i32)
        .bind(!archived as i32)
        .bind(fmt_ts(now))
        .bind(id)
        .execute(&self.pool)
        .await;

        match result {
            Err(e) if is_unique_violation(&e) => return Err(pin_in_use()),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        tracing::info!(
            "Meeting {} {}",
            id,
            if archived { "archived" } else { "restored" }
        );
        let meeting = self.require_meeting(id).await?;
        self.feed.publish(Change::Meeting(meeting.clone()));
        Ok(meeting)
    }

    /// Delete a meeting and everything under it. Organizer only.
    pub async fn delete_meeting(&self, id: &str, actor: &str) -> Result<(), AppError> {
        self.require_owned_meeting(id, actor).await?;

        let result = sqlx::query("DELETE FROM meetings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(meeting_not_found(id));
        }

        tracing::info!("Meeting {} deleted", id);
        self.feed.publish(Change::MeetingDeleted {
            meeting_id: id.to_string(),
        });
        Ok(())
    }

    /// Join the live meeting holding `access_pin` as `participant_id`.
    pub async fn join_meeting(
        &self,
        participant_id: &str,
        request: &JoinMeetingRequest,
        now: DateTime<Utc>,
    ) -> Result<Meeting, AppError> {
        let sql = format!(
            "SELECT {} FROM meetings WHERE access_pin = ? AND active = 1 AND archived = 0",
            MEETING_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&request.access_pin)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("No active meeting with this PIN".to_string()))?;
        let meeting = meeting_from_row(&row, Vec::new())?;

        if meeting.has_ended_at(now) {
            return Err(meeting_ended(&meeting.id));
        }

        let (name, email, google_id) = if meeting.anonymous_voting {
            let name = request
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or(ANONYMOUS_NAME)
                .to_string();
            (name, None, None)
        } else {
            let name = request
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| AppError::Validation("Participant name is required".to_string()))?
                .to_string();
            (name, request.email.clone(), request.google_id.clone())
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO participants (meeting_id, participant_id, name, email, google_id, joined_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(meeting_id, participant_id)
               DO UPDATE SET name = excluded.name, email = excluded.email, google_id = excluded.google_id"#,
        )
        .bind(&meeting.id)
        .bind(participant_id)
        .bind(&name)
        .bind(&email)
        .bind(&google_id)
        .bind(fmt_ts(now))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE meetings SET version = version + 1, updated_at = ? WHERE id = ?")
            .bind(fmt_ts(now))
            .bind(&meeting.id)
            .execute(&mut *tx)
            .await?;

        let joined = load_meeting(&mut tx, &meeting.id)
            .await?
            .ok_or_else(|| meeting_not_found(&meeting.id))?;
        tx.commit().await?;

        tracing::debug!("Participant {} joined meeting {}", participant_id, joined.id);
        self.feed.publish(Change::Meeting(joined.clone()));
        Ok(joined)
    }

    /// List the participants of a meeting.
    pub async fn list_participants(&self, meeting_id: &str) -> Result<Vec<Participant>, AppError> {
        Ok(self.require_meeting(meeting_id).await?.participants)
    }

    // ==================== VOTING OPERATIONS ====================

    /// List the votings of a meeting in creation order, closing expired ones first.
    pub async fn list_votings(
        &self,
        meeting_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Voting>, AppError> {
        self.require_meeting(meeting_id).await?;
        self.close_expired(Some(meeting_id), now).await?;

        let sql = format!(
            "SELECT {} FROM votings WHERE meeting_id = ? ORDER BY created_at, id",
            VOTING_COLUMNS
        );
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&sql)
            .bind(meeting_id)
            .fetch_all(&mut *conn)
            .await?;

        let mut votings = Vec::with_capacity(rows.len());
        for row in &rows {
            votings.push(hydrate_voting(&mut conn, row).await?);
        }
        Ok(votings)
    }

    /// Get a voting, closing it first if its end time has passed.
    pub async fn get_voting(
        &self,
        meeting_id: &str,
        voting_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Voting, AppError> {
        self.close_expired(Some(meeting_id), now).await?;
        self.fetch_voting(meeting_id, voting_id).await
    }

    async fn fetch_voting(&self, meeting_id: &str, voting_id: &str) -> Result<Voting, AppError> {
        let mut conn = self.pool.acquire().await?;
        match load_voting(&mut conn, voting_id).await? {
            Some(voting) if voting.meeting_id == meeting_id => Ok(voting),
            _ => Err(voting_not_found(voting_id)),
        }
    }

    /// Create a voting under a live meeting. Organizer only.
    pub async fn create_voting(
        &self,
        meeting_id: &str,
        actor: &str,
        request: &CreateVotingRequest,
        now: DateTime<Utc>,
    ) -> Result<Voting, AppError> {
        let meeting = self.require_owned_meeting(meeting_id, actor).await?;
        if !meeting.is_live() {
            return Err(AppError::Closed(format!(
                "Meeting {} is not active",
                meeting_id
            )));
        }
        if meeting.has_ended_at(now) {
            return Err(meeting_ended(meeting_id));
        }

        let title = request.title.trim();
        if title.is_empty() {
            return Err(AppError::Validation("Voting title is required".to_string()));
        }
        validate_duration(request.duration_minutes).map_err(AppError::Validation)?;
        let labels =
            normalize_options(request.options.as_deref()).map_err(AppError::Validation)?;

        let id = uuid::Uuid::new_v4().to_string();
        let end_time = now + Duration::minutes(request.duration_minutes);

        // Use a transaction for atomicity
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO votings (id, meeting_id, title, duration_minutes, start_time, end_time, active, has_minerva_vote, created_at, revision) VALUES (?, ?, ?, ?, ?, ?, 1, 0, ?, 1)"
        )
        .bind(&id)
        .bind(meeting_id)
        .bind(title)
        .bind(request.duration_minutes)
        .bind(fmt_ts(now))
        .bind(fmt_ts(end_time))
        .bind(fmt_ts(now))
        .execute(&mut *tx)
        .await?;

        for (position, label) in labels.iter().enumerate() {
            sqlx::query(
                "INSERT INTO voting_options (voting_id, label, position, votes) VALUES (?, ?, ?, 0)",
            )
            .bind(&id)
            .bind(label)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        let voting = load_voting(&mut tx, &id)
            .await?
            .ok_or_else(|| voting_not_found(&id))?;
        tx.commit().await?;

        tracing::info!(
            "Voting {} opened in meeting {} for {} minutes",
            id,
            meeting_id,
            request.duration_minutes
        );
        self.feed.publish(Change::Voting(voting.clone()));
        Ok(voting)
    }

    /// Delete a voting. Organizer only.
    pub async fn delete_voting(
        &self,
        meeting_id: &str,
        voting_id: &str,
        actor: &str,
    ) -> Result<(), AppError> {
        self.require_owned_meeting(meeting_id, actor).await?;

        let result = sqlx::query("DELETE FROM votings WHERE id = ? AND meeting_id = ?")
            .bind(voting_id)
            .bind(meeting_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(voting_not_found(voting_id));
        }

        self.feed.publish(Change::VotingDeleted {
            meeting_id: meeting_id.to_string(),
            voting_id: voting_id.to_string(),
        });
        Ok(())
    }

    /// Record one vote: ledger entry and option count commit together or not at all.
    pub async fn apply_vote(
        &self,
        meeting_id: &str,
        voting_id: &str,
        participant_id: &str,
        option: &str,
        now: DateTime<Utc>,
    ) -> Result<Voting, AppError> {
        let mut tx = self.pool.begin().await?;

        // Write first so concurrent submissions on this database serialize here
        let locked = sqlx::query(
            "UPDATE votings SET revision = revision + 1 WHERE id = ? AND meeting_id = ?",
        )
        .bind(voting_id)
        .bind(meeting_id)
        .execute(&mut *tx)
        .await?;

        if locked.rows_affected() == 0 {
            return Err(voting_not_found(voting_id));
        }

        let voting = load_voting(&mut tx, voting_id)
            .await?
            .ok_or_else(|| voting_not_found(voting_id))?;

        if !voting.active {
            return Err(voting_closed(voting_id));
        }

        if voting.is_expired_at(now) {
            // Persist the lazy closure even though the vote is refused
            sqlx::query("UPDATE votings SET active = 0 WHERE id = ?")
                .bind(voting_id)
                .execute(&mut *tx)
                .await?;
            let closed = load_voting(&mut tx, voting_id)
                .await?
                .ok_or_else(|| voting_not_found(voting_id))?;
            tx.commit().await?;

            tracing::info!("Voting {} closed on expiry", voting_id);
            self.feed.publish(Change::Voting(closed));
            return Err(voting_closed(voting_id));
        }

        if !voting.has_option(option) {
            return Err(AppError::InvalidOption(format!(
                "{:?} is not an option of voting {}",
                option, voting_id
            )));
        }

        if voting.votes.contains_key(participant_id) {
            return Err(already_voted(participant_id));
        }

        let inserted = sqlx::query(
            "INSERT INTO voting_ledger (voting_id, participant_id, option_label, voted_at) VALUES (?, ?, ?, ?)",
        )
        .bind(voting_id)
        .bind(participant_id)
        .bind(option)
        .bind(fmt_ts(now))
        .execute(&mut *tx)
        .await;

        match inserted {
            Err(e) if is_unique_violation(&e) => return Err(already_voted(participant_id)),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        sqlx::query("UPDATE voting_options SET votes = votes + 1 WHERE voting_id = ? AND label = ?")
            .bind(voting_id)
            .bind(option)
            .execute(&mut *tx)
            .await?;

        let updated = load_voting(&mut tx, voting_id)
            .await?
            .ok_or_else(|| voting_not_found(voting_id))?;
        tx.commit().await?;

        tracing::debug!(
            "Vote recorded on {} ({} total)",
            voting_id,
            updated.total_votes()
        );
        self.feed.publish(Change::Voting(updated.clone()));
        Ok(updated)
    }

    /// Whether `participant_id` has voted on a voting, and for which option.
    pub async fn my_vote(
        &self,
        meeting_id: &str,
        voting_id: &str,
        participant_id: &str,
    ) -> Result<MyVote, AppError> {
        let voting = self.fetch_voting(meeting_id, voting_id).await?;
        let option = voting.votes.get(participant_id).cloned();
        Ok(MyVote {
            has_voted: option.is_some(),
            option,
        })
    }

    /// Close a voting. Organizer only; closing a closed voting is a no-op.
    pub async fn close_voting(
        &self,
        meeting_id: &str,
        voting_id: &str,
        actor: &str,
    ) -> Result<Voting, AppError> {
        self.require_owned_meeting(meeting_id, actor).await?;

        let result = sqlx::query(
            "UPDATE votings SET active = 0, revision = revision + 1 WHERE id = ? AND meeting_id = ? AND active = 1",
        )
        .bind(voting_id)
        .bind(meeting_id)
        .execute(&self.pool)
        .await?;

        let voting = self.fetch_voting(meeting_id, voting_id).await?;

        if result.rows_affected() > 0 {
            tracing::info!("Voting {} closed by organizer", voting_id);
            self.feed.publish(Change::Voting(voting.clone()));
        }
        Ok(voting)
    }

    /// Close every active voting whose end time has passed, optionally within one meeting.
    pub async fn close_expired(
        &self,
        meeting_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Voting>, AppError> {
        let now_s = fmt_ts(now);
        let rows = match meeting_id {
            Some(meeting_id) => {
                sqlx::query(
                    "UPDATE votings SET active = 0, revision = revision + 1 WHERE meeting_id = ? AND active = 1 AND end_time <= ? RETURNING id",
                )
                .bind(meeting_id)
                .bind(&now_s)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE votings SET active = 0, revision = revision + 1 WHERE active = 1 AND end_time <= ? RETURNING id",
                )
                .bind(&now_s)
                .fetch_all(&self.pool)
                .await?
            }
        };

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.acquire().await?;
        let mut closed = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            if let Some(voting) = load_voting(&mut conn, &id).await? {
                tracing::info!("Voting {} closed on expiry", id);
                self.feed.publish(Change::Voting(voting.clone()));
                closed.push(voting);
            }
        }
        Ok(closed)
    }

    /// Record the organizer's one-time tie-breaking decision on a closed, tied voting.
    ///
    /// Counts are left untouched; the decision is an overlay on top of them.
    pub async fn tie_break(
        &self,
        meeting_id: &str,
        voting_id: &str,
        actor: &str,
        option: &str,
        now: DateTime<Utc>,
    ) -> Result<Voting, AppError> {
        self.require_owned_meeting(meeting_id, actor).await?;
        let voting = self.fetch_voting(meeting_id, voting_id).await?;

        if voting.is_open_at(now) {
            return Err(AppError::NotClosed(format!(
                "Voting {} is still open",
                voting_id
            )));
        }

        let outcome = tally::compute(&voting.options);
        if !outcome.is_tie {
            return Err(AppError::NoTie(format!(
                "Voting {} did not end in a tie",
                voting_id
            )));
        }

        if !outcome.winners.iter().any(|w| w == option) {
            return Err(AppError::InvalidOption(format!(
                "{:?} is not one of the tied options {:?}",
                option, outcome.winners
            )));
        }

        if voting.has_minerva_vote {
            return Err(already_decided(voting_id));
        }

        // An expired voting still flagged active gets its closure persisted here too
        let result = sqlx::query(
            r#"UPDATE votings SET has_minerva_vote = 1, minerva_option = ?, minerva_voted_by = ?,
                      minerva_voted_at = ?, active = 0, revision = revision + 1
               WHERE id = ? AND has_minerva_vote = 0"#,
        )
        .bind(option)
        .bind(actor)
        .bind(fmt_ts(now))
        .bind(voting_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(already_decided(voting_id));
        }

        let decided = self.fetch_voting(meeting_id, voting_id).await?;
        tracing::info!("Tie on voting {} broken in favour of {:?}", voting_id, option);
        self.feed.publish(Change::Voting(decided.clone()));
        Ok(decided)
    }
}

// Error helpers

fn meeting_not_found(id: &str) -> AppError {
    AppError::NotFound(format!("Meeting {} not found", id))
}

fn voting_not_found(id: &str) -> AppError {
    AppError::NotFound(format!("Voting {} not found", id))
}

fn meeting_ended(id: &str) -> AppError {
    AppError::Closed(format!("Meeting {} has ended", id))
}

fn voting_closed(id: &str) -> AppError {
    AppError::Closed(format!("Voting {} is closed", id))
}

fn already_voted(participant_id: &str) -> AppError {
    AppError::AlreadyVoted(format!("Participant {} has already voted", participant_id))
}

fn already_decided(voting_id: &str) -> AppError {
    AppError::AlreadyDecided(format!("Voting {} already has a tie-break decision", voting_id))
}

fn pin_in_use() -> AppError {
    AppError::Duplicate("Access PIN is already used by an active meeting".to_string())
}

// Loading helpers, usable on a pooled connection or inside a transaction

async fn load_meeting(conn: &mut SqliteConnection, id: &str) -> Result<Option<Meeting>, AppError> {
    let sql = format!("SELECT {} FROM meetings WHERE id = ?", MEETING_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    match row {
        Some(row) => Ok(Some(hydrate_meeting(conn, &row).await?)),
        None => Ok(None),
    }
}

async fn hydrate_meeting(conn: &mut SqliteConnection, row: &SqliteRow) -> Result<Meeting, AppError> {
    let id: String = row.get("id");
    let rows = sqlx::query(
        "SELECT participant_id, name, email, google_id, joined_at FROM participants WHERE meeting_id = ? ORDER BY joined_at, participant_id",
    )
    .bind(&id)
    .fetch_all(&mut *conn)
    .await?;

    let participants = rows
        .iter()
        .map(participant_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    meeting_from_row(row, participants)
}

async fn load_voting(conn: &mut SqliteConnection, id: &str) -> Result<Option<Voting>, AppError> {
    let sql = format!("SELECT {} FROM votings WHERE id = ?", VOTING_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    match row {
        Some(row) => Ok(Some(hydrate_voting(conn, &row).await?)),
        None => Ok(None),
    }
}

async fn hydrate_voting(conn: &mut SqliteConnection, row: &SqliteRow) -> Result<Voting, AppError> {
    let id: String = row.get("id");

    let options = sqlx::query(
        "SELECT label, votes FROM voting_options WHERE voting_id = ? ORDER BY position",
    )
    .bind(&id)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(|r| VoteOption {
        label: r.get("label"),
        votes: r.get::<i64, _>("votes").max(0) as u32,
    })
    .collect();

    let votes: BTreeMap<String, String> = sqlx::query(
        "SELECT participant_id, option_label FROM voting_ledger WHERE voting_id = ?",
    )
    .bind(&id)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(|r| (r.get("participant_id"), r.get("option_label")))
    .collect();

    voting_from_row(row, options, votes)
}

// Helper functions for row conversion

fn meeting_from_row(row: &SqliteRow, participants: Vec<Participant>) -> Result<Meeting, AppError> {
    let anonymous_voting: i32 = row.get("anonymous_voting");
    let active: i32 = row.get("active");
    let archived: i32 = row.get("archived");
    let end_at: Option<String> = row.get("end_at");
    Ok(Meeting {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        created_by: row.get("created_by"),
        access_pin: row.get("access_pin"),
        start_at: parse_ts(row.get("start_at"))?,
        end_at: end_at.as_deref().map(parse_ts).transpose()?,
        anonymous_voting: anonymous_voting != 0,
        active: active != 0,
        archived: archived != 0,
        participants,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
        version: row.get("version"),
    })
}

fn participant_from_row(row: &SqliteRow) -> Result<Participant, AppError> {
    Ok(Participant {
        id: row.get("participant_id"),
        name: row.get("name"),
        email: row.get("email"),
        google_id: row.get("google_id"),
        joined_at: parse_ts(row.get("joined_at"))?,
    })
}

fn voting_from_row(
    row: &SqliteRow,
    options: Vec<VoteOption>,
    votes: BTreeMap<String, String>,
) -> Result<Voting, AppError> {
    let active: i32 = row.get("active");
    let has_minerva_vote: i32 = row.get("has_minerva_vote");
    let minerva_voted_at: Option<String> = row.get("minerva_voted_at");
    Ok(Voting {
        id: row.get("id"),
        meeting_id: row.get("meeting_id"),
        title: row.get("title"),
        options,
        votes,
        duration_minutes: row.get("duration_minutes"),
        start_time: parse_ts(row.get("start_time"))?,
        end_time: parse_ts(row.get("end_time"))?,
        active: active != 0,
        has_minerva_vote: has_minerva_vote != 0,
        minerva_option: row.get("minerva_option"),
        minerva_voted_by: row.get("minerva_voted_by"),
        minerva_voted_at: minerva_voted_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(row.get("created_at"))?,
        revision: row.get("revision"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use crate::events::BroadcastFeed;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const ORGANIZER: &str = "organizer-1";

    async fn repo() -> (Repository, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.sqlite")).await.unwrap();
        (Repository::new(pool, Arc::new(BroadcastFeed::new())), dir)
    }

    fn meeting_request(pin: &str) -> CreateMeetingRequest {
        CreateMeetingRequest {
            name: "Assembleia".into(),
            description: None,
            access_pin: pin.into(),
            start_at: None,
            end_at: None,
            anonymous_voting: false,
        }
    }

    fn voting_request(options: &[&str], minutes: i64) -> CreateVotingRequest {
        CreateVotingRequest {
            title: "Proposta 1".into(),
            options: Some(options.iter().map(|o| o.to_string()).collect()),
            duration_minutes: minutes,
        }
    }

    async fn meeting_with_voting(repo: &Repository, options: &[&str]) -> (Meeting, Voting) {
        let now = Utc::now();
        let meeting = repo
            .create_meeting(ORGANIZER, &meeting_request("4321"), now)
            .await
            .unwrap();
        let voting = repo
            .create_voting(&meeting.id, ORGANIZER, &voting_request(options, 10), now)
            .await
            .unwrap();
        (meeting, voting)
    }

    #[tokio::test]
    async fn test_vote_updates_ledger_and_counts() {
        let (repo, _dir) = repo().await;
        let (meeting, voting) = meeting_with_voting(&repo, &["Concordo", "Discordo"]).await;
        let now = Utc::now();

        let after = repo
            .apply_vote(&meeting.id, &voting.id, "P", "Concordo", now)
            .await
            .unwrap();
        assert_eq!(after.options[0], VoteOption::new("Concordo", 1));
        assert_eq!(after.options[1], VoteOption::new("Discordo", 0));
        assert_eq!(after.votes.get("P").map(String::as_str), Some("Concordo"));
        assert!(after.ledger_consistent());

        for option in ["Concordo", "Discordo"] {
            let err = repo
                .apply_vote(&meeting.id, &voting.id, "P", option, now)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::AlreadyVoted(_)));
        }

        let stored = repo.get_voting(&meeting.id, &voting.id, now).await.unwrap();
        assert_eq!(stored.total_votes(), 1);
        assert_eq!(stored.revision, after.revision);
    }

    #[tokio::test]
    async fn test_vote_validation_errors() {
        let (repo, _dir) = repo().await;
        let (meeting, voting) = meeting_with_voting(&repo, &["A", "B"]).await;
        let now = Utc::now();

        let err = repo
            .apply_vote(&meeting.id, "missing", "P", "A", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = repo
            .apply_vote("other-meeting", &voting.id, "P", "A", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = repo
            .apply_vote(&meeting.id, &voting.id, "P", "C", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidOption(_)));

        // Failed attempts leave nothing behind
        let stored = repo.get_voting(&meeting.id, &voting.id, now).await.unwrap();
        assert_eq!(stored.total_votes(), 0);
        assert!(stored.votes.is_empty());
        assert_eq!(stored.revision, voting.revision);
    }

    #[tokio::test]
    async fn test_vote_after_close_is_rejected() {
        let (repo, _dir) = repo().await;
        let (meeting, voting) = meeting_with_voting(&repo, &["A", "B"]).await;
        let now = Utc::now();

        repo.apply_vote(&meeting.id, &voting.id, "p1", "A", now)
            .await
            .unwrap();
        let closed = repo
            .close_voting(&meeting.id, &voting.id, ORGANIZER)
            .await
            .unwrap();
        assert!(!closed.active);

        // Idempotent
        let again = repo
            .close_voting(&meeting.id, &voting.id, ORGANIZER)
            .await
            .unwrap();
        assert_eq!(again.revision, closed.revision);
        assert_eq!(again.options, closed.options);

        let err = repo
            .apply_vote(&meeting.id, &voting.id, "p2", "B", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Closed(_)));

        let stored = repo.get_voting(&meeting.id, &voting.id, now).await.unwrap();
        assert_eq!(stored.options, closed.options);
        assert!(stored.ledger_consistent());
    }

    #[tokio::test]
    async fn test_expired_voting_is_closed_lazily() {
        let (repo, _dir) = repo().await;
        let (meeting, voting) = meeting_with_voting(&repo, &["A", "B"]).await;
        let later = voting.end_time + Duration::seconds(1);

        let err = repo
            .apply_vote(&meeting.id, &voting.id, "p1", "A", later)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Closed(_)));

        let stored = repo
            .get_voting(&meeting.id, &voting.id, later)
            .await
            .unwrap();
        assert!(!stored.active);
        assert_eq!(stored.total_votes(), 0);
    }

    #[tokio::test]
    async fn test_close_expired_sweeps_only_past_end_time() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let meeting = repo
            .create_meeting(ORGANIZER, &meeting_request("9999"), now)
            .await
            .unwrap();
        let short = repo
            .create_voting(&meeting.id, ORGANIZER, &voting_request(&["A", "B"], 1), now)
            .await
            .unwrap();
        let long = repo
            .create_voting(&meeting.id, ORGANIZER, &voting_request(&["A", "B"], 60), now)
            .await
            .unwrap();

        let closed = repo
            .close_expired(None, now + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, short.id);

        let still_open = repo.fetch_voting(&meeting.id, &long.id).await.unwrap();
        assert!(still_open.active);
    }

    #[tokio::test]
    async fn test_only_organizer_closes_and_creates() {
        let (repo, _dir) = repo().await;
        let (meeting, voting) = meeting_with_voting(&repo, &["A", "B"]).await;

        let err = repo
            .close_voting(&meeting.id, &voting.id, "intruder")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = repo
            .create_voting(
                &meeting.id,
                "intruder",
                &voting_request(&["A", "B"], 5),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_tie_break_scenario() {
        let (repo, _dir) = repo().await;
        let (meeting, voting) = meeting_with_voting(&repo, &["A", "B", "C"]).await;
        let now = Utc::now();

        let ballots = [
            ("p1", "A"),
            ("p2", "A"),
            ("p3", "A"),
            ("p4", "B"),
            ("p5", "B"),
            ("p6", "B"),
            ("p7", "C"),
        ];
        for (participant, option) in ballots {
            repo.apply_vote(&meeting.id, &voting.id, participant, option, now)
                .await
                .unwrap();
        }

        let err = repo
            .tie_break(&meeting.id, &voting.id, ORGANIZER, "B", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotClosed(_)));

        let closed = repo
            .close_voting(&meeting.id, &voting.id, ORGANIZER)
            .await
            .unwrap();
        let outcome = tally::compute(&closed.options);
        assert_eq!(outcome.winners, vec!["A", "B"]);
        assert!(outcome.is_tie);

        let err = repo
            .tie_break(&meeting.id, &voting.id, "p1", "B", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = repo
            .tie_break(&meeting.id, &voting.id, ORGANIZER, "C", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidOption(_)));

        let decided = repo
            .tie_break(&meeting.id, &voting.id, ORGANIZER, "B", now)
            .await
            .unwrap();
        assert!(decided.has_minerva_vote);
        assert_eq!(decided.minerva_option.as_deref(), Some("B"));
        assert_eq!(decided.minerva_voted_by.as_deref(), Some(ORGANIZER));
        assert!(decided.minerva_voted_at.is_some());
        assert_eq!(decided.options, closed.options);

        let err = repo
            .tie_break(&meeting.id, &voting.id, ORGANIZER, "A", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyDecided(_)));
    }

    #[tokio::test]
    async fn test_tie_break_requires_tie() {
        let (repo, _dir) = repo().await;
        let (meeting, voting) = meeting_with_voting(&repo, &["A", "B"]).await;
        let now = Utc::now();

        repo.close_voting(&meeting.id, &voting.id, ORGANIZER)
            .await
            .unwrap();
        // Nobody voted: no tie
        let err = repo
            .tie_break(&meeting.id, &voting.id, ORGANIZER, "A", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoTie(_)));
    }

    #[tokio::test]
    async fn test_concurrent_votes_never_lose_or_double_count() {
        let (repo, _dir) = repo().await;
        let (meeting, voting) = meeting_with_voting(&repo, &["A", "B"]).await;
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..20 {
            // Every participant submits twice, concurrently
            for attempt in 0..2 {
                let repo = repo.clone();
                let meeting_id = meeting.id.clone();
                let voting_id = voting.id.clone();
                handles.push(tokio::spawn(async move {
                    let option = if (i + attempt) % 2 == 0 { "A" } else { "B" };
                    repo.apply_vote(&meeting_id, &voting_id, &format!("p{}", i), option, now)
                        .await
                }));
            }
        }

        let mut accepted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(AppError::AlreadyVoted(_)) => rejected += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(accepted, 20);
        assert_eq!(rejected, 20);

        let stored = repo.get_voting(&meeting.id, &voting.id, now).await.unwrap();
        assert_eq!(stored.votes.len(), 20);
        assert_eq!(stored.total_votes(), 20);
        assert!(stored.ledger_consistent());
    }

    #[tokio::test]
    async fn test_pin_unique_among_live_meetings() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let first = repo
            .create_meeting(ORGANIZER, &meeting_request("5555"), now)
            .await
            .unwrap();

        let err = repo
            .create_meeting("someone-else", &meeting_request("5555"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Duplicate(_)));

        // Archiving frees the PIN
        let archived = repo
            .set_archived(&first.id, ORGANIZER, true, now)
            .await
            .unwrap();
        assert!(archived.archived);
        assert!(!archived.active);

        repo.create_meeting("someone-else", &meeting_request("5555"), now)
            .await
            .unwrap();

        // Restoring would make two live meetings share it
        let err = repo
            .set_archived(&first.id, ORGANIZER, false, now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_join_meeting_records_participant() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let meeting = repo
            .create_meeting(ORGANIZER, &meeting_request("2468"), now)
            .await
            .unwrap();

        let request = JoinMeetingRequest {
            access_pin: "2468".into(),
            name: Some("Ana".into()),
            email: Some("ana@example.com".into()),
            google_id: None,
        };
        let joined = repo.join_meeting("ana", &request, now).await.unwrap();
        assert_eq!(joined.id, meeting.id);
        assert_eq!(joined.participants.len(), 1);
        assert!(joined.version > meeting.version);

        // Re-joining does not duplicate
        let again = repo.join_meeting("ana", &request, now).await.unwrap();
        assert_eq!(again.participants.len(), 1);

        let wrong_pin = JoinMeetingRequest {
            access_pin: "0000".into(),
            ..request
        };
        let err = repo.join_meeting("ana", &wrong_pin, now).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_anonymous_meeting_drops_identity() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let mut request = meeting_request("1357");
        request.anonymous_voting = true;
        repo.create_meeting(ORGANIZER, &request, now).await.unwrap();

        let joined = repo
            .join_meeting(
                "anon-1",
                &JoinMeetingRequest {
                    access_pin: "1357".into(),
                    name: None,
                    email: Some("hidden@example.com".into()),
                    google_id: Some("g-123".into()),
                },
                now,
            )
            .await
            .unwrap();
        let participant = &joined.participants[0];
        assert_eq!(participant.name, ANONYMOUS_NAME);
        assert!(participant.email.is_none());
        assert!(participant.google_id.is_none());
    }

    #[tokio::test]
    async fn test_mutations_are_published() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let meeting = repo
            .create_meeting(ORGANIZER, &meeting_request("8642"), now)
            .await
            .unwrap();
        let mut sub = repo.subscribe(&meeting.id);

        let voting = repo
            .create_voting(&meeting.id, ORGANIZER, &voting_request(&["A", "B"], 5), now)
            .await
            .unwrap();
        repo.apply_vote(&meeting.id, &voting.id, "p1", "A", now)
            .await
            .unwrap();

        let created = sub.recv().await.unwrap();
        assert!(matches!(&created, Change::Voting(v) if v.total_votes() == 0));
        let voted = sub.recv().await.unwrap();
        match voted {
            Change::Voting(v) => {
                assert_eq!(v.total_votes(), 1);
                assert!(v.revision > voting.revision);
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_meeting_version_conflict() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let meeting = repo
            .create_meeting(ORGANIZER, &meeting_request("1111"), now)
            .await
            .unwrap();

        let stale = UpdateMeetingRequest {
            name: Some("Renamed".into()),
            expected_version: Some(meeting.version + 5),
            ..Default::default()
        };
        let err = repo
            .update_meeting(&meeting.id, ORGANIZER, &stale, now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));

        let fresh = UpdateMeetingRequest {
            name: Some("Renamed".into()),
            expected_version: Some(meeting.version),
            ..Default::default()
        };
        let updated = repo
            .update_meeting(&meeting.id, ORGANIZER, &fresh, now)
            .await
            .unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.version, meeting.version + 1);
    }

    #[tokio::test]
    async fn test_unstorable_years_are_rejected_before_insert() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();

        let mut request = meeting_request("3141");
        request.end_at = Some(far);
        let err = repo.create_meeting(ORGANIZER, &request, now).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Nothing was stored: listing works and the PIN is still free
        assert!(repo
            .list_meetings(&MeetingListQuery::default())
            .await
            .unwrap()
            .is_empty());
        let meeting = repo
            .create_meeting(ORGANIZER, &meeting_request("3141"), now)
            .await
            .unwrap();

        let err = repo
            .update_meeting(
                &meeting.id,
                ORGANIZER,
                &UpdateMeetingRequest {
                    start_at: Some(far),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(
            repo.list_meetings(&MeetingListQuery::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_update_meeting_clears_optional_fields() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let mut request = meeting_request("2718");
        request.description = Some("Agenda".into());
        request.end_at = Some(now + Duration::hours(2));
        let meeting = repo.create_meeting(ORGANIZER, &request, now).await.unwrap();

        // Absent keeps the stored values
        let renamed = repo
            .update_meeting(
                &meeting.id,
                ORGANIZER,
                &UpdateMeetingRequest {
                    name: Some("Renamed".into()),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(renamed.description.as_deref(), Some("Agenda"));
        assert!(renamed.end_at.is_some());

        // Explicit null clears them
        let cleared = repo
            .update_meeting(
                &meeting.id,
                ORGANIZER,
                &UpdateMeetingRequest {
                    description: Some(None),
                    end_at: Some(None),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        assert!(cleared.description.is_none());
        assert!(cleared.end_at.is_none());
    }

    #[tokio::test]
    async fn test_ended_meeting_rejects_new_votings_and_joins() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let mut request = meeting_request("1618");
        request.start_at = Some(now - Duration::hours(3));
        request.end_at = Some(now - Duration::hours(1));
        let meeting = repo.create_meeting(ORGANIZER, &request, now).await.unwrap();

        let err = repo
            .create_voting(&meeting.id, ORGANIZER, &voting_request(&["A", "B"], 5), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Closed(_)));

        let err = repo
            .join_meeting(
                "late",
                &JoinMeetingRequest {
                    access_pin: "1618".into(),
                    name: Some("Late".into()),
                    email: None,
                    google_id: None,
                },
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Closed(_)));
    }

    #[tokio::test]
    async fn test_subscribing_to_unknown_meeting_leaves_no_channel() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.sqlite")).await.unwrap();
        let feed = Arc::new(BroadcastFeed::new());
        let repo = Repository::new(pool, feed.clone());

        for i in 0..50 {
            let id = format!("ghost-{}", i);
            let sub = repo.subscribe(&id);
            assert!(repo.get_meeting(&id).await.unwrap().is_none());
            drop(sub);
        }
        assert_eq!(feed.channel_count(), 0);
    }
}
