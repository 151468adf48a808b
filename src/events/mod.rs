//! Change feed for meetings and their votings.
//!
//! The repository publishes a [`Change`] after every committed write; clients
//! subscribe per meeting and receive pushes without polling. Snapshots carry
//! the document revision so a [`Subscription`] only ever moves forward per
//! document, whatever order broadcasts race in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Meeting, Voting};

/// Buffered changes per meeting before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 256;

/// A committed mutation, as pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Change {
    Meeting(Meeting),
    Voting(Voting),
    #[serde(rename_all = "camelCase")]
    MeetingDeleted { meeting_id: String },
    #[serde(rename_all = "camelCase")]
    VotingDeleted { meeting_id: String, voting_id: String },
}

impl Change {
    /// Meeting the change belongs to; this is the subscription key.
    pub fn meeting_id(&self) -> &str {
        match self {
            Change::Meeting(m) => &m.id,
            Change::Voting(v) => &v.meeting_id,
            Change::MeetingDeleted { meeting_id } => meeting_id,
            Change::VotingDeleted { meeting_id, .. } => meeting_id,
        }
    }

    /// Voting the change concerns, if any.
    pub fn voting_id(&self) -> Option<&str> {
        match self {
            Change::Voting(v) => Some(&v.id),
            Change::VotingDeleted { voting_id, .. } => Some(voting_id),
            _ => None,
        }
    }

    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Meeting(_) => "meeting",
            Change::Voting(_) => "voting",
            Change::MeetingDeleted { .. } => "meetingDeleted",
            Change::VotingDeleted { .. } => "votingDeleted",
        }
    }

    /// Document key and revision of a snapshot. Deletions carry none.
    fn revision(&self) -> Option<(String, i64)> {
        match self {
            Change::Meeting(m) => Some((format!("meeting:{}", m.id), m.version)),
            Change::Voting(v) => Some((format!("voting:{}", v.id), v.revision)),
            _ => None,
        }
    }
}

/// Publish/subscribe seam between the store and its listeners.
pub trait ChangeFeed: Send + Sync {
    /// Push a committed change to every subscriber of its meeting.
    fn publish(&self, change: Change);

    /// Listen to one meeting and all of its votings. Dropping the handle unsubscribes.
    fn subscribe(&self, meeting_id: &str) -> Subscription;
}

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<Change>>>>;

/// Subscription handle returned by [`ChangeFeed::subscribe`].
pub struct Subscription {
    rx: broadcast::Receiver<Change>,
    last_seen: HashMap<String, i64>,
    release: Option<(Channels, String)>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<Change>) -> Self {
        Self {
            rx,
            last_seen: HashMap::new(),
            release: None,
        }
    }

    /// Mark a snapshot as already delivered, e.g. one sent as initial state.
    pub fn observe(&mut self, change: &Change) {
        if let Some((key, revision)) = change.revision() {
            let seen = self.last_seen.entry(key).or_insert(revision);
            *seen = (*seen).max(revision);
        }
    }

    /// Wait for the next change. Returns `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<Change> {
        loop {
            match self.rx.recv().await {
                Ok(change) => {
                    if let Some((key, revision)) = change.revision() {
                        if self.last_seen.get(&key).is_some_and(|seen| *seen >= revision) {
                            continue;
                        }
                        self.last_seen.insert(key, revision);
                    }
                    return Some(change);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscriber lagged, skipped {} changes", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some((channels, meeting_id)) = self.release.take() else {
            return;
        };
        let mut channels = channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Our own receiver is still alive here
        if channels
            .get(&meeting_id)
            .is_some_and(|tx| tx.receiver_count() <= 1)
        {
            channels.remove(&meeting_id);
        }
    }
}

/// In-process feed backed by one broadcast channel per meeting.
///
/// A channel lives exactly as long as its meeting has subscribers.
#[derive(Clone, Default)]
pub struct BroadcastFeed {
    channels: Channels,
}

impl BroadcastFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of meetings with at least one live channel.
    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl ChangeFeed for BroadcastFeed {
    fn publish(&self, change: Change) {
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = channels.get(change.meeting_id()) {
            // Err only means every receiver is gone; their drop prunes the channel
            let _ = tx.send(change);
        }
    }

    fn subscribe(&self, meeting_id: &str) -> Subscription {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = channels
            .entry(meeting_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let mut sub = Subscription::new(tx.subscribe());
        sub.release = Some((self.channels.clone(), meeting_id.to_string()));
        sub
    }
}
