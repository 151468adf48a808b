//! Background expiry sweeper.
//!
//! Closes votings whose end time has passed even when nobody reads them, so
//! listeners see the closure without having to poll. Reads still close
//! expired votings on their own; the sweeper only makes it happen sooner.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};

use crate::db::Repository;
use crate::errors::AppError;

/// Close every expired voting once. Returns how many were closed.
pub async fn sweep_once(repo: &Repository) -> Result<usize, AppError> {
    let closed = repo.close_expired(None, Utc::now()).await?;
    Ok(closed.len())
}

/// Run [`sweep_once`] every `period` until the task is aborted.
pub async fn run_sweeper(repo: Arc<Repository>, period: Duration) {
    tracing::info!("Expiry sweeper running every {:?}", period);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match sweep_once(&repo).await {
            Ok(0) => {}
            Ok(count) => tracing::info!("Expiry sweep closed {} voting(s)", count),
            Err(e) => tracing::error!("Expiry sweep failed: {}", e),
        }
    }
}
