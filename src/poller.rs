//! Background refresh loop with adaptive interval and exponential backoff.
//!
//! The polling interval is controlled externally via a `watch::Receiver<u64>`: the main event
//! loop writes a new interval when activity changes (3s while builds are running, 10s otherwise)
//! and the poller picks it up on its next `tokio::select!` cycle without being restarted. A
//! message on the refresh channel starts a refresh right away.
//!
//! On consecutive failures, exponential backoff (`base × 2^failures`) is applied up to
//! `MAX_BACKOFF_SECS` (5 minutes). The backoff resets to the base interval on the next
//! successful refresh.

use crate::cache::Cache;
use crate::error::CacheError;
use crate::events::AppEvent;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// 5 minutes: the longest a user should wait between automatic retries.
const MAX_BACKOFF_SECS: u64 = 300;
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Compute backoff delay: `min(base_interval * 2^failures, MAX_BACKOFF_SECS)`.
pub fn backoff_delay(base_interval: u64, failures: u32) -> u64 {
    let multiplier = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
    base_interval
        .saturating_mul(multiplier)
        .clamp(1, MAX_BACKOFF_SECS)
}

pub struct Poller {
    cache: Cache,
    repository_url: String,
    limit: usize,
    tx: mpsc::UnboundedSender<AppEvent>,
    interval_rx: watch::Receiver<u64>,
    refresh_rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        cache: Cache,
        repository_url: String,
        limit: usize,
        tx: mpsc::UnboundedSender<AppEvent>,
        interval_rx: watch::Receiver<u64>,
        refresh_rx: mpsc::UnboundedReceiver<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cache,
            repository_url,
            limit,
            tx,
            interval_rx,
            refresh_rx,
            cancel,
        }
    }

    /// Runs until `cancel` fires or the event channel closes.
    pub async fn run(mut self) {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        tokio::spawn(forward_updates(updates_rx, self.tx.clone()));

        let mut failures: u32 = 0;
        loop {
            match self.poll_once(&updates_tx).await {
                PollOutcome::Success => failures = 0,
                PollOutcome::Failure => failures = failures.saturating_add(1),
                PollOutcome::Stopped => return,
            }

            let base_interval = *self.interval_rx.borrow();
            let delay = if failures > 0 {
                backoff_delay(base_interval, failures)
            } else {
                base_interval
            };
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = time::sleep(time::Duration::from_secs(delay)) => {},
                // Wake early if the polling interval changes
                Ok(()) = self.interval_rx.changed() => {},
                Some(()) = self.refresh_rx.recv() => {},
            }
        }
    }

    async fn poll_once(&self, updates: &mpsc::Sender<DateTime<Utc>>) -> PollOutcome {
        let result = self
            .cache
            .update_from_providers(&self.cancel, &self.repository_url, self.limit, updates)
            .await;

        let event = match result {
            Ok(()) => {
                tracing::debug!("refresh of {} complete", self.repository_url);
                AppEvent::Refreshed(Utc::now())
            }
            Err(CacheError::Cancelled) if self.cancel.is_cancelled() => {
                return PollOutcome::Stopped;
            }
            Err(CacheError::RepositoryNotFound) => AppEvent::Error(format!(
                "repository {} not found on any provider",
                self.repository_url
            )),
            Err(e) => AppEvent::Error(format!("Refresh failed: {e}")),
        };

        let outcome = if matches!(event, AppEvent::Refreshed(_)) {
            PollOutcome::Success
        } else {
            PollOutcome::Failure
        };
        if self.tx.send(event).is_err() {
            return PollOutcome::Stopped; // Receiver dropped
        }
        outcome
    }
}

enum PollOutcome {
    Success,
    Failure,
    Stopped,
}

/// Turns the timestamps fired by the cache into redraw events.
async fn forward_updates(
    mut updates: mpsc::Receiver<DateTime<Utc>>,
    tx: mpsc::UnboundedSender<AppEvent>,
) {
    while let Some(at) = updates.recv().await {
        if tx.send(AppEvent::CacheUpdated(at)).is_err() {
            tracing::warn!("poller: event channel closed");
            return;
        }
    }
}
