// Payment windows: pending participants must pay within a fixed window after
// joining or they expire and drop out of the draw.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::countdown::Countdown;
use crate::db::Database;
use crate::feed::ChangeFeed;
use crate::model::{Change, ChangeEvent, Participant, PaymentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentWindow {
    window: Duration,
}

impl PaymentWindow {
    pub fn new(window: Duration) -> Self {
        PaymentWindow { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Deadline for a pending participant; `None` once paid, expired, or
    /// removed.
    pub fn deadline_for(&self, participant: &Participant) -> Option<DateTime<Utc>> {
        if participant.payment_status != PaymentStatus::Pending || participant.removed {
            return None;
        }
        let window = chrono::Duration::from_std(self.window).ok()?;
        Some(participant.joined_at + window)
    }

    pub fn countdown_for(&self, participant: &Participant) -> Option<Countdown> {
        self.deadline_for(participant).map(Countdown::new)
    }

    /// Expire every pending participant of `event_id` whose deadline is at or
    /// before `now`, and announce the updates on `feed`.
    pub fn expire_overdue(
        &self,
        db: &Database,
        feed: Option<&ChangeFeed>,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Participant>> {
        let window =
            chrono::Duration::from_std(self.window).context("payment window out of range")?;
        let expired = db
            .expire_pending_before(event_id, now - window)
            .context("failed to expire overdue payments")?;

        if !expired.is_empty() {
            info!("expired {} unpaid participants in {event_id}", expired.len());
        }
        if let Some(feed) = feed {
            for participant in &expired {
                feed.publish(
                    event_id,
                    ChangeEvent::Participant(Change::Update(participant.clone())),
                );
            }
        }
        Ok(expired)
    }
}
