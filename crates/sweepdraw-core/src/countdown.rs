// Countdown to a fixed deadline (draw opening, payment expiry).
//
// The deadline is compared with the wall clock once, at construction. From
// then on elapsed time is measured on the monotonic clock, so a wall-clock
// adjustment can never make the remaining time grow.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Error)]
pub enum CountdownError {
    #[error("invalid deadline {input:?}: {source}")]
    InvalidDeadline {
        input: String,
        source: chrono::ParseError,
    },
}

/// Time left, formatted as `HH:MM:SS` (with a `Nd ` prefix past one day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Remaining(pub Duration);

impl Remaining {
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Round partial seconds up so "00:00:00" only shows once expired.
        let total = self.0.as_millis().div_ceil(1000) as u64;
        let days = total / 86_400;
        let hours = (total % 86_400) / 3_600;
        let minutes = (total % 3_600) / 60;
        let seconds = total % 60;
        if days > 0 {
            write!(f, "{days}d {hours:02}:{minutes:02}:{seconds:02}")
        } else {
            write!(f, "{hours:02}:{minutes:02}:{seconds:02}")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownTick {
    Remaining(Remaining),
    /// Sent once; the countdown stops afterwards.
    Expired,
}

#[derive(Debug, Clone)]
pub struct Countdown {
    deadline: DateTime<Utc>,
    anchor: Instant,
    remaining_at_anchor: Duration,
}

impl Countdown {
    /// Parse an RFC 3339 deadline and anchor it now.
    pub fn parse(input: &str) -> Result<Self, CountdownError> {
        let deadline = DateTime::parse_from_rfc3339(input)
            .map_err(|source| CountdownError::InvalidDeadline {
                input: input.to_string(),
                source,
            })?
            .with_timezone(&Utc);
        Ok(Self::new(deadline))
    }

    pub fn new(deadline: DateTime<Utc>) -> Self {
        Self::anchored(deadline, Utc::now(), Instant::now())
    }

    /// Anchor against an explicit wall-clock/monotonic pair.
    pub fn anchored(deadline: DateTime<Utc>, wall_now: DateTime<Utc>, mono_now: Instant) -> Self {
        let remaining_at_anchor = (deadline - wall_now).to_std().unwrap_or(Duration::ZERO);
        Countdown {
            deadline,
            anchor: mono_now,
            remaining_at_anchor,
        }
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn remaining_at(&self, now: Instant) -> Remaining {
        let elapsed = now.saturating_duration_since(self.anchor);
        Remaining(self.remaining_at_anchor.saturating_sub(elapsed))
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.remaining_at(now).is_zero()
    }

    /// Emit the remaining time every `tick` (first immediately), then a single
    /// `Expired`. Dropping the handle stops it.
    pub fn spawn(self, tick: Duration, sink: mpsc::Sender<CountdownTick>) -> CountdownHandle {
        let task = tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let remaining = self.remaining_at(Instant::now());
                if remaining.is_zero() {
                    debug!("countdown to {} expired", self.deadline);
                    let _ = sink.send(CountdownTick::Expired).await;
                    break;
                }
                if sink.send(CountdownTick::Remaining(remaining)).await.is_err() {
                    break;
                }
            }
        });
        CountdownHandle { task }
    }
}

pub struct CountdownHandle {
    task: JoinHandle<()>,
}

impl CountdownHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CountdownHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
