// In-process change feed: a broadcast notification endpoint that live views
// in the same process subscribe to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::model::{ChangeEvent, StreamKind};
use crate::transport::{Subscribed, Subscription, TransportEvent};

/// Broadcast buffer. A subscriber further behind than this is told it
/// disconnected and reconnected, which makes its session resync.
const FEED_CAPACITY: usize = 256;

/// Per-subscriber delivery buffer.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct FeedItem {
    event_id: String,
    change: ChangeEvent,
}

pub struct ChangeFeed {
    tx: broadcast::Sender<FeedItem>,
    heartbeat: Duration,
    next_id: AtomicU64,
    forwarders: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl ChangeFeed {
    pub fn new(heartbeat: Duration) -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        ChangeFeed {
            tx,
            heartbeat,
            next_id: AtomicU64::new(1),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Notify subscribers of `event_id`. Having no subscribers is fine.
    pub fn publish(&self, event_id: &str, change: ChangeEvent) {
        let delivered = self
            .tx
            .send(FeedItem {
                event_id: event_id.to_string(),
                change,
            })
            .unwrap_or(0);
        debug!("published change for {event_id} to {delivered} receivers");
    }

    pub fn subscriber_count(&self) -> usize {
        self.forwarders
            .lock()
            .map(|f| f.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Subscription for ChangeFeed {
    async fn subscribe(&self, stream: StreamKind, event_id: &str) -> Result<Subscribed> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::channel(SUBSCRIBER_BUFFER);
        let rx = self.tx.subscribe();
        let task = tokio::spawn(forward(
            rx,
            tx,
            stream,
            event_id.to_string(),
            self.heartbeat,
        ));

        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.retain(|_, h| !h.is_finished());
            forwarders.insert(id, task);
        }
        Ok(Subscribed { id, events })
    }

    async fn unsubscribe(&self, id: u64) {
        let task = self.forwarders.lock().ok().and_then(|mut f| f.remove(&id));
        if let Some(task) = task {
            task.abort();
            debug!("feed subscription {id} released");
        }
    }
}

/// Relay matching broadcast items to one subscriber until it goes away.
async fn forward(
    mut rx: broadcast::Receiver<FeedItem>,
    tx: mpsc::Sender<TransportEvent>,
    stream: StreamKind,
    event_id: String,
    heartbeat: Duration,
) {
    if tx.send(TransportEvent::Connected).await.is_err() {
        return;
    }
    let mut beat = interval_at(Instant::now() + heartbeat, heartbeat);
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            item = rx.recv() => match item {
                Ok(item) if item.event_id == event_id && item.change.stream() == stream => {
                    TransportEvent::Change(item.change)
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!("{stream} subscriber lagged by {missed} notifications");
                    let dropped = TransportEvent::Disconnected {
                        error: Some(format!("missed {missed} notifications")),
                    };
                    if tx.send(dropped).await.is_err() {
                        return;
                    }
                    TransportEvent::Connected
                }
                Err(RecvError::Closed) => {
                    let _ = tx.send(TransportEvent::Disconnected { error: None }).await;
                    return;
                }
            },
            _ = beat.tick() => TransportEvent::Heartbeat,
            _ = tx.closed() => return,
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
