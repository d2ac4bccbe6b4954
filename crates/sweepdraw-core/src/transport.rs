// Seams between the live view and its data sources: push subscriptions and
// full fetches.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::{ChangeEvent, Slot, Snapshot, StreamKind};

/// Events a push subscription emits for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The notification endpoint accepted the subscription (or came back).
    Connected,
    /// The endpoint went away; deliveries may have been missed.
    Disconnected { error: Option<String> },
    /// Liveness signal with no data.
    Heartbeat,
    Change(ChangeEvent),
}

/// An active push subscription.
pub struct Subscribed {
    pub id: u64,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Push notification endpoint.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn subscribe(&self, stream: StreamKind, event_id: &str) -> Result<Subscribed>;

    /// Release a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: u64);
}

/// Full-fetch access to the backing store.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_all(&self, stream: StreamKind, event_id: &str) -> Result<Snapshot>;

    async fn fetch_slots(&self, event_id: &str) -> Result<Vec<Slot>>;
}
