// Push subscriptions backed by the notifier WebSocket.
//
// `WsFeed` turns the server's raw `WsEvent`s into per-subscription
// `TransportEvent`s: notifier connect/disconnect and heartbeats go to every
// subscriber, `CHANGE` messages only to subscribers of the matching event and
// stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sweepdraw_core::model::StreamKind;
use sweepdraw_core::transport::{Subscribed, Subscription, TransportEvent};

use crate::protocol::PushMessage;
use crate::ws_server::WsEvent;

const SUBSCRIBER_BUFFER: usize = 64;

struct Route {
    stream: StreamKind,
    event_id: String,
    tx: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
pub struct WsFeed {
    routes: Mutex<HashMap<u64, Route>>,
    next_id: AtomicU64,
    notifier_connected: AtomicBool,
}

impl WsFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route server events until the server side closes.
    pub fn spawn_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<WsEvent>) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                feed.route(event).await;
            }
            debug!("notifier event channel closed");
            feed.broadcast(TransportEvent::Disconnected {
                error: Some("notifier endpoint stopped".to_string()),
            })
            .await;
        })
    }

    pub fn is_notifier_connected(&self) -> bool {
        self.notifier_connected.load(Ordering::Relaxed)
    }

    pub async fn route(&self, event: WsEvent) {
        match event {
            WsEvent::NotifierConnected { addr } => {
                info!("notifier {addr} online");
                self.notifier_connected.store(true, Ordering::Relaxed);
                self.broadcast(TransportEvent::Connected).await;
            }
            WsEvent::NotifierDisconnected { addr } => {
                self.notifier_connected.store(false, Ordering::Relaxed);
                self.broadcast(TransportEvent::Disconnected {
                    error: Some(format!("notifier {addr} disconnected")),
                })
                .await;
            }
            WsEvent::Message(text) => self.route_message(&text).await,
        }
    }

    async fn route_message(&self, text: &str) {
        let message: PushMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("unparseable notifier message: {e}");
                return;
            }
        };

        match message {
            PushMessage::NotifierConnected(hello) => {
                info!(
                    "notifier identified as {} {}",
                    hello.name,
                    hello.version.as_deref().unwrap_or("")
                );
            }
            PushMessage::Heartbeat(_) => self.broadcast(TransportEvent::Heartbeat).await,
            PushMessage::Change(payload) => {
                let stream = payload.stream;
                let event_id = payload.event_id.clone();
                match payload.into_change_event() {
                    Ok(change) => {
                        let targets = self.senders(|r| r.stream == stream && r.event_id == event_id);
                        if targets.is_empty() {
                            debug!("no subscribers for {stream} of {event_id}");
                        }
                        for tx in targets {
                            let _ = tx.send(TransportEvent::Change(change.clone())).await;
                        }
                    }
                    Err(e) => warn!("dropping notifier change for {event_id}: {e}"),
                }
            }
        }
    }

    async fn broadcast(&self, event: TransportEvent) {
        for tx in self.senders(|_| true) {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Clone out matching senders so no lock is held across a send. Routes
    /// whose receiver is gone are dropped on the way.
    fn senders(&self, matches: impl Fn(&Route) -> bool) -> Vec<mpsc::Sender<TransportEvent>> {
        match self.routes.lock() {
            Ok(mut routes) => {
                prune_closed(&mut routes);
                routes
                    .values()
                    .filter(|r| matches(r))
                    .map(|r| r.tx.clone())
                    .collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self.routes.lock() {
            Ok(mut routes) => {
                prune_closed(&mut routes);
                routes.len()
            }
            Err(_) => 0,
        }
    }
}

/// Forget subscriptions abandoned without `unsubscribe`, e.g. by an aborted
/// session task.
fn prune_closed(routes: &mut HashMap<u64, Route>) {
    routes.retain(|id, route| {
        let open = !route.tx.is_closed();
        if !open {
            debug!("ws subscription {id} abandoned; dropping route");
        }
        open
    });
}

#[async_trait]
impl Subscription for WsFeed {
    async fn subscribe(&self, stream: StreamKind, event_id: &str) -> Result<Subscribed> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, events) = mpsc::channel(SUBSCRIBER_BUFFER);
        if self.is_notifier_connected() {
            let _ = tx.try_send(TransportEvent::Connected);
        }
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| anyhow::anyhow!("subscription table poisoned"))?;
        prune_closed(&mut routes);
        routes.insert(
            id,
            Route {
                stream,
                event_id: event_id.to_string(),
                tx,
            },
        );
        drop(routes);
        debug!("ws subscription {id} for {stream} of {event_id}");
        Ok(Subscribed { id, events })
    }

    async fn unsubscribe(&self, id: u64) {
        if let Ok(mut routes) = self.routes.lock() {
            if routes.remove(&id).is_some() {
                debug!("ws subscription {id} released");
            }
        }
    }
}
