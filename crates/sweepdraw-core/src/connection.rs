// Connection manager: keeps one live view fed from push subscriptions, with
// polling as a fallback while push is unhealthy.
//
// `ConnectionSupervisor` holds the health/polling decisions as plain state so
// they can be tested without a runtime; `ConnectionManager::open` spawns the
// task that drives it from transport events and timers.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::model::{StreamKind, SyncInput};
use crate::transport::{Fetcher, Subscribed, Subscription, TransportEvent};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Push silence tolerated before a stream counts as unhealthy. Also the
    /// delay between initial load and the earliest possible poll.
    pub grace_window: Duration,
    pub poll_interval: Duration,
    pub health_check: Duration,
    /// Polling without a successful fetch for this long raises `degraded`.
    pub degraded_after: Duration,
    /// Heartbeat cadence for in-process notification endpoints.
    pub heartbeat: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            grace_window: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            health_check: Duration::from_millis(500),
            degraded_after: Duration::from_secs(30),
            heartbeat: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Connected,
    Reconnecting,
    Disconnected,
}

/// Which channel last delivered data for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Push,
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelState {
    pub connectivity: Connectivity,
    pub source: Source,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ChannelState {
    fn default() -> Self {
        ChannelState {
            connectivity: Connectivity::Reconnecting,
            source: Source::Push,
            last_update: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub participants: ChannelState,
    pub allocations: ChannelState,
    pub polling: bool,
    pub degraded: bool,
}

impl ConnectionStatus {
    pub fn channel(&self, stream: StreamKind) -> &ChannelState {
        match stream {
            StreamKind::Participants => &self.participants,
            StreamKind::Allocations => &self.allocations,
        }
    }

    fn channel_mut(&mut self, stream: StreamKind) -> &mut ChannelState {
        match stream {
            StreamKind::Participants => &mut self.participants,
            StreamKind::Allocations => &mut self.allocations,
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor (pure decision logic)
// ---------------------------------------------------------------------------

/// Outcome of a health evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Start,
    Stop,
    Keep,
}

#[derive(Debug, Default, Clone, Copy)]
struct PushHealth {
    transport_connected: bool,
    last_push: Option<Instant>,
    /// Lost the transport at some point; the next `Connected` needs a resync.
    dropped: bool,
}

#[derive(Debug)]
pub struct ConnectionSupervisor {
    settings: SyncSettings,
    status: ConnectionStatus,
    push: [PushHealth; 2],
    initial_loaded: [bool; 2],
    armed_at: Option<Instant>,
    polling_since: Option<Instant>,
    last_poll_success: Option<Instant>,
}

impl ConnectionSupervisor {
    pub fn new(settings: SyncSettings) -> Self {
        ConnectionSupervisor {
            settings,
            status: ConnectionStatus::default(),
            push: [PushHealth::default(); 2],
            initial_loaded: [false; 2],
            armed_at: None,
            polling_since: None,
            last_poll_success: None,
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn initial_loaded(&self, stream: StreamKind) -> bool {
        self.initial_loaded[stream.index()]
    }

    /// The caller finished its initial load. Only the first call counts.
    pub fn arm(&mut self, now: Instant) {
        if self.armed_at.is_none() {
            self.armed_at = Some(now);
        }
    }

    /// Transport reported connected. Returns `true` when the stream had
    /// dropped after its initial load, so missed pushes must be refetched.
    pub fn transport_connected(&mut self, stream: StreamKind, now: Instant) -> bool {
        let i = stream.index();
        let resync = self.push[i].dropped && self.initial_loaded[i];
        self.push[i].dropped = false;
        self.push_received(stream, now);
        resync
    }

    pub fn transport_disconnected(&mut self, stream: StreamKind, error: Option<String>) {
        let health = &mut self.push[stream.index()];
        health.transport_connected = false;
        health.dropped = true;

        let channel = self.status.channel_mut(stream);
        channel.connectivity = Connectivity::Disconnected;
        channel.last_error = Some(error.unwrap_or_else(|| "connection lost".to_string()));
    }

    /// A push delivery or heartbeat arrived.
    pub fn push_received(&mut self, stream: StreamKind, now: Instant) {
        let health = &mut self.push[stream.index()];
        health.transport_connected = true;
        health.last_push = Some(now);

        let channel = self.status.channel_mut(stream);
        channel.connectivity = Connectivity::Connected;
        channel.source = Source::Push;
        channel.last_update = Some(Utc::now());
        channel.last_error = None;
    }

    pub fn initial_fetch_succeeded(&mut self, stream: StreamKind) {
        self.initial_loaded[stream.index()] = true;
        let channel = self.status.channel_mut(stream);
        channel.connectivity = Connectivity::Connected;
        channel.last_update = Some(Utc::now());
        channel.last_error = None;
    }

    pub fn initial_fetch_failed(&mut self, stream: StreamKind, error: String) {
        let channel = self.status.channel_mut(stream);
        channel.connectivity = Connectivity::Disconnected;
        channel.last_error = Some(error);
    }

    pub fn poll_succeeded(&mut self, stream: StreamKind, now: Instant) {
        self.last_poll_success = Some(now);
        let channel = self.status.channel_mut(stream);
        channel.connectivity = Connectivity::Connected;
        channel.source = Source::Poll;
        channel.last_update = Some(Utc::now());
        channel.last_error = None;
    }

    pub fn poll_failed(&mut self, stream: StreamKind, error: String) {
        self.status.channel_mut(stream).last_error = Some(error);
    }

    /// Connected transport and a push seen within the grace window.
    pub fn is_healthy(&self, stream: StreamKind, now: Instant) -> bool {
        let health = &self.push[stream.index()];
        health.transport_connected
            && health
                .last_push
                .is_some_and(|at| now.duration_since(at) <= self.settings.grace_window)
    }

    fn polling_allowed(&self, now: Instant) -> bool {
        self.armed_at
            .is_some_and(|at| now.duration_since(at) >= self.settings.grace_window)
    }

    /// Re-evaluate health and decide whether polling should run.
    pub fn evaluate(&mut self, now: Instant) -> PollDecision {
        let unhealthy = StreamKind::ALL.iter().any(|s| !self.is_healthy(*s, now));
        let should_poll = self.polling_allowed(now) && unhealthy;

        let decision = match (self.status.polling, should_poll) {
            (false, true) => {
                self.status.polling = true;
                self.polling_since = Some(now);
                self.last_poll_success = None;
                PollDecision::Start
            }
            (true, false) => {
                self.status.polling = false;
                self.polling_since = None;
                self.status.degraded = false;
                for stream in StreamKind::ALL {
                    self.status.channel_mut(stream).source = Source::Push;
                }
                PollDecision::Stop
            }
            _ => PollDecision::Keep,
        };

        if let Some(since) = self.polling_since {
            let reference = self.last_poll_success.map_or(since, |ok| ok.max(since));
            let degraded = now.duration_since(reference) >= self.settings.degraded_after;
            if degraded && !self.status.degraded {
                warn!(
                    "no successful poll for {:?}; connectivity degraded",
                    self.settings.degraded_after
                );
            }
            self.status.degraded = degraded;
        }

        decision
    }
}

// ---------------------------------------------------------------------------
// Manager and handle
// ---------------------------------------------------------------------------

enum Control {
    InitialLoadComplete,
    Resync,
    Close,
}

pub struct ConnectionManager {
    subscription: Arc<dyn Subscription>,
    fetcher: Arc<dyn Fetcher>,
    settings: SyncSettings,
}

impl ConnectionManager {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        fetcher: Arc<dyn Fetcher>,
        settings: SyncSettings,
    ) -> Self {
        ConnectionManager {
            subscription,
            fetcher,
            settings,
        }
    }

    /// Start a session for `event_id`. Snapshots and push changes for both
    /// streams are delivered to `sink`. Must be called within a Tokio runtime.
    pub fn open(&self, event_id: &str, sink: mpsc::Sender<SyncInput>) -> ConnectionHandle {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let session = Session {
            event_id: event_id.to_string(),
            subscription: Arc::clone(&self.subscription),
            fetcher: Arc::clone(&self.fetcher),
            settings: self.settings.clone(),
            sink,
            status_tx,
            supervisor: ConnectionSupervisor::new(self.settings.clone()),
            participants: None,
            allocations: None,
            poll: None,
        };
        let task = tokio::spawn(session.run(control_rx));

        ConnectionHandle {
            control: control_tx,
            status: status_rx,
            task: Some(task),
        }
    }
}

/// Owner of a running session. Dropping it aborts the session, which releases
/// its subscriptions and timers.
pub struct ConnectionHandle {
    control: mpsc::Sender<Control>,
    status: watch::Receiver<ConnectionStatus>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn channel_state(&self, stream: StreamKind) -> ChannelState {
        self.status.borrow().channel(stream).clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Signal that the view has applied its initial snapshots. Polling may
    /// start one grace window later.
    pub fn initial_load_complete(&self) {
        let _ = self.control.try_send(Control::InitialLoadComplete);
    }

    /// Refetch both streams and deliver them as snapshots. Used after a write
    /// whose change will not arrive on the push channel.
    pub fn request_resync(&self) {
        let _ = self.control.try_send(Control::Resync);
    }

    /// Stop the session, unsubscribing cleanly.
    pub async fn close(mut self) {
        let _ = self.control.send(Control::Close).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

/// The sync sink was dropped; the session has no one left to feed.
struct SinkClosed;

struct Session {
    event_id: String,
    subscription: Arc<dyn Subscription>,
    fetcher: Arc<dyn Fetcher>,
    settings: SyncSettings,
    sink: mpsc::Sender<SyncInput>,
    status_tx: watch::Sender<ConnectionStatus>,
    supervisor: ConnectionSupervisor,
    participants: Option<Subscribed>,
    allocations: Option<Subscribed>,
    poll: Option<Interval>,
}

impl Session {
    async fn run(mut self, mut control: mpsc::Receiver<Control>) {
        info!("opening live connection for event {}", self.event_id);

        for stream in StreamKind::ALL {
            self.subscribe(stream).await;
        }
        if self.load_initial().await.is_err() {
            self.shutdown().await;
            return;
        }
        self.publish();

        let start = Instant::now();
        let mut health = interval_at(start + self.settings.health_check, self.settings.health_check);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = interval_at(start + self.settings.poll_interval, self.settings.poll_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outcome = tokio::select! {
                ctrl = control.recv() => match ctrl {
                    Some(Control::InitialLoadComplete) => {
                        debug!("initial load complete for event {}", self.event_id);
                        self.supervisor.arm(Instant::now());
                        Ok(())
                    }
                    Some(Control::Resync) => self.resync_loaded().await,
                    Some(Control::Close) | None => break,
                },
                event = next_event(&mut self.participants) => {
                    self.on_transport(StreamKind::Participants, event).await
                }
                event = next_event(&mut self.allocations) => {
                    self.on_transport(StreamKind::Allocations, event).await
                }
                _ = health.tick() => Ok(()),
                _ = retry.tick() => self.retry_pending().await,
                _ = next_tick(&mut self.poll) => self.poll_once().await,
            };

            if outcome.is_err() {
                debug!("sync sink closed; stopping connection for {}", self.event_id);
                break;
            }
            self.reevaluate();
        }

        self.shutdown().await;
    }

    async fn subscribe(&mut self, stream: StreamKind) {
        match self.subscription.subscribe(stream, &self.event_id).await {
            Ok(subscribed) => {
                debug!("subscribed to {stream} (id {})", subscribed.id);
                *self.subscription_slot(stream) = Some(subscribed);
            }
            Err(e) => {
                warn!("failed to subscribe to {stream}: {e:#}");
                self.supervisor
                    .transport_disconnected(stream, Some(format!("{e:#}")));
            }
        }
    }

    async fn load_initial(&mut self) -> Result<(), SinkClosed> {
        for stream in StreamKind::ALL {
            self.fetch_initial(stream).await?;
        }
        Ok(())
    }

    async fn fetch_initial(&mut self, stream: StreamKind) -> Result<(), SinkClosed> {
        match self.fetcher.fetch_all(stream, &self.event_id).await {
            Ok(snapshot) => {
                info!("initial {stream} load: {} records", snapshot.len());
                self.supervisor.initial_fetch_succeeded(stream);
                self.deliver(SyncInput::InitialSnapshot(snapshot)).await
            }
            Err(e) => {
                warn!("initial {stream} fetch failed: {e:#}");
                self.supervisor.initial_fetch_failed(stream, format!("{e:#}"));
                Ok(())
            }
        }
    }

    async fn on_transport(
        &mut self,
        stream: StreamKind,
        event: Option<TransportEvent>,
    ) -> Result<(), SinkClosed> {
        let now = Instant::now();
        match event {
            Some(TransportEvent::Connected) => {
                if self.supervisor.transport_connected(stream, now) {
                    info!("{stream} push reconnected; resyncing");
                    self.resync(stream).await?;
                }
            }
            Some(TransportEvent::Disconnected { error }) => {
                warn!(
                    "{stream} push disconnected: {}",
                    error.as_deref().unwrap_or("no reason given")
                );
                self.supervisor.transport_disconnected(stream, error);
            }
            Some(TransportEvent::Heartbeat) => self.supervisor.push_received(stream, now),
            Some(TransportEvent::Change(change)) => {
                self.supervisor.push_received(stream, now);
                self.deliver(SyncInput::Change(change)).await?;
            }
            None => {
                warn!("{stream} subscription closed by transport");
                *self.subscription_slot(stream) = None;
                self.supervisor
                    .transport_disconnected(stream, Some("subscription closed".to_string()));
            }
        }
        Ok(())
    }

    async fn resync(&mut self, stream: StreamKind) -> Result<(), SinkClosed> {
        match self.fetcher.fetch_all(stream, &self.event_id).await {
            Ok(snapshot) => self.deliver(SyncInput::Snapshot(snapshot)).await,
            Err(e) => {
                warn!("{stream} resync failed: {e:#}");
                self.supervisor.poll_failed(stream, format!("{e:#}"));
                Ok(())
            }
        }
    }

    /// Streams still waiting on their initial load are left to `retry_pending`.
    async fn resync_loaded(&mut self) -> Result<(), SinkClosed> {
        for stream in StreamKind::ALL {
            if self.supervisor.initial_loaded(stream) {
                self.resync(stream).await?;
            }
        }
        Ok(())
    }

    /// Resubscribe lost streams and retry failed initial fetches.
    async fn retry_pending(&mut self) -> Result<(), SinkClosed> {
        for stream in StreamKind::ALL {
            if self.subscription_slot(stream).is_none() {
                self.subscribe(stream).await;
            }
            if !self.supervisor.initial_loaded(stream) {
                self.fetch_initial(stream).await?;
            }
        }
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<(), SinkClosed> {
        for stream in StreamKind::ALL {
            if !self.supervisor.initial_loaded(stream) {
                continue;
            }
            match self.fetcher.fetch_all(stream, &self.event_id).await {
                Ok(snapshot) => {
                    debug!("polled {stream}: {} records", snapshot.len());
                    self.supervisor.poll_succeeded(stream, Instant::now());
                    self.deliver(SyncInput::Snapshot(snapshot)).await?;
                }
                Err(e) => {
                    warn!("{stream} poll failed: {e:#}");
                    self.supervisor.poll_failed(stream, format!("{e:#}"));
                }
            }
        }
        Ok(())
    }

    fn reevaluate(&mut self) {
        match self.supervisor.evaluate(Instant::now()) {
            PollDecision::Start => {
                info!(
                    "push unhealthy; polling every {:?}",
                    self.settings.poll_interval
                );
                // First tick fires immediately.
                let mut poll = interval(self.settings.poll_interval);
                poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.poll = Some(poll);
            }
            PollDecision::Stop => {
                info!("push healthy on both streams; polling stopped");
                self.poll = None;
            }
            PollDecision::Keep => {}
        }
        self.publish();
    }

    fn publish(&self) {
        let status = self.supervisor.status();
        self.status_tx.send_if_modified(|current| {
            if current != status {
                *current = status.clone();
                true
            } else {
                false
            }
        });
    }

    async fn deliver(&self, input: SyncInput) -> Result<(), SinkClosed> {
        self.sink.send(input).await.map_err(|_| SinkClosed)
    }

    fn subscription_slot(&mut self, stream: StreamKind) -> &mut Option<Subscribed> {
        match stream {
            StreamKind::Participants => &mut self.participants,
            StreamKind::Allocations => &mut self.allocations,
        }
    }

    async fn shutdown(&mut self) {
        self.poll = None;
        for stream in StreamKind::ALL {
            if let Some(subscribed) = self.subscription_slot(stream).take() {
                self.subscription.unsubscribe(subscribed.id).await;
            }
        }
        info!("live connection for event {} closed", self.event_id);
    }
}

async fn next_event(subscribed: &mut Option<Subscribed>) -> Option<TransportEvent> {
    match subscribed {
        Some(subscribed) => subscribed.events.recv().await,
        None => future::pending().await,
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => future::pending().await,
    }
}
