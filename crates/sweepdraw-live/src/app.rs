// Display session orchestrator.
//
// A single task owns the live view, the presentation state machine and the
// draw service. It multiplexes sync inputs from the connection manager,
// presentation deadlines, operator commands, connection status changes, the
// draw-opening countdown and the periodic payment sweep, and pushes
// `UiUpdate`s for the console.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use sweepdraw_core::allocator::{DrawPolicy, DrawService};
use sweepdraw_core::config::Config;
use sweepdraw_core::connection::ConnectionHandle;
use sweepdraw_core::countdown::CountdownTick;
use sweepdraw_core::db::Database;
use sweepdraw_core::feed::ChangeFeed;
use sweepdraw_core::live_view::LiveView;
use sweepdraw_core::model::{Change, ChangeEvent, PaymentStatus, Slot, SyncInput};
use sweepdraw_core::payments::PaymentWindow;
use sweepdraw_core::presentation::DrawPresentation;
use sweepdraw_core::sync::{StreamDiff, SyncDiff};
use sweepdraw_core::transport::Fetcher;

use crate::protocol::{UiUpdate, UserCommand, WaitingEntry};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// How this display's own writes reach its live view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Writes {
    /// Published on the in-process feed the view is subscribed to.
    #[default]
    LocalFeed,
    /// The view listens to the notifier; resync from the store after a write.
    Resync,
    /// The view reads a remote store this process cannot write to.
    ReadOnly,
}

pub struct AppState {
    pub event_id: String,
    pub view: LiveView,
    pub presentation: DrawPresentation,
    db: Arc<Database>,
    feed: Arc<ChangeFeed>,
    fetcher: Arc<dyn Fetcher>,
    draws: Arc<DrawService>,
    payments: PaymentWindow,
    sweep_interval: Duration,
    connection: ConnectionHandle,
    writes: Writes,
}

impl AppState {
    /// `slots` seeds the view's slot catalog; it is refetched through
    /// `fetcher` when an allocation names a slot the catalog lacks.
    pub fn new(
        config: &Config,
        db: Arc<Database>,
        feed: Arc<ChangeFeed>,
        fetcher: Arc<dyn Fetcher>,
        connection: ConnectionHandle,
        slots: Vec<Slot>,
    ) -> Self {
        let policy = DrawPolicy {
            require_paid: config.draw.require_paid,
        };
        let draws =
            Arc::new(DrawService::new(Arc::clone(&db), policy).with_feed(Arc::clone(&feed)));
        AppState {
            event_id: config.event.id.clone(),
            view: LiveView::new(&config.event.id, slots),
            presentation: DrawPresentation::new(
                config.presentation.clone(),
                config.event.slot_count,
            ),
            db,
            feed,
            fetcher,
            draws,
            payments: PaymentWindow::new(config.payment.window()),
            sweep_interval: config.payment.sweep_interval(),
            connection,
            writes: Writes::default(),
        }
    }

    pub fn with_writes(mut self, writes: Writes) -> Self {
        self.writes = writes;
        self
    }

    /// Make draws reproducible.
    pub fn with_draw_seed(self, seed: u64) -> Self {
        self.draws.reseed(seed);
        self
    }

    fn publish(&self, change: ChangeEvent) {
        self.feed.publish(&self.event_id, change);
    }

    /// Make a completed local write visible to the view.
    fn written(&self) {
        if self.writes == Writes::Resync {
            self.connection.request_resync();
        }
    }

    fn waiting_entries(&self) -> Vec<WaitingEntry> {
        let now = Instant::now();
        self.view
            .waiting()
            .into_iter()
            .map(|p| WaitingEntry {
                participant_id: p.id.clone(),
                display_name: p.display_name.clone(),
                paid: p.payment_status == PaymentStatus::Paid,
                pay_within: self
                    .payments
                    .countdown_for(p)
                    .map(|c| c.remaining_at(now).to_string()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the display session until the operator quits or the command channel
/// closes. The connection is closed and pending reveals are dropped on exit.
pub async fn run(
    mut sync_rx: mpsc::Receiver<SyncInput>,
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    mut countdown_rx: mpsc::Receiver<CountdownTick>,
    ui_tx: mpsc::Sender<UiUpdate>,
    mut state: AppState,
) -> anyhow::Result<()> {
    info!("display session for {} started", state.event_id);

    let mut status_rx = state.connection.watch();
    let mut status_open = true;
    let mut sync_open = true;
    let mut countdown_open = true;

    let mut sweep = interval_at(Instant::now() + state.sweep_interval, state.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            input = sync_rx.recv(), if sync_open => {
                match input {
                    Some(input) => handle_sync(&mut state, input).await,
                    None => {
                        warn!("sync channel closed; live updates stopped");
                        sync_open = false;
                    }
                }
            }

            _ = presentation_due(state.presentation.deadline()) => {
                for event in state.presentation.advance(Instant::now()) {
                    let _ = ui_tx.send(UiUpdate::Presentation(event)).await;
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UserCommand::Quit) => {
                        info!("quit command received");
                        break;
                    }
                    Some(cmd) => {
                        let update = handle_user_command(&mut state, cmd).await;
                        let _ = ui_tx.send(update).await;
                    }
                    None => {
                        info!("command channel closed");
                        break;
                    }
                }
            }

            changed = status_rx.changed(), if status_open => {
                match changed {
                    Ok(()) => {
                        let status = status_rx.borrow_and_update().clone();
                        let _ = ui_tx.send(UiUpdate::Connection(status)).await;
                    }
                    Err(_) => status_open = false,
                }
            }

            tick = countdown_rx.recv(), if countdown_open => {
                match tick {
                    Some(tick) => {
                        let _ = ui_tx.send(UiUpdate::Countdown(tick)).await;
                    }
                    None => countdown_open = false,
                }
            }

            _ = sweep.tick() => {
                if let Some(update) = sweep_payments(&state) {
                    let _ = ui_tx.send(update).await;
                }
            }
        }
    }

    state.presentation.cancel();
    state.connection.close().await;
    info!("display session for {} closed", state.event_id);
    Ok(())
}

async fn presentation_due(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_sync(state: &mut AppState, input: SyncInput) {
    let ingested = state.view.ingest(input);
    if ingested.initial_load_completed {
        info!(
            "initial load: {} participants, {} allocations",
            state.view.participant_count(),
            state.view.allocation_count()
        );
        state.connection.initial_load_complete();
    }

    let mut allocations_added = false;
    for diff in &ingested.diffs {
        match diff {
            StreamDiff::Participant(SyncDiff::Added(p) | SyncDiff::Changed { new: p, .. }) => {
                state.presentation.attach_participant(&p.id, &p.display_name);
            }
            StreamDiff::Allocation(SyncDiff::Added(_)) => allocations_added = true,
            _ => {}
        }
    }

    let now = Instant::now();
    for reveal in ingested.reveals {
        debug!("queueing reveal for allocation {}", reveal.allocation_id);
        state.presentation.enqueue(reveal, now);
    }

    if allocations_added && state.view.has_deferred() {
        refresh_slots(state).await;
    }
}

async fn refresh_slots(state: &mut AppState) {
    match state.fetcher.fetch_slots(&state.event_id).await {
        Ok(slots) => {
            let now = Instant::now();
            for reveal in state.view.refresh_slots(slots) {
                state.presentation.enqueue(reveal, now);
            }
        }
        Err(e) => warn!("failed to refresh slot catalog: {e:#}"),
    }
}

async fn handle_user_command(state: &mut AppState, cmd: UserCommand) -> UiUpdate {
    debug!("operator command: {cmd}");
    if state.writes == Writes::ReadOnly && cmd.is_write() {
        return UiUpdate::Error(format!(
            "`{cmd}` is unavailable: this display reads a remote store and cannot write to it"
        ));
    }
    match cmd {
        UserCommand::DrawNext => match state.draws.draw_next_blocking(&state.event_id).await {
            Ok(outcome) => {
                state.written();
                UiUpdate::Notice(format!(
                    "allocated #{} {} to {}",
                    outcome.slot.number, outcome.slot.name, outcome.participant.display_name
                ))
            }
            Err(e) => UiUpdate::Error(format!("draw failed: {e}")),
        },
        UserCommand::DrawAll => match state.draws.draw_all_blocking(&state.event_id).await {
            Ok(outcome) => {
                state.written();
                UiUpdate::Notice(format!("allocated {} slots", outcome.count()))
            }
            Err(e) => UiUpdate::Error(format!("draw failed: {e}")),
        },
        UserCommand::Join { name } => {
            match state
                .db
                .add_participant(&state.event_id, &name, PaymentStatus::Pending, Utc::now())
            {
                Ok(participant) => {
                    let notice = format!(
                        "{} joined (id {})",
                        participant.display_name, participant.id
                    );
                    state.publish(ChangeEvent::Participant(Change::Insert(participant)));
                    state.written();
                    UiUpdate::Notice(notice)
                }
                Err(e) => UiUpdate::Error(format!("{e:#}")),
            }
        }
        UserCommand::MarkPaid { participant_id } => mark_paid(state, &participant_id),
        UserCommand::Board => UiUpdate::Board {
            entries: state.view.board(),
            waiting: state.waiting_entries(),
        },
        UserCommand::Status => UiUpdate::Status {
            connection: state.connection.status(),
            presentation: state.presentation.snapshot(),
            participants: state.view.participant_count(),
            allocations: state.view.allocation_count(),
        },
        UserCommand::Quit => UiUpdate::Notice("shutting down".to_string()),
    }
}

fn mark_paid(state: &mut AppState, participant_id: &str) -> UiUpdate {
    if let Some(known) = state.view.participant(participant_id) {
        if known.payment_status == PaymentStatus::Expired {
            return UiUpdate::Error(format!(
                "payment window for {} has already closed",
                known.display_name
            ));
        }
    }
    match state.db.set_payment_status(participant_id, PaymentStatus::Paid) {
        Ok(Some(participant)) => {
            let notice = format!("{} marked paid", participant.display_name);
            state.publish(ChangeEvent::Participant(Change::Update(participant)));
            state.written();
            UiUpdate::Notice(notice)
        }
        Ok(None) => UiUpdate::Error(format!("no participant with id {participant_id}")),
        Err(e) => UiUpdate::Error(format!("{e:#}")),
    }
}

fn sweep_payments(state: &AppState) -> Option<UiUpdate> {
    // Expiry is the remote store's business.
    if state.writes == Writes::ReadOnly {
        return None;
    }
    let expired = match state.payments.expire_overdue(
        &state.db,
        Some(state.feed.as_ref()),
        &state.event_id,
        Utc::now(),
    ) {
        Ok(expired) => expired,
        Err(e) => {
            warn!("payment sweep failed: {e:#}");
            return None;
        }
    };
    if expired.is_empty() {
        return None;
    }
    state.written();
    let names: Vec<&str> = expired.iter().map(|p| p.display_name.as_str()).collect();
    Some(UiUpdate::Notice(format!(
        "payment window closed for {}",
        names.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweepdraw_core::config::{DrawConfig, EventConfig, PaymentConfig, WebsocketConfig};
    use sweepdraw_core::connection::{ConnectionManager, SyncSettings};
    use sweepdraw_core::model::Snapshot;
    use sweepdraw_core::presentation::PresentationTimings;

    const EVENT: &str = "unit_cup";

    fn config() -> Config {
        Config {
            event: EventConfig {
                id: EVENT.to_string(),
                name: "Unit Cup".to_string(),
                slot_count: 6,
                draw_at: None,
            },
            draw: DrawConfig::default(),
            sync: SyncSettings::default(),
            presentation: PresentationTimings::default(),
            payment: PaymentConfig::default(),
            websocket: WebsocketConfig::default(),
            db_path: ":memory:".to_string(),
            store: None,
        }
    }

    fn state() -> AppState {
        let config = config();
        let db = Arc::new(Database::open(":memory:").unwrap());
        db.create_event(EVENT, "Unit Cup", 6).unwrap();
        let feed = Arc::new(ChangeFeed::new(config.sync.heartbeat));
        let manager = ConnectionManager::new(feed.clone(), db.clone(), config.sync.clone());
        let (sync_tx, _sync_rx) = mpsc::channel(16);
        let connection = manager.open(EVENT, sync_tx);
        let slots = db.load_slots(EVENT).unwrap();
        AppState::new(&config, db.clone(), feed, db, connection, slots).with_draw_seed(3)
    }

    #[tokio::test]
    async fn join_then_mark_paid() {
        let mut state = state();
        let UiUpdate::Notice(joined) = handle_user_command(
            &mut state,
            UserCommand::Join {
                name: "Ada".into(),
            },
        )
        .await
        else {
            panic!("join should succeed");
        };
        assert!(joined.starts_with("Ada joined"));

        let id = state.db.load_participants(EVENT).unwrap()[0].id.clone();
        assert_eq!(
            mark_paid(&mut state, &id),
            UiUpdate::Notice("Ada marked paid".into())
        );
        assert!(matches!(
            mark_paid(&mut state, "missing"),
            UiUpdate::Error(_)
        ));
    }

    #[tokio::test]
    async fn draw_errors_are_reported_not_raised() {
        let mut state = state();
        let update = handle_user_command(&mut state, UserCommand::DrawNext).await;
        assert_eq!(
            update,
            UiUpdate::Error("draw failed: no participants waiting for a slot".into())
        );
    }

    #[tokio::test]
    async fn read_only_display_refuses_writes() {
        let mut state = state().with_writes(Writes::ReadOnly);
        state
            .db
            .add_participant(EVENT, "Ada", PaymentStatus::Paid, Utc::now())
            .unwrap();

        for cmd in [
            UserCommand::DrawNext,
            UserCommand::DrawAll,
            UserCommand::Join { name: "Grace".into() },
            UserCommand::MarkPaid {
                participant_id: "p1".into(),
            },
        ] {
            let update = handle_user_command(&mut state, cmd).await;
            assert!(
                matches!(&update, UiUpdate::Error(text) if text.contains("cannot write")),
                "unexpected {update:?}"
            );
        }
        assert_eq!(state.db.allocation_count(EVENT).unwrap(), 0);
        assert_eq!(state.db.load_participants(EVENT).unwrap().len(), 1);
        assert!(sweep_payments(&state).is_none());

        assert!(matches!(
            handle_user_command(&mut state, UserCommand::Board).await,
            UiUpdate::Board { .. }
        ));
    }

    #[tokio::test]
    async fn board_lists_every_slot() {
        let mut state = state();
        let update = handle_user_command(&mut state, UserCommand::Board).await;
        let UiUpdate::Board { entries, waiting } = update else {
            panic!("expected board");
        };
        assert_eq!(entries.len(), 6);
        assert!(waiting.is_empty());
    }

    #[tokio::test]
    async fn novel_allocation_is_queued_for_presentation() {
        let mut state = state();
        let p = state
            .db
            .add_participant(EVENT, "Ada", PaymentStatus::Paid, Utc::now())
            .unwrap();
        handle_sync(&mut state, SyncInput::InitialSnapshot(Snapshot::Participants(vec![p]))).await;
        handle_sync(&mut state, SyncInput::InitialSnapshot(Snapshot::Allocations(vec![]))).await;
        assert!(state.view.is_initialized());

        let outcome = state.draws.draw_next(EVENT).unwrap();
        handle_sync(
            &mut state,
            SyncInput::Change(ChangeEvent::Allocation(Change::Insert(outcome.allocation))),
        )
        .await;
        assert!(!state.presentation.is_idle());
        assert!(state.presentation.deadline().is_some());
    }
}
