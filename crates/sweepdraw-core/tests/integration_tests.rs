// End-to-end scenarios across the store, change feed, connection manager,
// live view and presentation state machine.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use sweepdraw_core::allocator::{DrawError, DrawPolicy, DrawService};
use sweepdraw_core::connection::{ConnectionHandle, ConnectionManager, SyncSettings};
use sweepdraw_core::db::Database;
use sweepdraw_core::feed::ChangeFeed;
use sweepdraw_core::live_view::LiveView;
use sweepdraw_core::model::{
    Change, ChangeEvent, PaymentStatus, Snapshot, StreamKind, SyncInput,
};
use sweepdraw_core::presentation::{
    DrawPresentation, Phase, PresentationEvent, PresentationTimings, Reveal,
};
use sweepdraw_core::transport::{Fetcher, Subscribed, Subscription, TransportEvent};

const EVENT: &str = "spring_cup";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn joined(minutes: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + chrono::Duration::minutes(minutes)
}

fn seeded_db(participants: &[&str]) -> Arc<Database> {
    let db = Database::open(":memory:").expect("in-memory database should open");
    db.create_event(EVENT, "Spring Cup", 24).unwrap();
    for (i, name) in participants.iter().enumerate() {
        db.add_participant(EVENT, name, PaymentStatus::Paid, joined(i as i64))
            .unwrap();
    }
    Arc::new(db)
}

/// Feed inputs into the view until both initial snapshots have landed, then
/// tell the connection so polling can arm.
async fn finish_initial_load(
    view: &mut LiveView,
    rx: &mut mpsc::Receiver<SyncInput>,
    handle: &ConnectionHandle,
) {
    loop {
        let input = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("initial load timed out")
            .expect("sync channel closed");
        if view.ingest(input).initial_load_completed {
            handle.initial_load_complete();
            return;
        }
    }
}

fn drain_reveals(view: &mut LiveView, rx: &mut mpsc::Receiver<SyncInput>) -> Vec<Reveal> {
    let mut reveals = Vec::new();
    while let Ok(input) = rx.try_recv() {
        reveals.extend(view.ingest(input).reveals);
    }
    reveals
}

/// Push transport driven by the test.
#[derive(Default)]
struct ScriptedTransport {
    senders: Mutex<HashMap<StreamKind, mpsc::Sender<TransportEvent>>>,
}

impl ScriptedTransport {
    async fn send_all(&self, event: TransportEvent) {
        let senders: Vec<_> = self.senders.lock().unwrap().values().cloned().collect();
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    async fn send(&self, stream: StreamKind, event: TransportEvent) {
        let tx = self.senders.lock().unwrap().get(&stream).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl Subscription for ScriptedTransport {
    async fn subscribe(&self, stream: StreamKind, _event_id: &str) -> Result<Subscribed> {
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().insert(stream, tx);
        Ok(Subscribed {
            id: stream.index() as u64,
            events: rx,
        })
    }

    async fn unsubscribe(&self, _id: u64) {}
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bulk_draw_is_presented_once_per_allocation_in_sequence() {
    let db = seeded_db(&["Ada", "Grace", "Linus"]);
    let settings = SyncSettings::default();
    let feed = Arc::new(ChangeFeed::new(settings.heartbeat));
    let manager = ConnectionManager::new(feed.clone(), db.clone(), settings);

    let (tx, mut rx) = mpsc::channel(256);
    let handle = manager.open(EVENT, tx);
    let mut view = LiveView::new(EVENT, db.load_slots(EVENT).unwrap());
    finish_initial_load(&mut view, &mut rx, &handle).await;
    assert_eq!(view.participant_count(), 3);

    let service = DrawService::new(db.clone(), DrawPolicy::default())
        .with_seed(42)
        .with_feed(feed.clone());
    let outcome = service.draw_all(EVENT).unwrap();
    assert_eq!(outcome.count(), 3);

    let mut reveals = Vec::new();
    while reveals.len() < 3 {
        let input = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("push delivery timed out")
            .unwrap();
        reveals.extend(view.ingest(input).reveals);
    }
    let revealed: Vec<&str> = reveals.iter().map(|r| r.allocation_id.as_str()).collect();
    let drawn: Vec<&str> = outcome
        .allocations
        .iter()
        .map(|o| o.allocation.id.as_str())
        .collect();
    assert_eq!(revealed, drawn);
    assert!(reveals.iter().all(|r| r.participant_name.is_some()));

    // A later full fetch carries the same allocations and reveals nothing.
    let snapshot = db.fetch_all(StreamKind::Allocations, EVENT).await.unwrap();
    assert!(view.ingest(SyncInput::Snapshot(snapshot)).reveals.is_empty());

    let t0 = Instant::now();
    let mut presentation = DrawPresentation::new(PresentationTimings::default(), 24);
    for reveal in reveals {
        assert!(presentation.enqueue(reveal, t0));
    }

    let completed = |events: &[PresentationEvent]| {
        events
            .iter()
            .filter(|e| matches!(e, PresentationEvent::CycleCompleted(_)))
            .count()
    };
    let first = presentation.advance(t0 + Duration::from_millis(5_000));
    assert_eq!(completed(&first), 1);
    assert_eq!(presentation.phase(), Phase::Drawing);
    assert_eq!(presentation.snapshot().queued, 1);

    let rest = presentation.advance(t0 + Duration::from_millis(15_000));
    assert_eq!(completed(&rest), 2);
    assert!(presentation.is_idle());

    assert!(view.waiting().is_empty());
    assert_eq!(
        view.board()
            .iter()
            .filter(|entry| entry.participant_id.is_some())
            .count(),
        3
    );

    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn polling_fills_in_while_push_is_silent() {
    let db = seeded_db(&["Ada", "Grace"]);
    let transport = Arc::new(ScriptedTransport::default());
    let manager = ConnectionManager::new(transport.clone(), db.clone(), SyncSettings::default());

    let (tx, mut rx) = mpsc::channel(256);
    let handle = manager.open(EVENT, tx);
    let mut view = LiveView::new(EVENT, db.load_slots(EVENT).unwrap());
    finish_initial_load(&mut view, &mut rx, &handle).await;

    transport.send_all(TransportEvent::Connected).await;
    for _ in 0..3 {
        sleep(Duration::from_secs(1)).await;
        transport.send_all(TransportEvent::Heartbeat).await;
    }
    sleep(Duration::from_millis(100)).await;
    assert!(!handle.status().polling);

    // Draw with no push notification at all.
    let service = DrawService::new(db.clone(), DrawPolicy::default()).with_seed(9);
    let outcome = service.draw_next(EVENT).unwrap();

    sleep(Duration::from_secs(6)).await;
    assert!(handle.status().polling);
    let reveals = drain_reveals(&mut view, &mut rx);
    assert_eq!(reveals.len(), 1);
    assert_eq!(reveals[0].allocation_id, outcome.allocation.id);
    assert_eq!(reveals[0].slot_number, outcome.slot.number);

    // The late push of the same allocation is not presented again.
    transport
        .send(
            StreamKind::Allocations,
            TransportEvent::Change(ChangeEvent::Allocation(Change::Insert(
                outcome.allocation.clone(),
            ))),
        )
        .await;
    transport
        .send(StreamKind::Participants, TransportEvent::Heartbeat)
        .await;
    sleep(Duration::from_millis(10)).await;
    assert!(drain_reveals(&mut view, &mut rx).is_empty());
    assert!(!handle.status().polling);
}

#[tokio::test]
async fn initial_snapshot_reflects_existing_allocations() {
    let db = seeded_db(&["Ada", "Grace", "Linus"]);
    DrawService::new(db.clone(), DrawPolicy::default())
        .with_seed(1)
        .draw_next(EVENT)
        .unwrap();

    let feed = Arc::new(ChangeFeed::new(Duration::from_secs(2)));
    let manager = ConnectionManager::new(feed.clone(), db.clone(), SyncSettings::default());
    let (tx, mut rx) = mpsc::channel(64);
    let handle = manager.open(EVENT, tx);
    let mut view = LiveView::new(EVENT, db.load_slots(EVENT).unwrap());
    finish_initial_load(&mut view, &mut rx, &handle).await;

    assert_eq!(view.allocation_count(), 1);
    let waiting: Vec<&str> = view
        .waiting()
        .iter()
        .map(|p| p.display_name.as_str())
        .collect();
    assert_eq!(waiting, vec!["Grace", "Linus"]);

    // Replays of the initial allocation never produce a reveal.
    let snapshot: Snapshot = db.fetch_all(StreamKind::Allocations, EVENT).await.unwrap();
    assert!(view.ingest(SyncInput::Snapshot(snapshot)).reveals.is_empty());
}

#[test]
fn concurrent_services_never_double_allocate() {
    let names: Vec<String> = (0..16).map(|i| format!("P{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let db = seeded_db(&refs);

    let handles: Vec<_> = (0..4u64)
        .map(|seed| {
            let service = DrawService::new(db.clone(), DrawPolicy::default()).with_seed(seed);
            std::thread::spawn(move || {
                let mut won = 0usize;
                loop {
                    match service.draw_next(EVENT) {
                        Ok(_) => won += 1,
                        Err(DrawError::NoParticipantsWaiting) => return won,
                        Err(e) => panic!("unexpected draw error: {e}"),
                    }
                }
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 16);

    let allocations = db.load_allocations(EVENT).unwrap();
    let slots: HashSet<&str> = allocations.iter().map(|a| a.slot_id.as_str()).collect();
    let participants: HashSet<&str> = allocations
        .iter()
        .map(|a| a.participant_id.as_str())
        .collect();
    assert_eq!(slots.len(), 16);
    assert_eq!(participants.len(), 16);
}
