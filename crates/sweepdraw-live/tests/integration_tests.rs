// Integration tests for the display process.
//
// These drive the app loop and the notifier ingress through the library
// crate's public API, with an in-memory store behind them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

use sweepdraw_core::allocator::{DrawPolicy, DrawService};
use sweepdraw_core::config::{Config, DrawConfig, EventConfig, PaymentConfig, WebsocketConfig};
use sweepdraw_core::connection::{ConnectionManager, SyncSettings};
use sweepdraw_core::db::Database;
use sweepdraw_core::feed::ChangeFeed;
use sweepdraw_core::live_view::LiveView;
use sweepdraw_core::model::PaymentStatus;
use sweepdraw_core::presentation::{PresentationEvent, PresentationTimings};
use sweepdraw_live::app::{self, AppState, Writes};
use sweepdraw_live::protocol::{UiUpdate, UserCommand};
use sweepdraw_live::ws_feed::WsFeed;
use sweepdraw_live::ws_server::{self, WsEvent};

const EVENT: &str = "live_cup";

// ===========================================================================
// Test helpers
// ===========================================================================

fn test_config() -> Config {
    Config {
        event: EventConfig {
            id: EVENT.to_string(),
            name: "Live Cup".to_string(),
            slot_count: 12,
            draw_at: None,
        },
        draw: DrawConfig { require_paid: true },
        sync: SyncSettings::default(),
        presentation: PresentationTimings::default(),
        payment: PaymentConfig::default(),
        websocket: WebsocketConfig::default(),
        db_path: ":memory:".to_string(),
        store: None,
    }
}

fn seeded_db(config: &Config) -> Arc<Database> {
    let db = Database::open(":memory:").unwrap();
    db.create_event(EVENT, &config.event.name, config.event.slot_count)
        .unwrap();
    Arc::new(db)
}

// ===========================================================================
// App loop
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn operator_bulk_draw_is_presented_sequentially() {
    let config = test_config();
    let db = seeded_db(&config);
    db.add_participant(EVENT, "Ada", PaymentStatus::Paid, Utc::now())
        .unwrap();
    db.add_participant(EVENT, "Grace", PaymentStatus::Paid, Utc::now())
        .unwrap();
    // Not drawn: payment is required.
    db.add_participant(EVENT, "Linus", PaymentStatus::Pending, Utc::now())
        .unwrap();

    let feed = Arc::new(ChangeFeed::new(config.sync.heartbeat));
    let manager = ConnectionManager::new(feed.clone(), db.clone(), config.sync.clone());
    let (sync_tx, sync_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (ui_tx, mut ui_rx) = mpsc::channel(1024);
    let (_countdown_tx, countdown_rx) = mpsc::channel(1);

    let connection = manager.open(EVENT, sync_tx);
    let slots = db.load_slots(EVENT).unwrap();
    let state = AppState::new(&config, db.clone(), feed, db.clone(), connection, slots)
        .with_draw_seed(11);
    let app = tokio::spawn(app::run(sync_rx, cmd_rx, countdown_rx, ui_tx, state));

    // Let the initial load land before drawing.
    sleep(Duration::from_millis(100)).await;
    cmd_tx.send(UserCommand::DrawAll).await.unwrap();

    let mut sequence = Vec::new();
    let mut names = Vec::new();
    let mut notices = Vec::new();
    while sequence.iter().filter(|s| **s == "done").count() < 2 {
        let update = timeout(Duration::from_secs(60), ui_rx.recv())
            .await
            .expect("presentation stalled")
            .expect("ui channel closed");
        match update {
            UiUpdate::Presentation(PresentationEvent::CycleStarted(reveal)) => {
                sequence.push("start");
                names.push(reveal.participant_name.clone().unwrap_or_default());
            }
            UiUpdate::Presentation(PresentationEvent::CycleCompleted(_)) => sequence.push("done"),
            UiUpdate::Notice(text) => notices.push(text),
            _ => {}
        }
    }

    assert_eq!(sequence, vec!["start", "done", "start", "done"]);
    names.sort();
    assert_eq!(names, vec!["Ada", "Grace"]);
    assert!(notices.iter().any(|n| n == "allocated 2 slots"));
    assert_eq!(db.allocation_count(EVENT).unwrap(), 2);

    cmd_tx.send(UserCommand::Quit).await.unwrap();
    app.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn join_and_pay_flow_through_the_live_view() {
    let config = test_config();
    let db = seeded_db(&config);
    let feed = Arc::new(ChangeFeed::new(config.sync.heartbeat));
    let manager = ConnectionManager::new(feed.clone(), db.clone(), config.sync.clone());
    let (sync_tx, sync_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (ui_tx, mut ui_rx) = mpsc::channel(1024);
    let (_countdown_tx, countdown_rx) = mpsc::channel(1);

    let connection = manager.open(EVENT, sync_tx);
    let slots = db.load_slots(EVENT).unwrap();
    let state = AppState::new(&config, db.clone(), feed, db.clone(), connection, slots);
    let app = tokio::spawn(app::run(sync_rx, cmd_rx, countdown_rx, ui_tx, state));
    sleep(Duration::from_millis(100)).await;

    cmd_tx
        .send(UserCommand::Join {
            name: "Ada".into(),
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    let id = db.load_participants(EVENT).unwrap()[0].id.clone();
    cmd_tx
        .send(UserCommand::MarkPaid {
            participant_id: id.clone(),
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    cmd_tx.send(UserCommand::Board).await.unwrap();

    let waiting = loop {
        let update = timeout(Duration::from_secs(10), ui_rx.recv())
            .await
            .expect("no board")
            .expect("ui channel closed");
        if let UiUpdate::Board { waiting, .. } = update {
            break waiting;
        }
    };
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].participant_id, id);
    assert!(waiting[0].paid);
    assert_eq!(waiting[0].pay_within, None);

    cmd_tx.send(UserCommand::Quit).await.unwrap();
    app.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn local_draw_shows_up_while_listening_to_the_notifier() {
    let config = test_config();
    let db = seeded_db(&config);
    db.add_participant(EVENT, "Ada", PaymentStatus::Paid, Utc::now())
        .unwrap();

    // The notifier never announces this process's own writes.
    let ws_feed = Arc::new(WsFeed::new());
    let feed = Arc::new(ChangeFeed::new(config.sync.heartbeat));
    let manager = ConnectionManager::new(ws_feed, db.clone(), config.sync.clone());
    let (sync_tx, sync_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (ui_tx, mut ui_rx) = mpsc::channel(1024);
    let (_countdown_tx, countdown_rx) = mpsc::channel(1);

    let connection = manager.open(EVENT, sync_tx);
    let slots = db.load_slots(EVENT).unwrap();
    let state = AppState::new(&config, db.clone(), feed, db.clone(), connection, slots)
        .with_writes(Writes::Resync)
        .with_draw_seed(2);
    let app = tokio::spawn(app::run(sync_rx, cmd_rx, countdown_rx, ui_tx, state));
    sleep(Duration::from_millis(100)).await;

    cmd_tx.send(UserCommand::DrawNext).await.unwrap();

    // Well inside the polling grace window.
    let reveal = timeout(Duration::from_secs(1), async {
        loop {
            match ui_rx.recv().await {
                Some(UiUpdate::Presentation(PresentationEvent::CycleStarted(reveal))) => {
                    break reveal
                }
                Some(_) => {}
                None => panic!("ui channel closed"),
            }
        }
    })
    .await
    .expect("own draw never reached the view");
    assert_eq!(reveal.participant_name.as_deref(), Some("Ada"));

    cmd_tx.send(UserCommand::Quit).await.unwrap();
    app.await.unwrap().unwrap();
}

// ===========================================================================
// Notifier ingress
// ===========================================================================

#[tokio::test]
async fn notifier_change_reaches_the_live_view_as_a_reveal() {
    let config = test_config();
    let db = seeded_db(&config);
    db.add_participant(EVENT, "Ada", PaymentStatus::Paid, Utc::now())
        .unwrap();

    let ws_feed = Arc::new(WsFeed::new());
    let (ws_tx, ws_rx) = mpsc::channel(64);
    let pump = ws_feed.spawn_pump(ws_rx);

    let manager = ConnectionManager::new(ws_feed.clone(), db.clone(), config.sync.clone());
    let (sync_tx, mut sync_rx) = mpsc::channel(64);
    let handle = manager.open(EVENT, sync_tx);
    let mut view = LiveView::new(EVENT, db.load_slots(EVENT).unwrap());

    loop {
        let input = timeout(Duration::from_secs(5), sync_rx.recv())
            .await
            .unwrap()
            .unwrap();
        if view.ingest(input).initial_load_completed {
            handle.initial_load_complete();
            break;
        }
    }

    ws_tx
        .send(WsEvent::NotifierConnected {
            addr: "127.0.0.1:40000".into(),
        })
        .await
        .unwrap();

    // A draw made elsewhere, announced only by the notifier.
    let outcome = DrawService::new(db.clone(), DrawPolicy::default())
        .with_seed(5)
        .draw_next(EVENT)
        .unwrap();
    let frame = serde_json::json!({
        "type": "CHANGE",
        "payload": {
            "event_id": EVENT,
            "stream": "allocations",
            "op": "insert",
            "record": serde_json::to_value(&outcome.allocation).unwrap(),
        }
    })
    .to_string();
    let frames = stream::iter(vec![
        Ok(Message::Text(
            r#"{"type":"HEARTBEAT","payload":{"timestamp":1}}"#.into(),
        )),
        Ok(Message::Text(frame.into())),
    ]);
    ws_server::process_message_stream(frames, &ws_tx, "127.0.0.1:40000")
        .await
        .unwrap();

    let reveal = loop {
        let input = timeout(Duration::from_secs(5), sync_rx.recv())
            .await
            .expect("change never arrived")
            .unwrap();
        if let Some(reveal) = view.ingest(input).reveals.into_iter().next() {
            break reveal;
        }
    };
    assert_eq!(reveal.allocation_id, outcome.allocation.id);
    assert_eq!(reveal.slot_number, outcome.slot.number);
    assert_eq!(reveal.participant_name.as_deref(), Some("Ada"));
    assert!(ws_feed.is_notifier_connected());

    handle.close().await;
    drop(ws_tx);
    pump.await.unwrap();
}
