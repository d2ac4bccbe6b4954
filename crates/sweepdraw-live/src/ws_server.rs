// WebSocket ingress for the change notifier.
//
// An external notifier (a store trigger, webhook relay, ...) connects to the
// local server and pushes JSON envelopes. The server does not interpret them;
// it forwards raw text to `WsFeed`, which parses and routes.

use futures_util::stream::Stream;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    NotifierConnected { addr: String },
    NotifierDisconnected { addr: String },
    /// Raw text frame from the notifier.
    Message(String),
}

/// Accept notifier connections on `127.0.0.1:{port}`, one at a time, until
/// the receiving side of `tx` is dropped.
pub async fn run(port: u16, tx: mpsc::Sender<WsEvent>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    info!("notifier endpoint listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let addr = addr.to_string();

        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake with {addr} failed: {e}");
                continue;
            }
        };
        info!("notifier connected from {addr}");

        if tx
            .send(WsEvent::NotifierConnected { addr: addr.clone() })
            .await
            .is_err()
        {
            break;
        }
        if process_messages(ws_stream, &tx, &addr).await.is_err() {
            break;
        }
        info!("notifier {addr} disconnected");
        if tx
            .send(WsEvent::NotifierDisconnected { addr })
            .await
            .is_err()
        {
            break;
        }
    }

    Ok(())
}

/// Forward one notifier connection's text frames. `Err(())` means the
/// receiver is gone and the server should stop.
pub async fn process_messages<S>(
    ws_stream: WebSocketStream<S>,
    tx: &mpsc::Sender<WsEvent>,
    addr: &str,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Notifiers never expect replies; the write half is dropped.
    let (_write, read) = ws_stream.split();
    process_message_stream(read, tx, addr).await
}

/// Stream-level core of [`process_messages`], testable without sockets.
pub async fn process_message_stream<St>(
    mut stream: St,
    tx: &mpsc::Sender<WsEvent>,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if tx.send(WsEvent::Message(text.to_string())).await.is_err() {
                    return Err(());
                }
            }
            Ok(Message::Close(frame)) => {
                debug!("notifier {addr} closed: {frame:?}");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error from notifier {addr}: {e}");
                break;
            }
        }
    }
    Ok(())
}
