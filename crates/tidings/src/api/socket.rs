//! WebSocket adapter for a conversation subscription.
//!
//! Three loops share one cancellation token: a reader that watches the
//! client, a relay that drains the subscription into a bounded hand-off
//! buffer, and a writer that drains that buffer and keeps the connection
//! alive. Whichever exits first cancels the other two.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use super::state::SocketSettings;
use crate::event::{Broker, Subscriber};

/// Pump the subscription to the socket until either side goes away.
///
/// Returns once all three loops have exited and the subscription is released.
pub async fn serve(
    socket: WebSocket,
    broker: Arc<dyn Broker>,
    sub: Subscriber,
    settings: SocketSettings,
    shutdown: CancellationToken,
) {
    let sub = Arc::new(sub);
    let stop = shutdown.child_token();
    let (sink, stream) = socket.split();
    let (handoff_tx, handoff_rx) = mpsc::channel(settings.handoff_buffer);

    info!("Socket attached to topic {} as {}", sub.topic(), sub.id());

    let reader = tokio::spawn(read_loop(stream, sub.clone(), stop.clone(), settings));
    let relay = tokio::spawn(relay_loop(sub.clone(), handoff_tx, stop.clone()));
    let writer = tokio::spawn(write_loop(sink, handoff_rx, sub.clone(), stop.clone(), settings));

    let (reader, relay, writer) = tokio::join!(reader, relay, writer);
    for (name, result) in [("reader", reader), ("relay", relay), ("writer", writer)] {
        if let Err(e) = result {
            warn!("Socket {} loop for {} failed: {}", name, sub.id(), e);
        }
    }

    if let Err(e) = broker.unsubscribe(&sub).await {
        warn!("Failed to unsubscribe {} from {}: {}", sub.id(), sub.topic(), e);
    }
    sub.close();
    info!("Socket detached from topic {} ({})", sub.topic(), sub.id());
}

/// Watch the client. Inbound content is ignored; a read error, a close
/// frame or a missed pong tears the connection down.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    sub: Arc<Subscriber>,
    stop: CancellationToken,
    settings: SocketSettings,
) {
    let _guard = stop.clone().drop_guard();
    let mut deadline = Instant::now() + settings.pong_wait;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                debug!("No pong from {} within {:?}", sub.id(), settings.pong_wait);
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Pong(_))) => {
                    deadline = Instant::now() + settings.pong_wait;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Client closed socket for {}", sub.id());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket read error for {}: {}", sub.id(), e);
                    break;
                }
            },
        }
    }

    sub.close();
}

/// Move payloads from the subscription into the hand-off buffer.
///
/// A full buffer drops the payload.
async fn relay_loop(sub: Arc<Subscriber>, handoff: mpsc::Sender<String>, stop: CancellationToken) {
    let _guard = stop.clone().drop_guard();

    loop {
        match sub.next_raw(&stop).await {
            Ok(Some(payload)) => match handoff.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("Hand-off buffer full for {}, dropping payload", sub.id());
                }
                Err(TrySendError::Closed(_)) => return,
            },
            Ok(None) => continue,
            Err(_) => return,
        }
    }
}

/// Write relayed payloads and keepalive pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut handoff: mpsc::Receiver<String>,
    sub: Arc<Subscriber>,
    stop: CancellationToken,
    settings: SocketSettings,
) {
    let _guard = stop.clone().drop_guard();
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_period,
        settings.ping_period,
    );

    loop {
        tokio::select! {
            biased;
            _ = sub.exit_signal().cancelled() => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "".into(),
                };
                let _ = timeout(settings.write_wait, sink.send(Message::Close(Some(frame)))).await;
                return;
            }
            _ = stop.cancelled() => return,
            payload = handoff.recv() => {
                let Some(payload) = payload else { return };
                if !write(&mut sink, Message::Text(payload.into()), &settings, &sub).await {
                    return;
                }
            }
            _ = ping.tick() => {
                if !write(&mut sink, Message::Ping(Bytes::new()), &settings, &sub).await {
                    return;
                }
            }
        }
    }
}

/// Send one frame within the write deadline.
async fn write(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    settings: &SocketSettings,
    sub: &Subscriber,
) -> bool {
    match timeout(settings.write_wait, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Socket write failed for {}: {}", sub.id(), e);
            false
        }
        Err(_) => {
            debug!("Socket write to {} timed out", sub.id());
            false
        }
    }
}
