//! Server-sent events adapter for a conversation subscription.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::event::{Broker, Subscriber};

/// Events buffered between the subscription pump and the response body.
const EVENT_BUFFER: usize = 100;

/// Stream every payload on the subscription as one `data:` block.
///
/// The pump runs until the client goes away (the response body is dropped),
/// the subscription closes, or `shutdown` fires.
pub fn serve(
    broker: Arc<dyn Broker>,
    sub: Subscriber,
    shutdown: &CancellationToken,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>> + use<>> {
    let stop = shutdown.child_token();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    let pump_stop = stop.clone();
    tokio::spawn(async move {
        loop {
            match sub.next_raw(&pump_stop).await {
                Ok(Some(payload)) => {
                    if tx.send(Event::default().data(payload)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(_) => break,
            }
        }

        if let Err(e) = broker.unsubscribe(&sub).await {
            warn!("Failed to unsubscribe {} from {}: {}", sub.id(), sub.topic(), e);
        }
        debug!("Event stream for {} on {} ended", sub.id(), sub.topic());
    });

    // Dropping the body cancels the pump.
    let guard = stop.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        Ok::<_, Infallible>(event)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
