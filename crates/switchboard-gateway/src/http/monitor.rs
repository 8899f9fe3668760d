//! GET /events - SSE fan-out of everything the gateway sees internally:
//! run lifecycle, tool usage, compaction, deploy notifications.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;

use switchboard_runner::Engine;

pub async fn events_handler(
    State(engine): State<Arc<Engine>>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = engine.monitor.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().data(
            json!({
                "type": "connected",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })
            .to_string(),
        ));
        loop {
            match rx.recv().await {
                Ok(msg) => yield Ok(Event::default().data(msg)),
                // A slow consumer skips what it missed; the stream goes on.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
