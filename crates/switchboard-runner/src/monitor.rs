//! Fan-out of internal events to monitor dashboards via `GET /events`.

use serde_json::Value;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;

/// Lossy broadcast hub. A stalled or vanished subscriber only loses its own
/// events; other subscribers and the publishers are never disturbed.
pub struct MonitorHub {
    tx: broadcast::Sender<String>,
}

impl MonitorHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// New monitor client subscribes to the stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Connected monitor clients, for `/health`.
    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Push one event to all subscribers. Stamps a timestamp when the
    /// payload has none. Silently drops when nobody is listening.
    pub fn publish(&self, mut event: Value) {
        if let Value::Object(ref mut map) = event {
            map.entry("timestamp")
                .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));
        }
        let _ = self.tx.send(event.to_string());
    }
}

impl Default for MonitorHub {
    fn default() -> Self {
        Self::new()
    }
}
