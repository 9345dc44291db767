//! Per-user fan-out of provisioning progress to live connections.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use launchpad_common::{ProgressEvent, ProgressFrame};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Frames buffered per connection before new ones are dropped for it.
pub const SINK_CAPACITY: usize = 256;

/// Outbound half of one live connection. The socket task drains the receiver.
pub type Sink = mpsc::Sender<String>;

/// A bounded sink and the receiver its socket task drains.
pub fn sink() -> (Sink, mpsc::Receiver<String>) {
    mpsc::channel(SINK_CAPACITY)
}

type Registry = HashMap<String, HashMap<Uuid, Sink>>;

/// Registry of live connections keyed by user id, then connection id.
///
/// Publishing never fails or blocks. Events for a user with no connections
/// are dropped, and so are events for a connection whose buffer is full.
#[derive(Default)]
pub struct ProgressChannel {
    connections: Mutex<Registry>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, user_id: &str, connection_id: Uuid, sink: Sink) {
        self.lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id, sink);
        tracing::debug!(user_id, %connection_id, "live connection registered");
    }

    pub fn unregister(&self, connection_id: Uuid, user_id: &str) {
        let mut connections = self.lock();
        if let Some(user) = connections.get_mut(user_id) {
            user.remove(&connection_id);
            if user.is_empty() {
                connections.remove(user_id);
            }
        }
        tracing::debug!(user_id, %connection_id, "live connection unregistered");
    }

    /// Send `event` to every connection of `user_id`, pruning closed ones.
    ///
    /// A connection that is not draining keeps its registration but misses
    /// the frame. Returns how many connections the frame was queued for.
    pub fn publish(&self, user_id: &str, event: &ProgressEvent) -> usize {
        let frame = match ProgressFrame::new(event).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(user_id, kind = event.kind(), error = %e, "failed to encode progress frame");
                return 0;
            }
        };

        let mut connections = self.lock();
        let Some(user) = connections.get_mut(user_id) else {
            return 0;
        };

        let mut dead = Vec::new();
        let mut delivered = 0;
        for (id, sink) in user.iter() {
            match sink.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(user_id, connection_id = %id, kind = event.kind(), "live connection is full, dropping frame");
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in &dead {
            user.remove(id);
        }
        if user.is_empty() {
            connections.remove(user_id);
        }
        if !dead.is_empty() {
            tracing::debug!(user_id, pruned = dead.len(), "pruned dead live connections");
        }
        delivered
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.lock().get(user_id).map_or(0, HashMap::len)
    }
}
