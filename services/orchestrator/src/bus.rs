//! Per-session event bus.
//!
//! Each open session owns a broadcast channel. Events for a session that is
//! not open are dropped, so components can report progress unconditionally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use emufleet_events::EventEnvelope;
use emufleet_id::SessionId;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1024;

struct Channel {
    tx: broadcast::Sender<EventEnvelope>,
    next_seq: u64,
}

/// Fan-out of progress events to session observers.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<Mutex<HashMap<SessionId, Channel>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<SessionId, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the session's channel. Returns false if it was already open.
    pub fn open(&self, session: SessionId) -> bool {
        let mut channels = self.channels();
        if channels.contains_key(&session) {
            return false;
        }
        let (tx, _) = broadcast::channel(self.capacity);
        channels.insert(session, Channel { tx, next_seq: 1 });
        true
    }

    /// Close the session's channel; subscribers see the stream end.
    pub fn close(&self, session: SessionId) -> bool {
        self.channels().remove(&session).is_some()
    }

    pub fn is_open(&self, session: SessionId) -> bool {
        self.channels().contains_key(&session)
    }

    /// Subscribe to a session's events. `None` if the session is not open.
    pub fn subscribe(&self, session: SessionId) -> Option<broadcast::Receiver<EventEnvelope>> {
        self.channels().get(&session).map(|c| c.tx.subscribe())
    }

    /// Publish an event. Returns its sequence number, or `None` when the
    /// session is not open or the payload does not serialize.
    pub fn emit<P: Serialize>(
        &self,
        session: SessionId,
        event_type: &str,
        payload: &P,
    ) -> Option<u64> {
        let mut channels = self.channels();
        let channel = match channels.get_mut(&session) {
            Some(channel) => channel,
            None => {
                debug!(session_id = %session, event_type, "No open channel, event dropped");
                return None;
            }
        };

        let seq = channel.next_seq;
        let envelope = match EventEnvelope::new(session, seq, event_type, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session_id = %session, event_type, error = %e, "Failed to encode event");
                return None;
            }
        };
        channel.next_seq += 1;

        // No receivers is fine: the observer may not be connected yet.
        let _ = channel.tx.send(envelope);
        debug!(session_id = %session, event_type, seq, "Event emitted");
        Some(seq)
    }
}
