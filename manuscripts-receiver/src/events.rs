//! Status Event Bus: lifecycle notifications for the tray/GUI observer.
//!
//! Events for one session are delivered in emission order. A subscriber that
//! attaches late calls [`EventBus::subscribe_with_snapshot`] to get the list
//! of sessions still in flight together with a live receiver, taken under the
//! same lock so no event falls between the two.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use manuscripts_core::{FailureReason, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{session::SessionState, store::StoredFile};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub state: SessionState,
    pub sender_name: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored: Option<StoredFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Listening {
        address: SocketAddr,
        display_name: String,
    },
    Session(SessionEvent),
    /// Receiver-level problem that may affect every future session.
    Fault { message: String },
    ShuttingDown,
}

#[derive(Debug, Default)]
struct BusState {
    /// Latest event per in-flight session, keyed with its arrival number.
    active: HashMap<SessionId, (u64, SessionEvent)>,
    arrivals: u64,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
    state: Arc<Mutex<BusState>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    pub fn publish(&self, event: StatusEvent) {
        let mut state = self.lock();
        if let StatusEvent::Session(session) = &event {
            if session.state.is_terminal() {
                state.active.remove(&session.session_id);
            } else if let Some(entry) = state.active.get_mut(&session.session_id) {
                entry.1 = session.clone();
            } else {
                let arrival = state.arrivals;
                state.arrivals += 1;
                state
                    .active
                    .insert(session.session_id.clone(), (arrival, session.clone()));
            }
        }
        if self.tx.send(event).is_err() {
            debug!("status event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe_with_snapshot(&self) -> (Vec<SessionEvent>, broadcast::Receiver<StatusEvent>) {
        let state = self.lock();
        let rx = self.tx.subscribe();
        (sorted(&state.active), rx)
    }

    /// Non-terminal sessions, earliest started first.
    pub fn snapshot(&self) -> Vec<SessionEvent> {
        sorted(&self.lock().active)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sorted(active: &HashMap<SessionId, (u64, SessionEvent)>) -> Vec<SessionEvent> {
    let mut sessions: Vec<&(u64, SessionEvent)> = active.values().collect();
    sessions.sort_by_key(|(arrival, _)| *arrival);
    sessions.into_iter().map(|(_, event)| event.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, state: SessionState) -> StatusEvent {
        StatusEvent::Session(SessionEvent {
            session_id: id.to_owned(),
            state,
            sender_name: "Sam".to_owned(),
            file_name: "essay.pdf".to_owned(),
            size_bytes: 10,
            bytes_received: 0,
            reason: None,
            message: None,
            stored: None,
        })
    }

    #[tokio::test]
    async fn late_subscriber_sees_in_flight_sessions() {
        let bus = EventBus::new();
        bus.publish(event("a", SessionState::Handshaking));
        bus.publish(event("b", SessionState::Handshaking));
        bus.publish(event("a", SessionState::Transferring));
        bus.publish(event("b", SessionState::Failed));

        let (snapshot, mut rx) = bus.subscribe_with_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session_id, "a");
        assert_eq!(snapshot[0].state, SessionState::Transferring);

        bus.publish(event("a", SessionState::Finalizing));
        match rx.recv().await.unwrap() {
            StatusEvent::Session(session) => assert_eq!(session.state, SessionState::Finalizing),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_session_order_is_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sequence = [
            SessionState::Handshaking,
            SessionState::Transferring,
            SessionState::Finalizing,
            SessionState::Succeeded,
        ];
        for state in sequence {
            bus.publish(event("a", state));
        }

        for expected in sequence {
            match rx.recv().await.unwrap() {
                StatusEvent::Session(session) => assert_eq!(session.state, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(bus.snapshot().is_empty());
    }

    #[test]
    fn snapshot_lists_sessions_in_start_order() {
        let bus = EventBus::new();
        bus.publish(event("f0", SessionState::Handshaking));
        bus.publish(event("0a", SessionState::Handshaking));
        bus.publish(event("7c", SessionState::Handshaking));
        bus.publish(event("f0", SessionState::Transferring));
        bus.publish(event("0a", SessionState::Failed));

        let ids: Vec<String> = bus.snapshot().into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec!["f0".to_owned(), "7c".to_owned()]);
        assert_eq!(bus.snapshot()[0].state, SessionState::Transferring);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(StatusEvent::ShuttingDown);
        bus.publish(event("a", SessionState::Handshaking));
        assert_eq!(bus.snapshot().len(), 1);
    }
}
