use std::{net::SocketAddr, time::Instant};

use manuscripts_core::{FailureReason, SessionId, SubmissionRequest};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{events::SessionEvent, store::StoredFile};

/// Per-session lifecycle. Transitions only move forward; `Failed` is
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Handshaking,
    Authenticating,
    Transferring,
    Finalizing,
    Succeeded,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed)
    }

    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Succeeded | Failed, _) => false,
            (_, Failed) => true,
            (Handshaking, Authenticating | Transferring) => true,
            (Authenticating, Transferring) => true,
            (Transferring, Finalizing) => true,
            (Finalizing, Succeeded) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

#[derive(Debug)]
pub struct SubmissionSession {
    id: SessionId,
    request: SubmissionRequest,
    remote: SocketAddr,
    state: SessionState,
    bytes_received: u64,
    started_at: Instant,
    reason: Option<FailureReason>,
    message: Option<String>,
    stored: Option<StoredFile>,
}

impl SubmissionSession {
    pub fn new(request: SubmissionRequest, remote: SocketAddr) -> Self {
        Self {
            id: generate_session_id(),
            request,
            remote,
            state: SessionState::Handshaking,
            bytes_received: 0,
            started_at: Instant::now(),
            reason: None,
            message: None,
            stored: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &SubmissionRequest {
        &self.request
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn record_bytes(&mut self, count: u64) {
        self.bytes_received = self.bytes_received.saturating_add(count);
    }

    pub fn advance(&mut self, next: SessionState) -> Result<SessionEvent, InvalidTransition> {
        if !self.state.can_advance_to(next) || next == SessionState::Failed {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(self.event())
    }

    pub fn succeed(&mut self, stored: StoredFile) -> Result<SessionEvent, InvalidTransition> {
        if !self.state.can_advance_to(SessionState::Succeeded) {
            return Err(InvalidTransition {
                from: self.state,
                to: SessionState::Succeeded,
            });
        }
        self.state = SessionState::Succeeded;
        self.stored = Some(stored);
        Ok(self.event())
    }

    /// `None` when the session already reached a terminal state.
    pub fn fail(&mut self, reason: FailureReason, message: impl Into<String>) -> Option<SessionEvent> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = SessionState::Failed;
        self.reason = Some(reason);
        self.message = Some(message.into());
        Some(self.event())
    }

    pub fn event(&self) -> SessionEvent {
        SessionEvent {
            session_id: self.id.clone(),
            state: self.state,
            sender_name: self.request.sender_name.clone(),
            file_name: self.request.file_name.clone(),
            size_bytes: self.request.size_bytes,
            bytes_received: self.bytes_received,
            reason: self.reason,
            message: self.message.clone(),
            stored: self.stored.clone(),
        }
    }
}

/// 16 hex chars; for correlation only, not a secret.
pub fn generate_session_id() -> SessionId {
    let mut bytes = [0_u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SubmissionSession {
        SubmissionSession::new(
            SubmissionRequest::new("Sam", "essay.pdf", 10),
            "127.0.0.1:5000".parse().unwrap(),
        )
    }

    #[test]
    fn forward_path_with_authentication() {
        let mut s = session();
        s.advance(SessionState::Authenticating).unwrap();
        s.advance(SessionState::Transferring).unwrap();
        s.advance(SessionState::Finalizing).unwrap();
        assert_eq!(s.state(), SessionState::Finalizing);
    }

    #[test]
    fn no_backward_or_skipping_to_success() {
        let mut s = session();
        assert!(s.advance(SessionState::Finalizing).is_err());
        s.advance(SessionState::Transferring).unwrap();
        assert_eq!(
            s.advance(SessionState::Authenticating),
            Err(InvalidTransition {
                from: SessionState::Transferring,
                to: SessionState::Authenticating,
            })
        );
        assert!(s.advance(SessionState::Succeeded).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut s = session();
        let event = s.fail(FailureReason::Timeout, "idle").unwrap();
        assert_eq!(event.reason, Some(FailureReason::Timeout));
        assert!(s.fail(FailureReason::TransportInterrupted, "again").is_none());
        assert!(s.advance(SessionState::Transferring).is_err());
    }

    #[test]
    fn session_ids_are_unique_hex() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
