//! State automata for the Clearway client.
//!
//! Defines the authentication handshake automaton and the application
//! session lifecycle. Drivers live in `clearway-client`; this module owns
//! the transition tables.

use serde::{Deserialize, Serialize};

/// Authentication handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No attempt in progress.
    Idle,
    /// `auth_request` sent, awaiting the relay's challenge.
    ChallengeRequested,
    /// Challenge received, awaiting the wallet signature.
    ChallengeReceived,
    /// Signed `auth_verify` sent, awaiting confirmation.
    VerifySent,
    /// Handshake complete; lifecycle operations are unblocked.
    Authenticated,
    /// Handshake failed. Retryable: the driver re-arms from here.
    Failed,
}

impl AuthState {
    /// Valid transitions from this state.
    pub fn valid_transitions(&self) -> &'static [AuthState] {
        match self {
            Self::Idle => &[Self::ChallengeRequested],
            Self::ChallengeRequested => &[Self::ChallengeReceived, Self::Failed],
            Self::ChallengeReceived => &[Self::VerifySent, Self::Failed],
            Self::VerifySent => &[Self::Authenticated, Self::Failed],
            Self::Authenticated => &[],
            Self::Failed => &[Self::Idle],
        }
    }

    pub fn can_transition_to(&self, target: AuthState) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

/// Events that drive the authentication automaton.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// `auth_request` handed to the transport.
    ChallengeSent,
    /// Relay challenge arrived.
    ChallengeReceived,
    /// Signed verification payload handed to the transport.
    VerifySent,
    /// Relay confirmed the binding.
    VerifySucceeded,
    /// Signature declined, relay error, or timeout.
    Failed(String),
    /// Re-arm after failure or disconnect.
    Reset,
}

/// Application session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Create request sent; the relay has not yet confirmed an id.
    Pending,
    /// Relay confirmed the session.
    Active,
    /// Relay confirmed the close.
    Closed,
    /// A lifecycle request for this session failed terminally.
    Error,
}

impl SessionStatus {
    pub fn valid_transitions(&self) -> &'static [SessionStatus] {
        match self {
            Self::Pending => &[Self::Active, Self::Error],
            Self::Active => &[Self::Closed, Self::Error],
            Self::Closed => &[],
            Self::Error => &[],
        }
    }

    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    /// Map a relay-reported status string; unknown strings read as active,
    /// since the relay only lists live and closed sessions.
    pub fn from_record_status(status: Option<&str>) -> Self {
        match status {
            Some("closed") => Self::Closed,
            Some("pending") => Self::Pending,
            _ => Self::Active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_happy_path() {
        let mut state = AuthState::Idle;
        for next in [
            AuthState::ChallengeRequested,
            AuthState::ChallengeReceived,
            AuthState::VerifySent,
            AuthState::Authenticated,
        ] {
            assert!(state.can_transition_to(next), "{:?} -> {:?}", state, next);
            state = next;
        }
        assert!(state.is_authenticated());
        assert!(state.valid_transitions().is_empty());
    }

    #[test]
    fn auth_fails_from_any_inflight_state() {
        for state in [
            AuthState::ChallengeRequested,
            AuthState::ChallengeReceived,
            AuthState::VerifySent,
        ] {
            assert!(state.can_transition_to(AuthState::Failed));
        }
        assert!(!AuthState::Idle.can_transition_to(AuthState::Failed));
    }

    #[test]
    fn failed_is_retryable() {
        assert!(AuthState::Failed.can_transition_to(AuthState::Idle));
        assert!(AuthState::Idle.can_transition_to(AuthState::ChallengeRequested));
    }

    #[test]
    fn session_lifecycle() {
        assert!(SessionStatus::Pending.can_transition_to(SessionStatus::Active));
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Closed));
        assert!(!SessionStatus::Closed.can_transition_to(SessionStatus::Active));
        assert!(SessionStatus::Closed.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
    }

    #[test]
    fn record_status_mapping() {
        assert_eq!(
            SessionStatus::from_record_status(Some("closed")),
            SessionStatus::Closed
        );
        assert_eq!(
            SessionStatus::from_record_status(Some("active")),
            SessionStatus::Active
        );
        assert_eq!(
            SessionStatus::from_record_status(None),
            SessionStatus::Active
        );
    }

    #[test]
    fn status_serde_wire_names() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Active).unwrap(),
            "\"active\""
        );
    }
}
