//! Application session model and quorum policy.

use serde::{Deserialize, Serialize};

use crate::message::{Allocation, AppDefinition, SessionRecord};
use crate::state::SessionStatus;

/// Locally cached view of an application session.
///
/// The relay is the source of truth; this copy is reconciled on every
/// confirmed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSession {
    pub app_session_id: String,
    pub participants: Vec<String>,
    pub weights: Vec<u32>,
    pub quorum: u32,
    pub protocol: String,
    pub allocations: Vec<Allocation>,
    pub status: SessionStatus,
    pub last_session_data: Option<String>,
}

impl AppSession {
    /// A local record for a create request that has been sent but not yet
    /// confirmed. The id is empty until the relay assigns one.
    pub fn pending(definition: &AppDefinition, allocations: Vec<Allocation>) -> Self {
        Self {
            app_session_id: String::new(),
            participants: definition.participants.clone(),
            weights: definition.weights.clone(),
            quorum: definition.quorum,
            protocol: definition.protocol.clone(),
            allocations,
            status: SessionStatus::Pending,
            last_session_data: None,
        }
    }

    /// Map a relay-reported record into the local shape.
    pub fn from_record(record: SessionRecord) -> Self {
        let status = SessionStatus::from_record_status(record.status.as_deref());
        Self {
            app_session_id: record.app_session_id,
            participants: record.participants,
            weights: record.weights,
            quorum: record.quorum.unwrap_or(0),
            protocol: record.protocol.unwrap_or_default(),
            allocations: record.allocations,
            status,
            last_session_data: record.session_data,
        }
    }
}

/// Quorum threshold policy.
///
/// The threshold starts at `ceiling` for a single participant and relaxes
/// toward `floor` as the participant count grows; it never drops below the
/// floor. Both bounds are configuration, not constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    pub floor: u32,
    pub ceiling: u32,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            floor: 60,
            ceiling: 80,
        }
    }
}

impl QuorumPolicy {
    /// The weighted-agreement threshold for a session with `participants`
    /// members. Monotonically non-increasing in the participant count.
    pub fn threshold(&self, participants: usize) -> u32 {
        let n = participants.max(1) as u32;
        let ceiling = self.ceiling.max(self.floor);
        self.floor + (ceiling - self.floor) / n
    }
}

/// Equal weight split across `participants` members, out of 100.
pub fn equal_weights(participants: usize) -> Vec<u32> {
    let n = participants.max(1);
    vec![(100 / n) as u32; participants]
}
