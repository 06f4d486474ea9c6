//! Client-side status of outbound messages and of the queue as a whole.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one outbound message.
///
/// ```text
/// sending ──► sent ──► delivered ──► read
///    │  ▲       ▲          (sent ──► read)
///    ▼  │       │
/// queued ───────┘
///    │
///    ▼
/// failed ──► queued | sending   (explicit resend only)
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutboundStatus {
    Sending,
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundStatus::Sending => "sending",
            OutboundStatus::Queued => "queued",
            OutboundStatus::Sent => "sent",
            OutboundStatus::Delivered => "delivered",
            OutboundStatus::Read => "read",
            OutboundStatus::Failed => "failed",
        }
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: OutboundStatus) -> bool {
        use OutboundStatus::*;
        matches!(
            (self, next),
            (Sending, Sent | Queued | Failed)
                | (Queued, Sending | Sent | Failed)
                | (Sent, Delivered | Read)
                | (Delivered, Read)
                | (Failed, Queued | Sending)
        )
    }
}

impl fmt::Display for OutboundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ambient sync indicator for the whole queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Queue empty.
    Synced,
    /// A drain is running.
    Syncing,
    /// Items remain after the last drain.
    Partial,
    /// No connectivity.
    Offline,
}

#[cfg(test)]
mod tests {
    use super::OutboundStatus::*;

    #[test]
    fn test_happy_path_edges() {
        assert!(Sending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Queued.can_transition_to(Sending));
    }

    #[test]
    fn test_no_regressions() {
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Sent.can_transition_to(Queued));
        assert!(!Read.can_transition_to(Read));
    }

    #[test]
    fn test_failed_only_leaves_by_resend() {
        assert!(Failed.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Sending));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Failed.can_transition_to(Read));
    }
}
