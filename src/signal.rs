//! Signal envelope protocol
//!
//! Defines the wire shape of call-lifecycle signaling events exchanged
//! between participants, and the history fields attached to the termination
//! event. The payload is a tagged union keyed by `eventType`; terminal-only
//! fields exist only on the `CALL_END` variant, so a malformed mixture
//! (e.g. a request carrying an end report) is unrepresentable.
//!
//! The transport that carries these envelopes is an external collaborator
//! behind the [`SignalingChannel`] trait.
//!
//! # Wire shape
//!
//! ```json
//! { "eventType": "CALL_END",
//!   "conversationId": "...", "callerId": "...", "receiverId": "...",
//!   "roomName": "...", "timestamp": "...",
//!   "startTime": "...", "endTime": "...",
//!   "isVideoCall": false, "wasConnected": true }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallResult;

/// Fields common to every signaling event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalHeader {
    /// Identifier of the parent conversation
    pub conversation_id: String,
    /// The participant that initiated the call
    pub caller_id: String,
    /// The participant that received the call
    pub receiver_id: String,
    /// Identifier of the external media session
    pub room_name: String,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
}

/// The authoritative history record carried only on `CALL_END`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallReport {
    /// When the local side first became aware of the call
    pub start_time: DateTime<Utc>,
    /// When the call terminated
    pub end_time: DateTime<Utc>,
    /// Whether this was a video call
    pub is_video_call: bool,
    /// Whether the call ever reached the connected state
    pub was_connected: bool,
}

impl CallReport {
    /// Call duration; zero when never connected or rejected immediately
    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}

/// A call-lifecycle signaling event
///
/// Tagged by `eventType` on the wire. The `CALL_REQUEST` variant carries the
/// call type so the receiver can ring with the right affordance; the
/// `CALL_END` variant carries the [`CallReport`] used for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum SignalEvent {
    /// A new call is being offered
    #[serde(rename = "CALL_REQUEST")]
    Request {
        #[serde(flatten)]
        header: SignalHeader,
        /// Whether the offered call carries video
        #[serde(rename = "isVideoCall")]
        is_video_call: bool,
    },
    /// The receiver accepted the call
    #[serde(rename = "CALL_ACCEPT")]
    Accept {
        #[serde(flatten)]
        header: SignalHeader,
    },
    /// The receiver rejected the call
    #[serde(rename = "CALL_REJECT")]
    Reject {
        #[serde(flatten)]
        header: SignalHeader,
    },
    /// The call terminated; carries the authoritative history record
    #[serde(rename = "CALL_END")]
    End {
        #[serde(flatten)]
        header: SignalHeader,
        #[serde(flatten)]
        report: CallReport,
    },
}

impl SignalEvent {
    /// The common header of any variant
    pub fn header(&self) -> &SignalHeader {
        match self {
            SignalEvent::Request { header, .. } => header,
            SignalEvent::Accept { header } => header,
            SignalEvent::Reject { header } => header,
            SignalEvent::End { header, .. } => header,
        }
    }

    /// Wire name of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            SignalEvent::Request { .. } => "CALL_REQUEST",
            SignalEvent::Accept { .. } => "CALL_ACCEPT",
            SignalEvent::Reject { .. } => "CALL_REJECT",
            SignalEvent::End { .. } => "CALL_END",
        }
    }

    /// The termination report, present only on `CALL_END`
    pub fn report(&self) -> Option<&CallReport> {
        match self {
            SignalEvent::End { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Outbound half of the signaling transport
///
/// The transport itself (its connection management, reconnects, server
/// routing) is outside this crate; the coordinator only needs a way to emit
/// envelopes. Inbound events are delivered to the coordinator through
/// [`crate::coordinator::CallCoordinator::handle_signal`].
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send one signaling event toward the other participant
    async fn send(&self, event: SignalEvent) -> CallResult<()>;
}
