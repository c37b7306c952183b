//! Event surface for call coordination
//!
//! Mirrors the dual surface the coordinator exposes to applications: a
//! broadcast channel of [`CoordinatorEvent`] values for stream-style
//! consumers, and an optional [`CoordinatorEventHandler`] for callback-style
//! consumers. Both receive the same notifications.
//!
//! # Examples
//!
//! ```rust
//! use call_session_core::events::{CoordinatorEvent, CoordinatorEventHandler, IncomingCallInfo, CallTransition};
//! use async_trait::async_trait;
//!
//! struct RingUi;
//!
//! #[async_trait]
//! impl CoordinatorEventHandler for RingUi {
//!     async fn on_incoming_call(&self, info: IncomingCallInfo) {
//!         println!("{} is calling", info.caller_id);
//!     }
//!     async fn on_call_state_changed(&self, transition: CallTransition) {
//!         println!("call is now {}", transition.new_state);
//!     }
//!     async fn on_call_error(&self, error: call_session_core::error::CallError) {
//!         eprintln!("call error: {}", error);
//!     }
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::call::{CallId, CallState, CallType};
use crate::error::CallError;
use crate::signal::CallReport;

/// Details of an inbound call request
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCallInfo {
    /// The local call instance created for the request
    pub call_id: CallId,
    /// Parent conversation
    pub conversation_id: String,
    /// Who is calling
    pub caller_id: String,
    /// Audio or video
    pub call_type: CallType,
    /// When the request was received locally
    pub received_at: DateTime<Utc>,
}

/// A state machine transition
#[derive(Debug, Clone, PartialEq)]
pub struct CallTransition {
    /// The call that transitioned
    pub call_id: CallId,
    /// State after the transition
    pub new_state: CallState,
    /// State before the transition
    pub previous_state: CallState,
    /// What caused it ("remote accept", "local hangup", "surface closed")
    pub reason: String,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

/// Notifications emitted by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// An inbound call request created a new call instance
    IncomingCall(IncomingCallInfo),
    /// The call state machine transitioned
    CallStateChanged(CallTransition),
    /// The call terminated; carries the history report that was recorded
    CallEnded {
        /// The terminated call
        call_id: CallId,
        /// The exactly-once termination record
        report: CallReport,
    },
    /// A user-facing error occurred (permission denial, session setup)
    CallError {
        /// The affected call, if one exists
        call_id: Option<CallId>,
        /// The error
        error: CallError,
    },
}

/// Callback-style consumer of coordinator notifications
#[async_trait]
pub trait CoordinatorEventHandler: Send + Sync {
    /// An inbound request arrived; the application should ring
    async fn on_incoming_call(&self, info: IncomingCallInfo);

    /// The call state machine transitioned
    async fn on_call_state_changed(&self, transition: CallTransition);

    /// A user-facing error occurred
    async fn on_call_error(&self, error: CallError);

    /// The call terminated and its history record was produced
    ///
    /// Default no-op; most applications watch `on_call_state_changed`.
    async fn on_call_ended(&self, _call_id: CallId, _report: CallReport) {}
}
