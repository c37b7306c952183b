//! Error types for the call-session-core library
//!
//! This module defines the error taxonomy used throughout the crate, plus a
//! bounded diagnostic log that keeps a capped history of recent failures for
//! later debugging without growing unbounded.
//!
//! # Error Categories
//!
//! - **Permission errors** - media device access denied; surfaced to the user
//!   immediately, setup aborts before any signal is sent
//! - **Session-connect errors** - media session connect failures; the call is
//!   left open for manual retry rather than auto-terminated
//! - **Publish/track errors** - per-operation media failures with fallback
//! - **Launch parameter errors** - fatal for the call surface
//! - **Internal errors** - bugs and unexpected states
//!
//! Duplicate/racing termination signals are deliberately *not* represented
//! here: they are absorbed silently by the termination latch and never reach
//! an error path.

use std::collections::VecDeque;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias used throughout the crate
pub type CallResult<T> = Result<T, CallError>;

/// Errors produced by call session coordination
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    /// Media device permission was denied by the user or platform
    #[error("Media permission denied: {device_kind}")]
    PermissionDenied {
        /// The kind of device that was refused ("microphone", "camera")
        device_kind: String,
    },

    /// The requested media device could not be acquired
    #[error("Media device unavailable: {device_id}")]
    DeviceUnavailable {
        /// Identifier of the device that failed to open
        device_id: String,
    },

    /// Connecting to the media session failed
    ///
    /// This does not terminate the call; the caller decides whether to retry
    /// or hang up.
    #[error("Media session connect failed: {reason}")]
    SessionConnectFailed {
        /// Why the connection attempt failed
        reason: String,
    },

    /// Publishing or unpublishing a media track failed
    #[error("Track operation failed: {reason}")]
    TrackOperationFailed {
        /// Why the track operation failed
        reason: String,
    },

    /// Call setup could not complete (token issuance, surface launch)
    #[error("Call setup failed: {reason}")]
    CallSetupFailed {
        /// Why setup failed
        reason: String,
    },

    /// A required call-surface launch parameter is missing or empty
    ///
    /// Fatal for the call surface: it must refuse to start and report this
    /// rather than entering any call state.
    #[error("Missing call data: {field}")]
    MissingLaunchParameter {
        /// Name of the missing field (`token`, `roomName`, `conversationId`)
        field: String,
    },

    /// A launch parameter was present but malformed
    #[error("Invalid launch parameter {field}: {reason}")]
    InvalidLaunchParameter {
        /// Name of the offending field
        field: String,
        /// What was wrong with it
        reason: String,
    },

    /// The operation requires an active call and none exists
    #[error("No active call")]
    NoActiveCall,

    /// A new call cannot start while another occupies the slot
    #[error("Call already in progress")]
    CallAlreadyActive,

    /// An inbound signal did not match the active call
    #[error("Signal does not match active call: {reason}")]
    SignalMismatch {
        /// What failed to match (conversation, caller, room)
        reason: String,
    },

    /// Catch-all for internal invariant violations
    #[error("Internal error: {message}")]
    InternalError {
        /// Description of the violation
        message: String,
    },
}

impl CallError {
    /// Whether this error is transient and worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::SessionConnectFailed { .. } | CallError::CallSetupFailed { .. }
        )
    }

    /// Whether this error should be surfaced to the user
    ///
    /// Only permission denials and session-setup failures reach the user;
    /// everything else is degraded or retried inside the component that hit it.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            CallError::PermissionDenied { .. }
                | CallError::SessionConnectFailed { .. }
                | CallError::CallSetupFailed { .. }
                | CallError::MissingLaunchParameter { .. }
        )
    }
}

/// One entry in the bounded diagnostic log
#[derive(Debug, Clone)]
pub struct DiagnosticEntry {
    /// When the error was recorded
    pub at: DateTime<Utc>,
    /// Operation that was in progress ("publish_video", "token_fetch")
    pub context: String,
    /// The error message
    pub message: String,
}

/// Bounded log of recent errors
///
/// All errors are written here regardless of whether they were surfaced to
/// the user, so later debugging has a trail. The log is a fixed-capacity
/// ring: the oldest entry is dropped when the cap is reached.
#[derive(Debug)]
pub struct DiagnosticLog {
    entries: std::sync::Mutex<VecDeque<DiagnosticEntry>>,
    capacity: usize,
}

impl DiagnosticLog {
    /// Create a log holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record an error under the given operation context
    pub fn record(&self, context: impl Into<String>, error: &CallError) {
        self.record_message(context, error.to_string());
    }

    /// Record a free-form message under the given operation context
    pub fn record_message(&self, context: impl Into<String>, message: impl Into<String>) {
        let mut entries = self.entries.lock().expect("diagnostic log poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(DiagnosticEntry {
            at: Utc::now(),
            context: context.into(),
            message: message.into(),
        });
    }

    /// Snapshot the current entries, oldest first
    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        self.entries
            .lock()
            .expect("diagnostic log poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.entries.lock().expect("diagnostic log poisoned").len()
    }
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(100)
    }
}
