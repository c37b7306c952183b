//! Call aggregate types for the call-session-core library
//!
//! This module contains the data structures the state machine owns for the
//! lifetime of one call session: the call identifier, lifecycle states, call
//! type, and the [`CallSession`] aggregate itself.
//!
//! # The CallSession aggregate
//!
//! A `CallSession` is created on the first user-initiated action
//! (`start_call`) or on the first inbound request signal, and is destroyed
//! only after the termination record has been dispatched. All the mutable
//! flags that coordinate termination live *on this object* rather than in
//! ambient module state, so they are destroyed atomically with the session
//! and a fresh call always starts with a fresh latch.
//!
//! # Examples
//!
//! ```rust
//! use call_session_core::call::{CallSession, CallState, CallType};
//!
//! let call = CallSession::outgoing(
//!     "conv-1".to_string(),
//!     "alice".to_string(),
//!     "bob".to_string(),
//!     CallType::Video,
//! );
//! assert_eq!(call.state(), CallState::Outgoing);
//! assert!(!call.is_incoming());
//! assert!(!call.was_connected());
//!
//! call.mark_connected();
//! assert!(call.was_connected());
//! // First termination claim wins; every later claim is cleanup-only.
//! assert!(call.try_claim_termination());
//! assert!(!call.try_claim_termination());
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a call instance
///
/// A fresh id is minted per call instance. Async continuations capture the id
/// they were started for and compare it against the current slot before
/// applying their result, so a completion belonging to an already-terminated
/// call is discarded instead of leaking into a newer call.
pub type CallId = uuid::Uuid;

/// Lifecycle state of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No call in progress (initial and terminal state)
    Idle,
    /// Local side sent a request and is waiting for accept/reject
    Outgoing,
    /// Remote side sent a request and the local user has not answered yet
    Incoming,
    /// Both sides agreed; media session established or being established
    Connected,
    /// The call was rejected; transient, auto-resolves to `Idle` after a
    /// fixed display delay
    Rejected,
}

impl CallState {
    /// Whether a call in this state occupies the active-call slot
    pub fn is_active(&self) -> bool {
        !matches!(self, CallState::Idle)
    }

    /// Whether termination is meaningful from this state
    pub fn is_terminable(&self) -> bool {
        matches!(
            self,
            CallState::Outgoing | CallState::Incoming | CallState::Connected
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Outgoing => "outgoing",
            CallState::Incoming => "incoming",
            CallState::Connected => "connected",
            CallState::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Whether the call carries video in addition to audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallType {
    /// Audio-only call
    Audio,
    /// Audio + video call. A video call with the camera toggled off stays a
    /// video call for history purposes only if video was ever published; see
    /// the camera toggle protocol.
    Video,
}

impl CallType {
    /// True for [`CallType::Video`]
    pub fn is_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

/// The aggregate the state machine owns for the lifetime of one session
///
/// Identity fields (`conversation_id`, `caller_id`, `receiver_id`,
/// `is_incoming`, `call_type`, `start_time`) are fixed at creation and never
/// recomputed from transient state. `room_name` is assigned exactly once by
/// whichever side first obtains the session token. The termination latch and
/// the connected flag are atomics so concurrent termination triggers resolve
/// without locks.
#[derive(Debug)]
pub struct CallSession {
    /// Unique id of this call instance
    pub id: CallId,
    /// Identifier of the parent conversation (immutable)
    pub conversation_id: String,
    /// Participant who initiated the call (fixed at creation)
    pub caller_id: String,
    /// Participant who received the call (fixed at creation)
    pub receiver_id: String,
    /// Whether the local side is the receiver
    ///
    /// The sole reliable source for "who is the caller" at teardown time.
    /// `state` is symmetric for both parties once connected and must never
    /// be used for attribution.
    is_incoming: bool,
    /// Audio or video call
    pub call_type: CallType,
    /// Wall-clock time the local side first became aware of the call
    ///
    /// Set at request send for the caller, at request receipt for the
    /// receiver. Distinct from the moment the call became connected.
    pub start_time: DateTime<Utc>,

    /// External media-session identifier, assigned once
    room_name: OnceLock<String>,
    /// Current lifecycle state
    state: RwLock<CallState>,
    /// Monotonic "was ever connected" flag; set once, never cleared
    has_ever_connected: AtomicBool,
    /// Connected-elapsed seconds reported by the other context over the bus
    ///
    /// Independent of `has_ever_connected`: the call surface may have
    /// witnessed the connection when this context did not.
    synced_connected_secs: AtomicU64,
    /// Termination latch; the first claimant sends the signal and records
    /// history, everyone else is downgraded to cleanup-only
    termination_claimed: AtomicBool,
    /// Wall-clock time of termination, set exactly once by the latch winner
    end_time: RwLock<Option<DateTime<Utc>>>,
}

impl CallSession {
    /// Create the session for an outgoing call initiated by `local_user_id`
    pub fn outgoing(
        conversation_id: String,
        local_user_id: String,
        other_user_id: String,
        call_type: CallType,
    ) -> Self {
        Self::new(conversation_id, local_user_id, other_user_id, false, call_type)
    }

    /// Create the session for an inbound request from `other_user_id`
    pub fn incoming(
        conversation_id: String,
        other_user_id: String,
        local_user_id: String,
        call_type: CallType,
    ) -> Self {
        Self::new(conversation_id, other_user_id, local_user_id, true, call_type)
    }

    fn new(
        conversation_id: String,
        caller_id: String,
        receiver_id: String,
        is_incoming: bool,
        call_type: CallType,
    ) -> Self {
        let initial = if is_incoming {
            CallState::Incoming
        } else {
            CallState::Outgoing
        };
        Self {
            id: uuid::Uuid::new_v4(),
            conversation_id,
            caller_id,
            receiver_id,
            is_incoming,
            call_type,
            start_time: Utc::now(),
            room_name: OnceLock::new(),
            state: RwLock::new(initial),
            has_ever_connected: AtomicBool::new(false),
            synced_connected_secs: AtomicU64::new(0),
            termination_claimed: AtomicBool::new(false),
            end_time: RwLock::new(None),
        }
    }

    /// Whether the local side is the receiver of this call
    pub fn is_incoming(&self) -> bool {
        self.is_incoming
    }

    /// Current lifecycle state
    pub fn state(&self) -> CallState {
        *self.state.read().expect("call state poisoned")
    }

    /// Transition to a new state, returning the previous one
    pub fn set_state(&self, new_state: CallState) -> CallState {
        let mut state = self.state.write().expect("call state poisoned");
        std::mem::replace(&mut *state, new_state)
    }

    /// Adopt the media-session room name; a no-op if already assigned
    ///
    /// Returns `false` when a *different* name was already assigned, which
    /// callers treat as a signal mismatch.
    pub fn adopt_room_name(&self, room_name: &str) -> bool {
        match self.room_name.set(room_name.to_string()) {
            Ok(()) => true,
            Err(_) => self.room_name.get().map(String::as_str) == Some(room_name),
        }
    }

    /// The media-session room name, if assigned yet
    pub fn room_name(&self) -> Option<&str> {
        self.room_name.get().map(String::as_str)
    }

    /// Record that the session reached `Connected`
    ///
    /// Monotonic: once set this never resets, even if `state` races back to
    /// `Idle` before termination bookkeeping runs.
    pub fn mark_connected(&self) {
        self.has_ever_connected.store(true, Ordering::SeqCst);
    }

    /// Record connected-elapsed seconds observed by the other context
    ///
    /// Fed from the start-time sync bus message; only ever increases.
    pub fn note_connected_elapsed(&self, seconds: u64) {
        self.synced_connected_secs
            .fetch_max(seconds, Ordering::SeqCst);
    }

    /// Whether the call ever reached the connected state
    ///
    /// Three independent observations combined with OR: the local monotonic
    /// flag, the current state, and the elapsed-connected counter synced from
    /// the other context. Any single one can be stale or missed in the
    /// cross-context race, so all three are consulted.
    pub fn was_connected(&self) -> bool {
        self.has_ever_connected.load(Ordering::SeqCst)
            || self.state() == CallState::Connected
            || self.synced_connected_secs.load(Ordering::SeqCst) > 0
    }

    /// Attempt to claim the right to terminate this call
    ///
    /// Atomically sets the latch. Returns `true` for exactly one caller per
    /// call instance; that caller sends the outbound `CALL_END` and records
    /// history. Every other caller must limit itself to local cleanup.
    pub fn try_claim_termination(&self) -> bool {
        !self.termination_claimed.swap(true, Ordering::SeqCst)
    }

    /// Whether termination has already been claimed
    pub fn termination_claimed(&self) -> bool {
        self.termination_claimed.load(Ordering::SeqCst)
    }

    /// Set the termination wall-clock time; first writer wins
    pub fn set_end_time(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let mut end = self.end_time.write().expect("end time poisoned");
        *end.get_or_insert(at)
    }

    /// The termination time, if termination has run
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        *self.end_time.read().expect("end time poisoned")
    }
}
