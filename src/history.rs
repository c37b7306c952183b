//! Call history recording
//!
//! Derives the termination record from the state machine's lifecycle and
//! appends it exactly once, at the moment the termination latch is first
//! won. Persistence beyond the produced fields is a collaborator concern
//! behind [`CallHistoryStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::CallSession;
use crate::error::CallResult;
use crate::signal::CallReport;

/// A persisted call-history entry, keyed by conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryEntry {
    /// Conversation the call belonged to
    pub conversation_id: String,
    /// Who initiated the call
    pub caller_id: String,
    /// Who received it
    pub receiver_id: String,
    /// The termination record
    #[serde(flatten)]
    pub report: CallReport,
}

/// Storage collaborator for termination records
#[async_trait]
pub trait CallHistoryStore: Send + Sync {
    /// Append one termination record
    async fn append(&self, entry: CallHistoryEntry) -> CallResult<()>;

    /// Fetch the persisted records for a conversation, oldest first
    async fn for_conversation(&self, conversation_id: &str) -> CallResult<Vec<CallHistoryEntry>>;
}

/// Build the termination record for a call
///
/// `start_time` is the moment of call creation, not of connection, so a
/// never-answered outgoing call still shows when ringing began. A rejected
/// call is a valid terminal outcome: its record has `start_time == end_time`
/// and `was_connected == false` rather than being skipped.
pub fn build_report(call: &CallSession, end_time: DateTime<Utc>) -> CallReport {
    let was_connected = call.was_connected();
    CallReport {
        start_time: call.start_time,
        // Never-connected elapsed time is not call duration; collapse it.
        end_time: if was_connected { end_time } else { call.start_time },
        is_video_call: call.call_type.is_video(),
        was_connected,
    }
}

/// In-memory history store
///
/// Suitable for tests and ephemeral sessions; real persistence lives in an
/// external collaborator.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    entries: tokio::sync::Mutex<Vec<CallHistoryEntry>>,
}

impl InMemoryHistoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all conversations
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl CallHistoryStore for InMemoryHistoryStore {
    async fn append(&self, entry: CallHistoryEntry) -> CallResult<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }

    async fn for_conversation(&self, conversation_id: &str) -> CallResult<Vec<CallHistoryEntry>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}
