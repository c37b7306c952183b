//! Call-surface launch parameters and liveness
//!
//! The call surface is a detached execution context presenting the live
//! call UI. It is launched with a parameter set whose `token`, `room_name`,
//! and `conversation_id` are hard preconditions: without them the surface
//! must refuse to start and report "missing call data" instead of entering
//! any call state.
//!
//! The surface does not reliably announce its own death (the user can close
//! the OS window without touching the in-app hangup button), so the
//! coordinator polls a [`SurfaceHandle`] for liveness.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::call::{CallState, CallType};
use crate::error::{CallError, CallResult};

/// Parameters the call surface is started with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSurfaceParams {
    /// Media-session access token
    pub token: String,
    /// Media-session room identifier
    pub room_name: String,
    /// Parent conversation
    pub conversation_id: String,
    /// The remote participant
    pub other_user_id: String,
    /// Remote display name
    pub other_user_name: String,
    /// Remote avatar URL, if any
    pub other_user_avatar: Option<String>,
    /// The local participant
    pub current_user_id: String,
    /// Local display name
    pub current_user_name: String,
    /// Local avatar URL, if any
    pub current_user_avatar: Option<String>,
    /// Audio or video
    pub call_type: CallType,
    /// Call state at launch time (`Outgoing`, `Incoming`, or `Connected`)
    pub call_state: CallState,
}

impl CallSurfaceParams {
    /// Enforce the launch preconditions
    ///
    /// Missing `token`, `room_name`, or `conversation_id` is fatal for the
    /// surface; it must show a "missing call data" state with only a close
    /// action rather than attempt a partial connection.
    pub fn validate(&self) -> CallResult<()> {
        for (field, value) in [
            ("token", &self.token),
            ("roomName", &self.room_name),
            ("conversationId", &self.conversation_id),
        ] {
            if value.trim().is_empty() {
                return Err(CallError::MissingLaunchParameter {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    /// The remote avatar as a parsed URL; malformed values degrade to `None`
    pub fn other_avatar_url(&self) -> Option<Url> {
        parse_avatar(self.other_user_avatar.as_deref())
    }

    /// The local avatar as a parsed URL; malformed values degrade to `None`
    pub fn current_avatar_url(&self) -> Option<Url> {
        parse_avatar(self.current_user_avatar.as_deref())
    }
}

fn parse_avatar(raw: Option<&str>) -> Option<Url> {
    let raw = raw?;
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(err) => {
            // Cosmetic field only; a bad avatar never blocks a call.
            tracing::debug!("ignoring malformed avatar url {:?}: {}", raw, err);
            None
        }
    }
}

/// A handle on a launched call surface
///
/// `is_alive` is consulted by the periodic liveness poll; there is no
/// close *event* for an OS-level window close, only this poll.
#[async_trait]
pub trait SurfaceHandle: Send + Sync {
    /// Whether the surface's execution context still exists
    fn is_alive(&self) -> bool;

    /// Close the surface if it is still open; idempotent
    async fn close(&self);
}

/// Collaborator that opens the detached call surface
#[async_trait]
pub trait SurfaceLauncher: Send + Sync {
    /// Launch the call surface with the given parameters
    async fn launch(&self, params: CallSurfaceParams) -> CallResult<Arc<dyn SurfaceHandle>>;
}
