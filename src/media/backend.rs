//! Opaque media-backend traits
//!
//! The external media-session service (its transport, codecs, and NAT
//! traversal) is outside this crate. These traits are the narrow interface
//! the core drives it through; tests and applications provide the
//! implementations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CallResult;

/// Kinds of physical media devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    /// Audio input
    Microphone,
    /// Audio output
    Speaker,
    /// Video input
    Camera,
}

impl DeviceKind {
    /// Lowercase human-readable name, used in errors and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Microphone => "microphone",
            DeviceKind::Speaker => "speaker",
            DeviceKind::Camera => "camera",
        }
    }
}

/// Kinds of media tracks on the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// A media device reported by the device-enumeration service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    /// Stable device identifier
    pub id: String,
    /// Human-readable label
    pub label: String,
    /// What kind of device this is
    pub kind: DeviceKind,
}

/// Resolution/framerate target for video acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    /// Target framerate
    pub framerate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 30,
        }
    }
}

/// Acquisition request for a local track
///
/// `device_id: Some(..)` asks for a specific device as an *ideal* target
/// (graceful fallback inside the backend); `None` asks for the system
/// default device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackConstraints {
    /// Preferred device, or `None` for the system default
    pub device_id: Option<String>,
    /// Video target; `None` for audio tracks
    pub video: Option<VideoConstraints>,
}

impl TrackConstraints {
    /// Constraints preferring a specific audio device
    pub fn audio_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            video: None,
        }
    }

    /// Constraints for the default audio device
    pub fn default_audio() -> Self {
        Self::default()
    }

    /// Constraints for a camera with the given target
    pub fn camera(device_id: Option<String>, video: VideoConstraints) -> Self {
        Self {
            device_id,
            video: Some(video),
        }
    }
}

/// A track published by the local side
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalTrack {
    /// Backend identifier for the published track
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

/// A remote participant's track publication
///
/// A publication existing does not imply its track is ready to render:
/// `track` is `None` until the backend reports the track available.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePublication {
    /// Backend identifier for the publication
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// The renderable track, if already available
    pub track: Option<RemoteTrack>,
}

/// A remote track ready to be attached to a rendering element
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTrack {
    /// Backend identifier for the track
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Identity of the participant that published it
    pub participant: String,
}

/// Asynchronous notifications from the media connection
#[derive(Debug, Clone, PartialEq)]
pub enum MediaSessionEvent {
    /// A remote participant joined the session
    ParticipantConnected {
        /// Participant identity
        identity: String,
    },
    /// A remote participant left (possibly transiently, see departure grace)
    ParticipantDisconnected {
        /// Participant identity
        identity: String,
    },
    /// A remote publication appeared
    TrackPublished {
        /// Publishing participant
        identity: String,
        /// The new publication
        publication: RemotePublication,
    },
    /// A requested subscription produced a renderable track
    TrackSubscribed {
        /// The now-available track
        track: RemoteTrack,
    },
    /// A local track finished publishing (camera preview hook)
    LocalTrackPublished {
        /// The published track
        track: LocalTrack,
    },
    /// The backend connection dropped
    Disconnected {
        /// Backend-provided reason
        reason: String,
    },
}

/// One established media-session connection
///
/// Exactly one exists per call. All operations are async and cancellable by
/// termination; completions arriving after teardown are discarded by the
/// caller's stale-completion guard.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Acquire a device stream per the constraints and publish it
    async fn publish_track(
        &self,
        kind: TrackKind,
        constraints: TrackConstraints,
    ) -> CallResult<LocalTrack>;

    /// Let the session enable its own default audio path
    ///
    /// Last resort of the microphone acquisition chain, used when both the
    /// preferred and the default device failed to open.
    async fn default_enable_audio(&self) -> CallResult<LocalTrack>;

    /// Unpublish and stop a previously published local track
    async fn unpublish_track(&self, track: &LocalTrack) -> CallResult<()>;

    /// Currently published local tracks of the given kind
    async fn local_tracks(&self, kind: TrackKind) -> Vec<LocalTrack>;

    /// Set whether published local audio is muted
    async fn set_muted(&self, muted: bool) -> CallResult<()>;

    /// Identities of the remote participants currently on the session
    async fn participants(&self) -> Vec<String>;

    /// Known publications of a remote participant
    async fn publications(&self, identity: &str) -> Vec<RemotePublication>;

    /// Request a subscription to a publication whose track is not yet
    /// available; the track arrives later as `TrackSubscribed`
    async fn subscribe(&self, publication_id: &str) -> CallResult<()>;

    /// Tear the connection down
    async fn disconnect(&self);
}

/// Factory for media-session connections
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Connect to the media session identified by `room_name` using `token`
    async fn connect(
        &self,
        token: &str,
        room_name: &str,
    ) -> CallResult<(Arc<dyn MediaConnection>, mpsc::UnboundedReceiver<MediaSessionEvent>)>;
}

/// Device enumeration and permission probing
#[async_trait]
pub trait DeviceService: Send + Sync {
    /// List available devices of a kind
    async fn enumerate(&self, kind: DeviceKind) -> CallResult<Vec<MediaDeviceInfo>>;

    /// One-shot permission probe: acquire then immediately release a device
    /// handle so a clear permission-denied outcome surfaces before any
    /// publish is attempted
    async fn probe_permission(&self, kind: DeviceKind) -> CallResult<()>;
}

/// Rendering seam for attached tracks
///
/// Rendering itself (layout, elements) is out of scope; the manager only
/// needs attach/detach so it can enforce the one-element-per-(participant,
/// kind) invariant. `detach` must treat "not found" as success: a concurrent
/// cleanup path may already have removed the element.
pub trait TrackRenderer: Send + Sync {
    /// Attach a remote track; returns an attachment handle
    fn attach(&self, track: &RemoteTrack) -> CallResult<String>;

    /// Attach a local track as a self-preview; returns an attachment handle
    fn attach_local_preview(&self, track: &LocalTrack) -> CallResult<String>;

    /// Detach a previously created attachment; missing attachments are fine
    fn detach(&self, attachment_id: &str);
}
