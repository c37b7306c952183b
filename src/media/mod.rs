//! Media session management
//!
//! This module owns the media side of a call: one external media-session
//! connection per call, local track publication (microphone, camera),
//! remote track subscription and rendering attachment, live device
//! switching, and the camera toggle protocol.
//!
//! The underlying media transport is an opaque external service driven
//! through the narrow traits in [`backend`]; everything protocol-shaped
//! (publish-before-unpublish discipline, acquisition fallback, attach
//! invariants, departure grace) lives here.

pub mod backend;
pub mod camera;
pub mod devices;
pub mod manager;

pub use backend::{
    DeviceKind, DeviceService, LocalTrack, MediaBackend, MediaConnection, MediaDeviceInfo,
    MediaSessionEvent, RemotePublication, RemoteTrack, TrackConstraints, TrackKind,
    TrackRenderer, VideoConstraints,
};
pub use camera::CameraState;
pub use devices::{acquire_microphone, AcquisitionPath, DeviceSelection};
pub use manager::{MediaManagerEvent, MediaSessionManager};
