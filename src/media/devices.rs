//! Device selection and acquisition
//!
//! Device selection is owned by an external settings collaborator and only
//! snapshotted here, once per call setup. Acquisition is a small sequential
//! pipeline of fallible steps with early exit on the first success: losing
//! the microphone entirely is a worse outcome than using the wrong device,
//! so no step abandons the chain on failure.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CallError, CallResult};
use crate::media::backend::{LocalTrack, MediaConnection, TrackConstraints, TrackKind};

/// Persisted device preferences, snapshotted at call setup
///
/// `None` for any slot means "system default". The struct is treated as an
/// opaque capability set; invalid device ids degrade gracefully inside the
/// acquisition chain rather than failing setup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSelection {
    /// Preferred audio input device id
    pub microphone: Option<String>,
    /// Preferred audio output device id
    pub speaker: Option<String>,
    /// Preferred video input device id
    pub camera: Option<String>,
}

impl DeviceSelection {
    /// Selection using system defaults everywhere
    pub fn system_defaults() -> Self {
        Self::default()
    }
}

/// Which step of the acquisition chain produced the track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionPath {
    /// The preferred device from the selection snapshot
    Preferred,
    /// The bare system-default device
    Default,
    /// The session's own default-enable path
    BackendDefault,
}

/// Acquire and publish the local microphone
///
/// Fallback chain, each step attempted in sequence:
/// 1. the preferred device from `selection` (ideal request),
/// 2. the system default device,
/// 3. the session's default-enable path.
///
/// Only when all three fail is the error genuine. A permission denial stops
/// the chain immediately: retrying other devices cannot fix a refusal.
pub async fn acquire_microphone(
    connection: &dyn MediaConnection,
    selection: &DeviceSelection,
) -> CallResult<(LocalTrack, AcquisitionPath)> {
    if let Some(device_id) = &selection.microphone {
        match connection
            .publish_track(TrackKind::Audio, TrackConstraints::audio_device(device_id))
            .await
        {
            Ok(track) => {
                debug!("microphone published from preferred device {}", device_id);
                return Ok((track, AcquisitionPath::Preferred));
            }
            Err(err @ CallError::PermissionDenied { .. }) => return Err(err),
            Err(err) => {
                warn!(
                    "preferred microphone {} unavailable ({}), falling back to default",
                    device_id, err
                );
            }
        }
    }

    match connection
        .publish_track(TrackKind::Audio, TrackConstraints::default_audio())
        .await
    {
        Ok(track) => {
            debug!("microphone published from default device");
            return Ok((track, AcquisitionPath::Default));
        }
        Err(err @ CallError::PermissionDenied { .. }) => return Err(err),
        Err(err) => {
            warn!(
                "default microphone unavailable ({}), falling back to session default-enable",
                err
            );
        }
    }

    let track = connection.default_enable_audio().await?;
    debug!("microphone enabled through session default path");
    Ok((track, AcquisitionPath::BackendDefault))
}
