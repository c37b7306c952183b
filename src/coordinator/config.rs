//! Coordinator configuration
//!
//! Tunables for the call state machine's timers and the device-selection
//! snapshot read from the persisted settings blob. Delays here encode
//! empirically tuned behavior (the departure grace absorbs camera-toggle
//! reconnects) and are parameters, not correctness-critical constants.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::media::DeviceSelection;

/// Current settings key for device selection
const DEVICE_SELECTION_KEY: &str = "mediaDeviceSelection";
/// Historical settings key, still honored for old installs
const LEGACY_DEVICE_SELECTION_KEY: &str = "callDevices";

/// Configuration for a [`crate::coordinator::CallCoordinator`]
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identity of the local user
    pub local_user_id: String,
    /// Display name of the local user, carried in surface launch params
    pub local_user_name: String,
    /// How long the transient `Rejected` state stays visible before the
    /// machine auto-resolves to idle
    pub rejected_display_delay: Duration,
    /// How long a remote participant may be absent before the call ends
    pub departure_grace: Duration,
    /// How often the call-surface liveness poll runs
    pub surface_poll_interval: Duration,
    /// Capacity of the bounded diagnostic log
    pub diagnostic_log_capacity: usize,
}

impl CoordinatorConfig {
    /// Configuration with default timers for the given local user
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            local_user_name: String::new(),
            rejected_display_delay: Duration::from_secs(3),
            departure_grace: Duration::from_secs(5),
            surface_poll_interval: Duration::from_secs(1),
            diagnostic_log_capacity: 100,
        }
    }

    /// Set the local display name
    pub fn with_local_user_name(mut self, name: impl Into<String>) -> Self {
        self.local_user_name = name.into();
        self
    }

    /// Override the rejected-state display delay
    pub fn with_rejected_display_delay(mut self, delay: Duration) -> Self {
        self.rejected_display_delay = delay;
        self
    }

    /// Override the participant-departure grace period
    pub fn with_departure_grace(mut self, grace: Duration) -> Self {
        self.departure_grace = grace;
        self
    }

    /// Override the surface liveness poll interval
    pub fn with_surface_poll_interval(mut self, interval: Duration) -> Self {
        self.surface_poll_interval = interval;
        self
    }
}

/// Read access to the locally persisted settings blob
///
/// The settings store is owned by an external collaborator; the coordinator
/// only snapshots the device selection from it, once per call setup, and
/// never writes back.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// The raw persisted settings, or `None` when nothing is stored
    async fn load(&self) -> Option<serde_json::Value>;
}

/// Extract the device selection from a persisted settings blob
///
/// Two historical key variants are checked, the newer one preferred. Absent
/// or malformed data degrades to system defaults; a bad settings file must
/// never block call setup.
pub fn device_selection_from_settings(settings: Option<&serde_json::Value>) -> DeviceSelection {
    let Some(settings) = settings else {
        return DeviceSelection::system_defaults();
    };
    for key in [DEVICE_SELECTION_KEY, LEGACY_DEVICE_SELECTION_KEY] {
        let Some(raw) = settings.get(key) else { continue };
        match serde_json::from_value::<DeviceSelection>(raw.clone()) {
            Ok(selection) => return selection,
            Err(err) => {
                warn!("device selection under {:?} is malformed: {}", key, err);
            }
        }
    }
    DeviceSelection::system_defaults()
}
