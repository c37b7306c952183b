//! Media Session Manager
//!
//! Owns the single media-session connection of one call: local track
//! publication, remote track subscription and attachment, live device
//! switching, the camera toggle protocol, and the participant-departure
//! grace period. One manager exists per call and dies with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::CallId;
use crate::error::{CallError, CallResult};
use crate::media::backend::{
    DeviceKind, DeviceService, LocalTrack, MediaBackend, MediaConnection, MediaSessionEvent,
    RemotePublication, RemoteTrack, TrackConstraints, TrackKind, TrackRenderer, VideoConstraints,
};
use crate::media::camera::CameraState;
use crate::media::devices::{acquire_microphone, AcquisitionPath, DeviceSelection};

/// Delay before the third local-preview attach attempt
const PREVIEW_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Notifications the manager raises toward the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum MediaManagerEvent {
    /// A remote participant joined the session
    RemoteJoined {
        /// Participant identity
        identity: String,
    },
    /// A remote participant has been absent for the full grace period
    ///
    /// Transient camera-toggle disconnect/reconnects never reach this; only
    /// a participant still missing when the grace timer fires does.
    RemoteDeparted {
        /// Participant identity
        identity: String,
    },
    /// The media connection dropped
    ///
    /// Does not terminate the call by itself: the coordinator surfaces an
    /// error affordance and leaves the call open for retry or hangup.
    ConnectionLost {
        /// Backend-provided reason
        reason: String,
    },
}

/// Media-session manager for one call
pub struct MediaSessionManager {
    /// The call this manager belongs to
    pub call_id: CallId,
    connection: RwLock<Option<Arc<dyn MediaConnection>>>,
    renderer: Arc<dyn TrackRenderer>,
    device_service: Arc<dyn DeviceService>,
    /// Snapshot of persisted device preferences, read once per call setup
    selection: DeviceSelection,
    video_constraints: VideoConstraints,
    departure_grace: Duration,
    camera: CameraState,
    /// One attachment per (participant identity, track kind)
    attachments: DashMap<(String, TrackKind), String>,
    /// Local camera self-preview attachment
    preview_attachment: Mutex<Option<String>>,
    /// Pending departure timers keyed by participant identity
    departure_timers: DashMap<String, JoinHandle<()>>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<MediaManagerEvent>,
    closed: AtomicBool,
}

impl MediaSessionManager {
    /// Create a manager for one call
    pub fn new(
        call_id: CallId,
        renderer: Arc<dyn TrackRenderer>,
        device_service: Arc<dyn DeviceService>,
        selection: DeviceSelection,
        departure_grace: Duration,
        events_tx: mpsc::UnboundedSender<MediaManagerEvent>,
    ) -> Self {
        Self {
            call_id,
            connection: RwLock::new(None),
            renderer,
            device_service,
            selection,
            video_constraints: VideoConstraints::default(),
            departure_grace,
            camera: CameraState::new(),
            attachments: DashMap::new(),
            preview_attachment: Mutex::new(None),
            departure_timers: DashMap::new(),
            event_pump: Mutex::new(None),
            events_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether this manager has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether local video is currently enabled
    pub fn is_camera_enabled(&self) -> bool {
        self.camera.is_enabled()
    }

    /// The device selection snapshot in effect for this call
    pub fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    async fn connection(&self) -> CallResult<Arc<dyn MediaConnection>> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(CallError::SessionConnectFailed {
                reason: "media session not connected".to_string(),
            })
    }

    /// Connect to the media session and start pumping its events
    ///
    /// A connect failure leaves the call open; the coordinator decides
    /// whether to retry or let the user hang up.
    pub async fn connect(
        self: &Arc<Self>,
        backend: &dyn MediaBackend,
        token: &str,
        room_name: &str,
    ) -> CallResult<()> {
        let (connection, mut events) = backend.connect(token, room_name).await?;
        *self.connection.write().await = Some(connection);
        info!("media session connected for call {} (room {})", self.call_id, room_name);

        let manager = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if manager.is_closed() {
                    break;
                }
                manager.handle_event(event).await;
            }
        });
        *self.event_pump.lock().await = Some(pump);
        Ok(())
    }

    /// Publish the local microphone through the acquisition fallback chain
    pub async fn publish_microphone(&self) -> CallResult<AcquisitionPath> {
        let connection = self.connection().await?;
        self.unpublish_kind(&connection, TrackKind::Audio).await?;
        let (_track, path) = acquire_microphone(connection.as_ref(), &self.selection).await?;
        Ok(path)
    }

    /// Mute or unmute published local audio
    pub async fn set_muted(&self, muted: bool) -> CallResult<()> {
        self.connection().await?.set_muted(muted).await
    }

    /// Switch the microphone to a different device without dropping the call
    pub async fn switch_microphone(&self, device_id: &str) -> CallResult<()> {
        let connection = self.connection().await?;
        self.unpublish_kind(&connection, TrackKind::Audio).await?;
        let override_selection = DeviceSelection {
            microphone: Some(device_id.to_string()),
            ..self.selection.clone()
        };
        acquire_microphone(connection.as_ref(), &override_selection).await?;
        info!("microphone switched to {} for call {}", device_id, self.call_id);
        Ok(())
    }

    /// Enable the camera per the toggle protocol
    ///
    /// The enabled flag flips only after the publish has succeeded. A
    /// concurrent toggle in flight makes this a no-op.
    pub async fn enable_camera(self: &Arc<Self>) -> CallResult<()> {
        if !self.camera.try_begin_toggle() {
            debug!("camera toggle already in flight for call {}", self.call_id);
            return Ok(());
        }
        match self.enable_camera_inner().await {
            Ok(()) => {
                self.camera.finish_toggle(true);
                Ok(())
            }
            Err(err) => {
                // The enabled flag stays untouched on failure.
                self.camera.abort_toggle();
                Err(err)
            }
        }
    }

    async fn enable_camera_inner(self: &Arc<Self>) -> CallResult<()> {
        let connection = self.connection().await?;

        if self.camera.claim_probe() {
            if let Err(err) = self.device_service.probe_permission(DeviceKind::Camera).await {
                self.camera.reset_probe();
                return Err(err);
            }
        }

        // Publishing without unpublishing leaves duplicate tracks on the
        // session, so any existing local video goes first.
        self.unpublish_kind(&connection, TrackKind::Video).await?;

        let constraints =
            TrackConstraints::camera(self.selection.camera.clone(), self.video_constraints);
        let track = connection.publish_track(TrackKind::Video, constraints).await?;
        info!("camera published for call {}", self.call_id);

        // Preview attach point 1: immediately after publish. Points 2 and 3
        // are the LocalTrackPublished event and a short delayed retry; the
        // publish confirmation and the track's readiness for attachment are
        // not guaranteed to coincide.
        self.attach_local_preview(&track).await;
        let manager = Arc::clone(self);
        let retry_track = track.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PREVIEW_RETRY_DELAY).await;
            if !manager.is_closed() {
                manager.attach_local_preview(&retry_track).await;
            }
        });
        Ok(())
    }

    /// Disable the camera
    ///
    /// Unpublishes and stops every local video track. Purely local: no
    /// signal is generated, and a camera-off call stays audio-only for
    /// billing/recording purposes.
    pub async fn disable_camera(&self) -> CallResult<()> {
        if !self.camera.try_begin_toggle() {
            return Ok(());
        }
        let result = async {
            let connection = self.connection().await?;
            self.unpublish_kind(&connection, TrackKind::Video).await?;
            if let Some(attachment) = self.preview_attachment.lock().await.take() {
                self.renderer.detach(&attachment);
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                self.camera.finish_toggle(false);
                info!("camera disabled for call {}", self.call_id);
                Ok(())
            }
            Err(err) => {
                self.camera.abort_toggle();
                Err(err)
            }
        }
    }

    async fn unpublish_kind(
        &self,
        connection: &Arc<dyn MediaConnection>,
        kind: TrackKind,
    ) -> CallResult<()> {
        for track in connection.local_tracks(kind).await {
            connection.unpublish_track(&track).await?;
            debug!("unpublished existing {:?} track {} before republish", kind, track.id);
        }
        Ok(())
    }

    async fn attach_local_preview(&self, track: &LocalTrack) {
        let mut preview = self.preview_attachment.lock().await;
        if let Some(existing) = preview.take() {
            self.renderer.detach(&existing);
        }
        match self.renderer.attach_local_preview(track) {
            Ok(attachment) => *preview = Some(attachment),
            // Best effort: a preview that fails to attach is retried at the
            // other attach points and never fails the toggle.
            Err(err) => debug!("local preview attach failed: {}", err),
        }
    }

    /// Process one backend event
    pub async fn handle_event(self: &Arc<Self>, event: MediaSessionEvent) {
        if self.is_closed() {
            return;
        }
        match event {
            MediaSessionEvent::ParticipantConnected { identity } => {
                self.on_participant_connected(&identity).await;
            }
            MediaSessionEvent::ParticipantDisconnected { identity } => {
                self.on_participant_disconnected(identity).await;
            }
            MediaSessionEvent::TrackPublished { identity, publication } => {
                self.attach_or_subscribe(&identity, publication).await;
            }
            MediaSessionEvent::TrackSubscribed { track } => {
                self.attach_remote(track);
            }
            MediaSessionEvent::LocalTrackPublished { track } => {
                // Preview attach point 2.
                if track.kind == TrackKind::Video {
                    self.attach_local_preview(&track).await;
                }
            }
            MediaSessionEvent::Disconnected { reason } => {
                warn!("media session for call {} disconnected: {}", self.call_id, reason);
                let _ = self.events_tx.send(MediaManagerEvent::ConnectionLost { reason });
            }
        }
    }

    async fn on_participant_connected(self: &Arc<Self>, identity: &str) {
        // A participant re-appearing within the grace window is a transient
        // disconnect (camera toggles look like this); cancel the timer.
        if let Some((_, timer)) = self.departure_timers.remove(identity) {
            timer.abort();
            debug!("participant {} reappeared within grace window", identity);
        } else {
            let _ = self.events_tx.send(MediaManagerEvent::RemoteJoined {
                identity: identity.to_string(),
            });
        }

        let Ok(connection) = self.connection().await else { return };
        for publication in connection.publications(identity).await {
            self.attach_or_subscribe(identity, publication).await;
        }
    }

    async fn attach_or_subscribe(&self, identity: &str, publication: RemotePublication) {
        // A publication existing does not imply its track is ready to render.
        if let Some(track) = publication.track {
            self.attach_remote(track);
            return;
        }
        let Ok(connection) = self.connection().await else { return };
        if let Err(err) = connection.subscribe(&publication.id).await {
            warn!(
                "subscription request for publication {} of {} failed: {}",
                publication.id, identity, err
            );
        }
    }

    /// Attach a remote track, enforcing one attachment per (participant, kind)
    fn attach_remote(&self, track: RemoteTrack) {
        let key = (track.participant.clone(), track.kind);
        if let Some((_, previous)) = self.attachments.remove(&key) {
            // Detach treats "not found" as success; a concurrent cleanup may
            // already have removed the element.
            self.renderer.detach(&previous);
        }
        match self.renderer.attach(&track) {
            Ok(attachment) => {
                debug!("attached {:?} track of {}", track.kind, track.participant);
                self.attachments.insert(key, attachment);
            }
            Err(err) => warn!(
                "attach of {:?} track from {} failed: {}",
                track.kind, track.participant, err
            ),
        }
    }

    async fn on_participant_disconnected(self: &Arc<Self>, identity: String) {
        // Tracks detach immediately; the departure verdict waits.
        self.detach_participant(&identity);

        let manager = Arc::clone(self);
        let timed_identity = identity.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(manager.departure_grace).await;
            if manager.is_closed() {
                return;
            }
            manager.departure_timers.remove(&timed_identity);
            if let Ok(connection) = manager.connection().await {
                if connection.participants().await.iter().any(|p| p == &timed_identity) {
                    debug!("participant {} is back, not treating as departed", timed_identity);
                    return;
                }
            }
            info!("participant {} absent past grace period", timed_identity);
            let _ = manager
                .events_tx
                .send(MediaManagerEvent::RemoteDeparted { identity: timed_identity });
        });

        if let Some(previous) = self.departure_timers.insert(identity, timer) {
            previous.abort();
        }
    }

    fn detach_participant(&self, identity: &str) {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some((_, attachment)) = self.attachments.remove(&(identity.to_string(), kind)) {
                self.renderer.detach(&attachment);
            }
        }
    }

    /// Tear the manager down: cancel timers, detach everything, disconnect
    ///
    /// Idempotent; a second close is a no-op. Completions of operations still
    /// in flight observe the closed flag and discard their results.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.departure_timers.iter() {
            entry.value().abort();
        }
        self.departure_timers.clear();

        for entry in self.attachments.iter() {
            self.renderer.detach(entry.value());
        }
        self.attachments.clear();
        if let Some(preview) = self.preview_attachment.lock().await.take() {
            self.renderer.detach(&preview);
        }

        if let Some(pump) = self.event_pump.lock().await.take() {
            pump.abort();
        }
        if let Some(connection) = self.connection.write().await.take() {
            connection.disconnect().await;
        }
        debug!("media manager for call {} closed", self.call_id);
    }
}
