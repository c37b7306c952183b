//! Shared mock collaborators for the integration tests
//!
//! Every external seam the coordinator drives (signaling transport, media
//! backend, device service, renderer, token issuance, settings, surface
//! launcher) gets an in-memory stand-in that records what was done to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use call_session_core::call::CallType;
use call_session_core::coordinator::{
    CallCoordinator, CallSurfaceParams, CoordinatorConfig, PeerInfo, SettingsStore, SurfaceHandle,
    SurfaceLauncher, TokenGrant, TokenService,
};
use call_session_core::error::{CallError, CallResult};
use call_session_core::history::InMemoryHistoryStore;
use call_session_core::media::{
    DeviceKind, DeviceService, LocalTrack, MediaBackend, MediaConnection, MediaDeviceInfo,
    MediaSessionEvent, RemotePublication, RemoteTrack, TrackConstraints, TrackKind, TrackRenderer,
};
use call_session_core::signal::{SignalEvent, SignalHeader, SignalingChannel};

pub const CONVERSATION: &str = "conv-1";
pub const ROOM: &str = "room-1";
pub const LOCAL_USER: &str = "alice";
pub const REMOTE_USER: &str = "bob";

/// Signaling transport that records every outbound event
pub struct RecordingSignaling {
    sent: Mutex<Vec<SignalEvent>>,
}

impl RecordingSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<SignalEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    pub fn last_end_report(&self) -> Option<call_session_core::signal::CallReport> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|e| e.report().cloned())
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&self, event: SignalEvent) -> CallResult<()> {
        self.sent.lock().unwrap().push(event);
        Ok(())
    }
}

/// Media connection whose state the tests can inspect and steer
pub struct MockConnection {
    tracks: Mutex<Vec<LocalTrack>>,
    next_id: AtomicUsize,
    pub publish_attempts: AtomicUsize,
    pub muted: AtomicBool,
    participants: Mutex<Vec<String>>,
    publications: Mutex<HashMap<String, Vec<RemotePublication>>>,
    pub subscriptions: Mutex<Vec<String>>,
    pub disconnected: AtomicBool,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tracks: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            publish_attempts: AtomicUsize::new(0),
            muted: AtomicBool::new(false),
            participants: Mutex::new(Vec::new()),
            publications: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn set_participants(&self, identities: &[&str]) {
        *self.participants.lock().unwrap() =
            identities.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_publications(&self, identity: &str, publications: Vec<RemotePublication>) {
        self.publications
            .lock()
            .unwrap()
            .insert(identity.to_string(), publications);
    }

    pub fn track_count(&self, kind: TrackKind) -> usize {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.kind == kind)
            .count()
    }
}

#[async_trait]
impl MediaConnection for MockConnection {
    async fn publish_track(
        &self,
        kind: TrackKind,
        _constraints: TrackConstraints,
    ) -> CallResult<LocalTrack> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let track = LocalTrack {
            id: format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            kind,
        };
        self.tracks.lock().unwrap().push(track.clone());
        Ok(track)
    }

    async fn default_enable_audio(&self) -> CallResult<LocalTrack> {
        self.publish_track(TrackKind::Audio, TrackConstraints::default_audio())
            .await
    }

    async fn unpublish_track(&self, track: &LocalTrack) -> CallResult<()> {
        self.tracks.lock().unwrap().retain(|t| t.id != track.id);
        Ok(())
    }

    async fn local_tracks(&self, kind: TrackKind) -> Vec<LocalTrack> {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.kind == kind)
            .cloned()
            .collect()
    }

    async fn set_muted(&self, muted: bool) -> CallResult<()> {
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    async fn participants(&self) -> Vec<String> {
        self.participants.lock().unwrap().clone()
    }

    async fn publications(&self, identity: &str) -> Vec<RemotePublication> {
        self.publications
            .lock()
            .unwrap()
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    async fn subscribe(&self, publication_id: &str) -> CallResult<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .push(publication_id.to_string());
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Backend handing out one shared [`MockConnection`]; tests inject session
/// events through it after the coordinator has connected
pub struct MockBackend {
    pub connection: Arc<MockConnection>,
    events: Mutex<Option<mpsc::UnboundedSender<MediaSessionEvent>>>,
    pub connects: AtomicUsize,
    pub fail_connects: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connection: MockConnection::new(),
            events: Mutex::new(None),
            connects: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
        })
    }

    /// Deliver a session event as the backend would
    pub fn inject(&self, event: MediaSessionEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl MediaBackend for MockBackend {
    async fn connect(
        &self,
        _token: &str,
        _room_name: &str,
    ) -> CallResult<(Arc<dyn MediaConnection>, mpsc::UnboundedReceiver<MediaSessionEvent>)> {
        if self.fail_connects.load(Ordering::SeqCst) > 0 {
            self.fail_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(CallError::SessionConnectFailed {
                reason: "backend unreachable".into(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        Ok((Arc::clone(&self.connection) as Arc<dyn MediaConnection>, rx))
    }
}

/// Device service with a switchable camera-permission verdict
pub struct MockDevices {
    pub deny_camera: AtomicBool,
    pub probes: AtomicUsize,
}

impl MockDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny_camera: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DeviceService for MockDevices {
    async fn enumerate(&self, kind: DeviceKind) -> CallResult<Vec<MediaDeviceInfo>> {
        Ok(vec![
            MediaDeviceInfo {
                id: format!("{}-0", kind.as_str()),
                label: format!("Built-in {}", kind.as_str()),
                kind,
            },
            MediaDeviceInfo {
                id: format!("{}-1", kind.as_str()),
                label: format!("USB {}", kind.as_str()),
                kind,
            },
        ])
    }

    async fn probe_permission(&self, kind: DeviceKind) -> CallResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if kind == DeviceKind::Camera && self.deny_camera.load(Ordering::SeqCst) {
            return Err(CallError::PermissionDenied {
                device_kind: kind.as_str().to_string(),
            });
        }
        Ok(())
    }
}

/// Renderer that tracks which attachments are currently live
pub struct MockRenderer {
    live: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    pub attach_calls: AtomicUsize,
}

impl MockRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            attach_calls: AtomicUsize::new(0),
        })
    }

    pub fn live_attachments(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn register(&self, prefix: &str) -> String {
        let id = format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().push(id.clone());
        id
    }
}

impl TrackRenderer for MockRenderer {
    fn attach(&self, track: &RemoteTrack) -> CallResult<String> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.register(&format!("att-{}-{:?}", track.participant, track.kind)))
    }

    fn attach_local_preview(&self, _track: &LocalTrack) -> CallResult<String> {
        Ok(self.register("preview"))
    }

    fn detach(&self, attachment_id: &str) {
        // Missing attachments are fine by contract.
        self.live.lock().unwrap().retain(|a| a != attachment_id);
    }
}

pub struct MockTokens {
    pub fail: AtomicBool,
    pub issued: AtomicUsize,
}

impl MockTokens {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            issued: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenService for MockTokens {
    async fn issue(&self, _conversation_id: &str, _other_user_id: &str) -> CallResult<TokenGrant> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::InternalError {
                message: "token service down".into(),
            });
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(TokenGrant {
            token: "tok-1".into(),
            room_name: ROOM.into(),
        })
    }
}

pub struct MockSettings {
    value: Option<serde_json::Value>,
}

impl MockSettings {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self { value: None })
    }

    pub fn with(value: serde_json::Value) -> Arc<Self> {
        Arc::new(Self { value: Some(value) })
    }
}

#[async_trait]
impl SettingsStore for MockSettings {
    async fn load(&self) -> Option<serde_json::Value> {
        self.value.clone()
    }
}

pub struct MockSurfaceHandle {
    pub alive: AtomicBool,
}

#[async_trait]
impl SurfaceHandle for MockSurfaceHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

pub struct MockLauncher {
    pub current: Mutex<Option<Arc<MockSurfaceHandle>>>,
    pub launches: AtomicUsize,
    pub last_params: Mutex<Option<CallSurfaceParams>>,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(None),
            launches: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        })
    }

    /// Simulate the user closing the OS window; no event is produced, only
    /// the liveness poll can notice
    pub fn kill_surface(&self) {
        if let Some(handle) = self.current.lock().unwrap().as_ref() {
            handle.alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SurfaceLauncher for MockLauncher {
    async fn launch(&self, params: CallSurfaceParams) -> CallResult<Arc<dyn SurfaceHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().unwrap() = Some(params);
        let handle = Arc::new(MockSurfaceHandle {
            alive: AtomicBool::new(true),
        });
        *self.current.lock().unwrap() = Some(Arc::clone(&handle));
        Ok(handle as Arc<dyn SurfaceHandle>)
    }
}

/// A coordinator wired to mocks, plus handles on all of them
pub struct World {
    pub coordinator: Arc<CallCoordinator>,
    pub signaling: Arc<RecordingSignaling>,
    pub backend: Arc<MockBackend>,
    pub devices: Arc<MockDevices>,
    pub renderer: Arc<MockRenderer>,
    pub tokens: Arc<MockTokens>,
    pub history: Arc<InMemoryHistoryStore>,
    pub launcher: Arc<MockLauncher>,
}

impl World {
    pub fn connection(&self) -> &Arc<MockConnection> {
        &self.backend.connection
    }

    pub fn peer(&self) -> PeerInfo {
        PeerInfo {
            user_id: REMOTE_USER.into(),
            display_name: "Bob".into(),
            avatar_url: None,
        }
    }

    /// Header as the remote side would send it for the standard conversation
    pub fn remote_header(&self) -> SignalHeader {
        SignalHeader {
            conversation_id: CONVERSATION.into(),
            caller_id: REMOTE_USER.into(),
            receiver_id: LOCAL_USER.into(),
            room_name: ROOM.into(),
            timestamp: Utc::now(),
        }
    }

    /// Header echoing the local side as caller (accept/reject of our call)
    pub fn echo_header(&self) -> SignalHeader {
        SignalHeader {
            conversation_id: CONVERSATION.into(),
            caller_id: LOCAL_USER.into(),
            receiver_id: REMOTE_USER.into(),
            room_name: ROOM.into(),
            timestamp: Utc::now(),
        }
    }

    /// Start an outgoing audio call and drive it to connected via a remote
    /// accept
    pub async fn connected_outgoing_call(&self) -> call_session_core::call::CallId {
        let call_id = self
            .coordinator
            .start_call(CONVERSATION.into(), self.peer(), CallType::Audio)
            .await
            .unwrap();
        self.coordinator
            .handle_signal(SignalEvent::Accept {
                header: self.echo_header(),
            })
            .await;
        call_id
    }
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Build a world with timers short enough for tests
pub async fn world() -> World {
    init_tracing();
    let signaling = RecordingSignaling::new();
    let backend = MockBackend::new();
    let devices = MockDevices::new();
    let renderer = MockRenderer::new();
    let tokens = MockTokens::new();
    let history = Arc::new(InMemoryHistoryStore::new());
    let launcher = MockLauncher::new();

    let config = CoordinatorConfig::new(LOCAL_USER)
        .with_local_user_name("Alice")
        .with_rejected_display_delay(Duration::from_millis(50))
        .with_departure_grace(Duration::from_millis(100))
        .with_surface_poll_interval(Duration::from_millis(25));

    let coordinator = CallCoordinator::builder(config)
        .with_signaling(Arc::clone(&signaling) as _)
        .with_backend(Arc::clone(&backend) as _)
        .with_device_service(Arc::clone(&devices) as _)
        .with_renderer(Arc::clone(&renderer) as _)
        .with_token_service(Arc::clone(&tokens) as _)
        .with_history(Arc::clone(&history) as Arc<dyn call_session_core::history::CallHistoryStore>)
        .with_settings(MockSettings::empty() as _)
        .with_surface_launcher(Arc::clone(&launcher) as _)
        .build()
        .unwrap();
    coordinator.start().await;

    World {
        coordinator,
        signaling,
        backend,
        devices,
        renderer,
        tokens,
        history,
        launcher,
    }
}
