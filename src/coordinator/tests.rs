//! Coordinator state-machine tests
//!
//! Exercise the slot discipline, inbound signal filtering, and setup
//! rollback against mock collaborators. Full multi-trigger termination
//! scenarios live in the integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use crate::bus::{BusEnvelope, BusMessage};
use crate::call::{CallState, CallType};
use crate::error::{CallError, CallResult};
use crate::history::InMemoryHistoryStore;
use crate::media::{
    DeviceKind, DeviceService, LocalTrack, MediaBackend, MediaConnection, MediaDeviceInfo,
    MediaSessionEvent, RemotePublication, RemoteTrack, TrackConstraints, TrackKind, TrackRenderer,
};
use crate::signal::{SignalEvent, SignalHeader, SignalingChannel};

use super::calls::PeerInfo;
use super::config::{CoordinatorConfig, SettingsStore};
use super::manager::{CallCoordinator, TokenGrant, TokenService};
use super::surface::{CallSurfaceParams, SurfaceHandle, SurfaceLauncher};

struct RecordingSignaling {
    sent: Mutex<Vec<SignalEvent>>,
}

impl RecordingSignaling {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<SignalEvent> {
        self.sent.lock().unwrap().clone()
    }

    fn count_of(&self, event_type: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&self, event: SignalEvent) -> CallResult<()> {
        self.sent.lock().unwrap().push(event);
        Ok(())
    }
}

struct StubConnection {
    tracks: Mutex<Vec<LocalTrack>>,
    next_id: AtomicUsize,
}

impl StubConnection {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tracks: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MediaConnection for StubConnection {
    async fn publish_track(
        &self,
        kind: TrackKind,
        _constraints: TrackConstraints,
    ) -> CallResult<LocalTrack> {
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

    async fn set_muted(&self, _muted: bool) -> CallResult<()> {
        Ok(())
    }

    async fn participants(&self) -> Vec<String> {
        Vec::new()
    }

    async fn publications(&self, _identity: &str) -> Vec<RemotePublication> {
        Vec::new()
    }

    async fn subscribe(&self, _publication_id: &str) -> CallResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}
}

struct StubBackend {
    connection: Arc<StubConnection>,
    connects: AtomicUsize,
}

impl StubBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connection: StubConnection::new(),
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MediaBackend for StubBackend {
    async fn connect(
        &self,
        _token: &str,
        _room_name: &str,
    ) -> CallResult<(Arc<dyn MediaConnection>, mpsc::UnboundedReceiver<MediaSessionEvent>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok((Arc::clone(&self.connection) as Arc<dyn MediaConnection>, rx))
    }
}

struct StubDevices;

#[async_trait]
impl DeviceService for StubDevices {
    async fn enumerate(&self, kind: DeviceKind) -> CallResult<Vec<MediaDeviceInfo>> {
        Ok(vec![MediaDeviceInfo {
            id: "dev-0".into(),
            label: "Built-in".into(),
            kind,
        }])
    }

    async fn probe_permission(&self, _kind: DeviceKind) -> CallResult<()> {
        Ok(())
    }
}

struct StubRenderer;

impl TrackRenderer for StubRenderer {
    fn attach(&self, track: &RemoteTrack) -> CallResult<String> {
        Ok(format!("att-{}", track.id))
    }

    fn attach_local_preview(&self, track: &LocalTrack) -> CallResult<String> {
        Ok(format!("preview-{}", track.id))
    }

    fn detach(&self, _attachment_id: &str) {}
}

struct StubTokens {
    fail: AtomicBool,
    issued: AtomicUsize,
}

impl StubTokens {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            issued: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenService for StubTokens {
    async fn issue(&self, _conversation_id: &str, _other_user_id: &str) -> CallResult<TokenGrant> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::InternalError {
                message: "token service down".into(),
            });
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(TokenGrant {
            token: "tok-1".into(),
            room_name: "room-1".into(),
        })
    }
}

struct EmptySettings;

#[async_trait]
impl SettingsStore for EmptySettings {
    async fn load(&self) -> Option<serde_json::Value> {
        None
    }
}

struct StubSurfaceHandle {
    alive: AtomicBool,
}

#[async_trait]
impl SurfaceHandle for StubSurfaceHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

struct StubLauncher {
    launches: AtomicUsize,
    last_params: Mutex<Option<CallSurfaceParams>>,
}

impl StubLauncher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        })
    }
}

#[async_trait]
impl SurfaceLauncher for StubLauncher {
    async fn launch(&self, params: CallSurfaceParams) -> CallResult<Arc<dyn SurfaceHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().unwrap() = Some(params);
        Ok(Arc::new(StubSurfaceHandle {
            alive: AtomicBool::new(true),
        }))
    }
}

struct Fixture {
    coordinator: Arc<CallCoordinator>,
    signaling: Arc<RecordingSignaling>,
    tokens: Arc<StubTokens>,
    launcher: Arc<StubLauncher>,
    backend: Arc<StubBackend>,
}

async fn fixture() -> Fixture {
    let signaling = RecordingSignaling::new();
    let tokens = StubTokens::new();
    let launcher = StubLauncher::new();
    let backend = StubBackend::new();
    let config = CoordinatorConfig::new("alice")
        .with_local_user_name("Alice")
        .with_rejected_display_delay(Duration::from_millis(40))
        .with_departure_grace(Duration::from_millis(80))
        .with_surface_poll_interval(Duration::from_millis(20));
    let coordinator = CallCoordinator::builder(config)
        .with_signaling(Arc::clone(&signaling) as _)
        .with_backend(Arc::clone(&backend) as _)
        .with_device_service(Arc::new(StubDevices))
        .with_renderer(Arc::new(StubRenderer))
        .with_token_service(Arc::clone(&tokens) as _)
        .with_history(Arc::new(InMemoryHistoryStore::new()))
        .with_settings(Arc::new(EmptySettings))
        .with_surface_launcher(Arc::clone(&launcher) as _)
        .build()
        .unwrap();
    Fixture {
        coordinator,
        signaling,
        tokens,
        launcher,
        backend,
    }
}

fn bob() -> PeerInfo {
    PeerInfo {
        user_id: "bob".into(),
        display_name: "Bob".into(),
        avatar_url: None,
    }
}

fn inbound_header() -> SignalHeader {
    SignalHeader {
        conversation_id: "conv-1".into(),
        caller_id: "bob".into(),
        receiver_id: "alice".into(),
        room_name: "room-1".into(),
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn builder_requires_every_collaborator() {
    let result = CallCoordinator::builder(CoordinatorConfig::new("alice")).build();
    assert!(matches!(result, Err(CallError::InternalError { .. })));
}

#[tokio::test]
async fn idle_until_first_call() {
    let f = fixture().await;
    assert_eq!(f.coordinator.state().await, CallState::Idle);
    assert!(f.coordinator.current_call().await.is_none());
}

#[tokio::test]
async fn start_call_sends_request_and_opens_surface() {
    let f = fixture().await;
    let call_id = f
        .coordinator
        .start_call("conv-1".into(), bob(), CallType::Audio)
        .await
        .unwrap();

    assert_eq!(f.coordinator.state().await, CallState::Outgoing);
    assert_eq!(f.coordinator.current_call().await.unwrap().id, call_id);
    assert_eq!(f.launcher.launches.load(Ordering::SeqCst), 1);

    let sent = f.signaling.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SignalEvent::Request { header, is_video_call } => {
            assert_eq!(header.caller_id, "alice");
            assert_eq!(header.receiver_id, "bob");
            assert_eq!(header.room_name, "room-1");
            assert!(!is_video_call);
        }
        other => panic!("expected CALL_REQUEST, got {:?}", other),
    }
}

#[tokio::test]
#[tracing_test::traced_test]
async fn start_call_rolls_back_on_token_failure() {
    let f = fixture().await;
    f.tokens.fail.store(true, Ordering::SeqCst);

    let result = f
        .coordinator
        .start_call("conv-1".into(), bob(), CallType::Audio)
        .await;
    assert!(result.is_err());

    // The optimistic transition is undone and nothing leaked outward.
    assert_eq!(f.coordinator.state().await, CallState::Idle);
    assert!(f.coordinator.current_call().await.is_none());
    assert!(f.signaling.sent().is_empty());
    assert_eq!(f.launcher.launches.load(Ordering::SeqCst), 0);
    assert!(f.coordinator.diagnostics().len() > 0);

    assert!(logs_contain("rolling back to idle"));

    // The slot is free again for the next attempt.
    f.tokens.fail.store(false, Ordering::SeqCst);
    tokio_test::assert_ok!(
        f.coordinator
            .start_call("conv-1".into(), bob(), CallType::Audio)
            .await
    );
    assert_eq!(f.coordinator.state().await, CallState::Outgoing);
}

#[tokio::test]
async fn second_call_is_refused_while_one_is_active() {
    let f = fixture().await;
    f.coordinator
        .start_call("conv-1".into(), bob(), CallType::Audio)
        .await
        .unwrap();
    let err = f
        .coordinator
        .start_call("conv-2".into(), bob(), CallType::Audio)
        .await
        .unwrap_err();
    assert_eq!(err, CallError::CallAlreadyActive);
}

#[tokio::test]
async fn inbound_request_rings_with_fixed_attribution() {
    let f = fixture().await;
    f.coordinator
        .handle_signal(SignalEvent::Request {
            header: inbound_header(),
            is_video_call: true,
        })
        .await;

    let call = f.coordinator.current_call().await.unwrap();
    assert_eq!(call.state(), CallState::Incoming);
    assert_eq!(call.caller_id, "bob");
    assert_eq!(call.receiver_id, "alice");
    assert!(call.is_incoming());
    assert_eq!(call.call_type, CallType::Video);
    assert_eq!(call.room_name(), Some("room-1"));
}

#[tokio::test]
async fn request_addressed_to_someone_else_is_ignored() {
    let f = fixture().await;
    let mut header = inbound_header();
    header.receiver_id = "carol".into();
    f.coordinator
        .handle_signal(SignalEvent::Request {
            header,
            is_video_call: false,
        })
        .await;
    assert_eq!(f.coordinator.state().await, CallState::Idle);
}

#[tokio::test]
async fn request_while_another_call_is_active_is_ignored() {
    let f = fixture().await;
    f.coordinator
        .start_call("conv-1".into(), bob(), CallType::Audio)
        .await
        .unwrap();

    let mut header = inbound_header();
    header.conversation_id = "conv-2".into();
    header.caller_id = "carol".into();
    f.coordinator
        .handle_signal(SignalEvent::Request {
            header,
            is_video_call: false,
        })
        .await;

    let call = f.coordinator.current_call().await.unwrap();
    assert_eq!(call.conversation_id, "conv-1");
    assert_eq!(call.state(), CallState::Outgoing);
}

#[tokio::test]
async fn reject_requires_an_incoming_call() {
    let f = fixture().await;
    assert_eq!(
        f.coordinator.reject_call().await.unwrap_err(),
        CallError::NoActiveCall
    );

    f.coordinator
        .start_call("conv-1".into(), bob(), CallType::Audio)
        .await
        .unwrap();
    assert!(matches!(
        f.coordinator.reject_call().await,
        Err(CallError::InternalError { .. })
    ));
}

#[tokio::test]
async fn local_reject_sends_signal_and_frees_the_slot() {
    let f = fixture().await;
    f.coordinator
        .handle_signal(SignalEvent::Request {
            header: inbound_header(),
            is_video_call: false,
        })
        .await;

    f.coordinator.reject_call().await.unwrap();
    assert_eq!(f.signaling.count_of("CALL_REJECT"), 1);
    assert_eq!(f.signaling.count_of("CALL_END"), 0);
    assert_eq!(f.coordinator.state().await, CallState::Idle);
    assert!(f.coordinator.current_call().await.is_none());
}

#[tokio::test]
async fn remote_accept_connects_the_caller() {
    let f = fixture().await;
    f.coordinator
        .start_call("conv-1".into(), bob(), CallType::Audio)
        .await
        .unwrap();

    let mut header = inbound_header();
    header.caller_id = "alice".into();
    header.receiver_id = "bob".into();
    f.coordinator
        .handle_signal(SignalEvent::Accept { header: header.clone() })
        .await;

    let call = f.coordinator.current_call().await.unwrap();
    assert_eq!(call.state(), CallState::Connected);
    assert!(call.was_connected());
    assert_eq!(f.backend.connects.load(Ordering::SeqCst), 1);

    // A duplicate accept changes nothing and never reconnects media.
    f.coordinator
        .handle_signal(SignalEvent::Accept { header })
        .await;
    assert_eq!(f.coordinator.state().await, CallState::Connected);
    assert_eq!(f.backend.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn accept_echoing_a_foreign_caller_is_ignored() {
    let f = fixture().await;
    f.coordinator
        .start_call("conv-1".into(), bob(), CallType::Audio)
        .await
        .unwrap();

    // Header names bob as the caller; we are the caller, so this echo is
    // not for us.
    f.coordinator
        .handle_signal(SignalEvent::Accept { header: inbound_header() })
        .await;
    assert_eq!(f.coordinator.state().await, CallState::Outgoing);
}

#[tokio::test]
async fn bus_start_time_sync_feeds_was_connected() {
    let f = fixture().await;
    f.coordinator
        .handle_signal(SignalEvent::Request {
            header: inbound_header(),
            is_video_call: false,
        })
        .await;
    let call = f.coordinator.current_call().await.unwrap();
    assert!(!call.was_connected());

    f.coordinator
        .handle_bus_envelope(BusEnvelope {
            call_id: call.id,
            message: BusMessage::StartTimeSync {
                start_time: call.start_time,
                connected_secs: 7,
            },
        })
        .await;
    assert!(call.was_connected());
}

#[tokio::test]
async fn bus_messages_for_stale_calls_are_ignored() {
    let f = fixture().await;
    f.coordinator
        .handle_signal(SignalEvent::Request {
            header: inbound_header(),
            is_video_call: false,
        })
        .await;

    f.coordinator
        .handle_bus_envelope(BusEnvelope {
            call_id: uuid::Uuid::new_v4(),
            message: BusMessage::Ended,
        })
        .await;
    // The stale "ended" hint did not touch the live call.
    assert_eq!(f.coordinator.state().await, CallState::Incoming);
}

#[tokio::test]
async fn hangup_without_a_call_is_an_error() {
    let f = fixture().await;
    assert_eq!(
        f.coordinator.hangup_call().await.unwrap_err(),
        CallError::NoActiveCall
    );
}

#[tokio::test]
async fn stats_track_call_outcomes() {
    let f = fixture().await;
    f.coordinator
        .start_call("conv-1".into(), bob(), CallType::Audio)
        .await
        .unwrap();
    let mut header = inbound_header();
    header.caller_id = "alice".into();
    header.receiver_id = "bob".into();
    f.coordinator
        .handle_signal(SignalEvent::Accept { header })
        .await;
    f.coordinator.hangup_call().await.unwrap();

    let stats = f.coordinator.stats();
    assert_eq!(stats.total_calls.load(Ordering::Relaxed), 1);
    assert_eq!(stats.connected_calls.load(Ordering::Relaxed), 1);
    assert_eq!(stats.recorded_calls.load(Ordering::Relaxed), 1);
}
