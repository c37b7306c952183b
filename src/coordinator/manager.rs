//! Call coordinator construction and shared state
//!
//! The [`CallCoordinator`] owns the authoritative call state machine: the
//! single active-call slot, the collaborator seams (signaling, media
//! backend, token issuance, history, settings, surface launcher), the
//! cross-context bus, and the background tasks (surface liveness poll,
//! media event pump, bus listener).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::CallBus;
use crate::call::{CallId, CallSession, CallState};
use crate::error::{CallError, CallResult, DiagnosticLog};
use crate::events::{CallTransition, CoordinatorEvent, CoordinatorEventHandler};
use crate::history::CallHistoryStore;
use crate::media::{DeviceService, MediaBackend, MediaManagerEvent, MediaSessionManager, TrackRenderer};
use crate::signal::SignalingChannel;

use super::config::{CoordinatorConfig, SettingsStore};
use super::surface::{SurfaceHandle, SurfaceLauncher};

/// A token grant for joining a media session
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    /// Access token for the media session
    pub token: String,
    /// Room the token is valid for; assigned by the issuing side
    pub room_name: String,
}

/// Token-issuance collaborator
#[async_trait]
pub trait TokenService: Send + Sync {
    /// Obtain a session token for calling `other_user_id` within a
    /// conversation; the returned `room_name` is adopted immutably by the
    /// first side that requests it
    async fn issue(&self, conversation_id: &str, other_user_id: &str) -> CallResult<TokenGrant>;
}

/// Running counters for diagnostics
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Calls handled since the coordinator was created
    pub total_calls: AtomicU64,
    /// Calls that reached the connected state
    pub connected_calls: AtomicU64,
    /// Termination records produced
    pub recorded_calls: AtomicU64,
}

/// Per-call runtime attachments owned by the coordinator
pub(crate) struct ActiveCallRuntime {
    /// Media-session token granted for the active call
    pub(crate) token: Option<String>,
    pub(crate) media: Option<Arc<MediaSessionManager>>,
    pub(crate) surface: Option<Arc<dyn SurfaceHandle>>,
    pub(crate) poll_task: Option<JoinHandle<()>>,
    pub(crate) media_pump: Option<JoinHandle<()>>,
    pub(crate) rejected_timer: Option<JoinHandle<()>>,
}

impl ActiveCallRuntime {
    fn empty() -> Self {
        Self {
            token: None,
            media: None,
            surface: None,
            poll_task: None,
            media_pump: None,
            rejected_timer: None,
        }
    }
}

/// The call-session coordinator
///
/// One instance per application context. At most one call occupies the slot
/// at any time; a new call is refused while another is active.
pub struct CallCoordinator {
    pub(crate) config: CoordinatorConfig,
    pub(crate) signaling: Arc<dyn SignalingChannel>,
    pub(crate) backend: Arc<dyn MediaBackend>,
    pub(crate) device_service: Arc<dyn DeviceService>,
    pub(crate) renderer: Arc<dyn TrackRenderer>,
    pub(crate) tokens: Arc<dyn TokenService>,
    pub(crate) history: Arc<dyn CallHistoryStore>,
    pub(crate) settings: Arc<dyn SettingsStore>,
    pub(crate) launcher: Arc<dyn SurfaceLauncher>,

    /// The single active-call slot
    pub(crate) active: RwLock<Option<Arc<CallSession>>>,
    /// Runtime attachments for the active call
    pub(crate) runtime: Mutex<ActiveCallRuntime>,
    /// Cross-context bus shared with the call surface
    pub(crate) bus: CallBus,
    /// Local microphone mute flag, mirrored on the bus
    pub(crate) muted: AtomicBool,

    event_tx: broadcast::Sender<CoordinatorEvent>,
    handler: RwLock<Option<Arc<dyn CoordinatorEventHandler>>>,
    bus_listener: Mutex<Option<JoinHandle<()>>>,
    pub(crate) diagnostics: DiagnosticLog,
    pub(crate) stats: CoordinatorStats,
}

/// Builder for [`CallCoordinator`]
pub struct CallCoordinatorBuilder {
    config: CoordinatorConfig,
    signaling: Option<Arc<dyn SignalingChannel>>,
    backend: Option<Arc<dyn MediaBackend>>,
    device_service: Option<Arc<dyn DeviceService>>,
    renderer: Option<Arc<dyn TrackRenderer>>,
    tokens: Option<Arc<dyn TokenService>>,
    history: Option<Arc<dyn CallHistoryStore>>,
    settings: Option<Arc<dyn SettingsStore>>,
    launcher: Option<Arc<dyn SurfaceLauncher>>,
}

impl CallCoordinatorBuilder {
    /// Start building with the given configuration
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            signaling: None,
            backend: None,
            device_service: None,
            renderer: None,
            tokens: None,
            history: None,
            settings: None,
            launcher: None,
        }
    }

    /// Set the signaling channel collaborator
    pub fn with_signaling(mut self, signaling: Arc<dyn SignalingChannel>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    /// Set the media backend collaborator
    pub fn with_backend(mut self, backend: Arc<dyn MediaBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the device enumeration/permission collaborator
    pub fn with_device_service(mut self, devices: Arc<dyn DeviceService>) -> Self {
        self.device_service = Some(devices);
        self
    }

    /// Set the track renderer seam
    pub fn with_renderer(mut self, renderer: Arc<dyn TrackRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Set the token-issuance collaborator
    pub fn with_token_service(mut self, tokens: Arc<dyn TokenService>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Set the call-history store
    pub fn with_history(mut self, history: Arc<dyn CallHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Set the persisted-settings store
    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set the call-surface launcher
    pub fn with_surface_launcher(mut self, launcher: Arc<dyn SurfaceLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Build the coordinator
    ///
    /// Every collaborator is required; a missing one is a configuration bug.
    pub fn build(self) -> CallResult<Arc<CallCoordinator>> {
        fn require<T>(value: Option<T>, name: &str) -> CallResult<T> {
            value.ok_or_else(|| CallError::InternalError {
                message: format!("coordinator built without {}", name),
            })
        }
        let (event_tx, _rx) = broadcast::channel(128);
        let capacity = self.config.diagnostic_log_capacity;
        Ok(Arc::new(CallCoordinator {
            config: self.config,
            signaling: require(self.signaling, "signaling channel")?,
            backend: require(self.backend, "media backend")?,
            device_service: require(self.device_service, "device service")?,
            renderer: require(self.renderer, "track renderer")?,
            tokens: require(self.tokens, "token service")?,
            history: require(self.history, "history store")?,
            settings: require(self.settings, "settings store")?,
            launcher: require(self.launcher, "surface launcher")?,
            active: RwLock::new(None),
            runtime: Mutex::new(ActiveCallRuntime::empty()),
            bus: CallBus::new(),
            muted: AtomicBool::new(false),
            event_tx,
            handler: RwLock::new(None),
            bus_listener: Mutex::new(None),
            diagnostics: DiagnosticLog::new(capacity),
            stats: CoordinatorStats::default(),
        }))
    }
}

impl CallCoordinator {
    /// Begin building a coordinator
    pub fn builder(config: CoordinatorConfig) -> CallCoordinatorBuilder {
        CallCoordinatorBuilder::new(config)
    }

    /// Start background processing (the cross-context bus listener)
    pub async fn start(self: &Arc<Self>) {
        let mut listener = self.bus_listener.lock().await;
        if listener.is_some() {
            return;
        }
        let coordinator = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        *listener = Some(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                coordinator.handle_bus_envelope(envelope).await;
            }
        }));
        info!("call coordinator started for user {}", self.config.local_user_id);
    }

    /// Stop background processing and tear down any active call quietly
    pub async fn stop(self: &Arc<Self>) {
        if let Some(listener) = self.bus_listener.lock().await.take() {
            listener.abort();
        }
        self.cleanup_runtime().await;
        *self.active.write().await = None;
    }

    /// Register a callback-style event handler
    pub async fn set_event_handler(&self, handler: Arc<dyn CoordinatorEventHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Subscribe to the coordinator's event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    /// The cross-context bus shared with the call surface
    pub fn bus(&self) -> CallBus {
        self.bus.clone()
    }

    /// The bounded diagnostic log
    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Runtime counters
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// The active call session, if any
    pub async fn current_call(&self) -> Option<Arc<CallSession>> {
        self.active.read().await.clone()
    }

    /// Current state of the machine; `Idle` when no call exists
    pub async fn state(&self) -> CallState {
        match self.current_call().await {
            Some(call) => call.state(),
            None => CallState::Idle,
        }
    }

    /// Whether `call_id` still identifies the active call
    ///
    /// Async completions captured a call id when they started; a mismatch
    /// here means the call terminated meanwhile and the result is discarded.
    pub(crate) async fn is_current(&self, call_id: CallId) -> bool {
        matches!(&*self.active.read().await, Some(call) if call.id == call_id)
    }

    /// Emit an event to both the broadcast stream and the handler
    pub(crate) async fn emit(&self, event: CoordinatorEvent) {
        let _ = self.event_tx.send(event.clone());
        let handler = self.handler.read().await.clone();
        if let Some(handler) = handler {
            match event {
                CoordinatorEvent::IncomingCall(info) => handler.on_incoming_call(info).await,
                CoordinatorEvent::CallStateChanged(transition) => {
                    handler.on_call_state_changed(transition).await
                }
                CoordinatorEvent::CallEnded { call_id, report } => {
                    handler.on_call_ended(call_id, report).await
                }
                CoordinatorEvent::CallError { error, .. } => handler.on_call_error(error).await,
            }
        }
    }

    /// Emit a state transition event
    pub(crate) async fn emit_transition(
        &self,
        call: &CallSession,
        previous: CallState,
        new_state: CallState,
        reason: &str,
    ) {
        debug!(
            "call {} transition {} -> {} ({})",
            call.id, previous, new_state, reason
        );
        self.emit(CoordinatorEvent::CallStateChanged(CallTransition {
            call_id: call.id,
            new_state,
            previous_state: previous,
            reason: reason.to_string(),
            timestamp: chrono::Utc::now(),
        }))
        .await;
    }

    /// Record and surface an error according to the propagation policy
    pub(crate) async fn report_error(&self, context: &str, call_id: Option<CallId>, error: &CallError) {
        self.diagnostics.record(context, error);
        if error.is_user_facing() {
            self.emit(CoordinatorEvent::CallError {
                call_id,
                error: error.clone(),
            })
            .await;
        } else {
            debug!("absorbed non-user-facing error in {}: {}", context, error);
        }
    }

    /// Spawn the periodic liveness poll for the active call's surface
    ///
    /// An OS-level window close produces no event; only this poll notices.
    pub(crate) async fn spawn_surface_poll(self: &Arc<Self>, call_id: CallId) {
        let coordinator = Arc::clone(self);
        let interval = self.config.surface_poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately; skip it so the surface has
            // one full interval to come up.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !coordinator.is_current(call_id).await {
                    break;
                }
                let surface = coordinator.runtime.lock().await.surface.clone();
                match surface {
                    Some(surface) if !surface.is_alive() => {
                        info!("call surface for call {} is gone, ending call", call_id);
                        // Termination aborts this poll task; run it detached
                        // so cleanup is never cancelled mid-flight.
                        let c = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            c.terminate(call_id, super::signals::TerminationTrigger::SurfaceClosed)
                                .await;
                        });
                        break;
                    }
                    _ => {}
                }
            }
        });
        self.runtime.lock().await.poll_task = Some(task);
    }

    /// Spawn the pump that forwards media-manager events into the machine
    pub(crate) async fn spawn_media_pump(
        self: &Arc<Self>,
        call_id: CallId,
        mut events: mpsc::UnboundedReceiver<MediaManagerEvent>,
    ) {
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !coordinator.is_current(call_id).await {
                    break;
                }
                match event {
                    MediaManagerEvent::RemoteJoined { identity } => {
                        debug!("remote participant {} joined call {}", identity, call_id);
                    }
                    MediaManagerEvent::RemoteDeparted { identity } => {
                        info!(
                            "remote participant {} departed call {} past grace period",
                            identity, call_id
                        );
                        // Detached for the same reason as the liveness poll:
                        // termination aborts this pump task.
                        let c = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            c.terminate(call_id, super::signals::TerminationTrigger::RemoteDeparted)
                                .await;
                        });
                        break;
                    }
                    MediaManagerEvent::ConnectionLost { reason } => {
                        // Not a termination: surface an error affordance and
                        // leave the call open for manual retry or hangup.
                        warn!("media connection lost on call {}: {}", call_id, reason);
                        coordinator
                            .report_error(
                                "media_connection",
                                Some(call_id),
                                &CallError::SessionConnectFailed { reason },
                            )
                            .await;
                    }
                }
            }
        });
        self.runtime.lock().await.media_pump = Some(task);
    }

    /// Abort background tasks and release per-call resources
    pub(crate) async fn cleanup_runtime(&self) {
        let mut runtime = self.runtime.lock().await;
        if let Some(task) = runtime.poll_task.take() {
            task.abort();
        }
        if let Some(task) = runtime.media_pump.take() {
            task.abort();
        }
        if let Some(task) = runtime.rejected_timer.take() {
            task.abort();
        }
        let media = runtime.media.take();
        let surface = runtime.surface.take();
        drop(runtime);

        if let Some(media) = media {
            media.close().await;
        }
        if let Some(surface) = surface {
            surface.close().await;
        }
    }
}
