//! # call-session-core
//!
//! Coordination layer for two-party real-time voice/video calls. The crate
//! owns the full call lifecycle - signaling (request/accept/reject/end),
//! media-session establishment, and call-history recording - while the
//! call's UI is split across two independent execution contexts (the main
//! application surface and a detached call surface) that must agree on a
//! single consistent view of the call.
//!
//! Three sources of truth feed the machine: the external signaling channel,
//! a local cross-context broadcast bus, and local user actions (hang up,
//! close window). The coordinator resolves them into exactly one terminal
//! outcome per call, with no duplicate termination records and no stuck
//! state when any single channel fails or arrives out of order.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────┐
//! │      Application / UI          │
//! └──────────────┬────────────────┘
//!                │ start / accept / reject / hangup
//! ┌──────────────▼────────────────┐      ┌─────────────────────┐
//! │        CallCoordinator         │◄────►│  Cross-context bus  │
//! │  (authoritative state machine) │      └─────────────────────┘
//! └───┬──────────┬──────────┬─────┘
//!     │          │          │
//! ┌───▼────┐ ┌───▼─────┐ ┌──▼────────────┐
//! │Signaling│ │ Media   │ │ Call history  │
//! │ channel │ │ session │ │   recorder    │
//! └─────────┘ └─────────┘ └───────────────┘
//! ```
//!
//! The signaling transport, media backend, token issuance, settings store,
//! history persistence, and the call surface itself are external
//! collaborators behind narrow async traits; the crate drives them but does
//! not implement them.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use call_session_core::{
//!     call::CallType,
//!     coordinator::{CallCoordinator, CoordinatorConfig, PeerInfo},
//! };
//!
//! # async fn example(
//! #     signaling: Arc<dyn call_session_core::signal::SignalingChannel>,
//! #     backend: Arc<dyn call_session_core::media::MediaBackend>,
//! #     devices: Arc<dyn call_session_core::media::DeviceService>,
//! #     renderer: Arc<dyn call_session_core::media::TrackRenderer>,
//! #     tokens: Arc<dyn call_session_core::coordinator::TokenService>,
//! #     history: Arc<dyn call_session_core::history::CallHistoryStore>,
//! #     settings: Arc<dyn call_session_core::coordinator::SettingsStore>,
//! #     launcher: Arc<dyn call_session_core::coordinator::SurfaceLauncher>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = CallCoordinator::builder(CoordinatorConfig::new("alice"))
//!     .with_signaling(signaling)
//!     .with_backend(backend)
//!     .with_device_service(devices)
//!     .with_renderer(renderer)
//!     .with_token_service(tokens)
//!     .with_history(history)
//!     .with_settings(settings)
//!     .with_surface_launcher(launcher)
//!     .build()?;
//! coordinator.start().await;
//!
//! let peer = PeerInfo {
//!     user_id: "bob".into(),
//!     display_name: "Bob".into(),
//!     avatar_url: None,
//! };
//! let call_id = coordinator
//!     .start_call("conv-1".into(), peer, CallType::Audio)
//!     .await?;
//! println!("ringing: {}", call_id);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod call;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod history;
pub mod media;
pub mod signal;

pub use bus::{BusMessage, CallBus};
pub use call::{CallId, CallSession, CallState, CallType};
pub use coordinator::{
    CallCoordinator, CallCoordinatorBuilder, CallSurfaceParams, CoordinatorConfig, PeerInfo,
    SettingsStore, SurfaceHandle, SurfaceLauncher, TokenGrant, TokenService,
};
pub use error::{CallError, CallResult, DiagnosticLog};
pub use events::{CoordinatorEvent, CoordinatorEventHandler};
pub use history::{CallHistoryEntry, CallHistoryStore};
pub use media::{
    DeviceKind, DeviceSelection, MediaBackend, MediaConnection, MediaSessionManager, TrackKind,
    TrackRenderer,
};
pub use signal::{CallReport, SignalEvent, SignalHeader, SignalingChannel};
