//! The call coordinator
//!
//! Houses the authoritative call state machine and everything it drives:
//! user-facing call operations, inbound signal handling, the call-surface
//! liveness poll, configuration, and retry helpers.

pub mod calls;
pub mod config;
pub mod manager;
pub mod recovery;
pub mod signals;
pub mod surface;

#[cfg(test)]
mod tests;

pub use calls::PeerInfo;
pub use config::{device_selection_from_settings, CoordinatorConfig, SettingsStore};
pub use manager::{CallCoordinator, CallCoordinatorBuilder, CoordinatorStats, TokenGrant, TokenService};
pub use recovery::{retry_with_backoff, RetryConfig};
pub use surface::{CallSurfaceParams, SurfaceHandle, SurfaceLauncher};
