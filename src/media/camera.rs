//! Camera toggle state
//!
//! Tracks the camera's enablement through the toggle protocol:
//!
//! 1. On the first enable, a one-shot permission probe runs so a clear
//!    permission-denied outcome surfaces before any publish is attempted.
//! 2. Enabling publishes a fresh video track and flips the `enabled` flag
//!    only after the publish has succeeded - never optimistically, to avoid
//!    the "must click twice" failure mode where UI and reality diverge.
//! 3. Disabling unpublishes all local video tracks; purely local, no signal.
//!
//! The `busy` guard serializes toggles so a rapid enable/disable sequence
//! cannot interleave two publish operations.

use std::sync::atomic::{AtomicBool, Ordering};

/// Flags guarding the camera toggle protocol
#[derive(Debug, Default)]
pub struct CameraState {
    /// Whether the one-shot permission probe has already run
    probed: AtomicBool,
    /// Whether local video is currently published; flipped only after a
    /// successful publish or unpublish
    enabled: AtomicBool,
    /// Whether a toggle operation is in flight
    busy: AtomicBool,
}

impl CameraState {
    /// Fresh state: unprobed, disabled, idle
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the camera is currently enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Mark the permission probe as done; returns `true` the first time
    pub fn claim_probe(&self) -> bool {
        !self.probed.swap(true, Ordering::SeqCst)
    }

    /// Forget a failed probe so the next enable attempt probes again
    ///
    /// A denied permission can be granted later; the probe is one-shot only
    /// once it has succeeded.
    pub fn reset_probe(&self) {
        self.probed.store(false, Ordering::SeqCst);
    }

    /// Try to start a toggle operation; `false` when one is already running
    pub fn try_begin_toggle(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    /// Finish a toggle operation, recording the (possibly unchanged) outcome
    pub fn finish_toggle(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Abort a toggle, leaving the enabled flag untouched
    pub fn abort_toggle(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}
