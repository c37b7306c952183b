//! User-facing call operations
//!
//! Starting, accepting, rejecting and hanging up calls, plus the in-call
//! controls (mute, camera, device switching) and history queries. All
//! operations act on the single active-call slot and go through the same
//! termination latch as every other ending path.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::BusMessage;
use crate::call::{CallId, CallSession, CallState, CallType};
use crate::error::{CallError, CallResult};
use crate::history::CallHistoryEntry;
use crate::media::{DeviceKind, MediaDeviceInfo, MediaSessionManager};
use crate::signal::{SignalEvent, SignalHeader};

use super::config::device_selection_from_settings;
use super::manager::CallCoordinator;
use super::recovery::{retry_with_backoff, RetryConfig};
use super::signals::TerminationTrigger;
use super::surface::CallSurfaceParams;

/// The remote peer of a call, as known to the UI layer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Participant identity
    pub user_id: String,
    /// Display name
    pub display_name: String,
    /// Avatar URL, if any
    pub avatar_url: Option<String>,
}

impl CallCoordinator {
    /// Start an outgoing call
    ///
    /// The state transition to `Outgoing` happens optimistically; acquiring
    /// the session token and opening the call surface are side effects, and
    /// any setup error rolls the machine back to idle.
    pub async fn start_call(
        self: &Arc<Self>,
        conversation_id: String,
        peer: PeerInfo,
        call_type: CallType,
    ) -> CallResult<CallId> {
        let call = {
            let mut slot = self.active.write().await;
            if slot.is_some() {
                return Err(CallError::CallAlreadyActive);
            }
            let call = Arc::new(CallSession::outgoing(
                conversation_id,
                self.config.local_user_id.clone(),
                peer.user_id.clone(),
                call_type,
            ));
            *slot = Some(Arc::clone(&call));
            call
        };
        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);
        info!(
            "starting {} call to {} in conversation {}",
            if call_type.is_video() { "video" } else { "audio" },
            peer.user_id,
            call.conversation_id
        );
        self.emit_transition(&call, CallState::Idle, CallState::Outgoing, "start call")
            .await;

        match self.setup_outgoing(&call, &peer).await {
            Ok(()) => Ok(call.id),
            Err(err) => {
                // Roll back the optimistic transition.
                warn!("call setup failed, rolling back to idle: {}", err);
                self.report_error("start_call", Some(call.id), &err).await;
                if self.is_current(call.id).await {
                    self.cleanup_runtime().await;
                    let previous = call.set_state(CallState::Idle);
                    *self.active.write().await = None;
                    self.emit_transition(&call, previous, CallState::Idle, "setup failed")
                        .await;
                }
                Err(err)
            }
        }
    }

    async fn setup_outgoing(self: &Arc<Self>, call: &Arc<CallSession>, peer: &PeerInfo) -> CallResult<()> {
        let grant = retry_with_backoff("issue_token", RetryConfig::quick(), || async {
            self.tokens
                .issue(&call.conversation_id, &call.receiver_id)
                .await
        })
        .await?;

        if !call.adopt_room_name(&grant.room_name) {
            return Err(CallError::InternalError {
                message: "token grant names a different room than the call".to_string(),
            });
        }
        self.runtime.lock().await.token = Some(grant.token.clone());

        self.signaling
            .send(SignalEvent::Request {
                header: self.outbound_header(call),
                is_video_call: call.call_type.is_video(),
            })
            .await?;

        self.launch_surface(call, peer, grant.token, CallState::Outgoing)
            .await?;
        self.spawn_surface_poll(call.id).await;
        Ok(())
    }

    /// Accept the active incoming call
    ///
    /// Sends `CALL_ACCEPT`, transitions to `Connected`, and begins the
    /// media-session connection. Accepting an already-connected call is a
    /// no-op.
    pub async fn accept_call(self: &Arc<Self>, peer: PeerInfo) -> CallResult<()> {
        let call = self.current_call().await.ok_or(CallError::NoActiveCall)?;
        match call.state() {
            CallState::Incoming => {}
            CallState::Connected => return Ok(()),
            other => {
                return Err(CallError::InternalError {
                    message: format!("cannot accept a call in state {}", other),
                })
            }
        }

        let grant = retry_with_backoff("issue_token", RetryConfig::quick(), || async {
            self.tokens
                .issue(&call.conversation_id, &call.caller_id)
                .await
        })
        .await?;
        // The room was adopted from the request; the grant's copy is only
        // informative here.
        if call.room_name() != Some(grant.room_name.as_str()) {
            debug!(
                "token grant room {} differs from adopted room {:?}",
                grant.room_name,
                call.room_name()
            );
        }
        self.runtime.lock().await.token = Some(grant.token.clone());

        self.signaling
            .send(SignalEvent::Accept {
                header: self.outbound_header(&call),
            })
            .await?;

        let previous = call.set_state(CallState::Connected);
        call.mark_connected();
        self.stats.connected_calls.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(call.id, BusMessage::Accepted);
        self.bus.publish(
            call.id,
            BusMessage::StartTimeSync {
                start_time: call.start_time,
                connected_secs: 0,
            },
        );
        self.emit_transition(&call, previous, CallState::Connected, "local accept")
            .await;

        self.launch_surface(&call, &peer, grant.token, CallState::Connected)
            .await?;
        self.spawn_surface_poll(call.id).await;
        self.establish_media(&call).await;
        Ok(())
    }

    /// Reject the active incoming call
    ///
    /// Sends `CALL_REJECT` and records a zero-duration history entry;
    /// rejection is a valid terminal outcome, not a no-op.
    pub async fn reject_call(self: &Arc<Self>) -> CallResult<()> {
        let call = self.current_call().await.ok_or(CallError::NoActiveCall)?;
        if call.state() != CallState::Incoming {
            return Err(CallError::InternalError {
                message: format!("cannot reject a call in state {}", call.state()),
            });
        }
        self.terminate(call.id, TerminationTrigger::LocalReject).await;
        Ok(())
    }

    /// Hang up the active call
    pub async fn hangup_call(self: &Arc<Self>) -> CallResult<()> {
        let call = self.current_call().await.ok_or(CallError::NoActiveCall)?;
        self.terminate(call.id, TerminationTrigger::LocalHangup).await;
        Ok(())
    }

    /// Toggle the local microphone mute; returns the new muted state
    pub async fn toggle_mute(self: &Arc<Self>) -> CallResult<bool> {
        let call = self.current_call().await.ok_or(CallError::NoActiveCall)?;
        let media = self.media_manager().await?;
        let muted = !self.muted.load(Ordering::SeqCst);
        media.set_muted(muted).await?;
        self.muted.store(muted, Ordering::SeqCst);
        self.bus.publish(call.id, BusMessage::MuteToggled { muted });
        Ok(muted)
    }

    /// Enable the local camera
    pub async fn enable_camera(self: &Arc<Self>) -> CallResult<()> {
        let call = self.current_call().await.ok_or(CallError::NoActiveCall)?;
        let media = self.media_manager().await?;
        match media.enable_camera().await {
            Ok(()) => {
                self.bus
                    .publish(call.id, BusMessage::CameraToggled { enabled: true });
                Ok(())
            }
            Err(err) => {
                self.bus.publish(
                    call.id,
                    BusMessage::CameraError {
                        message: err.to_string(),
                    },
                );
                self.report_error("enable_camera", Some(call.id), &err).await;
                Err(err)
            }
        }
    }

    /// Disable the local camera; purely local, never signaled
    pub async fn disable_camera(self: &Arc<Self>) -> CallResult<()> {
        let call = self.current_call().await.ok_or(CallError::NoActiveCall)?;
        let media = self.media_manager().await?;
        media.disable_camera().await?;
        self.bus
            .publish(call.id, BusMessage::CameraToggled { enabled: false });
        Ok(())
    }

    /// Switch the microphone mid-call without dropping it
    pub async fn switch_microphone(self: &Arc<Self>, device_id: &str) -> CallResult<()> {
        let call = self.current_call().await.ok_or(CallError::NoActiveCall)?;
        let media = self.media_manager().await?;
        media.switch_microphone(device_id).await?;
        self.bus.publish(
            call.id,
            BusMessage::DeviceChanged {
                device: DeviceKind::Microphone,
                device_id: device_id.to_string(),
            },
        );
        Ok(())
    }

    /// Select a different speaker
    ///
    /// Output routing is a renderer concern; the coordinator only mirrors
    /// the choice across contexts.
    pub async fn select_speaker(self: &Arc<Self>, device_id: &str) -> CallResult<()> {
        let call = self.current_call().await.ok_or(CallError::NoActiveCall)?;
        self.bus.publish(
            call.id,
            BusMessage::DeviceChanged {
                device: DeviceKind::Speaker,
                device_id: device_id.to_string(),
            },
        );
        Ok(())
    }

    /// List available devices of a kind
    pub async fn list_devices(&self, kind: DeviceKind) -> CallResult<Vec<MediaDeviceInfo>> {
        self.device_service.enumerate(kind).await
    }

    /// Persisted termination records for a conversation
    pub async fn call_history(&self, conversation_id: &str) -> CallResult<Vec<CallHistoryEntry>> {
        self.history.for_conversation(conversation_id).await
    }

    async fn media_manager(&self) -> CallResult<Arc<MediaSessionManager>> {
        self.runtime
            .lock()
            .await
            .media
            .clone()
            .ok_or(CallError::SessionConnectFailed {
                reason: "media session not established".to_string(),
            })
    }

    fn outbound_header(&self, call: &CallSession) -> SignalHeader {
        SignalHeader {
            conversation_id: call.conversation_id.clone(),
            caller_id: call.caller_id.clone(),
            receiver_id: call.receiver_id.clone(),
            room_name: call.room_name().unwrap_or_default().to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn launch_surface(
        self: &Arc<Self>,
        call: &Arc<CallSession>,
        peer: &PeerInfo,
        token: String,
        call_state: CallState,
    ) -> CallResult<()> {
        let params = CallSurfaceParams {
            token,
            room_name: call.room_name().unwrap_or_default().to_string(),
            conversation_id: call.conversation_id.clone(),
            other_user_id: peer.user_id.clone(),
            other_user_name: peer.display_name.clone(),
            other_user_avatar: peer.avatar_url.clone(),
            current_user_id: self.config.local_user_id.clone(),
            current_user_name: self.config.local_user_name.clone(),
            current_user_avatar: None,
            call_type: call.call_type,
            call_state,
        };
        params.validate()?;
        let handle = self.launcher.launch(params).await?;
        self.runtime.lock().await.surface = Some(handle);
        Ok(())
    }

    /// Connect the media session for a call that just became connected
    ///
    /// A connect failure does not terminate the call: the error is surfaced
    /// and the call stays open for manual retry or hangup, because
    /// auto-closing on a transient network blip is worse than a brief
    /// degraded state.
    pub(crate) async fn establish_media(self: &Arc<Self>, call: &Arc<CallSession>) {
        let call_id = call.id;
        let (token, already_connected) = {
            let runtime = self.runtime.lock().await;
            (runtime.token.clone(), runtime.media.is_some())
        };
        if already_connected {
            debug!("media already established for call {}", call_id);
            return;
        }
        let Some(token) = token else {
            warn!("no media token available for call {}", call_id);
            return;
        };
        let Some(room_name) = call.room_name().map(str::to_string) else {
            warn!("no room assigned for call {}", call_id);
            return;
        };

        let selection = device_selection_from_settings(self.settings.load().await.as_ref());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let media = Arc::new(MediaSessionManager::new(
            call_id,
            Arc::clone(&self.renderer),
            Arc::clone(&self.device_service),
            selection,
            self.config.departure_grace,
            events_tx,
        ));

        let connect = retry_with_backoff("media_connect", RetryConfig::quick(), || async {
            media.connect(self.backend.as_ref(), &token, &room_name).await
        })
        .await;

        // The call may have terminated while we were connecting; apply
        // nothing that belongs to a dead call.
        if !self.is_current(call_id).await {
            debug!("call {} ended during media connect, discarding", call_id);
            media.close().await;
            return;
        }

        if let Err(err) = connect {
            self.report_error("media_connect", Some(call_id), &err).await;
            return;
        }

        if let Err(err) = media.publish_microphone().await {
            self.report_error("publish_microphone", Some(call_id), &err).await;
            if matches!(err, CallError::PermissionDenied { .. }) {
                media.close().await;
                return;
            }
        }

        self.runtime.lock().await.media = Some(Arc::clone(&media));
        self.spawn_media_pump(call_id, events_rx).await;
    }
}
