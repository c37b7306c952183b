//! Inbound signal and bus handling, and the termination path
//!
//! Every way a call can end - remote `CALL_END`, local hangup, the surface
//! liveness poll noticing a closed window, a bus "ended" hint, remote
//! departure past the grace period - funnels into [`CallCoordinator::terminate`],
//! which consults the per-call termination latch before doing any
//! side-effecting work. Exactly one trigger per call instance wins the latch
//! and sends the outbound signal and history record; every other trigger is
//! downgraded to local cleanup.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bus::{BusEnvelope, BusMessage};
use crate::call::{CallId, CallSession, CallState, CallType};
use crate::error::CallError;
use crate::events::{CoordinatorEvent, IncomingCallInfo};
use crate::history::{build_report, CallHistoryEntry};
use crate::signal::{CallReport, SignalEvent, SignalHeader};

use super::manager::CallCoordinator;

/// What caused a termination attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationTrigger {
    /// The local user pressed hang up
    LocalHangup,
    /// A remote `CALL_END` arrived; its report is authoritative
    RemoteEnd {
        /// The report carried on the envelope
        report: CallReport,
    },
    /// A remote `CALL_REJECT` arrived
    RemoteReject,
    /// The local user rejected an incoming call
    LocalReject,
    /// The liveness poll found the call surface gone
    SurfaceClosed,
    /// The remote participant stayed absent past the grace period
    RemoteDeparted,
    /// The other context announced the end over the bus
    BusEnded,
    /// The other context announced a rejection over the bus
    BusRejected,
}

impl TerminationTrigger {
    /// Whether the latch winner sends an outbound `CALL_END` for this trigger
    fn sends_end_signal(&self) -> bool {
        matches!(
            self,
            TerminationTrigger::LocalHangup
                | TerminationTrigger::SurfaceClosed
                | TerminationTrigger::RemoteDeparted
        )
    }

    /// Whether this is a rejection-flavored ending
    fn is_rejection(&self) -> bool {
        matches!(
            self,
            TerminationTrigger::RemoteReject
                | TerminationTrigger::LocalReject
                | TerminationTrigger::BusRejected
        )
    }

    fn describe(&self) -> &'static str {
        match self {
            TerminationTrigger::LocalHangup => "local hangup",
            TerminationTrigger::RemoteEnd { .. } => "remote end",
            TerminationTrigger::RemoteReject => "remote reject",
            TerminationTrigger::LocalReject => "local reject",
            TerminationTrigger::SurfaceClosed => "surface closed",
            TerminationTrigger::RemoteDeparted => "remote departed",
            TerminationTrigger::BusEnded => "ended via bus",
            TerminationTrigger::BusRejected => "rejected via bus",
        }
    }
}

impl CallCoordinator {
    /// Process one inbound signaling event
    ///
    /// Signals that do not match the active call (stale conversation, wrong
    /// addressee, duplicate accepts) are absorbed silently: they are
    /// expected traffic under the cross-context races this machine exists
    /// to resolve, not faults to report.
    pub async fn handle_signal(self: &Arc<Self>, event: SignalEvent) {
        match event {
            SignalEvent::Request { header, is_video_call } => {
                self.on_inbound_request(header, is_video_call).await;
            }
            SignalEvent::Accept { header } => {
                self.on_inbound_accept(header).await;
            }
            SignalEvent::Reject { header } => {
                if let Some(call) = self.matching_call(&header).await {
                    if call.state().is_terminable() {
                        self.terminate(call.id, TerminationTrigger::RemoteReject).await;
                    }
                }
            }
            SignalEvent::End { header, report } => {
                if let Some(call) = self.matching_call(&header).await {
                    self.terminate(call.id, TerminationTrigger::RemoteEnd { report })
                        .await;
                }
            }
        }
    }

    async fn matching_call(&self, header: &SignalHeader) -> Option<Arc<CallSession>> {
        let call = self.current_call().await?;
        if call.conversation_id != header.conversation_id {
            debug!(
                "ignoring signal for conversation {} while call {} is for {}",
                header.conversation_id, call.id, call.conversation_id
            );
            return None;
        }
        Some(call)
    }

    async fn on_inbound_request(self: &Arc<Self>, header: SignalHeader, is_video_call: bool) {
        if header.receiver_id != self.config.local_user_id {
            debug!("ignoring call request addressed to {}", header.receiver_id);
            return;
        }
        let call = {
            let mut slot = self.active.write().await;
            if slot.is_some() {
                // Only one call may occupy the slot; a second offer is a
                // documented no-op (the remote side will time out).
                debug!("ignoring call request while another call is active");
                return;
            }
            let call_type = if is_video_call { CallType::Video } else { CallType::Audio };
            let call = Arc::new(CallSession::incoming(
                header.conversation_id.clone(),
                header.caller_id.clone(),
                self.config.local_user_id.clone(),
                call_type,
            ));
            // The request's room name is adopted immutably.
            call.adopt_room_name(&header.room_name);
            *slot = Some(Arc::clone(&call));
            call
        };
        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);
        info!(
            "incoming {} call from {} in conversation {}",
            if is_video_call { "video" } else { "audio" },
            header.caller_id,
            header.conversation_id
        );
        self.emit_transition(&call, CallState::Idle, CallState::Incoming, "inbound request")
            .await;
        self.emit(CoordinatorEvent::IncomingCall(IncomingCallInfo {
            call_id: call.id,
            conversation_id: header.conversation_id,
            caller_id: header.caller_id,
            call_type: call.call_type,
            received_at: call.start_time,
        }))
        .await;
    }

    async fn on_inbound_accept(self: &Arc<Self>, header: SignalHeader) {
        let Some(call) = self.matching_call(&header).await else { return };
        // The accept echoes the caller id; only the side that *was* the
        // caller honors it.
        if header.caller_id != self.config.local_user_id {
            debug!("ignoring accept echoing caller {}", header.caller_id);
            return;
        }
        match call.state() {
            CallState::Outgoing => {}
            CallState::Connected => {
                // Duplicate accept while connected: documented no-op, no
                // second media connect, no state change.
                debug!("duplicate accept for connected call {}", call.id);
                return;
            }
            other => {
                debug!("ignoring accept while call {} is {}", call.id, other);
                return;
            }
        }

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
        self.emit_transition(&call, previous, CallState::Connected, "remote accept")
            .await;
        self.establish_media(&call).await;
    }

    /// Process one cross-context bus message
    ///
    /// The bus is a hint to re-sync, never the sole source of truth; every
    /// message must be safely ignorable, including those for calls that no
    /// longer exist.
    pub(crate) async fn handle_bus_envelope(self: &Arc<Self>, envelope: BusEnvelope) {
        let Some(call) = self.current_call().await else { return };
        if call.id != envelope.call_id {
            debug!("ignoring bus message for stale call {}", envelope.call_id);
            return;
        }
        match envelope.message {
            BusMessage::Ended => {
                self.terminate(call.id, TerminationTrigger::BusEnded).await;
            }
            BusMessage::Rejected => {
                if call.state().is_terminable() {
                    self.terminate(call.id, TerminationTrigger::BusRejected).await;
                }
            }
            BusMessage::Accepted => {
                // The call surface witnessed the accept this context missed.
                if call.state() == CallState::Outgoing {
                    let previous = call.set_state(CallState::Connected);
                    call.mark_connected();
                    self.stats.connected_calls.fetch_add(1, Ordering::Relaxed);
                    self.emit_transition(&call, previous, CallState::Connected, "bus resync")
                        .await;
                    self.establish_media(&call).await;
                }
            }
            BusMessage::StartTimeSync { connected_secs, .. } => {
                call.note_connected_elapsed(connected_secs);
            }
            // UI-mirroring traffic; nothing for the state machine to do.
            BusMessage::MuteToggled { .. }
            | BusMessage::DeviceChanged { .. }
            | BusMessage::CameraToggled { .. }
            | BusMessage::CameraError { .. } => {}
        }
    }

    /// Terminate the call identified by `call_id`
    ///
    /// The single boolean latch on the session gates all side effects: the
    /// first trigger to win it sends the outbound signal (when its kind
    /// calls for one), records history, and notifies the bus. Every later
    /// trigger - and every trigger racing in while cleanup runs - performs
    /// cleanup only. Calls already torn out of the slot make this a no-op.
    pub(crate) async fn terminate(self: &Arc<Self>, call_id: CallId, trigger: TerminationTrigger) {
        let Some(call) = self.current_call().await else { return };
        if call.id != call_id {
            debug!("ignoring termination of stale call {}", call_id);
            return;
        }

        let won = call.try_claim_termination();
        if !won {
            debug!(
                "termination of call {} already claimed; {} downgraded to cleanup",
                call.id,
                trigger.describe()
            );
            self.cleanup_after(&call, &trigger, false).await;
            return;
        }

        info!("terminating call {} ({})", call.id, trigger.describe());
        let end_time = call.set_end_time(Utc::now());
        let report = match &trigger {
            // The remote side's report is the authoritative history record.
            TerminationTrigger::RemoteEnd { report } => report.clone(),
            _ => build_report(&call, end_time),
        };

        if trigger.sends_end_signal() {
            let event = SignalEvent::End {
                header: self.header_for(&call),
                report: report.clone(),
            };
            if let Err(err) = self.signaling.send(event).await {
                warn!("failed to send CALL_END for call {}: {}", call.id, err);
                self.diagnostics.record("send_call_end", &err);
            }
        } else if trigger == TerminationTrigger::LocalReject {
            let event = SignalEvent::Reject {
                header: self.header_for(&call),
            };
            if let Err(err) = self.signaling.send(event).await {
                warn!("failed to send CALL_REJECT for call {}: {}", call.id, err);
                self.diagnostics.record("send_call_reject", &err);
            }
        }

        let entry = CallHistoryEntry {
            conversation_id: call.conversation_id.clone(),
            caller_id: call.caller_id.clone(),
            receiver_id: call.receiver_id.clone(),
            report: report.clone(),
        };
        if let Err(err) = self.history.append(entry).await {
            warn!("failed to record history for call {}: {}", call.id, err);
            self.diagnostics.record("record_history", &err);
        }
        self.stats.recorded_calls.fetch_add(1, Ordering::Relaxed);

        match trigger {
            TerminationTrigger::BusEnded => {}
            _ if trigger.is_rejection() => self.bus.publish(call.id, BusMessage::Rejected),
            _ => self.bus.publish(call.id, BusMessage::Ended),
        }

        self.emit(CoordinatorEvent::CallEnded {
            call_id: call.id,
            report,
        })
        .await;

        self.cleanup_after(&call, &trigger, true).await;
    }

    /// Caller attribution for outbound signals
    ///
    /// Built from the immutable fields fixed at creation. `state` is
    /// symmetric for both parties once connected and is deliberately not
    /// consulted here.
    fn header_for(&self, call: &CallSession) -> SignalHeader {
        SignalHeader {
            conversation_id: call.conversation_id.clone(),
            caller_id: call.caller_id.clone(),
            receiver_id: call.receiver_id.clone(),
            room_name: call.room_name().unwrap_or_default().to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn cleanup_after(
        self: &Arc<Self>,
        call: &Arc<CallSession>,
        trigger: &TerminationTrigger,
        won: bool,
    ) {
        // A remote rejection of our outgoing call lingers in the transient
        // rejected state so the caller sees the outcome; everything else
        // resolves straight to idle.
        let show_rejected = won
            && matches!(trigger, TerminationTrigger::RemoteReject)
            && !call.is_incoming();

        self.cleanup_runtime().await;

        if show_rejected {
            let previous = call.set_state(CallState::Rejected);
            self.emit_transition(call, previous, CallState::Rejected, trigger.describe())
                .await;
            self.spawn_rejected_timer(call.id).await;
        } else {
            let previous = call.set_state(CallState::Idle);
            *self.active.write().await = None;
            if won {
                self.emit_transition(call, previous, CallState::Idle, trigger.describe())
                    .await;
            }
        }
    }

    /// Auto-resolve the transient rejected state to idle after the display
    /// delay; pure timer, no signal is sent
    async fn spawn_rejected_timer(self: &Arc<Self>, call_id: CallId) {
        let coordinator = Arc::clone(self);
        let delay = self.config.rejected_display_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(call) = coordinator.current_call().await else { return };
            if call.id != call_id {
                return;
            }
            let previous = call.set_state(CallState::Idle);
            *coordinator.active.write().await = None;
            coordinator
                .emit_transition(&call, previous, CallState::Idle, "rejected display elapsed")
                .await;
        });
        self.runtime.lock().await.rejected_timer = Some(task);
    }
}
