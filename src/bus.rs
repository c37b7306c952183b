//! Cross-context broadcast bus
//!
//! A best-effort, fire-and-forget channel scoped to one call, used so the
//! main surface and the detached call surface can mirror call state without
//! a server round trip. It is an optimization layered on top of the
//! authoritative signaling channel, never a replacement for it: no message
//! here is required for protocol correctness, and every message must be
//! safely ignorable by a context that is not listening or already torn down.
//!
//! Ordering is guaranteed per sender only; messages from distinct senders
//! may interleave arbitrarily. Receivers therefore treat messages as hints
//! to re-sync, not as transitions in themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::call::CallId;
use crate::media::DeviceKind;

/// Default buffer depth for the per-call bus
const BUS_CAPACITY: usize = 64;

/// A message mirrored between the main surface and the call surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BusMessage {
    /// The session was accepted (seen by either context)
    Accepted,
    /// The session ended; the sending context already ran termination
    Ended,
    /// The session was rejected
    Rejected,
    /// Local microphone mute flipped
    MuteToggled {
        /// Whether the microphone is now muted
        muted: bool,
    },
    /// A media device was switched mid-call
    DeviceChanged {
        /// Which device kind changed
        device: DeviceKind,
        /// Identifier of the newly selected device
        device_id: String,
    },
    /// The camera was enabled or disabled
    CameraToggled {
        /// Whether the camera is now enabled
        enabled: bool,
    },
    /// Enabling the camera failed (permission or device error)
    CameraError {
        /// Human-readable description
        message: String,
    },
    /// Start-time/connection bookkeeping sync
    ///
    /// Sent by whichever context observes the session becoming connected,
    /// so the other context's `start_time` and `was_connected` bookkeeping
    /// stay consistent even though it did not witness the transition.
    StartTimeSync {
        /// When the sending context considers the call to have started
        start_time: DateTime<Utc>,
        /// Seconds the sending context has observed the call connected
        connected_secs: u64,
    },
}

/// A bus message paired with the call it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct BusEnvelope {
    /// The call instance the message is scoped to
    pub call_id: CallId,
    /// The payload
    pub message: BusMessage,
}

/// Handle to the per-call broadcast bus
///
/// Cloneable; both execution contexts hold clones of the same bus. Publishing
/// never fails from the sender's point of view: a bus with no listeners (the
/// other context not yet open, or already closed) drops the message, which
/// the contract allows.
#[derive(Debug, Clone)]
pub struct CallBus {
    tx: broadcast::Sender<BusEnvelope>,
}

impl CallBus {
    /// Create a new bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish a message for the given call; fire-and-forget
    pub fn publish(&self, call_id: CallId, message: BusMessage) {
        tracing::debug!("bus publish for call {}: {:?}", call_id, message);
        let _ = self.tx.send(BusEnvelope { call_id, message });
    }

    /// Subscribe to messages published after this point
    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live receivers (diagnostics only)
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for CallBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of the bus
///
/// Lag (a slow receiver overrun by the ring buffer) is absorbed by skipping
/// to the next available message; dropped bus messages are permitted by the
/// bus contract.
#[derive(Debug)]
pub struct BusReceiver {
    rx: broadcast::Receiver<BusEnvelope>,
}

impl BusReceiver {
    /// Receive the next message, or `None` once the bus is closed
    pub async fn recv(&mut self) -> Option<BusEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("bus receiver lagged, skipped {} messages", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for poll-style consumers
    pub fn try_recv(&mut self) -> Option<BusEnvelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_listeners_is_silent() {
        let bus = CallBus::new();
        // No receiver exists; this must not error or panic.
        bus.publish(uuid::Uuid::new_v4(), BusMessage::Accepted);
    }

    #[tokio::test]
    async fn messages_reach_subscribers_in_sender_order() {
        let bus = CallBus::new();
        let mut rx = bus.subscribe();
        let call_id = uuid::Uuid::new_v4();

        bus.publish(call_id, BusMessage::Accepted);
        bus.publish(call_id, BusMessage::MuteToggled { muted: true });

        assert_eq!(rx.recv().await.unwrap().message, BusMessage::Accepted);
        assert_eq!(
            rx.recv().await.unwrap().message,
            BusMessage::MuteToggled { muted: true }
        );
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_messages() {
        let bus = CallBus::new();
        let call_id = uuid::Uuid::new_v4();
        bus.publish(call_id, BusMessage::Accepted);

        let mut rx = bus.subscribe();
        bus.publish(call_id, BusMessage::Ended);
        // Only the post-subscription message is seen, which the contract allows.
        assert_eq!(rx.recv().await.unwrap().message, BusMessage::Ended);
    }
}
