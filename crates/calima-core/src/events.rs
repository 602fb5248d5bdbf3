//! Device event system for connection and sync notifications.
//!
//! This module provides an event-based system for receiving notifications
//! about discovery, connection transitions, syncs and errors.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::connection::LinkPhase;

/// Device identifier for events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    /// Unique identifier (peripheral ID or MAC address).
    pub id: String,
    /// Device name if known.
    pub name: Option<String>,
}

impl DeviceId {
    /// Create a new device ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Create a device ID with name.
    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}

/// Events that can be emitted for a fan.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// Fan was discovered and resolved during a discovery run.
    Discovered { device: DeviceId, rssi: Option<i16> },
    /// Connection state machine moved to a new phase.
    PhaseChanged { device: DeviceId, phase: LinkPhase },
    /// Link established.
    Connected { device: DeviceId },
    /// Link closed.
    Disconnected {
        device: DeviceId,
        reason: DisconnectReason,
    },
    /// Background reconnection started after an unsolicited disconnect.
    ReconnectStarted { device: DeviceId, attempt: u32 },
    /// Background reconnection succeeded.
    ReconnectSucceeded { device: DeviceId, attempts: u32 },
    /// All readable state was pulled and published.
    SyncCompleted { device: DeviceId },
    /// A tick arrived while the previous sync was still running.
    SyncSkipped { device: DeviceId },
    /// Error occurred during device operation.
    Error { device: DeviceId, error: String },
}

/// Reason for disconnection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The lease holder released the link.
    Released,
    /// The connection manager was closed.
    Closed,
    /// The peripheral dropped the link.
    Unsolicited,
}

/// Sender for device events.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Receiver for device events.
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: DeviceEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = DeviceEvent::SyncSkipped {
            device: DeviceId::with_name("58:2B:DB:00:00:01", "Bathroom"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"sync_skipped\""));
        assert!(json.contains("Bathroom"));
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_to_subscribers() {
        let dispatcher = EventDispatcher::default();
        let mut rx = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 1);

        dispatcher.send(DeviceEvent::Connected {
            device: DeviceId::new("fan"),
        });

        match rx.recv().await.unwrap() {
            DeviceEvent::Connected { device } => assert_eq!(device.id, "fan"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_send_without_receivers_is_silent() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.send(DeviceEvent::SyncCompleted {
            device: DeviceId::new("fan"),
        });
    }
}
