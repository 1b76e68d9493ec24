use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEventKind {
    SessionEstablished {
        client_id: String,
        broker: SocketAddr,
    },
    SessionClosed {
        client_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SystemEventKind,
}

impl SystemEvent {
    pub fn now(kind: SystemEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("system events are disabled")]
    Unsupported,
    #[error("system event service is not running")]
    NotRunning,
}

pub trait SystemEventService: Send + Sync {
    fn start(&self);

    fn close(&self);

    /// Fire-and-forget; events published while nobody listens are dropped.
    fn publish(&self, event: SystemEvent);

    fn subscribe(&self) -> Result<broadcast::Receiver<SystemEvent>, EventError>;
}

/// Fans events out to every subscriber over a broadcast channel.
pub struct BroadcastSystemEventService {
    tx: broadcast::Sender<SystemEvent>,
    running: AtomicBool,
}

impl BroadcastSystemEventService {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            running: AtomicBool::new(false),
        }
    }
}

impl Default for BroadcastSystemEventService {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemEventService for BroadcastSystemEventService {
    fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            info!("System event service started");
        }
    }

    fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("System event service stopped");
        }
    }

    fn publish(&self, event: SystemEvent) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        debug!("System event: {:?}", event.kind);
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<SystemEvent>, EventError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EventError::NotRunning);
        }
        Ok(self.tx.subscribe())
    }
}

/// Used when `system_event_enabled` is off. Lifecycle and publish calls do
/// nothing; subscribing fails with [`EventError::Unsupported`].
pub struct DisabledSystemEventService;

impl SystemEventService for DisabledSystemEventService {
    fn start(&self) {}

    fn close(&self) {}

    fn publish(&self, _event: SystemEvent) {}

    fn subscribe(&self) -> Result<broadcast::Receiver<SystemEvent>, EventError> {
        Err(EventError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_event(client_id: &str) -> SystemEvent {
        SystemEvent::now(SystemEventKind::SessionClosed {
            client_id: client_id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let service = BroadcastSystemEventService::new();
        assert_eq!(service.subscribe().unwrap_err(), EventError::NotRunning);

        service.start();
        let mut rx = service.subscribe().unwrap();
        service.publish(closed_event("client-a"));

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            SystemEventKind::SessionClosed {
                client_id: "client-a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_publish_after_close_is_dropped() {
        let service = BroadcastSystemEventService::new();
        service.start();
        let mut rx = service.subscribe().unwrap();

        service.close();
        service.close();
        service.publish(closed_event("client-a"));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_disabled_service() {
        let service = DisabledSystemEventService;
        service.start();
        service.publish(closed_event("client-a"));
        service.close();
        assert_eq!(service.subscribe().unwrap_err(), EventError::Unsupported);
    }
}
