//! Message bus seam for the outbox publisher.
//!
//! Delivery is fire-and-forget: once `publish` returns `Ok`, durability is the
//! bus's problem. The shipped implementation is an in-process broadcast channel
//! that the embedded transcoding worker subscribes to.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no subscribers on `{0}`")]
    NoSubscribers(String),
    #[error("bus rejected message: {0}")]
    Rejected(String),
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Fan-out to every live subscriber. Slow subscribers that fall more than
/// `capacity` messages behind observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl MessageBus for BroadcastBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.tx
            .send(BusMessage {
                subject: subject.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers(subject.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records deliveries; fails any payload containing one of the poisoned markers.
    #[derive(Default)]
    pub(crate) struct RecordingBus {
        log: Mutex<Vec<BusMessage>>,
        poisoned: Mutex<Vec<String>>,
    }

    impl RecordingBus {
        pub(crate) fn delivered(&self) -> Vec<BusMessage> {
            self.log.lock().unwrap().clone()
        }

        pub(crate) fn poison(&self, marker: impl Into<String>) {
            self.poisoned.lock().unwrap().push(marker.into());
        }

        pub(crate) fn heal(&self) {
            self.poisoned.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
            let text = String::from_utf8_lossy(&payload).to_string();
            if self.poisoned.lock().unwrap().iter().any(|m| text.contains(m)) {
                return Err(BusError::Unavailable("poisoned payload".into()));
            }
            self.log.lock().unwrap().push(BusMessage {
                subject: subject.to_string(),
                payload,
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_fails() {
        let bus = BroadcastBus::new(8);
        let err = bus.publish("media.ready", Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(matches!(err, BusError::NoSubscribers(s) if s == "media.ready"));
    }

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let bus = BroadcastBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("media.ready", Bytes::from_static(b"x")).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.subject, "media.ready");
        assert_eq!(&msg.payload[..], b"x");
    }
}
