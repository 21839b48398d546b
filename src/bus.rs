//! Pub/sub seam between the bridge, the pipeline and the outside world.
//!
//! Subjects are `.`-separated with NATS-style single-token `*` wildcards.
//! The core only depends on the `Bus` trait; `MemoryBus` is the in-process
//! transport used by the binary and the tests, while an external broker
//! adapter lives outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::NsError;

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), NsError>;

    /// Subscribe to a subject pattern. The receiver yields every message
    /// whose subject matches.
    async fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<BusMessage>;
}

/// Match a subject against a pattern, where `*` matches exactly one token.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// In-process bus: a list of (pattern, sender) pairs behind a lock.
#[derive(Default)]
pub struct MemoryBus {
    subscribers: RwLock<Vec<(String, mpsc::UnboundedSender<BusMessage>)>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryBus::default())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), NsError> {
        let subscribers = self.subscribers.read().await;
        let mut delivered = 0;
        for (pattern, tx) in subscribers.iter() {
            if subject_matches(pattern, subject) {
                // A closed receiver just means the subscriber went away.
                if tx
                    .send(BusMessage {
                        subject: subject.to_string(),
                        payload: payload.clone(),
                    })
                    .is_ok()
                {
                    delivered += 1;
                }
            }
        }
        debug!("published {subject} to {delivered} subscriber(s)");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .push((pattern.to_string(), tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("gateway.*.rx", "gateway.0102030405060708.rx"));
        assert!(!subject_matches("gateway.*.rx", "gateway.0102030405060708.tx"));
        assert!(!subject_matches("gateway.*.rx", "gateway.rx"));
        assert!(!subject_matches("gateway.*.rx", "gateway.a.rx.extra"));
        assert!(subject_matches(
            "application.*.device.*.rx",
            "application.app1.device.0102030405060708.rx"
        ));
        assert!(subject_matches("ns.device.*.tx", "ns.device.0102030405060708.tx"));
        assert!(subject_matches("a.b.c", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b.d"));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let bus = MemoryBus::new();
        let mut rx_all = bus.subscribe("gateway.*.rx").await;
        let mut rx_one = bus.subscribe("gateway.aa.rx").await;
        let mut rx_other = bus.subscribe("gateway.bb.rx").await;

        bus.publish("gateway.aa.rx", b"hello".to_vec()).await.unwrap();

        let msg = rx_all.recv().await.unwrap();
        assert_eq!(msg.subject, "gateway.aa.rx");
        assert_eq!(msg.payload, b"hello");
        assert_eq!(rx_one.recv().await.unwrap().payload, b"hello");
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_publish() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe("x.y").await;
        drop(rx);
        bus.publish("x.y", vec![1]).await.unwrap();
    }
}
