//! Workstation-side tunnel: outbound WS client and the local HTTP dispatcher
//! answering proxied requests.

pub mod client;
pub mod dispatch;

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// Handle for producing outbound tunnel frames from anywhere on the
/// workstation (PTY readers, the headless executor, the agent handler).
///
/// The tunnel client installs the live queue on connect and clears it on
/// disconnect. Producers never block: a frame is dropped with a warning when
/// the socket is not open or its queue is full.
#[derive(Clone, Default)]
pub struct FrameSender {
    inner: Arc<RwLock<Option<mpsc::Sender<Value>>>>,
}

impl FrameSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the live outbound queue (called on connect).
    pub fn install(&self, tx: mpsc::Sender<Value>) {
        *self.inner.write().expect("frame sender lock") = Some(tx);
    }

    /// Drop the queue (called on disconnect).
    pub fn clear(&self) {
        *self.inner.write().expect("frame sender lock") = None;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().expect("frame sender lock").is_some()
    }

    /// Queue a frame for the relay. Returns false when dropped.
    pub fn send(&self, frame: Value) -> bool {
        let guard = self.inner.read().expect("frame sender lock");
        match guard.as_ref() {
            Some(tx) => {
                if tx.try_send(frame).is_err() {
                    warn!("Dropping outbound frame (tunnel queue full or closing)");
                    false
                } else {
                    true
                }
            }
            None => {
                warn!("Dropping outbound frame (tunnel not connected)");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_without_connection_drops() {
        let sender = FrameSender::new();
        assert!(!sender.is_connected());
        assert!(!sender.send(json!({"type": "x"})));
    }

    #[tokio::test]
    async fn install_send_clear() {
        let sender = FrameSender::new();
        let (tx, mut rx) = mpsc::channel(4);
        sender.install(tx);
        assert!(sender.is_connected());
        assert!(sender.send(json!({"type": "x"})));
        assert_eq!(rx.recv().await.unwrap()["type"], "x");

        sender.clear();
        assert!(!sender.send(json!({"type": "y"})));
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let sender = FrameSender::new();
        let (tx, _rx) = mpsc::channel(1);
        sender.install(tx);
        assert!(sender.send(json!({"n": 1})));
        assert!(!sender.send(json!({"n": 2})));
    }
}
