//! Stream registry — fan-out of server→client payloads to subscriber sockets.
//!
//! Streams are keyed by `tunnel_id[:session_id][:kind]`. Each subscriber owns
//! a bounded mpsc queue drained by its socket's writer task, so delivery to a
//! single subscriber is strictly FIFO while subscribers are never synchronized
//! with each other. Broadcast snapshots the subscriber set under the read lock
//! and performs all sends outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

use super::registry::CloseReason;

/// Stream kinds carried over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Terminal,
    Recording,
    Agent,
    SseRecording,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Recording => "recording",
            Self::Agent => "agent",
            Self::SseRecording => "sse-recording",
        }
    }
}

/// Build the registry key `tunnel_id[:session_id]:kind`.
pub fn stream_key(tunnel_id: &str, session_id: Option<&str>, kind: StreamKind) -> String {
    match session_id {
        Some(sid) => format!("{tunnel_id}:{sid}:{}", kind.as_str()),
        None => format!("{tunnel_id}:{}", kind.as_str()),
    }
}

/// One subscriber socket on a stream.
pub struct Subscriber {
    pub id: String,
    /// Bounded queue to the socket's writer task.
    pub tx: mpsc::Sender<Value>,
    /// Last pong receipt, ms since the registry epoch. SSE subscribers never
    /// pong; they carry `u64::MAX` as a skip marker for the reaper.
    pub last_pong_ms: Arc<AtomicU64>,
    pub shutdown: watch::Sender<CloseReason>,
}

/// Process-wide map of stream keys to subscriber sets.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    pub epoch: Instant,
    dropped: Arc<AtomicU64>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            epoch: Instant::now(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn register(&self, key: &str, sub: Subscriber) {
        let mut streams = self.inner.write().await;
        info!(stream = %key, subscriber = %sub.id, "Stream subscriber registered");
        streams.entry(key.to_string()).or_default().push(sub);
    }

    /// Remove exactly one subscriber. An emptied set drops the key.
    pub async fn unregister(&self, key: &str, subscriber_id: &str) {
        let mut streams = self.inner.write().await;
        if let Some(subs) = streams.get_mut(key) {
            if let Some(pos) = subs.iter().position(|s| s.id == subscriber_id) {
                subs.remove(pos);
                info!(stream = %key, subscriber = %subscriber_id, "Stream subscriber removed");
            }
            if subs.is_empty() {
                streams.remove(key);
            }
        }
    }

    /// Best-effort delivery to every subscriber on `key`.
    ///
    /// Senders whose channel is closed are pruned afterwards; a full queue
    /// drops this payload for that subscriber only (slow-consumer policy).
    /// Returns the number of successful deliveries.
    pub async fn broadcast(&self, key: &str, payload: &Value) -> usize {
        // Snapshot inside the lock, send outside it.
        let targets: Vec<(String, mpsc::Sender<Value>)> = {
            let streams = self.inner.read().await;
            match streams.get(key) {
                Some(subs) => subs.iter().map(|s| (s.id.clone(), s.tx.clone())).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut closed: Vec<String> = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(stream = %key, subscriber = %id, "Dropped payload (subscriber backpressure)");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            self.unregister(key, &id).await;
        }
        delivered
    }

    /// Guaranteed delivery of a terminal event (e.g. the final
    /// `is_complete=true` recording update): waits for queue space instead of
    /// dropping. Closed subscribers are pruned.
    pub async fn broadcast_reliable(&self, key: &str, payload: &Value) -> usize {
        let targets: Vec<(String, mpsc::Sender<Value>)> = {
            let streams = self.inner.read().await;
            match streams.get(key) {
                Some(subs) => subs.iter().map(|s| (s.id.clone(), s.tx.clone())).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut closed: Vec<String> = Vec::new();
        for (id, tx) in targets {
            if tx.send(payload.clone()).await.is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }
        for id in closed {
            self.unregister(key, &id).await;
        }
        delivered
    }

    pub async fn update_last_pong(&self, key: &str, subscriber_id: &str) {
        let now = self.epoch.elapsed().as_millis() as u64;
        let streams = self.inner.read().await;
        if let Some(sub) = streams
            .get(key)
            .and_then(|subs| subs.iter().find(|s| s.id == subscriber_id))
        {
            sub.last_pong_ms.store(now, Ordering::Relaxed);
        }
    }

    /// Subscribers that missed the pong window. SSE subscribers (marker
    /// `u64::MAX`) are skipped — their death shows up as a closed channel.
    pub async fn stale_subscribers(
        &self,
        timeout_ms: u64,
    ) -> Vec<(String, String, watch::Sender<CloseReason>)> {
        let now = self.epoch.elapsed().as_millis() as u64;
        let streams = self.inner.read().await;
        let mut stale = Vec::new();
        for (key, subs) in streams.iter() {
            for sub in subs {
                let last = sub.last_pong_ms.load(Ordering::Relaxed);
                if last != u64::MAX && now.saturating_sub(last) > timeout_ms {
                    stale.push((key.clone(), sub.id.clone(), sub.shutdown.clone()));
                }
            }
        }
        stale
    }

    pub async fn subscriber_count(&self, key: &str) -> usize {
        self.inner.read().await.get(key).map_or(0, Vec::len)
    }

    pub fn dropped_payloads(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Signal every subscriber to close (relay shutdown, code 1001) and clear.
    pub async fn shutdown_all(&self) {
        let mut streams = self.inner.write().await;
        for subs in streams.values() {
            for sub in subs {
                let _ = sub.shutdown.send(CloseReason::Shutdown);
            }
        }
        streams.clear();
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscriber(id: &str, capacity: usize) -> (Subscriber, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(CloseReason::None);
        (
            Subscriber {
                id: id.to_string(),
                tx,
                last_pong_ms: Arc::new(AtomicU64::new(0)),
                shutdown,
            },
            rx,
        )
    }

    #[test]
    fn key_shapes() {
        assert_eq!(
            stream_key("t1", Some("s1"), StreamKind::Terminal),
            "t1:s1:terminal"
        );
        assert_eq!(stream_key("t1", None, StreamKind::Agent), "t1:agent");
        assert_eq!(
            stream_key("t1", Some("s1"), StreamKind::SseRecording),
            "t1:s1:sse-recording"
        );
    }

    #[tokio::test]
    async fn broadcast_is_fifo_per_subscriber() {
        let registry = StreamRegistry::new();
        let (sub, mut rx) = subscriber("a", 8);
        registry.register("k", sub).await;

        for i in 0..3 {
            registry.broadcast("k", &json!({"seq": i})).await;
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap()["seq"], i);
        }
    }

    #[tokio::test]
    async fn unregister_removes_exactly_one_and_drops_empty_key() {
        let registry = StreamRegistry::new();
        let (a, _rx_a) = subscriber("a", 8);
        let (b, _rx_b) = subscriber("b", 8);
        registry.register("k", a).await;
        registry.register("k", b).await;

        registry.unregister("k", "a").await;
        assert_eq!(registry.subscriber_count("k").await, 1);
        registry.unregister("k", "b").await;
        assert_eq!(registry.subscriber_count("k").await, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_but_others_deliver() {
        let registry = StreamRegistry::new();
        let (slow, _slow_rx) = subscriber("slow", 1);
        let (fast, mut fast_rx) = subscriber("fast", 8);
        registry.register("k", slow).await;
        registry.register("k", fast).await;

        // First fills the slow queue, second overflows it.
        assert_eq!(registry.broadcast("k", &json!({"n": 1})).await, 2);
        assert_eq!(registry.broadcast("k", &json!({"n": 2})).await, 1);
        assert_eq!(registry.dropped_payloads(), 1);

        assert_eq!(fast_rx.recv().await.unwrap()["n"], 1);
        assert_eq!(fast_rx.recv().await.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let registry = StreamRegistry::new();
        let (sub, rx) = subscriber("gone", 8);
        registry.register("k", sub).await;
        drop(rx);

        assert_eq!(registry.broadcast("k", &json!({})).await, 0);
        assert_eq!(registry.subscriber_count("k").await, 0);
    }

    #[tokio::test]
    async fn reliable_broadcast_waits_for_space() {
        let registry = StreamRegistry::new();
        let (sub, mut rx) = subscriber("a", 1);
        registry.register("k", sub).await;

        registry.broadcast("k", &json!({"n": 1})).await;
        // Queue is full; reliable send must still deliver once we drain.
        let reg = registry.clone();
        let send = tokio::spawn(async move { reg.broadcast_reliable("k", &json!({"n": 2})).await });
        assert_eq!(rx.recv().await.unwrap()["n"], 1);
        assert_eq!(send.await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn stale_scan_skips_sse_marker() {
        let registry = StreamRegistry::new();
        let (sse, _rx) = subscriber("sse", 8);
        sse.last_pong_ms.store(u64::MAX, Ordering::Relaxed);
        registry.register("k", sse).await;

        let (ws, _rx2) = subscriber("ws", 8);
        // A zero pong timestamp is immediately stale against a large timeout
        // only once the epoch has advanced; force it by backdating.
        ws.last_pong_ms.store(0, Ordering::Relaxed);
        registry.register("k", ws).await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let stale = registry.stale_subscribers(1).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].1, "ws");
    }
}
