//! Tunnel registry — identity, credentials, and the workstation socket for
//! every tunnel the relay knows about.
//!
//! A tunnel is created by `POST /tunnel/create` (credentials only) and becomes
//! *live* once the workstation dials `/tunnel/{id}` and a socket is attached.
//! At most one live socket exists per tunnel id: re-attachment signals the
//! prior handler to close with code 1000 and swaps the connection under a
//! single write-lock acquisition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

use crate::util::{now_ms, rand_hex};

/// Why a managed socket's handler is being told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Initial state — keep running.
    None,
    /// A newer socket registered for the same tunnel; close with 1000.
    Replaced,
    /// Pong timeout; terminate without ceremony.
    DeadPeer,
    /// Relay shutting down; close with 1001.
    Shutdown,
}

/// The connected-workstation half of a tunnel.
pub struct WorkstationConn {
    /// Outbound frame queue drained by the socket's writer task.
    pub tx: mpsc::Sender<Value>,
    /// Last pong receipt as ms since the registry epoch (lock-free).
    pub last_pong_ms: Arc<AtomicU64>,
    /// Signals the socket handler to stop.
    pub shutdown: watch::Sender<CloseReason>,
    /// Monotone generation so a stale handler never detaches its successor.
    pub generation: u64,
    pub connected_since: Instant,
}

/// A relay-held binding from a public tunnel id to workstation credentials.
pub struct Tunnel {
    pub tunnel_id: String,
    /// 32-byte hex connection key the workstation presents when dialing.
    pub api_key: String,
    pub name: Option<String>,
    /// Workstation-owned bearer the mobile client uses for proxied calls.
    /// `None` until the workstation sends `client_auth_key`.
    pub client_auth_key: Option<String>,
    pub created_at_ms: u64,
    pub conn: Option<WorkstationConn>,
}

/// Credentials handed back from [`TunnelRegistry::create`].
pub struct TunnelCredentials {
    pub tunnel_id: String,
    pub api_key: String,
    pub is_restored: bool,
}

/// Process-wide map of tunnels. Cloneable; clones share the inner map.
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<RwLock<HashMap<String, Tunnel>>>,
    /// Process epoch for lock-free pong timestamps.
    pub epoch: Instant,
    next_generation: Arc<AtomicU64>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            epoch: Instant::now(),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a tunnel, or restore one by id with a fresh api key.
    ///
    /// Restoring an id that is currently live replaces its credentials; the
    /// old socket keeps running until it re-authenticates or is replaced.
    pub async fn create(&self, name: Option<&str>, requested_id: Option<&str>) -> TunnelCredentials {
        let mut tunnels = self.inner.write().await;

        let (tunnel_id, is_restored) = match requested_id {
            Some(id) if !id.is_empty() => (id.to_string(), true),
            _ => (rand_hex(8), false),
        };
        let api_key = rand_hex(32);

        let entry = tunnels
            .entry(tunnel_id.clone())
            .or_insert_with(|| Tunnel {
                tunnel_id: tunnel_id.clone(),
                api_key: String::new(),
                name: None,
                client_auth_key: None,
                created_at_ms: now_ms(),
                conn: None,
            });
        entry.api_key = api_key.clone();
        if let Some(name) = name {
            entry.name = Some(name.to_string());
        }

        info!(tunnel_id = %tunnel_id, restored = is_restored, "Tunnel created");
        TunnelCredentials {
            tunnel_id,
            api_key,
            is_restored,
        }
    }

    /// Check a workstation's connection key for a tunnel.
    pub async fn verify_api_key(&self, tunnel_id: &str, api_key: &str) -> Option<bool> {
        let tunnels = self.inner.read().await;
        tunnels
            .get(tunnel_id)
            .map(|t| crate::auth::constant_time_eq(t.api_key.as_bytes(), api_key.as_bytes()))
    }

    pub async fn exists(&self, tunnel_id: &str) -> bool {
        self.inner.read().await.contains_key(tunnel_id)
    }

    /// Attach a workstation socket, replacing any prior one atomically.
    ///
    /// Returns the generation assigned to this connection, or `None` if the
    /// tunnel is unknown. The prior handler (if any) is signalled to close
    /// with code 1000 before the swap completes; no window exists in which
    /// two sockets answer the same tunnel id.
    pub async fn attach_socket(
        &self,
        tunnel_id: &str,
        tx: mpsc::Sender<Value>,
        last_pong_ms: Arc<AtomicU64>,
        shutdown: watch::Sender<CloseReason>,
    ) -> Option<u64> {
        let mut tunnels = self.inner.write().await;
        let tunnel = tunnels.get_mut(tunnel_id)?;

        if let Some(old) = tunnel.conn.take() {
            warn!(
                tunnel_id = %tunnel_id,
                "Workstation re-registering while a connection exists, replacing old socket"
            );
            let _ = old.shutdown.send(CloseReason::Replaced);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        tunnel.conn = Some(WorkstationConn {
            tx,
            last_pong_ms,
            shutdown,
            generation,
            connected_since: Instant::now(),
        });
        info!(tunnel_id = %tunnel_id, "Workstation socket attached");
        Some(generation)
    }

    /// Detach a socket if (and only if) `generation` still owns it. Returns
    /// true when something was removed — the caller then drains pendings.
    pub async fn detach_socket(&self, tunnel_id: &str, generation: u64) -> bool {
        let mut tunnels = self.inner.write().await;
        if let Some(tunnel) = tunnels.get_mut(tunnel_id) {
            if tunnel
                .conn
                .as_ref()
                .is_some_and(|c| c.generation == generation)
            {
                tunnel.conn = None;
                info!(tunnel_id = %tunnel_id, "Workstation socket detached");
                return true;
            }
        }
        false
    }

    /// Register the workstation-owned client auth key for proxied calls.
    pub async fn set_client_auth_key(&self, tunnel_id: &str, key: &str) {
        let mut tunnels = self.inner.write().await;
        if let Some(tunnel) = tunnels.get_mut(tunnel_id) {
            tunnel.client_auth_key = Some(key.to_string());
            info!(tunnel_id = %tunnel_id, "Client auth key registered");
        }
    }

    pub async fn client_auth_key(&self, tunnel_id: &str) -> Option<Option<String>> {
        let tunnels = self.inner.read().await;
        tunnels.get(tunnel_id).map(|t| t.client_auth_key.clone())
    }

    /// Whether a workstation socket is currently attached.
    pub async fn is_live(&self, tunnel_id: &str) -> bool {
        let tunnels = self.inner.read().await;
        tunnels.get(tunnel_id).is_some_and(|t| t.conn.is_some())
    }

    pub async fn update_last_pong(&self, tunnel_id: &str) {
        let now = self.epoch.elapsed().as_millis() as u64;
        let tunnels = self.inner.read().await;
        if let Some(conn) = tunnels.get(tunnel_id).and_then(|t| t.conn.as_ref()) {
            conn.last_pong_ms.store(now, Ordering::Relaxed);
        }
    }

    /// Queue a frame for the workstation. Returns false (and warns) when the
    /// tunnel has no live socket or its queue is full — producers never block.
    pub async fn send_to_station(&self, tunnel_id: &str, frame: Value) -> bool {
        let tunnels = self.inner.read().await;
        let Some(conn) = tunnels.get(tunnel_id).and_then(|t| t.conn.as_ref()) else {
            warn!(tunnel_id = %tunnel_id, "Dropping frame: no workstation socket");
            return false;
        };
        if conn.tx.try_send(frame).is_err() {
            warn!(tunnel_id = %tunnel_id, "Dropping frame: workstation queue full or closed");
            return false;
        }
        true
    }

    /// Delete a tunnel outright, signalling its socket to stop.
    pub async fn delete(&self, tunnel_id: &str) -> bool {
        let mut tunnels = self.inner.write().await;
        if let Some(tunnel) = tunnels.remove(tunnel_id) {
            if let Some(conn) = tunnel.conn {
                let _ = conn.shutdown.send(CloseReason::Shutdown);
            }
            info!(tunnel_id = %tunnel_id, "Tunnel deleted");
            true
        } else {
            false
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Number of tunnels with a live workstation socket.
    pub async fn live_count(&self) -> usize {
        let tunnels = self.inner.read().await;
        tunnels.values().filter(|t| t.conn.is_some()).count()
    }

    /// Tunnels whose socket has not ponged within `timeout_ms`. The reaper
    /// signals each returned handle; handlers run their own cleanup.
    pub async fn stale_connections(&self, timeout_ms: u64) -> Vec<(String, watch::Sender<CloseReason>)> {
        let now = self.epoch.elapsed().as_millis() as u64;
        let tunnels = self.inner.read().await;
        tunnels
            .values()
            .filter_map(|t| {
                let conn = t.conn.as_ref()?;
                let last = conn.last_pong_ms.load(Ordering::Relaxed);
                (now.saturating_sub(last) > timeout_ms)
                    .then(|| (t.tunnel_id.clone(), conn.shutdown.clone()))
            })
            .collect()
    }

    /// Signal every live socket to close (relay shutdown, code 1001).
    pub async fn shutdown_all(&self) {
        let tunnels = self.inner.read().await;
        for tunnel in tunnels.values() {
            if let Some(conn) = &tunnel.conn {
                let _ = conn.shutdown.send(CloseReason::Shutdown);
            }
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_parts() -> (
        mpsc::Sender<Value>,
        mpsc::Receiver<Value>,
        Arc<AtomicU64>,
        watch::Sender<CloseReason>,
        watch::Receiver<CloseReason>,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(CloseReason::None);
        (tx, rx, Arc::new(AtomicU64::new(0)), shutdown_tx, shutdown_rx)
    }

    #[tokio::test]
    async fn create_allocates_hex_credentials() {
        let registry = TunnelRegistry::new();
        let creds = registry.create(Some("laptop"), None).await;
        assert_eq!(creds.tunnel_id.len(), 16);
        assert_eq!(creds.api_key.len(), 64);
        assert!(!creds.is_restored);
        assert!(registry.exists(&creds.tunnel_id).await);
    }

    #[tokio::test]
    async fn restore_keeps_id_and_rotates_key() {
        let registry = TunnelRegistry::new();
        let first = registry.create(None, None).await;
        let restored = registry.create(None, Some(&first.tunnel_id)).await;
        assert!(restored.is_restored);
        assert_eq!(restored.tunnel_id, first.tunnel_id);
        assert_ne!(restored.api_key, first.api_key);
        assert_eq!(
            registry.verify_api_key(&first.tunnel_id, &first.api_key).await,
            Some(false)
        );
        assert_eq!(
            registry
                .verify_api_key(&first.tunnel_id, &restored.api_key)
                .await,
            Some(true)
        );
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn attach_replaces_prior_socket() {
        let registry = TunnelRegistry::new();
        let creds = registry.create(None, None).await;

        let (tx1, _rx1, pong1, sd1, mut sd1_rx) = conn_parts();
        let gen1 = registry
            .attach_socket(&creds.tunnel_id, tx1, pong1, sd1)
            .await
            .unwrap();

        let (tx2, _rx2, pong2, sd2, _sd2_rx) = conn_parts();
        let gen2 = registry
            .attach_socket(&creds.tunnel_id, tx2, pong2, sd2)
            .await
            .unwrap();
        assert_ne!(gen1, gen2);

        // Old handler was told to close with 1000
        assert_eq!(*sd1_rx.borrow_and_update(), CloseReason::Replaced);

        // The stale handler must not detach the new socket
        assert!(!registry.detach_socket(&creds.tunnel_id, gen1).await);
        assert!(registry.is_live(&creds.tunnel_id).await);
        assert!(registry.detach_socket(&creds.tunnel_id, gen2).await);
        assert!(!registry.is_live(&creds.tunnel_id).await);
    }

    #[tokio::test]
    async fn attach_unknown_tunnel_fails() {
        let registry = TunnelRegistry::new();
        let (tx, _rx, pong, sd, _sd_rx) = conn_parts();
        assert!(registry.attach_socket("nope", tx, pong, sd).await.is_none());
    }

    #[tokio::test]
    async fn send_without_socket_is_dropped() {
        let registry = TunnelRegistry::new();
        let creds = registry.create(None, None).await;
        assert!(
            !registry
                .send_to_station(&creds.tunnel_id, serde_json::json!({"type": "x"}))
                .await
        );
    }
}
