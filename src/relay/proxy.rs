//! HTTP↔WS proxy — turns inbound HTTP on the relay into `http_request` frames
//! over the workstation tunnel and awaits the matching `http_response`.
//!
//! Also hosts the tunnel management endpoints (`/tunnel/create`, tunnel
//! delete) and the health probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use super::RelayState;
use crate::protocol;
use crate::util::rand_hex;

/// Maximum proxied request body (10 MB).
const MAX_PROXY_BODY: usize = 10 * 1024 * 1024;

/// A proxied request waiting for its `http_response` frame.
struct PendingEntry {
    tunnel_id: String,
    tx: oneshot::Sender<(u16, Value)>,
}

/// Process-wide map of in-flight proxied requests, keyed by `request_id`.
///
/// Each entry resolves exactly once — by response frame, timeout, or
/// connection loss. The oneshot is consumed on the first resolution; later
/// arrivals for the same id are logged and dropped by the frame router.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a pending entry and return the receiving half.
    pub async fn insert(&self, request_id: &str, tunnel_id: &str) -> oneshot::Receiver<(u16, Value)> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(
            request_id.to_string(),
            PendingEntry {
                tunnel_id: tunnel_id.to_string(),
                tx,
            },
        );
        rx
    }

    /// Resolve a pending request. Returns false for unknown (or already
    /// resolved) ids.
    pub async fn resolve(&self, request_id: &str, status: u16, body: Value) -> bool {
        let entry = self.inner.lock().await.remove(request_id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send((status, body));
                true
            }
            None => false,
        }
    }

    /// Drop a pending entry without resolving (timeout path).
    pub async fn remove(&self, request_id: &str) {
        self.inner.lock().await.remove(request_id);
    }

    /// Resolve every in-flight request for a tunnel (connection loss).
    pub async fn drain_tunnel(&self, tunnel_id: &str, status: u16, error: &str) {
        let mut pending = self.inner.lock().await;
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, e)| e.tunnel_id == tunnel_id)
            .map(|(id, _)| id.clone())
            .collect();
        let count = ids.len();
        for id in ids {
            if let Some(entry) = pending.remove(&id) {
                let _ = entry.tx.send((status, json!({"error": error})));
            }
        }
        if count > 0 {
            info!(tunnel_id = %tunnel_id, count, "Drained pending requests: {error}");
        }
    }

    /// Resolve everything (relay shutdown → 504).
    pub async fn drain_all(&self, status: u16, error: &str) {
        let mut pending = self.inner.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send((status, json!({"error": error})));
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Normalize the proxied path suffix: always starts with `/`, never contains
/// repeated slashes.
pub fn normalize_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 1);
    out.push('/');
    let mut prev_slash = true;
    for c in raw.chars() {
        if c == '/' {
            if !prev_slash {
                out.push('/');
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    // Trailing slash from an empty suffix collapses to just "/"
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Parse a raw query string into a key→value map (last wins on duplicates).
fn query_map(query: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(q) = query {
        for pair in q.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((k, v)) => map.insert(k.to_string(), v.to_string()),
                None => map.insert(pair.to_string(), String::new()),
            };
        }
    }
    map
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

// ─── Tunnel management endpoints ─────────────────────────────────────────────

/// `POST /tunnel/create` — allocate (or restore) a tunnel.
///
/// Auth: `X-API-Key` or `Authorization: Bearer` equal to the process-wide
/// registration key.
pub async fn create_tunnel(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let registration_key = state.registration_key();
    if !crate::auth::check_registration_key(&headers, registration_key) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid registration key"})),
        ));
    }

    let body = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let name = body["name"].as_str();
    let requested_id = body["tunnel_id"].as_str();

    let creds = state.tunnels.create(name, requested_id).await;
    let public_url = format!("{}/api/{}", state.config.public_url(), creds.tunnel_id);
    let ws_url = format!("{}/tunnel/{}", state.config.public_ws_url(), creds.tunnel_id);

    Ok(Json(json!({
        "config": {
            "tunnelId": creds.tunnel_id,
            "apiKey": creds.api_key,
            "publicUrl": public_url,
            "wsUrl": ws_url,
            "isRestored": creds.is_restored,
        }
    })))
}

/// `DELETE /tunnel/{tunnel_id}` — tear a tunnel down (registration-key auth).
pub async fn delete_tunnel(
    State(state): State<RelayState>,
    AxumPath(tunnel_id): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !crate::auth::check_registration_key(&headers, state.registration_key()) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid registration key"})),
        ));
    }

    if state.tunnels.delete(&tunnel_id).await {
        state
            .pending
            .drain_tunnel(&tunnel_id, 502, "tunnel deleted")
            .await;
        Ok(Json(json!({"ok": true})))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "tunnel not found"})),
        ))
    }
}

/// `GET /health` — liveness probe. `tunnels` counts live workstation
/// sockets, not allocated credentials.
pub async fn health(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tunnels": state.tunnels.live_count().await,
        "uptime": state.start_time.elapsed().as_secs(),
    }))
}

// ─── Proxy endpoint ──────────────────────────────────────────────────────────

/// `ANY /api/{tunnel_id}/{*path}` — proxy an HTTP request to the workstation.
///
/// Failure modes: `404` unknown tunnel, `503` client auth key unregistered on
/// a live tunnel, `502` socket lost mid-flight, `504` after the proxy
/// deadline; otherwise the workstation's response verbatim.
pub async fn proxy_request(
    State(state): State<RelayState>,
    AxumPath((tunnel_id, path)): AxumPath<(String, String)>,
    request: Request<Body>,
) -> Response {
    if !state.tunnels.exists(&tunnel_id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "tunnel not found"})),
        )
            .into_response();
    }

    let live = state.tunnels.is_live(&tunnel_id).await;
    if live {
        // Unavailable only applies to a live tunnel; a tunnel whose
        // workstation never connected times out to 504 below.
        let key = state.tunnels.client_auth_key(&tunnel_id).await;
        if matches!(key, Some(None)) {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "tunnel auth key not registered yet"})),
            )
                .into_response();
        }
    }

    let method = request.method().as_str().to_string();
    let headers = header_map(request.headers());
    let query = query_map(request.uri().query());
    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_PROXY_BODY).await {
        Ok(b) => b,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Failed to read request body"})),
            )
                .into_response();
        }
    };
    let body_str = if body_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body_bytes).into_owned())
    };

    let request_id = rand_hex(8);
    let normalized = normalize_path(&path);
    let rx = state.pending.insert(&request_id, &tunnel_id).await;

    if live {
        let frame = protocol::http_request(
            &request_id,
            &method,
            &normalized,
            &headers,
            &query,
            body_str.as_deref(),
        );
        if !state.tunnels.send_to_station(&tunnel_id, frame).await {
            state.pending.remove(&request_id).await;
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "failed to send to workstation"})),
            )
                .into_response();
        }
    }

    let timeout = Duration::from_secs(state.config.relay.proxy_timeout_secs);
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok((status, body))) => {
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (code, Json(body)).into_response()
        }
        Ok(Err(_)) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": "workstation connection lost"})),
        )
            .into_response(),
        Err(_) => {
            state.pending.remove(&request_id).await;
            warn!(tunnel_id = %tunnel_id, request_id = %request_id, "Proxied request timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({"error": "workstation did not respond in time"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("foo"), "/foo");
        assert_eq!(normalize_path("/foo"), "/foo");
        assert_eq!(normalize_path("foo//bar///baz"), "/foo/bar/baz");
        assert_eq!(normalize_path("//"), "/");
        assert_eq!(normalize_path("foo/"), "/foo");
    }

    #[test]
    fn query_parsing() {
        let map = query_map(Some("a=1&b=two&flag"));
        assert_eq!(map["a"], "1");
        assert_eq!(map["b"], "two");
        assert_eq!(map["flag"], "");
        assert!(query_map(None).is_empty());
    }

    #[tokio::test]
    async fn pending_resolves_exactly_once() {
        let pending = PendingRequests::new();
        let rx = pending.insert("r1", "t1").await;

        assert!(pending.resolve("r1", 200, json!({"ok": true})).await);
        // Second resolution is a no-op
        assert!(!pending.resolve("r1", 500, json!({})).await);

        let (status, body) = rx.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn drain_tunnel_only_touches_its_requests() {
        let pending = PendingRequests::new();
        let rx1 = pending.insert("r1", "t1").await;
        let mut rx2 = pending.insert("r2", "t2").await;

        pending.drain_tunnel("t1", 502, "workstation disconnected").await;

        let (status, _) = rx1.await.unwrap();
        assert_eq!(status, 502);
        // t2 entry still pending
        assert!(rx2.try_recv().is_err());
        assert_eq!(pending.len().await, 1);
    }

    #[tokio::test]
    async fn drain_all_resolves_504() {
        let pending = PendingRequests::new();
        let rx = pending.insert("r1", "t1").await;
        pending.drain_all(504, "relay shutting down").await;
        let (status, _) = rx.await.unwrap();
        assert_eq!(status, 504);
        assert!(pending.is_empty().await);
    }
}
