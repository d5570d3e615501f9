//! Tunnel client — outbound WS connection from the workstation to the relay.
//!
//! On startup the client provisions (or restores) its tunnel via
//! `POST /tunnel/create`, then maintains a persistent WebSocket to
//! `/tunnel/{id}` with exponential-backoff reconnect. On connect it
//! immediately announces the workstation-owned client auth key; after that it
//! answers proxied `http_request` frames, applies `terminal_input`, and hands
//! `agent_request` payloads to the agent event handler.
//!
//! Outbound frames from anywhere on the workstation go through the shared
//! [`FrameSender`]; this module owns the single sender task that drains the
//! queue into the socket.

use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::dispatch::Dispatcher;
use super::FrameSender;
use crate::agent::AgentHandler;
use crate::config::Config;
use crate::protocol;
use crate::sessions::SessionManager;

/// Everything the client loop needs, cloneable across tasks.
#[derive(Clone)]
pub struct StationContext {
    pub config: Arc<Config>,
    pub frames: FrameSender,
    pub sessions: SessionManager,
    pub dispatcher: Arc<Dispatcher>,
    pub agent: AgentHandler,
    /// Live-connection flag for diagnostics.
    pub connected: Arc<AtomicBool>,
    pub reconnects: Arc<AtomicU64>,
}

/// Credentials returned by tunnel provisioning.
struct TunnelCredentials {
    tunnel_id: String,
    api_key: String,
    ws_url: String,
}

/// Normalize a relay URL to its HTTP base (`wss://x` → `https://x`).
fn http_base(relay_url: &str) -> String {
    let trimmed = relay_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        trimmed.to_string()
    }
}

/// Normalize a relay URL to its WS base (`https://x` → `wss://x`).
fn ws_base(relay_url: &str) -> String {
    let trimmed = relay_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    }
}

/// `POST /tunnel/create` — allocate or restore this workstation's tunnel.
async fn provision_tunnel(config: &Config) -> Result<TunnelCredentials, String> {
    let relay_url = config
        .station
        .relay_url
        .as_deref()
        .ok_or("RELAY_URL is not configured")?;
    let registration_key = config
        .station
        .registration_api_key
        .as_deref()
        .ok_or("TUNNEL_REGISTRATION_API_KEY is not configured")?;

    let mut body = json!({});
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        body["name"] = json!(hostname);
    }
    if let Some(id) = &config.station.tunnel_id {
        body["tunnel_id"] = json!(id);
    }

    let url = format!("{}/tunnel/create", http_base(relay_url));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| e.to_string())?;
    let response = client
        .post(&url)
        .header("X-API-Key", registration_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("tunnel create request failed: {e}"))?;

    if !response.status().is_success() {
        return Err(format!("tunnel create rejected: {}", response.status()));
    }
    let payload: Value = response
        .json()
        .await
        .map_err(|e| format!("invalid tunnel create response: {e}"))?;
    let tunnel_config = &payload["config"];
    let tunnel_id = tunnel_config["tunnelId"]
        .as_str()
        .ok_or("tunnel create response missing tunnelId")?
        .to_string();
    let api_key = tunnel_config["apiKey"]
        .as_str()
        .ok_or("tunnel create response missing apiKey")?
        .to_string();
    let ws_url = tunnel_config["wsUrl"]
        .as_str()
        .map_or_else(
            || format!("{}/tunnel/{tunnel_id}", ws_base(relay_url)),
            ToString::to_string,
        );

    let restored = tunnel_config["isRestored"].as_bool().unwrap_or(false);
    info!(tunnel_id = %tunnel_id, restored, "Tunnel provisioned");
    Ok(TunnelCredentials {
        tunnel_id,
        api_key,
        ws_url,
    })
}

/// Configure TCP keepalive: probe after `idle`s, every `interval`s, `count`
/// probes before the connection is declared dead. Mobile-facing relays sit
/// behind NATs with 30-60s idle timeouts.
#[cfg(unix)]
#[allow(clippy::cast_possible_wrap)]
fn set_tcp_keepalive(stream: &TcpStream, idle: u32, interval: u32, count: u32) {
    use std::ptr;

    let fd = stream.as_raw_fd();
    let sz = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        let enable: libc::c_int = 1;
        let idle = idle as libc::c_int;
        let interval = interval as libc::c_int;
        let count = count as libc::c_int;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            ptr::addr_of!(enable).cast(),
            sz,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            ptr::addr_of!(idle).cast(),
            sz,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            ptr::addr_of!(interval).cast(),
            sz,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPCNT,
            ptr::addr_of!(count).cast(),
            sz,
        );
    }
}

/// Resolve and connect TCP for a ws(s):// URL with a 10 s timeout per address.
async fn connect_tcp(url: &str) -> Result<TcpStream, String> {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if p.parse::<u16>().is_ok() => (h, p.parse::<u16>().unwrap_or(443)),
        _ => (
            authority,
            if url.starts_with("wss://") { 443 } else { 80 },
        ),
    };
    let host_port = format!("{host}:{port}");

    let addrs: Vec<SocketAddr> =
        tokio::time::timeout(Duration::from_secs(10), tokio::net::lookup_host(&host_port))
            .await
            .map_err(|_| format!("DNS lookup timed out (10s) for {host}"))?
            .map_err(|e| format!("DNS resolution failed for {host}: {e}"))?
            .collect();

    if addrs.is_empty() {
        return Err(format!("DNS resolution returned no addresses for {host}"));
    }

    let mut last_err = None;
    for addr in &addrs {
        match tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                // Keeps NAT mappings alive and detects dead connections in ~30s.
                #[cfg(unix)]
                set_tcp_keepalive(&stream, 15, 5, 3);
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(format!("connect to {addr} failed: {e}")),
            Err(_) => last_err = Some(format!("connect to {addr} timed out")),
        }
    }
    Err(last_err.unwrap_or_else(|| "all addresses failed".to_string()))
}

/// Why a connection attempt ended.
enum ConnectOutcome {
    /// Close frame or EOF after a successful session.
    Clean,
    /// Handshake rejected with an auth-shaped status; credentials are stale.
    AuthRejected,
    /// Anything transient (DNS, TCP, TLS, read error).
    Failed(String),
}

/// Run the tunnel client until the process exits. Reconnects with exponential
/// backoff capped at the configured maximum; after
/// `reconnect_report_attempts` consecutive failures the disconnected state is
/// surfaced and retries continue at the cap.
pub async fn run(ctx: StationContext) {
    let initial_delay = Duration::from_secs(ctx.config.station.reconnect_delay_secs);
    let max_delay = Duration::from_secs(ctx.config.station.reconnect_max_delay_secs);
    let report_after = ctx.config.station.reconnect_report_attempts;

    let mut delay = initial_delay;
    let mut failures: u32 = 0;

    loop {
        // Provision (or re-provision after an auth rejection): a restore by
        // tunnel id always yields a fresh api key.
        let creds = match provision_tunnel(&ctx.config).await {
            Ok(creds) => creds,
            Err(e) => {
                failures += 1;
                if failures == report_after {
                    error!("Tunnel: disconnected ({failures} consecutive failures): {e}");
                } else {
                    warn!("Tunnel: provisioning failed: {e}, retrying in {}s", delay.as_secs());
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
                continue;
            }
        };

        loop {
            match connect_and_run(&ctx, &creds).await {
                ConnectOutcome::Clean => {
                    info!("Tunnel: connection closed, reconnecting...");
                    delay = initial_delay;
                    failures = 0;
                }
                ConnectOutcome::AuthRejected => {
                    warn!("Tunnel: credentials rejected, re-provisioning");
                    break;
                }
                ConnectOutcome::Failed(e) => {
                    failures += 1;
                    if failures == report_after {
                        error!("Tunnel: disconnected ({failures} consecutive failures): {e}");
                    } else {
                        warn!("Tunnel: {e}, reconnecting in {}s", delay.as_secs());
                    }
                }
            }
            ctx.connected.store(false, Ordering::Relaxed);
            ctx.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        }
    }
}

/// One connection attempt: dial, announce the auth key, pump frames.
async fn connect_and_run(ctx: &StationContext, creds: &TunnelCredentials) -> ConnectOutcome {
    let url = format!("{}?api_key={}", creds.ws_url, creds.api_key);

    let tcp = match connect_tcp(&url).await {
        Ok(stream) => stream,
        Err(e) => return ConnectOutcome::Failed(e),
    };

    let handshake = tokio::time::timeout(
        Duration::from_secs(15),
        tokio_tungstenite::client_async_tls(url.as_str(), tcp),
    )
    .await;
    let (ws_stream, _response) = match handshake {
        Ok(Ok(ok)) => ok,
        Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response)))
            if response.status() == 401
                || response.status() == 403
                || response.status() == 404 =>
        {
            return ConnectOutcome::AuthRejected;
        }
        Ok(Err(e)) => return ConnectOutcome::Failed(format!("WS handshake failed: {e}")),
        Err(_) => return ConnectOutcome::Failed("TLS/WS handshake timed out (15s)".to_string()),
    };

    info!(tunnel_id = %creds.tunnel_id, "Tunnel connected");
    ctx.connected.store(true, Ordering::Relaxed);

    let (mut sink, mut stream) = ws_stream.split();

    // Install the outbound queue; the first frame announces the client auth key.
    let (tx, mut rx) = mpsc::channel::<Value>(256);
    let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(16);
    ctx.frames.install(tx);
    ctx.frames
        .send(protocol::client_auth_key(&ctx.dispatcher.client_auth_key));

    // Single sender task: the only writer on the socket.
    let sender = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = serde_json::to_string(&frame).unwrap_or_default();
                    if sink
                        .send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                pong = pong_rx.recv() => {
                    let Some(data) = pong else { break };
                    if sink
                        .send(tokio_tungstenite::tungstenite::Message::Pong(data.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let outcome = loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => break ConnectOutcome::Failed(format!("WS read error: {e}")),
            None => break ConnectOutcome::Clean,
        };
        match msg {
            tokio_tungstenite::tungstenite::Message::Text(text) => {
                let parsed: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Invalid JSON frame from relay: {e}");
                        continue;
                    }
                };
                handle_relay_frame(ctx, &creds.tunnel_id, parsed).await;
            }
            tokio_tungstenite::tungstenite::Message::Ping(data) => {
                let _ = pong_tx.send(data.to_vec()).await;
            }
            tokio_tungstenite::tungstenite::Message::Close(_) => break ConnectOutcome::Clean,
            _ => {}
        }
    };

    ctx.frames.clear();
    sender.abort();
    outcome
}

/// Handle one frame from the relay.
async fn handle_relay_frame(ctx: &StationContext, tunnel_id: &str, frame: Value) {
    match frame["type"].as_str().unwrap_or("") {
        "http_request" => {
            // Answer in a separate task; a slow handler must not stall input.
            let dispatcher = Arc::clone(&ctx.dispatcher);
            let frames = ctx.frames.clone();
            tokio::spawn(async move {
                let request_id = frame["request_id"].as_str().unwrap_or("").to_string();
                let method = frame["method"].as_str().unwrap_or("GET").to_string();
                let path = frame["path"].as_str().unwrap_or("/").to_string();
                let headers = frame["headers"]
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| {
                                v.as_str().map(|v| (k.to_lowercase(), v.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let query = frame["query"]
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                let body = frame["body"].as_str();

                let (status, response_body) = dispatcher
                    .dispatch(&method, &path, &headers, &query, body)
                    .await;
                frames.send(protocol::http_response(&request_id, status, response_body));
            });
        }
        "terminal_input" => {
            let session_id = frame["session_id"].as_str().unwrap_or("");
            let data = frame["data"].as_str().unwrap_or("");
            if let Err(e) = ctx.sessions.write_input(session_id, data, false).await {
                warn!(session_id = %session_id, "terminal_input dropped: {e}");
            }
        }
        "agent_request" => {
            ctx.agent.handle_frame(&frame);
        }
        other => {
            warn!(tunnel_id = %tunnel_id, frame_type = %other, "Unknown frame from relay");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_normalization() {
        assert_eq!(http_base("wss://relay.example.com"), "https://relay.example.com");
        assert_eq!(http_base("ws://localhost:8000/"), "http://localhost:8000");
        assert_eq!(http_base("https://relay.example.com"), "https://relay.example.com");

        assert_eq!(ws_base("https://relay.example.com"), "wss://relay.example.com");
        assert_eq!(ws_base("http://localhost:8000"), "ws://localhost:8000");
        assert_eq!(ws_base("wss://relay.example.com"), "wss://relay.example.com");
    }

    #[test]
    fn backoff_schedule_caps() {
        // Mirrors the loop arithmetic: 1, 2, 4, 8, 16, 30, 30...
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let mut delay = initial;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = (delay * 2).min(max);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
