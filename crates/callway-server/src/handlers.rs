//! Connection handlers for the Callway server.
//!
//! This module handles the connection lifecycle: upgrade checks, the
//! per-connection read/write loop, heartbeats and the health endpoint.

use crate::auth::{Authenticator, ConnectQuery};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use callway_protocol::{
    codec, error_codes, ClientFrame, Encoding, ProtocolError, ServerFrame, Version,
    PROTOCOL_VERSION,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenvis_callway_core::{
    ConnectionHandle, ConnectionId, ControllerConfig, Hub, HubConfig, HubError, HubHandle, UserId,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often hub counters are exported.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The signaling hub.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    auth: Authenticator,
    connections: AtomicUsize,
}

impl AppState {
    /// Create new app state and start the hub.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub_config = HubConfig {
            controller: ControllerConfig {
                ring_timeout: config.calls.ring_timeout(),
            },
        };
        let (hub, _task) = Hub::spawn(hub_config);

        Self {
            hub,
            auth: Authenticator::new(&config.auth),
            config,
            connections: AtomicUsize::new(0),
        }
    }

    /// Number of live WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

/// A claimed connection slot, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl ConnectionSlot {
    fn try_acquire(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Self {
            state: Arc::clone(state),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve connections accepted on `listener`.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config));

    if state.config.metrics.enabled {
        tokio::spawn(metrics::report_hub_stats(state.hub.clone(), STATS_INTERVAL));
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Callway server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": PROTOCOL_VERSION.to_string(),
            "connections": state.connection_count(),
            "online_users": stats.online_users,
            "active_calls": stats.active_calls,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = Version::negotiate(query.protocol.as_deref()) {
        debug!(error = %e, "Upgrade refused");
        metrics::record_refused("protocol");
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let user = match state.auth.authenticate(&query, &headers) {
        Ok(user) => user,
        Err(e) => {
            debug!(error = %e, "Upgrade refused");
            metrics::record_refused("auth");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let Some(slot) = ConnectionSlot::try_acquire(&state) else {
        warn!(user = %user, "Connection limit reached");
        metrics::record_refused("limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, user, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user: UserId, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    // The registry holds the only sender, so the queue closes once this
    // connection is replaced or unregistered.
    let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(user.clone(), outbound_tx);
    let connection = handle.id();

    info!(user = %user, connection = %connection, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Clients learn the encoding they will be answered in from their own
    // first frame; until then everything is JSON.
    let mut encoding = Encoding::default();

    let heartbeat = &state.config.heartbeat;
    let welcome = ServerFrame::Connected {
        user_id: user.clone(),
        version: PROTOCOL_VERSION.to_string(),
        heartbeat: u32::try_from(heartbeat.interval_ms).unwrap_or(u32::MAX),
        ice_servers: state.config.ice.servers.clone(),
    };
    if let Err(e) = send_frame(&mut sender, &welcome, encoding).await {
        error!(connection = %connection, error = %e, "Failed to send Connected frame");
        return;
    }

    if let Err(e) = state.hub.connect(handle) {
        error!(connection = %connection, error = %e, "Hub unavailable");
        return;
    }

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let idle_timeout = heartbeat.timeout();
    let mut ping_timer = tokio::time::interval_at(Instant::now() + heartbeat.interval(), heartbeat.interval());
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    let mut replies = Vec::new();

    loop {
        tokio::select! {
            biased;

            // Frames queued by the hub
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = send_frame(&mut sender, &frame, encoding).await {
                        debug!(connection = %connection, error = %e, "Send failed");
                        break;
                    }
                }
                None => {
                    info!(user = %user, connection = %connection, "Outbound queue closed by hub");
                    break;
                }
            },

            // Receive from WebSocket
            msg = receiver.next() => {
                if matches!(msg, Some(Ok(_))) {
                    last_seen = Instant::now();
                }

                let dispatched = match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = std::time::Instant::now();
                        encoding = Encoding::Json;
                        metrics::record_bytes("inbound", text.len());

                        let result = dispatch(
                            &state,
                            &user,
                            connection,
                            &mut replies,
                            codec::decode_json(&text),
                        );
                        metrics::record_latency(start.elapsed().as_secs_f64());
                        result
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = std::time::Instant::now();
                        encoding = Encoding::Binary;
                        metrics::record_bytes("inbound", data.len());
                        read_buffer.extend_from_slice(&data);

                        let mut result = Ok(());
                        while result.is_ok() {
                            let decoded = match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => Ok(frame),
                                Ok(None) => break,
                                Err(e @ ProtocolError::FrameTooLarge(_)) => {
                                    // The prefix is unusable; resynchronize on the next message.
                                    read_buffer.clear();
                                    Err(e)
                                }
                                Err(e) => Err(e),
                            };
                            result = dispatch(&state, &user, connection, &mut replies, decoded);
                            if read_buffer.is_empty() {
                                break;
                            }
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                        result
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        Ok(())
                    }
                    Some(Ok(Message::Pong(_))) => Ok(()),
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection, "WebSocket stream ended");
                        break;
                    }
                };

                if let Err(e) = dispatched {
                    error!(connection = %connection, error = %e, "Hub unavailable");
                    break;
                }

                let mut failed = false;
                for reply in replies.drain(..) {
                    if let Err(e) = send_frame(&mut sender, &reply, encoding).await {
                        debug!(connection = %connection, error = %e, "Send failed");
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }

            _ = ping_timer.tick() => {
                if last_seen.elapsed() >= idle_timeout {
                    info!(user = %user, connection = %connection, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Err(e) = state.hub.disconnect(user.clone(), connection) {
        debug!(connection = %connection, error = %e, "Hub gone before disconnect");
    }
    let _ = sender.close().await;

    info!(user = %user, connection = %connection, "WebSocket disconnected");
}

/// Hand one decoded frame on. Only a stopped hub is an error; pings and
/// malformed frames are answered through `replies`.
fn dispatch(
    state: &AppState,
    user: &str,
    connection: ConnectionId,
    replies: &mut Vec<ServerFrame>,
    decoded: Result<ClientFrame, ProtocolError>,
) -> Result<(), HubError> {
    match decoded {
        Ok(ClientFrame::Ping { timestamp }) => {
            metrics::record_frame("inbound", "ping");
            replies.push(ServerFrame::pong(timestamp));
            Ok(())
        }
        Ok(frame) => {
            metrics::record_frame("inbound", frame.event_name());
            state.hub.frame(user, connection, frame)
        }
        Err(e) => {
            debug!(connection = %connection, error = %e, "Malformed frame");
            metrics::record_error("malformed_frame");
            replies.push(ServerFrame::error(
                error_codes::MALFORMED_FRAME,
                e.to_string(),
            ));
            Ok(())
        }
    }
}

/// Send a frame to the WebSocket in the connection's current encoding.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
    encoding: Encoding,
) -> Result<()> {
    let message = match encoding {
        Encoding::Json => {
            let text = codec::encode_json(frame)?;
            metrics::record_bytes("outbound", text.len());
            Message::Text(text)
        }
        Encoding::Binary => {
            let data = codec::encode(frame)?;
            metrics::record_bytes("outbound", data.len());
            Message::Binary(data.to_vec())
        }
    };
    metrics::record_frame("outbound", frame.event_name());
    sender.send(message).await?;
    Ok(())
}
