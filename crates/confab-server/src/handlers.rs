//! Connection handlers for the confab server.
//!
//! This module handles the socket lifecycle: authentication before the
//! WebSocket upgrade, the per-connection frame loop, and disconnect
//! cleanup.

use crate::config::ServerConfig;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use confab_core::{
    events, AuthError, AuthGate, ChannelRegistry, JwtAuth, MessageRouter, PresenceConfig,
    PresenceTracker, RegistryConfig, Socket, SocketIdentity, Store, StorePolicy,
};
use confab_protocol::{codec, Frame, ReplyStatus, Version, PROTOCOL_VERSION};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Frame-level event routing.
    pub router: MessageRouter,
    /// The channel registry behind the router.
    pub registry: Arc<ChannelRegistry>,
    /// Token verification in front of the upgrade.
    pub gate: AuthGate,
    /// Server configuration.
    pub config: ServerConfig,
}

impl AppState {
    /// Wire up the channel subsystem over a store.
    #[must_use]
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let registry = Arc::new(ChannelRegistry::new(RegistryConfig {
            max_joined_topics: config.channels.max_joined_topics,
            keep_empty_channels: config.channels.keep_empty,
        }));
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&registry),
            PresenceConfig {
                grace: Duration::from_secs(config.presence.grace_secs),
                cancel_on_rejoin: config.presence.cancel_on_rejoin,
            },
        ));
        let policy = Arc::new(
            StorePolicy::new(store.clone()).with_history_limit(config.channels.history_limit),
        );
        let gate = AuthGate::new(Arc::new(JwtAuth::new(
            &config.auth.secret,
            Duration::from_secs(config.auth.max_token_age_secs),
        )));
        let router = MessageRouter::new(Arc::clone(&registry), store, presence, policy);

        Self {
            router,
            registry,
            gate,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: ServerConfig, store: Arc<dyn Store>) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone(), store));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route("/socket", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("confab server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/socket", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Upgrade query parameters.
#[derive(Debug, Deserialize)]
struct SocketParams {
    token: Option<String>,
    vsn: Option<String>,
}

/// Why a socket upgrade was refused.
#[derive(Debug, Error)]
enum SocketRefusal {
    #[error("unsupported protocol version: {0}")]
    Version(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl SocketRefusal {
    fn status(&self) -> StatusCode {
        match self {
            SocketRefusal::Version(_) => StatusCode::BAD_REQUEST,
            SocketRefusal::Auth(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for SocketRefusal {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// WebSocket upgrade handler.
///
/// The token is verified before the upgrade; a bad token refuses the
/// connection with an auth status and creates no state.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SocketParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match authorize_socket(&state, &params) {
        Ok(identity) => ws
            .on_upgrade(move |socket| handle_socket(socket, identity, state))
            .into_response(),
        Err(refusal) => {
            warn!(error = %refusal, "Refused socket upgrade");
            metrics::record_error("upgrade");
            refusal.into_response()
        }
    }
}

fn authorize_socket(
    state: &AppState,
    params: &SocketParams,
) -> Result<SocketIdentity, SocketRefusal> {
    if let Some(vsn) = &params.vsn {
        let version: Version = vsn
            .parse()
            .map_err(|_| SocketRefusal::Version(vsn.clone()))?;
        if !version.is_compatible_with(&PROTOCOL_VERSION) {
            return Err(SocketRefusal::Version(vsn.clone()));
        }
    }
    Ok(state.gate.connect(params.token.as_deref())?)
}

/// Handle an upgraded WebSocket connection.
async fn handle_socket(ws: WebSocket, identity: SocketIdentity, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // All outbound traffic funnels through one queue per connection, so
    // replies and broadcasts reach the client in the order they were
    // produced.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let socket = Socket::new(identity, outbound_tx);

    debug!(
        conn = %socket.connection_id(),
        user = socket.user_id(),
        "Socket connected"
    );

    let (mut sink, mut stream) = ws.split();

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let idle = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut deadline = tokio::time::Instant::now() + idle;

    'conn: loop {
        tokio::select! {
            biased;

            // Drain the outbound queue first
            Some(frame) = outbound_rx.recv() => {
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }

            () = tokio::time::sleep_until(deadline) => {
                debug!(conn = %socket.connection_id(), "Idle timeout");
                break;
            }

            // Receive from WebSocket
            msg = stream.next() => {
                deadline = tokio::time::Instant::now() + idle;
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    if let Some(reply) = handle_frame(&state, &socket, frame).await {
                                        socket.send(reply);
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(
                                        conn = %socket.connection_id(),
                                        error = %e,
                                        "Protocol error"
                                    );
                                    metrics::record_error("protocol");
                                    socket.send(Frame::error_notice(None, e.to_string()));
                                    break 'conn;
                                }
                            }
                        }

                        metrics::record_dispatch_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(conn = %socket.connection_id(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn = %socket.connection_id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(conn = %socket.connection_id(), "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Flush whatever is still queued, then tear down every membership and
    // pending eviction this connection holds.
    while let Ok(frame) = outbound_rx.try_recv() {
        if send_frame(&mut sink, &frame).await.is_err() {
            break;
        }
    }
    let left = state.router.handle_disconnect(&socket);
    metrics::set_active_channels(state.registry.stats().channels);

    debug!(
        conn = %socket.connection_id(),
        channels = left.len(),
        "Socket disconnected"
    );
}

/// Handle a decoded frame. Returns the reply to queue, if any.
async fn handle_frame(state: &AppState, socket: &Socket, frame: Frame) -> Option<Frame> {
    match frame {
        Frame::Join {
            topic,
            payload: _,
            msg_ref,
        } => {
            debug!(conn = %socket.connection_id(), topic = %topic, "Join request");
            metrics::record_join();

            let reply = state.router.handle_join(socket, &topic, msg_ref).await;
            metrics::set_active_channels(state.registry.stats().channels);
            Some(reply)
        }

        Frame::Leave { topic, msg_ref } => {
            debug!(conn = %socket.connection_id(), topic = %topic, "Leave request");

            let reply = state.router.handle_leave(socket, &topic, msg_ref);
            metrics::set_active_channels(state.registry.stats().channels);
            Some(reply)
        }

        Frame::Event {
            topic,
            event,
            payload,
            msg_ref,
        } => {
            let reply = state
                .router
                .handle_event(socket, &topic, &event, &payload, msg_ref)
                .await;
            if event == events::CREATE
                && matches!(
                    reply,
                    Frame::Reply {
                        status: ReplyStatus::Ok,
                        ..
                    }
                )
            {
                metrics::record_message_created();
            }
            Some(reply)
        }

        Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

        Frame::Pong { .. } => None,

        other => {
            warn!(
                conn = %socket.connection_id(),
                frame = other.kind(),
                "Unexpected frame type"
            );
            Some(Frame::error_notice(
                None,
                format!("unexpected frame: {}", other.kind()),
            ))
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sink.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
