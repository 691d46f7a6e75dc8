//! Connection handlers for the Beacon relay server.
//!
//! This module handles the connection lifecycle: WebSocket upgrade, the
//! per-connection read/write loop, frame decoding, and dispatch into
//! `beacon-core`. A decode failure on one connection never affects any
//! other connection.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use beacon_core::Dispatcher;
use beacon_protocol::{codec, ClientEvent, ServerEvent, PROTOCOL_VERSION};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Shared server state.
pub struct AppState {
    /// The event dispatcher.
    pub dispatcher: Dispatcher,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            config,
        }
    }
}

/// Counter for connection id uniqueness within one timestamp.
static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a connection id, unique for this process.
fn next_connection_id() -> String {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let seq = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("conn_{timestamp:x}_{seq:x}")
}

/// Build the HTTP router.
#[must_use]
pub fn app(state: Arc<AppState>) -> Router {
    let websocket_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Beacon relay listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.dispatcher.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "online_users": stats.online_users,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(mut socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Refuse connections over the cap before attaching any state.
    if state.dispatcher.stats().connections >= state.config.limits.max_connections {
        warn!("Connection cap reached, refusing connection");
        metrics::record_error("connection_cap");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let connection_id = next_connection_id();
    debug!(connection = %connection_id, "WebSocket connected");

    // Attach before the handshake so targeted emits can reach us as soon as
    // the client learns our connection id.
    let mut outbound = state.dispatcher.attach(connection_id.as_str());

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Send the connected handshake
    let connected = ServerEvent::connected(
        connection_id.as_str(),
        PROTOCOL_VERSION.major,
        state.config.heartbeat.interval_ms as u32,
    );
    match codec::encode(&connected) {
        Ok(data) => {
            if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                state.dispatcher.detach(&connection_id);
                return;
            }
        }
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Failed to encode handshake");
            state.dispatcher.detach(&connection_id);
            return;
        }
    }

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Idle enforcement: any inbound traffic counts as activity.
    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut idle_check = tokio::time::interval((idle_timeout / 4).max(Duration::from_secs(1)));
    let mut last_activity = Instant::now();

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Deliver queued outbound events
            Some(event) = outbound.recv() => {
                match codec::encode(&event) {
                    Ok(data) => {
                        metrics::record_event(data.len(), "outbound");
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "Outbound encode error");
                        metrics::record_error("encode");
                    }
                }
            }

            _ = idle_check.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!(connection = %connection_id, "Idle timeout, closing");
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_activity = Instant::now();

                        if data.len() > state.config.limits.max_message_size {
                            warn!(
                                connection = %connection_id,
                                size = data.len(),
                                "Oversized message discarded"
                            );
                            metrics::record_error("oversized");
                            continue;
                        }

                        let start = Instant::now();
                        metrics::record_event(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        drain_frames(&connection_id, &state, &mut read_buffer);
                        metrics::record_latency(start.elapsed().as_secs_f64());
                        metrics::set_online_users(state.dispatcher.stats().online_users);
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        last_activity = Instant::now();
                        read_buffer.extend_from_slice(text.as_bytes());
                        drain_frames(&connection_id, &state, &mut read_buffer);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_activity = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: detach from the dispatcher, which unregisters the user and
    // broadcasts the updated roster to everyone still connected.
    state.dispatcher.detach(&connection_id);
    metrics::set_online_users(state.dispatcher.stats().online_users);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode and dispatch every complete frame in the buffer.
///
/// Malformed frames are consumed and counted; decoding continues with the
/// next frame, and the connection stays up either way.
fn drain_frames(connection_id: &str, state: &Arc<AppState>, read_buffer: &mut BytesMut) {
    loop {
        match codec::decode_from::<ClientEvent>(read_buffer) {
            Ok(Some(event)) => {
                state.dispatcher.handle(connection_id, event);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Malformed frame discarded");
                metrics::record_error("decode");
                // An oversized length prefix means the stream is beyond
                // recovery; anything else was consumed frame-by-frame.
                if matches!(e, beacon_protocol::ProtocolError::FrameTooLarge(_)) {
                    read_buffer.clear();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::StatusEntry;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    async fn spawn_server(config: Config) -> SocketAddr {
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });
        addr
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.metrics.enabled = false;
        config
    }

    /// A protocol-speaking client over a real WebSocket.
    struct TestClient {
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        buf: BytesMut,
        connection_id: String,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
            let mut client = Self {
                ws,
                buf: BytesMut::new(),
                connection_id: String::new(),
            };
            match client.recv().await {
                ServerEvent::Connected { connection_id, .. } => {
                    client.connection_id = connection_id;
                }
                other => panic!("expected connected handshake, got {other:?}"),
            }
            client
        }

        async fn send(&mut self, event: &ClientEvent) {
            let data = codec::encode(event).unwrap();
            self.ws.send(WsMessage::Binary(data.to_vec())).await.unwrap();
        }

        async fn recv(&mut self) -> ServerEvent {
            loop {
                if let Some(event) = codec::decode_from::<ServerEvent>(&mut self.buf).unwrap() {
                    return event;
                }
                let msg = timeout(RECV_TIMEOUT, self.ws.next())
                    .await
                    .expect("timed out waiting for event")
                    .expect("stream ended")
                    .expect("websocket error");
                if let WsMessage::Binary(data) = msg {
                    self.buf.extend_from_slice(&data);
                }
            }
        }

        /// Receive events until one matches, discarding the rest (roster
        /// broadcasts interleave freely with targeted events).
        async fn recv_until(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
            loop {
                let event = self.recv().await;
                if pred(&event) {
                    return event;
                }
            }
        }

        /// Register and wait for the status snapshot that answers setup.
        async fn setup(&mut self, user_id: &str) -> Vec<StatusEntry> {
            self.send(&ClientEvent::setup(user_id)).await;
            match self
                .recv_until(|e| matches!(e, ServerEvent::AllStatus { .. }))
                .await
            {
                ServerEvent::AllStatus { statuses } => statuses,
                _ => unreachable!(),
            }
        }

        /// Collect every event that arrives within the window.
        async fn collect_for(&mut self, window: Duration) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            let deadline = Instant::now() + window;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return events;
                }
                match timeout(remaining, self.recv()).await {
                    Ok(event) => events.push(event),
                    Err(_) => return events,
                }
            }
        }
    }

    #[tokio::test]
    async fn test_setup_broadcasts_roster() {
        let addr = spawn_server(test_config()).await;

        let mut alice = TestClient::connect(addr).await;
        let statuses = alice.setup("alice").await;
        assert!(statuses.is_empty());

        let mut bob = TestClient::connect(addr).await;
        bob.setup("bob").await;

        // Alice sees the roster grow.
        let event = alice
            .recv_until(|e| matches!(e, ServerEvent::OnlineUsers { users } if users.len() == 2))
            .await;
        if let ServerEvent::OnlineUsers { mut users } = event {
            users.sort();
            assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_call_negotiation_end_to_end() {
        let addr = spawn_server(test_config()).await;

        let mut alice = TestClient::connect(addr).await;
        alice.setup("alice").await;
        let mut bob = TestClient::connect(addr).await;
        bob.setup("bob").await;

        let offer = json!({"type": "offer", "sdp": "v=0\r\no=alice"});
        alice
            .send(&ClientEvent::call_user("bob", offer.clone()))
            .await;

        let incoming = bob
            .recv_until(|e| matches!(e, ServerEvent::IncomingCall { .. }))
            .await;
        let caller_socket = match incoming {
            ServerEvent::IncomingCall {
                from_user_id,
                from_socket_id,
                offer: received,
            } => {
                assert_eq!(from_user_id.as_deref(), Some("alice"));
                assert_eq!(from_socket_id, alice.connection_id);
                assert_eq!(received, offer);
                from_socket_id
            }
            _ => unreachable!(),
        };

        let answer = json!({"type": "answer", "sdp": "v=0\r\no=bob"});
        bob.send(&ClientEvent::answer_call(caller_socket.clone(), answer.clone()))
            .await;

        let accepted = alice
            .recv_until(|e| matches!(e, ServerEvent::CallAccepted { .. }))
            .await;
        assert_eq!(accepted, ServerEvent::CallAccepted { answer });

        // Candidates flow both ways, addressed by connection id.
        let candidate = json!({"candidate": "candidate:0 1 UDP 2122252543 192.0.2.1 54321 typ host"});
        let bob_socket = bob.connection_id.clone();
        alice
            .send(&ClientEvent::ice_candidate(bob_socket, candidate.clone()))
            .await;
        let forwarded = bob
            .recv_until(|e| matches!(e, ServerEvent::IceCandidate { .. }))
            .await;
        assert_eq!(forwarded, ServerEvent::IceCandidate { candidate });

        // Hang up from the callee side.
        bob.send(&ClientEvent::end_call("alice")).await;
        alice
            .recv_until(|e| matches!(e, ServerEvent::CallEnded))
            .await;
    }

    #[tokio::test]
    async fn test_call_to_unknown_user_is_dropped() {
        let addr = spawn_server(test_config()).await;

        let mut alice = TestClient::connect(addr).await;
        alice.setup("alice").await;

        alice
            .send(&ClientEvent::call_user("ghost", json!("offer")))
            .await;

        let events = alice.collect_for(Duration::from_millis(300)).await;
        assert!(events.is_empty(), "expected silence, got {events:?}");
    }

    #[tokio::test]
    async fn test_disconnect_updates_roster_without_call_ended() {
        let addr = spawn_server(test_config()).await;

        let mut alice = TestClient::connect(addr).await;
        alice.setup("alice").await;
        let mut bob = TestClient::connect(addr).await;
        bob.setup("bob").await;

        // A call is mid-negotiation when alice vanishes without end-call.
        alice
            .send(&ClientEvent::call_user("bob", json!("offer")))
            .await;
        bob.recv_until(|e| matches!(e, ServerEvent::IncomingCall { .. }))
            .await;

        drop(alice);

        let events = bob.collect_for(Duration::from_millis(500)).await;
        assert!(
            !events.contains(&ServerEvent::CallEnded),
            "disconnect must not synthesize call-ended: {events:?}"
        );
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ServerEvent::OnlineUsers { users } if users == &vec!["bob".to_string()])),
            "expected roster without alice: {events:?}"
        );
    }

    #[tokio::test]
    async fn test_status_updates_broadcast_and_seed_snapshot() {
        let addr = spawn_server(test_config()).await;

        let mut alice = TestClient::connect(addr).await;
        alice.setup("alice").await;

        // Two identical rapid updates produce two broadcasts.
        for _ in 0..2 {
            alice
                .send(&ClientEvent::set_status("alice", Some("busy".into())))
                .await;
        }
        for _ in 0..2 {
            let event = alice
                .recv_until(|e| matches!(e, ServerEvent::StatusUpdated { .. }))
                .await;
            assert_eq!(
                event,
                ServerEvent::StatusUpdated {
                    user_id: "alice".into(),
                    status: Some("busy".into()),
                }
            );
        }

        // A late joiner is seeded with the stored status.
        let mut bob = TestClient::connect(addr).await;
        let statuses = bob.setup("bob").await;
        assert_eq!(
            statuses,
            vec![StatusEntry {
                user_id: "alice".into(),
                status: "busy".into()
            }]
        );

        // Clearing removes it from the next snapshot.
        alice.send(&ClientEvent::set_status("alice", None)).await;
        bob.recv_until(
            |e| matches!(e, ServerEvent::StatusUpdated { status, .. } if status.is_none()),
        )
        .await;

        let mut carol = TestClient::connect(addr).await;
        let statuses = carol.setup("carol").await;
        assert!(statuses.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_kill_connection() {
        let addr = spawn_server(test_config()).await;

        let mut alice = TestClient::connect(addr).await;
        alice.setup("alice").await;

        // A well-framed garbage body, then a valid ping on the same socket.
        let mut bad = BytesMut::new();
        bad.extend_from_slice(&3u32.to_be_bytes());
        bad.extend_from_slice(&[0xc1, 0xc1, 0xc1]);
        alice.ws.send(WsMessage::Binary(bad.to_vec())).await.unwrap();

        alice.send(&ClientEvent::ping(Some(7))).await;
        let pong = alice
            .recv_until(|e| matches!(e, ServerEvent::Pong { .. }))
            .await;
        assert_eq!(pong, ServerEvent::Pong { timestamp: Some(7) });
    }

    #[tokio::test]
    async fn test_connection_cap_refuses_with_close() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let addr = spawn_server(config).await;

        let _alice = TestClient::connect(addr).await;

        // The second connection upgrades but is closed without a handshake.
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let refused = timeout(RECV_TIMEOUT, async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None => break true,
                    Some(Ok(WsMessage::Binary(_))) => break false,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break true,
                }
            }
        })
        .await
        .expect("timed out waiting for refusal");
        assert!(refused, "second connection should be refused");
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let mut config = test_config();
        config.heartbeat.timeout_ms = 300;
        let addr = spawn_server(config).await;

        let mut client = TestClient::connect(addr).await;
        client.setup("alice").await;

        // Stay silent and wait for the server to hang up.
        let closed = timeout(Duration::from_secs(5), async {
            loop {
                match client.ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "idle connection was not closed");
    }
}
