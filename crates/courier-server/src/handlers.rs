//! WebSocket session handling.
//!
//! Each socket runs one session: a `Hello` handshake binds the trusted
//! identity, the session auto-joins the user's own topic, and the loop
//! then multiplexes engine pushes with inbound frames until disconnect.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::routes;
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
use bytes::BytesMut;
use courier_core::{
    ConversationKey, Engine, EngineError, MemoryMembership, MemoryStore, PushEvent, StoreError,
    SubscriptionRegistry,
};
use courier_protocol::{codec, frames::code, ConversationRef, Frame, Version, PROTOCOL_VERSION};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The fan-out engine.
    pub engine: Engine,
    /// Group membership, shared with the engine; the HTTP routes own the
    /// write path.
    pub membership: Arc<MemoryMembership>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with in-memory services.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let membership = Arc::new(MemoryMembership::new());
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            membership.clone(),
            Arc::new(SubscriptionRegistry::new()),
        );

        Self {
            engine,
            membership,
            config,
        }
    }
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
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .merge(routes::api_router())
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Generate connection ID
    let connection_id = format!(
        "conn_{:x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    );

    debug!(connection = %connection_id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Handshake: the first frame must be Hello.
    let Some(identity) = await_hello(&mut sender, &mut receiver, &mut read_buffer).await else {
        debug!(connection = %connection_id, "Handshake failed");
        return;
    };

    info!(connection = %connection_id, identity = %identity, "Session established");

    // Register the outbound queue, then greet.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PushEvent>();
    state.engine.connect(&connection_id, event_tx);

    let welcome = Frame::welcome(
        &connection_id,
        PROTOCOL_VERSION.major,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &welcome).await.is_err() {
        state.engine.on_disconnect(&connection_id);
        return;
    }

    // Every session receives its own direct traffic; announce the cursor
    // so the client can reconcile backlog.
    let cursor = state.engine.join(&identity, &connection_id).await;
    metrics::record_subscription();
    if send_frame(&mut sender, &Frame::joined(0, cursor)).await.is_err() {
        state.engine.on_disconnect(&connection_id);
        return;
    }

    // The handshake read may have buffered more frames already.
    if drain_frames(&mut read_buffer, &connection_id, &identity, &state, &mut sender)
        .await
        .is_err()
    {
        state.engine.on_disconnect(&connection_id);
        return;
    }

    // Session loop
    loop {
        tokio::select! {
            biased;

            // Engine pushes: committed messages and ephemeral signals.
            Some(event) = event_rx.recv() => {
                let frame = match event {
                    PushEvent::Message(message) => Frame::deliver((*message).clone()),
                    PushEvent::Signal { topic, from, payload } => Frame::Signal {
                        topic,
                        from: Some(from),
                        payload,
                    },
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);
                        if drain_frames(&mut read_buffer, &connection_id, &identity, &state, &mut sender).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                        if drain_frames(&mut read_buffer, &connection_id, &identity, &state, &mut sender).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
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

    // Cleanup: total removal from every topic, exactly once.
    state.engine.on_disconnect(&connection_id);
    metrics::set_active_topics(state.engine.subscriptions().stats().topic_count);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Wait for the client's Hello frame and validate it.
///
/// Returns the bound identity, or `None` if the handshake failed (an error
/// frame has already been sent where appropriate).
async fn await_hello(
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Option<String> {
    loop {
        let msg = receiver.next().await?;
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Ping(data)) => {
                sender.send(Message::Pong(data)).await.ok()?;
                continue;
            }
            Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        };

        read_buffer.extend_from_slice(&data);
        match codec::decode_from(read_buffer) {
            Ok(Some(Frame::Hello { version, identity })) => {
                let client_version = Version::new(version, 0);
                if !PROTOCOL_VERSION.is_compatible_with(&client_version) {
                    let frame = Frame::error(
                        0,
                        code::INCOMPATIBLE_VERSION,
                        format!("Server speaks {PROTOCOL_VERSION}"),
                    );
                    let _ = send_frame(sender, &frame).await;
                    return None;
                }
                if identity.is_empty() {
                    let frame =
                        Frame::error(0, code::INVALID_ARGUMENT, "identity must not be empty");
                    let _ = send_frame(sender, &frame).await;
                    return None;
                }
                return Some(identity);
            }
            Ok(Some(other)) => {
                warn!(frame_type = ?other.frame_type(), "Expected hello frame");
                let frame = Frame::error(0, code::BAD_FRAME, "expected hello");
                let _ = send_frame(sender, &frame).await;
                return None;
            }
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Handshake decode error");
                return None;
            }
        }
    }
}

/// Decode and handle every complete frame currently buffered.
async fn drain_frames(
    read_buffer: &mut BytesMut,
    connection_id: &str,
    identity: &str,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<()> {
    loop {
        match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => {
                handle_frame(&frame, connection_id, identity, state, sender).await?;
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Frame decode error");
                metrics::record_error("decode");
                let frame = Frame::error(0, code::BAD_FRAME, e.to_string());
                send_frame(sender, &frame).await?;
                // The framing is broken beyond recovery.
                anyhow::bail!("undecodable frame stream");
            }
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: &Frame,
    connection_id: &str,
    identity: &str,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<()> {
    match frame {
        Frame::Join { id, topic } => {
            debug!(connection = %connection_id, topic = %topic, "Join request");

            let registry = state.engine.subscriptions();
            let limit = state.config.limits.max_subscriptions_per_connection;
            let response = if topic.is_empty() {
                Frame::error(*id, code::INVALID_ARGUMENT, "topic must not be empty")
            } else if !registry.is_subscribed(topic, connection_id)
                && registry.subscription_count(connection_id) >= limit
            {
                Frame::error(*id, code::LIMIT_EXCEEDED, "subscription limit reached")
            } else {
                let cursor = state.engine.join(topic, connection_id).await;
                metrics::record_subscription();
                metrics::set_active_topics(registry.stats().topic_count);
                Frame::joined(*id, cursor)
            };

            send_frame(sender, &response).await?;
        }

        Frame::Leave { id, topic } => {
            debug!(connection = %connection_id, topic = %topic, "Leave request");

            state.engine.leave(topic, connection_id);
            metrics::set_active_topics(state.engine.subscriptions().stats().topic_count);
            send_frame(sender, &Frame::ack(*id)).await?;
        }

        Frame::SendDirect { id, to, text } => {
            let start = Instant::now();
            let response = match state.engine.submit_direct(identity, to, text).await {
                Ok(submission) => {
                    metrics::record_submission(
                        "direct",
                        submission.delivered_to.len(),
                        submission.failed_deliveries,
                    );
                    Frame::sent(*id, submission.message)
                }
                Err(e) => engine_error_frame(*id, &e),
            };
            metrics::record_latency(start.elapsed().as_secs_f64());

            send_frame(sender, &response).await?;
        }

        Frame::SendGroup { id, group_id, text } => {
            let start = Instant::now();
            let response = match state.engine.submit_group(group_id, identity, text).await {
                Ok(submission) => {
                    metrics::record_submission(
                        "group",
                        submission.delivered_to.len(),
                        submission.failed_deliveries,
                    );
                    Frame::sent(*id, submission.message)
                }
                Err(e) => engine_error_frame(*id, &e),
            };
            metrics::record_latency(start.elapsed().as_secs_f64());

            send_frame(sender, &response).await?;
        }

        Frame::History {
            id,
            conversation,
            since,
            until,
        } => {
            let key = match conversation {
                ConversationRef::Direct { with } => ConversationKey::direct(identity, with.clone()),
                ConversationRef::Group { group_id } => ConversationKey::group(group_id.clone()),
            };

            let result = match until {
                Some(cursor) => state.engine.backlog(&key, *since, *cursor).await,
                None => state.engine.history(&key, *since).await,
            };

            let response = match result {
                Ok(messages) => Frame::backlog(*id, messages),
                Err(e) => engine_error_frame(*id, &e),
            };
            send_frame(sender, &response).await?;
        }

        Frame::Signal { topic, payload, .. } => {
            let reached =
                state
                    .engine
                    .signal(topic, identity, Some(connection_id), payload.clone());
            metrics::record_signal(reached);
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(*timestamp)).await?;
        }

        Frame::Pong { .. } => {
            // Keepalive response, nothing to do.
        }

        Frame::Hello { .. } => {
            debug!(connection = %connection_id, "Hello frame after handshake ignored");
        }

        _ => {
            warn!(connection = %connection_id, frame_type = ?frame.frame_type(), "Unexpected frame type");
            let response = Frame::error(0, code::BAD_FRAME, "unexpected frame type");
            send_frame(sender, &response).await?;
        }
    }

    Ok(())
}

/// Map an engine error to an error frame.
fn engine_error_frame(id: u64, e: &EngineError) -> Frame {
    let error_code = match e {
        EngineError::InvalidArgument(_) => code::INVALID_ARGUMENT,
        EngineError::GroupNotFound(_) => code::NOT_FOUND,
        // The engine validates before it appends, so a store rejection is
        // an internal fault.
        EngineError::Store(_) => code::INTERNAL,
    };
    if error_code == code::INTERNAL {
        metrics::record_error("store");
    }
    Frame::error(id, error_code, e.to_string())
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_frame_codes() {
        let invalid = engine_error_frame(1, &EngineError::InvalidArgument("from must not be empty"));
        assert!(matches!(
            invalid,
            Frame::Error { id: 1, code: code::INVALID_ARGUMENT, .. }
        ));

        let missing = engine_error_frame(2, &EngineError::GroupNotFound("g1".into()));
        assert!(matches!(
            missing,
            Frame::Error { id: 2, code: code::NOT_FOUND, .. }
        ));

        let fault = engine_error_frame(
            3,
            &EngineError::Store(StoreError::ValidationFailed("text too long")),
        );
        assert!(matches!(
            fault,
            Frame::Error { id: 3, code: code::INTERNAL, .. }
        ));
    }
}
