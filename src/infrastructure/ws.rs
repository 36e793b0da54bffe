//! Agent WebSocket sessions.
//!
//! One long-lived connection per agent. The first frame must be
//! `identify`; after a successful handshake the session pumps frames in
//! both directions: outbound pushes arrive over an mpsc channel from the
//! agent registry, inbound frames are parsed and dispatched to it. The
//! server pings on an interval and closes the connection when inbound
//! traffic stops past the grace period.
//!
//! The session logic is generic over the frame reader and writer; the
//! upgrade handler splits the real socket into the two halves.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::domain::models::agent::AgentIdentity;
use crate::domain::models::config::AgentsConfig;
use crate::domain::models::protocol::{
    parse_client_message, ClientMessage, ParsedClientMessage, ServerFrame, ServerMessage,
    CLOSE_UNSUPPORTED_PROTOCOL, PROTOCOL_VERSION,
};
use crate::domain::ports::AuthStore;
use crate::services::agent_registry::AgentRegistry;
use crate::services::endpoint_registry::EndpointRegistry;
use crate::services::presence::Presence;

/// Close code used for policy violations (bad token, version mismatch).
const CLOSE_POLICY: u16 = 1008;

/// Shared state for the agent WebSocket endpoint.
pub struct WsState {
    pub registry: Arc<AgentRegistry>,
    pub endpoints: Arc<EndpointRegistry>,
    pub presence: Arc<Presence>,
    pub auth: Arc<dyn AuthStore>,
    pub config: AgentsConfig,
}

/// `GET /ws/agent` upgrade handler.
pub async fn ws_agent(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: Arc<WsState>) {
    let (writer, reader) = socket.split();
    run_session(reader, writer, state).await;
}

/// Full session lifecycle over any frame transport: handshake, pump, and
/// disconnect cleanup.
async fn run_session<R, W>(mut reader: R, mut writer: W, state: Arc<WsState>)
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    W: Sink<Message> + Unpin,
{
    // Handshake: the first frame must be a valid identify.
    let Some(identity) = handshake(&mut reader, &mut writer, &state).await else {
        return;
    };
    let agent_id = identity.id.clone();

    let (tx, mut outbound) = mpsc::unbounded_channel::<ServerMessage>();
    if let Err(err) = state.registry.connect(identity, tx).await {
        tracing::error!(agent_id, error = %err, "Failed to register agent");
        return;
    }
    let _ =
        send_frame(&mut writer, ServerMessage::Identified { agent_id: agent_id.clone() }).await;
    tracing::info!(agent_id, "Agent session established");

    let ping_interval = Duration::from_millis(state.config.ping_interval_ms.max(10));
    let deadline =
        Duration::from_millis(state.config.ping_interval_ms + state.config.pong_grace_ms);
    let mut ping_timer = tokio::time::interval(ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_inbound = tokio::time::Instant::now();

    loop {
        tokio::select! {
            // Pushes from the registry (task_assign etc.). A closed channel
            // means the registry evicted us.
            message = outbound.recv() => {
                match message {
                    Some(message) => {
                        if send_frame(&mut writer, message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            frame = reader.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = tokio::time::Instant::now();
                        state.presence.heartbeat(&agent_id).await;
                        if let Some(reply) = dispatch(&state, &agent_id, &text).await {
                            if send_frame(&mut writer, reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_inbound = tokio::time::Instant::now();
                        state.presence.heartbeat(&agent_id).await;
                        if writer.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_inbound = tokio::time::Instant::now();
                        state.presence.heartbeat(&agent_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!(agent_id, "Ignoring binary frame");
                    }
                    Some(Err(err)) => {
                        tracing::debug!(agent_id, error = %err, "Socket error");
                        break;
                    }
                }
            }

            _ = ping_timer.tick() => {
                if last_inbound.elapsed() > deadline {
                    tracing::warn!(agent_id, "Agent missed the pong deadline; closing");
                    break;
                }
                if send_frame(&mut writer, ServerMessage::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Err(err) = state.registry.disconnect(&agent_id, "socket_closed").await {
        tracing::error!(agent_id, error = %err, "Disconnect cleanup failed");
    }
}

/// Read and validate the identify frame. Returns `None` after closing the
/// socket on any handshake failure.
async fn handshake<R, W>(reader: &mut R, writer: &mut W, state: &WsState) -> Option<AgentIdentity>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    W: Sink<Message> + Unpin,
{
    let text = loop {
        match reader.next().await? {
            Ok(Message::Text(text)) => break text,
            Ok(Message::Ping(data)) => {
                writer.send(Message::Pong(data)).await.ok()?;
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    };

    let ParsedClientMessage::Known(ClientMessage::Identify {
        agent_id,
        token,
        name,
        capabilities,
        client_type,
        protocol_version,
    }) = parse_client_message(&text)
    else {
        tracing::warn!("First frame was not identify; closing");
        close_with(writer, "identify_required").await;
        return None;
    };

    if protocol_version != PROTOCOL_VERSION {
        tracing::warn!(agent_id, protocol_version, "Unsupported protocol version");
        close_with(writer, CLOSE_UNSUPPORTED_PROTOCOL).await;
        return None;
    }

    match state.auth.resolve(&token).await {
        Ok(Some(resolved)) if resolved == agent_id => {}
        Ok(_) => {
            tracing::warn!(agent_id, "Token rejected");
            close_with(writer, "invalid_token").await;
            return None;
        }
        Err(err) => {
            tracing::error!(error = %err, "Auth store lookup failed");
            close_with(writer, "auth_unavailable").await;
            return None;
        }
    }

    Some(AgentIdentity {
        id: agent_id,
        name,
        capabilities: capabilities.into_iter().collect(),
        client_type,
        protocol_version,
    })
}

/// Route one parsed inbound frame; returns an optional direct reply.
async fn dispatch(state: &WsState, agent_id: &str, text: &str) -> Option<ServerMessage> {
    let message = match parse_client_message(text) {
        ParsedClientMessage::Known(message) => message,
        ParsedClientMessage::Unknown(kind) => {
            tracing::debug!(agent_id, kind, "Dropping unknown message type");
            return None;
        }
        ParsedClientMessage::Invalid(err) => {
            tracing::debug!(agent_id, error = %err, "Dropping malformed frame");
            return None;
        }
    };

    match message {
        ClientMessage::Ping => return Some(ServerMessage::Pong),
        ClientMessage::Pong => {}
        ClientMessage::Identify { .. } => {
            tracing::debug!(agent_id, "Duplicate identify ignored");
        }
        ClientMessage::TaskAccepted { task_id } => {
            log_err(state.registry.on_accepted(agent_id, task_id).await, agent_id);
        }
        ClientMessage::TaskRejected { task_id, reason } => {
            log_err(state.registry.on_rejected(agent_id, task_id, &reason).await, agent_id);
        }
        ClientMessage::TaskProgress { task_id } => {
            log_err(state.registry.on_progress(agent_id, task_id).await, agent_id);
        }
        ClientMessage::TaskComplete { task_id, generation, result } => {
            log_err(
                state.registry.on_complete(agent_id, task_id, generation, result).await,
                agent_id,
            );
        }
        ClientMessage::TaskFailed { task_id, generation, reason } => {
            log_err(
                state
                    .registry
                    .on_failed(agent_id, task_id, generation, &reason)
                    .await
                    .map(|_| ()),
                agent_id,
            );
        }
        ClientMessage::TaskRecovering { task_id, last_status, .. } => {
            tracing::info!(agent_id, %task_id, last_status, "Agent reports in-flight task at reconnect");
            match state.registry.on_recovering(agent_id, task_id).await {
                Ok(reply) => return Some(reply),
                Err(err) => tracing::error!(agent_id, error = %err, "Recovery handling failed"),
            }
        }
        ClientMessage::OllamaReport { url, .. } => {
            if let Err(err) = state.endpoints.register(&url).await {
                tracing::warn!(agent_id, url, error = %err, "Sidecar endpoint announcement rejected");
            }
        }
        ClientMessage::ResourceReport { host, cpu, ram, vram_used, vram_total, loaded_models } => {
            state
                .endpoints
                .record_resources(crate::domain::models::ResourceReport {
                    host,
                    cpu,
                    ram,
                    vram_used_mb: vram_used,
                    vram_total_mb: vram_total,
                    loaded_models,
                    reported_at: chrono::Utc::now(),
                })
                .await;
        }
    }
    None
}

fn log_err(result: crate::domain::errors::DomainResult<()>, agent_id: &str) {
    if let Err(err) = result {
        tracing::error!(agent_id, error = %err, "Agent message handling failed");
    }
}

async fn send_frame<W>(writer: &mut W, message: ServerMessage) -> Result<(), W::Error>
where
    W: Sink<Message> + Unpin,
{
    let json = ServerFrame::new(message).to_json();
    writer.send(Message::Text(json.into())).await
}

async fn close_with<W>(writer: &mut W, reason: &'static str)
where
    W: Sink<Message> + Unpin,
{
    let _ = writer
        .send(Message::Close(Some(CloseFrame { code: CLOSE_POLICY, reason: reason.into() })))
        .await;
}
