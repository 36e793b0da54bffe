//! Agent wire protocol.
//!
//! One JSON document per WebSocket text frame, discriminated by a `type`
//! field. Unknown fields are ignored; unknown message types are surfaced
//! as [`ParsedClientMessage::Unknown`] so the session can log and drop
//! them without failing the connection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::routing::RoutingDecision;
use super::task::{Complexity, FileHint, Task, VerificationStep};

/// Protocol version spoken by this hub. Mismatching agents are closed with
/// reason `unsupported_protocol`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Close reason sent on a protocol version mismatch.
pub const CLOSE_UNSUPPORTED_PROTOCOL: &str = "unsupported_protocol";

/// Messages the hub sends to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Push a task onto an idle agent.
    TaskAssign {
        task_id: Uuid,
        generation: u64,
        description: String,
        repo: Option<String>,
        branch: Option<String>,
        file_hints: Vec<FileHint>,
        success_criteria: Vec<String>,
        verification_steps: Vec<VerificationStep>,
        complexity: Complexity,
        routing_decision: Option<RoutingDecision>,
    },
    /// Reconnect recovery: the task was requeued, abandon local state.
    TaskReassign { task_id: Uuid },
    /// Reconnect recovery: keep going with the held generation.
    ///
    /// The protocol carries this variant for forward compatibility; the hub
    /// currently always answers with `TaskReassign`.
    TaskContinue { task_id: Uuid, generation: u64 },
    Ping,
    Pong,
    /// Handshake acknowledgment after a successful `identify`.
    Identified { agent_id: String },
}

/// A server message wrapped with the protocol version, as put on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    pub protocol_version: u32,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerFrame {
    pub fn new(message: ServerMessage) -> Self {
        Self { protocol_version: PROTOCOL_VERSION, message }
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl ServerMessage {
    /// Build a `task_assign` frame from a task snapshot.
    pub fn assign_from(task: &Task) -> Self {
        Self::TaskAssign {
            task_id: task.id,
            generation: task.generation,
            description: task.description.clone(),
            repo: task.repo.clone(),
            branch: task.branch.clone(),
            file_hints: task.file_hints.clone(),
            success_criteria: task.success_criteria.clone(),
            verification_steps: task.verification_steps.clone(),
            complexity: task.complexity.clone(),
            routing_decision: task.routing_decision.clone(),
        }
    }
}

/// Messages an agent sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Mandatory first frame on every connection.
    Identify {
        agent_id: String,
        token: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        client_type: Option<String>,
        protocol_version: u32,
    },
    TaskAccepted { task_id: Uuid },
    TaskRejected { task_id: Uuid, reason: String },
    TaskProgress { task_id: Uuid },
    TaskComplete {
        task_id: Uuid,
        generation: u64,
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    TaskFailed {
        task_id: Uuid,
        generation: u64,
        reason: String,
    },
    /// Sent at reconnect when the agent still holds a task locally.
    TaskRecovering {
        task_id: Uuid,
        last_status: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    Ping,
    Pong,
    /// Sidecar announces a co-located Ollama endpoint.
    OllamaReport {
        url: String,
        #[serde(default)]
        models: Vec<String>,
    },
    /// Sidecar reports host resource usage.
    ResourceReport {
        host: String,
        cpu: f64,
        ram: f64,
        vram_used: u64,
        vram_total: u64,
        #[serde(default)]
        loaded_models: Vec<String>,
    },
}

/// Outcome of parsing one inbound frame.
#[derive(Debug)]
pub enum ParsedClientMessage {
    Known(ClientMessage),
    /// Syntactically valid JSON with an unrecognized `type`.
    Unknown(String),
    Invalid(serde_json::Error),
}

/// Message type names this protocol version understands.
const KNOWN_CLIENT_TYPES: &[&str] = &[
    "identify",
    "task_accepted",
    "task_rejected",
    "task_progress",
    "task_complete",
    "task_failed",
    "task_recovering",
    "ping",
    "pong",
    "ollama_report",
    "resource_report",
];

/// Parse one inbound text frame.
pub fn parse_client_message(text: &str) -> ParsedClientMessage {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => ParsedClientMessage::Known(msg),
        Err(err) => {
            // Distinguish an unknown message type (log-and-drop per the
            // protocol contract) from a known type with a bad payload.
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
                if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
                    if !KNOWN_CLIENT_TYPES.contains(&kind) {
                        return ParsedClientMessage::Unknown(kind.to_string());
                    }
                }
            }
            ParsedClientMessage::Invalid(err)
        }
    }
}
