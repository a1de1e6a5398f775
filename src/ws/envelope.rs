//! Wire format for the WebSocket hub. Every frame carries one or more
//! `Envelope`s joined by `\n` (see spec.md §6). Typed payload structs
//! document the recognized `type` values without forcing a single
//! enum-of-everything onto the wire.

use crate::pool::PoolStatus;
use crate::registry::{AgentRegistration, AgentState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: impl Serialize) -> Self {
        Envelope {
            kind: kind.into(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscribePayload {
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribePayload {
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct CommandPayload {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshotPayload {
    pub pool: PoolStatus,
    pub agents: Vec<AgentRegistration>,
}

#[derive(Debug, Serialize)]
pub struct StatusUpdatePayload {
    pub agent_id: String,
    pub state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentRegisteredPayload {
    pub agent_id: String,
    pub agent: AgentRegistration,
}

#[derive(Debug, Serialize)]
pub struct AgentDeregisteredPayload {
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct LogsDataPayload {
    pub agent_id: String,
    pub line: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResultPayload {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new(
            "status.update",
            StatusUpdatePayload {
                agent_id: "a1".into(),
                state: AgentState::Executing,
                message: None,
                branch: None,
            },
        );
        let line = env.to_line();
        let parsed: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.kind, "status.update");
    }

    #[test]
    fn inbound_command_parses_with_default_args() {
        let raw = r#"{"type":"command","payload":{"id":"1","action":"shell"}}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.kind, "command");
        let cmd: CommandPayload = serde_json::from_value(env.payload).unwrap();
        assert_eq!(cmd.action, "shell");
        assert!(cmd.args.is_null());
    }
}
