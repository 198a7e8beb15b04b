use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One inbound event from a messaging channel.
#[derive(Debug, Clone, JsonSchema, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub tenant_id: String,
    pub contact_id: String,
    /// Channel the message arrived on (`whatsapp`, `cli`, ...). Informational.
    #[serde(default)]
    pub channel: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(tenant_id: &str, contact_id: &str, channel: &str, text: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            contact_id: contact_id.to_string(),
            channel: channel.to_string(),
            text: text.to_string(),
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, JsonSchema, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Paused on a node waiting for the contact's next message.
    Awaiting,
    /// The flow reached a node with nowhere to go; the session was deleted.
    Completed,
    /// The contact sent an abandonment keyword.
    Abandoned,
    /// No session and no flow trigger matched.
    NoFlow,
    /// The turn hit a defect or an unrecoverable error; the session was deleted.
    Failed { reason: String },
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Awaiting => "awaiting",
            TurnOutcome::Completed => "completed",
            TurnOutcome::Abandoned => "abandoned",
            TurnOutcome::NoFlow => "no_flow",
            TurnOutcome::Failed { .. } => "failed",
        }
    }
}

/// What goes back to the channel after a turn.
#[derive(Debug, Clone, JsonSchema, Serialize, Deserialize, PartialEq)]
pub struct TurnReply {
    /// Rendered messages, in the order they were produced.
    pub messages: Vec<String>,
    pub awaiting_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Node the session is parked on, when it survives the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    pub outcome: TurnOutcome,
}

impl TurnReply {
    pub fn no_flow() -> Self {
        Self {
            messages: Vec::new(),
            awaiting_input: false,
            flow_id: None,
            current_node: None,
            outcome: TurnOutcome::NoFlow,
        }
    }

    /// All messages joined by blank lines, for channels that take one text blob.
    pub fn text(&self) -> String {
        self.messages.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_serializes_with_status_tag() {
        let failed = TurnOutcome::Failed {
            reason: "step limit".into(),
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"status": "failed", "reason": "step limit"})
        );
        assert_eq!(failed.as_str(), "failed");
        assert_eq!(
            serde_json::to_value(TurnOutcome::Awaiting).unwrap(),
            json!({"status": "awaiting"})
        );
    }

    #[test]
    fn inbound_channel_defaults_to_empty() {
        let msg: InboundMessage =
            serde_json::from_value(json!({"tenant_id": "acme", "contact_id": "555", "text": "hola"}))
                .unwrap();
        assert_eq!(msg, InboundMessage::new("acme", "555", "", "hola"));
    }

    #[test]
    fn reply_text_joins_messages() {
        let mut reply = TurnReply::no_flow();
        assert_eq!(reply.text(), "");
        reply.messages = vec!["Hola".into(), "¿Qué buscas?".into()];
        assert_eq!(reply.text(), "Hola\n\n¿Qué buscas?");
    }
}
