use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a conversation entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human on the other end of a channel.
    User,
    /// The assistant (direct replies and delegated-run results).
    Agent,
    /// Orchestration markers (no-op entries, anomaly notes).
    System,
    /// Entries produced by a fired trigger's run.
    Trigger,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Agent => "agent",
            Role::System => "system",
            Role::Trigger => "trigger",
        };
        write!(f, "{}", s)
    }
}

/// Where a message came from, threaded explicitly through every call so the
/// eventual response can be routed back to the originating channel adapter.
/// Scoped to one request; never shared across concurrent requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    /// Channel adapter name (e.g. "console", "telegram").
    pub source: String,
    /// Sender identity within that channel, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// When the channel adapter received the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sender: None,
            timestamp: Some(Utc::now()),
        }
    }
}

/// One immutable record in the durable conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    /// Monotonic, gap-free sequence id assigned by the log on append.
    pub sequence: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MessageContext>,
}

/// Recipient of an inter-agent message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(String),
    User,
}

/// Ephemeral message exchanged during one delegation. Its effects persist
/// only via the conversation entries the runtimes write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub sender: String,
    pub recipient: Recipient,
    pub body: String,
    pub correlation_id: Uuid,
}

impl AgentMessage {
    pub fn to_user(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: Recipient::User,
            body: body.into(),
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// Outcome of one Execution Runtime run. Consumed by the caller and then
/// discarded; its textual effect survives only in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub agent_id: String,
    pub success: bool,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tools_executed: Vec<String>,
}

impl ExecutionResult {
    pub fn ok(agent_id: impl Into<String>, response: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            success: true,
            response: response.into(),
            error: None,
            tools_executed: tools,
        }
    }

    pub fn failed(
        agent_id: impl Into<String>,
        response: impl Into<String>,
        error: impl Into<String>,
        tools: Vec<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            success: false,
            response: response.into(),
            error: Some(error.into()),
            tools_executed: tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_entry_roundtrip() {
        let entry = ConversationEntry {
            sequence: 7,
            role: Role::Trigger,
            content: "reminder fired".into(),
            timestamp: Utc::now(),
            context: Some(MessageContext::new("console")),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: ConversationEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sequence, 7);
        assert_eq!(back.role, Role::Trigger);
        assert_eq!(back.content, "reminder fired");
    }

    #[test]
    fn role_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&Role::Trigger).unwrap(), "\"trigger\"");
    }

    #[test]
    fn execution_result_failure_carries_error() {
        let result = ExecutionResult::failed("mail-agent", "could not finish", "loop exhausted", vec![]);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("loop exhausted"));
    }
}
