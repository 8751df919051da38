use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ToolError, ValetError};
use crate::trigger::{NewTrigger, Trigger, TriggerId};
use crate::types::{ConversationEntry, MessageContext};

/// A single requested tool invocation from a reasoning step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub name: String,
    /// JSON object mapping argument names to values.
    pub arguments: serde_json::Value,
}

/// A capability an agent can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. "create_trigger").
    fn name(&self) -> &str;

    /// Description surfaced to the reasoning step.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> serde_json::Value;

    async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

/// What the reasoning step produced for one loop iteration: either a final
/// answer, or exactly one tool invocation to execute and observe.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Final(String),
    Call {
        /// Assistant text accompanying the call, if any.
        assistant_text: String,
        call: ToolCall,
    },
}

/// One event in an execution run's working transcript. Ephemeral: the
/// caller persists only the final result and the user-visible turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopEvent {
    /// What the reasoning step said (and requested) this iteration.
    Assistant {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call: Option<ToolCall>,
    },
    /// The outcome of a tool invocation, fed back for the next iteration.
    Observation {
        tool: String,
        success: bool,
        payload: serde_json::Value,
    },
}

impl LoopEvent {
    pub fn observation(tool: impl Into<String>, success: bool, payload: serde_json::Value) -> Self {
        LoopEvent::Observation {
            tool: tool.into(),
            success,
            payload,
        }
    }
}

/// The execution agent's reasoning step.
///
/// Implementations wrap an LLM provider; tests use deterministic stubs.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn step(
        &self,
        agent_id: &str,
        instruction: &str,
        transcript: &[LoopEvent],
    ) -> Result<StepOutcome, ValetError>;
}

/// What the interaction layer decided to do with a turn. Suppression is not
/// a plan; the runtime applies duplicate-avoidance itself.
#[derive(Debug, Clone)]
pub enum TurnPlan {
    /// Answer directly, no delegation.
    Reply(String),
    /// Delegate to one execution agent and await its result.
    Delegate {
        agent_id: String,
        instructions: String,
        /// Appended to the log before the run starts.
        acknowledgement: String,
    },
}

/// The interaction layer's reasoning step: decides how to act on a turn
/// given recent history.
#[async_trait]
pub trait TurnPlanner: Send + Sync {
    async fn plan_turn(
        &self,
        message: &str,
        history: &[ConversationEntry],
    ) -> Result<TurnPlan, ValetError>;
}

/// Durable persistence for trigger definitions and their next-fire state.
/// Consumed by the scheduler as an opaque CRUD interface.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn create(&self, spec: NewTrigger) -> Result<Trigger, ValetError>;

    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>, ValetError>;

    /// Persist the trigger's current status/next-fire/failure state.
    async fn update(&self, trigger: &Trigger) -> Result<(), ValetError>;

    /// Returns true if a trigger was deleted.
    async fn delete(&self, id: TriggerId) -> Result<bool, ValetError>;

    async fn list_non_terminal(&self) -> Result<Vec<Trigger>, ValetError>;
}

/// Delivers a final response to whichever external channel originated the
/// conversation. The orchestration core never implements delivery itself.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, context: &MessageContext, text: &str) -> Result<(), ValetError>;
}
