//! Core types, error taxonomy, and interfaces shared across the valet
//! runtime crates.

pub mod error;
pub mod tools;
pub mod traits;
pub mod trigger;
pub mod types;

pub use error::{ExecutionErrorKind, ToolError, ValetError};
pub use tools::ToolRegistry;
pub use traits::{
    ChannelAdapter, LoopEvent, Reasoner, StepOutcome, Tool, ToolCall, TriggerStore, TurnPlan,
    TurnPlanner,
};
pub use trigger::{
    NewTrigger, RecurrenceRule, Trigger, TriggerId, TriggerSchedule, TriggerStatus,
};
pub use types::{
    AgentMessage, ConversationEntry, ExecutionResult, MessageContext, Recipient, Role,
};
