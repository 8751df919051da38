use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cause attached to a failed execution run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The tool-call loop hit its iteration cap without a final answer.
    LoopExhausted,
    /// The reasoning step itself returned an error.
    ReasonerError,
    /// A tool failed irrecoverably mid-run.
    ToolFatal,
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionErrorKind::LoopExhausted => "loop_exhausted",
            ExecutionErrorKind::ReasonerError => "reasoner_error",
            ExecutionErrorKind::ToolFatal => "tool_fatal",
        };
        write!(f, "{}", s)
    }
}

/// Closed error taxonomy for the orchestration core.
///
/// Validation errors are surfaced back to the caller/agent for
/// self-correction; execution errors are recorded in the ExecutionResult;
/// persistence errors are retried by the scheduler with backoff; anything
/// else lands in `Unexpected` and becomes a user-visible failure message
/// rather than a process crash.
#[derive(Debug, Error)]
pub enum ValetError {
    #[error("validation failed: {detail}")]
    Validation {
        detail: String,
        tool: Option<String>,
        agent_id: Option<String>,
    },

    #[error("execution failed for agent {agent_id} ({kind}): {detail}")]
    Execution {
        agent_id: String,
        kind: ExecutionErrorKind,
        detail: String,
    },

    #[error("persistence failure during {operation}: {detail}")]
    Persistence {
        operation: String,
        detail: String,
        trigger_id: Option<i64>,
    },

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ValetError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation {
            detail: detail.into(),
            tool: None,
            agent_id: None,
        }
    }

    pub fn persistence(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            detail: detail.into(),
            trigger_id: None,
        }
    }
}

/// Errors a tool invocation can report through the registry boundary.
///
/// `InvalidArguments`, `UnknownTool`, and `Failed` are fed back into the
/// agent loop as observations so the agent can self-correct; `Fatal` aborts
/// the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid arguments for '{tool}': {detail}")]
    InvalidArguments { tool: String, detail: String },

    #[error("unknown tool: '{0}'")]
    UnknownTool(String),

    #[error("tool '{tool}' failed: {detail}")]
    Failed { tool: String, detail: String },

    #[error("tool '{tool}' failed irrecoverably: {detail}")]
    Fatal { tool: String, detail: String },
}

impl ToolError {
    /// Whether the agent loop may continue after observing this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ToolError::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_tool_error_is_not_recoverable() {
        let err = ToolError::Fatal {
            tool: "mail_send".into(),
            detail: "connection refused".into(),
        };
        assert!(!err.is_recoverable());
        assert!(ToolError::UnknownTool("foo_bar".into()).is_recoverable());
    }

    #[test]
    fn execution_error_displays_kind() {
        let err = ValetError::Execution {
            agent_id: "reminders".into(),
            kind: ExecutionErrorKind::LoopExhausted,
            detail: "12 iterations".into(),
        };
        let text = err.to_string();
        assert!(text.contains("reminders"));
        assert!(text.contains("loop_exhausted"));
    }
}
