//! Execution runtime: one bounded "think → call tool → observe" loop.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use valet_core::{
    ExecutionErrorKind, ExecutionResult, LoopEvent, Reasoner, StepOutcome, ToolCall, ToolError,
    ToolRegistry,
};

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 12;

/// Runs one agent's reasoning loop until it produces a final answer, hits
/// the iteration cap, or fails.
///
/// Independent runs may execute in parallel; back-to-back runs for the same
/// agent id are serialized by the caller, not here.
pub struct ExecutionRuntime {
    reasoner: Arc<dyn Reasoner>,
    tools: Arc<ToolRegistry>,
    max_tool_iterations: usize,
}

impl ExecutionRuntime {
    pub fn new(reasoner: Arc<dyn Reasoner>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            reasoner,
            tools,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_tool_iterations = max;
        self
    }

    /// Execute `instruction` as `agent_id`. Never panics and never returns
    /// an error: every failure mode lands in a failed `ExecutionResult`
    /// with a typed cause.
    pub async fn execute(&self, agent_id: &str, instruction: &str) -> ExecutionResult {
        info!(agent = agent_id, "Starting execution run");

        let mut transcript: Vec<LoopEvent> = Vec::new();
        let mut tools_executed: Vec<String> = Vec::new();
        let mut executed_signatures: HashSet<String> = HashSet::new();

        for iteration in 1..=self.max_tool_iterations {
            debug!(agent = agent_id, iteration, "Requesting reasoning step");

            let outcome = match self
                .reasoner
                .step(agent_id, instruction, &transcript)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(agent = agent_id, iteration, error = %e, "Reasoning step failed");
                    return ExecutionResult::failed(
                        agent_id,
                        format!("Failed to complete task: {e}"),
                        format!("{}: {e}", ExecutionErrorKind::ReasonerError),
                        tools_executed,
                    );
                }
            };

            let (assistant_text, call) = match outcome {
                StepOutcome::Final(text) => {
                    info!(
                        agent = agent_id,
                        iterations = iteration,
                        tools = tools_executed.len(),
                        "Execution run produced final answer"
                    );
                    return ExecutionResult::ok(agent_id, text, tools_executed);
                }
                StepOutcome::Call {
                    assistant_text,
                    call,
                } => (assistant_text, call),
            };

            transcript.push(LoopEvent::Assistant {
                text: assistant_text.clone(),
                call: Some(call.clone()),
            });

            // Malformed arguments are an observation the agent can correct,
            // not an abort.
            if !call.arguments.is_object() {
                warn!(agent = agent_id, tool = %call.name, "Tool call arguments are not an object");
                transcript.push(LoopEvent::observation(
                    &call.name,
                    false,
                    json!({
                        "tool": call.name,
                        "status": "error",
                        "error": format!(
                            "invalid arguments for '{}': expected a JSON object",
                            call.name
                        ),
                    }),
                ));
                continue;
            }

            // An identical invocation earlier in this run means the agent is
            // going in circles; stop before burning the remaining rounds.
            let signature = call_signature(&call);
            if !executed_signatures.insert(signature) {
                info!(agent = agent_id, tool = %call.name, "Repeated tool invocation, ending run early");
                let response = if assistant_text.is_empty() {
                    "Repeated tool invocation; stopping.".to_string()
                } else {
                    assistant_text
                };
                return ExecutionResult::ok(agent_id, response, tools_executed);
            }

            info!(agent = agent_id, tool = %call.name, iteration, "Executing tool");
            match self.tools.invoke(&call.name, call.arguments.clone()).await {
                Ok(payload) => {
                    tools_executed.push(call.name.clone());
                    debug!(agent = agent_id, tool = %call.name, "Tool completed");
                    transcript.push(LoopEvent::observation(
                        &call.name,
                        true,
                        json!({
                            "tool": call.name,
                            "status": "success",
                            "arguments": call.arguments,
                            "result": payload,
                        }),
                    ));
                }
                Err(e) if e.is_recoverable() => {
                    warn!(agent = agent_id, tool = %call.name, error = %e, "Tool call failed; feeding back");
                    transcript.push(LoopEvent::observation(
                        &call.name,
                        false,
                        json!({
                            "tool": call.name,
                            "status": "error",
                            "arguments": call.arguments,
                            "error": e.to_string(),
                        }),
                    ));
                }
                Err(e) => {
                    warn!(agent = agent_id, tool = %call.name, error = %e, "Tool failed irrecoverably");
                    return ExecutionResult::failed(
                        agent_id,
                        format!("Failed to complete task: {e}"),
                        format!("{}: {e}", ExecutionErrorKind::ToolFatal),
                        tools_executed,
                    );
                }
            }
        }

        warn!(
            agent = agent_id,
            max = self.max_tool_iterations,
            "Iteration cap reached without final answer"
        );
        ExecutionResult::failed(
            agent_id,
            "Failed to complete task: tool iteration limit reached without a final response",
            format!(
                "{}: {} iterations",
                ExecutionErrorKind::LoopExhausted,
                self.max_tool_iterations
            ),
            tools_executed,
        )
    }
}

/// Stable identity for a tool invocation: name plus canonicalized (sorted
/// key order) arguments.
fn call_signature(call: &ToolCall) -> String {
    format!("{}:{}", call.name, canonical_json(&call.arguments))
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}
