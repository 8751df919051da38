use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use valet_core::{
    ConversationEntry, LoopEvent, MessageContext, Reasoner, StepOutcome, ToolRegistry, TurnPlan,
    TurnPlanner, ValetError,
};
use valet_daemon::{AssistantService, ConsoleChannel};

/// Deterministic stand-in reasoning steps for running the core without an
/// LLM provider attached.
// TODO: replace with a provider-backed Reasoner/TurnPlanner implementation
// once a provider crate is wired in.
struct OfflinePlanner;

#[async_trait]
impl TurnPlanner for OfflinePlanner {
    async fn plan_turn(
        &self,
        message: &str,
        _history: &[ConversationEntry],
    ) -> Result<TurnPlan, ValetError> {
        Ok(TurnPlan::Delegate {
            agent_id: "assistant".into(),
            instructions: message.to_string(),
            acknowledgement: String::new(),
        })
    }
}

struct OfflineReasoner;

#[async_trait]
impl Reasoner for OfflineReasoner {
    async fn step(
        &self,
        _agent_id: &str,
        instruction: &str,
        _transcript: &[LoopEvent],
    ) -> Result<StepOutcome, ValetError> {
        Ok(StepOutcome::Final(format!(
            "No model provider is configured; recorded your request: {instruction}"
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = valet_config::config_file_path(&valet_config::config_dir());
    let settings = valet_config::load_settings(&config_path)?;

    valet_logging::init_logger(settings.log_dir(), &settings.logging.level);
    info!(config = %config_path.display(), "valetd starting");

    let service = AssistantService::start(
        &settings,
        Arc::new(OfflinePlanner),
        Arc::new(OfflineReasoner),
        Arc::new(ToolRegistry::new()),
        Arc::new(ConsoleChannel),
    )
    .await?;

    // Read turns from stdin until EOF or ctrl-c.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => {
                    service
                        .handle_user_turn(MessageContext::new("console"), line.trim())
                        .await?;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    service.shutdown().await;
    Ok(())
}
