//! Composition root: constructs and wires the orchestration core.
//!
//! Everything is built here and injected by reference; no component
//! reaches for process-wide state.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use valet_config::Settings;
use valet_conversation::ConversationLog;
use valet_core::{
    ChannelAdapter, MessageContext, NewTrigger, Reasoner, ToolRegistry, Trigger, TriggerId,
    TriggerStore, TurnPlanner, ValetError,
};
use valet_executor::ExecutionRuntime;
use valet_interaction::InteractionRuntime;
use valet_scheduler::{RetryPolicy, SchedulerConfig, SchedulerHandle, SqliteTriggerStore, TriggerScheduler};

/// The assembled runtime: interaction surface plus the running scheduler.
pub struct AssistantService {
    interaction: Arc<InteractionRuntime>,
    scheduler: Arc<TriggerScheduler>,
    scheduler_task: JoinHandle<Result<(), ValetError>>,
    log: Arc<ConversationLog>,
}

impl AssistantService {
    /// Build and start the full orchestration core. The reasoning steps,
    /// tool registry, and channel adapter are owned by the caller and
    /// injected here.
    pub async fn start(
        settings: &Settings,
        planner: Arc<dyn TurnPlanner>,
        reasoner: Arc<dyn Reasoner>,
        tools: Arc<ToolRegistry>,
        channel: Arc<dyn ChannelAdapter>,
    ) -> Result<Self, ValetError> {
        let log = Arc::new(ConversationLog::open(settings.conversation_log_path()).await?);
        let store: Arc<dyn TriggerStore> =
            Arc::new(SqliteTriggerStore::open(&settings.trigger_store_path())?);

        let executor = Arc::new(
            ExecutionRuntime::new(reasoner, tools)
                .with_max_iterations(settings.executor.max_tool_iterations),
        );

        let interaction = Arc::new(InteractionRuntime::new(
            planner,
            executor.clone(),
            log.clone(),
            channel.clone(),
            settings.interaction.duplicate_cache_size,
            Duration::from_secs(settings.interaction.duplicate_window_secs),
        ));

        let scheduler_config = SchedulerConfig {
            failure_threshold: settings.scheduler.failure_threshold,
            retry: RetryPolicy {
                base_delay_ms: settings.scheduler.retry_base_delay_secs * 1_000,
                backoff_factor: settings.scheduler.retry_backoff_factor,
                max_delay_ms: settings.scheduler.retry_max_delay_secs * 1_000,
                jitter: true,
            },
            store_retry_delay: Duration::from_secs(settings.scheduler.store_retry_delay_secs),
            idle_wake: Duration::from_secs(settings.scheduler.idle_wake_secs),
        };
        let scheduler =
            TriggerScheduler::new(store, executor, log.clone(), channel, scheduler_config);
        let scheduler_task = tokio::spawn(scheduler.clone().run());

        info!(data_dir = %settings.data_dir.display(), "Assistant service started");

        Ok(Self {
            interaction,
            scheduler,
            scheduler_task,
            log,
        })
    }

    /// Entry point for channel watchers: handle one user turn.
    pub async fn handle_user_turn(
        &self,
        context: MessageContext,
        message: &str,
    ) -> Result<Option<String>, ValetError> {
        self.interaction.handle_user_turn(context, message).await
    }

    pub async fn schedule_trigger(&self, spec: NewTrigger) -> Result<Trigger, ValetError> {
        self.scheduler.schedule(spec).await
    }

    pub async fn cancel_trigger(&self, id: TriggerId) {
        self.scheduler.handle().cancel(id).await;
    }

    pub fn scheduler_handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    pub fn conversation_log(&self) -> Arc<ConversationLog> {
        self.log.clone()
    }

    /// Stop the scheduler loop and wait for it to wind down.
    pub async fn shutdown(self) {
        self.scheduler.handle().shutdown().await;
        let _ = self.scheduler_task.await;
        info!("Assistant service stopped");
    }
}
