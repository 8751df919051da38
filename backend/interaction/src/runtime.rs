//! Interaction runtime: the single entry point for a user-originated turn.
//!
//! Per turn it answers directly, delegates to the execution runtime for
//! exactly one agent, or suppresses a duplicate. Every user message and
//! every produced response is appended to the conversation log, in order,
//! before control returns to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use valet_conversation::{ConversationLog, DuplicateDetector};
use valet_core::{
    AgentMessage, ChannelAdapter, MessageContext, Role, TurnPlan, TurnPlanner, ValetError,
};
use valet_executor::ExecutionRuntime;

const HISTORY_WINDOW: usize = 50;

pub struct InteractionRuntime {
    planner: Arc<dyn TurnPlanner>,
    executor: Arc<ExecutionRuntime>,
    log: Arc<ConversationLog>,
    channel: Arc<dyn ChannelAdapter>,
    duplicates: Mutex<DuplicateDetector>,
    /// One mutex per agent id: back-to-back delegations to the same agent
    /// run serially, different agents run in parallel.
    agent_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InteractionRuntime {
    pub fn new(
        planner: Arc<dyn TurnPlanner>,
        executor: Arc<ExecutionRuntime>,
        log: Arc<ConversationLog>,
        channel: Arc<dyn ChannelAdapter>,
        duplicate_cache_size: usize,
        duplicate_window: Duration,
    ) -> Self {
        Self {
            planner,
            executor,
            log,
            channel,
            duplicates: Mutex::new(DuplicateDetector::new(
                duplicate_cache_size,
                duplicate_window,
            )),
            agent_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a user-authored message. Returns the delivered reply, if any.
    pub async fn handle_user_turn(
        &self,
        context: MessageContext,
        message: &str,
    ) -> Result<Option<String>, ValetError> {
        info!(
            source = %context.source,
            length = message.len(),
            "Processing user message"
        );

        if self.duplicates.lock().await.check_and_mark(Role::User, message) {
            self.log.record_noop("suppressed duplicate user message").await?;
            return Ok(None);
        }

        let history = self.log.recent(HISTORY_WINDOW).await?;
        self.log.record_user(message, context.clone()).await?;
        self.run_turn(context, message, &history).await
    }

    /// Handle a status update emitted by an execution agent mid-delegation.
    pub async fn handle_agent_report(
        &self,
        context: MessageContext,
        report: AgentMessage,
    ) -> Result<Option<String>, ValetError> {
        info!(
            sender = %report.sender,
            correlation_id = %report.correlation_id,
            "Processing agent report"
        );

        if self
            .duplicates
            .lock()
            .await
            .check_and_mark(Role::Agent, &report.body)
        {
            self.log.record_noop("suppressed duplicate agent report").await?;
            return Ok(None);
        }

        let history = self.log.recent(HISTORY_WINDOW).await?;
        self.log.record_agent_report(&report.body).await?;
        self.run_turn(context, &report.body, &history).await
    }

    async fn run_turn(
        &self,
        context: MessageContext,
        message: &str,
        history: &[valet_core::ConversationEntry],
    ) -> Result<Option<String>, ValetError> {
        let plan = match self.planner.plan_turn(message, history).await {
            Ok(plan) => plan,
            Err(e) => {
                // The user is never left without a response to a direct
                // question, even when planning itself fails.
                warn!(error = %e, "Turn planning failed");
                let apology = format!("Sorry, I couldn't process that: {e}");
                return self.emit_reply(&context, &apology).await;
            }
        };

        match plan {
            TurnPlan::Reply(text) => self.emit_reply(&context, &text).await,
            TurnPlan::Delegate {
                agent_id,
                instructions,
                acknowledgement,
            } => {
                self.delegate(&context, &agent_id, &instructions, &acknowledgement)
                    .await
            }
        }
    }

    /// Delegate one instruction to one agent. The acknowledgement entry is
    /// appended (and delivered) before the run starts; this is the only
    /// path to the execution runtime, so a delegation can never skip it.
    async fn delegate(
        &self,
        context: &MessageContext,
        agent_id: &str,
        instructions: &str,
        acknowledgement: &str,
    ) -> Result<Option<String>, ValetError> {
        let ack = if acknowledgement.trim().is_empty() {
            format!("On it, handing this to {agent_id}.")
        } else {
            acknowledgement.to_string()
        };
        self.log.record_reply(&ack, Some(context.clone())).await?;
        if let Err(e) = self.channel.deliver(context, &ack).await {
            warn!(error = %e, channel = self.channel.name(), "Acknowledgement delivery failed");
        }
        self.duplicates.lock().await.mark_seen(Role::Agent, &ack);

        let lock = self.agent_lock(agent_id).await;
        let _guard = lock.lock().await;

        debug!(agent = agent_id, "Delegating to execution runtime");
        let result = self.executor.execute(agent_id, instructions).await;

        if result.success {
            self.emit_reply(context, &result.response).await
        } else {
            let detail = result.error.as_deref().unwrap_or("unknown error");
            warn!(agent = agent_id, error = detail, "Delegated run failed");
            let failure_text = format!(
                "I wasn't able to finish that ({agent_id} run failed: {detail})."
            );
            self.emit_reply(context, &failure_text).await
        }
    }

    /// Append and deliver a reply unless it duplicates a very recent
    /// same-role entry, in which case a no-op marker is recorded instead.
    async fn emit_reply(
        &self,
        context: &MessageContext,
        text: &str,
    ) -> Result<Option<String>, ValetError> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        if self.duplicates.lock().await.check_and_mark(Role::Agent, text) {
            warn!(
                content_preview = &text[..text.len().min(100)],
                "Duplicate reply suppressed"
            );
            self.log.record_noop("suppressed duplicate reply").await?;
            return Ok(None);
        }

        self.log.record_reply(text, Some(context.clone())).await?;
        self.channel.deliver(context, text).await?;
        Ok(Some(text.to_string()))
    }

    async fn agent_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.agent_locks.lock().await;
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use valet_core::{
        ConversationEntry, LoopEvent, Reasoner, StepOutcome, ToolRegistry,
    };

    struct RecordingChannel {
        delivered: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn texts(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, _context: &MessageContext, text: &str) -> Result<(), ValetError> {
            self.delivered.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Planner driven by a closure over the inbound message.
    struct FnPlanner<F>(F);

    #[async_trait]
    impl<F> TurnPlanner for FnPlanner<F>
    where
        F: Fn(&str) -> TurnPlan + Send + Sync,
    {
        async fn plan_turn(
            &self,
            message: &str,
            _history: &[ConversationEntry],
        ) -> Result<TurnPlan, ValetError> {
            Ok((self.0)(message))
        }
    }

    struct EchoReasoner;

    #[async_trait]
    impl Reasoner for EchoReasoner {
        async fn step(
            &self,
            _agent_id: &str,
            instruction: &str,
            _transcript: &[LoopEvent],
        ) -> Result<StepOutcome, ValetError> {
            Ok(StepOutcome::Final(format!("done: {instruction}")))
        }
    }

    /// Reasoner that asserts only one run is inside it at a time.
    struct OverlapProbe {
        active: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl Reasoner for OverlapProbe {
        async fn step(
            &self,
            _agent_id: &str,
            instruction: &str,
            _transcript: &[LoopEvent],
        ) -> Result<StepOutcome, ValetError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(StepOutcome::Final(format!("ran {instruction}")))
        }
    }

    async fn build_runtime(
        planner: Arc<dyn TurnPlanner>,
        reasoner: Arc<dyn Reasoner>,
    ) -> (tempfile::TempDir, Arc<RecordingChannel>, InteractionRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(
            ConversationLog::open(dir.path().join("conversation.log"))
                .await
                .unwrap(),
        );
        let channel = RecordingChannel::new();
        let executor = Arc::new(ExecutionRuntime::new(
            reasoner,
            Arc::new(ToolRegistry::new()),
        ));
        let runtime = InteractionRuntime::new(
            planner,
            executor,
            log,
            channel.clone(),
            100,
            Duration::from_secs(60),
        );
        (dir, channel, runtime)
    }

    #[tokio::test]
    async fn direct_reply_is_logged_then_delivered() {
        let planner = Arc::new(FnPlanner(|_: &str| TurnPlan::Reply("hello there".into())));
        let (_dir, channel, runtime) = build_runtime(planner, Arc::new(EchoReasoner)).await;

        let reply = runtime
            .handle_user_turn(MessageContext::new("console"), "hi")
            .await
            .unwrap();

        assert_eq!(reply.as_deref(), Some("hello there"));
        assert_eq!(channel.texts(), vec!["hello there".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_user_message_records_noop_marker() {
        let planner = Arc::new(FnPlanner(|_: &str| TurnPlan::Reply("first answer".into())));
        let (_dir, channel, runtime) = build_runtime(planner, Arc::new(EchoReasoner)).await;

        let ctx = MessageContext::new("console");
        runtime.handle_user_turn(ctx.clone(), "what time is it").await.unwrap();
        let second = runtime.handle_user_turn(ctx, "what time is it").await.unwrap();

        assert!(second.is_none());
        assert_eq!(channel.texts().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_reply_becomes_noop_entry_not_second_delivery() {
        let planner = Arc::new(FnPlanner(|_: &str| {
            TurnPlan::Reply("your meeting is at 3pm".into())
        }));
        let (_dir, channel, runtime) = build_runtime(planner, Arc::new(EchoReasoner)).await;

        let ctx = MessageContext::new("console");
        runtime.handle_user_turn(ctx.clone(), "when is my meeting").await.unwrap();
        let second = runtime
            .handle_user_turn(ctx, "meeting time again?")
            .await
            .unwrap();

        assert!(second.is_none());
        assert_eq!(channel.texts().len(), 1);

        let entries = runtime.log.replay().await.unwrap();
        let markers: Vec<_> = entries
            .iter()
            .filter(|e| e.role == Role::System && e.content.contains("duplicate reply"))
            .collect();
        assert_eq!(markers.len(), 1);
        let identical: Vec<_> = entries
            .iter()
            .filter(|e| e.role == Role::Agent && e.content == "your meeting is at 3pm")
            .collect();
        assert_eq!(identical.len(), 1);
    }

    #[tokio::test]
    async fn delegation_appends_acknowledgement_before_result() {
        let planner = Arc::new(FnPlanner(|msg: &str| TurnPlan::Delegate {
            agent_id: "calendar".into(),
            instructions: msg.to_string(),
            acknowledgement: "Checking your calendar now.".into(),
        }));
        let (_dir, channel, runtime) = build_runtime(planner, Arc::new(EchoReasoner)).await;

        runtime
            .handle_user_turn(MessageContext::new("console"), "free at noon?")
            .await
            .unwrap();

        let entries = runtime.log.replay().await.unwrap();
        let contents: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
        let ack_pos = contents
            .iter()
            .position(|c| *c == "Checking your calendar now.")
            .expect("acknowledgement entry missing");
        let result_pos = contents
            .iter()
            .position(|c| c.starts_with("done:"))
            .expect("result entry missing");
        assert!(ack_pos < result_pos);
        assert_eq!(channel.texts().len(), 2);
    }

    #[tokio::test]
    async fn failed_delegation_still_answers_the_user() {
        struct FailingReasoner;

        #[async_trait]
        impl Reasoner for FailingReasoner {
            async fn step(
                &self,
                agent_id: &str,
                _instruction: &str,
                _transcript: &[LoopEvent],
            ) -> Result<StepOutcome, ValetError> {
                Err(ValetError::Execution {
                    agent_id: agent_id.to_string(),
                    kind: valet_core::ExecutionErrorKind::ReasonerError,
                    detail: "provider unreachable".into(),
                })
            }
        }

        let planner = Arc::new(FnPlanner(|msg: &str| TurnPlan::Delegate {
            agent_id: "mail".into(),
            instructions: msg.to_string(),
            acknowledgement: String::new(),
        }));
        let (_dir, channel, runtime) = build_runtime(planner, Arc::new(FailingReasoner)).await;

        let reply = runtime
            .handle_user_turn(MessageContext::new("console"), "send the report")
            .await
            .unwrap();

        let reply = reply.expect("user must get a response");
        assert!(reply.contains("wasn't able to finish"));
        // Ack + failure summary both delivered.
        assert_eq!(channel.texts().len(), 2);
    }

    #[tokio::test]
    async fn same_agent_delegations_are_serialized() {
        let probe = Arc::new(OverlapProbe {
            active: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let planner = Arc::new(FnPlanner(|msg: &str| TurnPlan::Delegate {
            agent_id: "reminders".into(),
            instructions: msg.to_string(),
            acknowledgement: format!("ack {msg}"),
        }));
        let (_dir, _channel, runtime) = build_runtime(planner, probe.clone()).await;
        let runtime = Arc::new(runtime);

        let a = {
            let rt = runtime.clone();
            tokio::spawn(async move {
                rt.handle_user_turn(MessageContext::new("console"), "task one")
                    .await
                    .unwrap()
            })
        };
        let b = {
            let rt = runtime.clone();
            tokio::spawn(async move {
                rt.handle_user_turn(MessageContext::new("console"), "task two")
                    .await
                    .unwrap()
            })
        };
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(probe.max_seen.load(Ordering::SeqCst), 1);
    }
}
