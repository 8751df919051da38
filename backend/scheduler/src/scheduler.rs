//! Trigger scheduler: wakes at the next due trigger, executes it through
//! the execution runtime, and re-arms or retires it.
//!
//! One cooperative loop suspends on "next wake time or control signal";
//! each fired trigger runs in its own task so a long run never blocks the
//! loop from noticing the next due trigger.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use valet_conversation::ConversationLog;
use valet_core::{
    ChannelAdapter, MessageContext, NewTrigger, Trigger, TriggerId, TriggerSchedule,
    TriggerStatus, TriggerStore, ValetError,
};
use valet_executor::ExecutionRuntime;

use crate::retry::RetryPolicy;

const SIGNAL_BUFFER: usize = 64;
const STORE_RETRY_ATTEMPTS: u32 = 3;

/// External mutation signals the loop wakes on.
#[derive(Debug)]
pub enum SchedulerSignal {
    /// A trigger was created or updated; recompute the wake time.
    Refresh,
    Cancel(TriggerId),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Consecutive failures before a trigger gives up and notifies.
    pub failure_threshold: u32,
    pub retry: RetryPolicy,
    /// Delay between attempts when the trigger store is unavailable.
    pub store_retry_delay: Duration,
    /// Upper bound on how long the loop sleeps with no due trigger.
    pub idle_wake: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            retry: RetryPolicy::default(),
            store_retry_delay: Duration::from_secs(5),
            idle_wake: Duration::from_secs(300),
        }
    }
}

/// Cloneable handle for signalling the running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerSignal>,
}

impl SchedulerHandle {
    pub async fn refresh(&self) {
        let _ = self.tx.send(SchedulerSignal::Refresh).await;
    }

    pub async fn cancel(&self, id: TriggerId) {
        let _ = self.tx.send(SchedulerSignal::Cancel(id)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(SchedulerSignal::Shutdown).await;
    }
}

pub struct TriggerScheduler {
    store: Arc<dyn TriggerStore>,
    executor: Arc<ExecutionRuntime>,
    log: Arc<ConversationLog>,
    channel: Arc<dyn ChannelAdapter>,
    config: SchedulerConfig,
    in_flight: Mutex<HashSet<TriggerId>>,
    signal_tx: mpsc::Sender<SchedulerSignal>,
    signal_rx: std::sync::Mutex<Option<mpsc::Receiver<SchedulerSignal>>>,
}

impl TriggerScheduler {
    pub fn new(
        store: Arc<dyn TriggerStore>,
        executor: Arc<ExecutionRuntime>,
        log: Arc<ConversationLog>,
        channel: Arc<dyn ChannelAdapter>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        Arc::new(Self {
            store,
            executor,
            log,
            channel,
            config,
            in_flight: Mutex::new(HashSet::new()),
            signal_tx,
            signal_rx: std::sync::Mutex::new(Some(signal_rx)),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.signal_tx.clone(),
        }
    }

    /// Create a trigger and nudge the loop so the new wake time is noticed.
    pub async fn schedule(&self, spec: NewTrigger) -> Result<Trigger, ValetError> {
        let trigger = self.store.create(spec).await?;
        info!(
            trigger_id = trigger.id,
            agent = %trigger.agent_id,
            next_fire = ?trigger.next_fire_at,
            "Trigger scheduled"
        );
        let _ = self.signal_tx.send(SchedulerSignal::Refresh).await;
        Ok(trigger)
    }

    /// Run the scheduling loop until shutdown. Call once.
    pub async fn run(self: Arc<Self>) -> Result<(), ValetError> {
        let mut rx = self
            .signal_rx
            .lock()
            .expect("scheduler receiver lock poisoned")
            .take()
            .ok_or_else(|| ValetError::validation("scheduler is already running"))?;

        self.recover_stale_runs().await;
        info!("Trigger scheduler started");

        loop {
            let sleep_for = self.next_wake_in().await;
            debug!(sleep_ms = sleep_for.as_millis() as u64, "Scheduler sleeping");

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    self.fire_due().await;
                }
                signal = rx.recv() => match signal {
                    Some(SchedulerSignal::Refresh) => continue,
                    Some(SchedulerSignal::Cancel(id)) => self.cancel(id).await,
                    Some(SchedulerSignal::Shutdown) | None => {
                        info!("Trigger scheduler shutting down");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// On startup, triggers still marked running from a previous process
    /// lifetime are re-armed as retryable; a crash is not their fault.
    async fn recover_stale_runs(&self) {
        let triggers = match self.list_with_retry().await {
            Ok(triggers) => triggers,
            Err(e) => {
                error!(error = %e, "Could not load triggers for crash recovery");
                return;
            }
        };

        for mut trigger in triggers {
            if trigger.status != TriggerStatus::Running {
                continue;
            }
            let delay = self.config.retry.delay_for(1);
            trigger.status = TriggerStatus::Scheduled;
            trigger.next_fire_at = Some(Utc::now() + chrono_duration(delay));
            warn!(
                trigger_id = trigger.id,
                agent = %trigger.agent_id,
                retry_in_ms = delay.as_millis() as u64,
                "Recovered trigger left running by a previous process"
            );
            if let Err(e) = self.update_with_retry(&trigger).await {
                error!(trigger_id = trigger.id, error = %e, "Failed to persist recovered trigger");
            }
        }
    }

    /// Time until the earliest scheduled trigger is due, bounded by the
    /// idle wake interval.
    async fn next_wake_in(&self) -> Duration {
        let triggers = match self.list_with_retry().await {
            Ok(triggers) => triggers,
            Err(e) => {
                error!(error = %e, "Trigger store unavailable; backing off");
                return self.config.store_retry_delay;
            }
        };

        let now = Utc::now();
        let earliest = triggers
            .iter()
            .filter(|t| t.status == TriggerStatus::Scheduled)
            .filter_map(|t| t.next_fire_at)
            .min();

        match earliest {
            Some(due) if due <= now => Duration::ZERO,
            Some(due) => (due - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.config.idle_wake),
            None => self.config.idle_wake,
        }
    }

    async fn fire_due(self: &Arc<Self>) {
        let triggers = match self.list_with_retry().await {
            Ok(triggers) => triggers,
            Err(e) => {
                error!(error = %e, "Trigger store unavailable; skipping this cycle");
                return;
            }
        };

        let now = Utc::now();
        for trigger in triggers {
            if trigger.status != TriggerStatus::Scheduled {
                continue;
            }
            let due = match trigger.next_fire_at {
                Some(at) if at <= now => at,
                _ => continue,
            };

            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(trigger.id) {
                    // A second fire attempt before completion is rejected.
                    warn!(
                        trigger_id = trigger.id,
                        agent = %trigger.agent_id,
                        "Scheduling anomaly: trigger already in flight"
                    );
                    continue;
                }
            }

            let mut running = trigger.clone();
            running.status = TriggerStatus::Running;
            if let Err(e) = self.update_with_retry(&running).await {
                error!(trigger_id = trigger.id, error = %e, "Failed to mark trigger running");
                self.in_flight.lock().await.remove(&trigger.id);
                continue;
            }

            info!(
                trigger_id = trigger.id,
                agent = %running.agent_id,
                scheduled_for = %due,
                "Dispatching trigger"
            );

            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.execute_trigger(running, Utc::now()).await;
            });
        }
    }

    async fn execute_trigger(self: Arc<Self>, trigger: Trigger, fired_at: DateTime<Utc>) {
        let instructions = format_instructions(&trigger, fired_at);
        let result = self
            .executor
            .execute(&trigger.agent_id, &instructions)
            .await;

        if result.success {
            self.handle_success(trigger, fired_at, result.response).await;
        } else {
            let detail = result.error.unwrap_or_else(|| "unknown error".into());
            self.handle_failure(trigger, fired_at, detail).await;
        }
    }

    async fn handle_success(&self, trigger: Trigger, fired_at: DateTime<Utc>, response: String) {
        info!(trigger_id = trigger.id, agent = %trigger.agent_id, "Trigger completed");

        self.deliver_report(&trigger, &response).await;

        let cancelled = self.was_cancelled_meanwhile(trigger.id).await;
        let mut updated = trigger;
        updated.last_fired_at = Some(fired_at);
        updated.failure_count = 0;
        updated.last_error = None;

        if cancelled {
            // Cancelled mid-run: the run finished, but never re-arm.
            updated.status = TriggerStatus::Cancelled;
            updated.next_fire_at = None;
        } else {
            match &updated.schedule {
                TriggerSchedule::Once { .. } => {
                    updated.status = TriggerStatus::Completed;
                    updated.next_fire_at = None;
                }
                TriggerSchedule::Recurring { rule, .. } => {
                    match next_future_occurrence(rule, fired_at) {
                        Ok(Some(next)) => {
                            updated.status = TriggerStatus::Scheduled;
                            updated.next_fire_at = Some(next);
                        }
                        Ok(None) => {
                            info!(trigger_id = updated.id, "Recurrence exhausted; completing");
                            updated.status = TriggerStatus::Completed;
                            updated.next_fire_at = None;
                        }
                        Err(e) => {
                            error!(trigger_id = updated.id, error = %e, "Recurrence rule rejected");
                            updated.status = TriggerStatus::Failed;
                            updated.next_fire_at = None;
                            updated.last_error = Some(e.to_string());
                        }
                    }
                }
            }
        }

        self.finish_run(updated).await;
    }

    async fn handle_failure(&self, trigger: Trigger, fired_at: DateTime<Utc>, detail: String) {
        let cancelled = self.was_cancelled_meanwhile(trigger.id).await;
        let mut updated = trigger;
        updated.last_fired_at = Some(fired_at);
        updated.failure_count += 1;
        updated.last_error = Some(detail.clone());

        if cancelled {
            updated.status = TriggerStatus::Cancelled;
            updated.next_fire_at = None;
        } else if updated.failure_count >= self.config.failure_threshold {
            warn!(
                trigger_id = updated.id,
                agent = %updated.agent_id,
                failures = updated.failure_count,
                error = %detail,
                "Trigger reached failure threshold; giving up"
            );
            updated.status = TriggerStatus::Failed;
            updated.next_fire_at = None;

            // The user hears about the give-up exactly once, instead of the
            // trigger being retried silently forever.
            let notice = format!(
                "Scheduled task for {} failed {} times and won't be retried: {}",
                updated.agent_id, updated.failure_count, detail
            );
            self.deliver_report(&updated, &notice).await;
        } else {
            let delay = self.config.retry.delay_for(updated.failure_count);
            warn!(
                trigger_id = updated.id,
                agent = %updated.agent_id,
                attempt = updated.failure_count,
                retry_in_ms = delay.as_millis() as u64,
                error = %detail,
                "Trigger run failed; re-arming with backoff"
            );
            updated.status = TriggerStatus::Scheduled;
            updated.next_fire_at = Some(Utc::now() + chrono_duration(delay));
        }

        self.finish_run(updated).await;
    }

    /// Persist the post-run state, release the in-flight claim, and nudge
    /// the loop so any re-arm is noticed.
    async fn finish_run(&self, trigger: Trigger) {
        if let Err(e) = self.update_with_retry(&trigger).await {
            error!(trigger_id = trigger.id, error = %e, "Failed to persist trigger after run");
        }
        self.in_flight.lock().await.remove(&trigger.id);
        let _ = self.signal_tx.send(SchedulerSignal::Refresh).await;
    }

    /// Append the trigger-originated entry and hand it to the channel.
    async fn deliver_report(&self, trigger: &Trigger, text: &str) {
        if let Err(e) = self.log.record_trigger_report(text).await {
            error!(trigger_id = trigger.id, error = %e, "Failed to log trigger report");
        }
        let mut context = MessageContext::new("scheduler");
        context.sender = Some(trigger.agent_id.clone());
        if let Err(e) = self.channel.deliver(&context, text).await {
            warn!(trigger_id = trigger.id, error = %e, "Trigger report delivery failed");
        }
    }

    async fn was_cancelled_meanwhile(&self, id: TriggerId) -> bool {
        match self.store.get(id).await {
            Ok(Some(current)) => current.status == TriggerStatus::Cancelled,
            Ok(None) => true,
            Err(e) => {
                warn!(trigger_id = id, error = %e, "Could not re-check trigger status");
                false
            }
        }
    }

    async fn cancel(&self, id: TriggerId) {
        let trigger = match self.store.get(id).await {
            Ok(Some(trigger)) => trigger,
            Ok(None) => {
                warn!(trigger_id = id, "Cancel requested for unknown trigger");
                return;
            }
            Err(e) => {
                error!(trigger_id = id, error = %e, "Cancel failed reading trigger");
                return;
            }
        };

        if trigger.status.is_terminal() {
            debug!(trigger_id = id, status = %trigger.status, "Cancel is a no-op");
            return;
        }

        let mut updated = trigger;
        let was_running = updated.status == TriggerStatus::Running;
        updated.status = TriggerStatus::Cancelled;
        updated.next_fire_at = None;
        if let Err(e) = self.update_with_retry(&updated).await {
            error!(trigger_id = id, error = %e, "Failed to persist cancellation");
            return;
        }
        info!(
            trigger_id = id,
            was_running, "Trigger cancelled{}",
            if was_running { " (run will finish, no re-arm)" } else { "" }
        );
    }

    async fn list_with_retry(&self) -> Result<Vec<Trigger>, ValetError> {
        let mut attempt = 0;
        loop {
            match self.store.list_non_terminal().await {
                Ok(triggers) => return Ok(triggers),
                Err(e) => {
                    attempt += 1;
                    if attempt >= STORE_RETRY_ATTEMPTS {
                        return Err(e);
                    }
                    warn!(error = %e, attempt, "Trigger store list failed; retrying");
                    tokio::time::sleep(self.config.store_retry_delay).await;
                }
            }
        }
    }

    async fn update_with_retry(&self, trigger: &Trigger) -> Result<(), ValetError> {
        let mut attempt = 0;
        loop {
            match self.store.update(trigger).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= STORE_RETRY_ATTEMPTS {
                        return Err(e);
                    }
                    warn!(
                        trigger_id = trigger.id,
                        error = %e,
                        attempt,
                        "Trigger store update failed; retrying"
                    );
                    tokio::time::sleep(self.config.store_retry_delay).await;
                }
            }
        }
    }
}

/// Next occurrence strictly after `fired_at`, advanced repeatedly past any
/// instants already in the past so a long outage never causes a fire storm.
fn next_future_occurrence(
    rule: &valet_core::RecurrenceRule,
    fired_at: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ValetError> {
    let now = Utc::now();
    let mut candidate = rule.next_after(fired_at)?;
    while let Some(instant) = candidate {
        if instant > now {
            return Ok(Some(instant));
        }
        candidate = rule.next_after(instant)?;
    }
    Ok(None)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(1))
}

fn format_instructions(trigger: &Trigger, fired_at: DateTime<Utc>) -> String {
    let scheduled_for = trigger
        .next_fire_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| fired_at.to_rfc3339());
    format!(
        "Trigger fired at {} (UTC).\nScheduled occurrence time: {}.\nTrigger ID: {}\n\nPayload:\n{}",
        fired_at.to_rfc3339(),
        scheduled_for,
        trigger.id,
        trigger.payload
    )
}
