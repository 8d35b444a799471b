//! Runtime: registries, work queues, orchestration and activity dispatch.
//!
//! The runtime can be driven manually with [`Runtime::tick`] (deterministic,
//! used by tests and the CLI) or by background dispatcher loops started with
//! [`Runtime::start`]. Do not mix the two on one runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::providers::{HistoryStore, InstanceRecord, InstanceStatus, ProviderError};
use crate::{Event, OrchestrationContext, OrchestrationError};

mod dispatchers;
pub mod observability;
pub mod queue;
mod recovery;
pub mod registry;
pub mod replay_engine;

pub use observability::{LogFormat, MetricsSnapshot, ObservabilityConfig, init_logging};
pub use queue::{QueueKind, WorkItem, WorkQueues};
pub use recovery::RecoveryStats;
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy,
};

/// Retry schedule for failed activity attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. 1 disables retries.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based): doubles each
    /// time, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Configuration for dispatcher behavior.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between queue polls when a dispatcher has nothing to do.
    pub dispatcher_idle_sleep_ms: u64,
    /// Background orchestration dispatcher loops.
    pub orchestration_concurrency: usize,
    /// Background activity worker loops.
    pub worker_concurrency: usize,
    pub retry_policy: RetryPolicy,
    /// Poll interval used by `Client::wait_for_completion`.
    pub wait_poll_interval_ms: u64,
    /// Replays attempted for one batch before it is requeued on repeated conflicts.
    pub max_conflict_retries: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            retry_policy: RetryPolicy::default(),
            wait_poll_interval_ms: 10,
            max_conflict_retries: 8,
        }
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, OrchestrationError>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, OrchestrationError>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, OrchestrationError>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, OrchestrationError> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Metadata handed to an activity execution.
///
/// Activities run at least once; use [`idempotency_key`](Self::idempotency_key)
/// to deduplicate external side effects across redeliveries.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    activity_id: u64,
    activity_name: String,
    attempt: u32,
    worker_id: String,
}

impl ActivityContext {
    pub fn new(instance_id: impl Into<String>, activity_id: u64, activity_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            activity_id,
            activity_name: activity_name.into(),
            attempt,
            worker_id: String::new(),
        }
    }

    pub(crate) fn with_worker(mut self, worker_id: &str) -> Self {
        self.worker_id = worker_id.to_string();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Event id of the scheduling event for this call.
    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Stable key for this logical call: `"{instance}:{activity_id}"`.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.instance_id, self.activity_id)
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "ordo::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "ordo::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        tracing::error!(
            target: "ordo::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_debug(&self, message: impl AsRef<str>) {
        tracing::debug!(
            target: "ordo::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }
}

/// Summary of one [`Runtime::tick`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Orchestrator queue items taken this tick.
    pub orchestration_items: usize,
    /// Orchestration turns that ran and persisted history.
    pub turns: usize,
    /// Activity tasks executed this tick.
    pub activities_executed: usize,
}

impl TickStats {
    pub fn is_idle(&self) -> bool {
        self.orchestration_items == 0 && self.activities_executed == 0
    }

    fn accumulate(&mut self, other: TickStats) {
        self.orchestration_items += other.orchestration_items;
        self.turns += other.turns;
        self.activities_executed += other.activities_executed;
    }
}

/// Serializes orchestration turns per instance within this process.
#[derive(Default)]
pub(crate) struct InstanceLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub(crate) async fn lock(&self, instance: &str) -> OwnedMutexGuard<()> {
        let m = {
            let mut g = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(g.entry(instance.to_string()).or_default())
        };
        m.lock_owned().await
    }

    pub(crate) fn forget(&self, instance: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance);
    }
}

/// Status and output an instance record takes after `event`, if terminal.
pub(crate) fn terminal_status_of(event: &Event) -> Option<(InstanceStatus, String)> {
    match event {
        Event::OrchestrationCompleted { output, .. } => Some((InstanceStatus::Completed, output.clone())),
        Event::OrchestrationFailed { error, .. } => Some((InstanceStatus::Failed, error.to_string())),
        Event::OrchestrationTerminated { reason, .. } => Some((InstanceStatus::Terminated, reason.clone())),
        _ => None,
    }
}

/// Completion item for the parent of a terminal child instance.
pub(crate) fn parent_notification(record: &InstanceRecord) -> Option<WorkItem> {
    let parent = record.parent.as_ref()?;
    let output = record.output.clone().unwrap_or_default();
    let failed = |cause: String| WorkItem::SubOrchFailed {
        parent_instance: parent.instance.clone(),
        parent_id: parent.scheduling_event_id,
        error: OrchestrationError::SubOrchestrationFailed {
            name: record.orchestration.clone(),
            cause,
        },
    };
    match record.status {
        InstanceStatus::Completed => Some(WorkItem::SubOrchCompleted {
            parent_instance: parent.instance.clone(),
            parent_id: parent.scheduling_event_id,
            result: output,
        }),
        InstanceStatus::Failed => Some(failed(output)),
        InstanceStatus::Terminated => Some(failed(format!("terminated: {output}"))),
        InstanceStatus::Pending | InstanceStatus::Running => None,
    }
}

/// In-process orchestration runtime.
pub struct Runtime {
    pub(crate) history_store: Arc<dyn HistoryStore>,
    pub(crate) activities: ActivityRegistry,
    pub(crate) orchestrations: OrchestrationRegistry,
    pub(crate) queues: Arc<WorkQueues>,
    pub(crate) options: RuntimeOptions,
    pub(crate) instance_locks: InstanceLocks,
    pub(crate) metrics: observability::RuntimeMetrics,
    shutdown_flag: Arc<AtomicBool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build a manually ticked runtime with default options and run recovery.
    pub async fn new(
        history_store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Result<Arc<Self>, ProviderError> {
        Self::with_options(history_store, activities, orchestrations, RuntimeOptions::default()).await
    }

    /// Build a manually ticked runtime and rebuild its queues from the store.
    pub async fn with_options(
        history_store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, ProviderError> {
        let rt = Arc::new(Self {
            history_store,
            activities,
            orchestrations,
            queues: Arc::new(WorkQueues::new()),
            options,
            instance_locks: InstanceLocks::default(),
            metrics: observability::RuntimeMetrics::default(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            joins: Mutex::new(Vec::new()),
        });
        let stats = rt.recover().await?;
        tracing::info!(
            instances_resumed = stats.instances_resumed,
            activities_redispatched = stats.activities_redispatched,
            children_started = stats.children_started,
            parents_notified = stats.parents_notified,
            "runtime recovered queues from history store"
        );
        Ok(rt)
    }

    /// Build a runtime and spawn background dispatcher loops.
    pub async fn start(
        history_store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, ProviderError> {
        let rt = Self::with_options(history_store, activities, orchestrations, options).await?;
        let orch = Arc::clone(&rt).start_orchestration_dispatcher();
        let work = Arc::clone(&rt).start_work_dispatcher();
        rt.joins.lock().await.extend([orch, work]);
        Ok(rt)
    }

    /// Stop background dispatchers. In-flight work items finish or are aborted
    /// after `timeout`; anything lost is rebuilt by recovery on the next start.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.queues.wake_all();
        let mut joins = self.joins.lock().await;
        for mut j in joins.drain(..) {
            if tokio::time::timeout(timeout, &mut j).await.is_err() {
                j.abort();
            }
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Control-plane client sharing this runtime's store and queues.
    pub fn client(&self) -> crate::Client {
        crate::Client::new(
            Arc::clone(&self.history_store),
            Arc::clone(&self.queues),
            Duration::from_millis(self.options.wait_poll_interval_ms.max(1)),
        )
    }

    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.history_store)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Process everything currently queued: one turn per instance for the
    /// ready orchestrator items, then all ready activity tasks concurrently.
    pub async fn tick(&self) -> TickStats {
        let items = self.queues.drain(QueueKind::Orchestrator);
        let orchestration_items = items.len();

        let mut groups: Vec<(String, Vec<WorkItem>)> = Vec::new();
        for item in items {
            let instance = item.instance().to_string();
            match groups.iter_mut().find(|(i, _)| *i == instance) {
                Some((_, batch)) => batch.push(item),
                None => groups.push((instance, vec![item])),
            }
        }
        let turns = futures::future::join_all(
            groups
                .into_iter()
                .map(|(instance, batch)| async move { self.process_orchestration_items(&instance, batch).await }),
        )
        .await
        .into_iter()
        .filter(|ran| *ran)
        .count();

        let work = self.queues.drain(QueueKind::Worker);
        let activities_executed = work.len();
        futures::future::join_all(work.into_iter().map(|item| self.execute_activity(item, "tick"))).await;

        TickStats {
            orchestration_items,
            turns,
            activities_executed,
        }
    }

    /// Tick until a tick finds nothing to do.
    pub async fn run_until_idle(&self) -> TickStats {
        let mut total = TickStats::default();
        loop {
            let stats = self.tick().await;
            if stats.is_idle() {
                return total;
            }
            total.accumulate(stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(p.backoff(1), Duration::from_millis(10));
        assert_eq!(p.backoff(2), Duration::from_millis(20));
        assert_eq!(p.backoff(3), Duration::from_millis(40));
        assert_eq!(p.backoff(4), Duration::from_millis(50));
        assert_eq!(p.backoff(40), Duration::from_millis(50));
    }

    #[test]
    fn idempotency_key_combines_instance_and_call() {
        let ctx = ActivityContext::new("order-42", 3, "ProcessPayment", 1);
        assert_eq!(ctx.idempotency_key(), "order-42:3");
        assert_eq!(ctx.attempt(), 1);
    }

    #[test]
    fn parent_notification_maps_terminal_status() {
        let mut rec = InstanceRecord::pending("order-42::sub::5", "Notify", "x").with_parent("order-42", 5);
        assert!(parent_notification(&rec).is_none());

        rec.status = InstanceStatus::Completed;
        rec.output = Some("sent".into());
        assert_eq!(
            parent_notification(&rec),
            Some(WorkItem::SubOrchCompleted {
                parent_instance: "order-42".into(),
                parent_id: 5,
                result: "sent".into()
            })
        );

        rec.status = InstanceStatus::Terminated;
        rec.output = Some("cancelled".into());
        match parent_notification(&rec) {
            Some(WorkItem::SubOrchFailed { error, .. }) => assert_eq!(
                error,
                OrchestrationError::SubOrchestrationFailed {
                    name: "Notify".into(),
                    cause: "terminated: cancelled".into()
                }
            ),
            other => panic!("unexpected {other:?}"),
        }
    }
}
