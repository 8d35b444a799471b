//! Orchestration dispatcher.
//!
//! One batch of work items for an instance becomes one turn: load history,
//! convert completions to events, replay the orchestration, append the new
//! events with compare-and-set ids, update the instance record, then hand the
//! turn's actions to the worker queue (or start child instances).

use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::super::replay_engine::{ReplayEngine, TurnResult};
use super::super::{QueueKind, Runtime, WorkItem, parent_notification, terminal_status_of};
use crate::client::ClientError;
use crate::providers::{InstanceRecord, InstanceStatus, ProviderError};
use crate::{Action, Event, OrchestrationError};

impl Runtime {
    /// Spawn `orchestration_concurrency` dispatcher loops.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.orchestration_concurrency.max(1);
        let idle = Duration::from_millis(self.options.dispatcher_idle_sleep_ms);
        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(concurrency);
            for idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("orch-{idx}");
                handles.push(tokio::spawn(async move {
                    debug!(worker_id = %worker_id, "orchestration dispatcher started");
                    while !rt.is_shutting_down() {
                        match rt.queues.dequeue(QueueKind::Orchestrator) {
                            Some(item) => {
                                let instance = item.instance().to_string();
                                rt.process_orchestration_items(&instance, vec![item]).await;
                            }
                            None => {
                                tokio::select! {
                                    _ = rt.queues.notified(QueueKind::Orchestrator) => {}
                                    _ = tokio::time::sleep(idle) => {}
                                }
                            }
                        }
                    }
                    debug!(worker_id = %worker_id, "orchestration dispatcher stopped");
                }));
            }
            for h in handles {
                let _ = h.await;
            }
        })
    }

    /// Run one turn for `instance` over `items`, retrying the whole replay on
    /// append conflicts. Returns true when a turn was persisted.
    pub(crate) async fn process_orchestration_items(&self, instance: &str, items: Vec<WorkItem>) -> bool {
        let _guard = self.instance_locks.lock(instance).await;
        let max_attempts = self.options.max_conflict_retries.max(1);
        for attempt in 1..=max_attempts {
            match self.run_orchestration_turn(instance, items.clone()).await {
                Ok(ran) => return ran,
                Err(ProviderError::ConcurrencyConflict { expected, actual, .. }) => {
                    debug!(instance_id = %instance, attempt, expected, actual, "append conflict; replaying again");
                }
                Err(e) if e.is_retryable() => {
                    warn!(instance_id = %instance, error = %e, "transient store failure; requeueing items");
                    self.requeue(items);
                    return false;
                }
                Err(e) => {
                    error!(instance_id = %instance, error = %e, item_count = items.len(), "dropping work items after store failure");
                    return false;
                }
            }
        }
        warn!(instance_id = %instance, attempts = max_attempts, "repeated append conflicts; requeueing items");
        self.requeue(items);
        false
    }

    fn requeue(&self, items: Vec<WorkItem>) {
        for item in items {
            self.queues.enqueue(QueueKind::Orchestrator, item);
        }
    }

    async fn run_orchestration_turn(&self, instance: &str, items: Vec<WorkItem>) -> Result<bool, ProviderError> {
        let Some(record) = self.history_store.get_instance(instance).await? else {
            warn!(instance_id = %instance, item_count = items.len(), "dropping work items for unknown instance");
            return Ok(false);
        };
        if record.status.is_terminal() {
            debug!(instance_id = %instance, status = %record.status, "dropping work items for terminal instance");
            return Ok(false);
        }

        let history = self.history_store.read(instance).await?;
        let mut engine = ReplayEngine::new(instance.to_string(), history);
        if let Some(terminal) = engine.terminal_event().cloned() {
            // History is ahead of the record (crash between append and update).
            self.sync_terminal_record(&record, &terminal).await?;
            return Ok(false);
        }

        let has_start = items.iter().any(|i| matches!(i, WorkItem::StartOrchestration { .. }));
        if !engine.is_started() {
            if !has_start {
                debug!(instance_id = %instance, "dropping completions for instance that has not started");
                return Ok(false);
            }
            let version = self
                .orchestrations
                .resolve_handler(&record.orchestration)
                .map(|(v, _)| v.to_string())
                .unwrap_or_default();
            let parent = record
                .parent
                .as_ref()
                .map(|p| (p.instance.clone(), p.scheduling_event_id));
            engine.start(record.orchestration.clone(), version, record.input.clone(), parent);
        }

        engine.prep_completions(items);
        self.metrics.record_duplicates(engine.duplicates);
        if engine.history_delta().is_empty() && !has_start && engine.abort_error.is_none() {
            return Ok(false);
        }

        let Some((name, version, input)) = engine.started_info() else {
            return Ok(false);
        };
        let handler = Version::parse(&version)
            .ok()
            .and_then(|v| self.orchestrations.resolve_handler_exact(&name, &v));
        let result = match handler {
            Some(h) => engine.execute_orchestration(h, input),
            None => TurnResult::Failed(OrchestrationError::UnknownOrchestration(name.clone())),
        };
        engine.finish(&result);

        self.history_store
            .append_batch(instance, engine.history_delta().to_vec())
            .await?;
        self.metrics.record_turn();

        match &result {
            TurnResult::Continue => {
                if record.status == InstanceStatus::Pending {
                    self.history_store
                        .update_instance_if(instance, InstanceStatus::Pending, InstanceStatus::Running, None)
                        .await?;
                }
                // A terminate may have landed right after the batch.
                if let Some(reason) = self.terminated_reason(instance).await? {
                    info!(
                        instance_id = %instance,
                        reason = %reason,
                        actions = engine.pending_actions().len(),
                        "instance terminated during turn; not dispatching actions"
                    );
                    return Ok(true);
                }
                for action in engine.pending_actions() {
                    self.dispatch_action(instance, action).await?;
                }
                debug!(
                    instance_id = %instance,
                    orchestration_name = %name,
                    new_events = engine.history_delta().len(),
                    actions = engine.pending_actions().len(),
                    "orchestration turn persisted"
                );
            }
            TurnResult::Completed(output) => {
                let rec = self
                    .history_store
                    .update_instance(instance, InstanceStatus::Completed, Some(output.clone()))
                    .await?;
                self.metrics.record_orch_completion();
                info!(instance_id = %instance, orchestration_name = %name, "orchestration completed");
                self.finish_instance(&rec);
            }
            TurnResult::Failed(e) => {
                let rec = self
                    .history_store
                    .update_instance(instance, InstanceStatus::Failed, Some(e.to_string()))
                    .await?;
                self.metrics.record_orch_failure();
                warn!(instance_id = %instance, orchestration_name = %name, error = %e, "orchestration failed");
                self.finish_instance(&rec);
            }
        }
        Ok(true)
    }

    async fn dispatch_action(&self, instance: &str, action: &Action) -> Result<(), ProviderError> {
        match action {
            Action::CallActivity {
                scheduling_event_id,
                name,
                input,
            } => {
                self.queues.enqueue(
                    QueueKind::Worker,
                    WorkItem::ActivityExecute {
                        instance: instance.to_string(),
                        id: *scheduling_event_id,
                        name: name.clone(),
                        input: input.clone(),
                    },
                );
            }
            Action::StartSubOrchestration {
                scheduling_event_id,
                name,
                instance: child,
                input,
            } => {
                self.start_child(instance, *scheduling_event_id, name, child, input)
                    .await?;
            }
        }
        Ok(())
    }

    /// Reason of the `OrchestrationTerminated` event in `instance`'s history, if any.
    async fn terminated_reason(&self, instance: &str) -> Result<Option<String>, ProviderError> {
        let history = self.history_store.read(instance).await?;
        Ok(history.iter().rev().find_map(|e| match e {
            Event::OrchestrationTerminated { reason, .. } => Some(reason.clone()),
            _ => None,
        }))
    }

    /// Create the child record (if missing) and enqueue its start. A parent
    /// terminated in the meantime terminates the child instead, since the
    /// parent's cascade may have run before the child existed.
    pub(in crate::runtime) async fn start_child(
        &self,
        parent: &str,
        scheduling_event_id: u64,
        name: &str,
        child: &str,
        input: &str,
    ) -> Result<(), ProviderError> {
        let record = InstanceRecord::pending(child, name, input).with_parent(parent, scheduling_event_id);
        match self.history_store.create_instance(record).await {
            Ok(()) | Err(ProviderError::InstanceExists(_)) => {}
            Err(e) => return Err(e),
        }
        if let Some(reason) = self.terminated_reason(parent).await? {
            let cascade = format!("parent terminated: {reason}");
            match self.client().terminate(child, &cascade).await {
                Ok(()) | Err(ClientError::AlreadyTerminal { .. }) | Err(ClientError::NotFound(_)) => {}
                Err(ClientError::Provider(e)) => return Err(e),
                Err(e) => {
                    warn!(instance_id = %child, parent_instance = %parent, error = %e, "could not terminate orphaned child");
                }
            }
            return Ok(());
        }
        self.queues.enqueue(
            QueueKind::Orchestrator,
            WorkItem::StartOrchestration {
                instance: child.to_string(),
                orchestration: name.to_string(),
            },
        );
        Ok(())
    }

    /// Bring a record up to date with the terminal event found in history.
    pub(in crate::runtime) async fn sync_terminal_record(
        &self,
        record: &InstanceRecord,
        terminal: &Event,
    ) -> Result<(), ProviderError> {
        let Some((status, output)) = terminal_status_of(terminal) else {
            return Ok(());
        };
        if record.status == status {
            return Ok(());
        }
        let rec = self
            .history_store
            .update_instance(&record.instance_id, status, Some(output))
            .await?;
        info!(instance_id = %record.instance_id, status = %status, "instance record synced with terminal history");
        self.finish_instance(&rec);
        Ok(())
    }

    fn finish_instance(&self, record: &InstanceRecord) {
        if let Some(item) = parent_notification(record) {
            self.queues.enqueue(QueueKind::Orchestrator, item);
        }
        self.instance_locks.forget(&record.instance_id);
    }
}
