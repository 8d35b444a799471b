//! Worker (activity) dispatcher.
//!
//! Executes `ActivityExecute` tasks against the activity registry, retrying
//! failed attempts per the runtime's `RetryPolicy`, and reports the outcome as a
//! completion item on the orchestrator queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::super::{ActivityContext, QueueKind, Runtime, WorkItem};
use crate::OrchestrationError;

impl Runtime {
    /// Spawn `worker_concurrency` activity worker loops.
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency.max(1);
        let idle = Duration::from_millis(self.options.dispatcher_idle_sleep_ms);
        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(concurrency);
            for idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("work-{idx}");
                handles.push(tokio::spawn(async move {
                    while !rt.is_shutting_down() {
                        match rt.queues.dequeue(QueueKind::Worker) {
                            Some(item) => rt.execute_activity(item, &worker_id).await,
                            None => {
                                tokio::select! {
                                    _ = rt.queues.notified(QueueKind::Worker) => {}
                                    _ = tokio::time::sleep(idle) => {}
                                }
                            }
                        }
                    }
                }));
            }
            for h in handles {
                let _ = h.await;
            }
        })
    }

    /// Execute one activity task and enqueue its completion.
    pub(crate) async fn execute_activity(&self, item: WorkItem, worker_id: &str) {
        let kind = item.kind();
        let WorkItem::ActivityExecute {
            instance,
            id,
            name,
            input,
        } = item
        else {
            warn!(worker_id = %worker_id, kind, "worker received non-activity item");
            return;
        };

        match self.history_store.get_instance(&instance).await {
            Ok(Some(rec)) if rec.status.is_terminal() => {
                debug!(instance_id = %instance, activity_name = %name, activity_id = id, status = %rec.status, "skipping activity for terminal instance");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                // Run anyway; the orchestration turn re-checks instance state.
                warn!(instance_id = %instance, error = %e, "could not read instance record before activity");
            }
        }

        let completion = match self.activities.resolve_handler(&name) {
            None => {
                warn!(instance_id = %instance, activity_name = %name, activity_id = id, "unknown activity");
                self.metrics.record_activity_failure();
                WorkItem::ActivityFailed {
                    instance,
                    id,
                    error: OrchestrationError::UnknownActivity(name),
                }
            }
            Some((_, handler)) => {
                let policy = &self.options.retry_policy;
                let mut attempt = 1;
                loop {
                    let ctx = ActivityContext::new(instance.clone(), id, name.clone(), attempt).with_worker(worker_id);
                    let outcome = AssertUnwindSafe(handler.invoke(ctx, input.clone()))
                        .catch_unwind()
                        .await;
                    let cause = match outcome {
                        Ok(Ok(result)) => {
                            debug!(instance_id = %instance, activity_name = %name, activity_id = id, attempt, worker_id = %worker_id, "activity completed");
                            self.metrics.record_activity_success();
                            break WorkItem::ActivityCompleted { instance, id, result };
                        }
                        Ok(Err(e)) => e,
                        Err(_) => format!("activity '{name}' panicked"),
                    };
                    if attempt >= policy.max_attempts.max(1) {
                        warn!(instance_id = %instance, activity_name = %name, activity_id = id, attempt, error = %cause, "activity failed");
                        self.metrics.record_activity_failure();
                        break WorkItem::ActivityFailed {
                            instance,
                            id,
                            error: OrchestrationError::ActivityExecution { name, cause },
                        };
                    }
                    let delay = policy.backoff(attempt);
                    warn!(instance_id = %instance, activity_name = %name, activity_id = id, attempt, ?delay, error = %cause, "activity attempt failed; retrying");
                    self.metrics.record_activity_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };
        self.queues.enqueue(QueueKind::Orchestrator, completion);
    }
}
