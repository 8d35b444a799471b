//! Control-plane client: start, query, signal, terminate and wait.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::Event;
use crate::providers::{HistoryStore, InstanceRecord, InstanceStatus, ProviderError, now_ms};
use crate::runtime::{QueueKind, WorkItem, WorkQueues, parent_notification};

/// Errors returned by [`Client`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The instance did not reach a terminal state in time. Its state is untouched.
    #[error("timed out after {0:?} waiting for instance to finish")]
    Timeout(Duration),

    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("instance '{instance}' is already {status}")]
    AlreadyTerminal { instance: String, status: InstanceStatus },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

const MAX_TERMINATE_ATTEMPTS: u32 = 32;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn generate_instance_id(orchestration: &str) -> String {
    let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:x}-{seq}", orchestration.to_ascii_lowercase(), now_ms())
}

/// Client for an orchestration runtime. Obtain one with [`Runtime::client`](crate::Runtime::client).
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
    queues: Arc<WorkQueues>,
    poll_interval: Duration,
}

impl Client {
    pub(crate) fn new(store: Arc<dyn HistoryStore>, queues: Arc<WorkQueues>, poll_interval: Duration) -> Self {
        Self {
            store,
            queues,
            poll_interval,
        }
    }

    /// Start a new instance under a generated id.
    pub async fn schedule(&self, orchestration: &str, input: impl Into<String>) -> Result<String, ClientError> {
        let instance = generate_instance_id(orchestration);
        self.schedule_with_id(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Start a new instance under a caller-chosen id.
    pub async fn schedule_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.store
            .create_instance(InstanceRecord::pending(instance, orchestration, input))
            .await?;
        self.queues.enqueue(
            QueueKind::Orchestrator,
            WorkItem::StartOrchestration {
                instance: instance.to_string(),
                orchestration: orchestration.to_string(),
            },
        );
        info!(instance_id = %instance, orchestration_name = %orchestration, "orchestration scheduled");
        Ok(())
    }

    pub async fn get_status(&self, instance: &str) -> Result<InstanceRecord, ClientError> {
        self.store
            .get_instance(instance)
            .await?
            .ok_or_else(|| ClientError::NotFound(instance.to_string()))
    }

    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        match self.store.read(instance).await {
            Ok(h) => Ok(h),
            Err(ProviderError::InstanceNotFound(i)) => Err(ClientError::NotFound(i)),
            Err(e) => Err(e.into()),
        }
    }

    /// Deliver a named signal. Only orchestrations already waiting on `name`
    /// receive it; signals with no subscription are dropped.
    pub async fn raise_event(&self, instance: &str, name: &str, data: impl Into<String>) -> Result<(), ClientError> {
        let record = self.get_status(instance).await?;
        if record.status.is_terminal() {
            return Err(ClientError::AlreadyTerminal {
                instance: instance.to_string(),
                status: record.status,
            });
        }
        self.queues.enqueue(
            QueueKind::Orchestrator,
            WorkItem::ExternalRaised {
                instance: instance.to_string(),
                name: name.to_string(),
                data: data.into(),
            },
        );
        Ok(())
    }

    /// Terminate an instance and its outstanding children.
    ///
    /// `OrchestrationTerminated` is appended out of band with the same
    /// compare-and-set rule the dispatcher uses; on conflict the append is
    /// retried against the new tail. Work already appended stays appended.
    pub async fn terminate(&self, instance: &str, reason: &str) -> Result<(), ClientError> {
        let mut pending = self.terminate_one(instance, reason).await?;
        let cascade_reason = format!("parent terminated: {reason}");
        while let Some(child) = pending.pop() {
            match self.terminate_one(&child, &cascade_reason).await {
                Ok(grandchildren) => pending.extend(grandchildren),
                Err(ClientError::AlreadyTerminal { .. }) | Err(ClientError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Terminate a single instance, returning its children that were still running.
    async fn terminate_one(&self, instance: &str, reason: &str) -> Result<Vec<String>, ClientError> {
        let mut record = self.get_status(instance).await?;
        let mut attempts = 0;
        let history = loop {
            if record.status.is_terminal() {
                return Err(ClientError::AlreadyTerminal {
                    instance: instance.to_string(),
                    status: record.status,
                });
            }
            let history = self.read_history(instance).await?;
            if let Some(status) = history.iter().find_map(terminal_status) {
                return Err(ClientError::AlreadyTerminal {
                    instance: instance.to_string(),
                    status,
                });
            }
            let next_id = history
                .last()
                .map(|e| e.event_id() + 1)
                .unwrap_or(crate::INITIAL_EVENT_ID);
            let event = Event::OrchestrationTerminated {
                event_id: next_id,
                reason: reason.to_string(),
            };
            match self.store.append(instance, event).await {
                Ok(()) => break history,
                Err(ProviderError::ConcurrencyConflict { .. }) if attempts < MAX_TERMINATE_ATTEMPTS => {
                    attempts += 1;
                    debug!(instance_id = %instance, attempts, "terminate append conflict; retrying");
                    record = self.get_status(instance).await?;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let record = self
            .store
            .update_instance(instance, InstanceStatus::Terminated, Some(reason.to_string()))
            .await?;
        info!(instance_id = %instance, reason = %reason, "orchestration terminated");

        if let Some(item) = parent_notification(&record) {
            self.queues.enqueue(QueueKind::Orchestrator, item);
        }

        let completed: HashSet<u64> = history.iter().filter_map(Event::source_event_id).collect();
        Ok(history
            .iter()
            .filter_map(|e| match e {
                Event::SubOrchestrationScheduled { event_id, instance, .. } if !completed.contains(event_id) => {
                    Some(instance.clone())
                }
                _ => None,
            })
            .collect())
    }

    /// Wait until the instance is Completed, Failed or Terminated.
    pub async fn wait_for_completion(&self, instance: &str, timeout: Duration) -> Result<InstanceRecord, ClientError> {
        let poll = async {
            loop {
                let record = self.get_status(instance).await?;
                if record.status.is_terminal() {
                    return Ok(record);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(res) => res,
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>, ClientError> {
        Ok(self.store.list_instances().await?)
    }
}

fn terminal_status(event: &Event) -> Option<InstanceStatus> {
    match event {
        Event::OrchestrationCompleted { .. } => Some(InstanceStatus::Completed),
        Event::OrchestrationFailed { .. } => Some(InstanceStatus::Failed),
        Event::OrchestrationTerminated { .. } => Some(InstanceStatus::Terminated),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = generate_instance_id("OrderProcessing");
        let b = generate_instance_id("OrderProcessing");
        assert_ne!(a, b);
        assert!(a.starts_with("orderprocessing-"));
    }
}
