//! Queue recovery on start.
//!
//! Queues are in-process only, so a restart loses every queued item. The store
//! holds enough to rebuild them: every non-terminal instance gets a start item
//! (replay is idempotent and picks up where history ends), every scheduled
//! activity without a completion is dispatched again, and terminal children
//! whose result never reached their parent are delivered again.

use std::collections::HashSet;

use tracing::debug;

use super::{QueueKind, Runtime, WorkItem, parent_notification};
use crate::Event;
use crate::providers::ProviderError;

/// What recovery put back on the queues.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub instances_resumed: usize,
    pub activities_redispatched: usize,
    pub children_started: usize,
    pub parents_notified: usize,
}

impl Runtime {
    pub(crate) async fn recover(&self) -> Result<RecoveryStats, ProviderError> {
        let mut stats = RecoveryStats::default();
        let records = self.history_store.list_instances().await?;
        let known: HashSet<String> = records.iter().map(|r| r.instance_id.clone()).collect();

        for record in records {
            let instance = record.instance_id.clone();
            let history = self.history_store.read(&instance).await?;

            if let Some(terminal) = history.iter().find(|e| e.is_terminal()) {
                if !record.status.is_terminal() {
                    self.sync_terminal_record(&record, terminal).await?;
                    stats.parents_notified += usize::from(record.parent.is_some());
                } else if self.parent_missing_result(&record).await? {
                    if let Some(item) = parent_notification(&record) {
                        self.queues.enqueue(QueueKind::Orchestrator, item);
                        stats.parents_notified += 1;
                    }
                }
                continue;
            }
            if record.status.is_terminal() {
                continue;
            }

            self.queues.enqueue(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.clone(),
                    orchestration: record.orchestration.clone(),
                },
            );
            stats.instances_resumed += 1;

            let completed: HashSet<u64> = history.iter().filter_map(Event::source_event_id).collect();
            for event in &history {
                match event {
                    Event::ActivityScheduled { event_id, name, input } if !completed.contains(event_id) => {
                        self.queues.enqueue(
                            QueueKind::Worker,
                            WorkItem::ActivityExecute {
                                instance: instance.clone(),
                                id: *event_id,
                                name: name.clone(),
                                input: input.clone(),
                            },
                        );
                        stats.activities_redispatched += 1;
                    }
                    Event::SubOrchestrationScheduled {
                        event_id,
                        name,
                        instance: child,
                        input,
                    } if !completed.contains(event_id) && !known.contains(child) => {
                        self.start_child(&instance, *event_id, name, child, input).await?;
                        stats.children_started += 1;
                    }
                    _ => {}
                }
            }
            debug!(instance_id = %instance, status = %record.status, "instance recovered");
        }
        Ok(stats)
    }

    async fn parent_missing_result(&self, record: &crate::InstanceRecord) -> Result<bool, ProviderError> {
        let Some(parent) = &record.parent else {
            return Ok(false);
        };
        let Some(parent_rec) = self.history_store.get_instance(&parent.instance).await? else {
            return Ok(false);
        };
        if parent_rec.status.is_terminal() {
            return Ok(false);
        }
        let history = self.history_store.read(&parent.instance).await?;
        Ok(!history
            .iter()
            .any(|e| e.source_event_id() == Some(parent.scheduling_event_id)))
    }
}
