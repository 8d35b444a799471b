use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::Notify;

use crate::OrchestrationError;

/// Messages moved between the client, the orchestration dispatcher and the
/// activity workers. Queues are in-process only; recovery rebuilds them from
/// the history store on start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: OrchestrationError,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_id: u64,
        error: OrchestrationError,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
}

impl WorkItem {
    /// Instance whose orchestration this item targets.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::ExternalRaised { instance, .. } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                parent_instance
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
            WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Orchestrator,
    Worker,
}

#[derive(Default)]
struct Queue {
    items: Mutex<VecDeque<WorkItem>>,
    notify: Notify,
}

/// The orchestrator and worker queues shared by the runtime and its clients.
#[derive(Default)]
pub struct WorkQueues {
    orchestrator: Queue,
    worker: Queue,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator,
            QueueKind::Worker => &self.worker,
        }
    }

    /// Enqueue an item. An identical item already waiting is not added twice.
    pub fn enqueue(&self, kind: QueueKind, item: WorkItem) {
        let q = self.queue(kind);
        {
            let mut items = q.items.lock().unwrap_or_else(PoisonError::into_inner);
            if items.contains(&item) {
                return;
            }
            items.push_back(item);
        }
        q.notify.notify_one();
    }

    pub fn dequeue(&self, kind: QueueKind) -> Option<WorkItem> {
        self.queue(kind)
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Take every item currently waiting, in FIFO order.
    pub fn drain(&self, kind: QueueKind) -> Vec<WorkItem> {
        self.queue(kind)
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.queue(kind).items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self, kind: QueueKind) -> bool {
        self.len(kind) == 0
    }

    /// Resolves when an item is enqueued (or `wake_all` is called).
    pub async fn notified(&self, kind: QueueKind) {
        self.queue(kind).notify.notified().await;
    }

    pub fn wake_all(&self) {
        self.orchestrator.notify.notify_waiters();
        self.worker.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(id: u64) -> WorkItem {
        WorkItem::ActivityCompleted {
            instance: "i".into(),
            id,
            result: "ok".into(),
        }
    }

    #[test]
    fn fifo_and_dedupe() {
        let q = WorkQueues::new();
        q.enqueue(QueueKind::Orchestrator, completed(2));
        q.enqueue(QueueKind::Orchestrator, completed(3));
        q.enqueue(QueueKind::Orchestrator, completed(2));
        assert_eq!(q.len(QueueKind::Orchestrator), 2);
        assert!(q.is_empty(QueueKind::Worker));
        assert_eq!(q.dequeue(QueueKind::Orchestrator), Some(completed(2)));
        assert_eq!(q.drain(QueueKind::Orchestrator), vec![completed(3)]);
        assert!(q.dequeue(QueueKind::Orchestrator).is_none());
    }

    #[test]
    fn sub_orchestration_items_target_parent() {
        let item = WorkItem::SubOrchCompleted {
            parent_instance: "order-42".into(),
            parent_id: 5,
            result: "sent".into(),
        };
        assert_eq!(item.instance(), "order-42");
        assert_eq!(item.kind(), "SubOrchCompleted");
    }
}
