use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::Event;

mod error;
/// Filesystem-backed store for local runs; survives restarts.
pub mod fs;
/// In-memory store for tests.
pub mod in_memory;

pub use error::ProviderError;

/// Lifecycle state of an orchestration instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Link from a child instance to the parent call that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance: String,
    pub scheduling_event_id: u64,
}

/// Durable record describing one orchestration instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub orchestration: String,
    pub status: InstanceStatus,
    pub input: String,
    /// Output when Completed, error text when Failed, reason when Terminated.
    pub output: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub parent: Option<ParentLink>,
}

impl InstanceRecord {
    /// Fresh Pending record stamped with the current wall-clock time.
    pub fn pending(instance_id: impl Into<String>, orchestration: impl Into<String>, input: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            instance_id: instance_id.into(),
            orchestration: orchestration.into(),
            status: InstanceStatus::Pending,
            input: input.into(),
            output: None,
            created_at_ms: now,
            updated_at_ms: now,
            parent: None,
        }
    }

    pub fn with_parent(mut self, instance: impl Into<String>, scheduling_event_id: u64) -> Self {
        self.parent = Some(ParentLink {
            instance: instance.into(),
            scheduling_event_id,
        });
        self
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Append-only per-instance history plus instance records.
///
/// Appends are compare-and-set on the event id: an event is accepted only if
/// its `event_id` is exactly one past the last stored id. Reads return a fresh
/// snapshot in append order, so they can be restarted at any time.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a new instance record with empty history.
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError>;

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError>;

    /// Set status and output, bumping `updated_at_ms`. Returns the new record.
    async fn update_instance(
        &self,
        instance: &str,
        status: InstanceStatus,
        output: Option<String>,
    ) -> Result<InstanceRecord, ProviderError>;

    /// Compare-and-set variant of `update_instance`: applies only while the
    /// record is still in `expected`. Returns `None` when it has moved on.
    async fn update_instance_if(
        &self,
        instance: &str,
        expected: InstanceStatus,
        status: InstanceStatus,
        output: Option<String>,
    ) -> Result<Option<InstanceRecord>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, ProviderError>;

    /// Append one event; fails with `ConcurrencyConflict` unless its id is `last + 1`.
    async fn append(&self, instance: &str, event: Event) -> Result<(), ProviderError>;

    /// Append in order, stopping at the first failure. Events appended before
    /// the failure stay appended.
    async fn append_batch(&self, instance: &str, events: Vec<Event>) -> Result<(), ProviderError> {
        for event in events {
            self.append(instance, event).await?;
        }
        Ok(())
    }

    /// Full history in append order.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Last appended event id, or 0 for an empty history.
    async fn last_event_id(&self, instance: &str) -> Result<u64, ProviderError> {
        Ok(self.read(instance).await?.last().map(Event::event_id).unwrap_or(0))
    }
}

pub(crate) fn check_next_id(instance: &str, last: u64, event: &Event) -> Result<(), ProviderError> {
    let expected = last + 1;
    if event.event_id() != expected {
        return Err(ProviderError::ConcurrencyConflict {
            instance: instance.to_string(),
            expected,
            actual: event.event_id(),
        });
    }
    Ok(())
}
