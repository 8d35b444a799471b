use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{HistoryStore, InstanceRecord, InstanceStatus, ProviderError, check_next_id, now_ms};
use crate::Event;

#[derive(Default)]
struct Inner {
    records: HashMap<String, InstanceRecord>,
    histories: HashMap<String, Vec<Event>>,
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        if g.records.contains_key(&record.instance_id) {
            return Err(ProviderError::InstanceExists(record.instance_id));
        }
        g.histories.insert(record.instance_id.clone(), Vec::new());
        g.records.insert(record.instance_id.clone(), record);
        Ok(())
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        Ok(self.inner.lock().await.records.get(instance).cloned())
    }

    async fn update_instance(
        &self,
        instance: &str,
        status: InstanceStatus,
        output: Option<String>,
    ) -> Result<InstanceRecord, ProviderError> {
        let mut g = self.inner.lock().await;
        let rec = g
            .records
            .get_mut(instance)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        rec.status = status;
        rec.output = output;
        rec.updated_at_ms = now_ms().max(rec.updated_at_ms);
        Ok(rec.clone())
    }

    async fn update_instance_if(
        &self,
        instance: &str,
        expected: InstanceStatus,
        status: InstanceStatus,
        output: Option<String>,
    ) -> Result<Option<InstanceRecord>, ProviderError> {
        let mut g = self.inner.lock().await;
        let rec = g
            .records
            .get_mut(instance)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        if rec.status != expected {
            return Ok(None);
        }
        rec.status = status;
        rec.output = output;
        rec.updated_at_ms = now_ms().max(rec.updated_at_ms);
        Ok(Some(rec.clone()))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, ProviderError> {
        let g = self.inner.lock().await;
        let mut out: Vec<_> = g.records.values().cloned().collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(out)
    }

    async fn append(&self, instance: &str, event: Event) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let history = g
            .histories
            .get_mut(instance)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        let last = history.last().map(Event::event_id).unwrap_or(0);
        check_next_id(instance, last, &event)?;
        history.push(event);
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.inner.lock().await;
        g.histories
            .get(instance)
            .cloned()
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))
    }
}
