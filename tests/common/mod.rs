#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use ordo::Event;
use ordo::providers::HistoryStore;
use ordo::providers::fs::FsHistoryStore;
use ordo::providers::in_memory::InMemoryHistoryStore;
use ordo::runtime::{RetryPolicy, RuntimeOptions};
use tempfile::TempDir;

/// Options for deterministic tests: no retries, tight polling.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep_ms: 2,
        retry_policy: RetryPolicy::none(),
        wait_poll_interval_ms: 2,
        ..RuntimeOptions::default()
    }
}

pub fn inmem_store() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::new())
}

pub fn fs_store() -> (Arc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(FsHistoryStore::new(td.path(), true)) as Arc<dyn HistoryStore>;
    (store, td)
}

pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await
            && predicate(&hist)
        {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_subscription(store: Arc<dyn HistoryStore>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name))
        },
        timeout_ms,
    )
    .await
}

/// Kinds of every event in order, for compact history assertions.
pub fn kinds(history: &[Event]) -> Vec<&'static str> {
    history.iter().map(Event::kind).collect()
}

/// Names of scheduled activities in history order.
pub fn scheduled_activities(history: &[Event]) -> Vec<String> {
    history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

pub fn assert_contiguous_ids(history: &[Event]) {
    for (idx, e) in history.iter().enumerate() {
        assert_eq!(e.event_id(), idx as u64 + 1, "gap or reorder at {e:?}");
    }
}
