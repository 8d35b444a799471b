//! Property-based tests for history and replay invariants.

use std::sync::Arc;

use ordo::providers::in_memory::InMemoryHistoryStore;
use ordo::providers::{HistoryStore, InstanceRecord, ProviderError};
use ordo::{Event, OrchestrationContext, OrchestrationError, run_turn};
use proptest::prelude::*;

fn arb_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(prop::string::string_regex("[A-Z][a-z]{0,6}").unwrap(), 1..6)
}

fn started() -> Event {
    Event::OrchestrationStarted {
        event_id: 1,
        name: "Seq".into(),
        version: "1.0.0".into(),
        input: String::new(),
        parent_instance: None,
        parent_id: None,
    }
}

async fn sequence(ctx: OrchestrationContext, names: Vec<String>) -> Result<String, OrchestrationError> {
    let mut acc = String::new();
    for name in names {
        acc = ctx.call_activity(name, acc).await?;
    }
    Ok(acc)
}

/// Drive `sequence` turn by turn, completing each scheduled call with `name + input`.
fn drive(names: &[String]) -> (Vec<Event>, String) {
    let mut history = vec![started()];
    loop {
        let owned = names.to_vec();
        let out = run_turn(history, |ctx| sequence(ctx, owned));
        assert!(out.nondeterminism.is_none());
        history = out.history;
        if let Some(result) = out.output {
            return (history, result.unwrap());
        }
        assert_eq!(out.actions.len(), 1);
        let (id, name, input) = match history.last() {
            Some(Event::ActivityScheduled { event_id, name, input }) => (*event_id, name.clone(), input.clone()),
            other => panic!("expected a scheduled call, got {other:?}"),
        };
        history.push(Event::ActivityCompleted {
            event_id: id + 1,
            source_event_id: id,
            result: format!("{input}{name}"),
        });
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Replaying a finished history is a pure function of that history.
    #[test]
    fn prop_replay_is_deterministic(names in arb_names()) {
        let (history, result) = drive(&names);
        prop_assert_eq!(&result, &names.concat());

        for (idx, e) in history.iter().enumerate() {
            prop_assert_eq!(e.event_id(), idx as u64 + 1);
        }

        let owned = names.clone();
        let replay = run_turn(history.clone(), |ctx| sequence(ctx, owned));
        prop_assert!(replay.actions.is_empty());
        prop_assert!(replay.nondeterminism.is_none());
        prop_assert_eq!(replay.history, history);
        prop_assert_eq!(replay.output, Some(Ok(result)));
    }

    /// Any prefix that ends before a completion replays to the same next call.
    #[test]
    fn prop_prefix_replay_reissues_same_call(names in arb_names(), cut in 0usize..10) {
        let (history, _) = drive(&names);
        let completions: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Event::ActivityCompleted { .. }))
            .map(|(i, _)| i)
            .collect();
        let cut_at = completions[cut % completions.len()];
        let prefix = history[..cut_at].to_vec();

        let owned = names.clone();
        let out = run_turn(prefix.clone(), |ctx| sequence(ctx, owned));
        prop_assert!(out.nondeterminism.is_none());
        prop_assert!(out.output.is_none());
        prop_assert!(out.actions.is_empty(), "scheduled call is already in the prefix");
        prop_assert_eq!(out.history, prefix);
    }

    /// The store accepts exactly the contiguous sequence and rejects everything else.
    #[test]
    fn prop_store_accepts_only_next_id(ids in prop::collection::vec(1u64..12, 1..24)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
            store.create_instance(InstanceRecord::pending("p", "Seq", "")).await.unwrap();
            let mut last = 0u64;
            for id in ids {
                let ev = Event::ExternalSubscribed { event_id: id, name: "x".into() };
                match store.append("p", ev).await {
                    Ok(()) => {
                        assert_eq!(id, last + 1);
                        last = id;
                    }
                    Err(ProviderError::ConcurrencyConflict { expected, actual, .. }) => {
                        assert_eq!(expected, last + 1);
                        assert_eq!(actual, id);
                        assert_ne!(id, last + 1);
                    }
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
            let hist = store.read("p").await.unwrap();
            assert_eq!(hist.len() as u64, last);
            for (idx, e) in hist.iter().enumerate() {
                assert_eq!(e.event_id(), idx as u64 + 1);
            }
        });
    }
}
