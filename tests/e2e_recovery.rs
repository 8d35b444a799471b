use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ordo::providers::{HistoryStore, InstanceRecord, InstanceStatus};
use ordo::runtime::{ActivityRegistry, OrchestrationRegistry};
use ordo::samples::order_processing::{self, SampleOptions};
use ordo::{ActivityContext, Event, OrchestrationContext, Runtime};

mod common;

fn started(name: &str, input: &str, parent: Option<(&str, u64)>) -> Event {
    Event::OrchestrationStarted {
        event_id: 1,
        name: name.into(),
        version: "1.0.0".into(),
        input: input.into(),
        parent_instance: parent.map(|(p, _)| p.to_string()),
        parent_id: parent.map(|(_, id)| id),
    }
}

fn counting_activities(counter: Arc<AtomicUsize>) -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Reserve", move |ctx: ActivityContext, input: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.trace_info(format!("reserving {input} ({})", ctx.idempotency_key()));
                Ok(format!("reserved {input}"))
            }
        })
        .build()
}

fn reserve_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Reserve", |ctx: OrchestrationContext, input: String| async move {
            ctx.call_activity("Reserve", input).await
        })
        .build()
}

#[tokio::test]
async fn restart_redispatches_lost_activity() {
    let (store, _td) = common::fs_store();
    let runs = Arc::new(AtomicUsize::new(0));

    {
        let rt = Runtime::with_options(
            store.clone(),
            counting_activities(runs.clone()),
            reserve_orchestrations(),
            common::fast_options(),
        )
        .await
        .unwrap();
        rt.client().schedule_with_id("r-1", "Reserve", "seat-9").await.unwrap();
        // Activity runs but its completion only lives in this runtime's queue.
        rt.tick().await;
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let rt = Runtime::with_options(
        store.clone(),
        counting_activities(runs.clone()),
        reserve_orchestrations(),
        common::fast_options(),
    )
    .await
    .unwrap();
    rt.run_until_idle().await;

    let rec = rt.client().get_status("r-1").await.unwrap();
    assert_eq!(rec.status, InstanceStatus::Completed);
    assert_eq!(rec.output.as_deref(), Some("reserved seat-9"));
    // At-least-once: the activity ran again, history recorded it once.
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let hist = store.read("r-1").await.unwrap();
    common::assert_contiguous_ids(&hist);
    assert_eq!(common::scheduled_activities(&hist), ["Reserve"]);
    assert_eq!(
        hist.iter()
            .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn order_survives_restart_between_every_tick() {
    let (store, _td) = common::fs_store();
    let mut client = None;
    for _ in 0..30 {
        let rt = Runtime::with_options(
            store.clone(),
            order_processing::activities(SampleOptions::default()),
            order_processing::orchestrations(),
            common::fast_options(),
        )
        .await
        .unwrap();
        let c = rt.client();
        if client.is_none() {
            c.schedule_with_id("order-5", order_processing::ORDER_PROCESSING, "order-5")
                .await
                .unwrap();
        }
        client = Some(c.clone());
        // Two ticks: one to run recovered work, one to persist its completion.
        rt.tick().await;
        rt.tick().await;
        if c.get_status("order-5").await.unwrap().status.is_terminal() {
            break;
        }
    }

    let rec = client.unwrap().get_status("order-5").await.unwrap();
    assert_eq!(rec.status, InstanceStatus::Completed);
    assert_eq!(rec.output.as_deref(), Some("Order order-5 processed successfully."));
    common::assert_contiguous_ids(&store.read("order-5").await.unwrap());
    common::assert_contiguous_ids(&store.read("order-5::sub::8").await.unwrap());
}

fn reserve_twice() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("ReserveTwice", |ctx: OrchestrationContext, input: String| async move {
            let first = ctx.call_activity("Reserve", input).await?;
            ctx.call_activity("Reserve", first).await
        })
        .build()
}

#[tokio::test]
async fn duplicate_completion_from_second_runtime_is_ignored() {
    let (store, _td) = common::fs_store();
    let runs = Arc::new(AtomicUsize::new(0));
    let a = Runtime::with_options(
        store.clone(),
        counting_activities(runs.clone()),
        reserve_twice(),
        common::fast_options(),
    )
    .await
    .unwrap();
    a.client().schedule_with_id("r-2", "ReserveTwice", "seat-1").await.unwrap();
    a.tick().await;

    // A second runtime recovers the same instance and runs the first activity again.
    let b = Runtime::with_options(
        store.clone(),
        counting_activities(runs.clone()),
        reserve_twice(),
        common::fast_options(),
    )
    .await
    .unwrap();
    b.tick().await;

    // `a` persists the first completion; `b` then delivers the same one.
    a.tick().await;
    b.tick().await;
    assert_eq!(b.metrics_snapshot().duplicate_completions, 1);

    a.run_until_idle().await;
    b.run_until_idle().await;

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    let rec = a.client().get_status("r-2").await.unwrap();
    assert_eq!(rec.output.as_deref(), Some("reserved reserved seat-1"));
    let hist = store.read("r-2").await.unwrap();
    common::assert_contiguous_ids(&hist);
    assert_eq!(
        common::kinds(&hist),
        [
            "OrchestrationStarted",
            "ActivityScheduled",
            "ActivityCompleted",
            "ActivityScheduled",
            "ActivityCompleted",
            "OrchestrationCompleted"
        ]
    );
}

#[tokio::test]
async fn terminal_history_repairs_stale_record() {
    let (store, _td) = common::fs_store();
    store
        .create_instance(InstanceRecord::pending("s-1", "Reserve", "x"))
        .await
        .unwrap();
    store.update_instance("s-1", InstanceStatus::Running, None).await.unwrap();
    store
        .append_batch(
            "s-1",
            vec![
                started("Reserve", "x", None),
                Event::OrchestrationCompleted {
                    event_id: 2,
                    output: "done".into(),
                },
            ],
        )
        .await
        .unwrap();

    let rt = Runtime::with_options(
        store.clone(),
        counting_activities(Arc::default()),
        reserve_orchestrations(),
        common::fast_options(),
    )
    .await
    .unwrap();
    let rec = rt.client().get_status("s-1").await.unwrap();
    assert_eq!(rec.status, InstanceStatus::Completed);
    assert_eq!(rec.output.as_deref(), Some("done"));
    assert_eq!(rt.run_until_idle().await.turns, 0);
}

#[tokio::test]
async fn missing_child_is_created_on_recovery() {
    let store = common::inmem_store();
    store
        .create_instance(InstanceRecord::pending("parent-1", "Parent", "x"))
        .await
        .unwrap();
    store
        .append_batch(
            "parent-1",
            vec![
                started("Parent", "x", None),
                Event::SubOrchestrationScheduled {
                    event_id: 2,
                    name: "Reserve".into(),
                    instance: "parent-1::sub::2".into(),
                    input: "x".into(),
                },
            ],
        )
        .await
        .unwrap();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Parent", |ctx: OrchestrationContext, input: String| async move {
            ctx.call_sub_orchestration("Reserve", input).await
        })
        .register("Reserve", |ctx: OrchestrationContext, input: String| async move {
            ctx.call_activity("Reserve", input).await
        })
        .build();
    let rt = Runtime::with_options(
        store.clone(),
        counting_activities(Arc::default()),
        orchestrations,
        common::fast_options(),
    )
    .await
    .unwrap();
    rt.run_until_idle().await;

    let client = rt.client();
    let child = client.get_status("parent-1::sub::2").await.unwrap();
    assert_eq!(child.status, InstanceStatus::Completed);
    let parent = client.get_status("parent-1").await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Completed);
    assert_eq!(parent.output.as_deref(), Some("reserved x"));
}

#[tokio::test]
async fn finished_child_renotifies_waiting_parent() {
    let store = common::inmem_store();
    store
        .create_instance(InstanceRecord::pending("parent-2", "Parent", "x"))
        .await
        .unwrap();
    store
        .append_batch(
            "parent-2",
            vec![
                started("Parent", "x", None),
                Event::SubOrchestrationScheduled {
                    event_id: 2,
                    name: "Child".into(),
                    instance: "parent-2::sub::2".into(),
                    input: "x".into(),
                },
            ],
        )
        .await
        .unwrap();
    store
        .create_instance(InstanceRecord::pending("parent-2::sub::2", "Child", "x").with_parent("parent-2", 2))
        .await
        .unwrap();
    store
        .append_batch(
            "parent-2::sub::2",
            vec![
                started("Child", "x", Some(("parent-2", 2))),
                Event::OrchestrationCompleted {
                    event_id: 2,
                    output: "child-out".into(),
                },
            ],
        )
        .await
        .unwrap();
    store
        .update_instance("parent-2::sub::2", InstanceStatus::Completed, Some("child-out".into()))
        .await
        .unwrap();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Parent", |ctx: OrchestrationContext, input: String| async move {
            ctx.call_sub_orchestration("Child", input).await
        })
        .register("Child", |_ctx: OrchestrationContext, _input: String| async move {
            Ok("never re-run".to_string())
        })
        .build();
    let rt = Runtime::with_options(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        common::fast_options(),
    )
    .await
    .unwrap();
    rt.run_until_idle().await;

    let parent = rt.client().get_status("parent-2").await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Completed);
    assert_eq!(parent.output.as_deref(), Some("child-out"));
    let hist = store.read("parent-2").await.unwrap();
    assert!(matches!(
        &hist[2],
        Event::SubOrchestrationCompleted { source_event_id: 2, result, .. } if result == "child-out"
    ));
}
