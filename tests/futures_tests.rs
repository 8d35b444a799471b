use ordo::runtime::{ActivityRegistry, OrchestrationRegistry};
use ordo::{
    ActivityContext, DurableOutput, Event, InstanceStatus, OrchestrationContext, OrchestrationError, Runtime,
    durable_info,
};

mod common;

fn echo_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Echo", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .register("Fail", |_ctx: ActivityContext, input: String| async move {
            Err::<String, _>(format!("refused {input}"))
        })
        .build()
}

#[tokio::test]
async fn join_returns_results_in_argument_order() {
    let store = common::inmem_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("FanOut", |ctx: OrchestrationContext, _input: String| async move {
            durable_info!(ctx, fan_out = 3, "fanning out");
            let futs = vec![
                ctx.schedule_activity("Echo", "one"),
                ctx.schedule_activity("Fail", "two"),
                ctx.schedule_activity("Echo", "three"),
            ];
            let parts: Vec<String> = ctx
                .join(futs)
                .await
                .into_iter()
                .map(|out| match out.into_result() {
                    Ok(v) => v,
                    Err(e) => format!("err({e})"),
                })
                .collect();
            Ok(parts.join("|"))
        })
        .build();
    let rt = Runtime::with_options(store.clone(), echo_activities(), orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();
    client.schedule_with_id("fan-1", "FanOut", "").await.unwrap();
    rt.run_until_idle().await;

    let rec = client.get_status("fan-1").await.unwrap();
    assert_eq!(rec.status, InstanceStatus::Completed);
    assert_eq!(
        rec.output.as_deref(),
        Some("one|err(activity 'Fail' failed: refused two)|three")
    );

    let hist = store.read("fan-1").await.unwrap();
    common::assert_contiguous_ids(&hist);
    // All three calls were scheduled in the first turn, in argument order.
    assert!(matches!(&hist[1], Event::ActivityScheduled { event_id: 2, input, .. } if input == "one"));
    assert!(matches!(&hist[2], Event::ActivityScheduled { event_id: 3, input, .. } if input == "two"));
    assert!(matches!(&hist[3], Event::ActivityScheduled { event_id: 4, input, .. } if input == "three"));
}

#[tokio::test]
async fn select_takes_earliest_recorded_completion() {
    let store = common::inmem_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Race", |ctx: OrchestrationContext, _input: String| async move {
            let timeout = ctx.schedule_wait("cancel");
            let work = ctx.schedule_activity("Echo", "work-done");
            let (idx, out) = ctx.select2(timeout, work).await;
            match (idx, out) {
                (0, DurableOutput::External(data)) => Ok(format!("cancelled: {data}")),
                (1, out) => out.into_result(),
                (_, other) => Err(OrchestrationError::application(format!("unexpected {other:?}"))),
            }
        })
        .build();
    let rt = Runtime::with_options(store.clone(), echo_activities(), orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();
    client.schedule_with_id("race-1", "Race", "").await.unwrap();
    rt.run_until_idle().await;

    // No signal was raised, so the activity wins.
    let rec = client.get_status("race-1").await.unwrap();
    assert_eq!(rec.status, InstanceStatus::Completed);
    assert_eq!(rec.output.as_deref(), Some("work-done"));

    // Signals after completion are rejected.
    assert!(client.raise_event("race-1", "cancel", "late").await.is_err());
}

#[tokio::test]
async fn select_prefers_signal_recorded_first() {
    let store = common::inmem_store();
    let activities = ActivityRegistry::builder().build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Approve", |ctx: OrchestrationContext, _input: String| async move {
            let yes = ctx.schedule_wait("yes");
            let no = ctx.schedule_wait("no");
            let (idx, out) = ctx.select(vec![yes, no]).await;
            Ok(format!("{idx}:{}", out.into_event()))
        })
        .build();
    let rt = Runtime::with_options(store.clone(), activities, orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();
    client.schedule_with_id("ap-1", "Approve", "").await.unwrap();
    rt.run_until_idle().await;

    // Both arrive in the same batch; `no` is recorded first.
    client.raise_event("ap-1", "no", "nope").await.unwrap();
    client.raise_event("ap-1", "yes", "sure").await.unwrap();
    rt.run_until_idle().await;

    let rec = client.get_status("ap-1").await.unwrap();
    assert_eq!(rec.output.as_deref(), Some("1:nope"));
}

#[tokio::test]
async fn sub_orchestrations_fan_out_and_join() {
    let store = common::inmem_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Parent", |ctx: OrchestrationContext, input: String| async move {
            let children = input
                .split(',')
                .map(|part| ctx.schedule_sub_orchestration("Child", part))
                .collect();
            let outs = ctx.join(children).await;
            let mut parts = Vec::new();
            for out in outs {
                parts.push(out.into_result()?);
            }
            Ok(parts.join(","))
        })
        .register("Child", |ctx: OrchestrationContext, input: String| async move {
            let v = ctx.call_activity("Echo", input.to_uppercase()).await?;
            Ok(format!("<{v}>"))
        })
        .build();
    let rt = Runtime::with_options(store.clone(), echo_activities(), orchestrations, common::fast_options())
        .await
        .unwrap();
    let client = rt.client();
    client.schedule_with_id("tree", "Parent", "a,b,c").await.unwrap();
    rt.run_until_idle().await;

    let rec = client.get_status("tree").await.unwrap();
    assert_eq!(rec.status, InstanceStatus::Completed);
    assert_eq!(rec.output.as_deref(), Some("<A>,<B>,<C>"));
    for (id, expected) in [("tree::sub::2", "<A>"), ("tree::sub::3", "<B>"), ("tree::sub::4", "<C>")] {
        let child = client.get_status(id).await.unwrap();
        assert_eq!(child.output.as_deref(), Some(expected));
    }
}

#[tokio::test]
async fn failed_child_surfaces_to_parent() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Parent", |ctx: OrchestrationContext, input: String| async move {
            ctx.call_sub_orchestration("Child", input).await
        })
        .register("Child", |ctx: OrchestrationContext, input: String| async move {
            ctx.call_activity("Fail", input).await
        })
        .build();
    let rt = Runtime::with_options(
        common::inmem_store(),
        echo_activities(),
        orchestrations,
        common::fast_options(),
    )
    .await
    .unwrap();
    let client = rt.client();
    client.schedule_with_id("pf", "Parent", "x").await.unwrap();
    rt.run_until_idle().await;

    let child = client.get_status("pf::sub::2").await.unwrap();
    assert_eq!(child.status, InstanceStatus::Failed);
    let parent = client.get_status("pf").await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Failed);
    assert_eq!(
        parent.output.as_deref(),
        Some("sub-orchestration 'Child' failed: activity 'Fail' failed: refused x")
    );
}
