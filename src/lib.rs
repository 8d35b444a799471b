//! Durable orchestration engine with deterministic replay.
//!
//! Orchestrations are ordinary `async` functions that receive an
//! [`OrchestrationContext`]. Every call they make (activities,
//! sub-orchestrations, external signals) is recorded as an append-only
//! [`Event`] in a [`providers::HistoryStore`]. Each time new results arrive the
//! runtime re-runs the orchestration from the start; calls already present in
//! history resolve synchronously from their recorded results, and the first
//! unresolved call suspends the orchestration until its completion is appended.
//!
//! - Data model: [`Event`], [`Action`], [`Call`]
//! - Turn driver: [`run_turn`] / [`run_turn_with`]
//! - Execution context: [`OrchestrationContext`] and [`DurableFuture`]
//! - Runtime, registries and dispatchers: [`runtime`]
//! - Control plane: [`client::Client`]
use std::collections::HashSet;
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use ::futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub mod client;
pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod samples;

pub use crate::client::{Client, ClientError};
pub use crate::error::OrchestrationError;
pub use crate::futures::{DurableFuture, DurableOutput, EventFuture, JoinFuture, ResultFuture, SelectFuture};
pub use crate::providers::{InstanceRecord, InstanceStatus};
pub use crate::runtime::{
    ActivityContext, ActivityRegistry, OrchestrationRegistry, Runtime, RuntimeOptions, TickStats,
};

/// Event id of the first event in every instance history.
pub const INITIAL_EVENT_ID: u64 = 1;

// JSON codec shared by typed registration and typed calls. Plain JSON strings
// are passed through unquoted so string-typed handlers see the raw payload.
pub(crate) mod codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        match serde_json::to_value(v) {
            Ok(Value::String(s)) => Ok(s),
            Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
        }
    }
}

/// Append-only history entry for one orchestration instance.
///
/// `event_id` starts at [`INITIAL_EVENT_ID`] and increases by exactly one per
/// appended event. Completion events reference the scheduling event they
/// resolve through `source_event_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance started by name with input. Parent linkage is present for children.
    OrchestrationStarted {
        event_id: u64,
        name: String,
        version: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ActivityScheduled {
        event_id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    ActivityFailed {
        event_id: u64,
        source_event_id: u64,
        error: OrchestrationError,
    },
    /// Child orchestration scheduled under a deterministic child instance id.
    SubOrchestrationScheduled {
        event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        event_id: u64,
        source_event_id: u64,
        error: OrchestrationError,
    },
    /// Orchestration started waiting for an external signal with this name.
    ExternalSubscribed {
        event_id: u64,
        name: String,
    },
    /// External signal delivered to a subscribed orchestration.
    ExternalEvent {
        event_id: u64,
        name: String,
        data: String,
    },
    OrchestrationCompleted {
        event_id: u64,
        output: String,
    },
    OrchestrationFailed {
        event_id: u64,
        error: OrchestrationError,
    },
    /// Out-of-band termination requested through the client.
    OrchestrationTerminated {
        event_id: u64,
        reason: String,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationTerminated { event_id, .. } => *event_id,
        }
    }

    pub(crate) fn set_event_id(&mut self, id: u64) {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationTerminated { event_id, .. } => *event_id = id,
        }
    }

    /// Completion events point back at the scheduling event they resolve.
    pub fn source_event_id(&self) -> Option<u64> {
        match self {
            Event::ActivityCompleted { source_event_id, .. }
            | Event::ActivityFailed { source_event_id, .. }
            | Event::SubOrchestrationCompleted { source_event_id, .. }
            | Event::SubOrchestrationFailed { source_event_id, .. } => Some(*source_event_id),
            _ => None,
        }
    }

    /// Events issued by orchestration code that replay must reproduce in order.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            Event::ActivityScheduled { .. } | Event::SubOrchestrationScheduled { .. } | Event::ExternalSubscribed { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. } | Event::OrchestrationTerminated { .. }
        )
    }

    /// Short variant name, used in logs and nondeterminism messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::OrchestrationStarted { .. } => "OrchestrationStarted",
            Event::ActivityScheduled { .. } => "ActivityScheduled",
            Event::ActivityCompleted { .. } => "ActivityCompleted",
            Event::ActivityFailed { .. } => "ActivityFailed",
            Event::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            Event::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            Event::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            Event::ExternalSubscribed { .. } => "ExternalSubscribed",
            Event::ExternalEvent { .. } => "ExternalEvent",
            Event::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            Event::OrchestrationFailed { .. } => "OrchestrationFailed",
            Event::OrchestrationTerminated { .. } => "OrchestrationTerminated",
        }
    }
}

/// A call issued by orchestration code. Activities and sub-orchestrations share
/// the same suspend/resume protocol and differ only in where they are dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Activity { name: String, input: String },
    SubOrchestration { name: String, input: String },
}

impl Call {
    pub fn activity(name: impl Into<String>, input: impl Into<String>) -> Self {
        Call::Activity {
            name: name.into(),
            input: input.into(),
        }
    }

    pub fn sub_orchestration(name: impl Into<String>, input: impl Into<String>) -> Self {
        Call::SubOrchestration {
            name: name.into(),
            input: input.into(),
        }
    }
}

/// Decisions produced by a turn. The dispatcher materializes them after the
/// matching scheduling events are durably appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance_id: String,
    pub(crate) orchestration_name: String,
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    // Events with ids up to here were persisted before this turn started.
    pub(crate) replay_boundary: u64,
    pub(crate) replaying: bool,
    pub(crate) claimed_scheduling_events: HashSet<u64>,
    pub(crate) consumed_completions: HashSet<u64>,
    pub(crate) nondeterminism_error: Option<String>,
}

impl CtxInner {
    fn new(instance_id: String, history: Vec<Event>, replay_boundary: u64) -> Self {
        let next_event_id = history.last().map(|e| e.event_id() + 1).unwrap_or(INITIAL_EVENT_ID);
        let orchestration_name = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { name, .. } => Some(name.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let replaying = history
            .iter()
            .any(|e| e.event_id() <= replay_boundary && !matches!(e, Event::OrchestrationStarted { .. }));
        Self {
            instance_id,
            orchestration_name,
            history,
            actions: Vec::new(),
            next_event_id,
            replay_boundary,
            replaying,
            claimed_scheduling_events: HashSet::new(),
            consumed_completions: HashSet::new(),
            nondeterminism_error: None,
        }
    }

    pub(crate) fn allocate_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        // New work means we are past the recorded history.
        self.replaying = false;
        id
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    pub(crate) fn consume_completion(&mut self, completion_event_id: u64) {
        self.consumed_completions.insert(completion_event_id);
        if completion_event_id > self.replay_boundary {
            self.replaying = false;
        }
    }

    /// First scheduling event in history order that no future has adopted yet.
    pub(crate) fn next_unclaimed_scheduling(&self) -> Option<&Event> {
        self.history
            .iter()
            .find(|e| e.is_scheduling() && !self.claimed_scheduling_events.contains(&e.event_id()))
    }

    fn unclaimed_scheduling_count(&self) -> usize {
        self.history
            .iter()
            .filter(|e| e.is_scheduling() && !self.claimed_scheduling_events.contains(&e.event_id()))
            .count()
    }
}

/// Deterministic execution environment handed to orchestration code.
///
/// The context is rebuilt from history on every turn; nothing in it survives
/// across turns except what is recorded as events.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a context over `history`, treating all of it as previously persisted.
    pub fn new(history: Vec<Event>) -> Self {
        let boundary = history.last().map(Event::event_id).unwrap_or(0);
        Self::with_boundary(String::new(), history, boundary)
    }

    pub(crate) fn with_boundary(instance_id: String, history: Vec<Event>, replay_boundary: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance_id, history, replay_boundary))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn orchestration_name(&self) -> String {
        self.lock().orchestration_name.clone()
    }

    /// True while the orchestration is re-executing steps already recorded in
    /// history. Side effects such as logging must be skipped while replaying.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    /// Emit a log line through `tracing` unless the current step is a replay.
    pub fn trace(&self, level: tracing::Level, message: impl AsRef<str>) {
        let (replaying, instance_id, orchestration_name) = {
            let inner = self.lock();
            (inner.replaying, inner.instance_id.clone(), inner.orchestration_name.clone())
        };
        if replaying {
            return;
        }
        let message = message.as_ref();
        if level == tracing::Level::ERROR {
            tracing::error!(target: "ordo::orchestration", instance_id = %instance_id, orchestration_name = %orchestration_name, "{}", message);
        } else if level == tracing::Level::WARN {
            tracing::warn!(target: "ordo::orchestration", instance_id = %instance_id, orchestration_name = %orchestration_name, "{}", message);
        } else if level == tracing::Level::INFO {
            tracing::info!(target: "ordo::orchestration", instance_id = %instance_id, orchestration_name = %orchestration_name, "{}", message);
        } else {
            tracing::debug!(target: "ordo::orchestration", instance_id = %instance_id, orchestration_name = %orchestration_name, "{}", message);
        }
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        self.trace(tracing::Level::INFO, message);
    }
    pub fn trace_warn(&self, message: impl AsRef<str>) {
        self.trace(tracing::Level::WARN, message);
    }
    pub fn trace_error(&self, message: impl AsRef<str>) {
        self.trace(tracing::Level::ERROR, message);
    }
    pub fn trace_debug(&self, message: impl AsRef<str>) {
        self.trace(tracing::Level::DEBUG, message);
    }
}

impl OrchestrationContext {
    /// Issue a call and return a future correlated to its scheduling event.
    pub fn call(&self, call: Call) -> DurableFuture {
        match call {
            Call::Activity { name, input } => self.schedule_activity(name, input),
            Call::SubOrchestration { name, input } => self.schedule_sub_orchestration(name, input),
        }
    }

    /// Schedule an activity; the returned future can be awaited or composed
    /// with [`join`](Self::join) / [`select`](Self::select).
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into())
    }

    /// Schedule an activity and await its result.
    pub fn call_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ResultFuture {
        self.schedule_activity(name, input).into_result()
    }

    /// Typed variant of [`call_activity`](Self::call_activity) using JSON payloads.
    pub fn call_activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> BoxFuture<'static, Result<Out, OrchestrationError>>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned + Send + 'static,
    {
        let name: String = name.into();
        let scheduled = codec::encode(input).map(|payload| self.schedule_activity(name.clone(), payload));
        Box::pin(async move {
            let fut = scheduled.map_err(|e| OrchestrationError::Application(format!("encode input for '{name}': {e}")))?;
            let raw = fut.into_result().await?;
            codec::decode::<Out>(&raw)
                .map_err(|e| OrchestrationError::Application(format!("decode output of '{name}': {e}")))
        })
    }

    /// Schedule a child orchestration. Its instance id is derived from this
    /// instance and the scheduling event id, so replay always targets the same child.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), input.into())
    }

    pub fn call_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> ResultFuture {
        self.schedule_sub_orchestration(name, input).into_result()
    }

    /// Subscribe to an external signal raised through the client.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::external(self.clone(), name.into())
    }

    pub fn wait_for_event(&self, name: impl Into<String>) -> EventFuture {
        self.schedule_wait(name).into_event()
    }

    /// Whole-batch join: resolves once every future has a result, returning
    /// outputs in argument order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    /// First-completed select: resolves with the future whose completion is
    /// earliest in history, returning `(index, output)`.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(futures)
    }

    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture::new(vec![a, b])
    }
}

fn poll_once<F: Future>(fut: F) -> Poll<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    let fut = pin!(fut);
    fut.poll(&mut cx)
}

/// Outcome of polling an orchestration once against a history.
#[derive(Debug)]
pub struct TurnOutput<O> {
    /// History after the turn: the input history plus newly scheduled events.
    pub history: Vec<Event>,
    /// Calls the dispatcher must materialize.
    pub actions: Vec<Action>,
    /// Present when the orchestration ran to completion this turn.
    pub output: Option<O>,
    /// Set when replay diverged from the recorded history.
    pub nondeterminism: Option<String>,
}

/// Poll `orchestrator` once over `history`, treating the whole history as
/// previously persisted.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl FnOnce(OrchestrationContext) -> F) -> TurnOutput<O>
where
    F: Future<Output = O>,
{
    let boundary = history.last().map(Event::event_id).unwrap_or(0);
    run_turn_with("", history, boundary, orchestrator)
}

/// Poll `orchestrator` once for `instance_id`. Events with ids above
/// `replay_boundary` are new in this turn and end the replay phase when consumed.
pub fn run_turn_with<O, F>(
    instance_id: &str,
    history: Vec<Event>,
    replay_boundary: u64,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnOutput<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::with_boundary(instance_id.to_string(), history, replay_boundary);
    let poll = poll_once(orchestrator(ctx.clone()));
    let actions = ctx.take_actions();
    let mut inner = ctx.lock();
    let mut nondeterminism = inner.nondeterminism_error.take();
    let output = match poll {
        Poll::Ready(out) => {
            let unclaimed = inner.unclaimed_scheduling_count();
            if nondeterminism.is_none() && unclaimed > 0 {
                nondeterminism = Some(format!(
                    "orchestration completed but {unclaimed} scheduled call(s) in history were never re-issued"
                ));
            }
            Some(out)
        }
        Poll::Pending => None,
    };
    TurnOutput {
        history: std::mem::take(&mut inner.history),
        actions,
        output,
        nondeterminism,
    }
}
