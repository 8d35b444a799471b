use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use ::futures::FutureExt;
use ::futures::future::Map;

use crate::{Action, CtxInner, Event, OrchestrationContext, OrchestrationError};

/// Result of a resolved [`DurableFuture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, OrchestrationError>),
    SubOrchestration(Result<String, OrchestrationError>),
    External(String),
}

impl DurableOutput {
    /// Collapse into the call result. External signals always succeed.
    pub fn into_result(self) -> Result<String, OrchestrationError> {
        match self {
            DurableOutput::Activity(r) | DurableOutput::SubOrchestration(r) => r,
            DurableOutput::External(data) => Ok(data),
        }
    }

    pub fn into_event(self) -> String {
        match self {
            DurableOutput::External(data) => data,
            other => other.into_result().unwrap_or_else(|e| e.to_string()),
        }
    }
}

pub type ResultFuture = Map<DurableFuture, fn(DurableOutput) -> Result<String, OrchestrationError>>;
pub type EventFuture = Map<DurableFuture, fn(DurableOutput) -> String>;

pub(crate) enum Kind {
    Activity { name: String, input: String },
    SubOrch { name: String, input: String, instance: Option<String> },
    External { name: String },
}

impl Kind {
    fn describe(&self) -> String {
        match self {
            Kind::Activity { name, input } => format!("ActivityScheduled('{name}','{input}')"),
            Kind::SubOrch { name, input, .. } => format!("SubOrchestrationScheduled('{name}','{input}')"),
            Kind::External { name } => format!("ExternalSubscribed('{name}')"),
        }
    }

    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Kind::Activity { name, input }, Event::ActivityScheduled { name: n, input: i, .. }) => n == name && i == input,
            (Kind::SubOrch { name, input, .. }, Event::SubOrchestrationScheduled { name: n, input: i, .. }) => {
                n == name && i == input
            }
            (Kind::External { name }, Event::ExternalSubscribed { name: n, .. }) => n == name,
            _ => false,
        }
    }
}

fn describe_scheduling(event: &Event) -> String {
    match event {
        Event::ActivityScheduled { name, input, .. } => format!("ActivityScheduled('{name}','{input}')"),
        Event::SubOrchestrationScheduled { name, input, .. } => format!("SubOrchestrationScheduled('{name}','{input}')"),
        Event::ExternalSubscribed { name, .. } => format!("ExternalSubscribed('{name}')"),
        other => other.kind().to_string(),
    }
}

/// A call issued from orchestration code.
///
/// The first poll claims a scheduling event: on replay it adopts the next
/// unclaimed scheduling event in history (which must match), otherwise it
/// appends a new one and records an [`Action`]. Later polls resolve once the
/// correlated completion is present in history.
pub struct DurableFuture {
    pub(crate) kind: Kind,
    ctx: OrchestrationContext,
    claimed_event_id: Option<u64>,
    completed_at: Option<u64>,
}

impl DurableFuture {
    fn new(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self {
            kind,
            ctx,
            claimed_event_id: None,
            completed_at: None,
        }
    }

    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self::new(ctx, Kind::Activity { name, input })
    }

    pub(crate) fn sub_orchestration(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self::new(
            ctx,
            Kind::SubOrch {
                name,
                input,
                instance: None,
            },
        )
    }

    pub(crate) fn external(ctx: OrchestrationContext, name: String) -> Self {
        Self::new(ctx, Kind::External { name })
    }

    /// Scheduling event this future is bound to, once polled.
    pub fn scheduling_event_id(&self) -> Option<u64> {
        self.claimed_event_id
    }

    /// Event id of the completion that resolved this future.
    pub fn completion_event_id(&self) -> Option<u64> {
        self.completed_at
    }

    pub fn into_result(self) -> ResultFuture {
        self.map(DurableOutput::into_result as fn(DurableOutput) -> Result<String, OrchestrationError>)
    }

    pub fn into_event(self) -> EventFuture {
        self.map(DurableOutput::into_event as fn(DurableOutput) -> String)
    }

    fn claim(&mut self, inner: &mut CtxInner) -> Option<u64> {
        if let Some(next) = inner.next_unclaimed_scheduling().cloned() {
            if !self.kind.matches(&next) {
                inner.nondeterminism_error = Some(format!(
                    "schedule order mismatch: next is {} but expected {}",
                    describe_scheduling(&next),
                    self.kind.describe()
                ));
                return None;
            }
            if let (Kind::SubOrch { instance, .. }, Event::SubOrchestrationScheduled { instance: recorded, .. }) =
                (&mut self.kind, &next)
            {
                *instance = Some(recorded.clone());
            }
            let id = next.event_id();
            inner.claimed_scheduling_events.insert(id);
            self.claimed_event_id = Some(id);
            return Some(id);
        }

        let id = inner.allocate_event_id();
        match &mut self.kind {
            Kind::Activity { name, input } => {
                inner.history.push(Event::ActivityScheduled {
                    event_id: id,
                    name: name.clone(),
                    input: input.clone(),
                });
                inner.record_action(Action::CallActivity {
                    scheduling_event_id: id,
                    name: name.clone(),
                    input: input.clone(),
                });
            }
            Kind::SubOrch { name, input, instance } => {
                let child = format!("{}::sub::{}", inner.instance_id, id);
                inner.history.push(Event::SubOrchestrationScheduled {
                    event_id: id,
                    name: name.clone(),
                    instance: child.clone(),
                    input: input.clone(),
                });
                inner.record_action(Action::StartSubOrchestration {
                    scheduling_event_id: id,
                    name: name.clone(),
                    instance: child.clone(),
                    input: input.clone(),
                });
                *instance = Some(child);
            }
            Kind::External { name } => {
                inner.history.push(Event::ExternalSubscribed {
                    event_id: id,
                    name: name.clone(),
                });
            }
        }
        inner.claimed_scheduling_events.insert(id);
        self.claimed_event_id = Some(id);
        Some(id)
    }

    fn find_completion(&self, inner: &CtxInner, claimed: u64) -> Option<(u64, DurableOutput)> {
        match &self.kind {
            Kind::Activity { .. } => inner.history.iter().find_map(|e| match e {
                Event::ActivityCompleted {
                    event_id,
                    source_event_id,
                    result,
                } if *source_event_id == claimed => Some((*event_id, DurableOutput::Activity(Ok(result.clone())))),
                Event::ActivityFailed {
                    event_id,
                    source_event_id,
                    error,
                } if *source_event_id == claimed => Some((*event_id, DurableOutput::Activity(Err(error.clone())))),
                _ => None,
            }),
            Kind::SubOrch { .. } => inner.history.iter().find_map(|e| match e {
                Event::SubOrchestrationCompleted {
                    event_id,
                    source_event_id,
                    result,
                } if *source_event_id == claimed => {
                    Some((*event_id, DurableOutput::SubOrchestration(Ok(result.clone()))))
                }
                Event::SubOrchestrationFailed {
                    event_id,
                    source_event_id,
                    error,
                } if *source_event_id == claimed => {
                    Some((*event_id, DurableOutput::SubOrchestration(Err(error.clone()))))
                }
                _ => None,
            }),
            Kind::External { name } => {
                // The k-th subscription to a name receives the k-th signal with that name.
                let ordinal = inner
                    .history
                    .iter()
                    .filter(|e| matches!(e, Event::ExternalSubscribed { event_id, name: n } if n == name && *event_id < claimed))
                    .count();
                inner
                    .history
                    .iter()
                    .filter_map(|e| match e {
                        Event::ExternalEvent { event_id, name: n, data } if n == name => Some((*event_id, data)),
                        _ => None,
                    })
                    .nth(ordinal)
                    .map(|(id, data)| (id, DurableOutput::External(data.clone())))
            }
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let ctx = this.ctx.clone();
        let mut inner = ctx.lock();

        // Once replay has diverged nothing else may make progress.
        if inner.nondeterminism_error.is_some() {
            return Poll::Pending;
        }

        let claimed = match this.claimed_event_id {
            Some(id) => id,
            None => match this.claim(&mut inner) {
                Some(id) => id,
                None => return Poll::Pending,
            },
        };

        match this.find_completion(&inner, claimed) {
            Some((completion_id, output)) => {
                inner.consume_completion(completion_id);
                this.completed_at = Some(completion_id);
                Poll::Ready(output)
            }
            None => Poll::Pending,
        }
    }
}

/// Whole-batch join over durable futures. Children are polled in argument
/// order so their scheduling events are appended in that order.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
    results: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        let results = children.iter().map(|_| None).collect();
        Self { children, results }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (child, slot) in this.children.iter_mut().zip(this.results.iter_mut()) {
            if slot.is_none() {
                if let Poll::Ready(out) = Pin::new(child).poll(cx) {
                    *slot = Some(out);
                }
            }
        }
        if this.results.iter().all(Option::is_some) {
            Poll::Ready(this.results.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}

/// First-completed select. The winner is the child whose completion appears
/// earliest in history, which replay reproduces regardless of poll order.
pub struct SelectFuture {
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        Self { children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut winner: Option<(u64, usize, DurableOutput)> = None;
        for (idx, child) in this.children.iter_mut().enumerate() {
            if let Poll::Ready(out) = Pin::new(&mut *child).poll(cx) {
                let at = child.completion_event_id().unwrap_or(u64::MAX);
                if winner.as_ref().is_none_or(|(best, _, _)| at < *best) {
                    winner = Some((at, idx, out));
                }
            }
        }
        match winner {
            Some((_, idx, out)) => Poll::Ready((idx, out)),
            None => Poll::Pending,
        }
    }
}
