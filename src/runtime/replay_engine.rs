use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::runtime::OrchestrationHandler;
use crate::runtime::queue::WorkItem;
use crate::{Action, Event, OrchestrationError};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Turn finished; the orchestration is waiting on outstanding calls.
    Continue,
    Completed(String),
    Failed(OrchestrationError),
}

/// Replays history and executes one deterministic orchestration evaluation.
pub struct ReplayEngine {
    pub(crate) instance: String,
    /// History as loaded from the store at the start of this run
    pub(crate) baseline_history: Vec<Event>,
    /// Events produced during this run, in append order
    pub(crate) history_delta: Vec<Event>,
    /// Actions to dispatch once `history_delta` is persisted
    pub(crate) pending_actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    /// Error that fails the instance without running orchestration code
    pub(crate) abort_error: Option<OrchestrationError>,
    /// Completions dropped because history already held them
    pub(crate) duplicates: u64,
}

impl ReplayEngine {
    pub fn new(instance: String, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history
            .last()
            .map(|e| e.event_id() + 1)
            .unwrap_or(crate::INITIAL_EVENT_ID);
        Self {
            instance,
            baseline_history,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            next_event_id,
            abort_error: None,
            duplicates: 0,
        }
    }

    fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    fn push_event(&mut self, mut event: Event) {
        event.set_event_id(self.next_event_id);
        self.next_event_id += 1;
        self.history_delta.push(event);
    }

    pub fn is_started(&self) -> bool {
        self.all_events().any(|e| matches!(e, Event::OrchestrationStarted { .. }))
    }

    pub fn terminal_event(&self) -> Option<&Event> {
        self.all_events().find(|e| e.is_terminal())
    }

    /// Name, version and input recorded by `OrchestrationStarted`.
    pub fn started_info(&self) -> Option<(String, String, String)> {
        self.all_events().find_map(|e| match e {
            Event::OrchestrationStarted {
                name, version, input, ..
            } => Some((name.clone(), version.clone(), input.clone())),
            _ => None,
        })
    }

    /// Record `OrchestrationStarted` for a fresh instance.
    pub fn start(&mut self, name: String, version: String, input: String, parent: Option<(String, u64)>) {
        if self.is_started() {
            return;
        }
        let (parent_instance, parent_id) = match parent {
            Some((p, id)) => (Some(p), Some(id)),
            None => (None, None),
        };
        self.push_event(Event::OrchestrationStarted {
            event_id: 0,
            name,
            version,
            input,
            parent_instance,
            parent_id,
        });
    }

    fn schedule_kind(&self, id: u64) -> Option<&'static str> {
        self.all_events().find_map(|e| match e {
            Event::ActivityScheduled { event_id, .. } if *event_id == id => Some("activity"),
            Event::SubOrchestrationScheduled { event_id, .. } if *event_id == id => Some("suborchestration"),
            _ => None,
        })
    }

    fn has_completion_for(&self, id: u64) -> bool {
        self.all_events().any(|e| e.source_event_id() == Some(id))
    }

    fn check_kind(&self, id: u64, got: &str) -> Option<OrchestrationError> {
        match self.schedule_kind(id) {
            Some(k) if k == got => None,
            Some(other) => Some(OrchestrationError::DeterminismViolation(format!(
                "completion kind mismatch for id={id}, expected '{other}', got '{got}'"
            ))),
            None => Some(OrchestrationError::DeterminismViolation(format!(
                "no matching schedule for {got} completion id={id}"
            ))),
        }
    }

    /// Stage 1: convert completion messages into history events.
    ///
    /// Duplicates of completions already in history are dropped, completions
    /// with no matching schedule abort the turn, and fatal failures are
    /// recorded and then abort the turn.
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        debug!(instance = %self.instance, message_count = messages.len(), "converting messages to events");

        for msg in messages {
            let correlated = match &msg {
                WorkItem::ActivityCompleted { id, .. } | WorkItem::ActivityFailed { id, .. } => Some((*id, "activity")),
                WorkItem::SubOrchCompleted { parent_id, .. } | WorkItem::SubOrchFailed { parent_id, .. } => {
                    Some((*parent_id, "suborchestration"))
                }
                _ => None,
            };

            if let Some((id, kind)) = correlated {
                if self.has_completion_for(id) {
                    debug!(instance = %self.instance, id, kind, "dropping duplicate completion");
                    self.duplicates += 1;
                    continue;
                }
                if let Some(err) = self.check_kind(id, kind) {
                    warn!(instance = %self.instance, error = %err, "detected nondeterminism in completion batch");
                    if self.abort_error.is_none() {
                        self.abort_error = Some(err);
                    }
                    continue;
                }
            }

            match msg {
                WorkItem::ActivityCompleted { id, result, .. } => self.push_event(Event::ActivityCompleted {
                    event_id: 0,
                    source_event_id: id,
                    result,
                }),
                WorkItem::ActivityFailed { id, error, .. } => {
                    if error.is_fatal() && self.abort_error.is_none() {
                        warn!(instance = %self.instance, id, error = %error, "fatal activity failure aborts turn");
                        self.abort_error = Some(error.clone());
                    }
                    self.push_event(Event::ActivityFailed {
                        event_id: 0,
                        source_event_id: id,
                        error,
                    });
                }
                WorkItem::SubOrchCompleted { parent_id, result, .. } => self.push_event(Event::SubOrchestrationCompleted {
                    event_id: 0,
                    source_event_id: parent_id,
                    result,
                }),
                WorkItem::SubOrchFailed { parent_id, error, .. } => self.push_event(Event::SubOrchestrationFailed {
                    event_id: 0,
                    source_event_id: parent_id,
                    error,
                }),
                WorkItem::ExternalRaised { name, data, .. } => {
                    // Only materialize signals somebody has subscribed to.
                    let subscribed = self
                        .all_events()
                        .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if *n == name));
                    if subscribed {
                        self.push_event(Event::ExternalEvent { event_id: 0, name, data });
                    } else {
                        warn!(instance = %self.instance, event_name = %name, "dropping external event with no matching subscription");
                    }
                }
                WorkItem::StartOrchestration { .. } | WorkItem::ActivityExecute { .. } => {}
            }
        }

        debug!(instance = %self.instance, event_count = self.history_delta.len(), "completion events created");
    }

    /// Stage 2: run the orchestration once against baseline plus delta.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        if let Some(err) = self.abort_error.clone() {
            return TurnResult::Failed(err);
        }

        let mut working_history = self.baseline_history.clone();
        working_history.extend(self.history_delta.iter().cloned());
        let working_len = working_history.len();
        let replay_boundary = self.baseline_history.last().map(Event::event_id).unwrap_or(0);
        let instance = self.instance.clone();

        let run_result = catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn_with(&instance, working_history, replay_boundary, move |ctx| {
                let h = Arc::clone(&handler);
                async move { h.invoke(ctx, input).await }
            })
        }));

        let turn = match run_result {
            Ok(turn) => turn,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                return TurnResult::Failed(OrchestrationError::Panicked(msg));
            }
        };

        if let Some(msg) = turn.nondeterminism {
            return TurnResult::Failed(OrchestrationError::DeterminismViolation(msg));
        }

        // Scheduling events decided this turn; keep them so history records what
        // the code asked for even if the instance also finished this turn.
        self.history_delta.extend(turn.history.into_iter().skip(working_len));
        self.next_event_id = self
            .history_delta
            .last()
            .map(|e| e.event_id() + 1)
            .unwrap_or(self.next_event_id);

        match turn.output {
            None => {
                self.pending_actions = turn.actions;
                TurnResult::Continue
            }
            Some(Ok(output)) => TurnResult::Completed(output),
            Some(Err(e)) => TurnResult::Failed(e),
        }
    }

    /// Append the terminal event matching `result`, if any.
    pub fn finish(&mut self, result: &TurnResult) {
        match result {
            TurnResult::Continue => {}
            TurnResult::Completed(output) => self.push_event(Event::OrchestrationCompleted {
                event_id: 0,
                output: output.clone(),
            }),
            TurnResult::Failed(error) => self.push_event(Event::OrchestrationFailed {
                event_id: 0,
                error: error.clone(),
            }),
        }
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    pub fn final_history(&self) -> Vec<Event> {
        self.all_events().cloned().collect()
    }
}
