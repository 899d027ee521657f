//! Durable payroll orchestration on a minimal, replay-driven task framework.
//!
//! The crate records append-only `Event`s per orchestration instance and
//! replays them to make orchestration code deterministic. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn`, `run_turn_with`, and `Executor`
//! - An `OrchestrationContext` with futures to schedule activities, timers
//!   and child orchestrations using correlation IDs
//! - Retry-aware activity invocation (`retry`)
//! - An in-process tokio `runtime::Runtime` with pluggable history stores
//! - The payroll domain (`payroll`): `ProcessPayroll`, its `ProcessPayments`
//!   fan-out, and the pay-details workflows
use std::collections::HashSet;
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

pub mod config;
pub mod futures;
pub mod logging;
pub mod payroll;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use crate::futures::{DurableFuture, DurableOutput, JoinAll, join_all};
pub use crate::retry::{ActivityFailure, ActivityOptions, FailureKind, MaxAttempts, RetryPolicy};
pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus};

use crate::futures::Schedule;
use serde::{Deserialize, Serialize};

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize + ?Sized>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize + ?Sized>(v: &T) -> Result<String, String> {
            // Plain JSON strings travel unquoted so ids stay readable in history
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat raw string as JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a store and
/// consumed during replay. Variants use stable correlation IDs to pair
/// scheduling operations with their completions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Orchestration execution was created and started by name with input.
    /// Parent linkage is present when this is a child orchestration.
    OrchestrationStarted {
        name: String,
        input: String,
        parent_instance: Option<String>,
        parent_execution_id: Option<u64>,
        parent_id: Option<u64>,
    },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String },
    /// Orchestration failed with a final error.
    OrchestrationFailed { error: String },
    /// Activity was scheduled with a unique ID, input and optional per-call timeout.
    ActivityScheduled {
        id: u64,
        name: String,
        input: String,
        timeout_ms: Option<u64>,
    },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed; `error` carries the wire form of an `ActivityFailure`.
    ActivityFailed { id: u64, error: String },

    /// Durable timer was created for `delay_ms`.
    TimerCreated { id: u64, delay_ms: u64 },
    /// Timer fired.
    TimerFired { id: u64 },

    /// Child orchestration was scheduled with a deterministic child instance id.
    SubOrchestrationScheduled {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
    /// Child orchestration completed and returned a result to the parent.
    SubOrchestrationCompleted { id: u64, result: String },
    /// Child orchestration failed and returned an error to the parent.
    SubOrchestrationFailed { id: u64, error: String },

    /// Cancellation has been requested (terminal failure follows).
    OrchestrationCancelRequested { reason: String },
}

impl Event {
    /// Correlation id for scheduling and completion events.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::TimerFired { id }
            | Event::SubOrchestrationScheduled { id, .. }
            | Event::SubOrchestrationCompleted { id, .. }
            | Event::SubOrchestrationFailed { id, .. } => Some(*id),
            Event::OrchestrationStarted { .. }
            | Event::OrchestrationCompleted { .. }
            | Event::OrchestrationFailed { .. }
            | Event::OrchestrationCancelRequested { .. } => None,
        }
    }

    pub fn is_schedule(&self) -> bool {
        matches!(
            self,
            Event::ActivityScheduled { .. } | Event::TimerCreated { .. } | Event::SubOrchestrationScheduled { .. }
        )
    }

    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Event::ActivityCompleted { .. }
                | Event::ActivityFailed { .. }
                | Event::TimerFired { .. }
                | Event::SubOrchestrationCompleted { .. }
                | Event::SubOrchestrationFailed { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. }
        )
    }
}

/// Declarative decisions produced by an orchestration turn. The host is
/// responsible for materializing these into completion `Event`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity {
        id: u64,
        name: String,
        input: String,
        timeout_ms: Option<u64>,
    },
    /// Create a timer that will fire after the requested delay.
    CreateTimer { id: u64, delay_ms: u64 },
    /// Start a child orchestration by name and child instance id.
    StartSubOrchestration {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
}

impl Action {
    pub fn id(&self) -> u64 {
        match self {
            Action::CallActivity { id, .. } | Action::CreateTimer { id, .. } | Action::StartSubOrchestration { id, .. } => {
                *id
            }
        }
    }

    fn from_schedule_event(ev: &Event) -> Option<Action> {
        match ev {
            Event::ActivityScheduled {
                id,
                name,
                input,
                timeout_ms,
            } => Some(Action::CallActivity {
                id: *id,
                name: name.clone(),
                input: input.clone(),
                timeout_ms: *timeout_ms,
            }),
            Event::TimerCreated { id, delay_ms } => Some(Action::CreateTimer {
                id: *id,
                delay_ms: *delay_ms,
            }),
            Event::SubOrchestrationScheduled {
                id,
                name,
                instance,
                input,
            } => Some(Action::StartSubOrchestration {
                id: *id,
                name: name.clone(),
                instance: instance.clone(),
                input: input.clone(),
            }),
            _ => None,
        }
    }
}

/// Re-derive the actions for every scheduled operation that has no
/// completion yet. Hosts use this to re-dispatch outstanding work after a
/// restart; it is empty for terminal histories.
pub fn pending_actions(history: &[Event]) -> Vec<Action> {
    if history.iter().any(Event::is_terminal) {
        return Vec::new();
    }
    let completed: HashSet<u64> = history
        .iter()
        .filter(|e| e.is_completion())
        .filter_map(Event::correlation_id)
        .collect();
    history
        .iter()
        .filter(|e| e.correlation_id().is_some_and(|id| !completed.contains(&id)))
        .filter_map(Action::from_schedule_event)
        .collect()
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    history: Vec<Event>,
    actions: Vec<Action>,
    next_correlation_id: u64,
    turn_index: u64,
    // Scheduling events adopted by futures during this replay
    claimed: HashSet<u64>,
    // Correlation ids whose completion has been handed to a future
    consumed: HashSet<u64>,
    // Leading history events an earlier turn already acted on
    seen_len: usize,
    // Position of the completion handed out most recently
    last_consumed_at: Option<usize>,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>, seen_len: usize) -> Self {
        let max_id = history.iter().filter_map(Event::correlation_id).max().unwrap_or(0);
        Self {
            instance,
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            turn_index: 0,
            claimed: HashSet::new(),
            consumed: HashSet::new(),
            seen_len,
            last_consumed_at: None,
            nondeterminism: None,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    /// Adopt the next unclaimed scheduling event in history order, or record
    /// a new one when replay has reached the frontier. A mismatching event at
    /// the frontier means the code no longer matches its history.
    pub(crate) fn claim(&mut self, expected: &Schedule) -> Option<u64> {
        if self.nondeterminism.is_some() {
            return None;
        }
        let frontier = self
            .history
            .iter()
            .find(|e| e.is_schedule() && e.correlation_id().is_some_and(|id| !self.claimed.contains(&id)))
            .map(|e| (e.correlation_id(), expected.matches(e), format!("{e:?}")));
        match frontier {
            Some((Some(id), true, _)) => {
                self.claimed.insert(id);
                Some(id)
            }
            Some((_, _, found)) => {
                self.nondeterminism = Some(format!(
                    "nondeterministic: schedule order mismatch: history has {found} but code scheduled {expected}"
                ));
                None
            }
            None => {
                let id = self.next_id();
                let (event, action) = expected.materialize(id, &self.instance, &self.history);
                self.history.push(event);
                self.actions.push(action);
                self.claimed.insert(id);
                Some(id)
            }
        }
    }

    /// Hand out the completion for `id` only when every completion recorded
    /// before it has already been consumed and every scheduling event
    /// recorded before it has been claimed. Concurrent branches then replay
    /// in the interleaving the live run recorded: a branch cannot act on a
    /// result while a sibling still has to reclaim an earlier schedule.
    pub(crate) fn try_consume(&mut self, id: u64) -> Option<Event> {
        let mut unclaimed_before = false;
        for (pos, ev) in self.history.iter().enumerate() {
            let Some(cid) = ev.correlation_id() else { continue };
            if ev.is_schedule() {
                unclaimed_before |= !self.claimed.contains(&cid);
                continue;
            }
            if !ev.is_completion() {
                continue;
            }
            if cid == id {
                if unclaimed_before {
                    return None;
                }
                let ev = ev.clone();
                self.consumed.insert(id);
                self.last_consumed_at = Some(pos);
                return Some(ev);
            }
            if !self.consumed.contains(&cid) {
                return None;
            }
        }
        None
    }

    /// Claims and consumptions so far; a poll pass that leaves this
    /// unchanged cannot unblock anything.
    fn progress(&self) -> usize {
        self.claimed.len() + self.consumed.len()
    }

    /// A recorded schedule that no code path reclaimed once the turn has
    /// stalled means the code stopped scheduling it.
    fn unclaimed_schedule(&self) -> Option<String> {
        self.history
            .iter()
            .find(|e| e.is_schedule() && e.correlation_id().is_some_and(|id| !self.claimed.contains(&id)))
            .map(|e| format!("nondeterministic: history has {e:?} but code never scheduled it"))
    }

    /// The code running now was reached through a completion an earlier turn
    /// already saw, or through no completion at all on a later turn.
    fn is_replaying(&self) -> bool {
        match self.last_consumed_at {
            Some(pos) => pos < self.seen_len,
            None => self.seen_len > 0,
        }
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self::with_instance("", history)
    }

    /// Construct a context bound to a named instance; child instance ids are
    /// derived from it.
    pub fn with_instance(instance: impl Into<String>, history: Vec<Event>) -> Self {
        let seen_len = replay_frontier(&history);
        Self::resuming(instance, history, seen_len)
    }

    /// Construct a context whose first `seen_len` history events were
    /// already acted on by an earlier turn.
    pub fn resuming(instance: impl Into<String>, history: Vec<Event>, seen_len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history, seen_len))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // Only ever locked from the single polling thread of a turn
        self.inner.lock().expect("orchestration context poisoned")
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.lock().turn_index = idx;
    }

    /// True while the code is re-running decisions an earlier turn already
    /// made. Results that arrived since the last turn are live.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    /// Logging is enabled only for code reached through a result new to this
    /// turn, so each line is emitted once per decision.
    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    fn nondeterminism(&self) -> Option<String> {
        self.lock().nondeterminism.clone()
    }

    fn progress(&self) -> usize {
        self.lock().progress()
    }

    fn into_parts(self) -> (Vec<Event>, Vec<Action>) {
        let mut inner = self.lock();
        (std::mem::take(&mut inner.history), std::mem::take(&mut inner.actions))
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity_with_timeout(name, input, None)
    }

    /// Schedule an activity whose worker must finish within `timeout`.
    pub fn schedule_activity_with_timeout(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        timeout: Option<Duration>,
    ) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Schedule::Activity {
                name: name.into(),
                input: input.into(),
                timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            },
        )
    }

    /// Schedule a durable timer and return a `DurableFuture` correlated to it.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Schedule::Timer {
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            },
        )
    }

    /// Start a child orchestration immediately and return a handle to its
    /// result. The child is claimed at call time, so it runs whether or not
    /// the handle is ever awaited.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let mut fut = DurableFuture::new(
            self.clone(),
            Schedule::SubOrchestration {
                name: name.into(),
                input: input.into(),
            },
        );
        fut.claim_now();
        fut
    }

    /// Typed variant of `schedule_sub_orchestration`.
    pub fn schedule_sub_orchestration_typed<In: Serialize + ?Sized>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        use crate::_typed_codec::Codec;
        let payload = crate::_typed_codec::Json::encode(input)?;
        Ok(self.schedule_sub_orchestration(name, payload))
    }
}

/// Tuple returned by `run_turn` and `run_turn_with` containing the updated
/// history, actions to execute, and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Option<O>);

/// Replay the orchestrator once against `history`, producing the updated
/// history, requested `Action`s and the output if it finished. Returns an
/// error when the code diverges from its recorded history.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl FnOnce(OrchestrationContext) -> F) -> Result<TurnResult<O>, String>
where
    F: Future<Output = O>,
{
    let seen_len = replay_frontier(&history);
    run_turn_with("", history, seen_len, 0, orchestrator)
}

/// Same as `run_turn` but binds the context to an instance id, the number of
/// leading events an earlier turn already acted on, and a caller-supplied
/// turn index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    instance: &str,
    history: Vec<Event>,
    seen_len: usize,
    turn_index: u64,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> Result<TurnResult<O>, String>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::resuming(instance, history, seen_len);
    ctx.set_turn_index(turn_index);
    let mut fut = pin!(orchestrator(ctx.clone()));
    let mut cx = Context::from_waker(Waker::noop());
    // Futures never register wakers; keep polling while branches claim or
    // consume so every branch advances as far as history allows.
    let output = loop {
        let progress_before = ctx.progress();
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(out) => break Some(out),
            Poll::Pending => {
                if let Some(err) = ctx.nondeterminism() {
                    return Err(err);
                }
                if ctx.progress() == progress_before {
                    if let Some(err) = ctx.lock().unclaimed_schedule() {
                        return Err(err);
                    }
                    break None;
                }
            }
        }
    };
    let (history, actions) = ctx.into_parts();
    Ok((history, actions, output))
}

/// Length of the history prefix an earlier turn is known to have acted on:
/// everything up to the last scheduling event. Hosts that lost track of
/// their turns, e.g. after a restart, start from here.
pub fn replay_frontier(history: &[Event]) -> usize {
    history.iter().rposition(Event::is_schedule).map_or(0, |pos| pos + 1)
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// `execute_actions` to materialize requested actions into history.
    /// Returns `None` as output when the run stalls: a turn neither finished
    /// nor let the host append anything.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> Result<(Vec<Event>, Option<O>), String>
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        let mut seen_len = replay_frontier(&history);
        let mut turn_index = 0;
        loop {
            let (hist_after_replay, actions, output) =
                run_turn_with("", history, seen_len, turn_index, &orchestrator)?;
            history = hist_after_replay;
            seen_len = history.len();
            turn_index += 1;
            if let Some(out) = output {
                return Ok((history, Some(out)));
            }
            let len_before = history.len();
            execute_actions(actions, &mut history);
            if history.len() == len_before {
                return Ok((history, None));
            }
        }
    }
}
