use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::_typed_codec::{Codec, Json};
use crate::{Action, Event, OrchestrationContext};
use serde::de::DeserializeOwned;

/// What a scheduling call expects to find at the replay frontier, and what
/// it records when it reaches new ground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Schedule {
    Activity {
        name: String,
        input: String,
        timeout_ms: Option<u64>,
    },
    Timer {
        delay_ms: u64,
    },
    SubOrchestration {
        name: String,
        input: String,
    },
}

impl Schedule {
    /// Name and input must match; timeouts and delays may be retuned
    /// between deployments without invalidating running histories.
    pub(crate) fn matches(&self, ev: &Event) -> bool {
        match (self, ev) {
            (Schedule::Activity { name, input, .. }, Event::ActivityScheduled { name: n, input: i, .. }) => {
                name == n && input == i
            }
            (Schedule::Timer { .. }, Event::TimerCreated { .. }) => true,
            (Schedule::SubOrchestration { name, input }, Event::SubOrchestrationScheduled { name: n, input: i, .. }) => {
                name == n && input == i
            }
            _ => false,
        }
    }

    /// Record this schedule under correlation `id`. `history` is what the
    /// parent has recorded so far; it numbers repeated children.
    pub(crate) fn materialize(&self, id: u64, parent_instance: &str, history: &[Event]) -> (Event, Action) {
        match self {
            Schedule::Activity { name, input, timeout_ms } => (
                Event::ActivityScheduled {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                    timeout_ms: *timeout_ms,
                },
                Action::CallActivity {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                    timeout_ms: *timeout_ms,
                },
            ),
            Schedule::Timer { delay_ms } => (
                Event::TimerCreated { id, delay_ms: *delay_ms },
                Action::CreateTimer { id, delay_ms: *delay_ms },
            ),
            Schedule::SubOrchestration { name, input } => {
                let instance = child_instance(parent_instance, name, history);
                (
                    Event::SubOrchestrationScheduled {
                        id,
                        name: name.clone(),
                        instance: instance.clone(),
                        input: input.clone(),
                    },
                    Action::StartSubOrchestration {
                        id,
                        name: name.clone(),
                        instance,
                        input: input.clone(),
                    },
                )
            }
        }
    }
}

/// Child ids depend on the parent id, the child's name and how many children
/// of that name the parent started earlier, never on correlation ids. Every
/// execution of a parent therefore addresses the same children.
fn child_instance(parent_instance: &str, name: &str, history: &[Event]) -> String {
    let earlier = history
        .iter()
        .filter(|e| matches!(e, Event::SubOrchestrationScheduled { name: n, .. } if n == name))
        .count();
    match earlier {
        0 => format!("{parent_instance}::{name}"),
        n => format!("{parent_instance}::{name}::{}", n + 1),
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Activity { name, input, .. } => write!(f, "activity {name}({input})"),
            Schedule::Timer { delay_ms } => write!(f, "timer({delay_ms}ms)"),
            Schedule::SubOrchestration { name, input } => write!(f, "sub-orchestration {name}({input})"),
        }
    }
}

/// Output of a `DurableFuture` once its completion has been replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    SubOrchestration(Result<String, String>),
}

/// A future bound to one scheduled operation. The first poll claims (or
/// records) its scheduling event; it resolves once its completion is the
/// next one in history order.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    schedule: Schedule,
    id: Option<u64>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, schedule: Schedule) -> Self {
        Self { ctx, schedule, id: None }
    }

    /// Claim the scheduling slot without waiting for the first poll.
    pub(crate) fn claim_now(&mut self) {
        if self.id.is_none() {
            self.id = self.ctx.lock().claim(&self.schedule);
        }
    }

    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => panic!("activity future resolved as {other:?}"),
        }
    }

    pub async fn into_timer(self) {
        match self.await {
            DurableOutput::Timer => {}
            other => panic!("timer future resolved as {other:?}"),
        }
    }

    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            other => panic!("sub-orchestration future resolved as {other:?}"),
        }
    }

    pub async fn into_sub_orchestration_typed<Out: DeserializeOwned>(self) -> Result<Out, String> {
        let raw = self.into_sub_orchestration().await?;
        Json::decode::<Out>(&raw)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.lock();
        let id = match this.id {
            Some(id) => id,
            None => match inner.claim(&this.schedule) {
                Some(id) => {
                    this.id = Some(id);
                    id
                }
                None => return Poll::Pending,
            },
        };
        match inner.try_consume(id) {
            Some(Event::ActivityCompleted { result, .. }) => Poll::Ready(DurableOutput::Activity(Ok(result))),
            Some(Event::ActivityFailed { error, .. }) => Poll::Ready(DurableOutput::Activity(Err(error))),
            Some(Event::TimerFired { .. }) => Poll::Ready(DurableOutput::Timer),
            Some(Event::SubOrchestrationCompleted { result, .. }) => {
                Poll::Ready(DurableOutput::SubOrchestration(Ok(result)))
            }
            Some(Event::SubOrchestrationFailed { error, .. }) => {
                Poll::Ready(DurableOutput::SubOrchestration(Err(error)))
            }
            _ => Poll::Pending,
        }
    }
}

enum Slot<F: Future> {
    Running(Pin<Box<F>>),
    Done(Option<F::Output>),
}

/// Deterministic join over a set of futures. Every unfinished child is
/// polled on each poll in index order, so branches claim history in the
/// same order on every replay. Resolves only after all children resolve.
pub struct JoinAll<F: Future> {
    slots: Vec<Slot<F>>,
}

impl<F: Future> Unpin for JoinAll<F> {}

pub fn join_all<I>(futures: I) -> JoinAll<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    JoinAll {
        slots: futures.into_iter().map(|f| Slot::Running(Box::pin(f))).collect(),
    }
}

impl<F: Future> Future for JoinAll<F> {
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;
        for slot in this.slots.iter_mut() {
            if let Slot::Running(fut) = slot {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(out) => *slot = Slot::Done(Some(out)),
                    Poll::Pending => all_done = false,
                }
            }
        }
        if !all_done {
            return Poll::Pending;
        }
        let outputs = this
            .slots
            .iter_mut()
            .filter_map(|slot| match slot {
                Slot::Done(out) => out.take(),
                Slot::Running(_) => None,
            })
            .collect();
        Poll::Ready(outputs)
    }
}
