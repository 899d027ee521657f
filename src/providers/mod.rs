//! History stores. A store only persists per-instance, per-execution event
//! logs; scheduling and delivery of work belong to the runtime.
use std::collections::HashSet;

use crate::Event;

/// Storage abstraction for orchestration histories.
///
/// Each instance owns one or more executions (numbered from 1). Reads and
/// appends without an explicit execution target the latest one. Appends are
/// idempotent for completions and terminal events.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full history of the latest execution; empty when the instance is unknown.
    async fn read(&self, instance: &str) -> Vec<Event>;
    /// Append to the latest execution.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;
    async fn list_instances(&self) -> Vec<String>;
    /// Human-readable dump for diagnostics.
    async fn dump_all_pretty(&self) -> String;
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;

    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;
    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        match self.latest_execution_id(instance).await {
            Some(latest) => (1..=latest).collect(),
            None => Vec::new(),
        }
    }
    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;
    async fn append_with_execution(&self, instance: &str, execution_id: u64, new_events: Vec<Event>)
    -> Result<(), String>;

    /// Open a new execution (creating the instance if needed) seeded with
    /// its `OrchestrationStarted` event. Returns the new execution id.
    async fn create_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent: Option<ParentLink>,
    ) -> Result<u64, String>;
}

/// Link from a child orchestration back to the parent slot awaiting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub instance: String,
    pub execution_id: u64,
    pub id: u64,
}

impl ParentLink {
    pub fn from_started(ev: &Event) -> Option<Self> {
        match ev {
            Event::OrchestrationStarted {
                parent_instance: Some(instance),
                parent_execution_id: Some(execution_id),
                parent_id: Some(id),
                ..
            } => Some(Self {
                instance: instance.clone(),
                execution_id: *execution_id,
                id: *id,
            }),
            _ => None,
        }
    }
}

pub(crate) fn started_event(orchestration: &str, input: &str, parent: Option<ParentLink>) -> Event {
    Event::OrchestrationStarted {
        name: orchestration.to_string(),
        input: input.to_string(),
        parent_instance: parent.as_ref().map(|p| p.instance.clone()),
        parent_execution_id: parent.as_ref().map(|p| p.execution_id),
        parent_id: parent.map(|p| p.id),
    }
}

#[derive(Debug, Hash, PartialEq, Eq)]
enum DedupeKey {
    Completion(u64),
    Terminal,
    CancelRequested,
}

fn dedupe_key(ev: &Event) -> Option<DedupeKey> {
    if ev.is_completion() {
        return ev.correlation_id().map(DedupeKey::Completion);
    }
    match ev {
        Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. } => Some(DedupeKey::Terminal),
        Event::OrchestrationCancelRequested { .. } => Some(DedupeKey::CancelRequested),
        _ => None,
    }
}

/// Drop events that would record a second completion for the same id, a
/// second terminal event, or a repeated cancellation request.
pub(crate) fn without_duplicates(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut seen: HashSet<DedupeKey> = existing.iter().filter_map(dedupe_key).collect();
    new_events
        .into_iter()
        .filter(|ev| match dedupe_key(ev) {
            Some(key) => seen.insert(key),
            None => true,
        })
        .collect()
}

pub mod fs;
pub mod in_memory;
