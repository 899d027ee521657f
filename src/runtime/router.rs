use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::providers::HistoryStore;
use crate::runtime::{completions, status};

/// Messages delivered back to an instance driver by workers, timers and
/// child orchestrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
    },
    SubOrchCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    SubOrchFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    CancelRequested {
        instance: String,
        execution_id: u64,
        reason: String,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::SubOrchCompleted { instance, .. }
            | OrchestratorMsg::SubOrchFailed { instance, .. }
            | OrchestratorMsg::CancelRequested { instance, .. } => instance,
        }
    }

    pub fn execution_id(&self) -> u64 {
        match self {
            OrchestratorMsg::ActivityCompleted { execution_id, .. }
            | OrchestratorMsg::ActivityFailed { execution_id, .. }
            | OrchestratorMsg::TimerFired { execution_id, .. }
            | OrchestratorMsg::SubOrchCompleted { execution_id, .. }
            | OrchestratorMsg::SubOrchFailed { execution_id, .. }
            | OrchestratorMsg::CancelRequested { execution_id, .. } => *execution_id,
        }
    }
}

pub fn kind_of(msg: &OrchestratorMsg) -> &'static str {
    match msg {
        OrchestratorMsg::ActivityCompleted { .. } => "ActivityCompleted",
        OrchestratorMsg::ActivityFailed { .. } => "ActivityFailed",
        OrchestratorMsg::TimerFired { .. } => "TimerFired",
        OrchestratorMsg::SubOrchCompleted { .. } => "SubOrchCompleted",
        OrchestratorMsg::SubOrchFailed { .. } => "SubOrchFailed",
        OrchestratorMsg::CancelRequested { .. } => "CancelRequested",
    }
}

/// How a message reached its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the live driver's inbox.
    Sent,
    /// No driver was running; the event was written to stored history and
    /// the instance needs a driver to pick it up.
    Persisted,
    /// Stale or aimed at a finished instance.
    Dropped,
}

/// One unbounded inbox per live instance driver.
#[derive(Default)]
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    pub async fn is_registered(&self, instance: &str) -> bool {
        self.inboxes.lock().await.contains_key(instance)
    }

    /// Send to the live driver, or fall back to writing the completion into
    /// stored history. The inbox map stays locked during the fallback so a
    /// driver registering concurrently either sees the inbox message or the
    /// stored event, never neither.
    pub async fn deliver(&self, msg: OrchestratorMsg, store: &dyn HistoryStore) -> Delivery {
        let mut inboxes = self.inboxes.lock().await;
        let key = msg.instance().to_string();
        let kind = kind_of(&msg);
        let msg = match inboxes.get(&key) {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return Delivery::Sent,
                Err(mpsc::error::SendError(msg)) => msg,
            },
            None => msg,
        };
        // A closed inbox belongs to a driver that already exited
        inboxes.remove(&key);

        let latest = store.latest_execution_id(&key).await;
        if latest != Some(msg.execution_id()) {
            warn!(instance = %key, kind, execution_id = msg.execution_id(), ?latest, "router: stale execution, dropping message");
            return Delivery::Dropped;
        }
        let mut history = store.read(&key).await;
        if status::is_terminal(&history) {
            debug!(instance = %key, kind, "router: instance already terminal, dropping message");
            return Delivery::Dropped;
        }
        let before = history.len();
        if !completions::append_completion(&mut history, msg) {
            return Delivery::Dropped;
        }
        match store.append(&key, history.split_off(before)).await {
            Ok(()) => Delivery::Persisted,
            Err(e) => {
                warn!(instance = %key, kind, error = %e, "router: failed to persist message");
                Delivery::Dropped
            }
        }
    }
}
