use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use super::{OrchestratorMsg, Runtime};
use crate::providers::ParentLink;
use crate::{Action, ActivityFailure, Event};

impl Runtime {
    /// Materialize a turn's actions as background work.
    pub(crate) async fn dispatch_actions(self: &Arc<Self>, instance: &str, execution_id: u64, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::CallActivity {
                    id,
                    name,
                    input,
                    timeout_ms,
                } => dispatch_call_activity(self, instance, execution_id, id, name, input, timeout_ms).await,
                Action::CreateTimer { id, delay_ms } => {
                    dispatch_create_timer(self, instance, execution_id, id, delay_ms).await
                }
                Action::StartSubOrchestration {
                    id,
                    name,
                    instance: child,
                    input,
                } => dispatch_start_sub_orchestration(self, instance, execution_id, id, name, child, input).await,
            }
        }
    }

    /// Run one activity attempt, enforcing the per-call timeout. Panics and
    /// timeouts surface as retryable failures.
    async fn execute_activity(&self, name: &str, input: String, timeout_ms: Option<u64>) -> Result<String, String> {
        let Some(handler) = self.activity_registry.get(name) else {
            return Err(ActivityFailure::non_retryable(format!("unregistered:{name}")).to_wire());
        };
        let attempt = AssertUnwindSafe(handler.invoke(input)).catch_unwind();
        let outcome = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), attempt).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(ActivityFailure::timeout(format!("{name} did not finish within {ms}ms")).to_wire());
                }
            },
            None => attempt.await,
        };
        outcome.unwrap_or_else(|_| Err(ActivityFailure::retryable(format!("{name} panicked")).to_wire()))
    }
}

pub async fn dispatch_call_activity(
    rt: &Arc<Runtime>,
    instance: &str,
    execution_id: u64,
    id: u64,
    name: String,
    input: String,
    timeout_ms: Option<u64>,
) {
    debug!(instance, id, name = %name, "dispatch activity");
    let worker = rt.clone();
    let instance = instance.to_string();
    let handle = tokio::spawn(async move {
        let msg = match worker.execute_activity(&name, input, timeout_ms).await {
            Ok(result) => OrchestratorMsg::ActivityCompleted {
                instance,
                execution_id,
                id,
                result,
            },
            Err(error) => OrchestratorMsg::ActivityFailed {
                instance,
                execution_id,
                id,
                error,
            },
        };
        worker.deliver(msg).await;
    });
    rt.track(handle).await;
}

/// Timers restart with their full delay after a runtime restart.
pub async fn dispatch_create_timer(rt: &Arc<Runtime>, instance: &str, execution_id: u64, id: u64, delay_ms: u64) {
    debug!(instance, id, delay_ms, "dispatch timer");
    let worker = rt.clone();
    let instance = instance.to_string();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        worker
            .deliver(OrchestratorMsg::TimerFired {
                instance,
                execution_id,
                id,
            })
            .await;
    });
    rt.track(handle).await;
}

/// Start (or re-attach to) a child orchestration. Idempotent: a child that
/// already exists is resumed, and one that already finished reports its
/// result to the parent again.
pub async fn dispatch_start_sub_orchestration(
    rt: &Arc<Runtime>,
    parent_instance: &str,
    parent_execution_id: u64,
    id: u64,
    name: String,
    child_instance: String,
    input: String,
) {
    let existing = rt.history_store.read(&child_instance).await;
    if existing.is_empty() {
        if !rt.orchestration_registry.contains(&name) {
            warn!(parent_instance, id, name = %name, "sub-orchestration is not registered");
            rt.deliver(OrchestratorMsg::SubOrchFailed {
                instance: parent_instance.to_string(),
                execution_id: parent_execution_id,
                id,
                error: format!("unregistered:{name}"),
            })
            .await;
            return;
        }
        let parent = ParentLink {
            instance: parent_instance.to_string(),
            execution_id: parent_execution_id,
            id,
        };
        if let Err(e) = rt
            .history_store
            .create_new_execution(&child_instance, &name, &input, Some(parent))
            .await
        {
            warn!(parent_instance, child_instance = %child_instance, error = %e, "failed to create sub-orchestration");
            rt.deliver(OrchestratorMsg::SubOrchFailed {
                instance: parent_instance.to_string(),
                execution_id: parent_execution_id,
                id,
                error: format!("failed to start {name}: {e}"),
            })
            .await;
            return;
        }
        debug!(parent_instance, id, child_instance = %child_instance, name = %name, "started sub-orchestration");
        rt.ensure_instance_active(&child_instance).await;
        return;
    }

    let terminal = existing.iter().find_map(|e| match e {
        Event::OrchestrationCompleted { output } => Some(Ok(output.clone())),
        Event::OrchestrationFailed { error } => Some(Err(error.clone())),
        _ => None,
    });
    match terminal {
        Some(result) => {
            debug!(parent_instance, id, child_instance = %child_instance, "sub-orchestration already finished; replaying result");
            let msg = match result {
                Ok(result) => OrchestratorMsg::SubOrchCompleted {
                    instance: parent_instance.to_string(),
                    execution_id: parent_execution_id,
                    id,
                    result,
                },
                Err(error) => OrchestratorMsg::SubOrchFailed {
                    instance: parent_instance.to_string(),
                    execution_id: parent_execution_id,
                    id,
                    error,
                },
            };
            rt.deliver(msg).await;
        }
        None => {
            // Still running: it reports to the parent's latest execution when it finishes
            rt.ensure_instance_active(&child_instance).await;
        }
    }
}
