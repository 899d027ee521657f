use tracing::warn;

use crate::Event;
use crate::runtime::router::{OrchestratorMsg, kind_of};

/// Append the history event carried by `msg`. Returns false when the
/// message is a duplicate or does not answer anything scheduled in
/// `history`.
pub fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg) -> bool {
    let kind = kind_of(&msg);
    if let OrchestratorMsg::CancelRequested { reason, .. } = msg {
        if history
            .iter()
            .any(|e| matches!(e, Event::OrchestrationCancelRequested { .. }))
        {
            return false;
        }
        history.push(Event::OrchestrationCancelRequested { reason });
        return true;
    }

    let event = match msg {
        OrchestratorMsg::ActivityCompleted { id, result, .. } => Event::ActivityCompleted { id, result },
        OrchestratorMsg::ActivityFailed { id, error, .. } => Event::ActivityFailed { id, error },
        OrchestratorMsg::TimerFired { id, .. } => Event::TimerFired { id },
        OrchestratorMsg::SubOrchCompleted { id, result, .. } => Event::SubOrchestrationCompleted { id, result },
        OrchestratorMsg::SubOrchFailed { id, error, .. } => Event::SubOrchestrationFailed { id, error },
        OrchestratorMsg::CancelRequested { .. } => return false,
    };
    let Some(id) = event.correlation_id() else { return false };

    let scheduled = history.iter().find(|e| e.is_schedule() && e.correlation_id() == Some(id));
    let kind_matches = matches!(
        (scheduled, &event),
        (Some(Event::ActivityScheduled { .. }), Event::ActivityCompleted { .. } | Event::ActivityFailed { .. })
            | (Some(Event::TimerCreated { .. }), Event::TimerFired { .. })
            | (
                Some(Event::SubOrchestrationScheduled { .. }),
                Event::SubOrchestrationCompleted { .. } | Event::SubOrchestrationFailed { .. }
            )
    );
    if !kind_matches {
        warn!(id, kind, "completion does not match any scheduled operation; ignoring");
        return false;
    }
    if history.iter().any(|e| e.is_completion() && e.correlation_id() == Some(id)) {
        return false;
    }
    history.push(event);
    true
}

/// Reason of a cancellation recorded in history, if any.
pub fn cancel_requested(history: &[Event]) -> Option<String> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationCancelRequested { reason } => Some(reason.clone()),
        _ => None,
    })
}
