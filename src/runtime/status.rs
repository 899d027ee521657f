use crate::Event;
use crate::runtime::{OrchestrationStatus, Runtime};

/// Status of one execution derived purely from its history.
pub fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    for e in history.iter().rev() {
        match e {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { error } => return OrchestrationStatus::Failed { error: error.clone() },
            _ => {}
        }
    }
    OrchestrationStatus::Running
}

pub fn is_terminal(history: &[Event]) -> bool {
    history.iter().any(Event::is_terminal)
}

impl Runtime {
    /// Status of the latest execution of `instance`.
    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        status_from_history(&self.history_store.read(instance).await)
    }

    /// Status of a specific execution.
    pub async fn get_orchestration_status_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> OrchestrationStatus {
        status_from_history(&self.history_store.read_with_execution(instance, execution_id).await)
    }

    /// History of the latest execution, for inspection and projections.
    pub async fn get_execution_history(&self, instance: &str) -> Vec<Event> {
        self.history_store.read(instance).await
    }

    pub async fn list_executions(&self, instance: &str) -> Vec<u64> {
        self.history_store.list_executions(instance).await
    }
}
