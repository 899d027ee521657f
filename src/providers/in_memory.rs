use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{HistoryStore, ParentLink, started_event, without_duplicates};
use crate::Event;

/// Volatile store used by tests and the demo worker.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    // instance -> executions (execution_id starts at 1)
    inner: Mutex<HashMap<String, Vec<Vec<Event>>>>,
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let g = self.inner.lock().await;
        match g.get(instance) {
            Some(execs) => execs.last().cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let latest = self
            .latest_execution_id(instance)
            .await
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        self.append_with_execution(instance, latest, new_events).await
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        out.sort();
        out
    }

    async fn dump_all_pretty(&self) -> String {
        let g = self.inner.lock().await;
        let mut out = String::new();
        for (inst, execs) in g.iter() {
            out.push_str(&format!("instance={inst}\n"));
            for (idx, events) in execs.iter().enumerate() {
                for e in events {
                    out.push_str(&format!("  exec#{} {e:#?}\n", idx + 1));
                }
            }
        }
        out
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let mut g = self.inner.lock().await;
        if g.remove(instance).is_none() {
            return Err(format!("instance not found: {instance}"));
        }
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let g = self.inner.lock().await;
        g.get(instance).and_then(|execs| u64::try_from(execs.len()).ok()).filter(|n| *n > 0)
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let g = self.inner.lock().await;
        g.get(instance)
            .and_then(|execs| execs.get(usize::try_from(execution_id).ok()?.checked_sub(1)?))
            .cloned()
            .unwrap_or_default()
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String> {
        let mut g = self.inner.lock().await;
        let events = g
            .get_mut(instance)
            .and_then(|execs| execs.get_mut(usize::try_from(execution_id).ok()?.checked_sub(1)?))
            .ok_or_else(|| format!("execution not found: {instance}#{execution_id}"))?;
        let fresh = without_duplicates(events, new_events);
        events.extend(fresh);
        Ok(())
    }

    async fn create_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent: Option<ParentLink>,
    ) -> Result<u64, String> {
        let mut g = self.inner.lock().await;
        let execs = g.entry(instance.to_string()).or_default();
        execs.push(vec![started_event(orchestration, input, parent)]);
        u64::try_from(execs.len()).map_err(|e| e.to_string())
    }
}
