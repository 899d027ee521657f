use crate::_typed_codec::{Codec, Json};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, ParentLink};
use crate::{Event, OrchestrationContext};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;

pub use registry::{ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use router::{Delivery, InstanceRouter, OrchestratorMsg};

use replay::{InlineReplay, ReplayEngine};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for orchestration")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// What to do when a start names an instance id that already has history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdReusePolicy {
    /// Re-run only after a failed execution.
    #[default]
    AllowDuplicateFailedOnly,
    /// Cancel a running execution and start over; closed executions may be re-run.
    TerminateIfRunning,
    /// Never reuse the id.
    RejectDuplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("orchestration {0} is already running")]
    AlreadyRunning(String),
    #[error("orchestration {0} already completed")]
    AlreadyCompleted(String),
    #[error("orchestration id {0} already used")]
    Exists(String),
    #[error("unregistered orchestration: {0}")]
    Unregistered(String),
    #[error("timed out terminating previous run of {0}")]
    TerminateTimeout(String),
    #[error("history store error: {0}")]
    Store(String),
    #[error("encode input: {0}")]
    Encode(String),
}

/// Tunables for the in-process runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Completions folded into history before the next turn is replayed.
    pub completion_batch_limit: usize,
    /// How long a `TerminateIfRunning` start waits for the old run to stop.
    pub terminate_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            completion_batch_limit: 128,
            terminate_timeout: Duration::from_secs(30),
        }
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// In-process runtime: one driver task per live instance, activities and
/// timers on the tokio pool, history persisted via a `HistoryStore`.
pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    active_instances: Mutex<HashSet<String>>,
    start_lock: Mutex<()>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: Arc<ActivityRegistry>,
    replay_engine: Arc<dyn ReplayEngine>,
    options: RuntimeOptions,
}

fn started_info(history: &[Event]) -> Option<(String, String, Option<ParentLink>)> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationStarted { name, input, .. } => Some((name.clone(), input.clone(), ParentLink::from_started(e))),
        _ => None,
    })
}

impl Runtime {
    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(history_store, activity_registry, orchestration_registry, RuntimeOptions::default())
            .await
    }

    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        crate::logging::init_tracing();
        debug!(
            orchestrations = ?orchestration_registry.list_orchestration_names(),
            "runtime starting"
        );
        Arc::new(Self {
            router: Arc::new(InstanceRouter::default()),
            joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: Mutex::new(HashSet::new()),
            start_lock: Mutex::new(()),
            orchestration_registry,
            activity_registry,
            replay_engine: Arc::new(InlineReplay),
            options,
        })
    }

    /// Start an orchestration under the default reuse policy. Returns the
    /// execution id of the new run.
    pub async fn start_orchestration(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<u64, StartError> {
        self.start_orchestration_with_policy(instance, orchestration_name, input, IdReusePolicy::default())
            .await
    }

    /// Start a typed orchestration; the input is serialized internally.
    pub async fn start_orchestration_typed<In: Serialize + ?Sized>(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: &In,
        policy: IdReusePolicy,
    ) -> Result<u64, StartError> {
        let payload = Json::encode(input).map_err(StartError::Encode)?;
        self.start_orchestration_with_policy(instance, orchestration_name, payload, policy)
            .await
    }

    pub async fn start_orchestration_with_policy(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
        policy: IdReusePolicy,
    ) -> Result<u64, StartError> {
        let input = input.into();
        if !self.orchestration_registry.contains(orchestration_name) {
            return Err(StartError::Unregistered(orchestration_name.to_string()));
        }
        let _serial = self.start_lock.lock().await;
        match self.get_orchestration_status(instance).await {
            OrchestrationStatus::NotFound => {}
            OrchestrationStatus::Running => match policy {
                IdReusePolicy::TerminateIfRunning => {
                    info!(instance, "terminating running execution before restart");
                    self.cancel_instance(instance, "terminated: superseded by a new run").await;
                    if self
                        .wait_for_orchestration(instance, self.options.terminate_timeout)
                        .await
                        .is_err()
                    {
                        return Err(StartError::TerminateTimeout(instance.to_string()));
                    }
                }
                _ => return Err(StartError::AlreadyRunning(instance.to_string())),
            },
            OrchestrationStatus::Completed { .. } => match policy {
                IdReusePolicy::TerminateIfRunning => {}
                IdReusePolicy::AllowDuplicateFailedOnly => {
                    return Err(StartError::AlreadyCompleted(instance.to_string()));
                }
                IdReusePolicy::RejectDuplicate => return Err(StartError::Exists(instance.to_string())),
            },
            OrchestrationStatus::Failed { .. } => {
                if policy == IdReusePolicy::RejectDuplicate {
                    return Err(StartError::Exists(instance.to_string()));
                }
            }
        }
        // The previous driver may still be unwinding after writing its terminal event
        if !self.wait_until_idle(instance, self.options.terminate_timeout).await {
            return Err(StartError::TerminateTimeout(instance.to_string()));
        }
        let execution_id = self
            .history_store
            .create_new_execution(instance, orchestration_name, &input, None)
            .await
            .map_err(StartError::Store)?;
        info!(instance, orchestration = orchestration_name, execution_id, "orchestration started");
        self.ensure_instance_active(instance).await;
        Ok(execution_id)
    }

    async fn wait_until_idle(&self, instance: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_instances.lock().await.contains(instance) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Spawn a driver for `instance` unless one is already running.
    async fn ensure_instance_active(self: &Arc<Self>, instance: &str) -> bool {
        {
            let mut active = self.active_instances.lock().await;
            if !active.insert(instance.to_string()) {
                return false;
            }
        }
        let handle = self.spawn_instance(instance);
        self.track(handle).await;
        true
    }

    fn spawn_instance(self: &Arc<Self>, instance: &str) -> JoinHandle<()> {
        let rt = self.clone();
        let inst = instance.to_string();
        tokio::spawn(async move {
            rt.clone().run_instance(inst.clone()).await;
            rt.active_instances.lock().await.remove(&inst);
            rt.router.unregister(&inst).await;
        })
    }

    async fn track(&self, handle: JoinHandle<()>) {
        let mut joins = self.joins.lock().await;
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
    }

    /// Drive one instance's latest execution until it reaches a terminal state.
    async fn run_instance(self: Arc<Self>, instance: String) {
        // Register before reading so fallback deliveries are never missed
        let mut inbox = self.router.register(&instance).await;
        let Some(execution_id) = self.history_store.latest_execution_id(&instance).await else {
            error!(instance = %instance, "no execution to drive");
            return;
        };
        let mut history = self.history_store.read_with_execution(&instance, execution_id).await;
        let Some((name, input, parent)) = started_info(&history) else {
            error!(instance = %instance, "no OrchestrationStarted in history; cannot drive");
            return;
        };
        if status::is_terminal(&history) {
            return;
        }
        let Some(handler) = self.orchestration_registry.get(&name) else {
            let err = format!("unregistered:{name}");
            self.finish(&instance, execution_id, &mut history, Err(err), parent).await;
            return;
        };
        if let Some(reason) = completions::cancel_requested(&history) {
            let err = format!("canceled: {reason}");
            self.finish(&instance, execution_id, &mut history, Err(err), parent).await;
            return;
        }

        // Work scheduled before a restart has no live task behind it
        let outstanding = crate::pending_actions(&history);
        if !outstanding.is_empty() {
            debug!(instance = %instance, count = outstanding.len(), "re-dispatching outstanding work");
            self.dispatch_actions(&instance, execution_id, outstanding).await;
        }

        let mut turn_index: u64 = 0;
        // Which stored completions a previous driver acted on is unknown
        let mut seen_len = crate::replay_frontier(&history);
        loop {
            let turn = self.replay_engine.replay(
                &instance,
                history.clone(),
                seen_len,
                turn_index,
                handler.clone(),
                input.clone(),
            );
            let (hist_after, actions, output) = match turn {
                Ok(t) => t,
                Err(nondeterminism) => {
                    error!(instance = %instance, error = %nondeterminism, "replay diverged from history");
                    self.finish(&instance, execution_id, &mut history, Err(nondeterminism), parent)
                        .await;
                    return;
                }
            };
            let persisted = history.len();
            history = hist_after;
            seen_len = history.len();
            if history.len() > persisted {
                let delta = history[persisted..].to_vec();
                if let Err(e) = self
                    .history_store
                    .append_with_execution(&instance, execution_id, delta)
                    .await
                {
                    error!(instance = %instance, error = %e, "failed to persist turn; stopping driver");
                    return;
                }
            }
            if let Some(output) = output {
                self.finish(&instance, execution_id, &mut history, output, parent).await;
                return;
            }
            self.dispatch_actions(&instance, execution_id, actions).await;

            let before = history.len();
            while history.len() == before {
                let Some(first) = inbox.recv().await else { return };
                self.absorb(&instance, execution_id, &mut history, first);
                for _ in 1..self.options.completion_batch_limit {
                    match inbox.try_recv() {
                        Ok(msg) => self.absorb(&instance, execution_id, &mut history, msg),
                        Err(_) => break,
                    }
                }
            }
            let delta = history[before..].to_vec();
            let cancel = delta.iter().find_map(|e| match e {
                Event::OrchestrationCancelRequested { reason } => Some(reason.clone()),
                _ => None,
            });
            if let Err(e) = self
                .history_store
                .append_with_execution(&instance, execution_id, delta)
                .await
            {
                error!(instance = %instance, error = %e, "failed to persist completions; stopping driver");
                return;
            }
            if let Some(reason) = cancel {
                info!(instance = %instance, reason = %reason, "cancellation requested");
                let err = format!("canceled: {reason}");
                self.finish(&instance, execution_id, &mut history, Err(err), parent).await;
                return;
            }
            turn_index += 1;
        }
    }

    fn absorb(&self, instance: &str, execution_id: u64, history: &mut Vec<Event>, msg: OrchestratorMsg) {
        if msg.execution_id() != execution_id {
            warn!(
                instance,
                kind = router::kind_of(&msg),
                execution_id = msg.execution_id(),
                current_execution_id = execution_id,
                "ignoring message for another execution"
            );
            return;
        }
        completions::append_completion(history, msg);
    }

    /// Record the terminal event and report the outcome to a waiting parent.
    async fn finish(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        history: &mut Vec<Event>,
        result: Result<String, String>,
        parent: Option<ParentLink>,
    ) {
        let terminal = match &result {
            Ok(output) => Event::OrchestrationCompleted { output: output.clone() },
            Err(error) => Event::OrchestrationFailed { error: error.clone() },
        };
        if let Err(e) = self
            .history_store
            .append_with_execution(instance, execution_id, vec![terminal.clone()])
            .await
        {
            error!(instance, error = %e, "failed to persist terminal event");
            return;
        }
        history.push(terminal);
        match &result {
            Ok(_) => info!(instance, execution_id, "orchestration completed"),
            Err(error) => warn!(instance, execution_id, error = %error, "orchestration failed"),
        }
        if let Some(parent) = parent {
            let parent = self.parent_target(instance, parent).await;
            let msg = match result {
                Ok(result) => OrchestratorMsg::SubOrchCompleted {
                    instance: parent.instance,
                    execution_id: parent.execution_id,
                    id: parent.id,
                    result,
                },
                Err(error) => OrchestratorMsg::SubOrchFailed {
                    instance: parent.instance,
                    execution_id: parent.execution_id,
                    id: parent.id,
                    error,
                },
            };
            self.deliver(msg).await;
        }
    }

    /// The parent slot a finished child reports to. A parent started again
    /// under the same id re-attaches to its running children from the newer
    /// execution, which supersedes the link recorded when the child started.
    async fn parent_target(&self, child: &str, link: ParentLink) -> ParentLink {
        let Some(latest) = self.history_store.latest_execution_id(&link.instance).await else {
            return link;
        };
        if latest <= link.execution_id {
            return link;
        }
        let history = self.history_store.read_with_execution(&link.instance, latest).await;
        let reattached = history.iter().find_map(|e| match e {
            Event::SubOrchestrationScheduled { id, instance, .. } if instance == child => Some(*id),
            _ => None,
        });
        match reattached {
            Some(id) => {
                debug!(child, parent = %link.instance, execution_id = latest, id, "reporting to re-attached parent");
                ParentLink {
                    instance: link.instance,
                    execution_id: latest,
                    id,
                }
            }
            None => link,
        }
    }

    /// Route a message to its instance, waking a driver when the message had
    /// to be written straight to stored history.
    pub(crate) async fn deliver(self: &Arc<Self>, msg: OrchestratorMsg) {
        let target = msg.instance().to_string();
        if self.router.deliver(msg, self.history_store.as_ref()).await == Delivery::Persisted {
            self.ensure_instance_active(&target).await;
        }
    }

    /// Request cancellation of the latest execution. The run fails with
    /// `canceled: <reason>` at its next turn; children keep running.
    pub async fn cancel_instance(self: &Arc<Self>, instance: &str, reason: impl Into<String>) {
        let Some(execution_id) = self.history_store.latest_execution_id(instance).await else {
            warn!(instance, "cancel_instance: unknown instance");
            return;
        };
        self.deliver(OrchestratorMsg::CancelRequested {
            instance: instance.to_string(),
            execution_id,
            reason: reason.into(),
        })
        .await;
    }

    /// Spawn drivers for every stored, non-terminal instance. Returns how
    /// many were resumed.
    pub async fn resume_all(self: &Arc<Self>) -> usize {
        let mut resumed = 0;
        for instance in self.history_store.list_instances().await {
            let history = self.history_store.read(&instance).await;
            if history.is_empty() || status::is_terminal(&history) {
                continue;
            }
            if self.ensure_instance_active(&instance).await {
                resumed += 1;
            }
        }
        info!(resumed, "resumed stored instances");
        resumed
    }

    /// Abort background tasks. In-flight work is picked up again by
    /// `resume_all` on the next runtime over the same store.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    /// Wait until the orchestration reaches a terminal state (Completed/Failed) or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        // poll with backoff
        let mut delay_ms: u64 = 5;
        loop {
            match self.get_orchestration_status(instance).await {
                OrchestrationStatus::Completed { output } => return Ok(OrchestrationStatus::Completed { output }),
                OrchestrationStatus::Failed { error } => return Ok(OrchestrationStatus::Failed { error }),
                _ => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(WaitError::Timeout);
                    }
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms.saturating_mul(2)).min(100);
                }
            }
        }
    }

    /// Typed variant: returns Ok(Ok<T>) on Completed with decoded output, Ok(Err(String)) on Failed.
    pub async fn wait_for_orchestration_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => match Json::decode::<Out>(&output) {
                Ok(v) => Ok(Ok(v)),
                Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
            },
            OrchestrationStatus::Failed { error } => Ok(Err(error)),
            other => Err(WaitError::Other(format!("unexpected status {other:?}"))),
        }
    }
}
