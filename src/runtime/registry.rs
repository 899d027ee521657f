//! Name -> handler tables for orchestrations and activities.
use super::{FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::{ActivityFailure, OrchestrationContext};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Frozen table shared by both registries. Cloning is cheap.
struct HandlerTable<H: ?Sized>(Arc<HashMap<String, Arc<H>>>);

impl<H: ?Sized> Clone for HandlerTable<H> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<H: ?Sized> Default for HandlerTable<H> {
    fn default() -> Self {
        Self(Arc::new(HashMap::new()))
    }
}

impl<H: ?Sized> HandlerTable<H> {
    fn get(&self, name: &str) -> Option<Arc<H>> {
        self.0.get(name).cloned()
    }

    fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Table under construction. A name registered twice keeps its first
/// handler; the clash is logged when the table is frozen.
struct TableBuilder<H: ?Sized> {
    kind: &'static str,
    handlers: HashMap<String, Arc<H>>,
    clashes: Vec<String>,
}

impl<H: ?Sized> TableBuilder<H> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handlers: HashMap::new(),
            clashes: Vec::new(),
        }
    }

    fn insert(&mut self, name: String, handler: Arc<H>) {
        if self.handlers.contains_key(&name) {
            self.clashes.push(name);
        } else {
            self.handlers.insert(name, handler);
        }
    }

    fn freeze(self) -> HandlerTable<H> {
        for name in &self.clashes {
            tracing::warn!(kind = self.kind, name = %name, "duplicate registration ignored");
        }
        HandlerTable(Arc::new(self.handlers))
    }
}

// ---------------- Orchestrations

#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    table: HandlerTable<dyn OrchestrationHandler>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            table: TableBuilder::new("orchestration"),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.table.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains(name)
    }

    /// Registered names, sorted.
    pub fn list_orchestration_names(&self) -> Vec<String> {
        self.table.names()
    }
}

pub struct OrchestrationRegistryBuilder {
    table: TableBuilder<dyn OrchestrationHandler>,
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.table.insert(name.into(), Arc::new(FnOrchestration(f)));
        self
    }

    /// Register an orchestration whose input and output travel as JSON.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register(name, move |ctx: OrchestrationContext, raw: String| {
            let body = f.clone();
            async move {
                let input = Json::decode::<In>(&raw)?;
                Json::encode(&body(ctx, input).await?)
            }
        })
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            table: self.table.freeze(),
        }
    }
}

// ---------------- Activities

/// One activity implementation. Errors are in `ActivityFailure` wire form.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    table: HandlerTable<dyn ActivityHandler>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder {
            table: TableBuilder::new("activity"),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.table.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains(name)
    }
}

pub struct ActivityRegistryBuilder {
    table: TableBuilder<dyn ActivityHandler>,
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.table.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    /// Register a handler with JSON-coded input and output. A payload that
    /// fails to decode is reported as a non-retryable failure.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let name = name.into();
        let label: Arc<str> = Arc::from(name.as_str());
        let body = Arc::new(f);
        self.register(name, move |raw: String| {
            let body = body.clone();
            let label = label.clone();
            async move {
                let input = Json::decode::<In>(&raw)
                    .map_err(|e| ActivityFailure::non_retryable(format!("decode {label} input: {e}")).to_wire())?;
                Json::encode(&body(input).await?)
            }
        })
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            table: self.table.freeze(),
        }
    }
}
