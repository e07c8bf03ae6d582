//! A process-local `(kind, name) -> handler` map.
//!
//! Handlers may be synchronous or cooperative (async); both calling conventions are stored
//! behind the same [`Handler`] trait object so the executor doesn't need to know which one
//! it got. A lazily-created default global registry exists for decorator-style ergonomics;
//! tests should prefer [`Registry::new`] for isolation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use forge_core::prelude::*;
use forge_core::model::WorkKind;

/// The result type every handler returns.
pub type HandlerResult = std::result::Result<serde_json::Value, ForgeError>;

/// A registered unit of work. Implement this directly for async handlers; use
/// [`Registry::register_fn`] to register a plain synchronous closure without implementing
/// the trait by hand.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, params: serde_json::Value) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> HandlerResult + Send + Sync,
{
    async fn call(&self, params: serde_json::Value) -> HandlerResult {
        (self.0)(params)
    }
}

type AsyncFnBoxed = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>>
        + Send
        + Sync,
>;

struct AsyncFnHandler(AsyncFnBoxed);

#[async_trait]
impl Handler for AsyncFnHandler {
    async fn call(&self, params: serde_json::Value) -> HandlerResult {
        (self.0)(params).await
    }
}

/// Metadata stored alongside a registered handler, surfaced for operator tooling.
#[derive(Debug, Clone, Default)]
pub struct HandlerMeta {
    pub description: Option<String>,
    pub tags: Vec<String>,
}

struct Entry {
    handler: Arc<dyn Handler>,
    meta: HandlerMeta,
}

/// `(kind, name) -> Handler` map. Reads are lock-free via `dashmap`; writes are expected
/// only at startup / test setup, per the concurrency model's "registry mutated only at
/// registration time" rule.
#[derive(Default)]
pub struct Registry {
    entries: DashMap<(WorkKind, String), Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register an async handler.
    pub fn register(
        &self,
        kind: WorkKind,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        meta: HandlerMeta,
    ) -> Result<()> {
        let name = name.into();
        let key = (kind, name.clone());
        if self.entries.contains_key(&key) {
            return Err(ForgeError::HandlerAlreadyRegistered {
                kind: kind.to_string(),
                name,
            });
        }
        self.entries.insert(key, Entry { handler, meta });
        tracing::debug!(kind = %kind, name = %name, "handler registered");
        Ok(())
    }

    /// Register a plain synchronous closure, e.g. `registry.register_fn(Task, "double", |p| ...)`.
    pub fn register_fn(
        &self,
        kind: WorkKind,
        name: impl Into<String>,
        f: impl Fn(serde_json::Value) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<()> {
        self.register(
            kind,
            name,
            Arc::new(FnHandler(f)),
            HandlerMeta::default(),
        )
    }

    /// Register an async closure.
    pub fn register_async_fn<F, Fut>(
        &self,
        kind: WorkKind,
        name: impl Into<String>,
        f: F,
    ) -> Result<()>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: AsyncFnBoxed = Box::new(move |params| Box::pin(f(params)));
        self.register(
            kind,
            name,
            Arc::new(AsyncFnHandler(boxed)),
            HandlerMeta::default(),
        )
    }

    /// Look up a handler, failing with `UnknownHandlerError` on a miss.
    pub fn get(&self, kind: WorkKind, name: &str) -> Result<Arc<dyn Handler>> {
        self.entries
            .get(&(kind, name.to_string()))
            .map(|e| e.handler.clone())
            .ok_or_else(|| ForgeError::unknown_handler(kind.to_string(), name))
    }

    pub fn meta(&self, kind: WorkKind, name: &str) -> Option<HandlerMeta> {
        self.entries.get(&(kind, name.to_string())).map(|e| e.meta.clone())
    }

    pub fn contains(&self, kind: WorkKind, name: &str) -> bool {
        self.entries.contains_key(&(kind, name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse the `"<kind>:<name>"` / bare-`"<name>"` handler-key convention (§6) and resolve.
    pub fn get_by_handler_key(&self, handler_key: &str) -> Result<Arc<dyn Handler>> {
        let (kind, name) = match handler_key.split_once(':') {
            Some((k, n)) => (k.parse::<WorkKind>()?, n),
            None => (WorkKind::Task, handler_key),
        };
        self.get(kind, name)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.entries.len())
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

/// The lazily-created default global registry, for decorator-style ergonomics. Tests that
/// need isolation should construct their own [`Registry`] and inject it explicitly instead.
pub fn global_registry() -> Arc<Registry> {
    GLOBAL.get_or_init(|| Arc::new(Registry::new())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_call_sync_fn() {
        let reg = Registry::new();
        reg.register_fn(WorkKind::Task, "double", |p| {
            let x = p.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!({ "out": x * 2 }))
        })
        .unwrap();

        let handler = reg.get(WorkKind::Task, "double").unwrap();
        let result = handler.call(serde_json::json!({ "x": 21 })).await.unwrap();
        assert_eq!(result, serde_json::json!({ "out": 42 }));
    }

    #[tokio::test]
    async fn register_and_call_async_fn() {
        let reg = Registry::new();
        reg.register_async_fn(WorkKind::Task, "noop", |_p| async move {
            Ok(serde_json::Value::Null)
        })
        .unwrap();

        let handler = reg.get(WorkKind::Task, "noop").unwrap();
        let result = handler.call(serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::Value::Null);
    }

    #[test]
    fn unknown_handler_is_an_error() {
        let reg = Registry::new();
        let err = reg.get(WorkKind::Task, "missing").unwrap_err();
        assert!(matches!(err, ForgeError::UnknownHandler { .. }));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let reg = Registry::new();
        reg.register_fn(WorkKind::Task, "x", |_| Ok(serde_json::Value::Null))
            .unwrap();
        let err = reg
            .register_fn(WorkKind::Task, "x", |_| Ok(serde_json::Value::Null))
            .unwrap_err();
        assert!(matches!(err, ForgeError::HandlerAlreadyRegistered { .. }));
    }

    #[test]
    fn handler_key_convention_defaults_to_task() {
        let reg = Registry::new();
        reg.register_fn(WorkKind::Task, "bare", |_| Ok(serde_json::Value::Null))
            .unwrap();
        assert!(reg.get_by_handler_key("bare").is_ok());
        assert!(reg.get_by_handler_key("task:bare").is_ok());
        assert!(reg.get_by_handler_key("pipeline:bare").is_err());
    }

    #[test]
    fn global_registry_is_shared() {
        let a = global_registry();
        let b = global_registry();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
