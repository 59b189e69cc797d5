//! # Behavior Registry
//!
//! Two-level lookup from operation kind to verb to handler.
//!
//! ```text
//! "insert-text" ─┬─ execute      → Behavior::Execute(..)
//!                ├─ undo         → Behavior::Undo(..)
//!                ├─ cancel       → Behavior::Cancel(..)
//!                ├─ merge        → Behavior::Merge(..)
//!                └─ handle_error → Behavior::HandleError(..)
//! ```
//!
//! Handlers are async closures. A missing handler is a programming error and
//! resolves to `HistoryError::NoBehaviorRegistered`; there is no fallback.

use crate::errors::HistoryError;
use crate::operation::{Operation, OperationRef};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Handler verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Execute,
    Undo,
    Cancel,
    Merge,
    HandleError,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Execute => "execute",
            Verb::Undo => "undo",
            Verb::Cancel => "cancel",
            Verb::Merge => "merge",
            Verb::HandleError => "handle_error",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `execute` / `undo`
pub type ApplyFn = Arc<dyn Fn(OperationRef) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// `cancel(op, running_verb)`; `running_verb` is `None` when the operation never started
pub type CancelFn =
    Arc<dyn Fn(OperationRef, Option<Verb>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// `merge(target, source)`; returns whether `source` was absorbed
pub type MergeFn =
    Arc<dyn Fn(OperationRef, OperationRef) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// `handle_error(op, failed_verb, error)`; must leave the document consistent
pub type RecoverFn = Arc<
    dyn Fn(OperationRef, Verb, Arc<anyhow::Error>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// One registered handler; the variant is the verb it serves
#[derive(Clone)]
pub enum Behavior {
    Execute(ApplyFn),
    Undo(ApplyFn),
    Cancel(CancelFn),
    Merge(MergeFn),
    HandleError(RecoverFn),
}

impl Behavior {
    pub fn verb(&self) -> Verb {
        match self {
            Behavior::Execute(_) => Verb::Execute,
            Behavior::Undo(_) => Verb::Undo,
            Behavior::Cancel(_) => Verb::Cancel,
            Behavior::Merge(_) => Verb::Merge,
            Behavior::HandleError(_) => Verb::HandleError,
        }
    }

    pub fn execute<F, Fut>(f: F) -> Self
    where
        F: Fn(OperationRef) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Behavior::Execute(Arc::new(move |op: OperationRef| f(op).boxed()))
    }

    pub fn undo<F, Fut>(f: F) -> Self
    where
        F: Fn(OperationRef) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Behavior::Undo(Arc::new(move |op: OperationRef| f(op).boxed()))
    }

    pub fn cancel<F, Fut>(f: F) -> Self
    where
        F: Fn(OperationRef, Option<Verb>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Behavior::Cancel(Arc::new(move |op: OperationRef, running: Option<Verb>| {
            f(op, running).boxed()
        }))
    }

    pub fn merge<F, Fut>(f: F) -> Self
    where
        F: Fn(OperationRef, OperationRef) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Behavior::Merge(Arc::new(move |target: OperationRef, source: OperationRef| {
            f(target, source).boxed()
        }))
    }

    pub fn handle_error<F, Fut>(f: F) -> Self
    where
        F: Fn(OperationRef, Verb, Arc<anyhow::Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Behavior::HandleError(Arc::new(
            move |op: OperationRef, verb: Verb, error: Arc<anyhow::Error>| f(op, verb, error).boxed(),
        ))
    }
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Behavior::{}", self.verb())
    }
}

/// All verbs of one operation kind behind a single trait
///
/// Register with [`BehaviorRegistry::register_behavior`].
#[async_trait]
pub trait OperationBehavior: Send + Sync + 'static {
    async fn execute(&self, op: &Operation) -> anyhow::Result<()>;

    async fn undo(&self, op: &Operation) -> anyhow::Result<()>;

    /// Bring the document back to a consistent state after `running` was interrupted
    async fn cancel(&self, op: &Operation, running: Option<Verb>) -> anyhow::Result<()>;

    /// Fold `source` into `target`; the default never merges
    async fn merge(&self, _target: &Operation, _source: &Operation) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn handle_error(&self, op: &Operation, verb: Verb, error: &anyhow::Error) -> anyhow::Result<()>;
}

/// Registry of operation behaviors
#[derive(Clone, Default)]
pub struct BehaviorRegistry {
    behaviors: HashMap<String, HashMap<Verb, Behavior>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns the handler it replaced
    pub fn register(&mut self, kind: impl Into<String>, behavior: Behavior) -> Option<Behavior> {
        let kind = kind.into();
        let verb = behavior.verb();
        tracing::debug!("Registering {} behavior for '{}'", verb, kind);
        self.behaviors.entry(kind).or_default().insert(verb, behavior)
    }

    /// Register every verb of `behavior` under `kind`
    pub fn register_behavior<B: OperationBehavior>(&mut self, kind: impl Into<String>, behavior: Arc<B>) {
        let kind = kind.into();

        let b = behavior.clone();
        self.register(
            kind.clone(),
            Behavior::Execute(Arc::new(move |op: OperationRef| {
                let b = b.clone();
                async move { b.execute(&op).await }.boxed()
            })),
        );

        let b = behavior.clone();
        self.register(
            kind.clone(),
            Behavior::Undo(Arc::new(move |op: OperationRef| {
                let b = b.clone();
                async move { b.undo(&op).await }.boxed()
            })),
        );

        let b = behavior.clone();
        self.register(
            kind.clone(),
            Behavior::Cancel(Arc::new(move |op: OperationRef, running: Option<Verb>| {
                let b = b.clone();
                async move { b.cancel(&op, running).await }.boxed()
            })),
        );

        let b = behavior.clone();
        self.register(
            kind.clone(),
            Behavior::Merge(Arc::new(move |target: OperationRef, source: OperationRef| {
                let b = b.clone();
                async move { b.merge(&target, &source).await }.boxed()
            })),
        );

        let b = behavior;
        self.register(
            kind,
            Behavior::HandleError(Arc::new(
                move |op: OperationRef, verb: Verb, error: Arc<anyhow::Error>| {
                    let b = b.clone();
                    async move { b.handle_error(&op, verb, &error).await }.boxed()
                },
            )),
        );
    }

    /// Look up the handler for `verb` on `kind`
    pub fn resolve(&self, kind: &str, verb: Verb) -> Result<&Behavior, HistoryError> {
        self.behaviors
            .get(kind)
            .and_then(|verbs| verbs.get(&verb))
            .ok_or_else(|| HistoryError::NoBehaviorRegistered {
                kind: kind.to_string(),
                verb,
            })
    }

    pub fn contains(&self, kind: &str, verb: Verb) -> bool {
        self.resolve(kind, verb).is_ok()
    }

    /// Registered operation kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.behaviors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub(crate) fn apply_handler(&self, kind: &str, verb: Verb) -> Result<ApplyFn, HistoryError> {
        match self.resolve(kind, verb)? {
            Behavior::Execute(f) | Behavior::Undo(f) => Ok(f.clone()),
            _ => Err(Self::missing(kind, verb)),
        }
    }

    pub(crate) fn cancel_handler(&self, kind: &str) -> Result<CancelFn, HistoryError> {
        match self.resolve(kind, Verb::Cancel)? {
            Behavior::Cancel(f) => Ok(f.clone()),
            _ => Err(Self::missing(kind, Verb::Cancel)),
        }
    }

    pub(crate) fn merge_handler(&self, kind: &str) -> Result<MergeFn, HistoryError> {
        match self.resolve(kind, Verb::Merge)? {
            Behavior::Merge(f) => Ok(f.clone()),
            _ => Err(Self::missing(kind, Verb::Merge)),
        }
    }

    pub(crate) fn recover_handler(&self, kind: &str) -> Result<RecoverFn, HistoryError> {
        match self.resolve(kind, Verb::HandleError)? {
            Behavior::HandleError(f) => Ok(f.clone()),
            _ => Err(Self::missing(kind, Verb::HandleError)),
        }
    }

    fn missing(kind: &str, verb: Verb) -> HistoryError {
        HistoryError::NoBehaviorRegistered {
            kind: kind.to_string(),
            verb,
        }
    }
}

impl fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in self.kinds() {
            let mut verbs: Vec<&str> = self.behaviors[kind].keys().map(Verb::as_str).collect();
            verbs.sort_unstable();
            map.entry(&kind, &verbs);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        executed: AtomicUsize,
    }

    #[async_trait]
    impl OperationBehavior for Counting {
        async fn execute(&self, _op: &Operation) -> anyhow::Result<()> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn undo(&self, _op: &Operation) -> anyhow::Result<()> {
            Ok(())
        }

        async fn cancel(&self, _op: &Operation, _running: Option<Verb>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn handle_error(&self, _op: &Operation, _verb: Verb, _error: &anyhow::Error) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_missing_verb_fails_loudly() {
        let mut registry = BehaviorRegistry::new();
        registry.register("insert", Behavior::execute(|_op| async { Ok(()) }));

        assert!(registry.contains("insert", Verb::Execute));
        assert!(!registry.contains("insert", Verb::Undo));

        match registry.resolve("insert", Verb::Undo) {
            Err(HistoryError::NoBehaviorRegistered { kind, verb }) => {
                assert_eq!(kind, "insert");
                assert_eq!(verb, Verb::Undo);
            }
            other => panic!("expected NoBehaviorRegistered, got {:?}", other),
        }

        assert!(registry.resolve("unknown", Verb::Execute).is_err());
    }

    #[test]
    fn test_register_replaces_previous_handler() {
        let mut registry = BehaviorRegistry::new();
        assert!(registry
            .register("insert", Behavior::execute(|_op| async { Ok(()) }))
            .is_none());
        let replaced = registry.register("insert", Behavior::execute(|_op| async { Ok(()) }));
        assert_eq!(replaced.map(|b| b.verb()), Some(Verb::Execute));
    }

    #[tokio::test]
    async fn test_register_behavior_covers_every_verb() {
        let behavior = Arc::new(Counting {
            executed: AtomicUsize::new(0),
        });
        let mut registry = BehaviorRegistry::new();
        registry.register_behavior("count", behavior.clone());

        for verb in [Verb::Execute, Verb::Undo, Verb::Cancel, Verb::Merge, Verb::HandleError] {
            assert!(registry.contains("count", verb), "missing {}", verb);
        }
        assert_eq!(registry.kinds(), vec!["count"]);

        let op = Operation::new("count").into_ref();
        let execute = registry.apply_handler("count", Verb::Execute).unwrap();
        execute(op.clone()).await.unwrap();
        assert_eq!(behavior.executed.load(Ordering::SeqCst), 1);

        let merge = registry.merge_handler("count").unwrap();
        let merged = merge(op.clone(), Operation::new("count").into_ref()).await.unwrap();
        assert!(!merged, "default merge never absorbs");
    }

    #[test]
    fn test_verb_display_and_serde() {
        assert_eq!(Verb::HandleError.to_string(), "handle_error");
        let json = serde_json::to_string(&Verb::Cancel).unwrap();
        assert_eq!(json, "\"cancel\"");
    }
}
