//! # Operation Executor
//!
//! Drives one operation at a time through execute / undo / redo against the
//! behavior registry.
//!
//! ## Failure handling
//!
//! When a handler fails the executor calls the operation's `handle_error`
//! verb. If recovery succeeds the original failure is still returned (typed
//! by the verb that failed) and history is left alone. If recovery fails, or
//! no recovery handler exists, history and the undo stack are discarded
//! because the document can no longer be trusted to match them.
//!
//! `NoBehaviorRegistered` skips recovery entirely.

use crate::errors::HistoryError;
use crate::operation::{OperationId, OperationRef};
use crate::registry::{BehaviorRegistry, Verb};
use crate::ring_buffer::RingBuffer;
use serde::Serialize;
use std::sync::Arc;

/// Where executed operations are recorded
pub trait OperationLog: Send {
    /// Append as newest; returns an evicted element for bounded logs
    fn push(&mut self, op: OperationRef) -> Option<OperationRef>;

    /// Remove the newest
    fn pop(&mut self) -> Option<OperationRef>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);

    /// Snapshot, oldest first
    fn operations(&self) -> Vec<OperationRef>;
}

impl OperationLog for Vec<OperationRef> {
    fn push(&mut self, op: OperationRef) -> Option<OperationRef> {
        Vec::push(self, op);
        None
    }

    fn pop(&mut self) -> Option<OperationRef> {
        Vec::pop(self)
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn clear(&mut self) {
        Vec::clear(self)
    }

    fn operations(&self) -> Vec<OperationRef> {
        self.clone()
    }
}

impl OperationLog for RingBuffer<OperationRef> {
    fn push(&mut self, op: OperationRef) -> Option<OperationRef> {
        RingBuffer::push(self, op)
    }

    fn pop(&mut self) -> Option<OperationRef> {
        RingBuffer::pop(self)
    }

    fn len(&self) -> usize {
        RingBuffer::len(self)
    }

    fn clear(&mut self) {
        RingBuffer::clear(self)
    }

    fn operations(&self) -> Vec<OperationRef> {
        self.to_vec()
    }
}

/// What the executor is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    Idle,
    Executing,
    Undoing,
    Redoing,
}

/// One handler invocation, named by why it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Execute,
    Undo,
    Redo,
    /// Carries the verb that was interrupted, `None` if the operation never started
    Cancel(Option<Verb>),
}

impl Step {
    fn failure(self) -> Failure {
        match self {
            Step::Execute => Failure::Execute,
            Step::Undo => Failure::Undo,
            Step::Redo => Failure::Redo,
            Step::Cancel(_) => Failure::Cancel,
        }
    }
}

/// Which handler failed, and so which error reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Execute,
    Undo,
    Redo,
    Merge,
    Cancel,
}

impl Failure {
    fn verb(self) -> Verb {
        match self {
            Failure::Execute | Failure::Redo => Verb::Execute,
            Failure::Undo => Verb::Undo,
            Failure::Merge => Verb::Merge,
            Failure::Cancel => Verb::Cancel,
        }
    }

    fn error(self, op: OperationId, error: Arc<anyhow::Error>) -> HistoryError {
        match self {
            Failure::Execute => HistoryError::ExecutionFailed { op, error },
            Failure::Undo => HistoryError::UndoFailed { op, error },
            Failure::Redo => HistoryError::RedoFailed { op, error },
            Failure::Merge => HistoryError::MergeFailed { op, error },
            Failure::Cancel => HistoryError::CancelFailed { op, error },
        }
    }
}

/// Resolve and invoke the handler for `step`, running error recovery on failure
pub(crate) async fn drive(registry: &BehaviorRegistry, op: &OperationRef, step: Step) -> Result<(), HistoryError> {
    let outcome = match step {
        Step::Execute | Step::Redo => {
            let handler = registry.apply_handler(op.kind(), Verb::Execute)?;
            handler(op.clone()).await
        }
        Step::Undo => {
            let handler = registry.apply_handler(op.kind(), Verb::Undo)?;
            handler(op.clone()).await
        }
        Step::Cancel(running) => {
            let handler = registry.cancel_handler(op.kind())?;
            handler(op.clone(), running).await
        }
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(error) => Err(recover(registry, op, step.failure(), Arc::new(error)).await),
    }
}

/// Ask `source`'s behavior to fold `source` into `target`
pub(crate) async fn merge(
    registry: &BehaviorRegistry,
    target: &OperationRef,
    source: &OperationRef,
) -> Result<bool, HistoryError> {
    let handler = registry.merge_handler(source.kind())?;
    match handler(target.clone(), source.clone()).await {
        Ok(merged) => Ok(merged),
        Err(error) => Err(recover(registry, source, Failure::Merge, Arc::new(error)).await),
    }
}

async fn recover(
    registry: &BehaviorRegistry,
    op: &OperationRef,
    failure: Failure,
    error: Arc<anyhow::Error>,
) -> HistoryError {
    let verb = failure.verb();
    tracing::warn!(
        op = %op.id(),
        kind = op.kind(),
        "{} handler failed: {:#}; running error recovery",
        verb,
        error
    );

    let recovery = match registry.recover_handler(op.kind()) {
        Ok(handler) => handler(op.clone(), verb, error.clone()).await.map_err(Arc::new),
        Err(missing) => Err(Arc::new(anyhow::Error::new(missing))),
    };

    match recovery {
        Ok(()) => failure.error(op.id(), error),
        Err(recovery) => {
            tracing::error!(
                op = %op.id(),
                kind = op.kind(),
                "Error recovery failed after {} error: {:#}",
                verb,
                recovery
            );
            HistoryError::RecoveryFailed {
                op: op.id(),
                verb,
                error,
                recovery,
            }
        }
    }
}

/// Executes operations one at a time and keeps their history
///
/// Every verb takes `&mut self`, so a second call cannot start before the
/// first one returns. Callers that share an executor wrap it in an async
/// mutex and wait for it to become idle.
pub struct Executor<L: OperationLog = RingBuffer<OperationRef>> {
    registry: Arc<BehaviorRegistry>,
    history: L,
    undo_stack: Vec<OperationRef>,
    state: ExecutorState,
}

impl Executor<RingBuffer<OperationRef>> {
    /// Executor with a bounded history (oldest entries are forgotten)
    pub fn new(registry: Arc<BehaviorRegistry>, capacity: usize) -> Self {
        Self::with_log(registry, RingBuffer::new(capacity))
    }
}

impl<L: OperationLog> Executor<L> {
    pub fn with_log(registry: Arc<BehaviorRegistry>, history: L) -> Self {
        Self {
            registry,
            history,
            undo_stack: Vec::new(),
            state: ExecutorState::Idle,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn registry(&self) -> &Arc<BehaviorRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &L {
        &self.history
    }

    pub(crate) fn history_mut(&mut self) -> &mut L {
        &mut self.history
    }

    /// Undone operations, most recent last
    pub fn undo_stack(&self) -> &[OperationRef] {
        &self.undo_stack
    }

    pub fn can_undo(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn undo_levels(&self) -> usize {
        self.history.len()
    }

    pub fn redo_levels(&self) -> usize {
        self.undo_stack.len()
    }

    /// Execute a new operation and record it
    pub async fn execute(&mut self, op: OperationRef) -> Result<(), HistoryError> {
        self.begin(ExecutorState::Executing);

        let result = drive(&self.registry, &op, Step::Execute).await;
        match &result {
            Ok(()) => {
                if let Some(evicted) = self.history.push(op) {
                    tracing::debug!("History full, forgetting {}", evicted.id());
                }
                self.undo_stack.clear();
            }
            Err(err) => self.after_failure(err),
        }

        self.state = ExecutorState::Idle;
        result
    }

    /// Undo the newest operation; `Ok(false)` when there is nothing to undo
    pub async fn undo(&mut self) -> Result<bool, HistoryError> {
        let Some(op) = self.history.pop() else {
            return Ok(false);
        };

        self.begin(ExecutorState::Undoing);
        self.undo_stack.push(op.clone());

        let result = drive(&self.registry, &op, Step::Undo).await;
        if let Err(err) = &result {
            // As if the undo never started
            self.undo_stack.pop();
            if let Some(evicted) = self.history.push(op) {
                tracing::debug!("History full, forgetting {}", evicted.id());
            }
            self.after_failure(err);
        }

        self.state = ExecutorState::Idle;
        result.map(|()| true)
    }

    /// Redo the most recently undone operation; `Ok(false)` when there is nothing to redo
    pub async fn redo(&mut self) -> Result<bool, HistoryError> {
        let Some(op) = self.undo_stack.pop() else {
            return Ok(false);
        };

        self.begin(ExecutorState::Redoing);

        let result = drive(&self.registry, &op, Step::Redo).await;
        match &result {
            Ok(()) => {
                if let Some(evicted) = self.history.push(op) {
                    tracing::debug!("History full, forgetting {}", evicted.id());
                }
            }
            Err(err) => {
                self.undo_stack.push(op);
                self.after_failure(err);
            }
        }

        self.state = ExecutorState::Idle;
        result.map(|()| true)
    }

    /// Forget all history
    pub fn clear(&mut self) {
        self.history.clear();
        self.undo_stack.clear();
    }

    fn begin(&mut self, next: ExecutorState) {
        if self.state != ExecutorState::Idle {
            tracing::warn!("Previous {:?} call was abandoned before it finished", self.state);
        }
        self.state = next;
    }

    fn after_failure(&mut self, err: &HistoryError) {
        if err.invalidates_history() {
            tracing::error!(
                "Discarding {} history and {} redo entries: {}",
                self.history.len(),
                self.undo_stack.len(),
                err
            );
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::registry::Behavior;
    use parking_lot::Mutex;

    /// Registry whose "push" kind appends the operation id to a shared log
    fn logging_registry(log: Arc<Mutex<Vec<String>>>) -> BehaviorRegistry {
        let mut registry = BehaviorRegistry::new();

        let l = log.clone();
        registry.register(
            "push",
            Behavior::execute(move |op: OperationRef| {
                let l = l.clone();
                async move {
                    l.lock().push(format!("exec {}", op.id().0));
                    Ok(())
                }
            }),
        );

        let l = log.clone();
        registry.register(
            "push",
            Behavior::undo(move |op: OperationRef| {
                let l = l.clone();
                async move {
                    l.lock().push(format!("undo {}", op.id().0));
                    Ok(())
                }
            }),
        );

        registry.register("push", Behavior::handle_error(|_op, _verb, _err| async { Ok(()) }));
        registry
    }

    #[tokio::test]
    async fn test_execute_undo_redo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut executor = Executor::new(Arc::new(logging_registry(log.clone())), 10);

        let a = Operation::new("push").into_ref();
        executor.execute(a.clone()).await.unwrap();
        assert_eq!(executor.undo_levels(), 1);
        assert_eq!(executor.state(), ExecutorState::Idle);

        assert!(executor.undo().await.unwrap());
        assert_eq!(executor.undo_levels(), 0);
        assert_eq!(executor.redo_levels(), 1);

        assert!(executor.redo().await.unwrap());
        assert_eq!(executor.undo_levels(), 1);
        assert_eq!(executor.redo_levels(), 0);

        let id = a.id().0;
        assert_eq!(
            *log.lock(),
            vec![format!("exec {}", id), format!("undo {}", id), format!("exec {}", id)]
        );

        // Nothing left to redo
        assert!(!executor.redo().await.unwrap());
    }

    #[tokio::test]
    async fn test_new_execute_clears_redo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut executor = Executor::new(Arc::new(logging_registry(log)), 10);

        executor.execute(Operation::new("push").into_ref()).await.unwrap();
        executor.undo().await.unwrap();
        assert!(executor.can_redo());

        executor.execute(Operation::new("push").into_ref()).await.unwrap();
        assert!(!executor.can_redo());
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_without_recording() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut executor = Executor::new(Arc::new(logging_registry(log)), 10);

        let err = executor
            .execute(Operation::new("missing").into_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::NoBehaviorRegistered { .. }));
        assert_eq!(executor.undo_levels(), 0);
    }

    #[tokio::test]
    async fn test_failed_undo_restores_history() {
        let mut registry = BehaviorRegistry::new();
        registry.register("flaky", Behavior::execute(|_op| async { Ok(()) }));
        registry.register(
            "flaky",
            Behavior::undo(|_op| async { Err(anyhow::anyhow!("cannot undo")) }),
        );
        registry.register("flaky", Behavior::handle_error(|_op, _verb, _err| async { Ok(()) }));

        let mut executor = Executor::new(Arc::new(registry), 10);
        let op = Operation::new("flaky").into_ref();
        executor.execute(op.clone()).await.unwrap();

        let err = executor.undo().await.unwrap_err();
        assert!(matches!(err, HistoryError::UndoFailed { .. }));
        assert_eq!(executor.undo_levels(), 1);
        assert_eq!(executor.redo_levels(), 0);
        assert_eq!(executor.history().last(), Some(&op));
    }

    #[tokio::test]
    async fn test_failed_recovery_discards_history() {
        let mut registry = BehaviorRegistry::new();
        registry.register("ok", Behavior::execute(|_op| async { Ok(()) }));
        registry.register("ok", Behavior::undo(|_op| async { Ok(()) }));
        registry.register(
            "broken",
            Behavior::execute(|_op| async { Err(anyhow::anyhow!("exec failed")) }),
        );
        registry.register(
            "broken",
            Behavior::handle_error(|_op, _verb, _err| async { Err(anyhow::anyhow!("recovery failed")) }),
        );

        let mut executor = Executor::new(Arc::new(registry), 10);
        executor.execute(Operation::new("ok").into_ref()).await.unwrap();
        executor.execute(Operation::new("ok").into_ref()).await.unwrap();
        executor.undo().await.unwrap();
        assert_eq!((executor.undo_levels(), executor.redo_levels()), (1, 1));

        let err = executor
            .execute(Operation::new("broken").into_ref())
            .await
            .unwrap_err();
        match err {
            HistoryError::RecoveryFailed { verb, error, recovery, .. } => {
                assert_eq!(verb, Verb::Execute);
                assert_eq!(error.to_string(), "exec failed");
                assert_eq!(recovery.to_string(), "recovery failed");
            }
            other => panic!("expected RecoveryFailed, got {:?}", other),
        }
        assert_eq!((executor.undo_levels(), executor.redo_levels()), (0, 0));
    }

    #[tokio::test]
    async fn test_recovered_execute_keeps_history() {
        let mut registry = BehaviorRegistry::new();
        registry.register("ok", Behavior::execute(|_op| async { Ok(()) }));
        registry.register(
            "broken",
            Behavior::execute(|_op| async { Err(anyhow::anyhow!("exec failed")) }),
        );
        registry.register("broken", Behavior::handle_error(|_op, _verb, _err| async { Ok(()) }));

        let mut executor = Executor::new(Arc::new(registry), 10);
        executor.execute(Operation::new("ok").into_ref()).await.unwrap();

        let err = executor
            .execute(Operation::new("broken").into_ref())
            .await
            .unwrap_err();
        assert!(err.is_recovered());
        assert_eq!(executor.undo_levels(), 1);
    }

    #[tokio::test]
    async fn test_failed_redo_reports_redo() {
        let mut registry = BehaviorRegistry::new();
        let runs = Arc::new(Mutex::new(0));
        let r = runs.clone();
        registry.register(
            "second-run-fails",
            Behavior::execute(move |_op| {
                let r = r.clone();
                async move {
                    let mut runs = r.lock();
                    *runs += 1;
                    if *runs > 1 {
                        anyhow::bail!("cannot reapply");
                    }
                    Ok(())
                }
            }),
        );
        registry.register("second-run-fails", Behavior::undo(|_op| async { Ok(()) }));
        registry.register(
            "second-run-fails",
            Behavior::handle_error(|_op, verb, _err| async move {
                assert_eq!(verb, Verb::Execute);
                Ok(())
            }),
        );

        let mut executor = Executor::new(Arc::new(registry), 10);
        executor
            .execute(Operation::new("second-run-fails").into_ref())
            .await
            .unwrap();
        executor.undo().await.unwrap();

        let err = executor.redo().await.unwrap_err();
        assert!(matches!(err, HistoryError::RedoFailed { .. }));
        assert_eq!((executor.undo_levels(), executor.redo_levels()), (0, 1));
    }

    #[tokio::test]
    async fn test_missing_recovery_counts_as_failed_recovery() {
        let mut registry = BehaviorRegistry::new();
        registry.register(
            "broken",
            Behavior::execute(|_op| async { Err(anyhow::anyhow!("exec failed")) }),
        );

        let mut executor = Executor::new(Arc::new(registry), 10);
        let err = executor
            .execute(Operation::new("broken").into_ref())
            .await
            .unwrap_err();
        assert!(err.invalidates_history());
    }
}
