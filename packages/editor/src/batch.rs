//! # Batch Operations
//!
//! A batch groups child operations so they enter history as one entry. The
//! children run through a [`Transaction`]; if one fails, the ones already
//! applied are rolled back and the batch fails as a whole.
//!
//! The batch payload tracks how many children are currently applied. Undo
//! walks them newest-first and decrements the count, so `cancel` and
//! `handle_error` always know where an interrupted pass stopped. A pass run
//! as `execute` or `undo` also stops between children once the batch is
//! cancelled, leaving the remainder to `cancel`.

use crate::errors::HistoryError;
use crate::executor::{drive, Step};
use crate::operation::{Operation, OperationRef};
use crate::registry::{BehaviorRegistry, OperationBehavior, Verb};
use crate::transaction::Transaction;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::sync::Arc;

pub const BATCH_KIND: &str = "batch";

/// Payload carried by a batch operation
#[derive(Debug, Clone, Default)]
pub struct BatchPayload {
    pub operations: Vec<OperationRef>,
    /// Children currently applied, counted from the front
    pub applied: usize,
}

/// Runs a batch's children against a registry of child behaviors
pub struct BatchBehavior {
    children: Arc<BehaviorRegistry>,
}

impl BatchBehavior {
    pub fn new(children: Arc<BehaviorRegistry>) -> Self {
        Self { children }
    }

    /// Register batches in `registry`; children resolve against what is registered so far
    pub fn register(registry: &mut BehaviorRegistry) {
        let behavior = BatchBehavior::new(Arc::new(registry.clone()));
        registry.register_behavior(BATCH_KIND, Arc::new(behavior));
    }

    /// New batch operation over `children`
    pub fn operation(children: Vec<OperationRef>) -> Operation {
        Operation::new(BATCH_KIND).with_payload(BatchPayload {
            operations: children,
            applied: 0,
        })
    }

    /// Children of a batch operation
    pub fn children_of(op: &Operation) -> Vec<OperationRef> {
        op.map_payload(|payload: &mut BatchPayload| payload.operations.clone())
            .unwrap_or_default()
    }

    fn snapshot(op: &Operation) -> anyhow::Result<(Vec<OperationRef>, usize)> {
        op.map_payload(|payload: &mut BatchPayload| (payload.operations.clone(), payload.applied))
            .with_context(|| format!("{} has no batch payload", op.id()))
    }

    fn set_applied(op: &Operation, applied: usize) {
        op.map_payload(|payload: &mut BatchPayload| payload.applied = applied);
    }

    /// Apply children from the current position to the end
    async fn apply_remaining(&self, op: &Operation, interruptible: bool) -> anyhow::Result<()> {
        let (children, start) = Self::snapshot(op)?;
        let mut tx = Transaction::new(self.children.clone());

        for (index, child) in children.iter().enumerate().skip(start) {
            if interruptible && op.is_cancelled() {
                tracing::debug!("Batch {} cancelled after {} children", op.id(), index);
                break;
            }
            if let Err(err) = tx.execute(child.clone()).await {
                tracing::debug!("Batch {} child {} failed, rolling back {} children", op.id(), index, tx.len());
                let rollback = tx.rollback().await;
                Self::set_applied(op, start);
                return match rollback {
                    Ok(_) => Err(anyhow::Error::new(err)),
                    Err(rollback_err) => Err(anyhow::Error::new(rollback_err)
                        .context(format!("rollback after child {} failed: {}", index, err))),
                };
            }
            Self::set_applied(op, index + 1);
        }

        tx.commit();
        Ok(())
    }

    /// Undo applied children newest-first
    async fn revert_applied(&self, op: &Operation, interruptible: bool) -> anyhow::Result<()> {
        let (children, applied) = Self::snapshot(op)?;

        for index in (0..applied.min(children.len())).rev() {
            if interruptible && op.is_cancelled() {
                tracing::debug!("Batch {} cancelled with {} children still applied", op.id(), index + 1);
                break;
            }
            drive(&self.children, &children[index], Step::Undo)
                .await
                .map_err(|err: HistoryError| anyhow!(err))?;
            Self::set_applied(op, index);
        }
        Ok(())
    }
}

#[async_trait]
impl OperationBehavior for BatchBehavior {
    async fn execute(&self, op: &Operation) -> anyhow::Result<()> {
        self.apply_remaining(op, true).await
    }

    async fn undo(&self, op: &Operation) -> anyhow::Result<()> {
        self.revert_applied(op, true).await
    }

    async fn cancel(&self, op: &Operation, running: Option<Verb>) -> anyhow::Result<()> {
        match running {
            Some(Verb::Execute) => self.revert_applied(op, false).await,
            Some(Verb::Undo) => self.apply_remaining(op, false).await,
            _ => Ok(()),
        }
    }

    async fn handle_error(&self, op: &Operation, verb: Verb, _error: &anyhow::Error) -> anyhow::Result<()> {
        match verb {
            // A half-undone batch goes back to fully applied
            Verb::Undo => self.apply_remaining(op, false).await,
            // Execute already rolled its children back
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::registry::Behavior;
    use parking_lot::Mutex;

    /// "write" appends its payload to a shared vector; "boom" always fails
    fn registry(doc: Arc<Mutex<Vec<i32>>>) -> BehaviorRegistry {
        let mut registry = BehaviorRegistry::new();

        let d = doc.clone();
        registry.register(
            "write",
            Behavior::execute(move |op: OperationRef| {
                let d = d.clone();
                async move {
                    d.lock().push(op.payload::<i32>().unwrap_or_default());
                    Ok(())
                }
            }),
        );
        let d = doc;
        registry.register(
            "write",
            Behavior::undo(move |_op| {
                let d = d.clone();
                async move {
                    d.lock().pop();
                    Ok(())
                }
            }),
        );
        registry.register("write", Behavior::handle_error(|_op, _verb, _err| async { Ok(()) }));

        registry.register(
            "boom",
            Behavior::execute(|_op| async { Err(anyhow::anyhow!("boom")) }),
        );
        registry.register("boom", Behavior::handle_error(|_op, _verb, _err| async { Ok(()) }));

        BatchBehavior::register(&mut registry);
        registry
    }

    fn write(value: i32) -> OperationRef {
        Operation::new("write").with_payload(value).into_ref()
    }

    #[tokio::test]
    async fn test_batch_is_one_history_entry() {
        let doc = Arc::new(Mutex::new(Vec::new()));
        let mut executor = Executor::new(Arc::new(registry(doc.clone())), 10);

        let batch = BatchBehavior::operation(vec![write(1), write(2), write(3)]).into_ref();
        executor.execute(batch.clone()).await.unwrap();
        assert_eq!(*doc.lock(), vec![1, 2, 3]);
        assert_eq!(executor.undo_levels(), 1);
        assert_eq!(BatchBehavior::children_of(&batch).len(), 3);

        executor.undo().await.unwrap();
        assert!(doc.lock().is_empty());

        executor.redo().await.unwrap();
        assert_eq!(*doc.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failing_child_rolls_back_batch() {
        let doc = Arc::new(Mutex::new(vec![0]));
        let mut executor = Executor::new(Arc::new(registry(doc.clone())), 10);

        let boom = Operation::new("boom").into_ref();
        let batch = BatchBehavior::operation(vec![write(1), write(2), boom]).into_ref();

        let err = executor.execute(batch.clone()).await.unwrap_err();
        assert!(err.is_recovered());
        assert_eq!(*doc.lock(), vec![0]);
        assert_eq!(executor.undo_levels(), 0);
        assert_eq!(batch.payload::<BatchPayload>().map(|p| p.applied), Some(0));
    }

    #[tokio::test]
    async fn test_cancel_mid_execute_reverts_applied_children() {
        let doc = Arc::new(Mutex::new(Vec::new()));
        let behavior = BatchBehavior::new(Arc::new(registry(doc.clone())));

        let batch = BatchBehavior::operation(vec![write(1), write(2), write(3)]);
        behavior.execute(&batch).await.unwrap();

        // Pretend execution was interrupted after two children
        doc.lock().pop();
        BatchBehavior::set_applied(&batch, 2);

        behavior.cancel(&batch, Some(Verb::Execute)).await.unwrap();
        assert!(doc.lock().is_empty());
        assert_eq!(batch.payload::<BatchPayload>().map(|p| p.applied), Some(0));
    }

    #[tokio::test]
    async fn test_cancelled_batch_stops_between_children() {
        let doc = Arc::new(Mutex::new(Vec::new()));
        let behavior = BatchBehavior::new(Arc::new(registry(doc.clone())));

        let batch = BatchBehavior::operation(vec![write(1), write(2), write(3)]);
        batch.arm_cancellation().cancel();

        behavior.execute(&batch).await.unwrap();
        assert!(doc.lock().is_empty());
        assert_eq!(batch.payload::<BatchPayload>().map(|p| p.applied), Some(0));

        // The applied count tells cancel where execute stopped
        behavior.cancel(&batch, Some(Verb::Undo)).await.unwrap();
        assert_eq!(*doc.lock(), vec![1, 2, 3]);
    }
}
