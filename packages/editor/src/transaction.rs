//! # Transactions
//!
//! A transaction is an unbounded executor whose history is the list of
//! operations applied so far. Nothing is ever evicted, so the whole group can
//! be rolled back newest-first.

use crate::errors::HistoryError;
use crate::executor::{drive, Executor, OperationLog, Step};
use crate::operation::OperationRef;
use crate::registry::BehaviorRegistry;
use std::sync::Arc;

pub struct Transaction {
    executor: Executor<Vec<OperationRef>>,
}

impl Transaction {
    pub fn new(registry: Arc<BehaviorRegistry>) -> Self {
        Self {
            executor: Executor::with_log(registry, Vec::new()),
        }
    }

    /// Execute and record one operation
    pub async fn execute(&mut self, op: OperationRef) -> Result<(), HistoryError> {
        self.executor.execute(op).await
    }

    /// Operations applied so far
    pub fn len(&self) -> usize {
        self.executor.undo_levels()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applied operations, oldest first
    pub fn operations(&self) -> &[OperationRef] {
        self.executor.history()
    }

    /// Keep everything that was applied
    pub fn commit(self) -> Vec<OperationRef> {
        let Transaction { mut executor } = self;
        std::mem::take(executor.history_mut())
    }

    /// Undo every applied operation, newest first
    ///
    /// Undo failures that were recovered are logged and skipped; anything
    /// else stops the rollback and is returned. Returns how many operations
    /// were undone.
    pub async fn rollback(&mut self) -> Result<usize, HistoryError> {
        let mut undone = 0;

        while let Some(op) = OperationLog::pop(self.executor.history_mut()) {
            match drive(self.executor.registry(), &op, Step::Undo).await {
                Ok(()) => undone += 1,
                Err(err) if err.is_recovered() => {
                    tracing::warn!("Rollback skipped {}: {}", op.id(), err);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(undone)
    }
}
