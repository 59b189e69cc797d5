//! Error types for the editor

use crate::operation::OperationId;
use crate::registry::Verb;
use std::sync::Arc;
use thiserror::Error;

/// Failure surfaced by the executor, transactions and the history scheduler.
///
/// Handler errors are shared behind an `Arc` because the same error is handed
/// to the operation's `handle_error` verb before it reaches the caller.
#[derive(Error, Debug, Clone)]
pub enum HistoryError {
    #[error("No behavior registered for verb '{verb}' on operation kind '{kind}'")]
    NoBehaviorRegistered { kind: String, verb: Verb },

    #[error("Operation {op} was cancelled")]
    Cancelled { op: OperationId },

    #[error("Execute failed for operation {op}: {error:#}")]
    ExecutionFailed {
        op: OperationId,
        error: Arc<anyhow::Error>,
    },

    #[error("Undo failed for operation {op}: {error:#}")]
    UndoFailed {
        op: OperationId,
        error: Arc<anyhow::Error>,
    },

    #[error("Redo failed for operation {op}: {error:#}")]
    RedoFailed {
        op: OperationId,
        error: Arc<anyhow::Error>,
    },

    #[error("Cancel failed for operation {op}: {error:#}")]
    CancelFailed {
        op: OperationId,
        error: Arc<anyhow::Error>,
    },

    #[error("Merge failed for operation {op}: {error:#}")]
    MergeFailed {
        op: OperationId,
        error: Arc<anyhow::Error>,
    },

    #[error("Recovery failed for operation {op} after {verb} error ({error:#}): {recovery:#}")]
    RecoveryFailed {
        op: OperationId,
        verb: Verb,
        error: Arc<anyhow::Error>,
        recovery: Arc<anyhow::Error>,
    },

    #[error("History scheduler is closed")]
    SchedulerClosed,
}

impl HistoryError {
    /// The handler failed but its `handle_error` verb restored consistency.
    pub fn is_recovered(&self) -> bool {
        matches!(
            self,
            HistoryError::ExecutionFailed { .. }
                | HistoryError::UndoFailed { .. }
                | HistoryError::RedoFailed { .. }
                | HistoryError::CancelFailed { .. }
                | HistoryError::MergeFailed { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HistoryError::Cancelled { .. })
    }

    /// History can no longer be trusted once recovery itself failed.
    pub fn invalidates_history(&self) -> bool {
        matches!(self, HistoryError::RecoveryFailed { .. })
    }

    /// Operation the failure belongs to, if any
    pub fn operation(&self) -> Option<OperationId> {
        match self {
            HistoryError::Cancelled { op }
            | HistoryError::ExecutionFailed { op, .. }
            | HistoryError::UndoFailed { op, .. }
            | HistoryError::RedoFailed { op, .. }
            | HistoryError::CancelFailed { op, .. }
            | HistoryError::MergeFailed { op, .. }
            | HistoryError::RecoveryFailed { op, .. } => Some(*op),
            HistoryError::NoBehaviorRegistered { .. } | HistoryError::SchedulerClosed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovered_classification() {
        let op = OperationId(3);
        let error = Arc::new(anyhow::anyhow!("boom"));

        let failed = HistoryError::ExecutionFailed {
            op,
            error: error.clone(),
        };
        assert!(failed.is_recovered());
        assert!(!failed.invalidates_history());
        assert_eq!(failed.operation(), Some(op));

        let unrecovered = HistoryError::RecoveryFailed {
            op,
            verb: Verb::Execute,
            error,
            recovery: Arc::new(anyhow::anyhow!("still broken")),
        };
        assert!(!unrecovered.is_recovered());
        assert!(unrecovered.invalidates_history());

        let missing = HistoryError::NoBehaviorRegistered {
            kind: "insert".to_string(),
            verb: Verb::Undo,
        };
        assert!(!missing.is_recovered());
        assert_eq!(missing.operation(), None);
    }

    #[test]
    fn test_error_messages_include_both_failures() {
        let err = HistoryError::RecoveryFailed {
            op: OperationId(9),
            verb: Verb::Undo,
            error: Arc::new(anyhow::anyhow!("exec blew up")),
            recovery: Arc::new(anyhow::anyhow!("recovery blew up")),
        };

        let message = err.to_string();
        assert!(message.contains("exec blew up"));
        assert!(message.contains("recovery blew up"));
        assert!(message.contains("op#9"));
    }
}
