//! History change notifications
//!
//! Broadcast by the scheduler after each state change; subscribers that lag
//! behind lose the oldest events.

use crate::operation::OperationId;
use crate::registry::Verb;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryEvent {
    Executed { op: OperationId },
    Undone { op: OperationId },
    Redone { op: OperationId },
    /// `source` was folded into `target` and left history
    Merged { source: OperationId, target: OperationId },
    /// `running` is the verb that was interrupted, if any
    Cancelled { op: OperationId, running: Option<Verb> },
    Failed { op: OperationId, message: String },
    /// Pushed out of a full history
    Evicted { op: OperationId },
    /// History and redo stack were discarded
    Cleared,
}

impl HistoryEvent {
    pub fn operation(&self) -> Option<OperationId> {
        match self {
            HistoryEvent::Executed { op }
            | HistoryEvent::Undone { op }
            | HistoryEvent::Redone { op }
            | HistoryEvent::Cancelled { op, .. }
            | HistoryEvent::Failed { op, .. }
            | HistoryEvent::Evicted { op } => Some(*op),
            HistoryEvent::Merged { source, .. } => Some(*source),
            HistoryEvent::Cleared => None,
        }
    }
}
