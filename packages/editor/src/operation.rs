//! # Operations
//!
//! An operation is one reversible edit. It carries no behavior of its own:
//! the registry resolves its `kind` to handlers, and the handlers read and
//! write its payload (for example `execute` records the entities it deleted
//! so that `undo` can put them back).
//!
//! A running handler can watch [`Operation::cancellation`]: the scheduler
//! fires it when the operation is undone or redone mid-flight. Handlers are
//! never interrupted; one that notices the signal may return early and leave
//! the rest to its `cancel` verb.
//!
//! Operations are shared by reference (`OperationRef`) between the pending
//! queue, the in-flight slot, the history buffer and the undo stack. Two
//! operations are equal iff they have the same id.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl OperationId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        OperationId(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Shared handle to an operation
pub type OperationRef = Arc<Operation>;

/// Lifecycle state of a scheduled operation (derived, never stored)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpState {
    /// Queued, not started yet
    Pending,
    /// Occupies the scheduler's in-flight slot
    Executing,
    /// Settled, including undone operations waiting on the undo stack
    Completed,
}

type Payload = Box<dyn Any + Send>;

/// A reversible, identifiable unit of document mutation
pub struct Operation {
    id: OperationId,
    kind: String,
    merge_with: Option<OperationId>,
    payload: Mutex<Option<Payload>>,
    /// Token of the current run, replaced each time the scheduler starts one
    cancellation: Mutex<CancellationToken>,
    /// Position on the timeline of the scheduler that executed it; 0 until then
    sequence: AtomicU64,
}

impl Operation {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: OperationId::next(),
            kind: kind.into(),
            merge_with: None,
            payload: Mutex::new(None),
            cancellation: Mutex::new(CancellationToken::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Attach an initial payload
    pub fn with_payload<T: Any + Send>(self, payload: T) -> Self {
        *self.payload.lock() = Some(Box::new(payload));
        self
    }

    /// Ask the scheduler to fold this operation into `target` once it has run
    pub fn merge_into(mut self, target: OperationId) -> Self {
        self.merge_with = Some(target);
        self
    }

    pub fn into_ref(self) -> OperationRef {
        Arc::new(self)
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn merge_with(&self) -> Option<OperationId> {
        self.merge_with
    }

    /// Replace the payload
    pub fn set_payload<T: Any + Send>(&self, payload: T) {
        *self.payload.lock() = Some(Box::new(payload));
    }

    /// Remove the payload if it has type `T`; a payload of another type is left in place
    pub fn take_payload<T: Any + Send>(&self) -> Option<T> {
        let mut slot = self.payload.lock();
        let boxed = slot.take()?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// Run `f` against the payload if it has type `T`
    ///
    /// The payload lock is held while `f` runs, so `f` must not block.
    pub fn map_payload<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.payload.lock();
        let boxed: &mut (dyn Any + Send) = slot.as_mut()?.as_mut();
        boxed.downcast_mut::<T>().map(f)
    }

    /// Clone the payload out if it has type `T`
    pub fn payload<T: Any + Send + Clone>(&self) -> Option<T> {
        self.map_payload(|value: &mut T| value.clone())
    }

    pub fn has_payload(&self) -> bool {
        self.payload.lock().is_some()
    }

    /// Fires when the run in progress is cancelled
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.lock().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.lock().is_cancelled()
    }

    /// Fresh token for a new run
    pub(crate) fn arm_cancellation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancellation.lock() = token.clone();
        token
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Relaxed);
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Operation {}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("merge_with", &self.merge_with)
            .field("has_payload", &self.has_payload())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = Operation::new("insert");
        let b = Operation::new("insert");
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(a.kind(), "insert");
    }

    #[test]
    fn test_payload_round_trip() {
        let op = Operation::new("delete").with_payload(vec![1u64, 2, 3]);

        op.map_payload(|deleted: &mut Vec<u64>| deleted.push(4));
        assert_eq!(op.payload::<Vec<u64>>(), Some(vec![1, 2, 3, 4]));

        // Wrong type leaves the payload untouched
        assert_eq!(op.take_payload::<String>(), None);
        assert!(op.has_payload());

        assert_eq!(op.take_payload::<Vec<u64>>(), Some(vec![1, 2, 3, 4]));
        assert!(!op.has_payload());
    }

    #[test]
    fn test_merge_target() {
        let target = Operation::new("type").into_ref();
        let source = Operation::new("type").merge_into(target.id());
        assert_eq!(source.merge_with(), Some(target.id()));
        assert_eq!(target.merge_with(), None);
    }

    #[test]
    fn test_rearming_resets_cancellation() {
        let op = Operation::new("insert");
        let first = op.arm_cancellation();
        first.cancel();
        assert!(op.is_cancelled());

        let second = op.arm_cancellation();
        assert!(!op.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(first.is_cancelled());
    }

    #[test]
    fn test_op_state_serialization() {
        let json = serde_json::to_string(&OpState::Executing).unwrap();
        assert_eq!(json, "\"executing\"");
    }
}
