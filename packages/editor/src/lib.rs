//! # Strata Editor
//!
//! Editing core for structured documents: reversible operations, an
//! undo/redo timeline, and the tree algorithms range edits are built on.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ registry: operation kind × verb → handler   │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ executor / transaction: one verb at a time  │
//! │  - execute / undo / redo                    │
//! │  - error recovery, rollback                 │
//! │  - batches as a single undo step            │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ scheduler: serialized history timeline      │
//! │  - ring-buffer history + undo stack         │
//! │  - cancel pending / in-flight / completed   │
//! │  - merge adjacent operations                │
//! └─────────────────────────────────────────────┘
//!
//! topology + range: two-point selection → per-entity operations
//! ```
//!
//! ## Core Principles
//!
//! 1. **Operations carry no behavior**: handlers are resolved by kind
//! 2. **One mutator at a time**: the document is only touched inside handlers
//! 3. **Failures are recovered or history is dropped**: never half-applied
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strata_editor::{Behavior, BehaviorRegistry, HistoryScheduler, Operation};
//!
//! let mut registry = BehaviorRegistry::new();
//! registry.register("insert", Behavior::execute(|op| async move { /* ... */ Ok(()) }));
//! registry.register("insert", Behavior::undo(|op| async move { /* ... */ Ok(()) }));
//!
//! let scheduler = HistoryScheduler::new(Arc::new(registry));
//! scheduler.execute(Operation::new("insert").into_ref()).await?;
//! scheduler.undo().await?;
//! ```

mod batch;
mod completion;
mod config;
mod errors;
mod events;
mod executor;
mod operation;
mod range;
mod registry;
mod ring_buffer;
mod scheduler;
mod transaction;

pub mod topology;

pub use batch::{BatchBehavior, BatchPayload, BATCH_KIND};
pub use completion::Completion;
pub use config::{ConfigError, HistoryConfig, DEFAULT_CONFIG_NAME};
pub use errors::HistoryError;
pub use events::HistoryEvent;
pub use executor::{Executor, ExecutorState, OperationLog};
pub use operation::{OpState, Operation, OperationId, OperationRef};
pub use range::{plan_range, RangePlan};
pub use registry::{Behavior, BehaviorRegistry, OperationBehavior, Verb};
pub use ring_buffer::RingBuffer;
pub use scheduler::HistoryScheduler;
pub use topology::{LcaResult, Point, Relation, ShallowNode, Span, TopologyError};
pub use transaction::Transaction;

// Re-export the tree contract for convenience
pub use strata_common::{EntityId, EntityTree, MemoryTree};
