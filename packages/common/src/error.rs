use crate::tree::EntityId;
use thiserror::Error;

/// Errors raised by the in-memory entity tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("Entity {0} is already attached to a parent")]
    AlreadyAttached(EntityId),

    #[error("Index {index} out of bounds for {parent} with {len} children")]
    IndexOutOfBounds {
        parent: EntityId,
        index: usize,
        len: usize,
    },

    #[error("Attaching {child} under {parent} would create a cycle")]
    WouldCreateCycle { parent: EntityId, child: EntityId },

    #[error("Cannot remove the root entity")]
    RootRemoval,
}
