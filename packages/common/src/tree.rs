use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of an entity in the document tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        EntityId(raw)
    }
}

/// Read-only view of the document tree
///
/// The editing core never owns entities. Whoever owns the document implements
/// this trait so that topology walks can ask for parents and ordered children.
pub trait EntityTree {
    /// Parent of an entity, `None` for roots and unknown entities
    fn parent(&self, entity: EntityId) -> Option<EntityId>;

    /// Child at `index`, `None` when out of range
    fn child(&self, entity: EntityId, index: usize) -> Option<EntityId>;

    /// Number of direct children
    fn child_count(&self, entity: EntityId) -> usize;

    /// Position of `child` among the children of `parent`
    fn index_of_child(&self, parent: EntityId, child: EntityId) -> Option<usize>;

    /// Whether `entity` has no children
    fn is_leaf(&self, entity: EntityId) -> bool {
        self.child_count(entity) == 0
    }
}

impl<T: EntityTree + ?Sized> EntityTree for &T {
    fn parent(&self, entity: EntityId) -> Option<EntityId> {
        (**self).parent(entity)
    }

    fn child(&self, entity: EntityId, index: usize) -> Option<EntityId> {
        (**self).child(entity, index)
    }

    fn child_count(&self, entity: EntityId) -> usize {
        (**self).child_count(entity)
    }

    fn index_of_child(&self, parent: EntityId, child: EntityId) -> Option<usize> {
        (**self).index_of_child(parent, child)
    }
}
