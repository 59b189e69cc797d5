use crate::error::TreeError;
use crate::result::TreeResult;
use crate::tree::{EntityId, EntityTree};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct Node {
    parent: Option<EntityId>,
    children: Vec<EntityId>,
}

/// In-memory entity tree
///
/// Used by tests and by hosts that do not have their own document model.
/// Entities keep their identity when detached, so an undo can re-insert
/// exactly what a delete removed.
#[derive(Debug, Clone)]
pub struct MemoryTree {
    root: EntityId,
    nodes: HashMap<EntityId, Node>,
    next_id: u64,
}

impl MemoryTree {
    /// Create a tree holding only a root entity
    pub fn new() -> Self {
        let root = EntityId(0);
        let mut nodes = HashMap::new();
        nodes.insert(root, Node::default());

        Self {
            root,
            nodes,
            next_id: 1,
        }
    }

    pub fn root(&self) -> EntityId {
        self.root
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.nodes.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ordered children of an entity (empty for unknown entities)
    pub fn children(&self, entity: EntityId) -> &[EntityId] {
        self.nodes
            .get(&entity)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    /// Create a new entity that is not attached anywhere yet
    pub fn create_detached(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, Node::default());
        id
    }

    /// Create a new entity as the last child of `parent`
    pub fn append_child(&mut self, parent: EntityId) -> TreeResult<EntityId> {
        let len = self.node(parent)?.children.len();
        let child = self.create_detached();
        self.insert_child(parent, len, child)?;
        Ok(child)
    }

    /// Attach a detached entity under `parent` at `index`
    pub fn insert_child(&mut self, parent: EntityId, index: usize, child: EntityId) -> TreeResult<()> {
        if self.node(child)?.parent.is_some() || child == self.root {
            return Err(TreeError::AlreadyAttached(child));
        }

        if self.is_ancestor_or_self(child, parent) {
            return Err(TreeError::WouldCreateCycle { parent, child });
        }

        let len = self.node(parent)?.children.len();
        if index > len {
            return Err(TreeError::IndexOutOfBounds { parent, index, len });
        }

        self.node_mut(parent)?.children.insert(index, child);
        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Detach an entity (with its subtree) and report where it was
    pub fn detach(&mut self, entity: EntityId) -> TreeResult<(EntityId, usize)> {
        if entity == self.root {
            return Err(TreeError::RootRemoval);
        }

        let parent = self
            .node(entity)?
            .parent
            .ok_or(TreeError::EntityNotFound(entity))?;

        let siblings = &mut self.node_mut(parent)?.children;
        let index = siblings
            .iter()
            .position(|c| *c == entity)
            .ok_or(TreeError::EntityNotFound(entity))?;
        siblings.remove(index);

        self.node_mut(entity)?.parent = None;
        Ok((parent, index))
    }

    /// Move an attached entity to a new position
    pub fn move_child(&mut self, entity: EntityId, new_parent: EntityId, index: usize) -> TreeResult<()> {
        if self.is_ancestor_or_self(entity, new_parent) {
            return Err(TreeError::WouldCreateCycle {
                parent: new_parent,
                child: entity,
            });
        }

        let (old_parent, old_index) = self.detach(entity)?;
        if let Err(e) = self.insert_child(new_parent, index, entity) {
            // Put it back where it was
            self.insert_child(old_parent, old_index, entity)?;
            return Err(e);
        }
        Ok(())
    }

    /// All entities below `entity` in document order (pre-order)
    pub fn descendants(&self, entity: EntityId) -> Vec<EntityId> {
        let mut out = Vec::new();
        let mut stack: Vec<EntityId> = self.children(entity).iter().rev().copied().collect();

        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }

        out
    }

    fn is_ancestor_or_self(&self, ancestor: EntityId, entity: EntityId) -> bool {
        let mut cursor = Some(entity);
        let mut steps = 0;

        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.nodes.len() {
                return false;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent);
        }

        false
    }

    fn node(&self, entity: EntityId) -> TreeResult<&Node> {
        self.nodes.get(&entity).ok_or(TreeError::EntityNotFound(entity))
    }

    fn node_mut(&mut self, entity: EntityId) -> TreeResult<&mut Node> {
        self.nodes
            .get_mut(&entity)
            .ok_or(TreeError::EntityNotFound(entity))
    }
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityTree for MemoryTree {
    fn parent(&self, entity: EntityId) -> Option<EntityId> {
        self.nodes.get(&entity).and_then(|node| node.parent)
    }

    fn child(&self, entity: EntityId, index: usize) -> Option<EntityId> {
        self.children(entity).get(index).copied()
    }

    fn child_count(&self, entity: EntityId) -> usize {
        self.children(entity).len()
    }

    fn index_of_child(&self, parent: EntityId, child: EntityId) -> Option<usize> {
        self.children(parent).iter().position(|c| *c == child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_lookup() {
        let mut tree = MemoryTree::new();
        let root = tree.root();
        let a = tree.append_child(root).unwrap();
        let b = tree.append_child(root).unwrap();

        assert_eq!(tree.child_count(root), 2);
        assert_eq!(tree.child(root, 1), Some(b));
        assert_eq!(tree.parent(a), Some(root));
        assert_eq!(tree.index_of_child(root, b), Some(1));
        assert_eq!(tree.parent(root), None);
    }

    #[test]
    fn test_detach_and_reinsert_keeps_identity() {
        let mut tree = MemoryTree::new();
        let root = tree.root();
        let a = tree.append_child(root).unwrap();
        let b = tree.append_child(root).unwrap();
        let c = tree.append_child(root).unwrap();

        let (parent, index) = tree.detach(b).unwrap();
        assert_eq!((parent, index), (root, 1));
        assert_eq!(tree.children(root), &[a, c]);
        assert!(tree.contains(b));

        tree.insert_child(parent, index, b).unwrap();
        assert_eq!(tree.children(root), &[a, b, c]);
    }

    #[test]
    fn test_insert_rejects_cycles_and_bad_indices() {
        let mut tree = MemoryTree::new();
        let root = tree.root();
        let a = tree.append_child(root).unwrap();
        let b = tree.append_child(a).unwrap();

        assert!(matches!(
            tree.move_child(a, b, 0),
            Err(TreeError::WouldCreateCycle { .. })
        ));

        let loose = tree.create_detached();
        assert!(matches!(
            tree.insert_child(root, 5, loose),
            Err(TreeError::IndexOutOfBounds { len: 1, .. })
        ));
        assert!(matches!(tree.insert_child(root, 0, b), Err(TreeError::AlreadyAttached(_))));
        assert_eq!(tree.detach(root), Err(TreeError::RootRemoval));
    }

    #[test]
    fn test_descendants_are_in_document_order() {
        let mut tree = MemoryTree::new();
        let root = tree.root();
        let p1 = tree.append_child(root).unwrap();
        let t1 = tree.append_child(p1).unwrap();
        let p2 = tree.append_child(root).unwrap();
        let t2 = tree.append_child(p2).unwrap();

        assert_eq!(tree.descendants(root), vec![p1, t1, p2, t2]);
    }
}
