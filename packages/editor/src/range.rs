//! Range planning
//!
//! Turns a two-point selection into per-entity operations, grouped as one
//! batch so the whole range edit is a single undo step.

use crate::batch::BatchBehavior;
use crate::operation::Operation;
use crate::topology::{process_shallow_nodes, Point, Relation, ShallowNode, TopologyResult};
use strata_common::{EntityId, EntityTree};

/// Shallow decomposition of a range, in document order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePlan {
    pub relation: Relation,
    pub nodes: Vec<ShallowNode>,
}

/// Decompose `start .. end`
pub fn plan_range<T: EntityTree>(tree: &T, start: Point, end: Point) -> TopologyResult<RangePlan> {
    let mut nodes = Vec::new();
    let relation = process_shallow_nodes(tree, start, end, |node| nodes.push(node))?;
    Ok(RangePlan { relation, nodes })
}

impl RangePlan {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn entities(&self) -> Vec<EntityId> {
        self.nodes.iter().map(|node| node.entity).collect()
    }

    /// One operation per node, wrapped in a batch; `factory` may skip nodes
    pub fn into_batch<F>(self, mut factory: F) -> Operation
    where
        F: FnMut(&ShallowNode) -> Option<Operation>,
    {
        let children = self
            .nodes
            .iter()
            .filter_map(|node| factory(node))
            .map(Operation::into_ref)
            .collect();
        BatchBehavior::operation(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BATCH_KIND;
    use crate::topology::Span;
    use strata_common::MemoryTree;

    #[test]
    fn test_plan_skips_untouched_nodes() {
        let mut tree = MemoryTree::new();
        let root = tree.root();
        let p1 = tree.append_child(root).unwrap();
        let t1 = tree.append_child(p1).unwrap();
        let p2 = tree.append_child(root).unwrap();
        let t2 = tree.append_child(p2).unwrap();

        let plan = plan_range(&tree, Point::new(t1, 3), Point::new(t2, 0)).unwrap();
        assert_eq!(plan.relation, Relation::Unrelated);
        assert_eq!(plan.entities(), vec![t1, t2]);

        // An empty head of t2 needs no operation
        let batch = plan.into_batch(|node| match node.span {
            Span::To(0) => None,
            _ => Some(Operation::new("delete-text").with_payload(node.entity)),
        });
        assert_eq!(batch.kind(), BATCH_KIND);
        let children = BatchBehavior::children_of(&batch);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].payload::<EntityId>(), Some(t1));
    }
}
