//! # Tree Topology
//!
//! Ancestor paths, least common ancestors and shallow range decomposition
//! over any [`EntityTree`].
//!
//! All walks are iterative and remember what they visited, so a malformed
//! tree with a parent cycle fails with [`TopologyError::Cycle`] instead of
//! looping forever.
//!
//! ## Shallow ranges
//!
//! A range from `(start, offset)` to `(end, offset)` is covered by the
//! shallowest set of entities that each hold part of it. For
//!
//! ```text
//! root
//! ├── p1
//! │   ├── a
//! │   └── b
//! ├── p2
//! └── p3
//!     ├── c
//!     └── d
//! ```
//!
//! the range `a:2 .. d:1` decomposes into `a (From 2)`, `b (Whole)`,
//! `p2 (Whole)`, `c (Whole)`, `d (To 1)`. Neither `root`, `p1` nor `p3` is
//! visited, and nothing below an emitted node is.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use strata_common::{EntityId, EntityTree};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Cycle detected in the ancestors of {0}")]
    Cycle(EntityId),

    #[error("{child} names {parent} as its parent but is not one of its children")]
    Detached { parent: EntityId, child: EntityId },

    #[error("{first} and {second} do not share a root")]
    Disjoint { first: EntityId, second: EntityId },

    #[error("Range end comes before its start")]
    Reversed,
}

pub type TopologyResult<T> = Result<T, TopologyError>;

/// Chain from an ancestor down to an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ancestry {
    /// Child index taken at each step down; one shorter than `ancestors`
    pub path: Vec<usize>,
    /// Top of the chain first, the entity itself last
    pub ancestors: Vec<EntityId>,
}

impl Ancestry {
    fn at(entity: EntityId) -> Self {
        Self {
            path: Vec::new(),
            ancestors: vec![entity],
        }
    }

    pub fn top(&self) -> EntityId {
        self.ancestors[0]
    }

    pub fn entity(&self) -> EntityId {
        self.ancestors[self.ancestors.len() - 1]
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Same chain starting at `ancestors[from]`
    fn below(&self, from: usize) -> Self {
        Self {
            path: self.path[from..].to_vec(),
            ancestors: self.ancestors[from..].to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relation {
    Equal,
    FirstIsAncestorOfSecond,
    SecondIsAncestorOfFirst,
    Unrelated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcaResult {
    pub lca: EntityId,
    /// Depth of the LCA below the root (its index in the first entity's full chain)
    pub lca_depth: usize,
    /// First entity's chain starting at the LCA
    pub first: Ancestry,
    /// Second entity's chain starting at the LCA
    pub second: Ancestry,
    pub relation: Relation,
}

/// Full chain from the root down to `entity`
pub fn ancestry<T: EntityTree>(tree: &T, entity: EntityId) -> TopologyResult<Ancestry> {
    let mut ancestors = vec![entity];
    let mut path = Vec::new();
    let mut seen = HashSet::from([entity]);

    let mut current = entity;
    while let Some(parent) = tree.parent(current) {
        if !seen.insert(parent) {
            return Err(TopologyError::Cycle(entity));
        }
        let index = tree
            .index_of_child(parent, current)
            .ok_or(TopologyError::Detached { parent, child: current })?;

        path.push(index);
        ancestors.push(parent);
        current = parent;
    }

    path.reverse();
    ancestors.reverse();
    Ok(Ancestry { path, ancestors })
}

/// Child indices from the root down to `entity`
pub fn get_path<T: EntityTree>(tree: &T, entity: EntityId) -> TopologyResult<Vec<usize>> {
    Ok(ancestry(tree, entity)?.path)
}

/// Least common ancestor of `first` and `second`; `None` when they are in different trees
pub fn lca<T: EntityTree>(tree: &T, first: EntityId, second: EntityId) -> TopologyResult<Option<LcaResult>> {
    let first_chain = ancestry(tree, first)?;
    let first_depth = first_chain.depth();

    if first == second {
        return Ok(Some(LcaResult {
            lca: first,
            lca_depth: first_depth,
            first: Ancestry::at(first),
            second: Ancestry::at(first),
            relation: Relation::Equal,
        }));
    }

    if tree.parent(second) == Some(first) {
        let index = tree
            .index_of_child(first, second)
            .ok_or(TopologyError::Detached { parent: first, child: second })?;
        return Ok(Some(LcaResult {
            lca: first,
            lca_depth: first_depth,
            first: Ancestry::at(first),
            second: Ancestry {
                path: vec![index],
                ancestors: vec![first, second],
            },
            relation: Relation::FirstIsAncestorOfSecond,
        }));
    }

    if tree.parent(first) == Some(second) {
        let lca_depth = first_depth - 1;
        return Ok(Some(LcaResult {
            lca: second,
            lca_depth,
            first: first_chain.below(lca_depth),
            second: Ancestry::at(second),
            relation: Relation::SecondIsAncestorOfFirst,
        }));
    }

    let positions: HashMap<EntityId, usize> = first_chain
        .ancestors
        .iter()
        .enumerate()
        .map(|(depth, entity)| (*entity, depth))
        .collect();

    // Climb from `second` until we land on `first`'s chain
    let mut path = Vec::new();
    let mut ancestors = vec![second];
    let mut seen = HashSet::from([second]);
    let mut current = second;

    loop {
        if let Some(&lca_depth) = positions.get(&current) {
            path.reverse();
            ancestors.reverse();

            let relation = if current == first {
                Relation::FirstIsAncestorOfSecond
            } else if current == second {
                Relation::SecondIsAncestorOfFirst
            } else {
                Relation::Unrelated
            };

            return Ok(Some(LcaResult {
                lca: current,
                lca_depth,
                first: first_chain.below(lca_depth),
                second: Ancestry { path, ancestors },
                relation,
            }));
        }

        let Some(parent) = tree.parent(current) else {
            return Ok(None);
        };
        if !seen.insert(parent) {
            return Err(TopologyError::Cycle(second));
        }
        let index = tree
            .index_of_child(parent, current)
            .ok_or(TopologyError::Detached { parent, child: current })?;

        path.push(index);
        ancestors.push(parent);
        current = parent;
    }
}

/// A position inside an entity
///
/// For leaves the offset is whatever the host measures content in. When a
/// range endpoint is an ancestor of the other endpoint, its offset is a child
/// index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub entity: EntityId,
    pub offset: usize,
}

impl Point {
    pub fn new(entity: EntityId, offset: usize) -> Self {
        Self { entity, offset }
    }
}

/// Which part of an emitted entity the range covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "offsets", rename_all = "camelCase")]
pub enum Span {
    Whole,
    /// From the offset to the end
    From(usize),
    /// From the beginning up to the offset
    To(usize),
    Between(usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShallowNode {
    pub entity: EntityId,
    pub span: Span,
}

impl ShallowNode {
    fn whole(entity: EntityId) -> Self {
        Self {
            entity,
            span: Span::Whole,
        }
    }
}

/// Visit the shallowest entities covered by `start .. end`, in document order
///
/// Returns the relation between the endpoints so the caller knows how the
/// offsets were interpreted.
pub fn process_shallow_nodes<T, F>(tree: &T, start: Point, end: Point, mut visit: F) -> TopologyResult<Relation>
where
    T: EntityTree,
    F: FnMut(ShallowNode),
{
    let result = lca(tree, start.entity, end.entity)?.ok_or(TopologyError::Disjoint {
        first: start.entity,
        second: end.entity,
    })?;

    match result.relation {
        Relation::Equal => {
            if end.offset < start.offset {
                return Err(TopologyError::Reversed);
            }
            visit(ShallowNode {
                entity: start.entity,
                span: Span::Between(start.offset, end.offset),
            });
        }

        Relation::Unrelated => {
            let (first, second) = (&result.first, &result.second);
            if first.path[0] > second.path[0] {
                return Err(TopologyError::Reversed);
            }

            visit(ShallowNode {
                entity: start.entity,
                span: Span::From(start.offset),
            });
            climb_trailing(tree, first, &mut visit);
            emit_children(tree, result.lca, first.path[0] + 1..second.path[0], &mut visit);
            descend_leading(tree, second, &mut visit);
            visit(ShallowNode {
                entity: end.entity,
                span: Span::To(end.offset),
            });
        }

        Relation::FirstIsAncestorOfSecond => {
            let second = &result.second;
            let branch = second.path[0];
            if start.offset > branch {
                return Err(TopologyError::Reversed);
            }

            emit_children(tree, start.entity, start.offset..branch, &mut visit);
            descend_leading(tree, second, &mut visit);
            visit(ShallowNode {
                entity: end.entity,
                span: Span::To(end.offset),
            });
        }

        Relation::SecondIsAncestorOfFirst => {
            let first = &result.first;
            let branch = first.path[0];
            if branch >= end.offset {
                return Err(TopologyError::Reversed);
            }

            visit(ShallowNode {
                entity: start.entity,
                span: Span::From(start.offset),
            });
            climb_trailing(tree, first, &mut visit);
            emit_children(tree, end.entity, branch + 1..end.offset, &mut visit);
        }
    }

    Ok(result.relation)
}

fn emit_children<T: EntityTree, F: FnMut(ShallowNode)>(tree: &T, parent: EntityId, range: Range<usize>, visit: &mut F) {
    let count = tree.child_count(parent);
    for index in range.start..range.end.min(count) {
        if let Some(child) = tree.child(parent, index) {
            visit(ShallowNode::whole(child));
        }
    }
}

/// Siblings after the start branch, from just above the start entity up to below the LCA
fn climb_trailing<T: EntityTree, F: FnMut(ShallowNode)>(tree: &T, chain: &Ancestry, visit: &mut F) {
    for level in (1..chain.depth()).rev() {
        let parent = chain.ancestors[level];
        let count = tree.child_count(parent);
        emit_children(tree, parent, chain.path[level] + 1..count, visit);
    }
}

/// Siblings before the end branch, from below the LCA down to just above the end entity
fn descend_leading<T: EntityTree, F: FnMut(ShallowNode)>(tree: &T, chain: &Ancestry, visit: &mut F) {
    for level in 1..chain.depth() {
        emit_children(tree, chain.ancestors[level], 0..chain.path[level], visit);
    }
}
