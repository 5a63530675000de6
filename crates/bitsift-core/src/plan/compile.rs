//! Compile trees: row operations at explicit working ranks

use std::slice;

use crate::arena::{Arena, NodeId};
use crate::row::{AbstractRow, Rank};

/// Handle of a [`CompileNode`]
pub type CompileNodeId = NodeId<CompileNode>;

/// Node of a compiled match tree
///
/// Every node is evaluated at a working rank. The root `Report` works at
/// rank 0, `RankDown` raises the working rank of its child by `delta`, and
/// every other node inherits the working rank of its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileNode {
    /// Bitwise AND of the children
    And(Vec<CompileNodeId>),
    /// Bitwise OR of the children
    Or(Vec<CompileNodeId>),
    /// Bitwise complement
    Not(CompileNodeId),
    /// Load a row whose rank is `rank_delta` above the working rank
    LoadRow {
        /// Row to load
        row: AbstractRow,
        /// `row.rank` minus the working rank
        rank_delta: Rank,
    },
    /// Evaluate `child` at working rank + `delta`, expand to the working rank
    RankDown {
        /// Rank difference
        delta: Rank,
        /// Coarse subtree
        child: CompileNodeId,
    },
    /// Report matches of the child, or every document if there is none
    Report(Option<CompileNodeId>),
}

impl CompileNode {
    /// Children in evaluation order
    pub fn children(&self) -> &[CompileNodeId] {
        match self {
            Self::And(children) | Self::Or(children) => children,
            Self::Not(child) | Self::RankDown { child, .. } | Self::Report(Some(child)) => {
                slice::from_ref(child)
            }
            Self::LoadRow { .. } | Self::Report(None) => &[],
        }
    }

    /// True for nodes that need an accumulator register
    pub fn is_interior(&self) -> bool {
        matches!(
            self,
            Self::And(_) | Self::Or(_) | Self::Not(_) | Self::RankDown { .. }
        )
    }
}

/// Visit the tree under `root` in post-order
pub fn post_order(arena: &Arena<CompileNode>, root: CompileNodeId) -> Vec<CompileNodeId> {
    let mut order = Vec::new();
    let mut stack = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        stack.push((id, true));
        for &child in arena.get(id).children().iter().rev() {
            stack.push((child, false));
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::PlanRowId;

    #[test]
    fn test_post_order_and_children() {
        let mut arena = Arena::with_capacity(8);
        let load = |arena: &mut Arena<CompileNode>, id| {
            arena
                .alloc(CompileNode::LoadRow {
                    row: AbstractRow::new(PlanRowId(id), 0),
                    rank_delta: 0,
                })
                .unwrap()
        };
        let a = load(&mut arena, 0);
        let b = load(&mut arena, 1);
        let and = arena.alloc(CompileNode::And(vec![a, b])).unwrap();
        let down = arena
            .alloc(CompileNode::RankDown { delta: 1, child: and })
            .unwrap();
        let report = arena.alloc(CompileNode::Report(Some(down))).unwrap();

        assert_eq!(post_order(&arena, report), vec![a, b, and, down, report]);
        assert_eq!(arena.get(down).children(), &[and]);
        assert!(arena.get(down).is_interior());
        assert!(!arena.get(report).is_interior());
        assert!(arena.get(a).children().is_empty());
    }
}
