//! Accumulator register allocation
//!
//! Nodes are timestamped in post-order. Every interior node (`And`, `Or`,
//! `Not`, `RankDown`) owns an accumulator that is live from the completion
//! of its first child until its own completion, where the parent consumes
//! it. Intervals are scanned by start; an interval ending at or before the
//! new start is expired first, so a parent can take over the register of
//! its first child. The lowest free register is always chosen.

use std::collections::{BTreeSet, HashMap};

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::plan::compile::{CompileNode, CompileNodeId, post_order};

/// Registers assigned to the interior nodes of one compile tree
#[derive(Debug, Clone, Default)]
pub struct RegisterAssignment {
    registers: HashMap<CompileNodeId, usize>,
    register_base: usize,
    register_count: usize,
    max_live: usize,
}

impl RegisterAssignment {
    /// Register of `node`, if it has one
    pub fn register(&self, node: CompileNodeId) -> Option<usize> {
        self.registers.get(&node).copied()
    }

    /// Number of nodes with a register
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// True if no node needed a register
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// First register of the pool
    pub fn register_base(&self) -> usize {
        self.register_base
    }

    /// Size of the pool
    pub fn register_count(&self) -> usize {
        self.register_count
    }

    /// Largest number of registers live at once
    pub fn max_live(&self) -> usize {
        self.max_live
    }

    /// Distinct registers used
    pub fn registers_used(&self) -> usize {
        self.registers.values().collect::<BTreeSet<_>>().len()
    }

    /// Node to register pairs, ordered by node
    pub fn iter(&self) -> impl Iterator<Item = (CompileNodeId, usize)> + '_ {
        let mut pairs: Vec<_> = self.registers.iter().map(|(&n, &r)| (n, r)).collect();
        pairs.sort_by_key(|(node, _)| node.index());
        pairs.into_iter()
    }
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    node: CompileNodeId,
    start: usize,
    end: usize,
}

/// Linear-scan allocator over a compile tree
pub struct RegisterAllocator<'a> {
    tree: &'a Arena<CompileNode>,
    row_count: usize,
    register_base: usize,
    register_count: usize,
}

impl<'a> RegisterAllocator<'a> {
    /// Allocator for trees in `tree` whose loads reference `row_count`
    /// plan rows, drawing from `[register_base, register_base +
    /// register_count)`
    pub fn new(
        tree: &'a Arena<CompileNode>,
        row_count: usize,
        register_base: usize,
        register_count: usize,
    ) -> Self {
        Self {
            tree,
            row_count,
            register_base,
            register_count,
        }
    }

    /// Assign registers to the tree under `root`. No mapping is returned
    /// unless every interior node got a register.
    pub fn allocate(&self, root: CompileNodeId) -> Result<RegisterAssignment> {
        let order = post_order(self.tree, root);
        let mut completed = HashMap::with_capacity(order.len());
        let mut intervals = Vec::new();

        for (time, &id) in order.iter().enumerate() {
            completed.insert(id, time);
            let node = self.tree.get(id);
            if let CompileNode::LoadRow { row, .. } = node {
                if row.id.as_usize() >= self.row_count {
                    let err = Error::UnknownPlanRow {
                        id: row.id.0,
                        row_count: self.row_count,
                    };
                    tracing::error!("{}", err);
                    return Err(err);
                }
            }
            if node.is_interior() {
                let first = node
                    .children()
                    .first()
                    .and_then(|child| completed.get(child))
                    .copied()
                    .ok_or_else(|| Error::malformed(format!("interior node {:?} has no children", id)))?;
                intervals.push(Interval {
                    node: id,
                    start: first,
                    end: time,
                });
            }
        }
        intervals.sort_by_key(|interval| interval.start);

        let mut free: BTreeSet<usize> = (0..self.register_count).collect();
        let mut active: Vec<(Interval, usize)> = Vec::new();
        let mut registers = HashMap::with_capacity(intervals.len());
        let mut max_live = 0;

        for interval in intervals {
            active.retain(|(live, slot)| {
                if live.end <= interval.start {
                    free.insert(*slot);
                    false
                } else {
                    true
                }
            });
            let Some(slot) = free.pop_first() else {
                return Err(Error::RegisterPressure {
                    required: active.len() + 1,
                    available: self.register_count,
                });
            };
            registers.insert(interval.node, self.register_base + slot);
            active.push((interval, slot));
            max_live = max_live.max(active.len());
        }

        Ok(RegisterAssignment {
            registers,
            register_base: self.register_base,
            register_count: self.register_count,
            max_live,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{AbstractRow, PlanRowId};

    fn load(arena: &mut Arena<CompileNode>, id: u32) -> CompileNodeId {
        arena
            .alloc(CompileNode::LoadRow {
                row: AbstractRow::new(PlanRowId(id), 0),
                rank_delta: 0,
            })
            .unwrap()
    }

    #[test]
    fn test_single_and_uses_base_register() {
        let mut arena = Arena::with_capacity(8);
        let a = load(&mut arena, 0);
        let b = load(&mut arena, 1);
        let and = arena.alloc(CompileNode::And(vec![a, b])).unwrap();
        let root = arena.alloc(CompileNode::Report(Some(and))).unwrap();

        let assignment = RegisterAllocator::new(&arena, 2, 8, 7)
            .allocate(root)
            .unwrap();
        assert_eq!(assignment.len(), 1);
        assert_eq!(assignment.register(and), Some(8));
        assert_eq!(assignment.register(a), None);
        assert_eq!(assignment.max_live(), 1);
    }

    #[test]
    fn test_parent_adopts_first_child_register() {
        let mut arena = Arena::with_capacity(16);
        let a = load(&mut arena, 0);
        let b = load(&mut arena, 1);
        let c = load(&mut arena, 2);
        let d = load(&mut arena, 3);
        let left = arena.alloc(CompileNode::Or(vec![a, b])).unwrap();
        let right = arena.alloc(CompileNode::Or(vec![c, d])).unwrap();
        let and = arena.alloc(CompileNode::And(vec![left, right])).unwrap();
        let root = arena.alloc(CompileNode::Report(Some(and))).unwrap();

        let assignment = RegisterAllocator::new(&arena, 4, 8, 7)
            .allocate(root)
            .unwrap();
        assert_eq!(assignment.register(left), Some(8));
        assert_eq!(assignment.register(and), Some(8));
        assert_eq!(assignment.register(right), Some(9));
        assert_eq!(assignment.max_live(), 2);
        assert_eq!(assignment.registers_used(), 2);
    }

    #[test]
    fn test_register_pressure_fails_cleanly() {
        // Right-leaning chain And(a, Or(b, And(c, Or(d, e)))) keeps every
        // level live.
        let mut arena = Arena::with_capacity(16);
        let a = load(&mut arena, 0);
        let b = load(&mut arena, 1);
        let c = load(&mut arena, 2);
        let d = load(&mut arena, 3);
        let e = load(&mut arena, 4);
        let inner_or = arena.alloc(CompileNode::Or(vec![d, e])).unwrap();
        let inner_and = arena.alloc(CompileNode::And(vec![c, inner_or])).unwrap();
        let outer_or = arena.alloc(CompileNode::Or(vec![b, inner_and])).unwrap();
        let outer_and = arena.alloc(CompileNode::And(vec![a, outer_or])).unwrap();
        let root = arena.alloc(CompileNode::Report(Some(outer_and))).unwrap();

        let ok = RegisterAllocator::new(&arena, 5, 0, 4).allocate(root).unwrap();
        assert_eq!(ok.max_live(), 4);

        let err = RegisterAllocator::new(&arena, 5, 0, 3)
            .allocate(root)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RegisterPressure {
                required: 4,
                available: 3
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unknown_plan_row_is_fatal() {
        let mut arena = Arena::with_capacity(8);
        let a = load(&mut arena, 0);
        let b = load(&mut arena, 5);
        let and = arena.alloc(CompileNode::And(vec![a, b])).unwrap();
        let root = arena.alloc(CompileNode::Report(Some(and))).unwrap();

        let err = RegisterAllocator::new(&arena, 2, 8, 7)
            .allocate(root)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPlanRow { id: 5, row_count: 2 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rank_down_and_not_hold_registers() {
        let mut arena = Arena::with_capacity(8);
        let a = load(&mut arena, 0);
        let b = load(&mut arena, 1);
        let or = arena.alloc(CompileNode::Or(vec![a, b])).unwrap();
        let not = arena.alloc(CompileNode::Not(or)).unwrap();
        let down = arena
            .alloc(CompileNode::RankDown { delta: 2, child: not })
            .unwrap();
        let root = arena.alloc(CompileNode::Report(Some(down))).unwrap();

        let assignment = RegisterAllocator::new(&arena, 2, 3, 1)
            .allocate(root)
            .unwrap();
        assert_eq!(assignment.len(), 3);
        for node in [or, not, down] {
            assert_eq!(assignment.register(node), Some(3));
        }
    }
}
