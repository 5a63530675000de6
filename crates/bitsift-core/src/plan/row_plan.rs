//! Row-level trees and the plan row catalog

use std::collections::HashMap;
use std::slice;

use crate::arena::{Arena, NodeId};
use crate::error::{Error, Result};
use crate::row::{AbstractRow, PlanRowId, Rank, RowId, ShardId};

/// Handle of a [`RowMatchNode`]
pub type RowNodeId = NodeId<RowMatchNode>;

/// Boolean tree over abstract rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowMatchNode {
    /// All children match
    And(Vec<RowNodeId>),
    /// Any child matches
    Or(Vec<RowNodeId>),
    /// Child does not match
    Not(RowNodeId),
    /// Bit set in the row
    Row(AbstractRow),
    /// Report the documents matched by the child (every document if none)
    Report(Option<RowNodeId>),
}

impl RowMatchNode {
    /// Children in evaluation order
    pub fn children(&self) -> &[RowNodeId] {
        match self {
            Self::And(children) | Self::Or(children) => children,
            Self::Not(child) | Self::Report(Some(child)) => slice::from_ref(child),
            Self::Row(_) | Self::Report(None) => &[],
        }
    }
}

/// Check structural invariants of a row tree rooted at `root`: `And`/`Or`
/// are non-empty and `Report` only appears at the root
pub fn validate_row_tree(arena: &Arena<RowMatchNode>, root: RowNodeId) -> Result<()> {
    fn walk(arena: &Arena<RowMatchNode>, id: RowNodeId, is_root: bool) -> Result<()> {
        let node = arena.get(id);
        match node {
            RowMatchNode::And(children) | RowMatchNode::Or(children) if children.is_empty() => {
                return Err(Error::malformed(format!("empty {:?} at {:?}", node, id)));
            }
            RowMatchNode::Report(_) if !is_root => {
                return Err(Error::malformed(format!("Report below the root at {:?}", id)));
            }
            _ => {}
        }
        for &child in node.children() {
            walk(arena, child, false)?;
        }
        Ok(())
    }
    walk(arena, root, true)
}

/// Physical rows behind one plan row
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlanRowEntry {
    rank: Rank,
    /// One row per shard, indexed by shard
    physical: Vec<RowId>,
}

/// Catalog mapping `(shard, PlanRowId)` to physical rows
#[derive(Debug, Clone, Default)]
pub struct PlanRows {
    shard_count: usize,
    entries: Vec<PlanRowEntry>,
    lookup: HashMap<Vec<RowId>, PlanRowId>,
}

impl PlanRows {
    /// Empty catalog for `shard_count` shards
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count,
            entries: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    /// Register a plan row given one physical row per shard. Registering
    /// the same rows twice returns the existing plan row.
    pub fn add(&mut self, physical: Vec<RowId>) -> Result<AbstractRow> {
        if physical.len() != self.shard_count {
            return Err(Error::index_inconsistency(format!(
                "plan row needs {} physical rows, got {}",
                self.shard_count,
                physical.len()
            )));
        }
        let Some(rank) = physical.first().map(|r| r.rank) else {
            return Err(Error::index_inconsistency("plan row without shards"));
        };
        for (shard, row) in physical.iter().enumerate() {
            if row.shard != shard || row.rank != rank {
                return Err(Error::index_inconsistency(format!(
                    "{} cannot back a rank {} plan row in shard {}",
                    row, rank, shard
                )));
            }
        }
        if let Some(&id) = self.lookup.get(&physical) {
            return Ok(AbstractRow::new(id, rank));
        }

        let id = PlanRowId(self.entries.len() as u32);
        self.lookup.insert(physical.clone(), id);
        self.entries.push(PlanRowEntry { rank, physical });
        Ok(AbstractRow::new(id, rank))
    }

    /// Number of plan rows
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no row was registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of shards every plan row covers
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Rank of a plan row
    pub fn rank(&self, id: PlanRowId) -> Option<Rank> {
        self.entries.get(id.as_usize()).map(|e| e.rank)
    }

    /// Physical row of `id` in `shard`
    pub fn physical(&self, shard: ShardId, id: PlanRowId) -> Option<RowId> {
        self.entries.get(id.as_usize())?.physical.get(shard).copied()
    }

    /// Plan rows in id order with their physical rows
    pub fn iter(&self) -> impl Iterator<Item = (PlanRowId, &[RowId])> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (PlanRowId(i as u32), e.physical.as_slice()))
    }
}

/// Output of term plan conversion
#[derive(Debug)]
pub struct RowPlan {
    /// Row catalog
    pub rows: PlanRows,
    /// Root of the row tree, always a `Report`
    pub root: RowNodeId,
}
