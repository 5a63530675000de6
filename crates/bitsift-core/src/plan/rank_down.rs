//! Rank-down compilation
//!
//! Turns a row tree into a compile tree where every operation runs at an
//! explicit working rank. The root works at rank 0. A subtree whose rows are
//! all coarser than its parent's working rank is evaluated at its own
//! minimum rank under a `RankDown`, so the expansion to the finer rank
//! happens once for the whole subtree and as late as possible.

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::plan::compile::{CompileNode, CompileNodeId};
use crate::plan::row_plan::{RowMatchNode, RowNodeId, validate_row_tree};
use crate::row::Rank;

/// How the children of an `And`/`Or` at some working rank are evaluated
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChildGroups {
    /// Children evaluated together at a coarser rank, with that rank
    pub coarse: Option<(Rank, Vec<usize>)>,
    /// Children evaluated one by one at the working rank, in order
    pub singles: Vec<usize>,
}

/// Split children by minimum rank. Two or more children above
/// `working_rank` share one coarse sub-node; a lone coarse child stays
/// single.
pub(crate) fn group_children(min_ranks: &[Rank], working_rank: Rank) -> ChildGroups {
    let coarse: Vec<usize> = (0..min_ranks.len())
        .filter(|&i| min_ranks[i] > working_rank)
        .collect();
    if coarse.len() < 2 {
        return ChildGroups {
            coarse: None,
            singles: (0..min_ranks.len()).collect(),
        };
    }
    let rank = coarse
        .iter()
        .map(|&i| min_ranks[i])
        .min()
        .unwrap_or(working_rank);
    ChildGroups {
        singles: (0..min_ranks.len())
            .filter(|&i| min_ranks[i] <= working_rank)
            .collect(),
        coarse: Some((rank, coarse)),
    }
}

/// Compiles a rewritten row tree
pub struct RankDownCompiler<'a> {
    rows: &'a Arena<RowMatchNode>,
    root: Option<RowNodeId>,
    /// Minimum row rank below each node, by node index
    min_ranks: Vec<Option<Rank>>,
    /// Maximum row rank below the root
    max_row_rank: Rank,
}

impl<'a> RankDownCompiler<'a> {
    /// Compiler reading row nodes from `rows`
    pub fn new(rows: &'a Arena<RowMatchNode>) -> Self {
        Self {
            rows,
            root: None,
            min_ranks: Vec::new(),
            max_row_rank: 0,
        }
    }

    /// Validate the tree under `root` and record the minimum rank of every
    /// subtree
    pub fn compile(&mut self, root: RowNodeId) -> Result<()> {
        if !matches!(self.rows.get(root), RowMatchNode::Report(_)) {
            return Err(Error::malformed("row tree root must be a Report"));
        }
        validate_row_tree(self.rows, root)?;

        self.min_ranks = vec![None; self.rows.len()];
        self.max_row_rank = 0;
        self.record_ranks(root);
        self.root = Some(root);
        Ok(())
    }

    fn record_ranks(&mut self, id: RowNodeId) -> Rank {
        if let Some(rank) = self.min_ranks[id.index()] {
            return rank;
        }
        let rows = self.rows;
        let node = rows.get(id);
        let rank = match node {
            RowMatchNode::Row(row) => {
                self.max_row_rank = self.max_row_rank.max(row.rank);
                row.rank
            }
            RowMatchNode::Report(None) => 0,
            _ => node
                .children()
                .iter()
                .map(|&child| self.record_ranks(child))
                .min()
                .unwrap_or(0),
        };
        self.min_ranks[id.index()] = Some(rank);
        rank
    }

    fn min_rank(&self, id: RowNodeId) -> Rank {
        self.min_ranks
            .get(id.index())
            .copied()
            .flatten()
            .unwrap_or(0)
    }

    /// Emit the compile tree into `out`. Rows above `max_rank` are a fatal
    /// `RankOutOfRange`.
    pub fn create_tree(
        &self,
        max_rank: Rank,
        out: &mut Arena<CompileNode>,
    ) -> Result<CompileNodeId> {
        let root = self
            .root
            .ok_or_else(|| Error::malformed("create_tree called before compile"))?;
        if self.max_row_rank > max_rank {
            return Err(Error::RankOutOfRange {
                rank: self.max_row_rank,
                max_rank,
            });
        }

        match self.rows.get(root) {
            RowMatchNode::Report(Some(child)) => {
                let child = self.emit_child(*child, 0, out)?;
                out.alloc(CompileNode::Report(Some(child)))
            }
            _ => out.alloc(CompileNode::Report(None)),
        }
    }

    /// Emit `id` under a parent working at `working_rank`
    fn emit_child(
        &self,
        id: RowNodeId,
        working_rank: Rank,
        out: &mut Arena<CompileNode>,
    ) -> Result<CompileNodeId> {
        if let RowMatchNode::Row(row) = self.rows.get(id) {
            return out.alloc(CompileNode::LoadRow {
                row: *row,
                rank_delta: row.rank - working_rank,
            });
        }
        let rank = self.min_rank(id);
        if rank > working_rank {
            let child = self.emit_node(id, rank, out)?;
            out.alloc(CompileNode::RankDown {
                delta: rank - working_rank,
                child,
            })
        } else {
            self.emit_node(id, working_rank, out)
        }
    }

    /// Emit an interior node at `working_rank`
    fn emit_node(
        &self,
        id: RowNodeId,
        working_rank: Rank,
        out: &mut Arena<CompileNode>,
    ) -> Result<CompileNodeId> {
        match self.rows.get(id) {
            RowMatchNode::And(children) => {
                let children = self.emit_operands(children, true, working_rank, out)?;
                out.alloc(CompileNode::And(children))
            }
            RowMatchNode::Or(children) => {
                let children = self.emit_operands(children, false, working_rank, out)?;
                out.alloc(CompileNode::Or(children))
            }
            RowMatchNode::Not(child) => {
                let child = self.emit_child(*child, working_rank, out)?;
                out.alloc(CompileNode::Not(child))
            }
            RowMatchNode::Row(_) => self.emit_child(id, working_rank, out),
            RowMatchNode::Report(_) => Err(Error::malformed("Report below the root")),
        }
    }

    fn emit_operands(
        &self,
        children: &[RowNodeId],
        is_and: bool,
        working_rank: Rank,
        out: &mut Arena<CompileNode>,
    ) -> Result<Vec<CompileNodeId>> {
        let ranks: Vec<Rank> = children.iter().map(|&c| self.min_rank(c)).collect();
        let groups = group_children(&ranks, working_rank);

        let mut emitted = Vec::with_capacity(groups.singles.len() + 1);
        if let Some((rank, members)) = &groups.coarse {
            let members: Vec<RowNodeId> = members.iter().map(|&i| children[i]).collect();
            let inner = self.emit_operands(&members, is_and, *rank, out)?;
            let inner = out.alloc(if is_and {
                CompileNode::And(inner)
            } else {
                CompileNode::Or(inner)
            })?;
            emitted.push(out.alloc(CompileNode::RankDown {
                delta: rank - working_rank,
                child: inner,
            })?);
        }
        for &i in &groups.singles {
            emitted.push(self.emit_child(children[i], working_rank, out)?);
        }
        Ok(emitted)
    }
}

/// Verify that every `LoadRow` under `root` satisfies
/// `rank_delta == row.rank - working_rank`, returning the number of loads
pub fn check_rank_deltas(arena: &Arena<CompileNode>, root: CompileNodeId) -> Result<usize> {
    let mut loads = 0;
    let mut stack = vec![(root, 0 as Rank)];
    while let Some((id, working_rank)) = stack.pop() {
        match arena.get(id) {
            CompileNode::LoadRow { row, rank_delta } => {
                if row.rank < working_rank || row.rank - working_rank != *rank_delta {
                    return Err(Error::malformed(format!(
                        "LoadRow({}, {}) at working rank {}",
                        row, rank_delta, working_rank
                    )));
                }
                loads += 1;
            }
            CompileNode::RankDown { delta, child } => {
                stack.push((*child, working_rank + delta));
            }
            node => {
                for &child in node.children() {
                    stack.push((child, working_rank));
                }
            }
        }
    }
    Ok(loads)
}
