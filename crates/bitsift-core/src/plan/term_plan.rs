//! Term plan conversion: bind term leaves to plan rows
//!
//! A document matches a term when every row of the term has its bit set, so
//! each term becomes an `And` of its rows. The i-th row of rank `r` of a term
//! is the same plan row in every shard; shards whose rank profile lacks that
//! position are padded with their match-all row at rank `r`.

use std::collections::BTreeMap;

use crate::arena::Arena;
use crate::config::{PlannerConfig, UnresolvedTermPolicy};
use crate::error::{Error, Result};
use crate::index::{IndexView, SystemRow};
use crate::plan::row_plan::{PlanRows, RowMatchNode, RowNodeId, RowPlan, validate_row_tree};
use crate::row::{Rank, RowId, ShardId};
use crate::term::{Term, TermMatchNode};

/// Converts a term tree into a row tree and its plan row catalog
pub struct TermPlanConverter<'a> {
    index: &'a dyn IndexView,
    policy: UnresolvedTermPolicy,
    filter_inactive_documents: bool,
}

impl<'a> TermPlanConverter<'a> {
    /// Converter over `index` using the binding options of `config`
    pub fn new(index: &'a dyn IndexView, config: &PlannerConfig) -> Self {
        Self {
            index,
            policy: config.unresolved_term_policy,
            filter_inactive_documents: config.filter_inactive_documents,
        }
    }

    /// Build the row plan for `tree`, allocating row nodes in `arena`
    pub fn build_row_plan(
        &self,
        tree: &TermMatchNode,
        arena: &mut Arena<RowMatchNode>,
    ) -> Result<RowPlan> {
        let shard_count = self.index.shard_count();
        if shard_count == 0 {
            return Err(Error::index_inconsistency("index has no shards"));
        }

        let mut rows = PlanRows::new(shard_count);
        let mut body = self.convert(tree, &mut rows, arena)?;

        if self.filter_inactive_documents {
            let active = (0..shard_count)
                .map(|shard| self.index.system_row(shard, SystemRow::DocumentActive, 0))
                .collect();
            let active = arena.alloc(RowMatchNode::Row(rows.add(active)?))?;
            body = arena.alloc(RowMatchNode::And(vec![body, active]))?;
        }

        let root = arena.alloc(RowMatchNode::Report(Some(body)))?;
        validate_row_tree(arena, root)?;
        tracing::trace!(plan_rows = rows.len(), "Built row plan");
        Ok(RowPlan { rows, root })
    }

    fn convert(
        &self,
        node: &TermMatchNode,
        rows: &mut PlanRows,
        arena: &mut Arena<RowMatchNode>,
    ) -> Result<RowNodeId> {
        match node {
            TermMatchNode::And(children) | TermMatchNode::Or(children) => {
                if children.is_empty() {
                    return Err(Error::malformed(format!("empty operator in {}", node)));
                }
                let converted = children
                    .iter()
                    .map(|child| self.convert(child, rows, arena))
                    .collect::<Result<Vec<_>>>()?;
                let node = match node {
                    TermMatchNode::And(_) => RowMatchNode::And(converted),
                    _ => RowMatchNode::Or(converted),
                };
                arena.alloc(node)
            }
            TermMatchNode::Not(child) => {
                let child = self.convert(child, rows, arena)?;
                arena.alloc(RowMatchNode::Not(child))
            }
            TermMatchNode::Term(term) => self.bind_term(term, rows, arena),
        }
    }

    fn bind_term(
        &self,
        term: &Term,
        rows: &mut PlanRows,
        arena: &mut Arena<RowMatchNode>,
    ) -> Result<RowNodeId> {
        let shard_count = rows.shard_count();
        let mut profiles: Vec<BTreeMap<Rank, Vec<RowId>>> = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            profiles.push(self.shard_profile(term, shard)?);
        }

        let mut positions: BTreeMap<Rank, usize> = BTreeMap::new();
        for profile in &profiles {
            for (&rank, shard_rows) in profile {
                let count = positions.entry(rank).or_default();
                *count = (*count).max(shard_rows.len());
            }
        }

        let mut leaves = Vec::new();
        for (&rank, &count) in positions.iter().rev() {
            for position in 0..count {
                let physical = profiles
                    .iter()
                    .enumerate()
                    .map(|(shard, profile)| {
                        profile
                            .get(&rank)
                            .and_then(|r| r.get(position))
                            .copied()
                            .unwrap_or_else(|| {
                                self.index.system_row(shard, SystemRow::MatchAll, rank)
                            })
                    })
                    .collect();
                let row = rows.add(physical)?;
                leaves.push(arena.alloc(RowMatchNode::Row(row))?);
            }
        }

        match leaves.len() {
            1 => Ok(leaves[0]),
            _ => arena.alloc(RowMatchNode::And(leaves)),
        }
    }

    /// Rows of `term` in `shard` grouped by rank
    fn shard_profile(&self, term: &Term, shard: ShardId) -> Result<BTreeMap<Rank, Vec<RowId>>> {
        let mut resolved = self.index.resolve_term(term, shard);
        if resolved.is_empty() {
            match self.policy {
                UnresolvedTermPolicy::MatchNone => {
                    tracing::debug!(%term, shard, "Unresolved term bound to match-none row");
                    resolved.push(self.index.system_row(shard, SystemRow::MatchNone, 0));
                }
                UnresolvedTermPolicy::Reject => {
                    return Err(Error::NoMatchPossible {
                        term: term.to_string(),
                        shard,
                    });
                }
            }
        }

        let max_rank = self.index.max_rank();
        let mut profile: BTreeMap<Rank, Vec<RowId>> = BTreeMap::new();
        for row in resolved {
            if row.shard != shard || row.rank > max_rank {
                return Err(Error::index_inconsistency(format!(
                    "term {} resolved to {} in shard {}",
                    term, row, shard
                )));
            }
            profile.entry(row.rank).or_default().push(row);
        }
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::row::AbstractRow;

    fn config(filter: bool) -> PlannerConfig {
        PlannerConfig {
            filter_inactive_documents: filter,
            ..PlannerConfig::default()
        }
    }

    fn leaf_rows(arena: &Arena<RowMatchNode>, id: RowNodeId) -> Vec<AbstractRow> {
        match arena.get(id) {
            RowMatchNode::Row(row) => vec![*row],
            node => node
                .children()
                .iter()
                .flat_map(|&c| leaf_rows(arena, c))
                .collect(),
        }
    }

    #[test]
    fn test_term_becomes_and_of_rows() {
        let index = MemoryIndex::new(1, 1024).unwrap();
        let term = Term::new("apple");
        index
            .assign_term(&term, &[RowId::new(0, 0, 9), RowId::new(0, 2, 5)])
            .unwrap();

        let mut arena = Arena::with_capacity(32);
        let plan = TermPlanConverter::new(&index, &config(false))
            .build_row_plan(&TermMatchNode::Term(term), &mut arena)
            .unwrap();

        let RowMatchNode::Report(Some(body)) = arena.get(plan.root) else {
            panic!("root must be a Report");
        };
        assert!(matches!(arena.get(*body), RowMatchNode::And(c) if c.len() == 2));
        let ranks: Vec<Rank> = leaf_rows(&arena, *body).iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![2, 0]);
        assert_eq!(plan.rows.len(), 2);
    }

    #[test]
    fn test_structure_preserved_and_rows_shared() {
        let index = MemoryIndex::new(1, 1024).unwrap();
        for (i, name) in ["a", "b"].iter().enumerate() {
            index
                .assign_term(&Term::new(*name), &[RowId::new(0, 0, 10 + i as u32)])
                .unwrap();
        }
        let query = TermMatchNode::or(vec![
            TermMatchNode::term("a"),
            TermMatchNode::negate(TermMatchNode::and(vec![
                TermMatchNode::term("b"),
                TermMatchNode::term("a"),
            ])),
        ]);

        let mut arena = Arena::with_capacity(32);
        let plan = TermPlanConverter::new(&index, &config(false))
            .build_row_plan(&query, &mut arena)
            .unwrap();

        let RowMatchNode::Report(Some(body)) = arena.get(plan.root) else {
            panic!("root must be a Report");
        };
        let RowMatchNode::Or(children) = arena.get(*body) else {
            panic!("Or expected");
        };
        assert!(matches!(arena.get(children[1]), RowMatchNode::Not(_)));
        assert_eq!(plan.rows.len(), 2);
        assert_eq!(leaf_rows(&arena, *body).len(), 3);
    }

    #[test]
    fn test_unresolved_term_binds_match_none() {
        let index = MemoryIndex::new(2, 256).unwrap();
        let term = Term::new("rare");
        index.assign_term(&term, &[RowId::new(1, 0, 7)]).unwrap();

        let mut arena = Arena::with_capacity(32);
        let plan = TermPlanConverter::new(&index, &config(false))
            .build_row_plan(&TermMatchNode::Term(term), &mut arena)
            .unwrap();

        assert_eq!(plan.rows.len(), 1);
        let id = crate::row::PlanRowId(0);
        assert_eq!(
            plan.rows.physical(0, id),
            Some(index.system_row(0, SystemRow::MatchNone, 0))
        );
        assert_eq!(plan.rows.physical(1, id), Some(RowId::new(1, 0, 7)));
    }

    #[test]
    fn test_unresolved_term_rejected() {
        let index = MemoryIndex::new(1, 256).unwrap();
        let config = PlannerConfig {
            unresolved_term_policy: UnresolvedTermPolicy::Reject,
            ..PlannerConfig::default()
        };

        let mut arena = Arena::with_capacity(32);
        let err = TermPlanConverter::new(&index, &config)
            .build_row_plan(&TermMatchNode::term("ghost"), &mut arena)
            .unwrap_err();
        assert!(matches!(err, Error::NoMatchPossible { shard: 0, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_rank_profile_mismatch_padded_with_match_all() {
        let index = MemoryIndex::new(2, 1024).unwrap();
        let term = Term::new("uneven");
        index
            .assign_term(
                &term,
                &[RowId::new(0, 3, 4), RowId::new(0, 0, 4), RowId::new(1, 0, 8)],
            )
            .unwrap();

        let mut arena = Arena::with_capacity(32);
        let plan = TermPlanConverter::new(&index, &config(false))
            .build_row_plan(&TermMatchNode::Term(term), &mut arena)
            .unwrap();

        let coarse = crate::row::PlanRowId(0);
        assert_eq!(plan.rows.rank(coarse), Some(3));
        assert_eq!(
            plan.rows.physical(1, coarse),
            Some(index.system_row(1, SystemRow::MatchAll, 3))
        );
    }

    #[test]
    fn test_document_active_row_added() {
        let index = MemoryIndex::new(1, 256).unwrap();
        index
            .assign_term(&Term::new("a"), &[RowId::new(0, 0, 5)])
            .unwrap();

        let mut arena = Arena::with_capacity(32);
        let plan = TermPlanConverter::new(&index, &config(true))
            .build_row_plan(&TermMatchNode::term("a"), &mut arena)
            .unwrap();

        let active = index.system_row(0, SystemRow::DocumentActive, 0);
        assert!(plan.rows.iter().any(|(_, physical)| physical == [active]));
        let RowMatchNode::Report(Some(body)) = arena.get(plan.root) else {
            panic!("root must be a Report");
        };
        assert!(matches!(arena.get(*body), RowMatchNode::And(c) if c.len() == 2));
    }

    #[test]
    fn test_empty_operator_is_malformed() {
        let index = MemoryIndex::new(1, 256).unwrap();
        let mut arena = Arena::with_capacity(8);
        let err = TermPlanConverter::new(&index, &config(false))
            .build_row_plan(&TermMatchNode::and(vec![]), &mut arena)
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
