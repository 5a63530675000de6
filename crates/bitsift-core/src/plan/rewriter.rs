//! Cost-driven rewriting of row trees
//!
//! The rewriter normalizes the tree, then repeatedly applies the single
//! `And`-over-`Or` distribution that lowers the estimated cost the most,
//! until no distribution is an improvement or within the row budgets.
//!
//! ## Cost model
//!
//! Costs are expected row-word loads per rank 0 word of the shard. A load
//! at working rank `w` costs `2^-w`, so subtrees the rank-down compiler
//! evaluates at a coarse rank are cheaper. `And` operands after the first
//! are only evaluated while the accumulator is non-zero; with independent
//! rows of density `d_i` the accumulator word is non-zero with probability
//! `1 - (1 - Π d_i)^64`. Densities come from the index through
//! [`RowDensities`]. Operand grouping follows the compiler exactly.

use std::cmp::Ordering;

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::index::IndexView;
use crate::plan::rank_down::group_children;
use crate::plan::row_plan::{PlanRows, RowMatchNode, RowNodeId};
use crate::row::{AbstractRow, PlanRowId, Rank, WORD_BITS};

/// Upper bound on distribution rounds for one rewrite
const MAX_REWRITE_ROUNDS: usize = 1024;

/// Density assumed for rows without an estimate
pub const DEFAULT_DENSITY: f64 = 0.5;

/// Per plan row density estimates
#[derive(Debug, Clone, Default)]
pub struct RowDensities {
    densities: Vec<f64>,
}

impl RowDensities {
    /// Estimates given by plan row id
    pub fn new(densities: Vec<f64>) -> Self {
        Self {
            densities: densities.into_iter().map(clamp_density).collect(),
        }
    }

    /// The same density for `row_count` rows
    pub fn uniform(row_count: usize, density: f64) -> Self {
        Self::new(vec![density; row_count])
    }

    /// Mean density of each plan row over the shards of `index`
    pub fn from_index(rows: &PlanRows, index: &dyn IndexView) -> Self {
        let densities = rows
            .iter()
            .map(|(_, physical)| {
                if physical.is_empty() {
                    return DEFAULT_DENSITY;
                }
                let total: f64 = physical.iter().map(|&row| index.row_density(row)).sum();
                total / physical.len() as f64
            })
            .collect();
        Self::new(densities)
    }

    /// Density of a plan row
    pub fn get(&self, id: PlanRowId) -> f64 {
        self.densities
            .get(id.as_usize())
            .copied()
            .unwrap_or(DEFAULT_DENSITY)
    }
}

fn clamp_density(density: f64) -> f64 {
    if density.is_nan() {
        DEFAULT_DENSITY
    } else {
        density.clamp(0.0, 1.0)
    }
}

/// Owned working form of a row tree body
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Row(AbstractRow),
}

impl Expr {
    fn from_arena(arena: &Arena<RowMatchNode>, id: RowNodeId) -> Result<Self> {
        let children = |ids: &[RowNodeId]| -> Result<Vec<Expr>> {
            if ids.is_empty() {
                return Err(Error::malformed(format!("empty operator at {:?}", id)));
            }
            ids.iter().map(|&c| Self::from_arena(arena, c)).collect()
        };
        match arena.get(id) {
            RowMatchNode::And(ids) => Ok(Self::And(children(ids)?)),
            RowMatchNode::Or(ids) => Ok(Self::Or(children(ids)?)),
            RowMatchNode::Not(child) => Ok(Self::Not(Box::new(Self::from_arena(arena, *child)?))),
            RowMatchNode::Row(row) => Ok(Self::Row(*row)),
            RowMatchNode::Report(_) => Err(Error::malformed("Report below the root")),
        }
    }

    fn emit(&self, arena: &mut Arena<RowMatchNode>) -> Result<RowNodeId> {
        let node = match self {
            Self::And(children) => RowMatchNode::And(Self::emit_all(children, arena)?),
            Self::Or(children) => RowMatchNode::Or(Self::emit_all(children, arena)?),
            Self::Not(child) => RowMatchNode::Not(child.emit(arena)?),
            Self::Row(row) => RowMatchNode::Row(*row),
        };
        arena.alloc(node)
    }

    fn emit_all(children: &[Expr], arena: &mut Arena<RowMatchNode>) -> Result<Vec<RowNodeId>> {
        children.iter().map(|c| c.emit(arena)).collect()
    }

    fn min_rank(&self) -> Rank {
        match self {
            Self::And(children) | Self::Or(children) => {
                children.iter().map(Self::min_rank).min().unwrap_or(0)
            }
            Self::Not(child) => child.min_rank(),
            Self::Row(row) => row.rank,
        }
    }

    fn leaf_count(&self) -> usize {
        match self {
            Self::And(children) | Self::Or(children) => children.iter().map(Self::leaf_count).sum(),
            Self::Not(child) => child.leaf_count(),
            Self::Row(_) => 1,
        }
    }

    fn density(&self, densities: &RowDensities) -> f64 {
        match self {
            Self::And(children) => children.iter().map(|c| c.density(densities)).product(),
            Self::Or(children) => {
                1.0 - children
                    .iter()
                    .map(|c| 1.0 - c.density(densities))
                    .product::<f64>()
            }
            Self::Not(child) => 1.0 - child.density(densities),
            Self::Row(row) => densities.get(row.id),
        }
    }
}

/// A tree with one distribution applied
struct Candidate {
    expr: Expr,
    /// Row leaves of the largest clause the distribution created
    clause_leaves: usize,
}

/// Rewrites row trees under row count budgets
pub struct MatchTreeRewriter<'a> {
    densities: &'a RowDensities,
    target_row_count: usize,
    target_cross_product_term_count: usize,
}

impl<'a> MatchTreeRewriter<'a> {
    /// Rewriter with the given density estimates and budgets
    pub fn new(
        densities: &'a RowDensities,
        target_row_count: usize,
        target_cross_product_term_count: usize,
    ) -> Self {
        Self {
            densities,
            target_row_count,
            target_cross_product_term_count,
        }
    }

    /// Rewrite the tree under the `Report` at `root`, returning the root of
    /// the rewritten tree
    pub fn rewrite(&self, arena: &mut Arena<RowMatchNode>, root: RowNodeId) -> Result<RowNodeId> {
        let body = match arena.get(root) {
            RowMatchNode::Report(Some(body)) => *body,
            RowMatchNode::Report(None) => return Ok(root),
            _ => return Err(Error::malformed("row tree root must be a Report")),
        };

        let input = Expr::from_arena(arena, body)?;
        let leaves_before = input.leaf_count();
        let mut current = self.normalize(input);
        let cost_before = self.cost(&current);
        let mut cost = cost_before;

        let mut rounds = 0;
        while rounds < MAX_REWRITE_ROUNDS {
            let Some((next, next_cost)) = self.best_distribution(&current, cost) else {
                break;
            };
            current = next;
            cost = next_cost;
            rounds += 1;
        }
        if rounds == MAX_REWRITE_ROUNDS {
            tracing::warn!("Rewrite stopped after {} rounds", rounds);
        }

        tracing::debug!(
            rounds,
            leaves_before,
            leaves_after = current.leaf_count(),
            cost_before,
            cost_after = cost,
            "Rewrote row tree"
        );

        let body = current.emit(arena)?;
        arena.alloc(RowMatchNode::Report(Some(body)))
    }

    /// Estimated cost of the tree under the `Report` at `root`
    pub fn estimate_cost(&self, arena: &Arena<RowMatchNode>, root: RowNodeId) -> Result<f64> {
        match arena.get(root) {
            RowMatchNode::Report(Some(body)) => Ok(self.cost(&Expr::from_arena(arena, *body)?)),
            RowMatchNode::Report(None) => Ok(0.0),
            _ => Err(Error::malformed("row tree root must be a Report")),
        }
    }

    /// Flatten, collapse, drop double negation, deduplicate and sort
    fn normalize(&self, expr: Expr) -> Expr {
        match expr {
            Expr::Row(_) => expr,
            Expr::Not(child) => match self.normalize(*child) {
                Expr::Not(inner) => *inner,
                other => Expr::Not(Box::new(other)),
            },
            Expr::And(children) => self.normalize_operator(true, children),
            Expr::Or(children) => self.normalize_operator(false, children),
        }
    }

    fn normalize_operator(&self, is_and: bool, children: Vec<Expr>) -> Expr {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match self.normalize(child) {
                Expr::And(grand) if is_and => flat.extend(grand),
                Expr::Or(grand) if !is_and => flat.extend(grand),
                other => flat.push(other),
            }
        }

        let mut keyed: Vec<(Rank, f64, Expr)> = flat
            .into_iter()
            .map(|e| (e.min_rank(), e.density(self.densities), e))
            .collect();
        keyed.sort_by(|(rank_a, density_a, a), (rank_b, density_b, b)| {
            rank_b
                .cmp(rank_a)
                .then_with(|| {
                    if is_and {
                        density_a.total_cmp(density_b)
                    } else {
                        density_b.total_cmp(density_a)
                    }
                })
                .then_with(|| a.cmp(b))
        });
        let mut operands: Vec<Expr> = keyed.into_iter().map(|(_, _, e)| e).collect();
        operands.dedup();

        match (operands.len(), is_and) {
            (1, _) => operands.remove(0),
            (_, true) => Expr::And(operands),
            (_, false) => Expr::Or(operands),
        }
    }

    fn best_distribution(&self, current: &Expr, cost: f64) -> Option<(Expr, f64)> {
        let mut best: Option<(Expr, f64)> = None;
        for candidate in distributions(current) {
            if candidate.clause_leaves > self.target_cross_product_term_count {
                continue;
            }
            let expr = self.normalize(candidate.expr);
            if expr.leaf_count() > self.target_row_count {
                continue;
            }
            let candidate_cost = self.cost(&expr);
            let bound = best.as_ref().map_or(cost, |(_, c)| *c);
            if is_improvement(candidate_cost, bound) {
                best = Some((expr, candidate_cost));
            }
        }
        best
    }

    fn cost(&self, body: &Expr) -> f64 {
        self.cost_child(body, 0)
    }

    fn cost_child(&self, expr: &Expr, working_rank: Rank) -> f64 {
        match expr {
            Expr::Row(_) => load_cost(working_rank),
            _ => self.cost_node(expr, expr.min_rank().max(working_rank)),
        }
    }

    fn cost_node(&self, expr: &Expr, working_rank: Rank) -> f64 {
        match expr {
            Expr::Row(_) => load_cost(working_rank),
            Expr::Not(child) => self.cost_child(child, working_rank),
            Expr::And(children) => {
                let operands: Vec<&Expr> = children.iter().collect();
                self.cost_operands(true, &operands, working_rank)
            }
            Expr::Or(children) => {
                let operands: Vec<&Expr> = children.iter().collect();
                self.cost_operands(false, &operands, working_rank)
            }
        }
    }

    fn cost_operands(&self, is_and: bool, operands: &[&Expr], working_rank: Rank) -> f64 {
        let ranks: Vec<Rank> = operands.iter().map(|e| e.min_rank()).collect();
        let groups = group_children(&ranks, working_rank);

        // (cost, density) of each evaluation unit in emission order
        let mut units = Vec::with_capacity(groups.singles.len() + 1);
        if let Some((rank, members)) = &groups.coarse {
            let members: Vec<&Expr> = members.iter().map(|&i| operands[i]).collect();
            let density = combine_density(is_and, members.iter().map(|e| e.density(self.densities)));
            units.push((self.cost_operands(is_and, &members, *rank), density));
        }
        for &i in &groups.singles {
            let operand = operands[i];
            units.push((
                self.cost_child(operand, working_rank),
                operand.density(self.densities),
            ));
        }

        if !is_and {
            return units.iter().map(|(cost, _)| cost).sum();
        }
        let mut total = 0.0;
        let mut accumulated = 1.0;
        for (cost, density) in units {
            total += cost * nonzero_probability(accumulated);
            accumulated *= density;
        }
        total
    }
}

/// Rewrite the tree under the `Report` at `root`
pub fn rewrite(
    arena: &mut Arena<RowMatchNode>,
    root: RowNodeId,
    target_row_count: usize,
    target_cross_product_term_count: usize,
    densities: &RowDensities,
) -> Result<RowNodeId> {
    MatchTreeRewriter::new(densities, target_row_count, target_cross_product_term_count)
        .rewrite(arena, root)
}

fn load_cost(working_rank: Rank) -> f64 {
    1.0 / (1u64 << working_rank) as f64
}

fn nonzero_probability(density: f64) -> f64 {
    if density >= 1.0 {
        1.0
    } else {
        1.0 - (1.0 - density).powi(WORD_BITS as i32)
    }
}

fn combine_density(is_and: bool, densities: impl Iterator<Item = f64>) -> f64 {
    if is_and {
        densities.product()
    } else {
        1.0 - densities.map(|d| 1.0 - d).product::<f64>()
    }
}

fn is_improvement(candidate: f64, bound: f64) -> bool {
    let epsilon = 1e-12 * bound.abs().max(1.0);
    candidate.partial_cmp(&(bound - epsilon)) == Some(Ordering::Less)
}

/// Every tree obtained from `expr` by distributing one `And` over one of its
/// `Or` operands
fn distributions(expr: &Expr) -> Vec<Candidate> {
    let mut out = Vec::new();
    match expr {
        Expr::And(children) => {
            for (j, child) in children.iter().enumerate() {
                let Expr::Or(alternatives) = child else {
                    continue;
                };
                let rest: Vec<Expr> = children
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| i != j)
                    .map(|(_, c)| c.clone())
                    .collect();
                let rest_leaves: usize = rest.iter().map(Expr::leaf_count).sum();
                let widest = alternatives.iter().map(Expr::leaf_count).max().unwrap_or(0);
                let clauses = alternatives
                    .iter()
                    .map(|alternative| {
                        let mut clause = rest.clone();
                        clause.push(alternative.clone());
                        Expr::And(clause)
                    })
                    .collect();
                out.push(Candidate {
                    expr: Expr::Or(clauses),
                    clause_leaves: rest_leaves + widest,
                });
            }
            push_child_variants(children, Expr::And, &mut out);
        }
        Expr::Or(children) => push_child_variants(children, Expr::Or, &mut out),
        Expr::Not(child) => {
            for candidate in distributions(child) {
                out.push(Candidate {
                    expr: Expr::Not(Box::new(candidate.expr)),
                    clause_leaves: candidate.clause_leaves,
                });
            }
        }
        Expr::Row(_) => {}
    }
    out
}

fn push_child_variants(children: &[Expr], wrap: fn(Vec<Expr>) -> Expr, out: &mut Vec<Candidate>) {
    for (i, child) in children.iter().enumerate() {
        for candidate in distributions(child) {
            let mut replaced = children.to_vec();
            replaced[i] = candidate.expr;
            out.push(Candidate {
                expr: wrap(replaced),
                clause_leaves: candidate.clause_leaves,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::format::TreeFormatter;

    struct Fixture {
        arena: Arena<RowMatchNode>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                arena: Arena::with_capacity(512),
            }
        }

        fn row(&mut self, id: u32, rank: Rank) -> RowNodeId {
            self.arena
                .alloc(RowMatchNode::Row(AbstractRow::new(PlanRowId(id), rank)))
                .unwrap()
        }

        fn node(&mut self, node: RowMatchNode) -> RowNodeId {
            self.arena.alloc(node).unwrap()
        }

        fn report(&mut self, body: RowNodeId) -> RowNodeId {
            self.node(RowMatchNode::Report(Some(body)))
        }

        fn render(&self, root: RowNodeId) -> String {
            TreeFormatter::new(&self.arena, root).to_string()
        }
    }

    #[test]
    fn test_normalization() {
        let mut f = Fixture::new();
        let a = f.row(0, 0);
        let b = f.row(1, 0);
        let a2 = f.row(0, 0);
        let inner = f.node(RowMatchNode::And(vec![b, a2]));
        let not = f.node(RowMatchNode::Not(a));
        let not_not = f.node(RowMatchNode::Not(not));
        let single = f.node(RowMatchNode::Or(vec![not_not]));
        let and = f.node(RowMatchNode::And(vec![single, inner]));
        let root = f.report(and);

        let densities = RowDensities::new(vec![0.2, 0.1]);
        let rewritten = rewrite(&mut f.arena, root, 100, 180, &densities).unwrap();

        // Flattened, deduplicated, sparsest operand first.
        assert_eq!(
            f.render(rewritten),
            "Report\n  And\n    Row(r1@0)\n    Row(r0@0)\n"
        );
    }

    #[test]
    fn test_or_sorted_densest_first_and_coarse_first() {
        let mut f = Fixture::new();
        let a = f.row(0, 0);
        let b = f.row(1, 0);
        let c = f.row(2, 3);
        let or = f.node(RowMatchNode::Or(vec![a, b, c]));
        let root = f.report(or);

        let densities = RowDensities::new(vec![0.1, 0.4, 0.01]);
        let rewritten = rewrite(&mut f.arena, root, 100, 180, &densities).unwrap();
        assert_eq!(
            f.render(rewritten),
            "Report\n  Or\n    Row(r2@3)\n    Row(r1@0)\n    Row(r0@0)\n"
        );
    }

    fn coarse_fixture(f: &mut Fixture) -> RowNodeId {
        // And(x@3, y@3, Or(p@0, q@3))
        let x = f.row(0, 3);
        let y = f.row(1, 3);
        let p = f.row(2, 0);
        let q = f.row(3, 3);
        let or = f.node(RowMatchNode::Or(vec![p, q]));
        let and = f.node(RowMatchNode::And(vec![x, y, or]));
        f.report(and)
    }

    #[test]
    fn test_distribution_accepted_when_cheaper() {
        let mut f = Fixture::new();
        let root = coarse_fixture(&mut f);
        let densities = RowDensities::uniform(4, 0.5);
        let rewriter = MatchTreeRewriter::new(&densities, 100, 180);

        let before = rewriter.estimate_cost(&f.arena, root).unwrap();
        let rewritten = rewriter.rewrite(&mut f.arena, root).unwrap();
        let after = rewriter.estimate_cost(&f.arena, rewritten).unwrap();

        assert!(after < before);
        let RowMatchNode::Report(Some(body)) = f.arena.get(rewritten) else {
            panic!("Report expected");
        };
        let RowMatchNode::Or(clauses) = f.arena.get(*body) else {
            panic!("distribution should produce an Or of clauses");
        };
        assert_eq!(clauses.len(), 2);
        for &clause in clauses {
            assert!(matches!(f.arena.get(clause), RowMatchNode::And(c) if c.len() == 3));
        }
    }

    #[test]
    fn test_distribution_respects_row_budgets() {
        let densities = RowDensities::uniform(4, 0.5);

        let mut f = Fixture::new();
        let root = coarse_fixture(&mut f);
        let rewritten = rewrite(&mut f.arena, root, 5, 180, &densities).unwrap();
        assert!(f.render(rewritten).starts_with("Report\n  And\n"));

        let mut f = Fixture::new();
        let root = coarse_fixture(&mut f);
        let rewritten = rewrite(&mut f.arena, root, 100, 2, &densities).unwrap();
        assert!(f.render(rewritten).starts_with("Report\n  And\n"));
    }

    #[test]
    fn test_rewrite_is_idempotent_and_deterministic() {
        let densities = RowDensities::uniform(4, 0.5);

        let mut first = Fixture::new();
        let root = coarse_fixture(&mut first);
        let once = rewrite(&mut first.arena, root, 100, 180, &densities).unwrap();
        let twice = rewrite(&mut first.arena, once, 100, 180, &densities).unwrap();
        assert_eq!(first.render(once), first.render(twice));

        let mut second = Fixture::new();
        let root = coarse_fixture(&mut second);
        let again = rewrite(&mut second.arena, root, 100, 180, &densities).unwrap();
        assert_eq!(first.render(once), second.render(again));
    }

    #[test]
    fn test_flat_distribution_rejected() {
        // Sharing a dense operand across sparse alternatives costs more loads
        // at a single rank.
        let mut f = Fixture::new();
        let a = f.row(0, 0);
        let b = f.row(1, 0);
        let c = f.row(2, 0);
        let or = f.node(RowMatchNode::Or(vec![b, c]));
        let and = f.node(RowMatchNode::And(vec![a, or]));
        let root = f.report(and);

        let densities = RowDensities::new(vec![0.9, 0.001, 0.001]);
        let rewritten = rewrite(&mut f.arena, root, 100, 180, &densities).unwrap();
        assert_eq!(
            f.render(rewritten),
            "Report\n  And\n    Or\n      Row(r1@0)\n      Row(r2@0)\n    Row(r0@0)\n"
        );
    }

    #[test]
    fn test_report_without_body_untouched() {
        let mut f = Fixture::new();
        let root = f.node(RowMatchNode::Report(None));
        let densities = RowDensities::default();
        assert_eq!(rewrite(&mut f.arena, root, 10, 10, &densities).unwrap(), root);
    }

    #[test]
    fn test_non_report_root_rejected() {
        let mut f = Fixture::new();
        let a = f.row(0, 0);
        let err = rewrite(&mut f.arena, a, 10, 10, &RowDensities::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_densities_clamped() {
        let densities = RowDensities::new(vec![1.5, -0.2, f64::NAN]);
        assert_eq!(densities.get(PlanRowId(0)), 1.0);
        assert_eq!(densities.get(PlanRowId(1)), 0.0);
        assert_eq!(densities.get(PlanRowId(2)), DEFAULT_DENSITY);
        assert_eq!(densities.get(PlanRowId(9)), DEFAULT_DENSITY);
    }
}
