//! Query planner - runs the compilation passes for one query
//!
//! term tree → row plan → rewritten row tree → compile tree → registers
//!
//! Every pass allocates into the [`QueryArena`] owned by the resulting
//! [`CompiledPlan`]; a failed attempt drops its arena.

use std::fmt::Write;

use rayon::prelude::*;

use crate::arena::{Arena, QueryArena};
use crate::config::PlannerConfig;
use crate::diagnostics::{self, DiagnosticStream, TracingDiagnostics};
use crate::error::Result;
use crate::index::IndexView;
use crate::plan::compile::{CompileNode, CompileNodeId};
use crate::plan::format::{TreeFormatter, format_compile_tree, format_plan_rows};
use crate::plan::rank_down::RankDownCompiler;
use crate::plan::registers::{RegisterAllocator, RegisterAssignment};
use crate::plan::rewriter::{MatchTreeRewriter, RowDensities};
use crate::plan::row_plan::{PlanRows, RowMatchNode, RowNodeId};
use crate::plan::term_plan::TermPlanConverter;
use crate::term::TermMatchNode;

/// Everything the execution backend reads for one query
#[derive(Debug)]
pub struct CompiledPlan {
    arena: QueryArena,
    rows: PlanRows,
    row_root: RowNodeId,
    compile_root: CompileNodeId,
    registers: RegisterAssignment,
    attempts: usize,
    target_row_count: usize,
}

impl CompiledPlan {
    /// Plan row catalog
    pub fn rows(&self) -> &PlanRows {
        &self.rows
    }

    /// Arena holding the rewritten row tree
    pub fn row_tree(&self) -> &Arena<RowMatchNode> {
        &self.arena.rows
    }

    /// Root of the rewritten row tree
    pub fn row_root(&self) -> RowNodeId {
        self.row_root
    }

    /// Arena holding the compile tree
    pub fn compile_tree(&self) -> &Arena<CompileNode> {
        &self.arena.compile
    }

    /// Root of the compile tree
    pub fn compile_root(&self) -> CompileNodeId {
        self.compile_root
    }

    /// Register assignment of the compile tree
    pub fn registers(&self) -> &RegisterAssignment {
        &self.registers
    }

    /// Planning attempts it took to fit the register pool
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Row budget the successful attempt was rewritten under
    pub fn target_row_count(&self) -> usize {
        self.target_row_count
    }
}

/// Compiles term trees into executable plans
#[derive(Debug, Clone, Default)]
pub struct QueryPlanner {
    config: PlannerConfig,
}

impl QueryPlanner {
    /// Planner with `config`
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Planner configuration
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Diagnostic stream logging the channels enabled in the configuration
    pub fn tracing_diagnostics(&self) -> TracingDiagnostics {
        TracingDiagnostics::new(self.config.diagnostics.clone())
    }

    /// Compile `query` against `index`. The configuration is validated
    /// first. Register pressure is retried with a halved row budget until
    /// `max_plan_attempts` is spent.
    pub fn plan(
        &self,
        query: &TermMatchNode,
        index: &dyn IndexView,
        diagnostics: &dyn DiagnosticStream,
    ) -> Result<CompiledPlan> {
        self.config.validate()?;
        let span = tracing::debug_span!("plan_query", nodes = query.node_count());
        let _enter = span.enter();

        diagnostics::emit(diagnostics, diagnostics::TERM, |out| writeln!(out, "{}", query));

        let mut target_row_count = self.config.target_row_count;
        let mut attempt = 1;
        loop {
            match self.plan_once(query, index, diagnostics, target_row_count, attempt) {
                Ok(plan) => return Ok(plan),
                Err(err) if err.is_retryable() && attempt < self.config.max_plan_attempts => {
                    tracing::warn!(
                        attempt,
                        target_row_count,
                        "{}; retrying with a smaller row budget",
                        err
                    );
                    target_row_count = (target_row_count / 2).max(1);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_fatal() {
                        tracing::error!("Query planning failed: {}", err);
                    } else {
                        tracing::debug!("Query rejected: {}", err);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Compile many queries in parallel, each with its own arena
    pub fn plan_batch(
        &self,
        queries: &[TermMatchNode],
        index: &dyn IndexView,
        diagnostics: &dyn DiagnosticStream,
    ) -> Vec<Result<CompiledPlan>> {
        queries
            .par_iter()
            .map(|query| self.plan(query, index, diagnostics))
            .collect()
    }

    fn plan_once(
        &self,
        query: &TermMatchNode,
        index: &dyn IndexView,
        diagnostics: &dyn DiagnosticStream,
        target_row_count: usize,
        attempt: usize,
    ) -> Result<CompiledPlan> {
        let config = &self.config;
        let mut arena = QueryArena::new(config.node_budget);

        let row_plan = TermPlanConverter::new(index, config).build_row_plan(query, &mut arena.rows)?;
        diagnostics::emit(diagnostics, diagnostics::ROW, |out| {
            TreeFormatter::new(&arena.rows, row_plan.root).format(out)
        });
        diagnostics::emit(diagnostics, diagnostics::PLAN_ROWS, |out| {
            format_plan_rows(out, &row_plan.rows)
        });

        let densities = RowDensities::from_index(&row_plan.rows, index);
        let row_root = MatchTreeRewriter::new(
            &densities,
            target_row_count,
            config.target_cross_product_term_count,
        )
        .rewrite(&mut arena.rows, row_plan.root)?;
        diagnostics::emit(diagnostics, diagnostics::REWRITE, |out| {
            TreeFormatter::new(&arena.rows, row_root).format(out)
        });

        let mut compiler = RankDownCompiler::new(&arena.rows);
        compiler.compile(row_root)?;
        let compile_root = compiler.create_tree(config.max_rank, &mut arena.compile)?;

        let registers = RegisterAllocator::new(
            &arena.compile,
            row_plan.rows.len(),
            config.register_base,
            config.register_count,
        )
        .allocate(compile_root)?;
        diagnostics::emit(diagnostics, diagnostics::COMPILE, |out| {
            TreeFormatter::new(&arena.compile, compile_root).format(out)
        });
        diagnostics::emit(diagnostics, diagnostics::REGISTERS, |out| {
            format_compile_tree(out, &arena.compile, compile_root, &registers)
        });

        tracing::debug!(
            attempt,
            plan_rows = row_plan.rows.len(),
            row_nodes = arena.rows.len(),
            compile_nodes = arena.compile.len(),
            registers = registers.max_live(),
            "Compiled query"
        );

        Ok(CompiledPlan {
            arena,
            rows: row_plan.rows,
            row_root,
            compile_root,
            registers,
            attempts: attempt,
            target_row_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, ProgramBackend};
    use crate::diagnostics::{BufferedDiagnostics, NullDiagnostics};
    use crate::error::Error;
    use crate::index::MemoryIndex;
    use crate::row::RowId;
    use crate::term::Term;

    fn index() -> MemoryIndex {
        let index = MemoryIndex::new(1, 1024).unwrap();
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            index
                .assign_term(&Term::new(*name), &[RowId::new(0, 0, 10 + i as u32)])
                .unwrap();
        }
        index
    }

    fn nested_query() -> TermMatchNode {
        use TermMatchNode as T;
        T::and(vec![
            T::term("a"),
            T::or(vec![
                T::term("b"),
                T::and(vec![T::term("c"), T::or(vec![T::term("d"), T::term("e")])]),
            ]),
        ])
    }

    #[test]
    fn test_plan_emits_every_channel() {
        let diagnostics = BufferedDiagnostics::all();
        let plan = QueryPlanner::default()
            .plan(&TermMatchNode::term("a"), &index(), &diagnostics)
            .unwrap();

        for channel in [
            diagnostics::TERM,
            diagnostics::ROW,
            diagnostics::PLAN_ROWS,
            diagnostics::REWRITE,
            diagnostics::COMPILE,
            diagnostics::REGISTERS,
        ] {
            assert_eq!(diagnostics.channel(channel).len(), 1, "{}", channel);
        }
        assert_eq!(plan.attempts(), 1);
        // term row + document-active row
        assert_eq!(plan.rows().len(), 2);
    }

    #[test]
    fn test_diagnostics_do_not_change_plan() {
        let planner = QueryPlanner::default();
        let index = index();
        let quiet = planner
            .plan(&nested_query(), &index, &NullDiagnostics)
            .unwrap();
        let loud = planner
            .plan(&nested_query(), &index, &BufferedDiagnostics::all())
            .unwrap();

        let render = |plan: &CompiledPlan| {
            TreeFormatter::new(plan.compile_tree(), plan.compile_root()).to_string()
        };
        assert_eq!(render(&quiet), render(&loud));
    }

    #[test]
    fn test_register_pressure_surfaces_after_retries() {
        use TermMatchNode as T;
        // Two interior operands of one And are live together in any form.
        let query = T::and(vec![
            T::or(vec![T::term("a"), T::term("b")]),
            T::or(vec![T::term("c"), T::term("d")]),
        ]);
        let config = PlannerConfig {
            register_count: 1,
            max_plan_attempts: 3,
            filter_inactive_documents: false,
            ..PlannerConfig::default()
        };
        let err = QueryPlanner::new(config)
            .plan(&query, &index(), &NullDiagnostics)
            .unwrap_err();
        assert!(matches!(err, Error::RegisterPressure { available: 1, .. }));
    }

    #[test]
    fn test_invalid_config_rejected_before_planning() {
        let config = PlannerConfig {
            register_count: 0,
            filter_inactive_documents: false,
            ..PlannerConfig::default()
        };
        let err = QueryPlanner::new(config)
            .plan(&TermMatchNode::term("a"), &index(), &NullDiagnostics)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_lowering_rejects_registers_outside_file() {
        let config = PlannerConfig {
            filter_inactive_documents: false,
            ..PlannerConfig::default()
        };
        let mut plan = QueryPlanner::new(config)
            .plan(&TermMatchNode::term("a"), &index(), &NullDiagnostics)
            .unwrap();
        assert!(ProgramBackend::default().lower(&plan).is_ok());

        // An empty pool leaves no room for the scratch register.
        plan.registers = RegisterAssignment::default();
        let err = ProgramBackend::default().lower(&plan).unwrap_err();
        assert!(matches!(err, Error::MalformedTree(ref msg) if msg.contains("r0")));
    }

    #[test]
    fn test_configured_channels_enabled() {
        let planner = QueryPlanner::new(PlannerConfig {
            diagnostics: vec!["planning/compile".to_string()],
            ..PlannerConfig::default()
        });
        let stream = planner.tracing_diagnostics();
        assert!(stream.is_enabled(diagnostics::COMPILE));
        assert!(!stream.is_enabled(diagnostics::ROW));
        assert!(planner.plan(&nested_query(), &index(), &stream).is_ok());
    }

    #[test]
    fn test_arena_budget_enforced() {
        let config = PlannerConfig {
            node_budget: 3,
            ..PlannerConfig::default()
        };
        let err = QueryPlanner::new(config)
            .plan(&nested_query(), &index(), &NullDiagnostics)
            .unwrap_err();
        assert!(matches!(err, Error::ArenaExhausted { capacity: 3 }));
    }

    #[test]
    fn test_plan_batch_matches_sequential() {
        let planner = QueryPlanner::default();
        let index = index();
        let queries = vec![
            nested_query(),
            TermMatchNode::term("b"),
            TermMatchNode::and(vec![]),
        ];

        let results = planner.plan_batch(&queries, &index, &NullDiagnostics);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(Error::MalformedTree(_))));

        let sequential = planner.plan(&queries[0], &index, &NullDiagnostics).unwrap();
        let batch = results[0].as_ref().unwrap();
        assert_eq!(
            TreeFormatter::new(batch.compile_tree(), batch.compile_root()).to_string(),
            TreeFormatter::new(sequential.compile_tree(), sequential.compile_root()).to_string()
        );
    }
}
