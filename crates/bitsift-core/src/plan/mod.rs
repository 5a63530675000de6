//! Query planning passes
//!
//! - [`term_plan`]: bind terms to plan rows
//! - [`rewriter`]: cost-driven boolean rewriting
//! - [`rank_down`]: compile to row operations at working ranks
//! - [`registers`]: accumulator register allocation
//! - [`planner`]: run the passes for a query

pub mod compile;
pub mod format;
pub mod planner;
pub mod rank_down;
pub mod registers;
pub mod rewriter;
pub mod row_plan;
pub mod term_plan;

pub use compile::{CompileNode, CompileNodeId};
pub use format::TreeFormatter;
pub use planner::{CompiledPlan, QueryPlanner};
pub use rank_down::{RankDownCompiler, check_rank_deltas};
pub use registers::{RegisterAllocator, RegisterAssignment};
pub use rewriter::{MatchTreeRewriter, RowDensities, rewrite};
pub use row_plan::{PlanRows, RowMatchNode, RowNodeId, RowPlan};
pub use term_plan::TermPlanConverter;
