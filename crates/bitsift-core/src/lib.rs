//! bitsift core - query compilation for bit-sliced signature indexes
//!
//! A bit-sliced index stores one bitmap ("row") per term hash slot. Rows come
//! in ranks: a rank `r` row folds `2^r` rank 0 words onto one, trading false
//! positives for fewer word reads. This crate turns a boolean term query into
//! a plan that reads as few words as possible while reporting exactly the
//! documents whose rank 0 rows match.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            TermMatchNode (query)             │
//! └──────────────┬───────────────────────────────┘
//!                │ TermPlanConverter
//! ┌──────────────┴───────────────────────────────┐
//! │      RowMatchNode tree + PlanRows catalog    │
//! └──────────────┬───────────────────────────────┘
//!                │ MatchTreeRewriter
//! ┌──────────────┴───────────────────────────────┐
//! │   normalized / cost-rewritten row tree       │
//! └──────────────┬───────────────────────────────┘
//!                │ RankDownCompiler + RegisterAllocator
//! ┌──────────────┴───────────────────────────────┐
//! │   CompileNode tree + register assignment     │
//! └──────────────┬───────────────────────────────┘
//!                │ Backend (ProgramBackend, MatchInterpreter)
//! ┌──────────────┴───────────────────────────────┐
//! │            matching documents                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! [`QueryPlanner`] runs the planning passes; [`backend::execute`] lowers a
//! [`CompiledPlan`] and runs it against a [`RowSource`].

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod backend;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod index;
pub mod plan;
pub mod row;
pub mod term;

pub use backend::{Backend, execute};
pub use config::{PlannerConfig, UnresolvedTermPolicy};
pub use diagnostics::{BufferedDiagnostics, DiagnosticStream, NullDiagnostics, TracingDiagnostics};
pub use error::{Error, Result};
pub use index::{IndexView, MemoryIndex, RowSource, SystemRow};
pub use plan::{CompiledPlan, QueryPlanner};
pub use row::{AbstractRow, PlanRowId, Rank, RowId, ShardId};
pub use term::{StreamId, Term, TermMatchNode};
