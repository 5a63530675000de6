//! Execution backends
//!
//! A backend consumes a [`CompiledPlan`] read-only and turns it into
//! something executable. [`ProgramBackend`] lowers the compile tree to a
//! register-machine [`Program`] that [`MatchInterpreter`] runs against any
//! [`RowSource`](crate::index::RowSource); it is the reference every other
//! backend is tested against.

pub mod interpreter;
pub mod program;

pub use interpreter::MatchInterpreter;
pub use program::{Instruction, Program, ProgramBackend, Register};

use crate::error::Result;
use crate::index::RowSource;
use crate::plan::CompiledPlan;
use crate::row::ShardId;

/// Lowers compiled plans into an executable form
pub trait Backend {
    /// Executable form produced by this backend
    type Output;

    /// Lower `plan`
    fn lower(&self, plan: &CompiledPlan) -> Result<Self::Output>;
}

/// Lower `plan` with [`ProgramBackend`] and run it on every shard of
/// `source`, returning `(shard, document)` pairs in shard then document
/// order
pub fn execute(plan: &CompiledPlan, source: &dyn RowSource) -> Result<Vec<(ShardId, u64)>> {
    let program = ProgramBackend::default().lower(plan)?;
    MatchInterpreter::new(&program, plan.rows()).run(source)
}
