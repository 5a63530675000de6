//! Index layer - what the planner and interpreter need from a row store
//!
//! - [`IndexView`]: term resolution, system rows and row statistics used
//!   while planning
//! - [`RowSource`]: word-level row access used while executing a plan
//! - [`MemoryIndex`]: roaring-bitmap reference store implementing both

pub mod memory;
pub mod term_table;

pub use memory::{DocumentHandle, MemoryIndex, MemoryIndexStats};
pub use term_table::TermTable;

use crate::row::{Rank, RowId, ShardId};
use crate::term::Term;

/// Rows every shard provides at every rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemRow {
    /// All bits set
    MatchAll,
    /// No bits set
    MatchNone,
    /// Bits of documents that are active (not expired)
    DocumentActive,
}

impl SystemRow {
    /// Fixed row index of the system row at every rank
    pub fn index(self) -> u32 {
        match self {
            Self::MatchAll => 0,
            Self::MatchNone => 1,
            Self::DocumentActive => 2,
        }
    }
}

/// Number of row indices reserved for system rows at each rank
pub const SYSTEM_ROW_COUNT: u32 = 3;

/// Read-only view of a sharded row index used during planning
pub trait IndexView: Sync {
    /// Number of shards
    fn shard_count(&self) -> usize;

    /// Highest rank any row of this index has
    fn max_rank(&self) -> Rank;

    /// Rows of `term` in `shard`, highest rank first; empty if unknown
    fn resolve_term(&self, term: &Term, shard: ShardId) -> Vec<RowId>;

    /// Number of physical rows in `shard`
    fn row_count(&self, shard: ShardId) -> usize;

    /// System row of `kind` at `rank` in `shard`
    fn system_row(&self, shard: ShardId, kind: SystemRow, rank: Rank) -> RowId;

    /// Fraction of set bits in `row`, in `[0, 1]`
    fn row_density(&self, row: RowId) -> f64;
}

/// Word-level row access used by the interpreter
pub trait RowSource {
    /// Word `offset` of `row`, zero past the end of the row
    fn row_word(&self, row: RowId, offset: usize) -> u64;

    /// Number of rank 0 words in `shard`
    fn word_count(&self, shard: ShardId) -> usize;

    /// Documents `shard` holds; bits at or past this id in the last word
    /// are padding
    fn document_count(&self, shard: ShardId) -> u64;
}
