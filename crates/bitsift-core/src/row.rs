//! Row identifiers and rank geometry
//!
//! A row is a bitmap over the documents of one shard. Rank 0 rows hold one
//! bit per document: document `d` lives at word `d / 64`, bit `d % 64`.
//! A rank `r` row is `2^r` times shorter: document `d` maps to word
//! `(d / 64) >> r`, same bit. Reading a rank `r` row while iterating the
//! words of rank `w` is therefore a right shift of the word offset by
//! `r - w`.

use std::fmt;

/// Granularity level of a row
pub type Rank = u8;

/// Shard index within the corpus
pub type ShardId = usize;

/// Highest rank any row may have
pub const MAX_RANK: Rank = 6;

/// Bits per row word
pub const WORD_BITS: usize = 64;

/// Largest shard capacity whose bits fit a 32-bit row bitmap
pub const MAX_DOCUMENTS_PER_SHARD: u64 = 1 << 32;

/// Physical row address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId {
    /// Shard holding the row
    pub shard: ShardId,
    /// Rank of the row
    pub rank: Rank,
    /// Index among rows of the same shard and rank
    pub index: u32,
}

impl RowId {
    /// Create a row id
    pub fn new(shard: ShardId, rank: Rank, index: u32) -> Self {
        Self { shard, rank, index }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({}, {}, {})", self.shard, self.rank, self.index)
    }
}

/// Logical row id shared by every shard a plan runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanRowId(pub u32);

impl PlanRowId {
    /// Position in the row catalog
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PlanRowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Row reference used by the plan trees: the logical id plus the rank all
/// of its physical rows share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbstractRow {
    /// Logical row id
    pub id: PlanRowId,
    /// Rank of the physical rows behind `id`
    pub rank: Rank,
}

impl AbstractRow {
    /// Create an abstract row
    pub fn new(id: PlanRowId, rank: Rank) -> Self {
        Self { id, rank }
    }
}

impl fmt::Display for AbstractRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.rank)
    }
}

/// Number of words a rank `rank` row needs when rank 0 has `rank0_words`
pub fn words_at_rank(rank0_words: usize, rank: Rank) -> usize {
    let span = 1usize << rank;
    rank0_words.div_ceil(span)
}

/// Word offset and bit of document `doc` in a rank `rank` row
pub fn doc_position(doc: u64, rank: Rank) -> (usize, u32) {
    let word = (doc as usize / WORD_BITS) >> rank;
    let bit = (doc % WORD_BITS as u64) as u32;
    (word, bit)
}

/// Absolute bit index of document `doc` in a rank `rank` row, or `None`
/// past the 32-bit position space of a row bitmap
pub fn doc_bit(doc: u64, rank: Rank) -> Option<u32> {
    let (word, bit) = doc_position(doc, rank);
    let base = u32::try_from(word.checked_mul(WORD_BITS)?).ok()?;
    base.checked_add(bit)
}
