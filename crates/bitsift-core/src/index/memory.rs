//! In-memory rank-partitioned row store
//!
//! Every shard keeps one roaring bitmap per (rank, row index). A bitmap
//! stores absolute bit positions: document `d` at rank `r` is bit
//! `((d / 64) >> r) * 64 + d % 64`. Row indices below
//! [`SYSTEM_ROW_COUNT`] hold the system rows at every rank.

use parking_lot::RwLock;
use roaring::RoaringBitmap;

use crate::error::{Error, Result};
use crate::index::{IndexView, RowSource, SYSTEM_ROW_COUNT, SystemRow, TermTable};
use crate::row::{
    MAX_DOCUMENTS_PER_SHARD, MAX_RANK, Rank, RowId, ShardId, WORD_BITS, doc_bit, doc_position,
    words_at_rank,
};
use crate::term::Term;

/// Rows and term table of one shard
struct ShardRows {
    capacity: u64,
    word_count: usize,
    /// Indexed by `[rank][row index]`
    rows: Vec<Vec<RoaringBitmap>>,
    terms: TermTable,
}

impl ShardRows {
    fn new(capacity: u64, max_rank: Rank, terms: TermTable) -> Self {
        let word_count = (capacity as usize).div_ceil(WORD_BITS);
        let rows = (0..=max_rank)
            .map(|rank| {
                let mut all = RoaringBitmap::new();
                let bits = words_at_rank(word_count, rank) * WORD_BITS;
                if let Some(last) = bits.checked_sub(1) {
                    all.insert_range(0..=u32::try_from(last).unwrap_or(u32::MAX));
                }
                vec![all, RoaringBitmap::new(), RoaringBitmap::new()]
            })
            .collect();
        Self {
            capacity,
            word_count,
            rows,
            terms,
        }
    }

    fn row(&self, rank: Rank, index: u32) -> Option<&RoaringBitmap> {
        self.rows.get(rank as usize)?.get(index as usize)
    }

    fn row_mut(&mut self, rank: Rank, index: u32) -> Result<&mut RoaringBitmap> {
        let rows = self.rows.get_mut(rank as usize).ok_or(Error::RankOutOfRange {
            rank,
            max_rank: MAX_RANK,
        })?;
        if rows.len() <= index as usize {
            rows.resize_with(index as usize + 1, RoaringBitmap::new);
        }
        Ok(&mut rows[index as usize])
    }

    fn next_free_index(&self, rank: Rank) -> u32 {
        let allocated = self.rows.get(rank as usize).map_or(0, Vec::len) as u32;
        let assigned = self.terms.max_index(rank).map_or(0, |i| i + 1);
        allocated.max(assigned).max(SYSTEM_ROW_COUNT)
    }

    fn is_active(&self, doc: u64) -> bool {
        self.row(0, SystemRow::DocumentActive.index())
            .zip(doc_bit(doc, 0))
            .is_some_and(|(row, bit)| row.contains(bit))
    }
}

/// Bit of a document already checked against its shard's capacity
fn stored_bit(doc: u64, rank: Rank) -> Result<u32> {
    doc_bit(doc, rank).ok_or_else(|| {
        Error::index_inconsistency(format!("document {} has no bit at rank {}", doc, rank))
    })
}

/// Counters kept by [`MemoryIndex`]
#[derive(Debug, Clone, Default)]
pub struct MemoryIndexStats {
    /// Postings added
    pub postings: u64,
    /// Documents currently active
    pub active_documents: u64,
    /// Documents expired
    pub expired_documents: u64,
}

/// Sharded in-memory row index
pub struct MemoryIndex {
    shards: Vec<RwLock<ShardRows>>,
    max_rank: Rank,
    stats: RwLock<MemoryIndexStats>,
}

impl MemoryIndex {
    /// Create an index of `shard_count` shards holding `docs_per_shard`
    /// documents each, with explicit term tables
    pub fn new(shard_count: usize, docs_per_shard: u64) -> Result<Self> {
        Self::with_term_tables(
            (0..shard_count).map(|_| TermTable::explicit()).collect(),
            docs_per_shard,
        )
    }

    /// Create an index with one term table per shard. Fails when
    /// `docs_per_shard` exceeds [`MAX_DOCUMENTS_PER_SHARD`].
    pub fn with_term_tables(tables: Vec<TermTable>, docs_per_shard: u64) -> Result<Self> {
        if docs_per_shard > MAX_DOCUMENTS_PER_SHARD {
            return Err(Error::config(format!(
                "{} documents per shard exceeds the limit of {}",
                docs_per_shard, MAX_DOCUMENTS_PER_SHARD
            )));
        }
        let shards = tables
            .into_iter()
            .map(|terms| RwLock::new(ShardRows::new(docs_per_shard, MAX_RANK, terms)))
            .collect();
        Ok(Self {
            shards,
            max_rank: MAX_RANK,
            stats: RwLock::new(MemoryIndexStats::default()),
        })
    }

    fn shard(&self, shard: ShardId) -> Result<&RwLock<ShardRows>> {
        self.shards.get(shard).ok_or_else(|| {
            Error::index_inconsistency(format!(
                "shard {} out of range ({} shards)",
                shard,
                self.shards.len()
            ))
        })
    }

    /// Assign explicit rows to `term`; rows are grouped by their shard
    pub fn assign_term(&self, term: &Term, rows: &[RowId]) -> Result<()> {
        if let Some(row) = rows.iter().find(|r| r.shard >= self.shards.len()) {
            return Err(Error::index_inconsistency(format!("{} has no shard", row)));
        }
        for (shard_id, lock) in self.shards.iter().enumerate() {
            let shard_rows: Vec<RowId> = rows
                .iter()
                .copied()
                .filter(|r| r.shard == shard_id)
                .collect();
            if shard_rows.is_empty() {
                continue;
            }
            let mut shard = lock.write();
            for row in &shard_rows {
                if row.index < SYSTEM_ROW_COUNT {
                    return Err(Error::index_inconsistency(format!(
                        "{} collides with a system row",
                        row
                    )));
                }
                shard.row_mut(row.rank, row.index)?;
            }
            shard.terms.assign(term, shard_rows);
        }
        Ok(())
    }

    /// Handle for document `doc` of `shard`
    pub fn document(&self, shard: ShardId, doc: u64) -> Result<DocumentHandle<'_>> {
        let capacity = self.shard(shard)?.read().capacity;
        if doc >= capacity {
            return Err(Error::index_inconsistency(format!(
                "document {} exceeds shard capacity {}",
                doc, capacity
            )));
        }
        Ok(DocumentHandle {
            index: self,
            shard,
            doc,
        })
    }

    /// True if `doc`'s bit is set in `row`; false for documents past the
    /// shard's capacity
    pub fn contains(&self, row: RowId, doc: u64) -> bool {
        self.shards.get(row.shard).is_some_and(|lock| {
            let shard = lock.read();
            doc < shard.capacity
                && shard
                    .row(row.rank, row.index)
                    .zip(doc_bit(doc, row.rank))
                    .is_some_and(|(bits, bit)| bits.contains(bit))
        })
    }

    /// Documents per shard
    pub fn capacity(&self, shard: ShardId) -> u64 {
        self.shards.get(shard).map_or(0, |s| s.read().capacity)
    }

    /// Get statistics
    pub fn get_stats(&self) -> MemoryIndexStats {
        self.stats.read().clone()
    }
}

impl IndexView for MemoryIndex {
    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn max_rank(&self) -> Rank {
        self.max_rank
    }

    fn resolve_term(&self, term: &Term, shard: ShardId) -> Vec<RowId> {
        self.shards
            .get(shard)
            .map(|lock| lock.read().terms.resolve(term, shard))
            .unwrap_or_default()
    }

    fn row_count(&self, shard: ShardId) -> usize {
        self.shards
            .get(shard)
            .map_or(0, |lock| lock.read().rows.iter().map(Vec::len).sum())
    }

    fn system_row(&self, shard: ShardId, kind: SystemRow, rank: Rank) -> RowId {
        RowId::new(shard, rank, kind.index())
    }

    fn row_density(&self, row: RowId) -> f64 {
        let Some(lock) = self.shards.get(row.shard) else {
            return 0.0;
        };
        let shard = lock.read();
        let bits = words_at_rank(shard.word_count, row.rank) * WORD_BITS;
        match shard.row(row.rank, row.index) {
            Some(bitmap) if bits > 0 => (bitmap.len() as f64 / bits as f64).min(1.0),
            _ => 0.0,
        }
    }
}

impl RowSource for MemoryIndex {
    fn row_word(&self, row: RowId, offset: usize) -> u64 {
        let Some(lock) = self.shards.get(row.shard) else {
            return 0;
        };
        let shard = lock.read();
        let Some(bitmap) = shard.row(row.rank, row.index) else {
            return 0;
        };
        if offset >= words_at_rank(shard.word_count, row.rank) {
            return 0;
        }
        let Ok(base) = u32::try_from(offset * WORD_BITS) else {
            return 0;
        };
        bitmap
            .range(base..=base.saturating_add(WORD_BITS as u32 - 1))
            .fold(0u64, |word, bit| word | (1u64 << (bit - base)))
    }

    fn word_count(&self, shard: ShardId) -> usize {
        self.shards.get(shard).map_or(0, |s| s.read().word_count)
    }

    fn document_count(&self, shard: ShardId) -> u64 {
        self.capacity(shard)
    }
}

/// Mutable access to one document's bits
pub struct DocumentHandle<'a> {
    index: &'a MemoryIndex,
    shard: ShardId,
    doc: u64,
}

impl DocumentHandle<'_> {
    /// Document id within its shard
    pub fn doc_id(&self) -> u64 {
        self.doc
    }

    /// Shard holding the document
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Set the document's bit in every row of `term`. A term the shard's
    /// table does not know gets a private rank 0 row.
    pub fn add_posting(&self, term: &Term) -> Result<()> {
        let mut shard = self.index.shard(self.shard)?.write();
        let mut rows = shard.terms.resolve(term, self.shard);
        if rows.is_empty() {
            let row = RowId::new(self.shard, 0, shard.next_free_index(0));
            tracing::trace!("Assigning private {} to {}", row, term);
            shard.terms.assign(term, vec![row]);
            rows.push(row);
        }
        for row in rows {
            let bit = stored_bit(self.doc, row.rank)?;
            shard.row_mut(row.rank, row.index)?.insert(bit);
        }
        drop(shard);
        self.index.stats.write().postings += 1;
        Ok(())
    }

    /// Mark the document active at every rank
    pub fn activate(&self) -> Result<()> {
        let mut shard = self.index.shard(self.shard)?.write();
        let was_active = shard.is_active(self.doc);
        for rank in 0..=self.index.max_rank {
            let bit = stored_bit(self.doc, rank)?;
            shard
                .row_mut(rank, SystemRow::DocumentActive.index())?
                .insert(bit);
        }
        drop(shard);
        if !was_active {
            self.index.stats.write().active_documents += 1;
        }
        Ok(())
    }

    /// Clear the document's active bit. Coarse bits stay set while another
    /// active document shares them.
    pub fn expire(&self) -> Result<()> {
        let mut shard = self.index.shard(self.shard)?.write();
        if !shard.is_active(self.doc) {
            return Ok(());
        }
        let active = SystemRow::DocumentActive.index();
        shard.row_mut(0, active)?.remove(stored_bit(self.doc, 0)?);

        let (word0, bit) = doc_position(self.doc, 0);
        for rank in 1..=self.index.max_rank {
            let word = word0 >> rank;
            let first = word << rank;
            let last = ((word + 1) << rank).min(shard.word_count);
            let still_covered = (first..last)
                .map(|w| (w * WORD_BITS) as u64 + u64::from(bit))
                .any(|doc| shard.is_active(doc));
            if !still_covered {
                let bit = stored_bit(self.doc, rank)?;
                shard.row_mut(rank, active)?.remove(bit);
            }
        }
        drop(shard);

        let mut stats = self.index.stats.write();
        stats.active_documents = stats.active_documents.saturating_sub(1);
        stats.expired_documents += 1;
        Ok(())
    }

    /// Variable-size blobs are not stored by this index
    pub fn allocate_variable_size_blob(&self, _slot: usize, _size: usize) -> Result<&mut [u8]> {
        Err(Error::Unsupported("variable-size blob allocation"))
    }

    /// Variable-size blobs are not stored by this index
    pub fn get_variable_size_blob(&self, _slot: usize) -> Result<&[u8]> {
        Err(Error::Unsupported("variable-size blob access"))
    }

    /// Fixed-size blobs are not stored by this index
    pub fn get_fixed_size_blob(&self, _slot: usize) -> Result<&[u8]> {
        Err(Error::Unsupported("fixed-size blob access"))
    }

    /// Facts are not stored by this index
    pub fn assert_fact(&self, _fact: u32, _value: bool) -> Result<()> {
        Err(Error::Unsupported("fact assertion"))
    }
}
