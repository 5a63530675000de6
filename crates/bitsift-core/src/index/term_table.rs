//! Term to row assignment for one shard
//!
//! Terms are either assigned explicit rows or, when the table has a hashed
//! profile, spread over a fixed pool of rows per rank by xxh3.

use std::collections::HashMap;

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::index::SYSTEM_ROW_COUNT;
use crate::row::{Rank, RowId, ShardId};
use crate::term::{StreamId, Term};

/// Hashed assignment used for terms without an explicit entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedProfile {
    /// Rank of each row a term gets; a rank may repeat
    pub ranks: Vec<Rank>,
    /// Size of the shared row pool at every rank
    pub rows_per_rank: u32,
}

/// Term to row mapping of one shard
#[derive(Debug, Clone, Default)]
pub struct TermTable {
    explicit: HashMap<(u64, StreamId), Vec<RowId>>,
    hashed: Option<HashedProfile>,
}

impl TermTable {
    /// Table that only knows explicitly assigned terms
    pub fn explicit() -> Self {
        Self::default()
    }

    /// Table that hashes unknown terms into `rows_per_rank` rows at each
    /// rank of `ranks`
    pub fn hashed(ranks: Vec<Rank>, rows_per_rank: u32) -> Self {
        Self {
            explicit: HashMap::new(),
            hashed: Some(HashedProfile {
                ranks,
                rows_per_rank: rows_per_rank.max(1),
            }),
        }
    }

    /// Assign explicit rows to a term, replacing any previous assignment
    pub fn assign(&mut self, term: &Term, rows: Vec<RowId>) {
        self.explicit.insert((term.hash(), term.stream()), rows);
    }

    /// True if the term has an explicit assignment
    pub fn contains(&self, term: &Term) -> bool {
        self.explicit.contains_key(&(term.hash(), term.stream()))
    }

    /// Rows of `term` in `shard`, highest rank first
    pub fn resolve(&self, term: &Term, shard: ShardId) -> Vec<RowId> {
        let mut rows = match self.explicit.get(&(term.hash(), term.stream())) {
            Some(rows) => rows.clone(),
            None => match &self.hashed {
                Some(profile) => Self::hashed_rows(profile, term, shard),
                None => Vec::new(),
            },
        };
        rows.sort_by(|a, b| b.rank.cmp(&a.rank).then(a.index.cmp(&b.index)));
        rows
    }

    /// Largest row index in use at `rank`, if any
    pub fn max_index(&self, rank: Rank) -> Option<u32> {
        let explicit = self
            .explicit
            .values()
            .flatten()
            .filter(|r| r.rank == rank)
            .map(|r| r.index)
            .max();
        let hashed = self.hashed.as_ref().and_then(|p| {
            p.ranks
                .contains(&rank)
                .then(|| SYSTEM_ROW_COUNT + p.rows_per_rank - 1)
        });
        explicit.max(hashed)
    }

    fn hashed_rows(profile: &HashedProfile, term: &Term, shard: ShardId) -> Vec<RowId> {
        let stream = u64::from(term.stream().0);
        profile
            .ranks
            .iter()
            .enumerate()
            .map(|(i, &rank)| {
                let seed = ((i as u64) << 8) | stream;
                let slot = xxh3_64_with_seed(&term.hash().to_le_bytes(), seed)
                    % u64::from(profile.rows_per_rank);
                RowId::new(shard, rank, SYSTEM_ROW_COUNT + slot as u32)
            })
            .collect()
    }
}
