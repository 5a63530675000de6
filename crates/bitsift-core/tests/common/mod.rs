//! Shared fixtures for integration tests

#![allow(dead_code)]

use bitsift_core::index::{IndexView, MemoryIndex, SystemRow};
use bitsift_core::{Result, RowId, ShardId, Term, TermMatchNode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Vocabulary of the random corpus
pub const TERMS: [&str; 6] = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"];

/// Documents per shard of the random corpus
pub const DOCS_PER_SHARD: u64 = 512;

/// Number of shards of the random corpus
pub const SHARDS: usize = 2;

/// Route test logs through tracing; repeated calls are harmless
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a corpus from `seed`: every term gets a random rank profile per
/// shard, random postings, and random documents are active.
pub fn random_index(seed: u64) -> Result<MemoryIndex> {
    let mut rng = StdRng::seed_from_u64(seed);
    let index = MemoryIndex::new(SHARDS, DOCS_PER_SHARD)?;

    for (t, name) in TERMS.iter().enumerate() {
        let mut rows = Vec::new();
        for shard in 0..SHARDS {
            // Rank 0 is optional so coarse-only terms occur.
            for rank in [3u8, 2, 1, 0] {
                if rng.gen_bool(0.4) || (rank == 0 && rows.iter().all(|r: &RowId| r.shard != shard))
                {
                    rows.push(RowId::new(shard, rank, 3 + t as u32));
                }
            }
        }
        index.assign_term(&Term::new(*name), &rows)?;
    }

    for shard in 0..SHARDS {
        for doc in 0..DOCS_PER_SHARD {
            let handle = index.document(shard, doc)?;
            for name in TERMS {
                if rng.gen_bool(0.15) {
                    handle.add_posting(&Term::new(name))?;
                }
            }
            if rng.gen_bool(0.8) {
                handle.activate()?;
            }
        }
    }
    Ok(index)
}

/// Evaluate `query` document by document, without planning
pub fn direct_matches(
    index: &MemoryIndex,
    query: &TermMatchNode,
    filter_inactive_documents: bool,
) -> Vec<(ShardId, u64)> {
    let mut matches = Vec::new();
    for shard in 0..index.shard_count() {
        let active = index.system_row(shard, SystemRow::DocumentActive, 0);
        for doc in 0..index.capacity(shard) {
            if filter_inactive_documents && !index.contains(active, doc) {
                continue;
            }
            if evaluate(index, query, shard, doc) {
                matches.push((shard, doc));
            }
        }
    }
    matches
}

fn evaluate(index: &MemoryIndex, node: &TermMatchNode, shard: ShardId, doc: u64) -> bool {
    match node {
        TermMatchNode::And(children) => children.iter().all(|c| evaluate(index, c, shard, doc)),
        TermMatchNode::Or(children) => children.iter().any(|c| evaluate(index, c, shard, doc)),
        TermMatchNode::Not(child) => !evaluate(index, child, shard, doc),
        TermMatchNode::Term(term) => {
            let rows = index.resolve_term(term, shard);
            !rows.is_empty() && rows.iter().all(|&row| index.contains(row, doc))
        }
    }
}
