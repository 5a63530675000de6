//! Error types for bitsift core
//!
//! Errors fall in two classes. Recoverable errors abort the compilation of
//! one query and are reported to the caller ("no results", "query too
//! complex"). Fatal errors mean an index or planner invariant was broken;
//! they are defects and are logged at `error` level before being returned.

use thiserror::Error;

use crate::row::Rank;

/// Result type alias using bitsift Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for query planning and compilation
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unparsable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A term has no rows in a required shard and the planner was asked to
    /// reject such queries instead of compiling a match-nothing plan
    #[error("No match possible: term '{term}' has no rows in shard {shard}")]
    NoMatchPossible {
        /// Display form of the unresolved term
        term: String,
        /// Shard that could not bind the term
        shard: usize,
    },

    /// Register allocation needed more simultaneous accumulators than exist
    #[error("Query too complex: needs {required} live registers, {available} available")]
    RegisterPressure {
        /// Registers that would have been live at the failing point
        required: usize,
        /// Size of the register pool
        available: usize,
    },

    /// The per-query arena ran out of node slots
    #[error("Query too large: arena capacity of {capacity} nodes exhausted")]
    ArenaExhausted {
        /// Arena capacity in nodes
        capacity: usize,
    },

    /// Operation is deliberately not provided by this component
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A row rank exceeds what the backend supports
    #[error("Rank {rank} exceeds maximum rank {max_rank}")]
    RankOutOfRange {
        /// Offending rank
        rank: Rank,
        /// Backend limit
        max_rank: Rank,
    },

    /// A compiled leaf refers to a plan row missing from the row catalog
    #[error("Plan row {id} is not in the row catalog ({row_count} rows)")]
    UnknownPlanRow {
        /// Logical row id referenced by the tree
        id: u32,
        /// Number of rows in the catalog
        row_count: usize,
    },

    /// Structurally invalid boolean tree (empty And/Or, misplaced Report)
    #[error("Malformed tree: {0}")]
    MalformedTree(String),

    /// Index view returned data that breaks a planner invariant
    #[error("Index inconsistency: {0}")]
    IndexInconsistency(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a malformed tree error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedTree(msg.into())
    }

    /// Create an index inconsistency error
    pub fn index_inconsistency(msg: impl Into<String>) -> Self {
        Self::IndexInconsistency(msg.into())
    }

    /// Fatal errors signal a broken invariant rather than a property of the
    /// query; callers should halt loudly instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RankOutOfRange { .. }
                | Self::UnknownPlanRow { .. }
                | Self::MalformedTree(_)
                | Self::IndexInconsistency(_)
        )
    }

    /// True when a simpler rewrite of the same query might compile
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RegisterPressure { .. })
    }
}
