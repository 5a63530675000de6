//! Per-query node arenas
//!
//! Every tree produced by a planning pass lives in an [`Arena`] and refers to
//! its children by [`NodeId`]. Arenas are owned by a [`QueryArena`] that is
//! dropped together with the compiled plan, so no node outlives its query.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::plan::compile::CompileNode;
use crate::plan::row_plan::RowMatchNode;

/// Typed index of a node inside an [`Arena<T>`]
pub struct NodeId<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NodeId<T> {
    fn new(index: u32) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    /// Position of the node in its arena
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for NodeId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodeId<T> {}

impl<T> PartialEq for NodeId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for NodeId<T> {}

impl<T> Hash for NodeId<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for NodeId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Append-only node storage with a fixed node budget
#[derive(Debug, Clone)]
pub struct Arena<T> {
    nodes: Vec<T>,
    capacity: usize,
}

impl<T> Arena<T> {
    /// Create an arena that accepts at most `capacity` nodes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Allocate a node, failing once the budget is spent
    pub fn alloc(&mut self, node: T) -> Result<NodeId<T>> {
        if self.nodes.len() >= self.capacity {
            return Err(Error::ArenaExhausted {
                capacity: self.capacity,
            });
        }
        let id = NodeId::new(self.nodes.len() as u32);
        self.nodes.push(node);
        Ok(id)
    }

    /// Borrow a node
    pub fn get(&self, id: NodeId<T>) -> &T {
        &self.nodes[id.index()]
    }

    /// Number of allocated nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if nothing was allocated
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node budget
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Arenas backing one query's compilation
#[derive(Debug)]
pub struct QueryArena {
    /// Row-level trees (term plan conversion and rewrite output)
    pub rows: Arena<RowMatchNode>,
    /// Compile trees (rank-down output)
    pub compile: Arena<CompileNode>,
}

impl QueryArena {
    /// Create arenas that each accept at most `node_budget` nodes
    pub fn new(node_budget: usize) -> Self {
        Self {
            rows: Arena::with_capacity(node_budget),
            compile: Arena::with_capacity(node_budget),
        }
    }
}
