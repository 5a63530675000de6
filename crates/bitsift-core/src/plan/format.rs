//! Indented text rendering of plan trees

use std::fmt::{self, Write};

use crate::arena::{Arena, NodeId};
use crate::plan::compile::{CompileNode, CompileNodeId};
use crate::plan::registers::RegisterAssignment;
use crate::plan::row_plan::{PlanRows, RowMatchNode};

/// Node types the formatter can render
pub trait FormatNode: Sized {
    /// One-line label of the node without its children
    fn label(&self, out: &mut dyn Write) -> fmt::Result;

    /// Children to render below the label
    fn child_ids(&self) -> &[NodeId<Self>];
}

impl FormatNode for RowMatchNode {
    fn label(&self, out: &mut dyn Write) -> fmt::Result {
        match self {
            Self::And(_) => out.write_str("And"),
            Self::Or(_) => out.write_str("Or"),
            Self::Not(_) => out.write_str("Not"),
            Self::Row(row) => write!(out, "Row({})", row),
            Self::Report(_) => out.write_str("Report"),
        }
    }

    fn child_ids(&self) -> &[NodeId<Self>] {
        self.children()
    }
}

impl FormatNode for CompileNode {
    fn label(&self, out: &mut dyn Write) -> fmt::Result {
        match self {
            Self::And(_) => out.write_str("And"),
            Self::Or(_) => out.write_str("Or"),
            Self::Not(_) => out.write_str("Not"),
            Self::LoadRow { row, rank_delta } => write!(out, "LoadRow({}, {})", row, rank_delta),
            Self::RankDown { delta, .. } => write!(out, "RankDown({})", delta),
            Self::Report(_) => out.write_str("Report"),
        }
    }

    fn child_ids(&self) -> &[NodeId<Self>] {
        self.children()
    }
}

/// Renders the tree under `root`, one node per line, two spaces per level
pub struct TreeFormatter<'a, T> {
    arena: &'a Arena<T>,
    root: NodeId<T>,
    annotate: Option<&'a dyn Fn(NodeId<T>) -> Option<usize>>,
}

impl<'a, T: FormatNode> TreeFormatter<'a, T> {
    /// Formatter for the tree under `root`
    pub fn new(arena: &'a Arena<T>, root: NodeId<T>) -> Self {
        Self {
            arena,
            root,
            annotate: None,
        }
    }

    /// Suffix each node with the register `annotate` returns for it
    pub fn with_registers(mut self, annotate: &'a dyn Fn(NodeId<T>) -> Option<usize>) -> Self {
        self.annotate = Some(annotate);
        self
    }

    /// Render into `out`
    pub fn format(&self, out: &mut dyn Write) -> fmt::Result {
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let node = self.arena.get(id);
            for _ in 0..depth {
                out.write_str("  ")?;
            }
            node.label(out)?;
            if let Some(register) = self.annotate.and_then(|annotate| annotate(id)) {
                write!(out, " -> r{}", register)?;
            }
            out.write_char('\n')?;
            for &child in node.child_ids().iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        Ok(())
    }
}

impl<T: FormatNode> fmt::Display for TreeFormatter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.format(f)
    }
}

/// Render a compile tree with its register assignment
pub fn format_compile_tree(
    out: &mut dyn Write,
    arena: &Arena<CompileNode>,
    root: CompileNodeId,
    registers: &RegisterAssignment,
) -> fmt::Result {
    let lookup = |id: CompileNodeId| registers.register(id);
    TreeFormatter::new(arena, root)
        .with_registers(&lookup)
        .format(out)
}

/// Render the plan row catalog, one plan row per line
pub fn format_plan_rows(out: &mut dyn Write, rows: &PlanRows) -> fmt::Result {
    for (id, physical) in rows.iter() {
        write!(out, "{}:", id)?;
        for row in physical {
            write!(out, " {}", row)?;
        }
        out.write_char('\n')?;
    }
    Ok(())
}
