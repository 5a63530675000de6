//! Register-machine programs lowered from compile trees
//!
//! A program runs once per rank 0 word. The current word offset starts at
//! the rank 0 offset; `PushOffset`/`RightShiftOffset`/`PopOffset` bracket
//! code that runs at a coarser working rank. Row operands are read at
//! `offset >> rank_delta`.

use std::fmt;

use crate::arena::Arena;
use crate::backend::Backend;
use crate::diagnostics::{self, DiagnosticStream, NullDiagnostics};
use crate::error::{Error, Result};
use crate::plan::{CompileNode, CompileNodeId, CompiledPlan, RegisterAssignment};
use crate::row::{PlanRowId, Rank};

/// Register index
pub type Register = usize;

/// Closed instruction set of the reference machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// `dst = row[offset >> rank_delta]`
    LoadRow {
        /// Destination register
        dst: Register,
        /// Plan row
        row: PlanRowId,
        /// Shift applied to the current offset
        rank_delta: Rank,
    },
    /// `dst &= row[offset >> rank_delta]`
    AndRow {
        /// Accumulator
        dst: Register,
        /// Plan row
        row: PlanRowId,
        /// Shift applied to the current offset
        rank_delta: Rank,
    },
    /// `dst |= row[offset >> rank_delta]`
    OrRow {
        /// Accumulator
        dst: Register,
        /// Plan row
        row: PlanRowId,
        /// Shift applied to the current offset
        rank_delta: Rank,
    },
    /// `dst &= src`
    And {
        /// Accumulator
        dst: Register,
        /// Operand
        src: Register,
    },
    /// `dst |= src`
    Or {
        /// Accumulator
        dst: Register,
        /// Operand
        src: Register,
    },
    /// `dst = !dst`
    Not {
        /// Accumulator
        dst: Register,
    },
    /// `dst = src`
    Move {
        /// Destination
        dst: Register,
        /// Source
        src: Register,
    },
    /// Save the current offset
    PushOffset,
    /// `offset >>= delta`
    RightShiftOffset(Rank),
    /// Restore the last saved offset
    PopOffset,
    /// Continue at `target` if `src` is zero
    JumpIfZero {
        /// Tested register
        src: Register,
        /// Instruction index
        target: usize,
    },
    /// Report the documents whose bits are set in `src`
    Report {
        /// Match word
        src: Register,
    },
    /// Report every document of the word
    ReportAll,
}

impl Instruction {
    /// Registers read or written by the instruction
    pub fn registers(&self) -> [Option<Register>; 2] {
        match *self {
            Self::LoadRow { dst, .. } | Self::AndRow { dst, .. } | Self::OrRow { dst, .. } => {
                [Some(dst), None]
            }
            Self::And { dst, src } | Self::Or { dst, src } | Self::Move { dst, src } => {
                [Some(dst), Some(src)]
            }
            Self::Not { dst } => [Some(dst), None],
            Self::JumpIfZero { src, .. } | Self::Report { src } => [Some(src), None],
            Self::PushOffset | Self::RightShiftOffset(_) | Self::PopOffset | Self::ReportAll => {
                [None, None]
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadRow { dst, row, rank_delta } => {
                write!(f, "LoadRow r{}, {} >> {}", dst, row, rank_delta)
            }
            Self::AndRow { dst, row, rank_delta } => {
                write!(f, "AndRow r{}, {} >> {}", dst, row, rank_delta)
            }
            Self::OrRow { dst, row, rank_delta } => {
                write!(f, "OrRow r{}, {} >> {}", dst, row, rank_delta)
            }
            Self::And { dst, src } => write!(f, "And r{}, r{}", dst, src),
            Self::Or { dst, src } => write!(f, "Or r{}, r{}", dst, src),
            Self::Not { dst } => write!(f, "Not r{}", dst),
            Self::Move { dst, src } => write!(f, "Move r{}, r{}", dst, src),
            Self::PushOffset => f.write_str("PushOffset"),
            Self::RightShiftOffset(delta) => write!(f, "RightShiftOffset {}", delta),
            Self::PopOffset => f.write_str("PopOffset"),
            Self::JumpIfZero { src, target } => write!(f, "JumpIfZero r{}, {}", src, target),
            Self::Report { src } => write!(f, "Report r{}", src),
            Self::ReportAll => f.write_str("ReportAll"),
        }
    }
}

/// Lowered plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    instructions: Vec<Instruction>,
    register_file_size: usize,
    row_count: usize,
}

impl Program {
    /// Instructions in execution order
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Registers the machine needs (`register_base + register_count`)
    pub fn register_file_size(&self) -> usize {
        self.register_file_size
    }

    /// Plan rows the program may reference
    pub fn row_count(&self) -> usize {
        self.row_count
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pc, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "{:04} {}", pc, instruction)?;
        }
        Ok(())
    }
}

/// Lowers compile trees to [`Program`]s
pub struct ProgramBackend<'a> {
    diagnostics: &'a dyn DiagnosticStream,
}

impl<'a> ProgramBackend<'a> {
    /// Backend that renders programs on the `planning/program` channel
    pub fn new(diagnostics: &'a dyn DiagnosticStream) -> Self {
        Self { diagnostics }
    }
}

impl Default for ProgramBackend<'static> {
    fn default() -> Self {
        Self::new(&NullDiagnostics)
    }
}

impl Backend for ProgramBackend<'_> {
    type Output = Program;

    fn lower(&self, plan: &CompiledPlan) -> Result<Program> {
        let registers = plan.registers();
        let mut lowering = Lowering {
            tree: plan.compile_tree(),
            registers,
            scratch: registers.register_base(),
            code: Vec::new(),
        };
        lowering.lower_root(plan.compile_root())?;

        let register_file_size = registers.register_base() + registers.register_count();
        if let Some(register) = lowering
            .code
            .iter()
            .flat_map(Instruction::registers)
            .flatten()
            .find(|&r| r >= register_file_size)
        {
            return Err(Error::malformed(format!(
                "register r{} outside a file of {} registers",
                register, register_file_size
            )));
        }

        let program = Program {
            instructions: lowering.code,
            register_file_size,
            row_count: plan.rows().len(),
        };
        tracing::trace!(instructions = program.instructions.len(), "Lowered plan");
        diagnostics::emit(self.diagnostics, diagnostics::PROGRAM, |out| {
            use fmt::Write;
            write!(out, "{}", program)
        });
        Ok(program)
    }
}

/// Placeholder jump target, patched once the node's code is complete
const UNPATCHED: usize = usize::MAX;

struct Lowering<'a> {
    tree: &'a Arena<CompileNode>,
    registers: &'a RegisterAssignment,
    scratch: Register,
    code: Vec<Instruction>,
}

impl Lowering<'_> {
    fn lower_root(&mut self, root: CompileNodeId) -> Result<()> {
        let tree = self.tree;
        match tree.get(root) {
            CompileNode::Report(None) => self.code.push(Instruction::ReportAll),
            CompileNode::Report(Some(child)) => {
                let src = match tree.get(*child) {
                    CompileNode::LoadRow { .. } => {
                        self.load_into(*child, self.scratch)?;
                        self.scratch
                    }
                    _ => {
                        self.lower_node(*child)?;
                        self.register(*child)?
                    }
                };
                self.code.push(Instruction::Report { src });
            }
            _ => return Err(Error::malformed("compile tree root must be a Report")),
        }
        Ok(())
    }

    fn register(&self, id: CompileNodeId) -> Result<Register> {
        self.registers
            .register(id)
            .ok_or_else(|| Error::malformed(format!("node {:?} has no register", id)))
    }

    /// Leave the value of `id` in `dst`
    fn load_into(&mut self, id: CompileNodeId, dst: Register) -> Result<()> {
        let tree = self.tree;
        if let CompileNode::LoadRow { row, rank_delta } = tree.get(id) {
            self.code.push(Instruction::LoadRow {
                dst,
                row: row.id,
                rank_delta: *rank_delta,
            });
            return Ok(());
        }
        self.lower_node(id)?;
        let src = self.register(id)?;
        if src != dst {
            self.code.push(Instruction::Move { dst, src });
        }
        Ok(())
    }

    /// Emit code leaving the value of interior node `id` in its register
    fn lower_node(&mut self, id: CompileNodeId) -> Result<()> {
        let dst = self.register(id)?;
        let tree = self.tree;
        match tree.get(id) {
            CompileNode::And(children) => self.lower_operands(children, true, dst),
            CompileNode::Or(children) => self.lower_operands(children, false, dst),
            CompileNode::Not(child) => {
                self.load_into(*child, dst)?;
                self.code.push(Instruction::Not { dst });
                Ok(())
            }
            CompileNode::RankDown { delta, child } => {
                self.code.push(Instruction::PushOffset);
                self.code.push(Instruction::RightShiftOffset(*delta));
                self.load_into(*child, dst)?;
                self.code.push(Instruction::PopOffset);
                Ok(())
            }
            CompileNode::LoadRow { .. } | CompileNode::Report(_) => Err(Error::malformed(
                format!("node {:?} is not an accumulator", id),
            )),
        }
    }

    fn lower_operands(&mut self, children: &[CompileNodeId], is_and: bool, dst: Register) -> Result<()> {
        let Some((&first, rest)) = children.split_first() else {
            return Err(Error::malformed("operator without operands"));
        };
        self.load_into(first, dst)?;

        let tree = self.tree;
        let mut jumps = Vec::new();
        for &child in rest {
            if is_and {
                jumps.push(self.code.len());
                self.code.push(Instruction::JumpIfZero {
                    src: dst,
                    target: UNPATCHED,
                });
            }
            match tree.get(child) {
                CompileNode::LoadRow { row, rank_delta } => {
                    let (row, rank_delta) = (row.id, *rank_delta);
                    self.code.push(if is_and {
                        Instruction::AndRow { dst, row, rank_delta }
                    } else {
                        Instruction::OrRow { dst, row, rank_delta }
                    });
                }
                _ => {
                    self.lower_node(child)?;
                    let src = self.register(child)?;
                    self.code.push(if is_and {
                        Instruction::And { dst, src }
                    } else {
                        Instruction::Or { dst, src }
                    });
                }
            }
        }

        let end = self.code.len();
        for at in jumps {
            if let Instruction::JumpIfZero { target, .. } = &mut self.code[at] {
                *target = end;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::diagnostics::BufferedDiagnostics;
    use crate::index::MemoryIndex;
    use crate::plan::QueryPlanner;
    use crate::row::RowId;
    use crate::term::{Term, TermMatchNode};

    fn planner() -> QueryPlanner {
        QueryPlanner::new(PlannerConfig {
            filter_inactive_documents: false,
            ..PlannerConfig::default()
        })
    }

    #[test]
    fn test_lower_and_of_mixed_ranks() {
        let index = MemoryIndex::new(1, 1024).unwrap();
        index
            .assign_term(&Term::new("a"), &[RowId::new(0, 2, 5)])
            .unwrap();
        index
            .assign_term(&Term::new("b"), &[RowId::new(0, 0, 9)])
            .unwrap();
        let query = TermMatchNode::and(vec![TermMatchNode::term("a"), TermMatchNode::term("b")]);
        let plan = planner().plan(&query, &index, &NullDiagnostics).unwrap();

        let diagnostics = BufferedDiagnostics::all();
        let program = ProgramBackend::new(&diagnostics).lower(&plan).unwrap();
        let a = plan.rows().iter().find(|(_, p)| p[0].rank == 2).unwrap().0;
        let b = plan.rows().iter().find(|(_, p)| p[0].rank == 0).unwrap().0;

        assert_eq!(
            program.instructions(),
            &[
                Instruction::LoadRow {
                    dst: 8,
                    row: a,
                    rank_delta: 2
                },
                Instruction::JumpIfZero { src: 8, target: 3 },
                Instruction::AndRow {
                    dst: 8,
                    row: b,
                    rank_delta: 0
                },
                Instruction::Report { src: 8 },
            ]
        );
        assert_eq!(program.register_file_size(), 15);
        assert_eq!(diagnostics.channel(diagnostics::PROGRAM).len(), 1);
        assert!(program.to_string().starts_with("0000 LoadRow r8, r"));
    }

    #[test]
    fn test_lower_single_row_uses_scratch() {
        let index = MemoryIndex::new(1, 256).unwrap();
        index
            .assign_term(&Term::new("a"), &[RowId::new(0, 1, 5)])
            .unwrap();
        let plan = planner()
            .plan(&TermMatchNode::term("a"), &index, &NullDiagnostics)
            .unwrap();

        let program = ProgramBackend::default().lower(&plan).unwrap();
        assert_eq!(
            program.instructions(),
            &[
                Instruction::LoadRow {
                    dst: 8,
                    row: PlanRowId(0),
                    rank_delta: 1
                },
                Instruction::Report { src: 8 },
            ]
        );
    }

    #[test]
    fn test_rank_down_brackets_offset() {
        let index = MemoryIndex::new(1, 1024).unwrap();
        index
            .assign_term(&Term::new("x"), &[RowId::new(0, 3, 5)])
            .unwrap();
        index
            .assign_term(&Term::new("y"), &[RowId::new(0, 3, 6)])
            .unwrap();
        let query = TermMatchNode::negate(TermMatchNode::or(vec![
            TermMatchNode::term("x"),
            TermMatchNode::term("y"),
        ]));
        let plan = planner().plan(&query, &index, &NullDiagnostics).unwrap();
        let program = ProgramBackend::default().lower(&plan).unwrap();

        let ops = program.instructions();
        assert_eq!(ops[0], Instruction::PushOffset);
        assert_eq!(ops[1], Instruction::RightShiftOffset(3));
        assert!(ops.contains(&Instruction::Not { dst: 8 }));
        assert_eq!(ops[ops.len() - 2], Instruction::PopOffset);
        assert_eq!(ops[ops.len() - 1], Instruction::Report { src: 8 });
    }
}
