//! Reference interpreter for lowered programs

use crate::backend::program::{Instruction, Program};
use crate::error::{Error, Result};
use crate::index::RowSource;
use crate::plan::PlanRows;
use crate::row::{PlanRowId, RowId, ShardId, WORD_BITS};

/// Runs a [`Program`] over the rows of each shard
pub struct MatchInterpreter<'a> {
    program: &'a Program,
    rows: &'a PlanRows,
}

impl<'a> MatchInterpreter<'a> {
    /// Interpreter binding the program's plan rows through `rows`
    pub fn new(program: &'a Program, rows: &'a PlanRows) -> Self {
        Self { program, rows }
    }

    /// Matching documents of every shard as `(shard, document)` pairs
    pub fn run(&self, source: &dyn RowSource) -> Result<Vec<(ShardId, u64)>> {
        let mut matches = Vec::new();
        for shard in 0..self.rows.shard_count() {
            matches.extend(self.run_shard(shard, source)?.into_iter().map(|doc| (shard, doc)));
        }
        Ok(matches)
    }

    /// Matching documents of `shard`, in increasing order
    pub fn run_shard(&self, shard: ShardId, source: &dyn RowSource) -> Result<Vec<u64>> {
        if self.rows.len() < self.program.row_count() {
            return Err(Error::index_inconsistency(format!(
                "program references {} plan rows, catalog has {}",
                self.program.row_count(),
                self.rows.len()
            )));
        }
        let physical = (0..self.program.row_count())
            .map(|i| {
                let id = PlanRowId(i as u32);
                self.rows.physical(shard, id).ok_or(Error::UnknownPlanRow {
                    id: id.0,
                    row_count: self.rows.len(),
                })
            })
            .collect::<Result<Vec<RowId>>>()?;

        let mut machine = Machine {
            registers: vec![0; self.program.register_file_size()],
            offsets: Vec::new(),
            physical: &physical,
            source,
            document_count: source.document_count(shard),
        };
        let mut matches = Vec::new();
        for offset in 0..source.word_count(shard) {
            machine.execute(self.program.instructions(), offset, &mut matches)?;
        }
        Ok(matches)
    }
}

struct Machine<'a> {
    registers: Vec<u64>,
    offsets: Vec<usize>,
    physical: &'a [RowId],
    source: &'a dyn RowSource,
    document_count: u64,
}

impl Machine<'_> {
    fn row_word(&self, row: PlanRowId, offset: usize, rank_delta: u8) -> u64 {
        self.source
            .row_word(self.physical[row.as_usize()], offset >> rank_delta)
    }

    fn execute(&mut self, code: &[Instruction], base: usize, matches: &mut Vec<u64>) -> Result<()> {
        let mut offset = base;
        let mut pc = 0;
        while let Some(instruction) = code.get(pc) {
            pc += 1;
            match *instruction {
                Instruction::LoadRow { dst, row, rank_delta } => {
                    self.registers[dst] = self.row_word(row, offset, rank_delta);
                }
                Instruction::AndRow { dst, row, rank_delta } => {
                    self.registers[dst] &= self.row_word(row, offset, rank_delta);
                }
                Instruction::OrRow { dst, row, rank_delta } => {
                    self.registers[dst] |= self.row_word(row, offset, rank_delta);
                }
                Instruction::And { dst, src } => self.registers[dst] &= self.registers[src],
                Instruction::Or { dst, src } => self.registers[dst] |= self.registers[src],
                Instruction::Not { dst } => self.registers[dst] = !self.registers[dst],
                Instruction::Move { dst, src } => self.registers[dst] = self.registers[src],
                Instruction::PushOffset => self.offsets.push(offset),
                Instruction::RightShiftOffset(delta) => offset >>= delta,
                Instruction::PopOffset => {
                    offset = self
                        .offsets
                        .pop()
                        .ok_or_else(|| Error::malformed("PopOffset without PushOffset"))?;
                }
                Instruction::JumpIfZero { src, target } => {
                    if self.registers[src] == 0 {
                        pc = target;
                    }
                }
                Instruction::Report { src } => {
                    report(self.registers[src], base, self.document_count, matches)
                }
                Instruction::ReportAll => report(u64::MAX, base, self.document_count, matches),
            }
        }
        if !self.offsets.is_empty() {
            return Err(Error::malformed("unbalanced PushOffset"));
        }
        Ok(())
    }
}

/// Push the documents of `word` at `offset`, skipping ids at or past
/// `document_count`
fn report(mut word: u64, offset: usize, document_count: u64, matches: &mut Vec<u64>) {
    let base = (offset * WORD_BITS) as u64;
    let valid = document_count.saturating_sub(base);
    if valid < WORD_BITS as u64 {
        word &= (1u64 << valid) - 1;
    }
    while word != 0 {
        matches.push(base + u64::from(word.trailing_zeros()));
        word &= word - 1;
    }
}
