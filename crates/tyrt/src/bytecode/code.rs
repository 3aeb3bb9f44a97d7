//! Code objects: an instruction stream plus the tables the monitoring engine reads.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{op::Opcode, slot::Slot};
use crate::monitoring::data::MonitoringData;

/// Cache value for a freshly (de-)instrumented opcode: adaptive counter with
/// value 1 and backoff 1.
pub const WARMUP_COUNTER: u16 = 0x0011;

/// A 2-byte instruction slot: opcode byte and operand byte.
///
/// Inline cache entries reuse the same two bytes as a little-endian counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeUnit {
    pub code: u8,
    pub arg: u8,
}

impl CodeUnit {
    #[must_use]
    pub fn new(op: Opcode, arg: u8) -> Self {
        Self { code: op as u8, arg }
    }

    /// The unit read as an inline-cache counter.
    #[must_use]
    pub fn counter(self) -> u16 {
        u16::from_le_bytes([self.code, self.arg])
    }

    #[must_use]
    pub fn from_counter(value: u16) -> Self {
        let [code, arg] = value.to_le_bytes();
        Self { code, arg }
    }
}

/// One row of the exception table, in code-unit offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    /// First protected instruction.
    pub start: usize,
    /// One past the last protected instruction.
    pub end: usize,
    /// Handler entry point.
    pub handler: usize,
    /// Stack depth to unwind to.
    pub depth: u16,
    /// Whether the offset of the raising instruction is pushed.
    pub lasti: bool,
}

/// A conditional control transfer, as reported by [`Code::branches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    /// The instruction that decides the direction.
    pub source: usize,
    /// Where execution continues when the branch is not taken.
    pub not_taken: usize,
    /// Where execution continues when the branch is taken.
    pub taken: usize,
}

/// Mutable part of a code object, guarded by the per-code lock.
#[derive(Debug)]
pub(crate) struct CodeState {
    /// Live copy of the instruction stream; only inline caches change.
    pub(crate) units: Vec<CodeUnit>,
    pub(crate) slots: Vec<Slot>,
    pub(crate) monitoring: Option<MonitoringData>,
    pub(crate) instrumentation_version: u32,
}

impl CodeState {
    /// Resets the adaptive counter of the instruction at `i`, if it has one.
    pub(crate) fn reset_cache(&mut self, i: usize, op: Opcode) {
        if op.cache_entries() > 0
            && let Some(unit) = self.units.get_mut(i + 1)
        {
            *unit = CodeUnit::from_counter(WARMUP_COUNTER);
        }
    }
}

/// A compiled code object.
///
/// The instruction stream as compiled is immutable; instrumentation state
/// lives behind a per-object lock so concurrent readers never observe a
/// partially rewritten slot.
#[derive(Debug)]
pub struct Code {
    name: String,
    qualname: String,
    filename: String,
    first_line: u32,
    instructions: Box<[CodeUnit]>,
    lines: Box<[Option<u32>]>,
    exception_table: Box<[ExceptionEntry]>,
    first_traceable: usize,
    no_monitoring: bool,
    state: RwLock<CodeState>,
}

pub(crate) struct CodeParts {
    pub name: String,
    pub qualname: String,
    pub filename: String,
    pub first_line: u32,
    pub instructions: Vec<CodeUnit>,
    pub lines: Vec<Option<u32>>,
    pub exception_table: Vec<ExceptionEntry>,
    pub first_traceable: usize,
    pub no_monitoring: bool,
}

impl Code {
    pub(crate) fn from_parts(parts: CodeParts) -> Self {
        let slots = parts
            .instructions
            .iter()
            .map(|unit| Slot::new(Opcode::from_repr(unit.code).unwrap_or(Opcode::Cache)))
            .collect();
        let state = CodeState {
            units: parts.instructions.clone(),
            slots,
            monitoring: None,
            instrumentation_version: 0,
        };
        Self {
            name: parts.name,
            qualname: parts.qualname,
            filename: parts.filename,
            first_line: parts.first_line,
            instructions: parts.instructions.into_boxed_slice(),
            lines: parts.lines.into_boxed_slice(),
            exception_table: parts.exception_table.into_boxed_slice(),
            first_traceable: parts.first_traceable,
            no_monitoring: parts.no_monitoring,
            state: RwLock::new(state),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    /// Number of code units, caches included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Offset of the first instruction that may fire events.
    #[must_use]
    pub fn first_traceable(&self) -> usize {
        self.first_traceable
    }

    /// Shim code objects have nothing traceable.
    #[must_use]
    pub fn is_shim(&self) -> bool {
        self.first_traceable >= self.len()
    }

    /// Statically marked as never monitored.
    #[must_use]
    pub fn no_monitoring_events(&self) -> bool {
        self.no_monitoring
    }

    #[must_use]
    pub fn exception_table(&self) -> &[ExceptionEntry] {
        &self.exception_table
    }

    /// Source line of the code unit at `i`, if any.
    #[must_use]
    pub fn line(&self, i: usize) -> Option<u32> {
        self.lines.get(i).copied().flatten()
    }

    /// The unit at `i` as compiled, before any instrumentation.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    #[must_use]
    pub fn base_unit(&self, i: usize) -> CodeUnit {
        self.instructions[i]
    }

    /// The compiled opcode at `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    #[must_use]
    pub fn base_opcode(&self, i: usize) -> Opcode {
        Opcode::from_repr(self.instructions[i].code).unwrap_or(Opcode::Cache)
    }

    /// Code units taken by the instruction at `i`, caches included.
    #[must_use]
    pub fn instruction_len(&self, i: usize) -> usize {
        1 + self.base_opcode(i).cache_entries()
    }

    /// Offset of the instruction following the one at `i`.
    #[must_use]
    pub fn next_offset(&self, i: usize) -> usize {
        i + self.instruction_len(i)
    }

    /// Iterates over instruction start offsets from `start`.
    pub fn offsets_from(&self, start: usize) -> impl Iterator<Item = usize> + '_ {
        let mut i = start;
        std::iter::from_fn(move || {
            if i >= self.len() {
                return None;
            }
            let current = i;
            i = self.next_offset(i);
            Some(current)
        })
    }

    /// Full operand of the instruction at `i`, folding in `EXTENDED_ARG` prefixes.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    #[must_use]
    pub fn oparg(&self, i: usize) -> u32 {
        let mut arg = u32::from(self.instructions[i].arg);
        let mut shift = 8;
        let mut j = i;
        while j > 0 && shift < 32 && self.base_opcode(j - 1) == Opcode::ExtendedArg {
            j -= 1;
            arg |= u32::from(self.instructions[j].arg) << shift;
            shift += 8;
        }
        arg
    }

    /// Destination of the jump at `i`, or `None` if it is not a jump.
    ///
    /// For `FOR_ITER` and `SEND` this is where the exhausted branch lands,
    /// one past the `END_FOR`/`END_SEND` the operand points at.
    #[must_use]
    pub fn jump_target(&self, i: usize) -> Option<usize> {
        let next = self.next_offset(i);
        let oparg = self.oparg(i) as usize;
        match self.base_opcode(i) {
            Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::PopJumpIfNone
            | Opcode::PopJumpIfNotNone
            | Opcode::JumpForward => Some(next + oparg),
            Opcode::ForIter | Opcode::Send => Some(next + oparg + 1),
            Opcode::JumpBackward | Opcode::JumpBackwardNoInterrupt => next.checked_sub(oparg),
            _ => None,
        }
    }

    /// Every conditional branch in the code object.
    #[must_use]
    pub fn branches(&self) -> Vec<Branch> {
        let mut out = Vec::new();
        for i in self.offsets_from(0) {
            let next = self.next_offset(i);
            match self.base_opcode(i) {
                Opcode::ForIter => out.push(Branch {
                    source: i,
                    not_taken: next,
                    // skips END_FOR and POP_ITER
                    taken: next + self.oparg(i) as usize + 2,
                }),
                op if op.is_conditional_jump() => out.push(Branch {
                    source: i,
                    // skips NOT_TAKEN
                    not_taken: next + 1,
                    taken: next + self.oparg(i) as usize,
                }),
                Opcode::EndAsyncFor => {
                    if let Some(src) = next.checked_sub(self.oparg(i) as usize) {
                        out.push(Branch {
                            source: src,
                            not_taken: src + 2,
                            taken: next,
                        });
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// The opcode the dispatch loop currently sees at `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    #[must_use]
    pub fn visible_opcode(&self, i: usize) -> Opcode {
        self.state().slots[i].visible_opcode()
    }

    /// Instrumentation state of the slot at `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    #[must_use]
    pub fn slot(&self, i: usize) -> Slot {
        self.state().slots[i]
    }

    /// Adaptive counter of the instruction at `i`, if it has inline caches.
    #[must_use]
    pub fn cache_counter(&self, i: usize) -> Option<u16> {
        if self.base_opcode(i).cache_entries() == 0 {
            return None;
        }
        self.state().units.get(i + 1).map(|unit| unit.counter())
    }

    /// Monitoring version this code object was last instrumented at.
    #[must_use]
    pub fn instrumentation_version(&self) -> u32 {
        self.state().instrumentation_version
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, CodeState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, CodeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
