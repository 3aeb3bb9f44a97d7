//! Builder for assembling code objects.
//!
//! `CodeBuilder` emits opcodes with their inline caches, folds wide operands
//! into `EXTENDED_ARG` prefixes, patches forward jumps and records the line
//! and exception tables the monitoring engine reads.
//!
//! ```ignore
//! let mut builder = CodeBuilder::new("f");
//! builder.emit_arg(Opcode::Resume, 0);
//! builder.set_line(2);
//! let jump = builder.emit_jump(Opcode::PopJumpIfFalse);
//! builder.emit(Opcode::NotTaken);
//! // ... emit more code ...
//! builder.patch_jump(jump)?;
//! let code = builder.build();
//! ```

use std::sync::Arc;

use super::{
    code::{Code, CodeParts, CodeUnit, ExceptionEntry},
    op::Opcode,
};

/// Error raised when the assembled stream cannot be encoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// Jump operands are emitted one byte wide.
    #[error("jump at offset {offset} spans {distance} code units, more than a one-byte operand allows")]
    JumpTooFar { offset: usize, distance: usize },
    #[error("backward jump at offset {offset} targets {target}, which is not behind it")]
    NotBackward { offset: usize, target: usize },
    #[error("{0} is not a jump opcode")]
    NotAJump(Opcode),
}

/// A forward jump waiting for its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "forward jumps must be patched"]
pub struct JumpLabel(usize);

/// Builder for code objects.
#[derive(Debug)]
pub struct CodeBuilder {
    name: String,
    qualname: Option<String>,
    filename: String,
    first_line: u32,
    units: Vec<CodeUnit>,
    lines: Vec<Option<u32>>,
    exception_table: Vec<ExceptionEntry>,
    /// Line recorded for subsequently emitted instructions.
    current_line: Option<u32>,
    first_traceable: usize,
    no_monitoring: bool,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            qualname: None,
            filename: "<string>".to_owned(),
            first_line: 1,
            units: Vec::new(),
            lines: Vec::new(),
            exception_table: Vec::new(),
            current_line: None,
            first_traceable: 0,
            no_monitoring: false,
        }
    }

    #[must_use]
    pub fn qualname(mut self, qualname: impl Into<String>) -> Self {
        self.qualname = Some(qualname.into());
        self
    }

    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Sets the definition line; also becomes the current line.
    #[must_use]
    pub fn first_line(mut self, line: u32) -> Self {
        self.first_line = line;
        self.current_line = Some(line);
        self
    }

    /// Marks the code object as never monitored, like statically allocated code.
    #[must_use]
    pub fn no_monitoring_events(mut self) -> Self {
        self.no_monitoring = true;
        self
    }

    /// Sets the source line for subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = Some(line);
    }

    /// Subsequent instructions carry no line, like compiler-generated cleanup.
    pub fn clear_line(&mut self) {
        self.current_line = None;
    }

    /// Offset the next instruction will be emitted at.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.units.len()
    }

    /// Instructions emitted from here on may fire events. Defaults to 0.
    pub fn mark_traceable(&mut self) {
        self.first_traceable = self.offset();
    }

    /// Emits an instruction without a meaningful operand.
    pub fn emit(&mut self, op: Opcode) -> usize {
        self.push(op, 0)
    }

    /// Emits an instruction, prefixing `EXTENDED_ARG`s for operands over one byte.
    pub fn emit_arg(&mut self, op: Opcode, arg: u32) -> usize {
        let bytes = arg.to_be_bytes();
        let significant = bytes.iter().position(|&b| b != 0).unwrap_or(3);
        for &byte in &bytes[significant..3] {
            self.push(Opcode::ExtendedArg, byte);
        }
        self.push(op, bytes[3])
    }

    /// Emits a forward jump whose operand is patched later.
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        JumpLabel(self.push(op, 0))
    }

    /// Points a forward jump at the current offset.
    ///
    /// For `FOR_ITER` and `SEND` the current offset should be the matching
    /// `END_FOR`/`END_SEND`, which the exhausted branch skips over.
    pub fn patch_jump(&mut self, label: JumpLabel) -> Result<(), BuildError> {
        let JumpLabel(offset) = label;
        let op = Opcode::from_repr(self.units[offset].code).unwrap_or(Opcode::Cache);
        let next = offset + 1 + op.cache_entries();
        let distance = self.offset() - next;
        self.units[offset].arg = u8::try_from(distance).map_err(|_| BuildError::JumpTooFar { offset, distance })?;
        Ok(())
    }

    /// Emits a jump back to `target`.
    pub fn emit_jump_backward(&mut self, op: Opcode, target: usize) -> Result<usize, BuildError> {
        if !matches!(op, Opcode::JumpBackward | Opcode::JumpBackwardNoInterrupt) {
            return Err(BuildError::NotAJump(op));
        }
        let offset = self.offset();
        let next = offset + 1 + op.cache_entries();
        if target > offset {
            return Err(BuildError::NotBackward { offset, target });
        }
        let distance = next - target;
        let arg = u8::try_from(distance).map_err(|_| BuildError::JumpTooFar { offset, distance })?;
        Ok(self.push(op, arg))
    }

    /// Emits `END_ASYNC_FOR` pointing back at the `END_SEND` at `end_send`.
    pub fn emit_end_async_for(&mut self, end_send: usize) -> Result<usize, BuildError> {
        let offset = self.offset();
        let next = offset + 1;
        let distance = next - end_send.min(next);
        let arg = u8::try_from(distance).map_err(|_| BuildError::JumpTooFar { offset, distance })?;
        Ok(self.push(Opcode::EndAsyncFor, arg))
    }

    /// Registers an exception handler covering `start..end`.
    pub fn add_handler(&mut self, start: usize, end: usize, handler: usize, depth: u16) {
        self.exception_table.push(ExceptionEntry {
            start,
            end,
            handler,
            depth,
            lasti: false,
        });
    }

    /// Finishes the code object.
    #[must_use]
    pub fn build(self) -> Arc<Code> {
        let qualname = self.qualname.unwrap_or_else(|| self.name.clone());
        Arc::new(Code::from_parts(CodeParts {
            name: self.name,
            qualname,
            filename: self.filename,
            first_line: self.first_line,
            instructions: self.units,
            lines: self.lines,
            exception_table: self.exception_table,
            first_traceable: self.first_traceable,
            no_monitoring: self.no_monitoring,
        }))
    }

    fn push(&mut self, op: Opcode, arg: u8) -> usize {
        let offset = self.offset();
        self.units.push(CodeUnit::new(op, arg));
        self.lines.push(self.current_line);
        for _ in 0..op.cache_entries() {
            self.units.push(CodeUnit::default());
            self.lines.push(self.current_line);
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_args_fold_into_operand() {
        let mut builder = CodeBuilder::new("f");
        let at = builder.emit_arg(Opcode::LoadConst, 0x1_02);
        let code = builder.build();
        assert_eq!(at, 1);
        assert_eq!(code.base_opcode(0), Opcode::ExtendedArg);
        assert_eq!(code.oparg(at), 0x1_02);
    }

    #[test]
    fn forward_jump_lands_on_patch_point() {
        let mut builder = CodeBuilder::new("f");
        let jump = builder.emit_jump(Opcode::PopJumpIfTrue);
        builder.emit(Opcode::NotTaken);
        builder.emit(Opcode::Nop);
        let target = builder.offset();
        builder.patch_jump(jump).unwrap();
        builder.emit(Opcode::ReturnValue);
        let code = builder.build();
        assert_eq!(code.jump_target(0), Some(target));
    }

    #[test]
    fn backward_jump_round_trips() {
        let mut builder = CodeBuilder::new("f");
        builder.emit(Opcode::Nop);
        let top = builder.offset();
        builder.emit(Opcode::Nop);
        let at = builder.emit_jump_backward(Opcode::JumpBackward, top).unwrap();
        let code = builder.build();
        assert_eq!(code.jump_target(at), Some(top));
    }
}
