//! Bytecode representation instrumented by the monitoring engine.
//!
//! # Module Structure
//!
//! - `op` - Opcode enum and per-opcode metadata
//! - `code` - Code objects, code units and the exception table
//! - `slot` - Per-instruction instrumentation state
//! - `builder` - CodeBuilder for assembling code objects

pub use builder::{BuildError, CodeBuilder, JumpLabel};
pub use code::{Branch, Code, CodeUnit, ExceptionEntry, WARMUP_COUNTER};
pub(crate) use code::CodeState;
pub use op::{MIN_INSTRUMENTED_OPCODE, Opcode};
pub use slot::{Overlaid, Slot, Underlying};

mod builder;
mod code;
mod op;
mod slot;
