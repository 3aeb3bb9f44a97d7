//! Opcode definitions.
//!
//! Only the opcodes the monitoring engine needs to reason about are modelled:
//! every opcode that maps to a monitoring event, the control-flow opcodes used
//! to find line starts, and a handful of ordinary opcodes so code objects look
//! like real compiler output. Instrumented forms occupy the top of the byte
//! range, above [`MIN_INSTRUMENTED_OPCODE`].

use strum::{Display, FromRepr, IntoStaticStr};

/// First byte value used by an instrumented opcode.
pub const MIN_INSTRUMENTED_OPCODE: u8 = 234;

/// A bytecode opcode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    /// Inline cache entry. Never executed.
    Cache = 0,
    Nop,
    ExtendedArg,
    Resume,
    ReturnValue,
    Call,
    CallKw,
    CallFunctionEx,
    LoadSuperAttr,
    YieldValue,
    JumpForward,
    JumpBackward,
    JumpBackwardNoInterrupt,
    PopJumpIfFalse,
    PopJumpIfTrue,
    PopJumpIfNone,
    PopJumpIfNotNone,
    ForIter,
    Send,
    PopIter,
    EndFor,
    EndSend,
    NotTaken,
    EndAsyncFor,
    LoadConst,
    LoadSmallInt,
    LoadFast,
    StoreFast,
    LoadGlobal,
    LoadAttr,
    StoreAttr,
    BinaryOp,
    CompareOp,
    ToBool,
    PopTop,
    PushNull,
    GetIter,
    Copy,
    Swap,
    RaiseVarargs,
    Reraise,
    PushExcInfo,
    PopExcept,
    CheckExcMatch,

    // instrumented forms
    InstrumentedEndFor = MIN_INSTRUMENTED_OPCODE,
    InstrumentedPopIter,
    InstrumentedEndSend,
    InstrumentedForIter,
    InstrumentedNotTaken,
    InstrumentedPopJumpIfFalse,
    InstrumentedPopJumpIfTrue,
    InstrumentedPopJumpIfNone,
    InstrumentedPopJumpIfNotNone,
    InstrumentedResume,
    InstrumentedReturnValue,
    InstrumentedYieldValue,
    InstrumentedEndAsyncFor,
    InstrumentedLoadSuperAttr,
    InstrumentedCall,
    InstrumentedCallKw,
    InstrumentedCallFunctionEx,
    InstrumentedJumpForward,
    InstrumentedJumpBackward,
    /// Overlay sentinel: fire INSTRUCTION, then run the shadowed opcode.
    InstrumentedInstruction,
    /// Overlay sentinel: fire LINE, then run the shadowed opcode.
    InstrumentedLine,
}

impl Opcode {
    /// Number of inline cache code units following the instruction.
    #[must_use]
    pub fn cache_entries(self) -> usize {
        match self.base() {
            Self::Call | Self::CallKw | Self::ToBool => 3,
            Self::LoadSuperAttr
            | Self::JumpBackward
            | Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::PopJumpIfNone
            | Self::PopJumpIfNotNone
            | Self::ForIter
            | Self::Send
            | Self::CompareOp => 1,
            Self::LoadGlobal | Self::StoreAttr => 4,
            Self::BinaryOp => 5,
            Self::LoadAttr => 9,
            _ => 0,
        }
    }

    /// Whether this is one of the instrumented forms (including the overlays).
    #[must_use]
    pub fn is_instrumented(self) -> bool {
        self as u8 >= MIN_INSTRUMENTED_OPCODE
    }

    /// The plain opcode an instrumented form stands in for. Plain opcodes
    /// and overlay sentinels map to themselves.
    #[must_use]
    pub fn base(self) -> Self {
        crate::monitoring::tables::de_instrument(self).unwrap_or(self)
    }

    /// Conditional jumps that pop their condition.
    #[must_use]
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Self::PopJumpIfFalse | Self::PopJumpIfTrue | Self::PopJumpIfNone | Self::PopJumpIfNotNone
        )
    }
}
