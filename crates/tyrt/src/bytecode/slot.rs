//! Per-instruction instrumentation state.
//!
//! Every code unit carries a [`Slot`] describing what the interpreter sees when
//! it dispatches there. The nesting order of the overlays is fixed by the
//! types: an instruction overlay wraps an optional line overlay, which wraps
//! the underlying plain or instrumented opcode. Reading the visible opcode is a
//! single match on the discriminant.

use super::op::Opcode;
use crate::monitoring::tables;

/// The innermost opcode of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Underlying {
    Plain(Opcode),
    /// Holds the base opcode; the visible form is its instrumented twin.
    Instrumented(Opcode),
}

impl Underlying {
    /// The base (de-instrumented) opcode.
    #[must_use]
    pub fn base(self) -> Opcode {
        match self {
            Self::Plain(op) | Self::Instrumented(op) => op,
        }
    }

    /// The opcode that actually runs once overlays have fired.
    #[must_use]
    pub fn opcode(self) -> Opcode {
        match self {
            Self::Plain(op) => op,
            Self::Instrumented(op) => tables::instrumented(op).unwrap_or(op),
        }
    }

    #[must_use]
    pub fn is_instrumented(self) -> bool {
        matches!(self, Self::Instrumented(_))
    }
}

/// What an instruction overlay shadows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlaid {
    Bare(Underlying),
    Line(Underlying),
}

impl Overlaid {
    fn underlying(self) -> Underlying {
        match self {
            Self::Bare(inner) | Self::Line(inner) => inner,
        }
    }
}

/// Instrumentation state of one code unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Plain(Opcode),
    Instrumented(Opcode),
    LineOverlay(Underlying),
    InstructionOverlay(Overlaid),
}

impl Slot {
    /// The slot state for freshly compiled bytecode.
    #[must_use]
    pub fn new(op: Opcode) -> Self {
        Self::Plain(op)
    }

    /// The opcode byte the dispatch loop would read.
    #[must_use]
    pub fn visible_opcode(self) -> Opcode {
        match self {
            Self::Plain(op) => op,
            Self::Instrumented(op) => tables::instrumented(op).unwrap_or(op),
            Self::LineOverlay(_) => Opcode::InstrumentedLine,
            Self::InstructionOverlay(_) => Opcode::InstrumentedInstruction,
        }
    }

    /// The innermost opcode, below any overlay.
    #[must_use]
    pub fn underlying(self) -> Underlying {
        match self {
            Self::Plain(op) => Underlying::Plain(op),
            Self::Instrumented(op) => Underlying::Instrumented(op),
            Self::LineOverlay(inner) => inner,
            Self::InstructionOverlay(overlaid) => overlaid.underlying(),
        }
    }

    #[must_use]
    pub fn base_opcode(self) -> Opcode {
        self.underlying().base()
    }

    #[must_use]
    pub fn has_line(self) -> bool {
        matches!(self, Self::LineOverlay(_) | Self::InstructionOverlay(Overlaid::Line(_)))
    }

    #[must_use]
    pub fn has_instruction(self) -> bool {
        matches!(self, Self::InstructionOverlay(_))
    }

    /// Whether anything at all has been layered on the plain opcode.
    #[must_use]
    pub fn is_instrumented(self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    /// Replaces the innermost opcode, keeping overlays in place.
    #[must_use]
    pub fn with_underlying(self, inner: Underlying) -> Self {
        match self {
            Self::Plain(_) | Self::Instrumented(_) => match inner {
                Underlying::Plain(op) => Self::Plain(op),
                Underlying::Instrumented(op) => Self::Instrumented(op),
            },
            Self::LineOverlay(_) => Self::LineOverlay(inner),
            Self::InstructionOverlay(Overlaid::Bare(_)) => Self::InstructionOverlay(Overlaid::Bare(inner)),
            Self::InstructionOverlay(Overlaid::Line(_)) => Self::InstructionOverlay(Overlaid::Line(inner)),
        }
    }

    #[must_use]
    pub fn with_line(self) -> Self {
        match self {
            Self::Plain(_) | Self::Instrumented(_) => Self::LineOverlay(self.underlying()),
            Self::InstructionOverlay(Overlaid::Bare(inner)) => Self::InstructionOverlay(Overlaid::Line(inner)),
            Self::LineOverlay(_) | Self::InstructionOverlay(Overlaid::Line(_)) => self,
        }
    }

    #[must_use]
    pub fn without_line(self) -> Self {
        match self {
            Self::LineOverlay(inner) => Self::Plain(Opcode::Nop).with_underlying(inner),
            Self::InstructionOverlay(Overlaid::Line(inner)) => Self::InstructionOverlay(Overlaid::Bare(inner)),
            _ => self,
        }
    }

    #[must_use]
    pub fn with_instruction(self) -> Self {
        match self {
            Self::Plain(_) | Self::Instrumented(_) => Self::InstructionOverlay(Overlaid::Bare(self.underlying())),
            Self::LineOverlay(inner) => Self::InstructionOverlay(Overlaid::Line(inner)),
            Self::InstructionOverlay(_) => self,
        }
    }

    #[must_use]
    pub fn without_instruction(self) -> Self {
        match self {
            Self::InstructionOverlay(Overlaid::Bare(inner)) => Self::Plain(Opcode::Nop).with_underlying(inner),
            Self::InstructionOverlay(Overlaid::Line(inner)) => Self::LineOverlay(inner),
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlays_nest_in_fixed_order() {
        let slot = Slot::new(Opcode::Call).with_instruction().with_line();
        assert_eq!(slot.visible_opcode(), Opcode::InstrumentedInstruction);
        assert!(slot.has_line());
        let slot = slot.without_instruction();
        assert_eq!(slot.visible_opcode(), Opcode::InstrumentedLine);
        let slot = slot.without_line();
        assert_eq!(slot, Slot::Plain(Opcode::Call));
    }

    #[test]
    fn underlying_swap_keeps_overlays() {
        let slot = Slot::new(Opcode::ReturnValue).with_line();
        let slot = slot.with_underlying(Underlying::Instrumented(Opcode::ReturnValue));
        assert!(slot.has_line());
        assert_eq!(slot.underlying().opcode(), Opcode::InstrumentedReturnValue);
        let slot = slot.without_line();
        assert_eq!(slot.visible_opcode(), Opcode::InstrumentedReturnValue);
    }
}
