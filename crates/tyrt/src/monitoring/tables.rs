//! Opcode classification tables.
//!
//! Maps each evented opcode to the event it fires and to its instrumented
//! twin. The two opcode maps are inverse over exactly the evented opcodes;
//! the overlay sentinels have no plain form.

use super::events::Event;
use crate::bytecode::Opcode;

/// The instrumented twin of a plain evented opcode.
#[must_use]
pub fn instrumented(op: Opcode) -> Option<Opcode> {
    Some(match op {
        Opcode::EndFor => Opcode::InstrumentedEndFor,
        Opcode::PopIter => Opcode::InstrumentedPopIter,
        Opcode::EndSend => Opcode::InstrumentedEndSend,
        Opcode::ForIter => Opcode::InstrumentedForIter,
        Opcode::NotTaken => Opcode::InstrumentedNotTaken,
        Opcode::PopJumpIfFalse => Opcode::InstrumentedPopJumpIfFalse,
        Opcode::PopJumpIfTrue => Opcode::InstrumentedPopJumpIfTrue,
        Opcode::PopJumpIfNone => Opcode::InstrumentedPopJumpIfNone,
        Opcode::PopJumpIfNotNone => Opcode::InstrumentedPopJumpIfNotNone,
        Opcode::Resume => Opcode::InstrumentedResume,
        Opcode::ReturnValue => Opcode::InstrumentedReturnValue,
        Opcode::YieldValue => Opcode::InstrumentedYieldValue,
        Opcode::EndAsyncFor => Opcode::InstrumentedEndAsyncFor,
        Opcode::LoadSuperAttr => Opcode::InstrumentedLoadSuperAttr,
        Opcode::Call => Opcode::InstrumentedCall,
        Opcode::CallKw => Opcode::InstrumentedCallKw,
        Opcode::CallFunctionEx => Opcode::InstrumentedCallFunctionEx,
        Opcode::JumpForward => Opcode::InstrumentedJumpForward,
        Opcode::JumpBackward => Opcode::InstrumentedJumpBackward,
        _ => return None,
    })
}

/// The plain opcode an instrumented opcode stands in for.
#[must_use]
pub fn de_instrument(op: Opcode) -> Option<Opcode> {
    Some(match op {
        Opcode::InstrumentedEndFor => Opcode::EndFor,
        Opcode::InstrumentedPopIter => Opcode::PopIter,
        Opcode::InstrumentedEndSend => Opcode::EndSend,
        Opcode::InstrumentedForIter => Opcode::ForIter,
        Opcode::InstrumentedNotTaken => Opcode::NotTaken,
        Opcode::InstrumentedPopJumpIfFalse => Opcode::PopJumpIfFalse,
        Opcode::InstrumentedPopJumpIfTrue => Opcode::PopJumpIfTrue,
        Opcode::InstrumentedPopJumpIfNone => Opcode::PopJumpIfNone,
        Opcode::InstrumentedPopJumpIfNotNone => Opcode::PopJumpIfNotNone,
        Opcode::InstrumentedResume => Opcode::Resume,
        Opcode::InstrumentedReturnValue => Opcode::ReturnValue,
        Opcode::InstrumentedYieldValue => Opcode::YieldValue,
        Opcode::InstrumentedEndAsyncFor => Opcode::EndAsyncFor,
        Opcode::InstrumentedLoadSuperAttr => Opcode::LoadSuperAttr,
        Opcode::InstrumentedCall => Opcode::Call,
        Opcode::InstrumentedCallKw => Opcode::CallKw,
        Opcode::InstrumentedCallFunctionEx => Opcode::CallFunctionEx,
        Opcode::InstrumentedJumpForward => Opcode::JumpForward,
        Opcode::InstrumentedJumpBackward => Opcode::JumpBackward,
        _ => return None,
    })
}

/// Whether executing `op` can fire an event of its own.
#[must_use]
pub fn opcode_has_event(op: Opcode) -> bool {
    instrumented(op).is_some()
}

/// The event a plain opcode fires, given its operand.
///
/// `RESUME` fires PY_START at function entry (operand 0) and PY_RESUME otherwise.
#[must_use]
pub fn event_for_opcode(op: Opcode, oparg: u32) -> Option<Event> {
    Some(match op {
        Opcode::Resume if oparg == 0 => Event::PyStart,
        Opcode::Resume => Event::PyResume,
        Opcode::ReturnValue => Event::PyReturn,
        Opcode::YieldValue => Event::PyYield,
        Opcode::Call | Opcode::CallKw | Opcode::CallFunctionEx | Opcode::LoadSuperAttr => Event::Call,
        Opcode::JumpForward | Opcode::JumpBackward => Event::Jump,
        Opcode::PopJumpIfFalse
        | Opcode::PopJumpIfTrue
        | Opcode::PopJumpIfNone
        | Opcode::PopJumpIfNotNone
        | Opcode::PopIter
        | Opcode::EndAsyncFor => Event::BranchRight,
        Opcode::ForIter | Opcode::NotTaken => Event::BranchLeft,
        Opcode::EndFor | Opcode::EndSend => Event::StopIteration,
        _ => return None,
    })
}

/// Instructions that never carry a line overlay.
#[must_use]
pub(crate) fn never_starts_line(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::EndAsyncFor | Opcode::EndFor | Opcode::EndSend | Opcode::Resume | Opcode::PopIter
    )
}

/// Instructions that never carry an instruction overlay.
#[must_use]
pub(crate) fn skips_instruction_overlay(op: Opcode) -> bool {
    matches!(op, Opcode::Resume | Opcode::EndFor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_are_inverse_over_evented_opcodes() {
        for byte in 0..=u8::MAX {
            let Some(op) = Opcode::from_repr(byte) else { continue };
            if let Some(twin) = instrumented(op) {
                assert_eq!(de_instrument(twin), Some(op), "{op} should round trip");
                assert!(twin.is_instrumented());
                assert!(event_for_opcode(op, 0).is_some(), "{op} should have an event");
            } else if !op.is_instrumented() {
                assert_eq!(event_for_opcode(op, 0), None, "{op} should have no event");
            }
        }
        assert_eq!(de_instrument(Opcode::InstrumentedLine), None);
        assert_eq!(de_instrument(Opcode::InstrumentedInstruction), None);
    }

    #[test]
    fn resume_event_depends_on_operand() {
        assert_eq!(event_for_opcode(Opcode::Resume, 0), Some(Event::PyStart));
        assert_eq!(event_for_opcode(Opcode::Resume, 3), Some(Event::PyResume));
    }
}
