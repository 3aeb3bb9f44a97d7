//! Monitoring events, event sets and tool identifiers.

use strum::{Display, EnumIter, FromRepr, IntoStaticStr};

/// Events that can be enabled per code object.
pub const LOCAL_EVENTS: usize = 11;
/// Events that can only be enabled globally and have their own callbacks.
pub const UNGROUPED_EVENTS: usize = 16;
/// Every event id, including the grouped and legacy ones.
pub const EVENTS: usize = 19;

/// Number of tool slots, including the two reserved for legacy hooks.
pub const TOOL_IDS: usize = 8;

pub const DEBUGGER_ID: u8 = 0;
pub const COVERAGE_ID: u8 = 1;
pub const PROFILER_ID: u8 = 2;
pub const OPTIMIZER_ID: u8 = 5;
/// Reserved for the legacy profile hook.
pub const SYS_PROFILE_ID: u8 = 6;
/// Reserved for the legacy trace hook.
pub const SYS_TRACE_ID: u8 = 7;

/// A monitoring event. The discriminant is the event id.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    PyStart = 0,
    PyResume,
    PyReturn,
    PyYield,
    Call,
    Line,
    Instruction,
    Jump,
    BranchLeft,
    BranchRight,
    StopIteration,
    Raise,
    ExceptionHandled,
    PyUnwind,
    PyThrow,
    Reraise,
    /// Shares the CALL tool set.
    #[strum(serialize = "C_RETURN")]
    CReturn,
    /// Shares the CALL tool set.
    #[strum(serialize = "C_RAISE")]
    CRaise,
    /// Legacy: expands to BRANCH_LEFT and BRANCH_RIGHT.
    Branch,
}

impl Event {
    #[must_use]
    pub const fn id(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn bit(self) -> EventSet {
        EventSet::from_bits_retain(1 << self as u32)
    }

    /// Local events are the ones instrumented into bytecode and settable per code object.
    #[must_use]
    pub const fn is_local(self) -> bool {
        (self as usize) < LOCAL_EVENTS
    }

    #[must_use]
    pub const fn is_ungrouped(self) -> bool {
        (self as usize) < UNGROUPED_EVENTS
    }

    /// The event whose tool set decides who receives this one.
    #[must_use]
    pub const fn tool_set_event(self) -> Self {
        match self {
            Self::CReturn | Self::CRaise => Self::Call,
            other => other,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

bitflags::bitflags! {
    /// A set of events, one bit per event id.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventSet: u32 {
        const PY_START = 1 << 0;
        const PY_RESUME = 1 << 1;
        const PY_RETURN = 1 << 2;
        const PY_YIELD = 1 << 3;
        const CALL = 1 << 4;
        const LINE = 1 << 5;
        const INSTRUCTION = 1 << 6;
        const JUMP = 1 << 7;
        const BRANCH_LEFT = 1 << 8;
        const BRANCH_RIGHT = 1 << 9;
        const STOP_ITERATION = 1 << 10;
        const RAISE = 1 << 11;
        const EXCEPTION_HANDLED = 1 << 12;
        const PY_UNWIND = 1 << 13;
        const PY_THROW = 1 << 14;
        const RERAISE = 1 << 15;
        const C_RETURN = 1 << 16;
        const C_RAISE = 1 << 17;
        const BRANCH = 1 << 18;
    }
}

impl EventSet {
    /// Events delivered alongside CALL.
    pub const C_RETURN_EVENTS: Self = Self::C_RETURN.union(Self::C_RAISE);
    /// What BRANCH stands for.
    pub const BRANCHES: Self = Self::BRANCH_LEFT.union(Self::BRANCH_RIGHT);

    /// Iterates over the events in the set, lowest id first.
    pub fn events(self) -> impl Iterator<Item = Event> {
        let bits = self.bits();
        (0..EVENTS as u8).filter(move |&e| bits & (1 << e) != 0).filter_map(Event::from_repr)
    }
}

impl From<Event> for EventSet {
    fn from(event: Event) -> Self {
        event.bit()
    }
}

/// Iterates over the tool ids in a tool mask, most significant first.
///
/// This is the order callbacks are invoked in.
pub fn tools_descending(mut tools: u8) -> impl Iterator<Item = u8> {
    std::iter::from_fn(move || {
        if tools == 0 {
            return None;
        }
        let tool = 7 - tools.leading_zeros() as u8;
        tools &= !(1 << tool);
        Some(tool)
    })
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn names_match_event_ids() {
        assert_eq!(Event::PyStart.name(), "PY_START");
        assert_eq!(Event::BranchLeft.name(), "BRANCH_LEFT");
        assert_eq!(Event::StopIteration.name(), "STOP_ITERATION");
        assert_eq!(Event::CReturn.name(), "C_RETURN");
        assert_eq!(Event::iter().count(), EVENTS);
        for event in Event::iter() {
            assert_eq!(event.bit().bits(), 1 << event.id());
        }
    }

    #[test]
    fn tools_are_visited_high_to_low() {
        let order: Vec<u8> = tools_descending(0b1010_0101).collect();
        assert_eq!(order, vec![7, 5, 2, 0]);
        assert_eq!(tools_descending(0).count(), 0);
    }
}
