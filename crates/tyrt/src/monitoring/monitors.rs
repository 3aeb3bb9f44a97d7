//! Event-to-tool-mask tables.
//!
//! Each entry is a bitmask of tool ids interested in the event.

use super::events::{Event, EventSet, LOCAL_EVENTS, TOOL_IDS, UNGROUPED_EVENTS};

/// Tool masks for the local events of one code object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalMonitors {
    pub(crate) tools: [u8; LOCAL_EVENTS],
}

/// Interpreter-wide tool masks for every ungrouped event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalMonitors {
    pub(crate) tools: [u8; UNGROUPED_EVENTS],
}

impl LocalMonitors {
    #[must_use]
    pub fn get(&self, event: Event) -> u8 {
        self.tools.get(event.id()).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.iter().all(|&t| t == 0)
    }

    /// Whether any event has more than one tool interested.
    #[must_use]
    pub fn multiple_tools(&self) -> bool {
        self.tools.iter().any(|t| t.count_ones() > 1)
    }

    #[must_use]
    pub fn sub(&self, other: &Self) -> Self {
        Self {
            tools: std::array::from_fn(|e| self.tools[e] & !other.tools[e]),
        }
    }

    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        Self {
            tools: std::array::from_fn(|e| self.tools[e] & other.tools[e]),
        }
    }

    /// Drops every event for `tool`.
    pub fn clear_tool(&mut self, tool: u8) {
        for mask in &mut self.tools {
            *mask &= !(1 << tool);
        }
    }

    #[must_use]
    pub fn events_for(&self, tool: u8) -> EventSet {
        events_for(&self.tools, tool)
    }

    pub fn set_events_for(&mut self, tool: u8, events: EventSet) {
        set_events_for(&mut self.tools, tool, events);
    }
}

impl GlobalMonitors {
    #[must_use]
    pub fn get(&self, event: Event) -> u8 {
        self.tools.get(event.tool_set_event().id()).copied().unwrap_or(0)
    }

    /// Global masks restricted to local events, merged with `local`.
    #[must_use]
    pub fn union_local(&self, local: &LocalMonitors) -> LocalMonitors {
        LocalMonitors {
            tools: std::array::from_fn(|e| self.tools[e] | local.tools[e]),
        }
    }

    #[must_use]
    pub fn events_for(&self, tool: u8) -> EventSet {
        events_for(&self.tools, tool)
    }

    pub fn set_events_for(&mut self, tool: u8, events: EventSet) {
        set_events_for(&mut self.tools, tool, events);
    }
}

fn events_for(tools: &[u8], tool: u8) -> EventSet {
    debug_assert!(usize::from(tool) < TOOL_IDS);
    tools
        .iter()
        .enumerate()
        .filter(|&(_, mask)| mask & (1 << tool) != 0)
        .fold(EventSet::empty(), |set, (e, _)| set | EventSet::from_bits_retain(1 << e))
}

fn set_events_for(tools: &mut [u8], tool: u8, events: EventSet) {
    for (e, mask) in tools.iter_mut().enumerate() {
        if events.bits() & (1 << e) != 0 {
            *mask |= 1 << tool;
        } else {
            *mask &= !(1 << tool);
        }
    }
}
