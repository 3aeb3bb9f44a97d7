//! Instrumentation rewriter.
//!
//! Brings a code object's slots in line with the events currently active for
//! it. Every function here runs with the code object's lock held, and the
//! callers that touch more than one code object also hold the monitoring
//! write lock, so the dispatch loop never observes a half-rewritten slot.
//!
//! Rewriting is incremental: only tools that were added or removed since the
//! code object was last instrumented are applied, except after a restart,
//! when everything is removed and re-added.

use super::{
    MonitoringState,
    data::update_instrumentation_data,
    events::Event,
    tables::{event_for_opcode, skips_instruction_overlay},
};
use crate::{
    bytecode::{Code, CodeState, Underlying},
    monitoring::MonitoringError,
};

fn instrument(state: &mut CodeState, i: usize) {
    let slot = state.slots[i];
    if let Underlying::Plain(op) = slot.underlying() {
        state.slots[i] = slot.with_underlying(Underlying::Instrumented(op));
        state.reset_cache(i, op);
        log::trace!("instrumented {op} at {i}");
    }
}

fn de_instrument(state: &mut CodeState, i: usize) {
    let slot = state.slots[i];
    if let Underlying::Instrumented(op) = slot.underlying() {
        state.slots[i] = slot.with_underlying(Underlying::Plain(op));
        state.reset_cache(i, op);
        log::trace!("de-instrumented {op} at {i}");
    }
}

/// Removes `tools` from the event fired at `i`, restoring the plain opcode
/// once no tool is left.
pub(crate) fn remove_tools(state: &mut CodeState, i: usize, event: Event, tools: u8) {
    let Some(data) = state.monitoring.as_mut() else {
        return;
    };
    let should_de_instrument = match data.tools.as_mut() {
        Some(table) => {
            table[i] &= !tools;
            table[i] == 0
        }
        None => {
            let single = data.active_monitors.get(event);
            single & tools == single
        }
    };
    if should_de_instrument {
        de_instrument(state, i);
    }
}

pub(crate) fn add_tools(state: &mut CodeState, i: usize, tools: u8) {
    if let Some(table) = state.monitoring.as_mut().and_then(|data| data.tools.as_mut()) {
        table[i] |= tools;
    }
    instrument(state, i);
}

pub(crate) fn remove_line_tools(state: &mut CodeState, i: usize, tools: u8) {
    let Some(data) = state.monitoring.as_mut() else {
        return;
    };
    let should_de_instrument = match data.line_tools.as_mut() {
        Some(table) => {
            table[i] &= !tools;
            table[i] == 0
        }
        None => {
            let single = data.active_monitors.get(Event::Line);
            single & tools == single
        }
    };
    if should_de_instrument {
        state.slots[i] = state.slots[i].without_line();
    }
}

pub(crate) fn add_line_tools(state: &mut CodeState, i: usize, tools: u8) {
    if let Some(table) = state.monitoring.as_mut().and_then(|data| data.line_tools.as_mut()) {
        table[i] |= tools;
    }
    state.slots[i] = state.slots[i].with_line();
}

pub(crate) fn remove_per_instruction_tools(state: &mut CodeState, i: usize, tools: u8) {
    let Some(data) = state.monitoring.as_mut() else {
        return;
    };
    let should_de_instrument = match data.per_instruction_tools.as_mut() {
        Some(table) => {
            table[i] &= !tools;
            table[i] == 0
        }
        None => {
            let single = data.active_monitors.get(Event::Instruction);
            single & tools == single
        }
    };
    if should_de_instrument {
        state.slots[i] = state.slots[i].without_instruction();
    }
}

pub(crate) fn add_per_instruction_tools(state: &mut CodeState, i: usize, tools: u8) {
    if let Some(table) = state.monitoring.as_mut().and_then(|data| data.per_instruction_tools.as_mut()) {
        table[i] |= tools;
    }
    state.slots[i] = state.slots[i].with_instruction();
}

fn starts_line(state: &CodeState, i: usize) -> bool {
    state.monitoring.as_ref().is_some_and(|data| data.starts_line(i))
}

/// Re-instruments `code` unless it is already at the current version.
pub(crate) fn instrument_if_stale(
    code: &Code,
    state: &mut CodeState,
    monitoring: &MonitoringState,
) -> Result<(), MonitoringError> {
    if state.instrumentation_version == monitoring.version {
        return Ok(());
    }
    force_instrument(code, state, monitoring)
}

/// Recomputes the active events of `code` and rewrites its slots to match.
pub(crate) fn force_instrument(
    code: &Code,
    state: &mut CodeState,
    monitoring: &MonitoringState,
) -> Result<(), MonitoringError> {
    if code.no_monitoring_events() {
        return Ok(());
    }
    let active = update_instrumentation_data(code, state, &monitoring.global, &monitoring.tool_versions)?;
    let restarted = monitoring.last_restart_version > state.instrumentation_version;
    let Some(data) = state.monitoring.as_mut() else {
        return Ok(());
    };
    let (removed, added) = if restarted {
        (data.active_monitors, active)
    } else {
        (data.active_monitors.sub(&active), active.sub(&data.active_monitors))
    };
    debug_assert!(restarted || removed.and(&added).is_empty());
    data.active_monitors = active;

    if !(removed.is_empty() && added.is_empty()) {
        log::debug!(
            "instrumenting {} at version {:#x}{}",
            code.qualname(),
            monitoring.version,
            if restarted { " after restart" } else { "" }
        );
        let first = code.first_traceable();
        for i in code.offsets_from(first) {
            let Some(event) = event_for_opcode(code.base_opcode(i), code.oparg(i)) else {
                continue;
            };
            let gone = removed.get(event);
            if gone != 0 {
                remove_tools(state, i, event, gone);
            }
            let new = added.get(event);
            if new != 0 {
                add_tools(state, i, new);
            }
        }

        // both overlays are removed before either is added back, so a
        // removal never undoes a fresh addition
        let removed_line = removed.get(Event::Line);
        let removed_instruction = removed.get(Event::Instruction);
        if removed_line != 0 {
            for i in code.offsets_from(first) {
                if starts_line(state, i) {
                    remove_line_tools(state, i, removed_line);
                }
            }
        }
        if removed_instruction != 0 {
            for i in code.offsets_from(first) {
                if !skips_instruction_overlay(code.base_opcode(i)) {
                    remove_per_instruction_tools(state, i, removed_instruction);
                }
            }
        }

        let added_line = added.get(Event::Line);
        let added_instruction = added.get(Event::Instruction);
        if added_line != 0 {
            for i in code.offsets_from(first) {
                if starts_line(state, i) {
                    add_line_tools(state, i, added_line);
                }
            }
        }
        if added_instruction != 0 {
            for i in code.offsets_from(first) {
                if !skips_instruction_overlay(code.base_opcode(i)) {
                    add_per_instruction_tools(state, i, added_instruction);
                }
            }
        }
    }

    state.instrumentation_version = monitoring.version;
    Ok(())
}
