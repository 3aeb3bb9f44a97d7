//! Per-code monitoring data and its lazily allocated tables.
//!
//! Tables are only allocated once something needs them: the per-slot tool
//! table when two tools share an event, the line table when LINE is active,
//! and the per-slot line and instruction tool tables when several tools
//! watch lines or instructions. Allocation is fallible and always happens
//! before any slot is rewritten.

use ahash::AHashMap;

use super::{
    error::MonitoringError,
    events::{Event, TOOL_IDS},
    monitors::{GlobalMonitors, LocalMonitors},
    tables::{event_for_opcode, never_starts_line, opcode_has_event},
};
use crate::bytecode::{Code, CodeState, Opcode, Slot};

/// Line delta stored for code units without a line.
pub const NO_LINE: i32 = -2;

/// The slots a branch can report from, keyed by the branch's source offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BranchSite {
    /// Slot firing BRANCH_LEFT, if the compiler kept one.
    pub left: Option<usize>,
    /// Slot firing BRANCH_RIGHT.
    pub right: Option<usize>,
}

/// Monitoring state of one code object.
#[derive(Debug)]
pub(crate) struct MonitoringData {
    /// Events enabled for this code object only.
    pub local_monitors: LocalMonitors,
    /// Events currently instrumented: global plus local.
    pub active_monitors: LocalMonitors,
    /// Per-slot tool masks; present once several tools share an event.
    pub tools: Option<Box<[u8]>>,
    pub lines: Option<LineTable>,
    pub line_tools: Option<Box<[u8]>>,
    pub per_instruction_tools: Option<Box<[u8]>>,
    /// Per tool, the interpreter tool version the local events were set under.
    pub tool_versions: [u32; TOOL_IDS],
    pub branch_sites: AHashMap<usize, BranchSite>,
}

impl MonitoringData {
    pub fn new(code: &Code) -> Self {
        Self {
            local_monitors: LocalMonitors::default(),
            active_monitors: LocalMonitors::default(),
            tools: None,
            lines: None,
            line_tools: None,
            per_instruction_tools: None,
            tool_versions: [0; TOOL_IDS],
            branch_sites: branch_sites(code),
        }
    }

    /// Whether the instruction at `i` starts a line.
    pub fn starts_line(&self, i: usize) -> bool {
        self.lines.as_ref().is_some_and(|lines| lines.starts_line(i))
    }
}

/// Per-unit line information: a line-start marker (the base opcode, or 0)
/// followed by the line delta from the first line, stored as `delta + 2`
/// in the smallest little-endian width that fits every delta.
#[derive(Debug)]
pub(crate) struct LineTable {
    bytes_per_entry: usize,
    data: Box<[u8]>,
}

impl LineTable {
    /// Entry width for the largest line delta in a code object.
    pub fn bytes_per_entry(max_delta: i64) -> usize {
        let no_line = i64::from(NO_LINE);
        if max_delta < 256 + no_line {
            2
        } else if max_delta < (1 << 16) + no_line {
            3
        } else if max_delta < (1 << 24) + no_line {
            4
        } else {
            5
        }
    }

    pub fn build(code: &Code) -> Result<Self, MonitoringError> {
        let first_line = i64::from(code.first_line());
        let max_line = code
            .offsets_from(code.first_traceable())
            .filter_map(|i| code.line(i))
            .map(i64::from)
            .fold(first_line + 1, i64::max);
        let bytes_per_entry = Self::bytes_per_entry(max_line - first_line);
        let data = try_filled(code.len() * bytes_per_entry, 0)?;
        let mut table = Self {
            bytes_per_entry,
            data: data.into_boxed_slice(),
        };
        table.initialize(code);
        Ok(table)
    }

    pub fn entry_width(&self) -> usize {
        self.bytes_per_entry
    }

    pub fn starts_line(&self, i: usize) -> bool {
        self.data.get(i * self.bytes_per_entry).is_some_and(|&op| op != 0)
    }

    fn mark_line_start(&mut self, i: usize, op: Option<Opcode>) {
        self.data[i * self.bytes_per_entry] = op.map_or(0, |op| op as u8);
    }

    pub fn line_delta(&self, i: usize) -> i32 {
        let start = i * self.bytes_per_entry + 1;
        let Some(bytes) = self.data.get(start..start + self.bytes_per_entry - 1) else {
            return NO_LINE;
        };
        let value = bytes
            .iter()
            .enumerate()
            .fold(0u32, |acc, (j, &b)| acc | (u32::from(b) << (8 * j)));
        i32::try_from(value).map_or(NO_LINE, |value| value + NO_LINE)
    }

    fn set_line_delta(&mut self, i: usize, delta: i32) {
        let start = i * self.bytes_per_entry + 1;
        let stored = u32::try_from(delta - NO_LINE).unwrap_or(0).to_le_bytes();
        let width = self.bytes_per_entry - 1;
        self.data[start..start + width].copy_from_slice(&stored[..width]);
    }

    /// Source line of the unit at `i`.
    pub fn line(&self, code: &Code, i: usize) -> Option<u32> {
        let delta = self.line_delta(i);
        if delta == NO_LINE {
            return None;
        }
        u32::try_from(i64::from(code.first_line()) + i64::from(delta)).ok()
    }

    fn initialize(&mut self, code: &Code) {
        let mut current_line = None;
        for i in code.offsets_from(0) {
            let op = code.base_opcode(i);
            let line = code.line(i);
            self.set_line_delta(i, compute_line_delta(code, line));
            if i < code.first_traceable() || never_starts_line(op) {
                continue;
            }
            if line.is_some() && line != current_line {
                self.mark_line_start(i, Some(op));
            }
            current_line = line;
        }
        // jump targets start lines even when the line number repeats
        for i in code.offsets_from(code.first_traceable()) {
            let op = code.base_opcode(i);
            let is_jump = op.is_conditional_jump()
                || matches!(
                    op,
                    Opcode::JumpForward
                        | Opcode::ForIter
                        | Opcode::Send
                        | Opcode::JumpBackward
                        | Opcode::JumpBackwardNoInterrupt
                );
            if !is_jump {
                continue;
            }
            if let Some(target) = code.jump_target(i)
                && target < code.len()
                && self.line_delta(target) != NO_LINE
                && code.base_opcode(target) != Opcode::PopIter
            {
                self.mark_line_start(target, Some(code.base_opcode(target)));
            }
        }
        for entry in code.exception_table() {
            let handler = entry.handler;
            if handler < code.len()
                && self.line_delta(handler) != NO_LINE
                && code.base_opcode(handler) != Opcode::EndAsyncFor
            {
                self.mark_line_start(handler, Some(code.base_opcode(handler)));
            }
        }
    }
}

fn compute_line_delta(code: &Code, line: Option<u32>) -> i32 {
    line.and_then(|line| i32::try_from(i64::from(line) - i64::from(code.first_line())).ok())
        .filter(|&delta| delta > NO_LINE)
        .unwrap_or(NO_LINE)
}

pub(crate) fn try_filled(len: usize, value: u8) -> Result<Vec<u8>, MonitoringError> {
    let mut out = Vec::new();
    out.try_reserve_exact(len).map_err(|_| MonitoringError::OutOfMemory)?;
    out.resize(len, value);
    Ok(out)
}

/// Fills a fresh tool table from the tools currently instrumented.
fn initialize_tools(code: &Code, slots: &[Slot], active: &LocalMonitors, tools: &mut [u8]) {
    for i in code.offsets_from(0) {
        let base = code.base_opcode(i);
        if !opcode_has_event(base) {
            continue;
        }
        tools[i] = match event_for_opcode(base, code.oparg(i)) {
            Some(event) if slots[i].underlying().is_instrumented() => active.get(event),
            _ => 0,
        };
    }
}

fn branch_sites(code: &Code) -> AHashMap<usize, BranchSite> {
    let mut sites = AHashMap::new();
    let is_at = |i: usize, op: Opcode| i < code.len() && code.base_opcode(i) == op;
    for i in code.offsets_from(0) {
        let next = code.next_offset(i);
        match code.base_opcode(i) {
            op if op.is_conditional_jump() => {
                sites.insert(
                    i,
                    BranchSite {
                        left: is_at(next, Opcode::NotTaken).then_some(next),
                        right: Some(i),
                    },
                );
            }
            Opcode::ForIter => {
                let pop_iter = code.jump_target(i).filter(|&t| is_at(t, Opcode::PopIter));
                sites.insert(
                    i,
                    BranchSite {
                        left: Some(i),
                        right: pop_iter,
                    },
                );
            }
            Opcode::EndAsyncFor => {
                if let Some(src) = next.checked_sub(code.oparg(i) as usize) {
                    sites.insert(
                        src,
                        BranchSite {
                            left: is_at(src + 1, Opcode::NotTaken).then_some(src + 1),
                            right: Some(i),
                        },
                    );
                }
            }
            _ => {}
        }
    }
    sites
}

/// Brings the tables of `state` in line with the current event sets and
/// returns the union of global and local events.
///
/// Local events of tools cleared since they were set are dropped first.
pub(crate) fn update_instrumentation_data(
    code: &Code,
    state: &mut CodeState,
    global: &GlobalMonitors,
    tool_versions: &[u32; TOOL_IDS],
) -> Result<LocalMonitors, MonitoringError> {
    let len = code.len();
    let CodeState { slots, monitoring, .. } = state;
    let data = monitoring.get_or_insert_with(|| MonitoringData::new(code));
    for (tool, version) in tool_versions.iter().enumerate() {
        if data.tool_versions[tool] != *version {
            data.local_monitors.clear_tool(tool as u8);
        }
    }
    let all_events = global.union_local(&data.local_monitors);
    let multitools = all_events.multiple_tools();
    if data.tools.is_none() && multitools {
        let mut tools = try_filled(len, 0)?;
        initialize_tools(code, slots, &data.active_monitors, &mut tools);
        data.tools = Some(tools.into_boxed_slice());
    }
    let line_tools = all_events.get(Event::Line);
    if line_tools != 0 {
        if data.lines.is_none() {
            data.lines = Some(LineTable::build(code)?);
        }
        if multitools && data.line_tools.is_none() {
            data.line_tools = Some(try_filled(len, line_tools)?.into_boxed_slice());
        }
    }
    if all_events.get(Event::Instruction) != 0 && multitools && data.per_instruction_tools.is_none() {
        data.per_instruction_tools = Some(try_filled(len, 0)?.into_boxed_slice());
    }
    Ok(all_events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeBuilder;

    #[test]
    fn entry_width_grows_with_line_span() {
        assert_eq!(LineTable::bytes_per_entry(0), 2);
        assert_eq!(LineTable::bytes_per_entry(253), 2);
        assert_eq!(LineTable::bytes_per_entry(254), 3);
        assert_eq!(LineTable::bytes_per_entry(65_533), 3);
        assert_eq!(LineTable::bytes_per_entry(65_534), 4);
        assert_eq!(LineTable::bytes_per_entry(1 << 24), 5);
    }

    #[test]
    fn line_starts_follow_line_changes() {
        let mut builder = CodeBuilder::new("f").first_line(10);
        builder.emit_arg(Opcode::Resume, 0);
        builder.set_line(11);
        let a = builder.emit(Opcode::Nop);
        let b = builder.emit(Opcode::PopTop);
        builder.set_line(12);
        let c = builder.emit(Opcode::ReturnValue);
        let code = builder.build();
        let table = LineTable::build(&code).unwrap();
        assert!(!table.starts_line(0), "RESUME never starts a line");
        assert!(table.starts_line(a));
        assert!(!table.starts_line(b));
        assert!(table.starts_line(c));
        assert_eq!(table.line(&code, b), Some(11));
        assert_eq!(table.entry_width(), 2);
    }

    #[test]
    fn wide_line_deltas_survive_encoding() {
        let mut builder = CodeBuilder::new("f").first_line(1);
        builder.set_line(70_000);
        let at = builder.emit(Opcode::Nop);
        builder.clear_line();
        let none = builder.emit(Opcode::ReturnValue);
        let code = builder.build();
        let table = LineTable::build(&code).unwrap();
        assert_eq!(table.entry_width(), 4);
        assert_eq!(table.line(&code, at), Some(70_000));
        assert_eq!(table.line(&code, none), None);
    }
}
