//! Bytecode instrumentation and event monitoring.
//!
//! Tools reserve an id, register callbacks per event and enable events either
//! globally or for single code objects. Enabling an event rewrites the slots
//! of affected code objects into instrumented forms; the dispatch loop then
//! calls [`Monitoring::step`] (or the `fire*` entry points) which deliver the
//! events to the registered callbacks.
//!
//! # Module Structure
//!
//! - `events` - Event ids, event sets and tool ids
//! - `tables` - Opcode to event and instrumented-opcode maps
//! - `monitors` - Per-event tool masks
//! - `data` - Per-code monitoring data and line tables
//! - `rewriter` - Slot rewriting
//! - `dispatch` - Event delivery and thread state
//! - `branch` - BRANCH compatibility wrappers
//! - `tools` - Ready-made tools
//!
//! # Versioning
//!
//! Every change to the global event sets bumps the monitoring version by
//! [`VERSION_INCREMENT`]. Code objects remember the version they were last
//! instrumented at and are brought up to date before they run.
//!
//! # Locking
//!
//! Changes to global state take the monitoring write lock, which doubles as
//! the stop-the-world pause: no dispatch can read tool masks while it is
//! held. Each code object's slots sit behind their own lock. The monitoring
//! lock is always taken before a code lock and no lock is held while a
//! callback runs.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
};

use ahash::AHashMap;
use indexmap::IndexMap;

pub use callback::{Callback, CallbackResult, Disposition, EventArgs, MonitorCallback, Payload, callback};
pub use data::NO_LINE;
pub use dispatch::ThreadState;
pub use error::MonitoringError;
pub use events::{
    COVERAGE_ID, DEBUGGER_ID, EVENTS, Event, EventSet, LOCAL_EVENTS, OPTIMIZER_ID, PROFILER_ID, SYS_PROFILE_ID,
    SYS_TRACE_ID, TOOL_IDS, UNGROUPED_EVENTS,
};
pub use monitors::{GlobalMonitors, LocalMonitors};
pub use tables::{de_instrument, event_for_opcode, instrumented, opcode_has_event};
pub use tools::{CoverageTool, LoggingTool, ProfilingReport, ProfilingTool, RecordedEvent, RecordingTool};

use self::{
    branch::branch_handlers,
    callback::CallbackSlot,
    rewriter::{force_instrument, instrument_if_stale},
};
use crate::bytecode::Code;

mod branch;
mod callback;
pub(crate) mod data;
mod dispatch;
mod error;
mod events;
mod monitors;
mod rewriter;
pub(crate) mod tables;
mod tools;

/// Amount the monitoring version grows by on every change.
pub const VERSION_INCREMENT: u32 = 1 << 8;

/// Interpreter-wide monitoring state.
pub(crate) struct MonitoringState {
    pub global: GlobalMonitors,
    pub callables: [[Option<Callback>; EVENTS]; TOOL_IDS],
    pub tool_names: [Option<String>; TOOL_IDS],
    /// Per tool, the version at which it was last cleared.
    pub tool_versions: [u32; TOOL_IDS],
    pub version: u32,
    pub last_restart_version: u32,
}

impl MonitoringState {
    fn new() -> Self {
        Self {
            global: GlobalMonitors::default(),
            callables: std::array::from_fn(|_| std::array::from_fn(|_| None)),
            tool_names: std::array::from_fn(|_| None),
            tool_versions: [0; TOOL_IDS],
            version: 0,
            last_restart_version: 0,
        }
    }

    fn next_version(&self) -> Result<u32, MonitoringError> {
        self.version.checked_add(VERSION_INCREMENT).ok_or(MonitoringError::Overflow)
    }

    fn check_tool(&self, tool: u8) -> Result<(), MonitoringError> {
        if tool < SYS_PROFILE_ID && self.tool_names[usize::from(tool)].is_none() {
            return Err(MonitoringError::validation(format!("tool {tool} is not in use")));
        }
        Ok(())
    }
}

impl fmt::Debug for MonitoringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callables: Vec<Vec<CallbackSlot<'_>>> = self
            .callables
            .iter()
            .map(|row| row.iter().map(CallbackSlot).collect())
            .collect();
        f.debug_struct("MonitoringState")
            .field("global", &self.global)
            .field("callables", &callables)
            .field("tool_names", &self.tool_names)
            .field("tool_versions", &self.tool_versions)
            .field("version", &self.version)
            .field("last_restart_version", &self.last_restart_version)
            .finish()
    }
}

fn check_valid_tool(tool: u8) -> Result<(), MonitoringError> {
    if tool >= SYS_PROFILE_ID {
        return Err(MonitoringError::validation(format!(
            "invalid tool {tool} (must be between 0 and 5)"
        )));
    }
    Ok(())
}

/// Folds C_RETURN/C_RAISE into CALL and BRANCH into its two directions.
fn normalize_events(events: EventSet) -> Result<EventSet, MonitoringError> {
    let mut events = events;
    if events.intersects(EventSet::C_RETURN_EVENTS) && !events.contains(EventSet::C_RETURN_EVENTS | EventSet::CALL) {
        return Err(MonitoringError::validation(
            "cannot set C_RETURN or C_RAISE events independently",
        ));
    }
    events.remove(EventSet::C_RETURN_EVENTS);
    if events.contains(EventSet::BRANCH) {
        events.remove(EventSet::BRANCH);
        events.insert(EventSet::BRANCHES);
    }
    Ok(events)
}

/// The monitoring engine of one interpreter.
pub struct Monitoring {
    state: RwLock<MonitoringState>,
    /// Code objects that have been instrumented, keyed by address.
    codes: Mutex<AHashMap<usize, Weak<Code>>>,
}

impl Default for Monitoring {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Monitoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitoring").field("state", &*self.read()).finish_non_exhaustive()
    }
}

impl Monitoring {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MonitoringState::new()),
            codes: Mutex::new(AHashMap::new()),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, MonitoringState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pauses every dispatch until the guard is dropped.
    fn stop_the_world(&self) -> RwLockWriteGuard<'_, MonitoringState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current monitoring version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.read().version
    }

    #[must_use]
    pub fn last_restart_version(&self) -> u32 {
        self.read().last_restart_version
    }

    pub(crate) fn callable(&self, tool: u8, event: Event) -> Option<Callback> {
        self.read().callables[usize::from(tool)][event.id()].clone()
    }

    pub(crate) fn clear_callable(&self, tool: u8, event: Event) {
        self.stop_the_world().callables[usize::from(tool)][event.id()] = None;
    }

    /// Reserves `tool` under `name`.
    pub fn use_tool_id(&self, tool: u8, name: impl Into<String>) -> Result<(), MonitoringError> {
        check_valid_tool(tool)?;
        let mut state = self.stop_the_world();
        let slot = &mut state.tool_names[usize::from(tool)];
        if slot.is_some() {
            return Err(MonitoringError::validation(format!("tool {tool} is already in use")));
        }
        *slot = Some(name.into());
        Ok(())
    }

    /// Unregisters every callback of `tool` and disables all its events,
    /// global and local. The tool stays reserved.
    pub fn clear_tool_id(&self, tool: u8) -> Result<(), MonitoringError> {
        check_valid_tool(tool)?;
        let mut state = self.stop_the_world();
        if state.tool_names[usize::from(tool)].is_none() {
            return Ok(());
        }
        self.clear_tool_locked(&mut state, tool)
    }

    /// Clears `tool` and releases its id.
    pub fn free_tool_id(&self, tool: u8) -> Result<(), MonitoringError> {
        check_valid_tool(tool)?;
        let mut state = self.stop_the_world();
        if state.tool_names[usize::from(tool)].is_some() {
            self.clear_tool_locked(&mut state, tool)?;
        }
        state.tool_names[usize::from(tool)] = None;
        Ok(())
    }

    fn clear_tool_locked(&self, state: &mut MonitoringState, tool: u8) -> Result<(), MonitoringError> {
        // both bumps are checked before anything is cleared
        let cleared = if state.global.events_for(tool).is_empty() {
            state.version
        } else {
            state.next_version()?
        };
        let version = cleared.checked_add(VERSION_INCREMENT).ok_or(MonitoringError::Overflow)?;
        for slot in &mut state.callables[usize::from(tool)] {
            *slot = None;
        }
        state.global.set_events_for(tool, EventSet::empty());
        // local events set before this version are dropped on the next rewrite
        state.tool_versions[usize::from(tool)] = version;
        state.version = version;
        log::debug!("cleared tool {tool}, monitoring version {version:#x}");
        self.instrument_all(state)
    }

    /// The name `tool` was reserved under.
    pub fn get_tool(&self, tool: u8) -> Result<Option<String>, MonitoringError> {
        check_valid_tool(tool)?;
        Ok(self.read().tool_names[usize::from(tool)].clone())
    }

    /// Registers `callback` for a single event and returns the previous one.
    ///
    /// Registering for BRANCH installs wrappers on BRANCH_LEFT and
    /// BRANCH_RIGHT; the previous BRANCH_LEFT callback is returned.
    pub fn register_callback(
        &self,
        tool: u8,
        event: EventSet,
        callback: Option<Callback>,
    ) -> Result<Option<Callback>, MonitoringError> {
        check_valid_tool(tool)?;
        if event.bits().count_ones() != 1 {
            return Err(MonitoringError::validation(
                "The callback can only be set for one event at a time",
            ));
        }
        let event_id = event.bits().trailing_zeros();
        let Some(event) = u8::try_from(event_id).ok().and_then(Event::from_repr) else {
            return Err(MonitoringError::validation(format!("invalid event {}", event.bits())));
        };
        let tool_index = usize::from(tool);
        let previous = if event == Event::Branch {
            let (left, right) = match &callback {
                Some(callback) => {
                    let (left, right) = branch_handlers(tool, callback);
                    (Some(left), Some(right))
                }
                None => (None, None),
            };
            let mut state = self.stop_the_world();
            let row = &mut state.callables[tool_index];
            row[Event::BranchRight.id()] = right;
            std::mem::replace(&mut row[Event::BranchLeft.id()], left)
        } else {
            let mut state = self.stop_the_world();
            std::mem::replace(&mut state.callables[tool_index][event.id()], callback)
        };
        Ok(previous.map(|previous| previous.wrapped().unwrap_or(previous)))
    }

    /// Global events enabled for `tool`.
    pub fn get_events(&self, tool: u8) -> Result<EventSet, MonitoringError> {
        check_valid_tool(tool)?;
        Ok(self.read().global.events_for(tool))
    }

    /// Enables exactly `events` globally for `tool`.
    pub fn set_events(&self, tool: u8, events: EventSet) -> Result<(), MonitoringError> {
        check_valid_tool(tool)?;
        if events.bits() >= 1 << EVENTS {
            return Err(MonitoringError::validation(format!("invalid event set {:#x}", events.bits())));
        }
        let events = normalize_events(events)?;
        let mut state = self.stop_the_world();
        state.check_tool(tool)?;
        self.set_events_locked(&mut state, tool, events)
    }

    fn set_events_locked(&self, state: &mut MonitoringState, tool: u8, events: EventSet) -> Result<(), MonitoringError> {
        if state.global.events_for(tool) == events {
            return Ok(());
        }
        let version = state.next_version()?;
        state.global.set_events_for(tool, events);
        state.version = version;
        log::debug!("tool {tool} events set to {:#x}, monitoring version {version:#x}", events.bits());
        self.instrument_all(state)
    }

    /// Events enabled for `tool` on `code` alone.
    pub fn get_local_events(&self, code: &Arc<Code>, tool: u8) -> Result<EventSet, MonitoringError> {
        check_valid_tool(tool)?;
        let state = code.state();
        Ok(state
            .monitoring
            .as_ref()
            .map_or(EventSet::empty(), |data| data.local_monitors.events_for(tool)))
    }

    /// Enables exactly `events` for `tool` on `code`.
    pub fn set_local_events(&self, code: &Arc<Code>, tool: u8, events: EventSet) -> Result<(), MonitoringError> {
        check_valid_tool(tool)?;
        let events = normalize_events(events)?;
        if events.bits() >= 1 << LOCAL_EVENTS {
            return Err(MonitoringError::validation(format!(
                "invalid local event set {:#x}",
                events.bits()
            )));
        }
        if code.is_shim() {
            return Err(MonitoringError::System(format!(
                "cannot instrument shim code object '{}'",
                code.name()
            )));
        }
        // global state is only read here
        let monitoring = self.read();
        monitoring.check_tool(tool)?;
        self.track(code);
        let mut state = code.state_mut();
        let data = state
            .monitoring
            .get_or_insert_with(|| data::MonitoringData::new(code));
        let tool_index = usize::from(tool);
        data.tool_versions[tool_index] = monitoring.tool_versions[tool_index];
        if data.local_monitors.events_for(tool) == events {
            return Ok(());
        }
        data.local_monitors.set_events_for(tool, events);
        log::debug!(
            "tool {tool} local events on {} set to {:#x}",
            code.qualname(),
            events.bits()
        );
        force_instrument(code, &mut state, &monitoring)
    }

    /// Forces every code object to be fully re-instrumented, re-enabling
    /// all locations disabled by callbacks.
    pub fn restart_events(&self) -> Result<(), MonitoringError> {
        let mut state = self.stop_the_world();
        let restart = state.next_version()?;
        let version = restart
            .checked_add(VERSION_INCREMENT)
            .filter(|&v| v > VERSION_INCREMENT)
            .ok_or(MonitoringError::Overflow)?;
        state.last_restart_version = restart;
        state.version = version;
        log::debug!("events restarted, monitoring version {version:#x}");
        self.instrument_all(&state)
    }

    /// Per event name, the mask of tools with it enabled globally.
    #[must_use]
    pub fn all_events(&self) -> IndexMap<&'static str, u8> {
        let state = self.read();
        (0..UNGROUPED_EVENTS as u8)
            .filter_map(Event::from_repr)
            .filter_map(|event| {
                let tools = state.global.get(event);
                (tools != 0).then(|| (event.name(), tools))
            })
            .collect()
    }

    /// Reserves `tool`, registers `callback` for every event in `events`
    /// and enables them globally.
    pub fn install(
        &self,
        tool: u8,
        name: impl Into<String>,
        events: EventSet,
        callback: Callback,
    ) -> Result<(), MonitoringError> {
        self.use_tool_id(tool, name)?;
        for event in events.events() {
            self.register_callback(tool, event.bit(), Some(Arc::clone(&callback)))?;
        }
        self.set_events(tool, events)
    }

    /// Brings `code` up to the current monitoring version.
    pub fn instrument(&self, code: &Arc<Code>) -> Result<(), MonitoringError> {
        let monitoring = self.read();
        if code.instrumentation_version() == monitoring.version {
            return Ok(());
        }
        self.track(code);
        let mut state = code.state_mut();
        instrument_if_stale(code, &mut state, &monitoring)
    }

    fn track(&self, code: &Arc<Code>) {
        let mut codes = self.codes.lock().unwrap_or_else(PoisonError::into_inner);
        // a dead entry may belong to a freed code object at the same address
        let entry = codes.entry(Arc::as_ptr(code).addr()).or_default();
        if entry.strong_count() == 0 {
            *entry = Arc::downgrade(code);
        }
    }

    /// Re-instruments every live tracked code object. Caller holds the write lock.
    fn instrument_all(&self, state: &MonitoringState) -> Result<(), MonitoringError> {
        let live: Vec<Arc<Code>> = {
            let mut codes = self.codes.lock().unwrap_or_else(PoisonError::into_inner);
            codes.retain(|_, code| code.strong_count() > 0);
            codes.values().filter_map(Weak::upgrade).collect()
        };
        for code in live {
            let mut code_state = code.state_mut();
            instrument_if_stale(&code, &mut code_state, state)?;
        }
        Ok(())
    }

    /// Number of live code objects the engine keeps instrumented.
    #[must_use]
    pub fn tracked_code_count(&self) -> usize {
        let codes = self.codes.lock().unwrap_or_else(PoisonError::into_inner);
        codes.values().filter(|code| code.strong_count() > 0).count()
    }
}
