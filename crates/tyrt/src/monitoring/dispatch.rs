//! Event dispatch.
//!
//! The dispatch loop calls into this module whenever it reaches an
//! instrumented slot. Tool masks are read under the locks and the locks are
//! released before any callback runs, so callbacks are free to change event
//! sets, register callbacks or re-enter the engine.
//!
//! Tools are called from the highest id down. A callback returning
//! [`Disposition::Disable`] removes its tool from the firing location only.

use std::sync::Arc;

use super::{
    Monitoring,
    callback::{CallbackResult, Disposition, EventArgs, MonitorCallback, Payload},
    error::MonitoringError,
    events::{Event, tools_descending},
    monitors::GlobalMonitors,
    rewriter::{remove_line_tools, remove_per_instruction_tools, remove_tools},
};
use crate::{
    bytecode::{Code, CodeState, Opcode, Slot},
    exception::Exception,
    value::Value,
};

/// Per-thread dispatch state.
#[derive(Debug, Default)]
pub struct ThreadState {
    /// Non-zero while a callback or legacy hook runs; events are not delivered.
    tracing: u32,
    what_event: Option<Event>,
    pending_exception: Option<Exception>,
}

impl ThreadState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.tracing > 0
    }

    /// The event whose callback is running, if any.
    #[must_use]
    pub fn what_event(&self) -> Option<Event> {
        self.what_event
    }

    #[must_use]
    pub fn pending_exception(&self) -> Option<&Exception> {
        self.pending_exception.as_ref()
    }

    pub fn set_pending_exception(&mut self, exc: Exception) {
        self.pending_exception = Some(exc);
    }

    pub fn take_pending_exception(&mut self) -> Option<Exception> {
        self.pending_exception.take()
    }

    /// Runs `f` as trace-hook code: events fired inside are not delivered.
    pub fn with_tracing<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.tracing += 1;
        let result = f(self);
        self.tracing -= 1;
        result
    }

    fn call_one(&mut self, callback: &dyn MonitorCallback, args: &EventArgs<'_>) -> CallbackResult {
        let old = self.what_event.replace(args.event);
        self.tracing += 1;
        let result = callback.call(args);
        self.tracing -= 1;
        self.what_event = old;
        result
    }
}

/// Tools to call for `event` fired from slot `i`.
fn tools_for_instruction(state: &CodeState, global: &GlobalMonitors, i: usize, event: Event) -> u8 {
    let event = event.tool_set_event();
    if !event.is_local() {
        return global.get(event);
    }
    state.monitoring.as_ref().map_or(0, |data| match &data.tools {
        Some(table) => table.get(i).copied().unwrap_or(0),
        None => data.active_monitors.get(event),
    })
}

/// The opcode an instruction overlay hands over to.
fn after_instruction_overlay(slot: Slot) -> Opcode {
    if slot.has_line() {
        Opcode::InstrumentedLine
    } else {
        slot.underlying().opcode()
    }
}

impl Monitoring {
    /// Fires an ordinary event for the instruction at `offset`.
    pub fn fire(
        &self,
        thread: &mut ThreadState,
        event: Event,
        code: &Arc<Code>,
        offset: usize,
        payload: Payload<'_>,
    ) -> Result<(), MonitoringError> {
        self.call_vector(thread, event, code, offset, offset, payload)
    }

    /// Fires JUMP, BRANCH_LEFT or BRANCH_RIGHT from the slot at `offset`,
    /// reporting `src` as the deciding instruction. Returns where execution
    /// continues.
    pub fn fire_jump(
        &self,
        thread: &mut ThreadState,
        event: Event,
        code: &Arc<Code>,
        offset: usize,
        src: usize,
        dest: usize,
    ) -> Result<usize, MonitoringError> {
        debug_assert!(matches!(event, Event::Jump | Event::BranchLeft | Event::BranchRight));
        self.call_vector(thread, event, code, offset, src, Payload::Destination(dest))?;
        Ok(dest)
    }

    /// Fires an event while an exception is being raised or unwound.
    ///
    /// The pending exception is passed to the callbacks and restored
    /// afterwards; if a callback raises, its exception replaces it.
    pub fn fire_protected(
        &self,
        thread: &mut ThreadState,
        event: Event,
        code: &Arc<Code>,
        offset: usize,
    ) -> Result<(), MonitoringError> {
        let Some(exc) = thread.take_pending_exception() else {
            return Err(MonitoringError::NoPendingException(event));
        };
        let result = self.call_vector(thread, event, code, offset, offset, Payload::Exception(&exc));
        if result.is_ok() {
            thread.set_pending_exception(exc);
        }
        result
    }

    /// Fires LINE for the line-start slot at `offset`, coming from `prev`.
    ///
    /// Nothing fires when `prev` is on the same line, unless `prev` is a
    /// `RESUME`. Returns the opcode the overlay shadows.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds for `code`.
    pub fn fire_line(
        &self,
        thread: &mut ThreadState,
        code: &Arc<Code>,
        offset: usize,
        prev: Option<usize>,
    ) -> Result<Opcode, MonitoringError> {
        if thread.is_tracing() {
            return Ok(code.slot(offset).underlying().opcode());
        }
        let (line, tools) = {
            let monitoring = self.read();
            let state = code.state();
            let Some(data) = state.monitoring.as_ref() else {
                return Ok(state.slots[offset].underlying().opcode());
            };
            let Some(line) = data.lines.as_ref().and_then(|lines| lines.line(code, offset)) else {
                return Ok(state.slots[offset].underlying().opcode());
            };
            if let Some(prev) = prev
                && data.lines.as_ref().and_then(|lines| lines.line(code, prev)) == Some(line)
                && code.base_opcode(prev) != Opcode::Resume
            {
                return Ok(state.slots[offset].underlying().opcode());
            }
            let tools = match &data.line_tools {
                Some(table) => table.get(offset).copied().unwrap_or(0),
                None => monitoring.global.get(Event::Line) | data.local_monitors.get(Event::Line),
            };
            (line, tools)
        };
        for tool in tools_descending(tools) {
            let Some(callback) = self.callable(tool, Event::Line) else {
                continue;
            };
            let args = EventArgs {
                event: Event::Line,
                tool,
                code,
                offset,
                line: Some(line),
                payload: Payload::None,
            };
            if thread.call_one(callback.as_ref(), &args)? == Disposition::Disable {
                remove_line_tools(&mut code.state_mut(), offset, 1 << tool);
            }
        }
        Ok(code.slot(offset).underlying().opcode())
    }

    /// Fires INSTRUCTION for the slot at `offset`. Returns the opcode the
    /// overlay hands over to.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds for `code`.
    pub fn fire_instruction(
        &self,
        thread: &mut ThreadState,
        code: &Arc<Code>,
        offset: usize,
    ) -> Result<Opcode, MonitoringError> {
        let next = after_instruction_overlay(code.slot(offset));
        if thread.is_tracing() {
            return Ok(next);
        }
        let tools = {
            let monitoring = self.read();
            let state = code.state();
            let Some(data) = state.monitoring.as_ref() else {
                return Ok(next);
            };
            match &data.per_instruction_tools {
                Some(table) => table.get(offset).copied().unwrap_or(0),
                None => monitoring.global.get(Event::Instruction) | data.local_monitors.get(Event::Instruction),
            }
        };
        for tool in tools_descending(tools) {
            let Some(callback) = self.callable(tool, Event::Instruction) else {
                continue;
            };
            let args = EventArgs {
                event: Event::Instruction,
                tool,
                code,
                offset,
                line: None,
                payload: Payload::None,
            };
            if thread.call_one(callback.as_ref(), &args)? == Disposition::Disable {
                remove_per_instruction_tools(&mut code.state_mut(), offset, 1 << tool);
            }
        }
        Ok(next)
    }

    /// Executes the monitoring side of the instruction at `offset`.
    ///
    /// Brings the code object up to date, then fires whatever the slot
    /// carries: INSTRUCTION, then LINE, then the opcode's own event.
    /// `branch_taken` says which way a conditional instruction went.
    /// Returns the base opcode to execute.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds for `code`.
    pub fn step(
        &self,
        thread: &mut ThreadState,
        code: &Arc<Code>,
        offset: usize,
        prev: Option<usize>,
        branch_taken: bool,
    ) -> Result<Opcode, MonitoringError> {
        self.instrument(code)?;
        if code.slot(offset).has_instruction() {
            self.fire_instruction(thread, code, offset)?;
        }
        if code.slot(offset).has_line() {
            self.fire_line(thread, code, offset, prev)?;
        }
        let underlying = code.slot(offset).underlying();
        let base = underlying.base();
        if underlying.is_instrumented() {
            self.fire_opcode_event(thread, code, offset, prev, branch_taken)?;
        }
        Ok(base)
    }

    fn fire_opcode_event(
        &self,
        thread: &mut ThreadState,
        code: &Arc<Code>,
        offset: usize,
        prev: Option<usize>,
        branch_taken: bool,
    ) -> Result<(), MonitoringError> {
        let none = Value::None;
        let next = code.next_offset(offset);
        let src = prev.unwrap_or(offset);
        match code.base_opcode(offset) {
            Opcode::Resume => {
                let event = if code.oparg(offset) == 0 {
                    Event::PyStart
                } else {
                    Event::PyResume
                };
                self.fire(thread, event, code, offset, Payload::None)
            }
            Opcode::ReturnValue => self.fire(thread, Event::PyReturn, code, offset, Payload::Value(&none)),
            Opcode::YieldValue => self.fire(thread, Event::PyYield, code, offset, Payload::Value(&none)),
            Opcode::Call | Opcode::CallKw | Opcode::CallFunctionEx | Opcode::LoadSuperAttr => {
                let payload = Payload::Call {
                    callable: &none,
                    arg0: None,
                };
                self.fire(thread, Event::Call, code, offset, payload)
            }
            Opcode::EndFor | Opcode::EndSend => {
                self.fire(thread, Event::StopIteration, code, offset, Payload::Value(&none))
            }
            Opcode::JumpForward | Opcode::JumpBackward => {
                let dest = code.jump_target(offset).unwrap_or(next);
                self.fire_jump(thread, Event::Jump, code, offset, offset, dest).map(drop)
            }
            op if op.is_conditional_jump() => {
                if branch_taken {
                    let dest = code.jump_target(offset).unwrap_or(next);
                    self.fire_jump(thread, Event::BranchRight, code, offset, offset, dest)?;
                }
                Ok(())
            }
            Opcode::ForIter => {
                if !branch_taken {
                    self.fire_jump(thread, Event::BranchLeft, code, offset, offset, next)?;
                }
                Ok(())
            }
            Opcode::NotTaken => self.fire_jump(thread, Event::BranchLeft, code, offset, src, next).map(drop),
            Opcode::PopIter => self.fire_jump(thread, Event::BranchRight, code, offset, src, next).map(drop),
            Opcode::EndAsyncFor => {
                let src = next.saturating_sub(code.oparg(offset) as usize);
                self.fire_jump(thread, Event::BranchRight, code, offset, src, next).map(drop)
            }
            _ => Ok(()),
        }
    }

    fn call_vector(
        &self,
        thread: &mut ThreadState,
        event: Event,
        code: &Arc<Code>,
        offset: usize,
        reported: usize,
        payload: Payload<'_>,
    ) -> Result<(), MonitoringError> {
        if thread.is_tracing() {
            return Ok(());
        }
        let tools = {
            let monitoring = self.read();
            let state = code.state();
            tools_for_instruction(&state, &monitoring.global, offset, event)
        };
        for tool in tools_descending(tools) {
            let Some(callback) = self.callable(tool, event) else {
                continue;
            };
            let args = EventArgs {
                event,
                tool,
                code,
                offset: reported,
                line: None,
                payload,
            };
            if thread.call_one(callback.as_ref(), &args)? == Disposition::Continue {
                continue;
            }
            if event.is_local() {
                remove_tools(&mut code.state_mut(), offset, event, 1 << tool);
            } else {
                self.clear_callable(tool, event);
                return Err(MonitoringError::DisableNotAllowed(event));
            }
        }
        Ok(())
    }
}
