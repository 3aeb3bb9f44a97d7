//! Callback interface for monitoring tools.

use std::{fmt, sync::Arc};

use super::events::Event;
use crate::{bytecode::Code, exception::Exception, value::Value};

/// What a callback asks the dispatcher to do after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    Continue,
    /// Stop delivering this event to this tool at this location.
    ///
    /// Only local events can be disabled; returning this for any other event
    /// unregisters the callback and raises `ValueError`.
    Disable,
}

pub type CallbackResult = Result<Disposition, Exception>;

/// Event-specific callback arguments.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// PY_START, PY_RESUME, LINE, INSTRUCTION.
    None,
    /// PY_RETURN and PY_YIELD (the value), STOP_ITERATION (the stop value).
    Value(&'a Value),
    /// CALL, C_RETURN and C_RAISE.
    Call { callable: &'a Value, arg0: Option<&'a Value> },
    /// JUMP, BRANCH_LEFT and BRANCH_RIGHT: where control goes next.
    Destination(usize),
    /// RAISE, RERAISE, EXCEPTION_HANDLED, PY_UNWIND, PY_THROW.
    Exception(&'a Exception),
}

/// Everything a callback is told about one event.
#[derive(Debug, Clone, Copy)]
pub struct EventArgs<'a> {
    pub event: Event,
    /// The tool being called.
    pub tool: u8,
    pub code: &'a Arc<Code>,
    /// Code-unit offset of the instruction; for branches, of the instruction
    /// that decided the direction.
    pub offset: usize,
    /// The line number, for LINE events.
    pub line: Option<u32>,
    pub payload: Payload<'a>,
}

/// A monitoring callback.
///
/// Closures taking `&EventArgs` implement this directly. Callbacks run with
/// no engine lock held and may call back into the monitoring API.
pub trait MonitorCallback: Send + Sync {
    fn call(&self, args: &EventArgs<'_>) -> CallbackResult;

    /// The user callback behind a wrapper the engine installed for it.
    fn wrapped(&self) -> Option<Callback> {
        None
    }
}

impl<F> MonitorCallback for F
where
    F: Fn(&EventArgs<'_>) -> CallbackResult + Send + Sync,
{
    fn call(&self, args: &EventArgs<'_>) -> CallbackResult {
        self(args)
    }
}

pub type Callback = Arc<dyn MonitorCallback>;

/// Wraps a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&EventArgs<'_>) -> CallbackResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Debug view of a registered callback slot.
pub(crate) struct CallbackSlot<'a>(pub &'a Option<Callback>);

impl fmt::Debug for CallbackSlot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "Some(<callback>)" } else { "None" })
    }
}
