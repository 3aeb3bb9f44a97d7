//! Running code in another interpreter's `__main__`.
//!
//! A [`Session`] switches the calling thread into a target interpreter, runs
//! code there and switches back:
//!
//! 1. `enter` snapshots the shared bindings in the caller, marks the target
//!    running, switches, and binds the snapshots in the target's `__main__`.
//!    Any failure undoes all of it.
//! 2. `exec`/`call` run code; values can be `preserve`d for the caller.
//! 3. `exit` switches back and hands over the preserved values and the
//!    captured exception, if any.
//!
//! Dropping a session that was entered but not exited still switches back.

use std::sync::Arc;

use indexmap::IndexMap;

use super::{
    call::PendingCall,
    excinfo::ExcInfo,
    registry::{Interpreter, Namespace, Runtime, ThreadContext},
    script::{Script, call_value},
    xidata::{XiData, XiError, XiErrorCode, XiFallback},
};
use crate::{exception::Exception, value::Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Entered,
    Exited,
}

/// What a session hands back to the caller.
#[derive(Debug, Default)]
pub struct SessionResult {
    /// Preserved values, rebuilt in the caller.
    pub preserved: Namespace,
    /// The exception that ended the session, captured in the target.
    pub excinfo: Option<ExcInfo>,
}

#[derive(Debug)]
pub struct Session<'c> {
    ctx: &'c mut ThreadContext,
    state: SessionState,
    target: Option<Arc<Interpreter>>,
    previous: Option<Arc<Interpreter>>,
    preserved: IndexMap<String, XiData>,
}

impl<'c> Session<'c> {
    #[must_use]
    pub fn new(ctx: &'c mut ThreadContext) -> Self {
        Self {
            ctx,
            state: SessionState::Idle,
            target: None,
            previous: None,
            preserved: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        self.ctx.runtime()
    }

    /// The interpreter the session is in, once entered.
    #[must_use]
    pub fn target(&self) -> Option<&Arc<Interpreter>> {
        self.target.as_ref()
    }

    /// Switches into `target`, binding `shared` in its `__main__`.
    pub fn enter(&mut self, target: &Arc<Interpreter>, shared: Option<&Namespace>) -> Result<(), XiError> {
        if self.state != SessionState::Idle {
            return Err(XiError::new(XiErrorCode::Other).with_message("session already entered"));
        }
        let runtime = self.ctx.runtime().clone();
        let source = Arc::clone(self.ctx.current());

        let mut packed = Vec::new();
        for (name, value) in shared.into_iter().flatten() {
            packed.push((name.clone(), XiData::new(&runtime, &source, value, XiFallback::XiDataOnly)?));
        }

        target.set_running().map_err(|code| match code {
            XiErrorCode::AlreadyRunning => XiError::new(code),
            _ => XiError::new(code).with_message(format!("interpreter {} is not ready", target.id())),
        })?;
        let previous = self.ctx.switch_to(Arc::clone(target));

        let mut bindings = Namespace::new();
        for (name, data) in packed {
            match data.into_value(&runtime) {
                Ok(value) => {
                    bindings.insert(name, value);
                }
                Err(err) => {
                    self.ctx.switch_to(previous);
                    target.set_not_running();
                    return Err(XiError::new(XiErrorCode::ApplyNsFailure).with_cause(err.into()));
                }
            }
        }
        let mut ns = target.namespace();
        ns.extend(bindings);
        drop(ns);

        log::debug!("entered interpreter {} from {}", target.id(), previous.id());
        self.target = Some(Arc::clone(target));
        self.previous = Some(previous);
        self.state = SessionState::Entered;
        Ok(())
    }

    fn active_target(&self) -> Result<Arc<Interpreter>, XiError> {
        match (&self.target, self.state) {
            (Some(target), SessionState::Entered) => Ok(Arc::clone(target)),
            _ => Err(XiError::new(XiErrorCode::MainNsFailure)),
        }
    }

    /// Runs `script` in the target's `__main__`.
    pub fn exec(&mut self, script: &Script) -> Result<(), Exception> {
        let target = self.active_target()?;
        let mut ns = target.take_namespace();
        let result = script.exec(self.ctx.runtime(), &mut ns);
        target.restore_namespace(ns);
        result
    }

    /// Calls `callable` with the target's `__main__` as globals.
    pub fn call(&mut self, callable: &Value, args: &[Value], kwargs: &IndexMap<String, Value>) -> Result<Value, Exception> {
        let target = self.active_target()?;
        let globals = target.take_namespace();
        let result = call_value(self.ctx.runtime(), callable, args, kwargs, &globals);
        target.restore_namespace(globals);
        result
    }

    /// Unpacks and runs a call packed in the caller.
    pub fn call_pending(&mut self, pending: &mut PendingCall) -> Result<Value, Exception> {
        let unpacked = pending.unpack(self.ctx.runtime())?;
        self.call(&unpacked.func, &unpacked.args, &unpacked.kwargs)
    }

    /// Runs `f` against the target's `__main__`.
    pub fn with_main_ns<R>(&mut self, f: impl FnOnce(&mut Namespace) -> R) -> Result<R, XiError> {
        let target = self.active_target()?;
        let mut ns = target.namespace();
        Ok(f(&mut ns))
    }

    /// Snapshots `value` so `exit` can rebuild it in the caller.
    pub fn preserve(&mut self, name: &str, value: &Value) -> Result<(), XiError> {
        let target = self.active_target()?;
        let data = XiData::new(self.ctx.runtime(), &target, value, XiFallback::Full).map_err(|err| {
            if err.code() == XiErrorCode::NotShareable {
                err
            } else {
                XiError::new(XiErrorCode::PreserveFailure).with_cause(err.into())
            }
        })?;
        self.preserved.insert(name.to_owned(), data);
        Ok(())
    }

    /// Switches back to the caller.
    ///
    /// With a `failure`, the exception is captured before leaving the target
    /// and preserved values that cannot be rebuilt are dropped with a
    /// warning instead of masking it.
    pub fn exit(mut self, failure: Option<Exception>) -> Result<SessionResult, XiError> {
        if self.state != SessionState::Entered {
            return Err(XiError::new(XiErrorCode::Other).with_message("session not entered"));
        }
        let excinfo = failure.as_ref().map(ExcInfo::capture);
        self.leave();

        let runtime = self.ctx.runtime().clone();
        let mut preserved = Namespace::new();
        for (name, data) in std::mem::take(&mut self.preserved) {
            match data.into_value(&runtime) {
                Ok(value) => {
                    preserved.insert(name, value);
                }
                Err(err) if excinfo.is_some() => {
                    log::warn!("dropping preserved '{name}' after failure: {err}");
                }
                Err(err) => return Err(XiError::new(XiErrorCode::PreserveFailure).with_cause(err.into())),
            }
        }
        Ok(SessionResult { preserved, excinfo })
    }

    fn leave(&mut self) {
        if let (Some(target), Some(previous)) = (self.target.take(), self.previous.take()) {
            self.ctx.switch_to(previous);
            target.set_not_running();
            log::debug!("left interpreter {}", target.id());
        }
        self.state = SessionState::Exited;
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.state == SessionState::Entered {
            self.leave();
        }
    }
}
