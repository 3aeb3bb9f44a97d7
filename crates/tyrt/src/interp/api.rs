//! Interpreter operations.
//!
//! Every operation runs on behalf of the calling thread, so they are methods
//! on [`ThreadContext`]. Operations that take an interpreter id accept
//! `None` for the current interpreter. With `restrict`, only interpreters
//! created through this API (whence `Stdlib`) may be targeted.
//!
//! Code that fails inside the target does not fail the operation: the
//! exception is captured as an [`ExcInfo`] and returned. Errors are reserved
//! for failures of the operation itself.

use std::sync::Arc;

use indexmap::IndexMap;

use super::{
    InterpError,
    call::PendingCall,
    config::{ConfigError, InterpreterConfig},
    excinfo::ExcInfo,
    registry::{Interpreter, InterpreterId, Namespace, OwnedInterpreter, ThreadContext, Whence},
    script::Script,
    session::Session,
    xidata::{self, XiData},
};
use crate::{
    exception::{ExcType, Exception},
    value::{Function, Value},
};

/// Code to run in another interpreter.
#[derive(Debug, Clone, Copy)]
pub enum Runnable<'a> {
    /// Source text, compiled in the target interpreter.
    Source(&'a str),
    /// An already compiled script.
    Script(&'a Script),
    /// A function taking no arguments, whose body runs in `__main__`.
    Function(&'a Value),
}

/// Builds a config from a preset name plus attribute overrides.
pub fn new_config(name: Option<&str>, overrides: &IndexMap<String, Value>) -> Result<InterpreterConfig, ConfigError> {
    let mut config = InterpreterConfig::named(name)?;
    if !overrides.is_empty() {
        config.update_from_attrs(overrides)?;
    }
    Ok(config)
}

/// What a script payload looks like by the time the session is entered.
enum Payload {
    Source(String),
    Data(XiData),
}

impl ThreadContext {
    fn resolve(
        &self,
        id: Option<InterpreterId>,
        restrict: bool,
        require_ready: bool,
        op: &str,
    ) -> Result<Arc<Interpreter>, InterpError> {
        let interp = match id {
            None => Arc::clone(self.current()),
            Some(id) => self.runtime().lookup(id)?,
        };
        let target = match id {
            None => "current interpreter".to_owned(),
            Some(id) => format!("interpreter {id}"),
        };
        if require_ready && !interp.is_ready() {
            return Err(InterpError::Interpreter(format!("cannot {op} {target} (not ready)")));
        }
        if restrict && interp.whence() != Whence::Stdlib {
            return Err(InterpError::Interpreter(format!("cannot {op} unrecognized {target}")));
        }
        Ok(interp)
    }

    /// Creates an interpreter and returns its id.
    ///
    /// With `reqrefs`, the interpreter is destroyed once its id reference
    /// count drops back to zero; see [`incref`](Self::incref).
    pub fn create(&mut self, config: Option<InterpreterConfig>, reqrefs: bool) -> Result<InterpreterId, InterpError> {
        let interp = self
            .runtime()
            .new_interpreter(config.unwrap_or_default(), Whence::Stdlib)?;
        if reqrefs {
            interp.require_refs();
        }
        Ok(interp.id())
    }

    /// Creates an interpreter owned by the returned handle.
    pub fn create_owned(&mut self, config: Option<InterpreterConfig>) -> Result<OwnedInterpreter, InterpError> {
        self.runtime().create_owned(config.unwrap_or_default())
    }

    /// Destroys an interpreter that is neither current nor running.
    pub fn destroy(&mut self, id: InterpreterId, restrict: bool) -> Result<(), InterpError> {
        let interp = self.resolve(Some(id), restrict, false, "destroy")?;
        if Arc::ptr_eq(&interp, self.current()) {
            return Err(InterpError::Interpreter("cannot destroy the current interpreter".to_owned()));
        }
        if interp.is_running() {
            return Err(InterpError::Interpreter("interpreter running".to_owned()));
        }
        self.runtime().end_interpreter(&interp);
        Ok(())
    }

    /// `(id, whence)` of every interpreter, oldest first.
    #[must_use]
    pub fn list_all(&self, require_ready: bool) -> Vec<(InterpreterId, Whence)> {
        self.runtime()
            .interpreters()
            .iter()
            .filter(|interp| !require_ready || interp.is_ready())
            .map(|interp| (interp.id(), interp.whence()))
            .collect()
    }

    #[must_use]
    pub fn get_current(&self) -> (InterpreterId, Whence) {
        (self.current().id(), self.current().whence())
    }

    #[must_use]
    pub fn get_main(&self) -> (InterpreterId, Whence) {
        let main = self.runtime().main();
        (main.id(), main.whence())
    }

    /// Binds `updates` in the interpreter's `__main__`.
    #[expect(non_snake_case, reason = "operation name matches the module attribute it updates")]
    pub fn set___main___attrs(
        &mut self,
        id: InterpreterId,
        updates: &Namespace,
        restrict: bool,
    ) -> Result<(), InterpError> {
        let interp = self.resolve(Some(id), restrict, true, "update __main__ for")?;
        if updates.is_empty() {
            return Err(Exception::value_error("arg 2 must be a non-empty dict").into());
        }
        let mut session = Session::new(self);
        session.enter(&interp, Some(updates))?;
        session.exit(None)?;
        Ok(())
    }

    /// Runs code in the interpreter's `__main__`, returning the uncaught
    /// exception if there was one.
    pub fn exec(
        &mut self,
        id: InterpreterId,
        code: Runnable<'_>,
        shared: Option<&Namespace>,
        restrict: bool,
    ) -> Result<Option<ExcInfo>, InterpError> {
        let interp = self.resolve(Some(id), restrict, true, "exec code for")?;
        let payload = self.prepare(code, "exec")?;
        self.run_payload(&interp, payload, shared)
    }

    /// Compiles and runs source text in the interpreter's `__main__`.
    pub fn run_string(
        &mut self,
        id: InterpreterId,
        source: &str,
        shared: Option<&Namespace>,
        restrict: bool,
    ) -> Result<Option<ExcInfo>, InterpError> {
        let interp = self.resolve(Some(id), restrict, true, "run a string in")?;
        self.run_payload(&interp, Payload::Source(source.to_owned()), shared)
    }

    /// Runs the body of a function taking no arguments in `__main__`.
    pub fn run_func(
        &mut self,
        id: InterpreterId,
        func: &Value,
        shared: Option<&Namespace>,
        restrict: bool,
    ) -> Result<Option<ExcInfo>, InterpError> {
        let interp = self.resolve(Some(id), restrict, true, "run a function in")?;
        let payload = self.prepare(Runnable::Function(func), "run_func")?;
        self.run_payload(&interp, payload, shared)
    }

    fn prepare(&self, code: Runnable<'_>, funcname: &str) -> Result<Payload, InterpError> {
        let source = self.current();
        match code {
            Runnable::Source(text) => Ok(Payload::Source(text.to_owned())),
            Runnable::Script(script) => Ok(Payload::Data(XiData::script(source, script)?)),
            Runnable::Function(Value::Function(Function::Defined(def))) => {
                let script = def.body_script().ok_or_else(|| {
                    Exception::new(
                        ExcType::NotShareableError,
                        format!("function '{}' takes arguments and cannot be run as a script", def.qualname()),
                    )
                })?;
                Ok(Payload::Data(XiData::script(source, &script)?))
            }
            Runnable::Function(other) => Err(Exception::type_error(format!(
                "{funcname}() argument 2 must be a function, not {}",
                other.type_name()
            ))
            .into()),
        }
    }

    fn run_payload(
        &mut self,
        interp: &Arc<Interpreter>,
        payload: Payload,
        shared: Option<&Namespace>,
    ) -> Result<Option<ExcInfo>, InterpError> {
        let mut session = Session::new(self);
        session.enter(interp, shared)?;
        let outcome = match payload {
            Payload::Source(text) => Script::compile(&text, "<string>")
                .map_err(Exception::from)
                .and_then(|script| session.exec(&script)),
            Payload::Data(data) => data
                .into_script()
                .map_err(Exception::from)
                .and_then(|script| session.exec(&script)),
        };
        let result = session.exit(outcome.err())?;
        Ok(result.excinfo)
    }

    /// Calls `callable` in the interpreter, returning its result and the
    /// uncaught exception if there was one.
    ///
    /// With `preserve_exc`, the exception itself is carried back in
    /// [`ExcInfo::exc`] when it can cross.
    pub fn call(
        &mut self,
        id: InterpreterId,
        callable: &Value,
        args: &[Value],
        kwargs: &IndexMap<String, Value>,
        preserve_exc: bool,
        restrict: bool,
    ) -> Result<(Value, Option<ExcInfo>), InterpError> {
        let interp = self.resolve(Some(id), restrict, true, "make a call in")?;
        let mut pending = PendingCall::pack(self.runtime(), self.current(), callable, args, kwargs)?;

        let mut session = Session::new(self);
        session.enter(&interp, None)?;
        let failure = match session.call_pending(&mut pending) {
            Ok(value) => session.preserve("result", &value).err().map(Exception::from),
            Err(exc) => {
                if preserve_exc
                    && let Err(err) = session.preserve("exc", &Value::Exception(Box::new(exc.clone())))
                {
                    log::debug!("exception not preserved: {err}");
                }
                Some(exc)
            }
        };
        pending.clear();
        let mut result = session.exit(failure)?;

        let value = result.preserved.shift_remove("result").unwrap_or(Value::None);
        if let (Some(excinfo), Some(Value::Exception(exc))) = (&mut result.excinfo, result.preserved.shift_remove("exc")) {
            excinfo.exc = Some(*exc);
        }
        Ok((value, result.excinfo))
    }

    /// Whether `value` can be passed to another interpreter as-is.
    #[must_use]
    pub fn is_shareable(&self, value: &Value) -> bool {
        xidata::is_shareable(value)
    }

    pub fn is_running(&self, id: InterpreterId, restrict: bool) -> Result<bool, InterpError> {
        let interp = self.resolve(Some(id), restrict, true, "check if running for")?;
        Ok(interp.is_running())
    }

    pub fn get_config(&self, id: Option<InterpreterId>, restrict: bool) -> Result<InterpreterConfig, InterpError> {
        let interp = self.resolve(id, restrict, false, "get the config of")?;
        Ok(interp.config().clone())
    }

    /// Where the interpreter came from. Never restricted.
    pub fn whence(&self, id: InterpreterId) -> Result<Whence, InterpError> {
        Ok(self.runtime().lookup(id)?.whence())
    }

    /// Adds an id reference. With `implieslink`, the interpreter is
    /// destroyed when the count returns to zero.
    pub fn incref(&mut self, id: InterpreterId, implieslink: bool, restrict: bool) -> Result<(), InterpError> {
        let interp = self.resolve(Some(id), restrict, true, "incref")?;
        interp.incref(implieslink);
        Ok(())
    }

    pub fn decref(&mut self, id: InterpreterId, restrict: bool) -> Result<(), InterpError> {
        let interp = self.resolve(Some(id), restrict, true, "decref")?;
        self.runtime().release_ref(&interp, true);
        Ok(())
    }

    /// Snapshots `exc`, or the exception currently pending on this thread.
    pub fn capture_exception(&mut self, exc: Option<&Exception>) -> Option<ExcInfo> {
        match exc {
            Some(exc) => Some(ExcInfo::capture(exc)),
            None => self.monitor_state().take_pending_exception().as_ref().map(ExcInfo::capture),
        }
    }
}
