//! The runtime and its interpreters.
//!
//! A [`Runtime`] owns every live interpreter, keyed by a monotonically
//! increasing id, together with the native functions scripts can call.
//! Interpreter 0 is the main interpreter and exists for the runtime's whole
//! life.
//!
//! Each OS thread that runs code holds a [`ThreadContext`], which records the
//! interpreter the thread is currently executing in. Sessions switch it for
//! the duration of a cross-interpreter operation.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
};

use ahash::AHashMap;
use indexmap::IndexMap;
use strum::{Display, FromRepr};

use super::{InterpError, config::InterpreterConfig, xidata::XiErrorCode};
use crate::{
    exception::{ExcType, Exception},
    monitoring::{Monitoring, ThreadState},
    value::{SharedBuffer, Value},
};

pub type InterpreterId = i64;

/// Id of the interpreter the runtime starts with.
pub const MAIN_INTERPRETER_ID: InterpreterId = 0;

/// An interpreter's `__main__` namespace.
pub type Namespace = IndexMap<String, Value>;

/// A function implemented by the host, callable from scripts by name.
pub type NativeFn = Arc<dyn Fn(&[Value], &IndexMap<String, Value>) -> Result<Value, Exception> + Send + Sync>;

/// Where an interpreter came from.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[strum(serialize_all = "lowercase")]
pub enum Whence {
    Unknown = 0,
    /// The main interpreter, created with the runtime.
    Runtime = 1,
    /// The legacy C-API.
    Legacy = 2,
    Capi = 3,
    /// Cross-interpreter internals.
    Xi = 4,
    /// The interpreters API in this crate.
    Stdlib = 5,
}

/// Lifecycle of an interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Status {
    Created,
    Ready,
    /// Some thread is running in its `__main__`.
    Running,
    Destroyed,
}

#[derive(Debug, Default)]
struct IdRefs {
    count: i64,
    /// The count dropping to zero destroys the interpreter.
    requires_ref: bool,
}

/// One isolated interpreter.
pub struct Interpreter {
    id: InterpreterId,
    whence: Whence,
    config: InterpreterConfig,
    status: Mutex<Status>,
    main_ns: Mutex<Namespace>,
    monitoring: Monitoring,
    refs: Mutex<IdRefs>,
    /// Buffers of this interpreter currently exposed to other interpreters.
    buffer_exports: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Interpreter {
    fn new(id: InterpreterId, whence: Whence, config: InterpreterConfig) -> Self {
        let mut main_ns = Namespace::new();
        main_ns.insert("__name__".to_owned(), Value::str("__main__"));
        Self {
            id,
            whence,
            config,
            status: Mutex::new(Status::Created),
            main_ns: Mutex::new(main_ns),
            monitoring: Monitoring::new(),
            refs: Mutex::new(IdRefs::default()),
            buffer_exports: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> InterpreterId {
        self.id
    }

    #[must_use]
    pub fn whence(&self) -> Whence {
        self.whence
    }

    #[must_use]
    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> Status {
        *lock(&self.status)
    }

    /// Initialized and not yet destroyed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.status(), Status::Ready | Status::Running)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// This interpreter's monitoring engine.
    #[must_use]
    pub fn monitoring(&self) -> &Monitoring {
        &self.monitoring
    }

    /// A copy of the value bound to `name` in `__main__`.
    #[must_use]
    pub fn get_global(&self, name: &str) -> Option<Value> {
        lock(&self.main_ns).get(name).cloned()
    }

    /// Names bound in `__main__`, in binding order.
    #[must_use]
    pub fn global_names(&self) -> Vec<String> {
        lock(&self.main_ns).keys().cloned().collect()
    }

    #[must_use]
    pub fn buffer_exports(&self) -> usize {
        self.buffer_exports.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn ref_count(&self) -> i64 {
        lock(&self.refs).count
    }

    pub(crate) fn namespace(&self) -> MutexGuard<'_, Namespace> {
        lock(&self.main_ns)
    }

    /// Moves `__main__` out so code can run against it without holding the
    /// lock. Put it back with [`restore_namespace`](Self::restore_namespace).
    pub(crate) fn take_namespace(&self) -> Namespace {
        std::mem::take(&mut *lock(&self.main_ns))
    }

    pub(crate) fn restore_namespace(&self, ns: Namespace) {
        let old = std::mem::replace(&mut *lock(&self.main_ns), ns);
        drop(old);
    }

    pub(crate) fn set_status(&self, status: Status) {
        *lock(&self.status) = status;
    }

    /// Marks `__main__` as running; fails if it already is.
    pub(crate) fn set_running(&self) -> Result<(), XiErrorCode> {
        let mut status = lock(&self.status);
        match *status {
            Status::Ready => {
                *status = Status::Running;
                Ok(())
            }
            Status::Running => Err(XiErrorCode::AlreadyRunning),
            Status::Created | Status::Destroyed => Err(XiErrorCode::Other),
        }
    }

    pub(crate) fn set_not_running(&self) {
        let mut status = lock(&self.status);
        if *status == Status::Running {
            *status = Status::Ready;
        }
    }

    pub(crate) fn export_buffer(&self) {
        self.buffer_exports.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_buffer(&self) {
        let released = self
            .buffer_exports
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            log::warn!("interpreter {} released a buffer it never exported", self.id);
        }
    }

    pub(crate) fn incref(&self, implies_link: bool) {
        let mut refs = lock(&self.refs);
        if implies_link {
            refs.requires_ref = true;
        }
        refs.count += 1;
    }

    pub(crate) fn require_refs(&self) {
        lock(&self.refs).requires_ref = true;
    }

    /// Drops one id reference; true when this should destroy the interpreter.
    fn decref(&self) -> bool {
        let mut refs = lock(&self.refs);
        refs.count = (refs.count - 1).max(0);
        refs.count == 0 && refs.requires_ref
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("id", &self.id)
            .field("whence", &self.whence)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Runtime
// ============================================================================

pub(crate) struct RuntimeState {
    interpreters: RwLock<IndexMap<InterpreterId, Arc<Interpreter>>>,
    next_id: AtomicI64,
    natives: RwLock<AHashMap<String, NativeFn>>,
}

/// The process-wide registry of interpreters. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    state: Arc<RuntimeState>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").field("interpreters", &self.interpreters()).finish()
    }
}

impl Runtime {
    /// A runtime with its main interpreter and the builtin natives.
    #[must_use]
    pub fn new() -> Self {
        let main = Arc::new(Interpreter::new(
            MAIN_INTERPRETER_ID,
            Whence::Runtime,
            InterpreterConfig::legacy(),
        ));
        main.set_status(Status::Ready);
        let mut interpreters = IndexMap::new();
        interpreters.insert(MAIN_INTERPRETER_ID, main);
        let runtime = Self {
            state: Arc::new(RuntimeState {
                interpreters: RwLock::new(interpreters),
                next_id: AtomicI64::new(MAIN_INTERPRETER_ID + 1),
                natives: RwLock::new(AHashMap::new()),
            }),
        };
        install_builtins(&runtime);
        runtime
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeState> {
        Arc::downgrade(&self.state)
    }

    pub(crate) fn upgrade(state: &Weak<RuntimeState>) -> Option<Self> {
        state.upgrade().map(|state| Self { state })
    }

    /// A context for the calling thread, starting in the main interpreter.
    #[must_use]
    pub fn thread(&self) -> ThreadContext {
        ThreadContext {
            runtime: self.clone(),
            current: self.main(),
            monitor: ThreadState::new(),
        }
    }

    #[must_use]
    pub fn main(&self) -> Arc<Interpreter> {
        self.get(MAIN_INTERPRETER_ID)
            .unwrap_or_else(|| Arc::new(Interpreter::new(MAIN_INTERPRETER_ID, Whence::Runtime, InterpreterConfig::legacy())))
    }

    /// The live interpreter with `id`.
    #[must_use]
    pub fn get(&self, id: InterpreterId) -> Option<Arc<Interpreter>> {
        let interpreters = self.state.interpreters.read().unwrap_or_else(PoisonError::into_inner);
        interpreters.get(&id).cloned()
    }

    pub fn lookup(&self, id: InterpreterId) -> Result<Arc<Interpreter>, InterpError> {
        self.get(id).ok_or(InterpError::NotFound(id))
    }

    /// Every live interpreter, oldest first.
    #[must_use]
    pub fn interpreters(&self) -> Vec<Arc<Interpreter>> {
        let interpreters = self.state.interpreters.read().unwrap_or_else(PoisonError::into_inner);
        interpreters.values().cloned().collect()
    }

    /// Makes `f` callable from scripts as `qualname`.
    pub fn register_native<F>(&self, qualname: impl Into<String>, f: F)
    where
        F: Fn(&[Value], &IndexMap<String, Value>) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        let mut natives = self.state.natives.write().unwrap_or_else(PoisonError::into_inner);
        natives.insert(qualname.into(), Arc::new(f));
    }

    #[must_use]
    pub fn native(&self, qualname: &str) -> Option<NativeFn> {
        let natives = self.state.natives.read().unwrap_or_else(PoisonError::into_inner);
        natives.get(qualname).cloned()
    }

    /// Creates and initializes a new interpreter.
    pub fn new_interpreter(&self, config: InterpreterConfig, whence: Whence) -> Result<Arc<Interpreter>, InterpError> {
        config
            .validate()
            .map_err(|err| InterpError::CreationFailed(err.into()))?;
        let id = self.state.next_id.fetch_add(1, Ordering::AcqRel);
        let interp = Arc::new(Interpreter::new(id, whence, config));
        interp.set_status(Status::Ready);
        let mut interpreters = self.state.interpreters.write().unwrap_or_else(PoisonError::into_inner);
        interpreters.insert(id, Arc::clone(&interp));
        drop(interpreters);
        log::debug!("created interpreter {id} ({whence})");
        Ok(interp)
    }

    /// Finalizes `interp` and removes it from the registry.
    pub(crate) fn end_interpreter(&self, interp: &Interpreter) {
        let removed = {
            let mut interpreters = self.state.interpreters.write().unwrap_or_else(PoisonError::into_inner);
            interpreters.shift_remove(&interp.id)
        };
        interp.set_status(Status::Destroyed);
        // values may hold buffers borrowed from other interpreters, whose
        // release looks the registry up again
        let ns = interp.take_namespace();
        drop(ns);
        drop(removed);
        log::debug!("destroyed interpreter {}", interp.id);
    }

    /// A new interpreter destroyed when the returned handle is dropped.
    pub fn create_owned(&self, config: InterpreterConfig) -> Result<OwnedInterpreter, InterpError> {
        let interp = self.new_interpreter(config, Whence::Stdlib)?;
        interp.incref(true);
        Ok(OwnedInterpreter {
            runtime: self.clone(),
            interp,
        })
    }

    /// A reference that keeps the id counted but never destroys.
    pub fn interpreter_ref(&self, id: InterpreterId) -> Result<InterpreterRef, InterpError> {
        let interp = self.lookup(id)?;
        interp.incref(false);
        Ok(InterpreterRef {
            runtime: self.clone(),
            interp,
        })
    }

    /// Drops an id reference, destroying the interpreter when it was the
    /// last one and destruction was requested.
    pub(crate) fn release_ref(&self, interp: &Interpreter, destroy_on_zero: bool) {
        if !interp.decref() || !destroy_on_zero {
            return;
        }
        if interp.is_running() {
            log::warn!("interpreter {} reached zero references while running", interp.id);
            return;
        }
        if interp.status() != Status::Destroyed {
            self.end_interpreter(interp);
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Owns an interpreter: dropping the last reference destroys it.
#[derive(Debug)]
pub struct OwnedInterpreter {
    runtime: Runtime,
    interp: Arc<Interpreter>,
}

impl OwnedInterpreter {
    #[must_use]
    pub fn id(&self) -> InterpreterId {
        self.interp.id
    }

    #[must_use]
    pub fn interpreter(&self) -> &Arc<Interpreter> {
        &self.interp
    }
}

impl Drop for OwnedInterpreter {
    fn drop(&mut self) {
        self.runtime.release_ref(&self.interp, true);
    }
}

/// Counts as a reference to an interpreter without ever destroying it.
#[derive(Debug)]
pub struct InterpreterRef {
    runtime: Runtime,
    interp: Arc<Interpreter>,
}

impl InterpreterRef {
    #[must_use]
    pub fn id(&self) -> InterpreterId {
        self.interp.id
    }

    #[must_use]
    pub fn interpreter(&self) -> &Arc<Interpreter> {
        &self.interp
    }
}

impl Drop for InterpreterRef {
    fn drop(&mut self) {
        self.runtime.release_ref(&self.interp, false);
    }
}

// ============================================================================
// ThreadContext
// ============================================================================

/// Per-thread execution state: the active interpreter and the monitoring
/// state of the thread.
#[derive(Debug)]
pub struct ThreadContext {
    runtime: Runtime,
    current: Arc<Interpreter>,
    monitor: ThreadState,
}

impl ThreadContext {
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The interpreter this thread is running in.
    #[must_use]
    pub fn current(&self) -> &Arc<Interpreter> {
        &self.current
    }

    pub fn monitor_state(&mut self) -> &mut ThreadState {
        &mut self.monitor
    }

    /// Makes `interp` active and returns the previously active one.
    pub(crate) fn switch_to(&mut self, interp: Arc<Interpreter>) -> Arc<Interpreter> {
        log::trace!("thread switching from interpreter {} to {}", self.current.id, interp.id);
        std::mem::replace(&mut self.current, interp)
    }
}

// ============================================================================
// Builtins
// ============================================================================

fn expect_one<'a>(name: &str, args: &'a [Value], kwargs: &IndexMap<String, Value>) -> Result<&'a Value, Exception> {
    if !kwargs.is_empty() {
        return Err(Exception::type_error(format!("{name}() takes no keyword arguments")));
    }
    match args {
        [arg] => Ok(arg),
        _ => Err(Exception::type_error(format!(
            "{name}() takes exactly one argument ({} given)",
            args.len()
        ))),
    }
}

fn install_builtins(runtime: &Runtime) {
    runtime.register_native("len", |args, kwargs| {
        let len = match expect_one("len", args, kwargs)? {
            Value::Str(s) => s.chars().count(),
            Value::Bytes(b) => b.len(),
            Value::Tuple(items) | Value::List(items) => items.len(),
            Value::Dict(items) => items.len(),
            Value::Buffer(buf) => buf.len(),
            other => {
                return Err(Exception::type_error(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                )));
            }
        };
        Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
    });
    runtime.register_native("repr", |args, kwargs| {
        Ok(Value::Str(expect_one("repr", args, kwargs)?.repr()))
    });
    runtime.register_native("memoryview", |args, kwargs| match expect_one("memoryview", args, kwargs)? {
        Value::Bytes(b) => Ok(Value::Buffer(SharedBuffer::owned(Arc::from(b.as_slice())))),
        Value::Buffer(buf) => Ok(Value::Buffer(buf.clone())),
        other => Err(Exception::type_error(format!(
            "memoryview: a bytes-like object is required, not '{}'",
            other.type_name()
        ))),
    });
    runtime.register_native("bytes", |args, kwargs| {
        if args.is_empty() && kwargs.is_empty() {
            return Ok(Value::Bytes(Vec::new()));
        }
        match expect_one("bytes", args, kwargs)? {
            Value::Bytes(b) => Ok(Value::Bytes(b.clone())),
            Value::Buffer(buf) => Ok(Value::Bytes(buf.as_bytes().to_vec())),
            other => Err(Exception::new(
                ExcType::TypeError,
                format!("cannot convert '{}' object to bytes", other.type_name()),
            )),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbalanced_buffer_release_stops_at_zero() {
        let runtime = Runtime::new();
        let interp = runtime.new_interpreter(InterpreterConfig::isolated(), Whence::Stdlib).unwrap();
        interp.export_buffer();
        interp.release_buffer();
        interp.release_buffer();
        assert_eq!(interp.buffer_exports(), 0);
        interp.export_buffer();
        assert_eq!(interp.buffer_exports(), 1);
    }

    #[test]
    fn ids_increase_and_main_is_zero() {
        let runtime = Runtime::new();
        let a = runtime.new_interpreter(InterpreterConfig::isolated(), Whence::Stdlib).unwrap();
        let b = runtime.new_interpreter(InterpreterConfig::isolated(), Whence::Stdlib).unwrap();
        assert_eq!(runtime.main().id(), MAIN_INTERPRETER_ID);
        assert!(a.id() > MAIN_INTERPRETER_ID);
        assert!(b.id() > a.id());
    }

    #[test]
    fn only_one_thread_runs_main_at_a_time() {
        let runtime = Runtime::new();
        let interp = runtime.new_interpreter(InterpreterConfig::isolated(), Whence::Stdlib).unwrap();
        interp.set_running().unwrap();
        assert_eq!(interp.set_running(), Err(XiErrorCode::AlreadyRunning));
        interp.set_not_running();
        assert!(interp.set_running().is_ok());
    }

    #[test]
    fn interpreter_ref_never_destroys() {
        let runtime = Runtime::new();
        let interp = runtime.new_interpreter(InterpreterConfig::isolated(), Whence::Stdlib).unwrap();
        let handle = runtime.interpreter_ref(interp.id()).unwrap();
        assert_eq!(interp.ref_count(), 1);
        drop(handle);
        assert_eq!(interp.ref_count(), 0);
        assert!(runtime.get(interp.id()).is_some());
    }
}
