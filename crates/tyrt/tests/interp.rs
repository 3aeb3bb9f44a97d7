//! Integration tests for interpreters and cross-interpreter data.
//!
//! Covers the interpreter lifecycle, running code in another interpreter's
//! `__main__`, calls across interpreters, exception capture, shared buffers
//! and id reference counting.

use std::sync::Arc;

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use tyrt::{
    ExcType, Exception, Function, InterpError, InterpreterConfig, Namespace, Opaque, Runtime, Script, Session,
    ThreadContext, Value, Whence,
    interp::{MAIN_INTERPRETER_ID, Runnable, SessionState, Status, XiErrorCode, new_config},
};

fn ns(pairs: &[(&str, Value)]) -> Namespace {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
}

/// Defines functions in a scratch namespace and returns it.
fn define(ctx: &ThreadContext, source: &str) -> Namespace {
    let script = Script::compile(source, "<test>").unwrap();
    let mut namespace = Namespace::new();
    script.exec(ctx.runtime(), &mut namespace).unwrap();
    namespace
}

fn no_kwargs() -> IndexMap<String, Value> {
    IndexMap::new()
}

// ============================================================================
// Configs
// ============================================================================

#[test]
fn presets_and_overrides() {
    assert_eq!(new_config(None, &no_kwargs()).unwrap(), InterpreterConfig::isolated());
    assert_eq!(new_config(Some("default"), &no_kwargs()).unwrap(), InterpreterConfig::isolated());

    let config = new_config(Some("legacy"), &ns(&[("allow_fork", Value::Bool(false))])).unwrap();
    assert!(!config.allow_fork, "override should apply");
    assert!(config.use_main_obmalloc, "other legacy settings should stay");

    let err = new_config(Some("bogus"), &no_kwargs()).unwrap_err();
    assert_eq!(err.to_string(), "unsupported config name 'bogus'");

    let err = new_config(None, &ns(&[("spam", Value::Int(1))])).unwrap_err();
    assert_eq!(err.to_string(), "config dict has 1 extra item ('spam')");

    let err = new_config(None, &ns(&[("gil", Value::str("sometimes"))])).unwrap_err();
    assert_eq!(err.to_string(), "unsupported interpreter config .gil value 'sometimes'");
}

#[test]
fn config_survives_attribute_round_trip() {
    let legacy = InterpreterConfig::legacy();
    assert_eq!(InterpreterConfig::from_attrs(&legacy.to_attrs()).unwrap(), legacy);
    assert_eq!(InterpreterConfig::from_json(&legacy.to_json().unwrap()).unwrap(), legacy);
}

#[test]
fn unusable_config_fails_creation() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let err = ctx.create(Some(InterpreterConfig::empty()), false).unwrap_err();
    let exc = Exception::from(err);
    assert_eq!(exc.exc_type(), ExcType::InterpreterError);
    assert_eq!(exc.cause().map(Exception::exc_type), Some(ExcType::InterpreterError));
    assert_eq!(ctx.list_all(false).len(), 1, "nothing should be registered");
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn interpreters_are_listed_oldest_first() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let a = ctx.create(None, false).unwrap();
    let b = ctx.create(None, false).unwrap();
    assert!(a < b);
    assert_eq!(
        ctx.list_all(false),
        vec![(MAIN_INTERPRETER_ID, Whence::Runtime), (a, Whence::Stdlib), (b, Whence::Stdlib)]
    );
    assert_eq!(ctx.get_main(), (MAIN_INTERPRETER_ID, Whence::Runtime));
    assert_eq!(ctx.get_current(), (MAIN_INTERPRETER_ID, Whence::Runtime));
    assert_eq!(ctx.whence(a).unwrap().to_string(), "stdlib");
    assert_eq!(ctx.get_config(Some(a), true).unwrap(), InterpreterConfig::isolated());

    ctx.destroy(a, true).unwrap();
    assert_eq!(ctx.list_all(false).len(), 2);
    assert_eq!(runtime.get(b).map(|i| i.status()), Some(Status::Ready));
}

#[test]
fn destroy_rejects_bad_targets() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();

    let err = ctx.destroy(MAIN_INTERPRETER_ID, false).unwrap_err();
    assert_eq!(err.to_string(), "cannot destroy the current interpreter");

    let err = ctx.destroy(99, false).unwrap_err();
    assert_eq!(err, InterpError::NotFound(99));
    assert_eq!(Exception::from(err).exc_type(), ExcType::InterpreterNotFoundError);

    let id = ctx.create(None, false).unwrap();
    let target = runtime.lookup(id).unwrap();
    let mut other = runtime.thread();
    let mut session = Session::new(&mut other);
    session.enter(&target, None).unwrap();
    let err = ctx.destroy(id, false).unwrap_err();
    assert_eq!(err.to_string(), "interpreter running");
    session.exit(None).unwrap();
    ctx.destroy(id, false).unwrap();
}

#[test]
fn restricted_operations_skip_foreign_interpreters() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let err = ctx.run_string(MAIN_INTERPRETER_ID, "x = 1", None, true).unwrap_err();
    assert_eq!(err.to_string(), "cannot run a string in unrecognized interpreter 0");
    assert!(ctx.run_string(MAIN_INTERPRETER_ID, "x = 1", None, false).unwrap().is_none());
}

#[test]
fn owned_interpreter_is_destroyed_on_drop() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let owned = ctx.create_owned(None).unwrap();
    let id = owned.id();
    assert_eq!(owned.interpreter().ref_count(), 1);
    drop(owned);
    assert!(runtime.get(id).is_none());
}

#[test]
fn reqrefs_interpreter_dies_with_its_last_reference() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();

    let linked = ctx.create(None, true).unwrap();
    ctx.incref(linked, false, false).unwrap();
    ctx.incref(linked, false, false).unwrap();
    ctx.decref(linked, false).unwrap();
    assert!(runtime.get(linked).is_some());
    ctx.decref(linked, false).unwrap();
    assert!(runtime.get(linked).is_none(), "last decref should destroy");

    let plain = ctx.create(None, false).unwrap();
    ctx.incref(plain, false, false).unwrap();
    ctx.decref(plain, false).unwrap();
    assert!(runtime.get(plain).is_some(), "no link was requested");

    let weak = runtime.interpreter_ref(plain).unwrap();
    assert_eq!(weak.interpreter().ref_count(), 1);
    drop(weak);
    assert!(runtime.get(plain).is_some());
}

// ============================================================================
// Running code
// ============================================================================

#[test]
fn run_string_binds_shared_values() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let shared = ns(&[("x", Value::Int(7)), ("s", Value::str("seven"))]);

    let excinfo = ctx.run_string(id, "y = (x, s); n = len(s)", Some(&shared), false).unwrap();
    assert!(excinfo.is_none());

    let target = runtime.lookup(id).unwrap();
    assert_eq!(target.get_global("y"), Some(Value::Tuple(vec![Value::Int(7), Value::str("seven")])));
    assert_eq!(target.get_global("n"), Some(Value::Int(5)));
    assert_eq!(target.get_global("__name__"), Some(Value::str("__main__")));
    assert!(runtime.main().get_global("y").is_none(), "nothing leaks into the caller");
    assert_eq!(ctx.get_current().0, MAIN_INTERPRETER_ID);
    assert!(!target.is_running());
}

#[test]
fn uncaught_exceptions_come_back_as_excinfo() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();

    let excinfo = ctx
        .run_string(id, "x = 1\nraise KeyError('missing')", None, false)
        .unwrap()
        .expect("the raise should be reported");
    assert!(excinfo.is(ExcType::KeyError));
    assert!(excinfo.is(ExcType::LookupError), "subclass checks should apply");
    assert_eq!(excinfo.msg.as_deref(), Some("missing"));
    assert_eq!(excinfo.to_string(), "KeyError: missing");
    assert!(excinfo.errdisplay.contains("line 2"), "{}", excinfo.errdisplay);
    assert_eq!(runtime.lookup(id).unwrap().get_global("x"), Some(Value::Int(1)));

    let local = excinfo.raise_local();
    assert_eq!(local.exc_type(), ExcType::ExecutionFailed);
    assert_eq!(local.cause().map(Exception::exc_type), Some(ExcType::KeyError));
}

#[test]
fn syntax_errors_are_raised_in_the_target() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let excinfo = ctx.run_string(id, "return 1", None, false).unwrap().unwrap();
    assert!(excinfo.is(ExcType::SyntaxError));
}

#[test]
fn unshareable_bindings_leave_the_target_untouched() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let shared = ns(&[("ok", Value::Int(1)), ("bad", Value::List(vec![]))]);

    let err = ctx.run_string(id, "y = 1", Some(&shared), false).unwrap_err();
    assert_eq!(err.to_string(), "list does not support cross-interpreter data");
    let target = runtime.lookup(id).unwrap();
    assert!(target.get_global("ok").is_none());
    assert_eq!(target.status(), Status::Ready);
    assert_eq!(ctx.get_current().0, MAIN_INTERPRETER_ID);
}

#[test]
fn main_attrs_are_updated() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();

    ctx.set___main___attrs(id, &ns(&[("answer", Value::Int(42))]), true).unwrap();
    assert_eq!(runtime.lookup(id).unwrap().get_global("answer"), Some(Value::Int(42)));

    let err = ctx.set___main___attrs(id, &Namespace::new(), true).unwrap_err();
    assert_eq!(err.to_string(), "ValueError: arg 2 must be a non-empty dict");
}

#[test]
fn run_func_runs_the_body_in_main() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let defs = define(&ctx, "def setup(): ready = True\ndef takes(a): return a");

    assert!(ctx.run_func(id, &defs["setup"], None, false).unwrap().is_none());
    assert_eq!(runtime.lookup(id).unwrap().get_global("ready"), Some(Value::Bool(true)));

    let exc = Exception::from(ctx.run_func(id, &defs["takes"], None, false).unwrap_err());
    assert_eq!(exc.exc_type(), ExcType::NotShareableError);
    assert_eq!(
        exc.message(),
        Some("function 'takes' takes arguments and cannot be run as a script")
    );

    let exc = Exception::from(ctx.run_func(id, &Value::Int(3), None, false).unwrap_err());
    assert_eq!(exc.to_string(), "TypeError: run_func() argument 2 must be a function, not int");
}

#[test]
fn compiled_scripts_can_be_executed() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let script = Script::compile("z = b'abc'", "<compiled>").unwrap();
    assert!(ctx.exec(id, Runnable::Script(&script), None, false).unwrap().is_none());
    assert_eq!(runtime.lookup(id).unwrap().get_global("z"), Some(Value::Bytes(b"abc".to_vec())));
}

// ============================================================================
// Calls
// ============================================================================

#[test]
fn call_returns_the_result() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let defs = define(&ctx, "def pair(a, b=10): t = (a, b); return t");

    let kwargs = ns(&[("b", Value::Int(2))]);
    let (value, excinfo) = ctx.call(id, &defs["pair"], &[Value::Int(1)], &kwargs, false, false).unwrap();
    assert!(excinfo.is_none());
    assert_eq!(value, Value::Tuple(vec![Value::Int(1), Value::Int(2)]));

    let (value, _) = ctx
        .call(id, &Value::Function(Function::Native("len".to_owned())), &[Value::str("four")], &no_kwargs(), false, false)
        .unwrap();
    assert_eq!(value, Value::Int(4));
}

#[test]
fn call_rejects_non_callables() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let exc = Exception::from(ctx.call(id, &Value::Int(1), &[], &no_kwargs(), false, false).unwrap_err());
    assert_eq!(exc.to_string(), "TypeError: expected a callable, got 1");
}

#[test]
fn unshareable_results_become_the_failure() {
    let runtime = Runtime::new();
    runtime.register_native("socket", |_, _| Ok(Value::Opaque(Opaque::new("socket", Arc::new(0u8)))));
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();

    let callable = Value::Function(Function::Native("socket".to_owned()));
    let (value, excinfo) = ctx.call(id, &callable, &[], &no_kwargs(), false, false).unwrap();
    assert_eq!(value, Value::None);
    let excinfo = excinfo.expect("the result could not cross");
    assert!(excinfo.is(ExcType::NotShareableError));
    assert_eq!(excinfo.msg.as_deref(), Some("socket does not support cross-interpreter data"));
}

#[test]
fn raised_exceptions_can_be_preserved() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let defs = define(&ctx, "def boom(): raise ValueError('bad')");

    let (_, excinfo) = ctx.call(id, &defs["boom"], &[], &no_kwargs(), true, false).unwrap();
    let excinfo = excinfo.unwrap();
    assert_eq!(excinfo.formatted, "ValueError: bad");
    let exc = excinfo.exc.expect("exception should be preserved");
    assert_eq!(exc.exc_type(), ExcType::ValueError);

    let (_, excinfo) = ctx.call(id, &defs["boom"], &[], &no_kwargs(), false, false).unwrap();
    assert!(excinfo.unwrap().exc.is_none());
}

// ============================================================================
// Sessions
// ============================================================================

#[test]
fn session_preserves_values_for_the_caller() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let target = runtime.lookup(id).unwrap();

    let mut session = Session::new(&mut ctx);
    session.enter(&target, Some(&ns(&[("x", Value::Int(3))]))).unwrap();
    assert_eq!(session.state(), SessionState::Entered);
    assert!(target.is_running());
    session.exec(&Script::compile("y = [x, x]", "<session>").unwrap()).unwrap();
    let y = session.with_main_ns(|main| main["y"].clone()).unwrap();
    session.preserve("y", &y).unwrap();
    let result = session.exit(None).unwrap();

    assert_eq!(result.preserved["y"], Value::List(vec![Value::Int(3), Value::Int(3)]));
    assert!(result.excinfo.is_none());
    assert!(!target.is_running());
    assert_eq!(ctx.get_current().0, MAIN_INTERPRETER_ID);
}

#[test]
fn dropping_an_entered_session_switches_back() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let target = runtime.lookup(id).unwrap();
    {
        let mut session = Session::new(&mut ctx);
        session.enter(&target, None).unwrap();
        assert_eq!(session.target().map(|t| t.id()), Some(id));
    }
    assert_eq!(target.status(), Status::Ready);
    assert_eq!(ctx.get_current().0, MAIN_INTERPRETER_ID);
}

#[test]
fn only_one_session_runs_an_interpreter() {
    let runtime = Runtime::new();
    let id = runtime.thread().create(None, false).unwrap();
    let target = runtime.lookup(id).unwrap();

    let mut first = runtime.thread();
    let mut second = runtime.thread();
    let mut running = Session::new(&mut first);
    running.enter(&target, None).unwrap();

    let mut blocked = Session::new(&mut second);
    let err = blocked.enter(&target, None).unwrap_err();
    assert_eq!(err.code(), XiErrorCode::AlreadyRunning);
    assert_eq!(blocked.state(), SessionState::Idle);
    drop(blocked);
    assert!(target.is_running(), "the failed enter must not release the first session");
    drop(running);
    assert!(!target.is_running());
}

// ============================================================================
// Shared buffers
// ============================================================================

#[test]
fn buffer_exports_follow_the_borrowers() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let main = runtime.main();

    let shared = ns(&[("buf", Value::buffer(b"abc".to_vec()))]);
    ctx.run_string(id, "copy = buf; n = len(buf)", Some(&shared), false).unwrap();
    assert_eq!(main.buffer_exports(), 1, "the target still holds the buffer");
    assert_eq!(runtime.lookup(id).unwrap().get_global("n"), Some(Value::Int(3)));
    match runtime.lookup(id).unwrap().get_global("copy") {
        Some(Value::Buffer(buf)) => assert_eq!(buf.owner(), Some(MAIN_INTERPRETER_ID)),
        other => panic!("expected a buffer, got {other:?}"),
    }

    ctx.destroy(id, false).unwrap();
    assert_eq!(main.buffer_exports(), 0, "destroying the borrower releases the export");
}

#[test]
fn buffers_outliving_their_owner_skip_release() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = ctx.create(None, false).unwrap();
    let owner = runtime.lookup(id).unwrap();

    let memoryview = Value::Function(Function::Native("memoryview".to_owned()));
    let (value, excinfo) = ctx
        .call(id, &memoryview, &[Value::Bytes(b"xyz".to_vec())], &no_kwargs(), false, false)
        .unwrap();
    assert!(excinfo.is_none());
    let Value::Buffer(buf) = &value else {
        panic!("expected a buffer, got {value:?}");
    };
    assert_eq!(buf.as_bytes(), b"xyz");
    assert_eq!(buf.owner(), Some(id));
    assert_eq!(owner.buffer_exports(), 1);

    ctx.destroy(id, false).unwrap();
    drop(value);
    assert_eq!(owner.status(), Status::Destroyed);
    assert_eq!(owner.buffer_exports(), 1, "a destroyed owner is never released into");
}

// ============================================================================
// Exception capture
// ============================================================================

#[test]
fn capture_takes_the_pending_exception() {
    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    assert!(ctx.capture_exception(None).is_none());

    ctx.monitor_state()
        .set_pending_exception(Exception::new(ExcType::ValueError, "pending"));
    let excinfo = ctx.capture_exception(None).unwrap();
    assert_eq!(excinfo.formatted, "ValueError: pending");
    assert!(ctx.monitor_state().pending_exception().is_none());

    let explicit = Exception::new(ExcType::NotShareableError, "nope");
    let excinfo = ctx.capture_exception(Some(&explicit)).unwrap();
    assert_eq!(excinfo.exc_type.display_name(), "concurrent.interpreters.NotShareableError");
}

#[test]
fn shareability_matches_the_native_types() {
    let runtime = Runtime::new();
    let ctx = runtime.thread();
    assert!(ctx.is_shareable(&Value::Tuple(vec![Value::Int(1), Value::None])));
    assert!(ctx.is_shareable(&Value::buffer(vec![1u8, 2])));
    assert!(!ctx.is_shareable(&Value::List(vec![])));
    assert!(!ctx.is_shareable(&Value::Dict(vec![])));
}
