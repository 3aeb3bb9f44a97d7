//! Integration tests for the monitoring engine.
//!
//! Covers tool registration, global and local event sets, version tracking,
//! slot rewriting, event delivery order, DISABLE handling, the legacy BRANCH
//! event and the ready-made tools.

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tyrt::{
    ExcType, Exception,
    bytecode::{Branch, Code, CodeBuilder, Opcode, Slot, WARMUP_COUNTER},
    monitoring::{
        CoverageTool, Disposition, Event, EventSet, LoggingTool, Monitoring, MonitoringError, Payload,
        ProfilingTool, RecordingTool, ThreadState, VERSION_INCREMENT, callback, event_for_opcode,
    },
};

/// `f` at line 10: two statements on lines 11 and 12.
fn straight_line() -> Arc<Code> {
    let mut builder = CodeBuilder::new("f").first_line(10);
    builder.emit_arg(Opcode::Resume, 0);
    builder.set_line(11);
    builder.emit_arg(Opcode::LoadSmallInt, 1);
    builder.emit(Opcode::PopTop);
    builder.set_line(12);
    builder.emit_arg(Opcode::LoadSmallInt, 2);
    builder.emit(Opcode::ReturnValue);
    builder.build()
}

/// `if x: return 1` / `return 2`, with the jump at 2, NOT_TAKEN at 4 and the
/// taken branch landing at 7.
fn conditional() -> Arc<Code> {
    let mut builder = CodeBuilder::new("g").first_line(1);
    builder.emit_arg(Opcode::Resume, 0);
    builder.set_line(2);
    builder.emit_arg(Opcode::LoadFast, 0);
    let jump = builder.emit_jump(Opcode::PopJumpIfFalse);
    builder.emit(Opcode::NotTaken);
    builder.set_line(3);
    builder.emit_arg(Opcode::LoadSmallInt, 1);
    builder.emit(Opcode::ReturnValue);
    builder.patch_jump(jump).unwrap();
    builder.set_line(4);
    builder.emit_arg(Opcode::LoadSmallInt, 2);
    builder.emit(Opcode::ReturnValue);
    builder.build()
}

/// A call, a conditional and a `for` loop: every kind of evented opcode.
fn sample() -> Arc<Code> {
    let mut builder = CodeBuilder::new("sample").first_line(1);
    builder.emit_arg(Opcode::Resume, 0);
    builder.set_line(2);
    builder.emit_arg(Opcode::LoadGlobal, 0);
    builder.emit(Opcode::PushNull);
    builder.emit_arg(Opcode::Call, 0);
    builder.emit(Opcode::ToBool);
    let skip = builder.emit_jump(Opcode::PopJumpIfFalse);
    builder.emit(Opcode::NotTaken);
    builder.set_line(3);
    builder.emit(Opcode::GetIter);
    let top = builder.offset();
    let exhausted = builder.emit_jump(Opcode::ForIter);
    builder.emit_arg(Opcode::StoreFast, 0);
    builder.set_line(4);
    builder.emit_jump_backward(Opcode::JumpBackward, top).unwrap();
    builder.patch_jump(exhausted).unwrap();
    builder.emit(Opcode::EndFor);
    builder.emit(Opcode::PopIter);
    builder.patch_jump(skip).unwrap();
    builder.set_line(5);
    builder.emit_arg(Opcode::LoadSmallInt, 0);
    builder.emit(Opcode::ReturnValue);
    builder.build()
}

/// Steps through every instruction of straight-line code.
fn run(monitoring: &Monitoring, thread: &mut ThreadState, code: &Arc<Code>) {
    let offsets: Vec<usize> = code.offsets_from(0).collect();
    let mut prev = None;
    for offset in offsets {
        monitoring.step(thread, code, offset, prev, false).unwrap();
        prev = Some(offset);
    }
}

fn slots(code: &Code) -> Vec<Slot> {
    (0..code.len()).map(|i| code.slot(i)).collect()
}

// ============================================================================
// Tool ids
// ============================================================================

#[test]
fn tool_ids_are_validated() {
    let monitoring = Monitoring::new();
    let err = monitoring.use_tool_id(6, "legacy").unwrap_err();
    assert_eq!(err.to_string(), "invalid tool 6 (must be between 0 and 5)");

    monitoring.use_tool_id(1, "cov").unwrap();
    let err = monitoring.use_tool_id(1, "again").unwrap_err();
    assert_eq!(err.to_string(), "tool 1 is already in use");
    assert_eq!(monitoring.get_tool(1).unwrap().as_deref(), Some("cov"));

    monitoring.free_tool_id(1).unwrap();
    assert_eq!(monitoring.get_tool(1).unwrap(), None);
}

#[test]
fn events_need_a_reserved_tool() {
    let monitoring = Monitoring::new();
    let err = monitoring.set_events(3, EventSet::PY_START).unwrap_err();
    assert_eq!(err.to_string(), "tool 3 is not in use");
    assert_eq!(Exception::from(err).exc_type(), ExcType::ValueError);
}

#[test]
fn c_return_cannot_be_set_alone() {
    let monitoring = Monitoring::new();
    monitoring.use_tool_id(2, "prof").unwrap();
    let err = monitoring.set_events(2, EventSet::C_RETURN).unwrap_err();
    assert_eq!(err.to_string(), "cannot set C_RETURN or C_RAISE events independently");

    monitoring
        .set_events(2, EventSet::CALL | EventSet::C_RETURN | EventSet::C_RAISE)
        .unwrap();
    assert_eq!(monitoring.get_events(2).unwrap(), EventSet::CALL);
}

#[test]
fn branch_expands_to_both_directions() {
    let monitoring = Monitoring::new();
    monitoring.use_tool_id(1, "cov").unwrap();
    monitoring.set_events(1, EventSet::BRANCH).unwrap();
    assert_eq!(monitoring.get_events(1).unwrap(), EventSet::BRANCHES);
}

// ============================================================================
// Versioning and idempotence
// ============================================================================

#[test]
fn setting_the_same_events_keeps_the_version() {
    let monitoring = Monitoring::new();
    monitoring.use_tool_id(0, "dbg").unwrap();
    monitoring.set_events(0, EventSet::PY_START | EventSet::LINE).unwrap();
    let version = monitoring.version();
    assert_eq!(version, VERSION_INCREMENT);

    monitoring.set_events(0, EventSet::PY_START | EventSet::LINE).unwrap();
    assert_eq!(monitoring.version(), version, "unchanged event set must not bump the version");
}

#[test]
fn instrumenting_twice_changes_nothing() {
    let monitoring = Monitoring::new();
    let code = sample();
    monitoring.use_tool_id(0, "dbg").unwrap();
    monitoring
        .set_events(0, EventSet::CALL | EventSet::LINE | EventSet::INSTRUCTION | EventSet::BRANCHES)
        .unwrap();
    monitoring.instrument(&code).unwrap();
    let first = slots(&code);
    monitoring.instrument(&code).unwrap();
    assert_eq!(slots(&code), first);
    assert_eq!(code.instrumentation_version(), monitoring.version());
}

#[test]
fn restart_bumps_past_the_restart_version() {
    let monitoring = Monitoring::new();
    monitoring.restart_events().unwrap();
    let restart = monitoring.last_restart_version();
    assert!(restart > 0);
    assert_eq!(monitoring.version(), restart + VERSION_INCREMENT);
}

/// Code with active monitors is stamped at the post-restart version and
/// counts as restarted, so every location is re-added.
#[test]
fn restart_reinstruments_monitored_code() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    monitoring.use_tool_id(1, "cov").unwrap();
    monitoring.set_local_events(&code, 1, EventSet::LINE).unwrap();
    let before = code.instrumentation_version();

    monitoring.restart_events().unwrap();
    let after = code.instrumentation_version();
    assert!(after > before, "{after:#x} should be past {before:#x}");
    assert!(after > monitoring.last_restart_version());
    assert_eq!(after, monitoring.version());
    assert!(code.slot(1).has_line());
}

#[test]
fn overflowing_the_version_is_reported() {
    let err = MonitoringError::Overflow;
    let exc = Exception::from(err.clone());
    assert_eq!(exc.exc_type(), ExcType::OverflowError);
    assert_eq!(err.to_string(), "events set too many times");
}

// ============================================================================
// Slot rewriting
// ============================================================================

const LOCAL_EVENT_BITS: u32 = (1 << 11) - 1;

/// After any sequence of event changes, an evented slot is instrumented
/// exactly when some tool has its event enabled, globally or locally, and
/// every eligible slot carries an instruction overlay exactly when some tool
/// watches INSTRUCTION.
#[test]
fn slots_track_active_events() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let monitoring = Monitoring::new();
    let code = sample();
    let tools = [0u8, 1, 2, 3];
    for tool in tools {
        monitoring.use_tool_id(tool, format!("tool{tool}")).unwrap();
    }
    let mut global = [EventSet::empty(); 4];
    let mut local = [EventSet::empty(); 4];

    for step in 0..300 {
        let t = rng.gen_range(0..tools.len());
        let events = EventSet::from_bits_retain(rng.gen_range(0..=LOCAL_EVENT_BITS));
        match rng.gen_range(0..10) {
            0..=4 => {
                monitoring.set_events(tools[t], events).unwrap();
                global[t] = events;
            }
            5..=8 => {
                monitoring.set_local_events(&code, tools[t], events).unwrap();
                local[t] = events;
            }
            _ => {
                monitoring.clear_tool_id(tools[t]).unwrap();
                global[t] = EventSet::empty();
                local[t] = EventSet::empty();
            }
        }
        monitoring.instrument(&code).unwrap();

        let active = |event: Event| (0..tools.len()).any(|t| (global[t] | local[t]).contains(event.bit()));
        for i in code.offsets_from(0) {
            let slot = code.slot(i);
            if let Some(event) = event_for_opcode(code.base_opcode(i), code.oparg(i)) {
                assert_eq!(
                    slot.underlying().is_instrumented(),
                    active(event),
                    "step {step}: slot {i} ({}) for {event}",
                    code.base_opcode(i)
                );
            }
            if !matches!(code.base_opcode(i), Opcode::Resume | Opcode::EndFor) {
                assert_eq!(
                    slot.has_instruction(),
                    active(Event::Instruction),
                    "step {step}: instruction overlay at {i}"
                );
            }
        }
    }
}

#[test]
fn swapping_forms_resets_the_adaptive_counter() {
    let monitoring = Monitoring::new();
    let code = sample();
    let call = 7;
    assert_eq!(code.base_opcode(call), Opcode::Call);
    assert_eq!(code.cache_counter(call), Some(0));

    monitoring.use_tool_id(2, "prof").unwrap();
    monitoring.set_events(2, EventSet::CALL).unwrap();
    monitoring.instrument(&code).unwrap();
    assert_eq!(code.visible_opcode(call), Opcode::InstrumentedCall);
    assert_eq!(code.cache_counter(call), Some(WARMUP_COUNTER));
}

#[test]
#[should_panic(expected = "index out of bounds")]
fn slot_past_the_end_panics() {
    let code = straight_line();
    let _ = code.slot(code.len());
}

#[test]
#[should_panic(expected = "index out of bounds")]
fn stepping_past_the_end_panics() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let mut thread = ThreadState::new();
    let _ = monitoring.step(&mut thread, &code, code.len(), None, false);
}

/// Disabling every event hands each slot back in its compiled form.
#[test]
fn disabling_events_restores_the_compiled_opcodes() {
    let monitoring = Monitoring::new();
    let code = sample();
    let compiled: Vec<Slot> = code.offsets_from(0).map(|i| code.slot(i)).collect();

    monitoring.use_tool_id(2, "prof").unwrap();
    monitoring
        .set_events(2, EventSet::CALL | EventSet::PY_START | EventSet::PY_RETURN | EventSet::BRANCHES | EventSet::LINE)
        .unwrap();
    monitoring.instrument(&code).unwrap();
    assert_eq!(code.visible_opcode(7), Opcode::InstrumentedCall);

    monitoring.set_events(2, EventSet::empty()).unwrap();
    let restored: Vec<Slot> = code.offsets_from(0).map(|i| code.slot(i)).collect();
    assert_eq!(restored, compiled);
    assert_eq!(code.slot(7), Slot::Plain(Opcode::Call));
    assert_eq!(code.cache_counter(7), Some(WARMUP_COUNTER));
}

#[test]
fn jump_targets_start_lines() {
    let monitoring = Monitoring::new();
    let code = sample();
    monitoring.use_tool_id(1, "cov").unwrap();
    monitoring.set_events(1, EventSet::LINE).unwrap();
    monitoring.instrument(&code).unwrap();

    let starts: Vec<usize> = code.offsets_from(0).filter(|&i| code.slot(i).has_line()).collect();
    // 19 is FOR_ITER, on the same line as GET_ITER but the target of the
    // backward jump; POP_ITER at 25 is a jump target that never starts a line
    assert_eq!(starts, vec![1, 18, 19, 22, 26]);
}

#[test]
fn branches_report_both_directions() {
    let code = sample();
    assert_eq!(
        code.branches(),
        vec![
            Branch {
                source: 15,
                not_taken: 18,
                taken: 26,
            },
            Branch {
                source: 19,
                not_taken: 21,
                taken: 26,
            },
        ]
    );
}

#[test]
fn local_events_are_dropped_when_the_tool_is_cleared() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    monitoring.use_tool_id(0, "dbg").unwrap();
    monitoring.set_local_events(&code, 0, EventSet::PY_RETURN).unwrap();
    assert_eq!(monitoring.get_local_events(&code, 0).unwrap(), EventSet::PY_RETURN);
    assert_eq!(code.visible_opcode(4), Opcode::InstrumentedReturnValue);

    monitoring.clear_tool_id(0).unwrap();
    assert_eq!(monitoring.get_local_events(&code, 0).unwrap(), EventSet::empty());
    assert_eq!(code.slot(4), Slot::Plain(Opcode::ReturnValue));
}

#[test]
fn local_event_sets_reject_global_only_events() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    monitoring.use_tool_id(0, "dbg").unwrap();
    let err = monitoring.set_local_events(&code, 0, EventSet::RAISE).unwrap_err();
    assert_eq!(err.to_string(), "invalid local event set 0x800");
}

#[test]
fn shim_code_cannot_be_instrumented() {
    let mut builder = CodeBuilder::new("shim");
    builder.emit_arg(Opcode::Resume, 0);
    builder.mark_traceable();
    let code = builder.build();
    assert!(code.is_shim());

    let monitoring = Monitoring::new();
    monitoring.use_tool_id(0, "dbg").unwrap();
    let err = monitoring.set_local_events(&code, 0, EventSet::PY_START).unwrap_err();
    assert_eq!(err, MonitoringError::System("cannot instrument shim code object 'shim'".to_owned()));
}

#[test]
fn unmonitored_code_is_left_alone() {
    let mut builder = CodeBuilder::new("static").no_monitoring_events();
    builder.emit_arg(Opcode::Resume, 0);
    builder.emit(Opcode::ReturnValue);
    let code = builder.build();

    let monitoring = Monitoring::new();
    let recorder = Arc::new(RecordingTool::new());
    monitoring
        .install(0, "rec", EventSet::PY_START | EventSet::PY_RETURN, recorder.clone())
        .unwrap();
    run(&monitoring, &mut ThreadState::new(), &code);
    assert_eq!(code.slot(0), Slot::Plain(Opcode::Resume));
    assert_eq!(recorder.event_count(), 0);
}

// ============================================================================
// Event delivery
// ============================================================================

#[test]
fn start_and_return_fire_from_their_opcodes() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let recorder = Arc::new(RecordingTool::new());
    monitoring
        .install(1, "rec", EventSet::PY_START | EventSet::PY_RETURN, recorder.clone())
        .unwrap();
    run(&monitoring, &mut ThreadState::new(), &code);

    let events: Vec<(Event, usize)> = recorder.events().iter().map(|e| (e.event, e.offset)).collect();
    assert_eq!(events, vec![(Event::PyStart, 0), (Event::PyReturn, 4)]);
}

#[test]
fn instruction_fires_before_line() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let recorder = Arc::new(RecordingTool::new());
    monitoring
        .install(1, "rec", EventSet::LINE | EventSet::INSTRUCTION, recorder.clone())
        .unwrap();
    run(&monitoring, &mut ThreadState::new(), &code);

    let events: Vec<(Event, usize, Option<u32>)> =
        recorder.events().iter().map(|e| (e.event, e.offset, e.line)).collect();
    assert_eq!(
        events,
        vec![
            (Event::Instruction, 1, None),
            (Event::Line, 1, Some(11)),
            (Event::Instruction, 2, None),
            (Event::Instruction, 3, None),
            (Event::Line, 3, Some(12)),
            (Event::Instruction, 4, None),
        ]
    );
}

#[test]
fn tools_are_called_highest_id_first() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let order = Arc::new(Mutex::new(Vec::new()));
    for tool in [1u8, 3] {
        let order = Arc::clone(&order);
        let cb = callback(move |args| {
            order.lock().unwrap().push(args.tool);
            Ok(Disposition::Continue)
        });
        monitoring.install(tool, format!("t{tool}"), EventSet::PY_START, cb).unwrap();
    }
    run(&monitoring, &mut ThreadState::new(), &code);
    assert_eq!(*order.lock().unwrap(), vec![3, 1]);
    assert_eq!(monitoring.all_events().get("PY_START"), Some(&0b1010));
}

#[test]
fn tools_do_not_see_each_others_events() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let starts = Arc::new(RecordingTool::new());
    let returns = Arc::new(RecordingTool::new());
    monitoring.install(0, "starts", EventSet::PY_START, starts.clone()).unwrap();
    monitoring.install(2, "returns", EventSet::PY_RETURN, returns.clone()).unwrap();
    run(&monitoring, &mut ThreadState::new(), &code);

    assert!(starts.events().iter().all(|e| e.event == Event::PyStart && e.tool == 0));
    assert!(returns.events().iter().all(|e| e.event == Event::PyReturn && e.tool == 2));
    assert_eq!(starts.event_count() + returns.event_count(), 2);
}

#[test]
fn nothing_is_delivered_while_tracing() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let recorder = Arc::new(RecordingTool::new());
    monitoring.install(0, "rec", EventSet::PY_START, recorder.clone()).unwrap();
    let mut thread = ThreadState::new();
    thread.with_tracing(|thread| run(&monitoring, thread, &code));
    assert_eq!(recorder.event_count(), 0);
}

// ============================================================================
// DISABLE
// ============================================================================

#[test]
fn disabled_lines_come_back_after_restart() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let recorder = Arc::new(RecordingTool::disabling(Event::Line));
    monitoring.install(1, "cov", EventSet::LINE, recorder.clone()).unwrap();
    let mut thread = ThreadState::new();

    run(&monitoring, &mut thread, &code);
    assert_eq!(recorder.take().len(), 2);
    assert!(!code.slot(1).has_line(), "disabled line overlay should be removed");

    run(&monitoring, &mut thread, &code);
    assert_eq!(recorder.take().len(), 0, "disabled lines stay quiet");

    monitoring.restart_events().unwrap();
    run(&monitoring, &mut thread, &code);
    assert_eq!(recorder.take().len(), 2, "restart re-enables every location");
}

#[test]
fn disable_from_a_global_event_removes_the_callback() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let cb = callback(|_| Ok(Disposition::Disable));
    monitoring.install(2, "raise", EventSet::RAISE, cb).unwrap();
    let mut thread = ThreadState::new();

    thread.set_pending_exception(Exception::new(ExcType::ValueError, "boom"));
    let err = monitoring.fire_protected(&mut thread, Event::Raise, &code, 1).unwrap_err();
    assert_eq!(err, MonitoringError::DisableNotAllowed(Event::Raise));
    assert_eq!(err.to_string(), "Cannot disable RAISE events. Callback removed.");

    thread.set_pending_exception(Exception::new(ExcType::ValueError, "boom"));
    monitoring.fire_protected(&mut thread, Event::Raise, &code, 1).unwrap();
    assert!(thread.pending_exception().is_some(), "exception must survive the event");
}

#[test]
fn protected_events_see_and_keep_the_exception() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let cb = callback(move |args| {
        if let Payload::Exception(exc) = args.payload {
            *sink.lock().unwrap() = Some(exc.to_string());
        }
        Ok(Disposition::Continue)
    });
    monitoring.install(0, "unwind", EventSet::PY_UNWIND, cb).unwrap();
    let mut thread = ThreadState::new();

    let err = monitoring.fire_protected(&mut thread, Event::PyUnwind, &code, 4).unwrap_err();
    assert_eq!(err.to_string(), "Firing event 13 with no exception set");

    thread.set_pending_exception(Exception::new(ExcType::KeyError, "k"));
    monitoring.fire_protected(&mut thread, Event::PyUnwind, &code, 4).unwrap();
    assert_eq!(seen.lock().unwrap().as_deref(), Some("KeyError: k"));
    assert_eq!(thread.pending_exception().map(Exception::exc_type), Some(ExcType::KeyError));
}

#[test]
fn a_raising_callback_replaces_the_exception() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let cb = callback(|_| Err(Exception::new(ExcType::RuntimeError, "tool failed")));
    monitoring.install(0, "bad", EventSet::RAISE, cb).unwrap();
    let mut thread = ThreadState::new();
    thread.set_pending_exception(Exception::new(ExcType::ValueError, "boom"));

    let err = monitoring.fire_protected(&mut thread, Event::Raise, &code, 1).unwrap_err();
    assert_eq!(
        err,
        MonitoringError::Callback(Exception::new(ExcType::RuntimeError, "tool failed"))
    );
}

// ============================================================================
// BRANCH
// ============================================================================

fn branch_recorder(disposition: Disposition) -> (tyrt::monitoring::Callback, Arc<Mutex<Vec<(Event, usize, usize)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let cb = callback(move |args| {
        if let Payload::Destination(dest) = args.payload {
            sink.lock().unwrap().push((args.event, args.offset, dest));
        }
        Ok(disposition)
    });
    (cb, seen)
}

#[test]
fn taken_branch_reports_the_jump_target() {
    let monitoring = Monitoring::new();
    let code = conditional();
    let (cb, seen) = branch_recorder(Disposition::Continue);
    monitoring.use_tool_id(1, "cov").unwrap();
    monitoring.register_callback(1, EventSet::BRANCH, Some(cb)).unwrap();
    monitoring.set_events(1, EventSet::BRANCH).unwrap();

    let mut thread = ThreadState::new();
    monitoring.step(&mut thread, &code, 0, None, false).unwrap();
    monitoring.step(&mut thread, &code, 1, Some(0), false).unwrap();
    monitoring.step(&mut thread, &code, 2, Some(1), true).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(Event::BranchRight, 2, 7)]);
}

#[test]
fn disabling_one_direction_disables_the_other() {
    let monitoring = Monitoring::new();
    let code = conditional();
    let (cb, seen) = branch_recorder(Disposition::Disable);
    monitoring.use_tool_id(1, "cov").unwrap();
    monitoring.register_callback(1, EventSet::BRANCH, Some(cb)).unwrap();
    monitoring.set_events(1, EventSet::BRANCH).unwrap();

    let mut thread = ThreadState::new();
    let mut prev = None;
    for offset in [0, 1, 2, 4, 5, 6] {
        monitoring.step(&mut thread, &code, offset, prev, false).unwrap();
        prev = Some(offset);
    }
    assert_eq!(*seen.lock().unwrap(), vec![(Event::BranchLeft, 2, 5)]);
    assert_eq!(code.slot(4), Slot::Plain(Opcode::NotTaken));
    assert_eq!(code.slot(2), Slot::Plain(Opcode::PopJumpIfFalse));
}

#[test]
fn registering_branch_returns_the_user_callback() {
    let monitoring = Monitoring::new();
    let (first, _) = branch_recorder(Disposition::Continue);
    let (second, _) = branch_recorder(Disposition::Continue);
    monitoring.use_tool_id(1, "cov").unwrap();
    assert!(monitoring.register_callback(1, EventSet::BRANCH, Some(Arc::clone(&first))).unwrap().is_none());
    let previous = monitoring.register_callback(1, EventSet::BRANCH, Some(second)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&previous, &first), "the wrapper must not leak out");
}

#[test]
fn callbacks_register_one_event_at_a_time() {
    let monitoring = Monitoring::new();
    let (cb, _) = branch_recorder(Disposition::Continue);
    let err = monitoring
        .register_callback(0, EventSet::PY_START | EventSet::PY_RETURN, Some(cb))
        .err().unwrap();
    assert_eq!(err.to_string(), "The callback can only be set for one event at a time");
}

// ============================================================================
// Ready-made tools
// ============================================================================

#[test]
fn coverage_records_each_line_once() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    let coverage = Arc::new(CoverageTool::new());
    monitoring.install(1, "cov", EventSet::LINE, coverage.clone()).unwrap();
    let mut thread = ThreadState::new();
    run(&monitoring, &mut thread, &code);
    run(&monitoring, &mut thread, &code);
    assert_eq!(coverage.lines("f"), vec![11, 12]);
}

#[test]
fn logging_never_changes_control_flow() {
    let monitoring = Monitoring::new();
    let code = straight_line();
    monitoring
        .install(0, "log", EventSet::LINE | EventSet::PY_RETURN, Arc::new(LoggingTool::with_limit(2)))
        .unwrap();
    let mut thread = ThreadState::new();
    run(&monitoring, &mut thread, &code);
    run(&monitoring, &mut thread, &code);
    assert!(code.slot(1).has_line(), "logging never disables a location");
    assert!(code.slot(4).underlying().is_instrumented());
}

#[test]
fn profiling_counts_starts_per_function() {
    let monitoring = Monitoring::new();
    let f = straight_line();
    let profiler = Arc::new(ProfilingTool::new());
    monitoring
        .install(2, "prof", EventSet::PY_START | EventSet::PY_RETURN, profiler.clone())
        .unwrap();
    let mut thread = ThreadState::new();
    for _ in 0..3 {
        run(&monitoring, &mut thread, &f);
    }
    let report = profiler.report();
    assert_eq!(report.total_events, 6);
    assert_eq!(report.starts, vec![("f".to_owned(), 3)]);
    assert!(report.to_string().contains("PY_START"));
}
