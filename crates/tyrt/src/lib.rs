#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "offsets and opargs are range-checked at build time")]

pub mod bytecode;
mod exception;
pub mod interp;
pub mod monitoring;
mod value;

pub use crate::{
    exception::{ExcType, Exception, Frame},
    interp::{
        ExcInfo, InterpError, Interpreter, InterpreterConfig, InterpreterId, Namespace, OwnedInterpreter, Runtime,
        Script, Session, ThreadContext, Whence, XiData, XiError,
    },
    monitoring::{Event, EventSet, MonitorCallback, Monitoring, MonitoringError, ThreadState},
    value::{Function, Opaque, SharedBuffer, Value},
};
