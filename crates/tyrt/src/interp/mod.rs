//! Multiple isolated interpreters in one process.
//!
//! # Module Structure
//!
//! - [`registry`]: the runtime, interpreter lifecycle and reference counts
//! - `config`: isolation presets and attribute-mapping conversion
//! - `xidata`: cross-interpreter data, including shared buffers
//! - `session`: switching a thread into another interpreter and back
//! - `call`: callables and arguments packed for another interpreter
//! - `excinfo`: exceptions captured in one interpreter, reported in another
//! - `script`: the code interpreters run
//! - `api`: the interpreter operations, as methods on [`ThreadContext`]
//!
//! # Isolation
//!
//! No value is ever reachable from two interpreters. Everything that crosses
//! goes through [`XiData`]: a snapshot taken in the source interpreter and
//! rebuilt as a fresh value in the destination. Shared buffers are the one
//! exception, and their release is routed back to the owner.

mod api;
mod call;
mod config;
mod excinfo;
pub mod registry;
pub(crate) mod script;
mod session;
pub(crate) mod xidata;

pub use api::{Runnable, new_config};
pub use call::PendingCall;
pub use config::{ConfigError, GilMode, InterpreterConfig};
pub use excinfo::{ExcInfo, ExcTypeInfo};
pub use registry::{
    Interpreter, InterpreterId, InterpreterRef, MAIN_INTERPRETER_ID, Namespace, NativeFn, OwnedInterpreter, Runtime,
    Status, ThreadContext, Whence,
};
pub use script::{FunctionDef, Script, ScriptError};
pub use session::{Session, SessionResult, SessionState};
pub use xidata::{XiData, XiError, XiErrorCode, XiFallback, is_shareable};

use crate::exception::{ExcType, Exception};

/// Errors from interpreter operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterpError {
    #[error("unrecognized interpreter ID {0}")]
    NotFound(InterpreterId),
    /// The operation is not allowed on this interpreter right now.
    #[error("{0}")]
    Interpreter(String),
    #[error("interpreter creation failed")]
    CreationFailed(#[source] Exception),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Xi(#[from] XiError),
    /// An ordinary exception, such as a bad argument.
    #[error(transparent)]
    Raised(#[from] Exception),
}

impl From<InterpError> for Exception {
    fn from(err: InterpError) -> Self {
        match err {
            InterpError::NotFound(_) => Self::new(ExcType::InterpreterNotFoundError, err.to_string()),
            InterpError::Interpreter(msg) => Self::new(ExcType::InterpreterError, msg),
            InterpError::CreationFailed(cause) => {
                Self::new(ExcType::InterpreterError, "interpreter creation failed").with_cause(cause)
            }
            InterpError::Config(err) => err.into(),
            InterpError::Xi(err) => err.into(),
            InterpError::Raised(exc) => exc,
        }
    }
}
