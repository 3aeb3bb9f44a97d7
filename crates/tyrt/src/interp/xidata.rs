//! Cross-interpreter data.
//!
//! Objects never cross an interpreter boundary. An [`XiData`] is an
//! interpreter-independent snapshot taken in the source interpreter and
//! turned back into a fresh value in the destination:
//!
//! | Repr | Values | Encoding |
//! |------|--------|----------|
//! | marshal | `None`, `bool`, `int`, `float`, `str`, `bytes`, tuples of these, functions | postcard |
//! | pickle | the above plus `list`, `dict` and exceptions, when fallback is allowed | serde_json |
//! | buffer | `memoryview` | shared storage, released through the owner |
//! | script | compiled scripts | postcard |
//!
//! Buffers are the one case where storage is actually shared. The
//! [`BufferExport`] handle counts the export against the owning interpreter
//! and routes the release back to it, whichever interpreter drops the last
//! reference.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use serde::{Deserialize, Serialize};
use strum::Display;

use super::{
    registry::{Interpreter, InterpreterId, Runtime, RuntimeState},
    script::{FunctionDef, Script},
};
use crate::{
    exception::{ExcType, Exception},
    value::{Function, SharedBuffer, Value},
};

/// Whether conversion may fall back to the pickle representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XiFallback {
    /// Only natively shareable types.
    #[default]
    XiDataOnly,
    /// Containers and exceptions too.
    Full,
}

/// Why a cross-interpreter operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum XiErrorCode {
    Other,
    NoMemory,
    AlreadyRunning,
    MainNsFailure,
    ApplyNsFailure,
    PreserveFailure,
    ExcPropagationFailure,
    NotShareable,
    UncaughtException,
}

impl XiErrorCode {
    fn default_message(self) -> &'static str {
        match self {
            Self::Other => "cross-interpreter operation failed",
            Self::NoMemory => "out of memory",
            Self::AlreadyRunning => "interpreter already running",
            Self::MainNsFailure => "failed to get __main__ namespace",
            Self::ApplyNsFailure => "failed to apply namespace to __main__",
            Self::PreserveFailure => "failed to preserve objects across session",
            Self::ExcPropagationFailure => "failed to transfer exception between interpreters",
            Self::NotShareable => "object does not support cross-interpreter data",
            Self::UncaughtException => "uncaught exception in another interpreter",
        }
    }

    fn exc_type(self) -> ExcType {
        match self {
            Self::NoMemory => ExcType::MemoryError,
            Self::NotShareable => ExcType::NotShareableError,
            Self::UncaughtException => ExcType::ExecutionFailed,
            _ => ExcType::InterpreterError,
        }
    }
}

/// A failed cross-interpreter operation.
#[derive(Debug, Clone, PartialEq)]
pub struct XiError {
    code: XiErrorCode,
    message: Option<String>,
    cause: Option<Box<Exception>>,
}

impl XiError {
    #[must_use]
    pub fn new(code: XiErrorCode) -> Self {
        Self {
            code,
            message: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: Exception) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub(crate) fn not_shareable(message: impl Into<String>) -> Self {
        Self::new(XiErrorCode::NotShareable).with_message(message)
    }

    #[must_use]
    pub fn code(&self) -> XiErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_else(|| self.code.default_message())
    }

    #[must_use]
    pub fn cause(&self) -> Option<&Exception> {
        self.cause.as_deref()
    }
}

impl fmt::Display for XiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for XiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|exc| exc as &(dyn std::error::Error + 'static))
    }
}

impl From<XiError> for Exception {
    fn from(err: XiError) -> Self {
        let exc = match (err.code, &err.message) {
            (XiErrorCode::Other, None) => Self::bare(ExcType::InterpreterError),
            _ => Self::new(err.code.exc_type(), err.message()),
        };
        match err.cause {
            Some(cause) => exc.with_cause(*cause),
            None => exc,
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
enum Wire {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Wire>),
    List(Vec<Wire>),
    Dict(Vec<(Wire, Wire)>),
    Native(String),
    Defined(FunctionDef),
    Exception(Exception),
}

/// Converts `value`, or names the type that blocked conversion.
fn to_wire(value: &Value, fallback: XiFallback) -> Result<Wire, String> {
    let full = fallback == XiFallback::Full;
    Ok(match value {
        Value::None => Wire::None,
        Value::Bool(b) => Wire::Bool(*b),
        Value::Int(i) => Wire::Int(*i),
        Value::Float(f) => Wire::Float(*f),
        Value::Str(s) => Wire::Str(s.clone()),
        Value::Bytes(b) => Wire::Bytes(b.clone()),
        Value::Tuple(items) => Wire::Tuple(items.iter().map(|v| to_wire(v, fallback)).collect::<Result<_, _>>()?),
        Value::List(items) if full => Wire::List(items.iter().map(|v| to_wire(v, fallback)).collect::<Result<_, _>>()?),
        Value::Dict(items) if full => Wire::Dict(
            items
                .iter()
                .map(|(k, v)| Ok((to_wire(k, fallback)?, to_wire(v, fallback)?)))
                .collect::<Result<_, String>>()?,
        ),
        Value::Exception(exc) if full => Wire::Exception((**exc).clone()),
        Value::Function(Function::Native(name)) => Wire::Native(name.clone()),
        Value::Function(Function::Defined(def)) => Wire::Defined((**def).clone()),
        other => return Err(other.type_name().to_owned()),
    })
}

fn from_wire(wire: Wire, runtime: &Runtime) -> Result<Value, XiError> {
    let all = |items: Vec<Wire>| items.into_iter().map(|w| from_wire(w, runtime)).collect::<Result<Vec<_>, _>>();
    Ok(match wire {
        Wire::None => Value::None,
        Wire::Bool(b) => Value::Bool(b),
        Wire::Int(i) => Value::Int(i),
        Wire::Float(f) => Value::Float(f),
        Wire::Str(s) => Value::Str(s),
        Wire::Bytes(b) => Value::Bytes(b),
        Wire::Tuple(items) => Value::Tuple(all(items)?),
        Wire::List(items) => Value::List(all(items)?),
        Wire::Dict(items) => Value::Dict(
            items
                .into_iter()
                .map(|(k, v)| Ok((from_wire(k, runtime)?, from_wire(v, runtime)?)))
                .collect::<Result<_, XiError>>()?,
        ),
        Wire::Native(name) => {
            if runtime.native(&name).is_none() {
                return Err(XiError::not_shareable(format!("native function '{name}' is not registered")));
            }
            Value::Function(Function::Native(name))
        }
        Wire::Defined(def) => Value::Function(Function::Defined(Arc::new(def))),
        Wire::Exception(exc) => Value::Exception(Box::new(exc)),
    })
}

fn not_shareable(type_name: &str) -> XiError {
    XiError::not_shareable(format!("{type_name} does not support cross-interpreter data"))
}

fn encoding_error(err: impl fmt::Display) -> XiError {
    XiError::new(XiErrorCode::Other).with_message(format!("cross-interpreter data encoding failed: {err}"))
}

// ============================================================================
// XiData
// ============================================================================

enum Repr {
    Marshal(Vec<u8>),
    Pickle(Vec<u8>),
    Buffer { bytes: Arc<[u8]>, export: Arc<BufferExport> },
    Script(Vec<u8>),
}

/// An interpreter-independent snapshot of one value.
pub struct XiData {
    source: InterpreterId,
    repr: Repr,
}

impl XiData {
    /// Snapshots `value`, which lives in `source`.
    pub fn new(runtime: &Runtime, source: &Interpreter, value: &Value, fallback: XiFallback) -> Result<Self, XiError> {
        let repr = match value {
            Value::Buffer(buf) => {
                // re-sharing a borrowed buffer still releases to its first owner
                let owner = buf.owner().unwrap_or_else(|| source.id());
                Repr::Buffer {
                    bytes: Arc::clone(buf.storage()),
                    export: BufferExport::acquire(runtime, owner),
                }
            }
            _ => match to_wire(value, XiFallback::XiDataOnly) {
                Ok(wire) => Repr::Marshal(postcard::to_allocvec(&wire).map_err(encoding_error)?),
                Err(blocker) if fallback == XiFallback::Full => {
                    let wire = to_wire(value, fallback).map_err(|_| not_shareable(&blocker))?;
                    Repr::Pickle(serde_json::to_vec(&wire).map_err(encoding_error)?)
                }
                Err(blocker) => return Err(not_shareable(&blocker)),
            },
        };
        Ok(Self {
            source: source.id(),
            repr,
        })
    }

    /// Snapshots a compiled script.
    pub fn script(source: &Interpreter, script: &Script) -> Result<Self, XiError> {
        Ok(Self {
            source: source.id(),
            repr: Repr::Script(postcard::to_allocvec(script).map_err(encoding_error)?),
        })
    }

    /// The interpreter the data was taken from.
    #[must_use]
    pub fn source(&self) -> InterpreterId {
        self.source
    }

    #[must_use]
    pub fn is_buffer(&self) -> bool {
        matches!(self.repr, Repr::Buffer { .. })
    }

    /// Builds a fresh value in the interpreter `runtime` is running.
    pub fn into_value(self, runtime: &Runtime) -> Result<Value, XiError> {
        match self.repr {
            Repr::Marshal(bytes) => {
                let wire: Wire = postcard::from_bytes(&bytes).map_err(encoding_error)?;
                from_wire(wire, runtime)
            }
            Repr::Pickle(bytes) => {
                let wire: Wire = serde_json::from_slice(&bytes).map_err(encoding_error)?;
                from_wire(wire, runtime)
            }
            Repr::Buffer { bytes, export } => Ok(Value::Buffer(SharedBuffer::borrowed(bytes, export))),
            Repr::Script(_) => Err(XiError::new(XiErrorCode::Other).with_message("script data is not a value")),
        }
    }

    pub fn into_script(self) -> Result<Script, XiError> {
        match self.repr {
            Repr::Script(bytes) => postcard::from_bytes(&bytes).map_err(encoding_error),
            _ => Err(XiError::new(XiErrorCode::Other).with_message("data is not a script")),
        }
    }

    /// Discards the snapshot, releasing any buffer it holds.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for XiData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.repr {
            Repr::Marshal(b) => format!("marshal({} bytes)", b.len()),
            Repr::Pickle(b) => format!("pickle({} bytes)", b.len()),
            Repr::Buffer { bytes, export } => format!("buffer({} bytes, owner {})", bytes.len(), export.owner),
            Repr::Script(b) => format!("script({} bytes)", b.len()),
        };
        f.debug_struct("XiData").field("source", &self.source).field("repr", &kind).finish()
    }
}

/// Whether `value` can cross without falling back to pickle.
#[must_use]
pub fn is_shareable(value: &Value) -> bool {
    matches!(value, Value::Buffer(_)) || to_wire(value, XiFallback::XiDataOnly).is_ok()
}

// ============================================================================
// BufferExport
// ============================================================================

/// One export of a buffer to other interpreters.
///
/// Dropping the last handle releases the export in the owning interpreter.
/// If the owner has been destroyed meanwhile, the release is skipped.
pub struct BufferExport {
    owner: InterpreterId,
    runtime: Weak<RuntimeState>,
}

impl BufferExport {
    fn acquire(runtime: &Runtime, owner: InterpreterId) -> Arc<Self> {
        if let Some(interp) = runtime.get(owner) {
            interp.export_buffer();
        }
        Arc::new(Self {
            owner,
            runtime: runtime.downgrade(),
        })
    }

    #[must_use]
    pub fn owner(&self) -> InterpreterId {
        self.owner
    }
}

impl Drop for BufferExport {
    fn drop(&mut self) {
        match Runtime::upgrade(&self.runtime).and_then(|runtime| runtime.get(self.owner)) {
            Some(interp) => interp.release_buffer(),
            None => log::warn!("buffer owner interpreter {} is gone, release skipped", self.owner),
        }
    }
}

impl fmt::Debug for BufferExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferExport").field("owner", &self.owner).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn tuples_of_primitives_are_native() {
        let runtime = Runtime::new();
        let main = runtime.main();
        let value = Value::Tuple(vec![Value::Int(1), Value::str("two"), Value::Bytes(b"3".to_vec()), Value::None]);
        let data = XiData::new(&runtime, &main, &value, XiFallback::XiDataOnly).unwrap();
        assert_eq!(data.into_value(&runtime).unwrap(), value);
    }

    #[test]
    fn lists_need_fallback() {
        let runtime = Runtime::new();
        let main = runtime.main();
        let value = Value::List(vec![Value::Int(1)]);
        let err = XiData::new(&runtime, &main, &value, XiFallback::XiDataOnly).unwrap_err();
        assert_eq!(err.code(), XiErrorCode::NotShareable);
        assert_eq!(err.to_string(), "list does not support cross-interpreter data");
        let data = XiData::new(&runtime, &main, &value, XiFallback::Full).unwrap();
        assert_eq!(data.into_value(&runtime).unwrap(), value);
    }

    #[test]
    fn nested_blocker_is_named() {
        let value = Value::Tuple(vec![Value::Int(1), Value::List(Vec::new())]);
        assert!(!is_shareable(&value));
        assert!(is_shareable(&Value::buffer(&b"abc"[..])));
    }

    #[test]
    fn error_converts_to_exception_type() {
        let exc: Exception = XiError::new(XiErrorCode::AlreadyRunning).into();
        assert_eq!(exc.exc_type(), ExcType::InterpreterError);
        assert_eq!(exc.message(), Some("interpreter already running"));
        let exc: Exception = XiError::new(XiErrorCode::Other).into();
        assert_eq!(exc.message(), None);
    }
}
