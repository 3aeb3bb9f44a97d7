//! Values living in an interpreter's namespace.
//!
//! Each interpreter owns its values outright. The only exception is
//! [`SharedBuffer`], whose storage may be borrowed from another interpreter
//! through cross-interpreter data, with the release routed back to the owner.

use std::{
    any::Any,
    fmt::{self, Write},
    sync::Arc,
};

use crate::{
    exception::Exception,
    interp::{script::FunctionDef, xidata::BufferExport},
};

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    /// Insertion-ordered key/value pairs.
    Dict(Vec<(Value, Value)>),
    /// A memoryview-like window onto contiguous bytes.
    Buffer(SharedBuffer),
    Function(Function),
    Exception(Box<Exception>),
    /// A host object the runtime knows nothing about.
    Opaque(Opaque),
}

impl Value {
    /// Python-level type name, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Buffer(_) => "memoryview",
            Self::Function(Function::Native(_)) => "builtin_function_or_method",
            Self::Function(Function::Defined(_)) => "function",
            Self::Exception(exc) => exc.exc_type().into(),
            Self::Opaque(opaque) => opaque.type_name(),
        }
    }

    /// Truthiness as `bool(value)` computes it.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::Tuple(items) | Self::List(items) => !items.is_empty(),
            Self::Dict(items) => !items.is_empty(),
            Self::Buffer(buf) => !buf.is_empty(),
            Self::Function(_) | Self::Exception(_) | Self::Opaque(_) => true,
        }
    }

    /// Builds a `str` value.
    #[must_use]
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// Builds a buffer value owned by the current interpreter.
    #[must_use]
    pub fn buffer(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Buffer(SharedBuffer::owned(bytes.into()))
    }

    /// `repr(value)`.
    #[must_use]
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.repr_into(&mut out);
        out
    }

    fn repr_into(&self, out: &mut String) {
        match self {
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
                    let _ = write!(out, "{f:.1}");
                } else {
                    let _ = write!(out, "{f}");
                }
            }
            Self::Str(s) => {
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\'' => out.push_str("\\'"),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        c => out.push(c),
                    }
                }
                out.push('\'');
            }
            Self::Bytes(bytes) => {
                out.push_str("b'");
                for &b in bytes {
                    if (b.is_ascii_graphic() && b != b'\'' && b != b'\\') || b == b' ' {
                        out.push(char::from(b));
                    } else {
                        let _ = write!(out, "\\x{b:02x}");
                    }
                }
                out.push('\'');
            }
            Self::Tuple(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.repr_into(out);
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Self::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.repr_into(out);
                }
                out.push(']');
            }
            Self::Dict(items) => {
                out.push('{');
                for (i, (k, v)) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.repr_into(out);
                    out.push_str(": ");
                    v.repr_into(out);
                }
                out.push('}');
            }
            Self::Buffer(buf) => {
                let _ = write!(out, "<memory of {} bytes>", buf.len());
            }
            Self::Function(Function::Native(name)) => {
                let _ = write!(out, "<built-in function {name}>");
            }
            Self::Function(Function::Defined(def)) => {
                let _ = write!(out, "<function {}>", def.qualname());
            }
            Self::Exception(exc) => match exc.message() {
                Some(msg) => {
                    let _ = write!(out, "{}({})", exc.exc_type(), Self::Str(msg.to_owned()).repr());
                }
                None => {
                    let _ = write!(out, "{}()", exc.exc_type());
                }
            },
            Self::Opaque(opaque) => {
                let _ = write!(out, "<{} object>", opaque.type_name());
            }
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// A callable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    /// A function registered on the runtime, referenced by qualified name.
    Native(String),
    /// A function defined in script source.
    Defined(Arc<FunctionDef>),
}

/// Contiguous bytes exposed through the buffer protocol.
///
/// A buffer created locally has no export. One materialized from
/// cross-interpreter data holds an export handle that releases the owning
/// interpreter's buffer when the last clone is dropped.
#[derive(Clone)]
pub struct SharedBuffer {
    bytes: Arc<[u8]>,
    export: Option<Arc<BufferExport>>,
}

impl SharedBuffer {
    pub(crate) fn owned(bytes: Arc<[u8]>) -> Self {
        Self { bytes, export: None }
    }

    pub(crate) fn borrowed(bytes: Arc<[u8]>, export: Arc<BufferExport>) -> Self {
        Self {
            bytes,
            export: Some(export),
        }
    }

    pub(crate) fn storage(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Id of the interpreter this buffer was borrowed from, if any.
    #[must_use]
    pub fn owner(&self) -> Option<i64> {
        self.export.as_ref().map(|export| export.owner())
    }
}

impl PartialEq for SharedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.bytes.len())
            .field("owner", &self.owner())
            .finish()
    }
}

/// An arbitrary host object. Never shareable across interpreters.
#[derive(Clone)]
pub struct Opaque {
    type_name: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    pub fn new(type_name: impl Into<String>, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            type_name: type_name.into(),
            inner,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({})", self.type_name)
    }
}
