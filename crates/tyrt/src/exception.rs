//! Python-level exception values shared by both subsystems.
//!
//! Exceptions are plain data here: a kind, an optional message, an optional
//! chained cause and the frames recorded while unwinding. They never hold
//! references into an interpreter heap, which is what lets
//! [`ExcInfo`](crate::interp::ExcInfo) snapshot them across interpreter
//! boundaries.

use std::fmt::{self, Display, Write};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strum::{Display, EnumString, IntoStaticStr};

/// Python exception types raised by the runtime.
///
/// Uses strum derives for `Display`, `FromStr` and `Into<&'static str>`.
/// The string form matches the variant name exactly (e.g. `ValueError` -> "ValueError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcType {
    /// Root of the hierarchy.
    BaseException,
    /// Primary exception class.
    Exception,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    OverflowError,
    ZeroDivisionError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    NotImplementedError,
    RecursionError,

    AttributeError,
    NameError,
    TypeError,
    ValueError,
    AssertionError,
    MemoryError,
    SystemError,
    SyntaxError,
    StopIteration,

    // --- cross-interpreter exceptions ---
    /// A cross-interpreter operation failed.
    InterpreterError,
    /// Subclass of InterpreterError: no interpreter has the given id.
    InterpreterNotFoundError,
    /// Subclass of ValueError: the object cannot cross an interpreter boundary.
    NotShareableError,
    /// Subclass of InterpreterError: an uncaught exception in another interpreter.
    ExecutionFailed,
}

impl ExcType {
    /// The module the exception class lives in, `None` for builtins.
    #[must_use]
    pub fn module(self) -> Option<&'static str> {
        match self {
            Self::InterpreterError | Self::InterpreterNotFoundError | Self::NotShareableError | Self::ExecutionFailed => {
                Some("concurrent.interpreters")
            }
            _ => None,
        }
    }

    /// Whether `self` is `other` or one of its subclasses.
    #[must_use]
    pub fn is_subclass_of(self, other: Self) -> bool {
        if self == other || other == Self::BaseException {
            return true;
        }
        match self.parent() {
            Some(parent) => parent.is_subclass_of(other),
            None => false,
        }
    }

    fn parent(self) -> Option<Self> {
        Some(match self {
            Self::BaseException => return None,
            Self::Exception => Self::BaseException,
            Self::OverflowError | Self::ZeroDivisionError => Self::ArithmeticError,
            Self::IndexError | Self::KeyError => Self::LookupError,
            Self::NotImplementedError | Self::RecursionError => Self::RuntimeError,
            Self::InterpreterNotFoundError | Self::ExecutionFailed => Self::InterpreterError,
            Self::NotShareableError => Self::ValueError,
            _ => Self::Exception,
        })
    }
}

/// A single frame recorded while an exception unwound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub filename: String,
    pub line: u32,
    pub name: String,
}

/// A raised Python exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    exc_type: ExcType,
    message: Option<String>,
    cause: Option<Box<Exception>>,
    traceback: SmallVec<[Frame; 4]>,
}

impl Exception {
    /// Creates an exception with a message.
    #[must_use]
    pub fn new(exc_type: ExcType, message: impl Into<String>) -> Self {
        Self {
            exc_type,
            message: Some(message.into()),
            cause: None,
            traceback: SmallVec::new(),
        }
    }

    /// Creates an exception without arguments, as `raise ValueError` does.
    #[must_use]
    pub fn bare(exc_type: ExcType) -> Self {
        Self {
            exc_type,
            message: None,
            cause: None,
            traceback: SmallVec::new(),
        }
    }

    /// Sets `__cause__`.
    #[must_use]
    pub fn with_cause(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        self.cause.as_deref()
    }

    #[must_use]
    pub fn traceback(&self) -> &[Frame] {
        &self.traceback
    }

    /// Records a frame the exception unwound through, innermost last.
    pub fn push_frame(&mut self, frame: Frame) {
        self.traceback.insert(0, frame);
    }

    /// Shorthand for the most common raise sites.
    #[must_use]
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::ValueError, message)
    }

    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::TypeError, message)
    }

    /// The traceback rendered the way the default excepthook prints it.
    #[must_use]
    pub fn render_traceback(&self) -> String {
        let mut out = String::new();
        if !self.traceback.is_empty() {
            out.push_str("Traceback (most recent call last):\n");
            for frame in &self.traceback {
                let _ = writeln!(out, "  File \"{}\", line {}, in {}", frame.filename, frame.line, frame.name);
            }
        }
        let _ = write!(out, "{self}");
        out
    }
}

impl Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {msg}", self.exc_type),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

impl std::error::Error for Exception {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}
