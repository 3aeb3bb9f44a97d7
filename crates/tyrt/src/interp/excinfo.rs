//! Snapshots of exceptions raised in another interpreter.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exception::{ExcType, Exception};

/// The type of a captured exception, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcTypeInfo {
    pub name: String,
    pub qualname: String,
    /// `"builtins"` for builtin exception types.
    pub module: String,
}

impl ExcTypeInfo {
    fn of(exc_type: ExcType) -> Self {
        let name: &'static str = exc_type.into();
        Self {
            name: name.to_owned(),
            qualname: name.to_owned(),
            module: exc_type.module().unwrap_or("builtins").to_owned(),
        }
    }

    /// `module.qualname`, or just `qualname` for builtins.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.module == "builtins" {
            self.qualname.clone()
        } else {
            format!("{}.{}", self.module, self.qualname)
        }
    }
}

/// An interpreter-independent description of an uncaught exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcInfo {
    pub exc_type: ExcTypeInfo,
    pub msg: Option<String>,
    /// `"Type: msg"` as a one-line summary.
    pub formatted: String,
    /// The full rendered traceback from the raising interpreter.
    pub errdisplay: String,
    /// The exception object itself, when it was preserved across.
    pub exc: Option<Exception>,
}

impl ExcInfo {
    #[must_use]
    pub fn capture(exc: &Exception) -> Self {
        let exc_type = ExcTypeInfo::of(exc.exc_type());
        let msg = exc.message().map(str::to_owned);
        let formatted = match &msg {
            Some(msg) if !msg.is_empty() => format!("{}: {msg}", exc_type.display_name()),
            _ => exc_type.display_name(),
        };
        Self {
            exc_type,
            msg,
            formatted,
            errdisplay: exc.render_traceback(),
            exc: None,
        }
    }

    /// Whether the captured type is `exc_type` or a subclass.
    #[must_use]
    pub fn is(&self, exc_type: ExcType) -> bool {
        self.original_type().is_some_and(|t| t.is_subclass_of(exc_type))
    }

    fn original_type(&self) -> Option<ExcType> {
        self.exc_type.name.parse().ok()
    }

    /// Builds the exception raised locally for this failure: an
    /// `ExecutionFailed` whose cause stands in for the original.
    #[must_use]
    pub fn raise_local(&self) -> Exception {
        let cause = match (&self.exc, self.original_type()) {
            (Some(exc), _) => exc.clone(),
            (None, Some(exc_type)) => match &self.msg {
                Some(msg) => Exception::new(exc_type, msg.clone()),
                None => Exception::bare(exc_type),
            },
            (None, None) => Exception::new(ExcType::Exception, self.formatted.clone()),
        };
        Exception::new(ExcType::ExecutionFailed, self.formatted.clone()).with_cause(cause)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for ExcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn builtin_module_is_omitted() {
        let info = ExcInfo::capture(&Exception::new(ExcType::ValueError, "bad"));
        assert_eq!(info.formatted, "ValueError: bad");
        assert_eq!(info.exc_type.module, "builtins");

        let info = ExcInfo::capture(&Exception::new(ExcType::NotShareableError, "nope"));
        assert_eq!(info.formatted, "concurrent.interpreters.NotShareableError: nope");
    }

    #[test]
    fn raise_local_chains_original() {
        let info = ExcInfo::capture(&Exception::new(ExcType::KeyError, "k"));
        let exc = info.raise_local();
        assert_eq!(exc.exc_type(), ExcType::ExecutionFailed);
        assert_eq!(exc.message(), Some("KeyError: k"));
        assert_eq!(exc.cause().map(Exception::exc_type), Some(ExcType::KeyError));
        assert!(info.is(ExcType::LookupError));
    }
}
