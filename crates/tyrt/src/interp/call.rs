//! A function call packed for execution in another interpreter.

use indexmap::IndexMap;

use super::{
    registry::{Interpreter, Namespace, Runtime},
    xidata::{XiData, XiError, XiErrorCode, XiFallback},
};
use crate::{
    exception::Exception,
    value::{Function, Value},
};

/// Callable, positional arguments and keyword arguments, each as
/// cross-interpreter data. Empty arguments are not packed at all.
#[derive(Debug, Default)]
pub struct PendingCall {
    func: Option<XiData>,
    args: Option<XiData>,
    kwargs: Option<XiData>,
}

/// An unpacked call, ready to run.
pub(crate) struct Unpacked {
    pub func: Value,
    pub args: Vec<Value>,
    pub kwargs: Namespace,
}

impl PendingCall {
    /// Packs a call in `source`.
    pub fn pack(
        runtime: &Runtime,
        source: &Interpreter,
        callable: &Value,
        args: &[Value],
        kwargs: &IndexMap<String, Value>,
    ) -> Result<Self, Exception> {
        if !matches!(callable, Value::Function(_)) {
            return Err(Exception::type_error(format!("expected a callable, got {}", callable.repr())));
        }
        let func = XiData::new(runtime, source, callable, XiFallback::Full)?;
        let args = if args.is_empty() {
            None
        } else {
            Some(XiData::new(runtime, source, &Value::Tuple(args.to_vec()), XiFallback::Full)?)
        };
        let kwargs = if kwargs.is_empty() {
            None
        } else {
            let items = kwargs.iter().map(|(k, v)| (Value::str(k.as_str()), v.clone())).collect();
            Some(XiData::new(runtime, source, &Value::Dict(items), XiFallback::Full)?)
        };
        Ok(Self {
            func: Some(func),
            args,
            kwargs,
        })
    }

    #[must_use]
    pub fn is_packed(&self) -> bool {
        self.func.is_some()
    }

    /// Rebuilds the call in the interpreter `runtime` is running. Leaves the
    /// pending call empty.
    pub(crate) fn unpack(&mut self, runtime: &Runtime) -> Result<Unpacked, XiError> {
        let func = self
            .func
            .take()
            .ok_or_else(|| XiError::new(XiErrorCode::Other).with_message("no call pending"))?
            .into_value(runtime)
            .map_err(|err| wrap(err, "func"))?;
        if !matches!(func, Value::Function(Function::Native(_) | Function::Defined(_))) {
            return Err(XiError::not_shareable("func not shareable"));
        }
        let args = match self.args.take() {
            None => Vec::new(),
            Some(data) => match data.into_value(runtime).map_err(|err| wrap(err, "args"))? {
                Value::Tuple(items) => items,
                _ => return Err(XiError::not_shareable("args not shareable")),
            },
        };
        let mut kwargs = Namespace::new();
        if let Some(data) = self.kwargs.take() {
            let Value::Dict(items) = data.into_value(runtime).map_err(|err| wrap(err, "kwargs"))? else {
                return Err(XiError::not_shareable("kwargs not shareable"));
            };
            for (key, value) in items {
                let Value::Str(key) = key else {
                    return Err(XiError::not_shareable("kwargs not shareable"));
                };
                kwargs.insert(key, value);
            }
        }
        Ok(Unpacked { func, args, kwargs })
    }

    /// Drops whatever is still packed.
    pub fn clear(&mut self) {
        self.func = None;
        self.args = None;
        self.kwargs = None;
    }
}

fn wrap(err: XiError, what: &str) -> XiError {
    if err.code() == XiErrorCode::NotShareable {
        XiError::not_shareable(format!("{what} not shareable")).with_cause(err.into())
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::ExcType;

    #[test]
    fn rejects_non_callables() {
        let runtime = Runtime::new();
        let err = PendingCall::pack(&runtime, &runtime.main(), &Value::Int(3), &[], &IndexMap::new()).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::TypeError);
        assert_eq!(err.message(), Some("expected a callable, got 3"));
    }

    #[test]
    fn empty_arguments_are_not_packed() {
        let runtime = Runtime::new();
        let func = Value::Function(Function::Native("len".to_owned()));
        let mut call = PendingCall::pack(&runtime, &runtime.main(), &func, &[], &IndexMap::new()).unwrap();
        assert!(call.args.is_none() && call.kwargs.is_none());
        let unpacked = call.unpack(&runtime).unwrap();
        assert_eq!(unpacked.func, func);
        assert!(!call.is_packed());
    }
}
