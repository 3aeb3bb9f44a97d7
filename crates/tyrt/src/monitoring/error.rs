use super::events::Event;
use crate::exception::{ExcType, Exception};

/// Failure of a monitoring operation or of a callback it invoked.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MonitoringError {
    /// Bad tool id, event set or argument. Surfaces as `ValueError`.
    #[error("{0}")]
    Validation(String),
    #[error("events set too many times")]
    Overflow,
    #[error("out of memory allocating instrumentation tables")]
    OutOfMemory,
    /// Surfaces as `SystemError`.
    #[error("{0}")]
    System(String),
    /// A callback returned DISABLE for an event that cannot be disabled.
    /// The callback has been unregistered.
    #[error("Cannot disable {0} events. Callback removed.")]
    DisableNotAllowed(Event),
    #[error("Firing event {} with no exception set", .0.id())]
    NoPendingException(Event),
    /// A callback raised.
    #[error(transparent)]
    Callback(Exception),
}

impl MonitoringError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<MonitoringError> for Exception {
    fn from(err: MonitoringError) -> Self {
        match err {
            MonitoringError::Callback(exc) => exc,
            MonitoringError::Validation(_)
            | MonitoringError::DisableNotAllowed(_)
            | MonitoringError::NoPendingException(_) => Self::new(ExcType::ValueError, err.to_string()),
            MonitoringError::Overflow => Self::new(ExcType::OverflowError, err.to_string()),
            MonitoringError::OutOfMemory => Self::bare(ExcType::MemoryError),
            MonitoringError::System(message) => Self::new(ExcType::SystemError, message),
        }
    }
}

impl From<Exception> for MonitoringError {
    fn from(exc: Exception) -> Self {
        Self::Callback(exc)
    }
}
